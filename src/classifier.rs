//! Chunk and operator-type labels, and display name normalization.

use tracing::info;

use crate::correlator::BACKWARD_PREFIX;
use crate::framework::FrameworkStrategy;
use crate::record::{OperatorType, UnifiedRecord};

const OPTIMIZER_MARKERS: [&str; 3] = ["f_Optimizer", "f_b_ga", "f_b_ar"];
const LEGACY_BACKWARD_PREFIX: &str = "f_b_";
const OPTIMIZER_STEP_SUFFIX: &str = "Optimizer.step#AdamW.step";
pub const OPTIMIZER_STEP_NAME: &str = "opt_step";
const GEMM_SUFFIX: &str = "p";
const FLASH_ATTENTION_SUFFIX: &str = "attn_fa";

/// Optimizer step, gradient all-gather (`ga`) or all-reduce (`ar`).
pub fn is_optimizer_or_grad_sync(op: &str) -> bool {
    OPTIMIZER_MARKERS.iter().any(|m| op.starts_with(m))
}

pub fn has_backward_prefix(op: &str) -> bool {
    op.starts_with(BACKWARD_PREFIX) || op.starts_with(LEGACY_BACKWARD_PREFIX)
}

pub fn operator_type(op: Option<&str>) -> OperatorType {
    match op {
        Some(op) if op.ends_with(FLASH_ATTENTION_SUFFIX) => OperatorType::FlashAttention,
        Some(op) if op.ends_with(GEMM_SUFFIX) && !op.ends_with(OPTIMIZER_STEP_SUFFIX) => {
            OperatorType::Gemm
        }
        _ => OperatorType::Vector,
    }
}

/// `f_b_` → `b_`, any optimizer step → `opt_step`, `_fc_` → `_mlp_`.
pub fn normalize_name(op: &str) -> String {
    let op = if op.starts_with(LEGACY_BACKWARD_PREFIX) {
        op.replace(LEGACY_BACKWARD_PREFIX, BACKWARD_PREFIX)
    } else {
        op.to_string()
    };
    if op.ends_with(OPTIMIZER_STEP_SUFFIX) {
        return OPTIMIZER_STEP_NAME.to_string();
    }
    if op.contains("_fc_") {
        op.replace("_fc_", "_mlp_")
    } else {
        op
    }
}

pub fn assign_chunks(records: &mut [UnifiedRecord], strategy: &dyn FrameworkStrategy) {
    info!("assigning {} chunks...", strategy.name());
    for record in records.iter_mut() {
        record.chunk = strategy.classify_chunk(record);
    }
}

pub fn assign_operator_types(records: &mut [UnifiedRecord]) {
    for record in records.iter_mut() {
        record.operator_type = Some(operator_type(record.operator()));
    }
}

pub fn fix_names(records: &mut [UnifiedRecord]) {
    for record in records.iter_mut() {
        if let Some(op) = record.operator_name.as_deref() {
            record.operator_name = Some(normalize_name(op));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framework::{FsdpV1, FsdpV2, PRE_BACKWARD_PREFETCH};
    use crate::record::Chunk;

    fn named(op: Option<&str>) -> UnifiedRecord {
        let mut r = UnifiedRecord::new(0, 0, 1, "kernel");
        r.operator_name = op.map(str::to_string);
        r
    }

    #[test]
    fn chunk_precedence_opt_then_bwd_then_fwd() {
        let cases = [
            ("f_Optimizer.step#AdamW.step", Chunk::Opt),
            ("f_b_ga_layer3", Chunk::Opt),
            ("f_b_ar", Chunk::Opt),
            ("b_mlp_up", Chunk::Bwd),
            ("f_b_attn_o_proj", Chunk::Bwd),
            ("f_attn_qkv_proj", Chunk::Fwd),
            ("loss", Chunk::Fwd),
        ];
        for (op, expected) in cases {
            assert_eq!(FsdpV1.classify_chunk(&named(Some(op))), Some(expected), "{op}");
        }
        assert_eq!(FsdpV1.classify_chunk(&named(None)), None);
    }

    #[test]
    fn chunks_are_exclusive_and_exhaustive() {
        let ops = [
            None,
            Some("f_Optimizer.step#AdamW.step"),
            Some("b_FullyShardedDataParallel._pre_forward"),
            Some(PRE_BACKWARD_PREFETCH),
            Some("b_mlp_down"),
            Some("f_b_ar"),
            Some("f_attn_fa"),
        ];
        let mut records: Vec<UnifiedRecord> = ops.iter().map(|op| named(*op)).collect();
        for strategy in [&FsdpV1 as &dyn FrameworkStrategy, &FsdpV2] {
            assign_chunks(&mut records, strategy);
            for r in &records {
                assert_eq!(r.chunk.is_some(), r.operator_name.is_some());
            }
        }
    }

    #[test]
    fn operator_types_by_suffix() {
        assert_eq!(operator_type(Some("f_mlp_up")), OperatorType::Gemm);
        assert_eq!(operator_type(Some("f_attn_qkv_proj")), OperatorType::Vector);
        assert_eq!(operator_type(Some("b_mlp_up")), OperatorType::Gemm);
        assert_eq!(operator_type(Some("f_attn_fa")), OperatorType::FlashAttention);
        assert_eq!(operator_type(Some("f_Optimizer.step#AdamW.step")), OperatorType::Vector);
        assert_eq!(operator_type(Some("f_layernorm")), OperatorType::Vector);
        assert_eq!(operator_type(None), OperatorType::Vector);
    }

    #[test]
    fn names_are_normalized() {
        assert_eq!(normalize_name("f_b_attn_o_proj"), "b_attn_o_proj");
        assert_eq!(normalize_name("f_Optimizer.step#AdamW.step"), "opt_step");
        assert_eq!(normalize_name("f_layer_fc_up"), "f_layer_mlp_up");
        assert_eq!(normalize_name("b_attn"), "b_attn");

        let mut records = vec![named(Some("f_b_fc_1")), named(None)];
        fix_names(&mut records);
        assert_eq!(records[0].operator(), Some("b_mlp_1"));
        assert_eq!(records[1].operator(), None);
    }
}
