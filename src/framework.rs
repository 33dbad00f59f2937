//! Per-framework rules separating communication from computation and
//! assigning training-phase chunks.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::classifier;
use crate::error::AnalysisError;
use crate::record::{Chunk, UnifiedRecord};

/// Device kernels issued by the collective-communication library.
pub const COMM_KERNEL_PREFIX: &str = "ncclDevKernel";

/// A pre-forward hook that shows up under backward-linked names when FSDP
/// re-gathers parameters for the backward pass.
pub const PRE_FORWARD_IN_BACKWARD: &str = "b_FullyShardedDataParallel._pre_forward";
pub const POST_BACKWARD_HOOK: &str = "f_FullyShardedDataParallel._post_backward_hook";
pub const PRE_BACKWARD_PREFETCH: &str = "f_FullyShardedDataParallel._pre_backward_prefetch";

const BACKWARD_HOOKS: [&str; 2] = [POST_BACKWARD_HOOK, PRE_BACKWARD_PREFETCH];

pub trait FrameworkStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// True for records that are communication rather than computation.
    fn is_communication(&self, record: &UnifiedRecord) -> bool;

    /// Hook names that run during the backward pass without a `b_` prefix.
    fn backward_hooks(&self) -> &[&'static str] {
        &BACKWARD_HOOKS
    }

    /// Workload-specific override, consulted after the optimizer rule.
    ///
    /// The pre-forward hook only counts as backward when its kernel is
    /// compute, or an all-reduce, and was not launched by a plain copy.
    fn special_case(&self, record: &UnifiedRecord) -> Option<Chunk> {
        if record.operator() != Some(PRE_FORWARD_IN_BACKWARD) {
            return None;
        }
        let cpu_op = record.cpu_op_name.as_deref();
        let compute_or_allreduce = !record.name.starts_with(COMM_KERNEL_PREFIX)
            || cpu_op.is_some_and(|n| n.ends_with("allreduce"));
        let not_copy = cpu_op != Some("aten::copy_");
        Some(if compute_or_allreduce && not_copy {
            Chunk::Bwd
        } else {
            Chunk::Fwd
        })
    }

    /// Exactly one chunk for every record with an operator name.
    fn classify_chunk(&self, record: &UnifiedRecord) -> Option<Chunk> {
        let op = record.operator()?;
        if classifier::is_optimizer_or_grad_sync(op) {
            return Some(Chunk::Opt);
        }
        if let Some(chunk) = self.special_case(record) {
            return Some(chunk);
        }
        if classifier::has_backward_prefix(op) || self.backward_hooks().iter().any(|hook| *hook == op) {
            Some(Chunk::Bwd)
        } else {
            Some(Chunk::Fwd)
        }
    }
}

/// FSDP v1 (`FullyShardedDataParallel` module hooks).
#[derive(Debug, Default, Clone, Copy)]
pub struct FsdpV1;

impl FsdpV1 {
    const COMMUNICATION_OPS: [&'static str; 3] =
        [PRE_FORWARD_IN_BACKWARD, POST_BACKWARD_HOOK, PRE_BACKWARD_PREFETCH];
}

impl FrameworkStrategy for FsdpV1 {
    fn name(&self) -> &'static str {
        "fsdp-v1"
    }

    fn is_communication(&self, record: &UnifiedRecord) -> bool {
        record.name.starts_with(COMM_KERNEL_PREFIX)
            || record
                .operator()
                .is_some_and(|op| Self::COMMUNICATION_OPS.iter().any(|name| *name == op))
    }
}

/// FSDP v2 (`fully_shard`, `FSDP::` record functions).
#[derive(Debug, Default, Clone, Copy)]
pub struct FsdpV2;

impl FsdpV2 {
    const COMMUNICATION_FRAGMENTS: [&'static str; 4] = [
        "FSDP::post_backward_reduce",
        "FSDP::pre_forward",
        "FSDP::all_gather_copy_out",
        "FSDP::all_gather",
    ];
}

impl FrameworkStrategy for FsdpV2 {
    fn name(&self) -> &'static str {
        "fsdp-v2"
    }

    fn is_communication(&self, record: &UnifiedRecord) -> bool {
        record.operator().is_some_and(|op| {
            Self::COMMUNICATION_FRAGMENTS
                .iter()
                .any(|fragment| op.contains(fragment))
        })
    }
}

/// Framework selector as it appears in configuration and on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Framework {
    #[default]
    FsdpV1,
    FsdpV2,
}

impl Framework {
    pub fn strategy(&self) -> Box<dyn FrameworkStrategy> {
        match self {
            Framework::FsdpV1 => Box::new(FsdpV1),
            Framework::FsdpV2 => Box::new(FsdpV2),
        }
    }
}

impl FromStr for Framework {
    type Err = AnalysisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fsdp-v1" | "fsdpv1" | "v1" => Ok(Framework::FsdpV1),
            "fsdp-v2" | "fsdpv2" | "v2" => Ok(Framework::FsdpV2),
            other => Err(AnalysisError::UnknownFramework(other.to_string())),
        }
    }
}

impl fmt::Display for Framework {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.strategy().name())
    }
}
