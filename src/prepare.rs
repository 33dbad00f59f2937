//! Filters and labels a unified table ahead of aggregation.

use tracing::{debug, info};

use crate::classifier;
use crate::error::{AnalysisError, Result};
use crate::framework::FrameworkStrategy;
use crate::record::{UnifiedRecord, UnifiedTable, NO_LAYER};

/// Host-to-device staging copies are excluded from every analysis.
pub const HOST_TO_DEVICE_COPY: &str = "Memcpy HtoD (Host -> Device)";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrepareOptions {
    /// Offsets into the sorted distinct iterations; negative counts from the end.
    pub iterations: Vec<i64>,
    pub remove_communication: bool,
    pub assign_operator_types: bool,
    pub assign_chunks: bool,
    pub drop_unchunked: bool,
    pub fix_names: bool,
}

impl PrepareOptions {
    /// Computation records with operator types, chunks and normalized names.
    pub fn computation(iterations: &[i64]) -> Self {
        Self {
            iterations: iterations.to_vec(),
            remove_communication: true,
            assign_operator_types: true,
            assign_chunks: true,
            drop_unchunked: true,
            fix_names: true,
        }
    }

    /// Every record, only filtered by iteration.
    pub fn raw(iterations: &[i64]) -> Self {
        Self {
            iterations: iterations.to_vec(),
            ..Default::default()
        }
    }
}

/// Keeps records whose iteration is one of the selected offsets into the
/// ascending list of distinct iteration values.
pub fn select_iterations(records: Vec<UnifiedRecord>, offsets: &[i64]) -> Result<Vec<UnifiedRecord>> {
    if offsets.is_empty() {
        return Ok(records);
    }
    let mut distinct: Vec<i64> = records.iter().filter_map(|r| r.iteration).collect();
    distinct.sort_unstable();
    distinct.dedup();

    let available = distinct.len() as i64;
    let mut selected = Vec::with_capacity(offsets.len());
    for &index in offsets {
        let resolved = if index < 0 { available + index } else { index };
        if !(0..available).contains(&resolved) {
            return Err(AnalysisError::InvalidIterationSelection {
                index,
                available: distinct.len(),
            });
        }
        selected.push(distinct[resolved as usize]);
    }
    debug!("selected iterations {:?} from {:?}", selected, distinct);

    Ok(records
        .into_iter()
        .filter(|r| r.iteration.is_some_and(|it| selected.contains(&it)))
        .collect())
}

pub fn prepare(
    table: &UnifiedTable,
    options: &PrepareOptions,
    strategy: &dyn FrameworkStrategy,
) -> Result<Vec<UnifiedRecord>> {
    let mut records: Vec<UnifiedRecord> = table
        .records
        .iter()
        .filter(|r| r.name != HOST_TO_DEVICE_COPY)
        .cloned()
        .map(|mut r| {
            r.layer.get_or_insert(NO_LAYER);
            r
        })
        .collect();

    records = select_iterations(records, &options.iterations)?;

    if options.remove_communication {
        let before = records.len();
        records.retain(|r| !strategy.is_communication(r));
        info!("removed {} communication records", before - records.len());
    }
    if options.assign_operator_types {
        classifier::assign_operator_types(&mut records);
    }
    if options.assign_chunks {
        classifier::assign_chunks(&mut records, strategy);
        if options.drop_unchunked {
            records.retain(|r| r.chunk.is_some());
        }
    }
    if options.fix_names {
        classifier::fix_names(&mut records);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framework::FsdpV1;
    use crate::record::Chunk;

    fn table() -> UnifiedTable {
        let mut records = Vec::new();
        for (i, iteration) in [Some(3), Some(5), Some(4), None, Some(5)].into_iter().enumerate() {
            let mut r = UnifiedRecord::new(0, i as i64 * 10, 5, "gemm").with_operator("f_b_fc_1");
            r.iteration = iteration;
            records.push(r);
        }
        records.push(UnifiedRecord::new(0, 100, 5, HOST_TO_DEVICE_COPY).with_iteration(3));
        records.push(
            UnifiedRecord::new(0, 110, 5, "ncclDevKernel_AllReduce")
                .with_operator("f_attn")
                .with_iteration(3),
        );
        records.push(UnifiedRecord::new(0, 120, 5, "elementwise").with_iteration(3));
        UnifiedTable::new(records)
    }

    #[test]
    fn iteration_offsets_index_sorted_distinct_values() {
        let records = table().records;
        let picked = select_iterations(records.clone(), &[0, -1]).unwrap();
        assert!(picked.iter().all(|r| matches!(r.iteration, Some(3) | Some(5))));
        assert_eq!(picked.iter().filter(|r| r.iteration == Some(5)).count(), 2);

        let err = select_iterations(records, &[3]).unwrap_err();
        assert!(matches!(err, AnalysisError::InvalidIterationSelection { index: 3, available: 3 }));
    }

    #[test]
    fn computation_preset_filters_and_labels() {
        let out = prepare(&table(), &PrepareOptions::computation(&[]), &FsdpV1).unwrap();
        assert!(out.iter().all(|r| r.name != HOST_TO_DEVICE_COPY));
        assert!(out.iter().all(|r| !r.name.starts_with("ncclDevKernel")));
        assert!(out.iter().all(|r| r.chunk.is_some()));
        assert!(out.iter().all(|r| r.operator_type.is_some()));
        assert!(out.iter().all(|r| r.layer == Some(NO_LAYER)));
        assert_eq!(out[0].operator(), Some("b_mlp_1"));
        assert_eq!(out[0].chunk, Some(Chunk::Bwd));
        assert_eq!(out.len(), 5);
    }

    #[test]
    fn raw_preset_keeps_communication_and_unnamed() {
        let out = prepare(&table(), &PrepareOptions::raw(&[]), &FsdpV1).unwrap();
        assert_eq!(out.len(), 7);
        assert!(out.iter().all(|r| r.chunk.is_none()));
        assert!(out.iter().all(|r| r.operator_type.is_none()));
    }
}
