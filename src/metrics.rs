//! Named derived metrics computed from trace timing or hardware counters.

use std::collections::BTreeMap;
use std::fmt;

use tracing::{debug, info};

use crate::aggregate::{AggregateSpec, Reduction};
use crate::error::{AnalysisError, Result};
use crate::record::{col, UnifiedRecord, UnifiedTable};
use crate::table::require_columns;
use crate::time::ns_to_secs;

/// How an input column rolls up when records are grouped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rollup {
    Sum,
    /// Weighted mean using another column as the weight.
    WeightedBy(&'static str),
}

/// Values aligned with the input records; `None` leaves the metric unset.
pub type ComputeFn = fn(&[UnifiedRecord]) -> Vec<Option<f64>>;

#[derive(Clone)]
pub struct MetricDef {
    pub name: &'static str,
    pub unit: &'static str,
    pub inputs: &'static [(&'static str, Rollup)],
    pub compute: ComputeFn,
}

impl fmt::Debug for MetricDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricDef")
            .field("name", &self.name)
            .field("unit", &self.unit)
            .field("inputs", &self.inputs)
            .finish()
    }
}

impl MetricDef {
    /// Input columns plus any weight columns they roll up with.
    pub fn required_columns(&self) -> Vec<&'static str> {
        let mut columns = Vec::with_capacity(self.inputs.len() * 2);
        for (column, rollup) in self.inputs {
            columns.push(*column);
            if let Rollup::WeightedBy(weight) = rollup {
                columns.push(*weight);
            }
        }
        columns.sort_unstable();
        columns.dedup();
        columns
    }

    /// Aggregation that rolls this metric's inputs up per group, so the metric
    /// can be recomputed on the grouped rows.
    pub fn rollup(&self, group_by: &[&str]) -> AggregateSpec {
        let mut spec = AggregateSpec::new(group_by);
        for (column, rollup) in self.inputs {
            spec = match rollup {
                Rollup::Sum => spec.column(column, column, Reduction::Sum),
                Rollup::WeightedBy(weight) => spec.weighted(column, weight),
            };
        }
        spec
    }
}

#[derive(Debug, Default, Clone)]
pub struct MetricRegistry {
    metrics: BTreeMap<&'static str, MetricDef>,
}

impl MetricRegistry {
    pub fn builtin() -> Self {
        let mut registry = Self::default();
        for def in TRACE_METRICS.iter().chain(COUNTER_METRICS.iter()) {
            registry.register(def.clone());
        }
        registry
    }

    pub fn register(&mut self, def: MetricDef) {
        self.metrics.insert(def.name, def);
    }

    pub fn get(&self, name: &str) -> Result<&MetricDef> {
        self.metrics
            .get(name)
            .ok_or_else(|| AnalysisError::UnknownMetric(name.to_string()))
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.metrics.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MetricDef> {
        self.metrics.values()
    }

    /// Computes `name` for every record and stores it in the record's metric
    /// map. Records are reordered by `(device, ts)` first.
    pub fn derive(&self, name: &str, table: &mut UnifiedTable) -> Result<()> {
        let def = self.get(name)?;
        require_columns(&table.records, &def.required_columns(), def.name)?;

        info!("📐 Deriving {} ({})", def.name, def.unit);
        table.records.sort_by_key(|r| (r.device, r.ts));
        let values = (def.compute)(&table.records);
        let mut set = 0usize;
        for (record, value) in table.records.iter_mut().zip(values) {
            if let Some(value) = value {
                record.metrics.insert(def.name.to_string(), value);
                set += 1;
            }
        }
        debug!("{} set on {}/{} records", def.name, set, table.len());
        Ok(())
    }
}

const TRACE_METRICS: [MetricDef; 3] = [
    MetricDef {
        name: "Launch Overhead",
        unit: "s",
        inputs: &[(col::TS, Rollup::Sum), (col::DUR, Rollup::Sum)],
        compute: launch_overhead,
    },
    MetricDef {
        name: "Prep Overhead",
        unit: "s",
        inputs: &[(col::TS, Rollup::Sum), (col::DUR, Rollup::Sum), (col::LAUNCH_TS, Rollup::Sum)],
        compute: prep_overhead,
    },
    MetricDef {
        name: "Call Overhead",
        unit: "s",
        inputs: &[(col::TS, Rollup::Sum), (col::DUR, Rollup::Sum), (col::LAUNCH_TS, Rollup::Sum)],
        compute: call_overhead,
    },
];

const N_XCD: f64 = 8.0;
const SCLK_MHZ: f64 = 2100.0;
const MFMA_FLOPS_PER_OP: f64 = 512.0;
const MAX_WAVES_PER_CU: f64 = 32.0;

const COUNTER_METRICS: [MetricDef; 4] = [
    MetricDef {
        name: "Tensor Flops",
        unit: "FLOP",
        inputs: &[("SQ_INSTS_VALU_MFMA_MOPS_BF16", Rollup::Sum)],
        compute: tensor_flops,
    },
    MetricDef {
        name: "Cycle Duration",
        unit: "us",
        inputs: &[("GRBM_GUI_ACTIVE", Rollup::Sum)],
        compute: cycle_duration,
    },
    MetricDef {
        name: "Wave Occupancy",
        unit: "%",
        inputs: &[("MeanOccupancyPerCU", Rollup::WeightedBy("GRBM_GUI_ACTIVE"))],
        compute: wave_occupancy,
    },
    MetricDef {
        name: "L2 Hitrate",
        unit: "%",
        inputs: &[("TCC_HIT_sum", Rollup::Sum), ("TCC_MISS_sum", Rollup::Sum)],
        compute: l2_hitrate,
    },
];

/// End of the previous record on the same device; `None` for the first one.
/// Expects records ordered by `(device, ts)`.
fn previous_end(records: &[UnifiedRecord]) -> Vec<Option<i64>> {
    let mut out = Vec::with_capacity(records.len());
    for (i, record) in records.iter().enumerate() {
        let prev = i
            .checked_sub(1)
            .map(|p| &records[p])
            .filter(|p| p.device == record.device);
        out.push(prev.map(UnifiedRecord::end));
    }
    out
}

fn launch_overhead(records: &[UnifiedRecord]) -> Vec<Option<f64>> {
    records
        .iter()
        .zip(previous_end(records))
        .map(|(r, prev_end)| Some(prev_end.map_or(0.0, |end| ns_to_secs((r.ts - end).max(0)))))
        .collect()
}

fn prep_overhead(records: &[UnifiedRecord]) -> Vec<Option<f64>> {
    records
        .iter()
        .zip(previous_end(records))
        .map(|(r, prev_end)| match prev_end {
            None => Some(0.0),
            Some(end) => r.launch_ts.map(|launch| ns_to_secs((launch - end).max(0))),
        })
        .collect()
}

/// The smaller of the launch-queue time and the launch overhead.
fn call_overhead(records: &[UnifiedRecord]) -> Vec<Option<f64>> {
    records
        .iter()
        .zip(previous_end(records))
        .map(|(r, prev_end)| match prev_end {
            None => Some(0.0),
            Some(end) => r
                .launch_ts
                .map(|launch| ns_to_secs((r.ts - launch).min((r.ts - end).max(0)))),
        })
        .collect()
}

fn counter(record: &UnifiedRecord, name: &str) -> Option<f64> {
    record.metrics.get(name).copied()
}

fn tensor_flops(records: &[UnifiedRecord]) -> Vec<Option<f64>> {
    records
        .iter()
        .map(|r| counter(r, "SQ_INSTS_VALU_MFMA_MOPS_BF16").map(|ops| MFMA_FLOPS_PER_OP * ops))
        .collect()
}

fn cycle_duration(records: &[UnifiedRecord]) -> Vec<Option<f64>> {
    records
        .iter()
        .map(|r| counter(r, "GRBM_GUI_ACTIVE").map(|cycles| cycles / N_XCD / SCLK_MHZ))
        .collect()
}

fn wave_occupancy(records: &[UnifiedRecord]) -> Vec<Option<f64>> {
    records
        .iter()
        .map(|r| counter(r, "MeanOccupancyPerCU").map(|waves| waves / MAX_WAVES_PER_CU * 100.0))
        .collect()
}

fn l2_hitrate(records: &[UnifiedRecord]) -> Vec<Option<f64>> {
    records
        .iter()
        .map(|r| {
            let hits = counter(r, "TCC_HIT_sum")?;
            let misses = counter(r, "TCC_MISS_sum")?;
            let total = hits + misses;
            (total > 0.0).then(|| 100.0 * hits / total)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn launched(device: i64, ts: i64, dur: i64, launch_ts: Option<i64>) -> UnifiedRecord {
        let mut r = UnifiedRecord::new(device, ts, dur, "kernel");
        r.launch_ts = launch_ts;
        r
    }

    fn metric(table: &UnifiedTable, name: &str) -> Vec<Option<f64>> {
        table.records.iter().map(|r| r.metrics.get(name).copied()).collect()
    }

    #[test]
    fn builtin_registry_lists_every_metric() {
        let registry = MetricRegistry::builtin();
        let names = registry.names();
        for expected in ["Launch Overhead", "Prep Overhead", "Call Overhead", "Tensor Flops", "L2 Hitrate"] {
            assert!(names.contains(&expected), "{expected}");
        }
        assert!(matches!(registry.get("Power"), Err(AnalysisError::UnknownMetric(_))));
    }

    #[test]
    fn launch_overhead_is_gap_to_previous_kernel_per_device() {
        let mut table = UnifiedTable::new(vec![
            launched(0, 5_000, 1_000, None),
            launched(1, 0, 10, None),
            launched(0, 0, 2_000, None),
            launched(0, 1_000, 500, None),
        ]);
        MetricRegistry::builtin().derive("Launch Overhead", &mut table).unwrap();
        // Device 0: [0,2000], [1000,1500] overlaps -> 0, [5000,6000] gap 3500ns.
        assert_eq!(
            metric(&table, "Launch Overhead"),
            vec![Some(0.0), Some(0.0), Some(3.5e-6), Some(0.0)]
        );
    }

    #[test]
    fn call_overhead_is_min_of_queue_and_gap() {
        let mut table = UnifiedTable::new(vec![
            launched(0, 0, 100, Some(0)),
            launched(0, 1_100, 100, Some(900)),
            launched(0, 2_000, 100, None),
        ]);
        let registry = MetricRegistry::builtin();
        registry.derive("Call Overhead", &mut table).unwrap();
        registry.derive("Prep Overhead", &mut table).unwrap();
        // queue = 200, gap = 1000
        assert_eq!(metric(&table, "Call Overhead"), vec![Some(0.0), Some(2e-7), None]);
        assert_eq!(metric(&table, "Prep Overhead"), vec![Some(0.0), Some(8e-7), None]);
    }

    #[test]
    fn counter_metric_requires_its_inputs() {
        let mut table = UnifiedTable::new(vec![launched(0, 0, 1, None)]);
        let err = MetricRegistry::builtin().derive("L2 Hitrate", &mut table).unwrap_err();
        match err {
            AnalysisError::MissingColumns { missing, .. } => {
                assert_eq!(missing, vec!["TCC_HIT_sum", "TCC_MISS_sum"])
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn counter_metrics_use_record_counters() {
        let mut r = launched(0, 0, 1, None);
        r.metrics.insert("TCC_HIT_sum".into(), 30.0);
        r.metrics.insert("TCC_MISS_sum".into(), 10.0);
        r.metrics.insert("MeanOccupancyPerCU".into(), 16.0);
        r.metrics.insert("GRBM_GUI_ACTIVE".into(), 1.0);
        let mut table = UnifiedTable::new(vec![r]);
        let registry = MetricRegistry::builtin();
        registry.derive("L2 Hitrate", &mut table).unwrap();
        registry.derive("Wave Occupancy", &mut table).unwrap();
        assert_eq!(metric(&table, "L2 Hitrate"), vec![Some(75.0)]);
        assert_eq!(metric(&table, "Wave Occupancy"), vec![Some(50.0)]);
    }

    #[test]
    fn rollup_weights_occupancy_by_active_cycles() {
        let def = MetricRegistry::builtin().get("Wave Occupancy").unwrap().clone();
        let spec = def.rollup(&["device"]);
        assert_eq!(spec.weighted.len(), 1);
        assert_eq!(spec.weighted[0].weight, "GRBM_GUI_ACTIVE");
        assert_eq!(def.required_columns(), vec!["GRBM_GUI_ACTIVE", "MeanOccupancyPerCU"]);
    }
}
