//! Group-by reduction over any column-addressable rows.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{AnalysisError, Result};
use crate::table::{require_columns, Columnar, GroupedRow, GroupedTable, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reduction {
    Sum,
    First,
    Last,
    Min,
    Max,
    Median,
    Mean,
    Count,
}

impl Reduction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reduction::Sum => "sum",
            Reduction::First => "first",
            Reduction::Last => "last",
            Reduction::Min => "min",
            Reduction::Max => "max",
            Reduction::Median => "median",
            Reduction::Mean => "mean",
            Reduction::Count => "count",
        }
    }

    /// Reduces one group's values; nulls are skipped.
    pub fn apply(&self, values: &[Value]) -> Value {
        let mut present = values.iter().filter(|v| !v.is_null());
        match self {
            Reduction::First => present.next().cloned().unwrap_or_default(),
            Reduction::Last => present.last().cloned().unwrap_or_default(),
            Reduction::Min => present.min().cloned().unwrap_or_default(),
            Reduction::Max => present.max().cloned().unwrap_or_default(),
            Reduction::Count => Value::Int(present.count() as i64),
            Reduction::Sum => sum(present),
            Reduction::Mean => {
                let numbers: Vec<f64> = present.filter_map(Value::as_f64).collect();
                if numbers.is_empty() {
                    Value::Null
                } else {
                    Value::Float(numbers.iter().sum::<f64>() / numbers.len() as f64)
                }
            }
            Reduction::Median => {
                let mut numbers: Vec<f64> = present.filter_map(Value::as_f64).collect();
                if numbers.is_empty() {
                    return Value::Null;
                }
                numbers.sort_by(f64::total_cmp);
                let mid = numbers.len() / 2;
                if numbers.len() % 2 == 0 {
                    Value::Float((numbers[mid - 1] + numbers[mid]) / 2.0)
                } else {
                    Value::Float(numbers[mid])
                }
            }
        }
    }
}

/// Integral while every term is an integer and the total fits in `i64`;
/// otherwise the sum is carried in `f64`.
fn sum<'a>(values: impl Iterator<Item = &'a Value>) -> Value {
    let mut int_total = Some(0i64);
    let mut float_total = 0.0f64;
    let mut saw_float = false;
    for value in values {
        match value {
            Value::Int(v) => {
                float_total += *v as f64;
                int_total = int_total.and_then(|t| t.checked_add(*v));
            }
            Value::Float(v) => {
                float_total += v;
                saw_float = true;
            }
            _ => {}
        }
    }
    match int_total {
        Some(total) if !saw_float => Value::Int(total),
        _ => Value::Float(float_total),
    }
}

impl FromStr for Reduction {
    type Err = AnalysisError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "sum" => Reduction::Sum,
            "first" => Reduction::First,
            "last" => Reduction::Last,
            "min" => Reduction::Min,
            "max" => Reduction::Max,
            "median" => Reduction::Median,
            "mean" => Reduction::Mean,
            "count" => Reduction::Count,
            other => return Err(AnalysisError::UnknownReduction(other.to_string())),
        })
    }
}

impl fmt::Display for Reduction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Aggregation {
    pub output: String,
    pub source: String,
    pub reduction: Reduction,
}

/// A metric averaged with per-row weights: `Σ(m·w) / Σw` per group.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedMetric {
    pub metric: String,
    pub weight: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregateSpec {
    pub group_by: Vec<String>,
    pub columns: Vec<Aggregation>,
    pub weighted: Vec<WeightedMetric>,
    pub sort_by: Option<String>,
}

impl AggregateSpec {
    pub fn new(group_by: &[&str]) -> Self {
        Self {
            group_by: group_by.iter().map(|c| c.to_string()).collect(),
            ..Default::default()
        }
    }

    /// Adds `<source>_<reduction>` for every listed reduction.
    pub fn reduce(mut self, source: &str, reductions: &[Reduction]) -> Self {
        for reduction in reductions {
            self.columns.push(Aggregation {
                output: format!("{source}_{reduction}"),
                source: source.to_string(),
                reduction: *reduction,
            });
        }
        self
    }

    pub fn column(mut self, output: &str, source: &str, reduction: Reduction) -> Self {
        self.columns.push(Aggregation {
            output: output.to_string(),
            source: source.to_string(),
            reduction,
        });
        self
    }

    pub fn weighted(mut self, metric: &str, weight: &str) -> Self {
        self.weighted.push(WeightedMetric {
            metric: metric.to_string(),
            weight: weight.to_string(),
        });
        self
    }

    pub fn sort_by(mut self, column: &str) -> Self {
        self.sort_by = Some(column.to_string());
        self
    }

    /// Timing reductions used by every downstream analysis:
    /// `ts_first`, `ts_last`, `dur_sum`, `dur_last`.
    pub fn timing(group_by: &[&str]) -> Self {
        Self::new(group_by)
            .reduce("ts", &[Reduction::First, Reduction::Last])
            .reduce("dur", &[Reduction::Sum, Reduction::Last])
            .sort_by("ts_first")
    }

    fn required_columns(&self) -> Vec<&str> {
        let mut required: Vec<&str> = self.group_by.iter().map(String::as_str).collect();
        required.extend(self.columns.iter().map(|a| a.source.as_str()));
        for w in &self.weighted {
            required.push(w.metric.as_str());
            required.push(w.weight.as_str());
        }
        required.sort_unstable();
        required.dedup();
        required
    }

    fn validate(&self) -> Result<()> {
        for (i, w) in self.weighted.iter().enumerate() {
            if self.weighted[..i].iter().any(|o| o.metric == w.metric) {
                return Err(AnalysisError::InvalidAggregation(format!(
                    "cannot weigh {} by multiple metrics",
                    w.metric
                )));
            }
        }
        Ok(())
    }
}

/// Groups `rows` by `spec.group_by` and reduces each requested column.
///
/// Groups come out in ascending key order with null keys last; a sort column,
/// when given, reorders them stably.
pub fn aggregate<R: Columnar>(rows: &[R], spec: &AggregateSpec) -> Result<GroupedTable> {
    spec.validate()?;
    require_columns(rows, &spec.required_columns(), "aggregate")?;

    let mut groups: BTreeMap<Vec<Value>, Vec<usize>> = BTreeMap::new();
    for (i, row) in rows.iter().enumerate() {
        let key: Vec<Value> = spec
            .group_by
            .iter()
            .map(|c| row.column(c).unwrap_or_default())
            .collect();
        groups.entry(key).or_default().push(i);
    }

    let mut columns = spec.group_by.clone();
    columns.extend(spec.columns.iter().map(|a| a.output.clone()));
    for w in &spec.weighted {
        for c in [&w.metric, &w.weight] {
            if !columns.contains(c) {
                columns.push(c.clone());
            }
        }
    }
    let mut table = GroupedTable::new(columns);

    let values_of = |members: &[usize], column: &str| -> Vec<Value> {
        members
            .iter()
            .map(|&i| rows[i].column(column).unwrap_or_default())
            .collect()
    };

    for (key, members) in groups {
        let mut row = GroupedRow::default();
        for (column, value) in spec.group_by.iter().zip(key) {
            row.set(column.clone(), value);
        }
        for agg in &spec.columns {
            row.set(agg.output.clone(), agg.reduction.apply(&values_of(&members, &agg.source)));
        }
        for w in &spec.weighted {
            let metric = values_of(&members, &w.metric);
            let weight = values_of(&members, &w.weight);
            let (mut weighted_sum, mut weight_sum) = (0.0, 0.0);
            for (m, wt) in metric.iter().zip(&weight) {
                if let (Some(m), Some(wt)) = (m.as_f64(), wt.as_f64()) {
                    weighted_sum += m * wt;
                    weight_sum += wt;
                }
            }
            let mean = if weight_sum > 0.0 {
                Value::Float(weighted_sum / weight_sum)
            } else {
                Value::Null
            };
            row.set(w.metric.clone(), mean);
            row.set(w.weight.clone(), Reduction::Sum.apply(&weight));
        }
        table.rows.push(row);
    }

    if let Some(sort_column) = &spec.sort_by {
        table.require(&[sort_column.as_str()], "aggregate sort")?;
        table.sort_by_column(sort_column);
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::UnifiedRecord;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn record(device: i64, op: &str, ts: i64, dur: i64) -> UnifiedRecord {
        UnifiedRecord::new(device, ts, dur, "kernel").with_operator(op)
    }

    #[test]
    fn integer_sum_overflow_falls_back_to_float() {
        let values = [Value::Int(i64::MAX), Value::Int(i64::MAX), Value::Null];
        let total = Reduction::Sum.apply(&values);
        assert!(matches!(total, Value::Float(_)));
        assert_eq!(total.as_f64(), Some(2.0 * i64::MAX as f64));
        assert!(matches!(Reduction::Sum.apply(&[Value::Int(2), Value::Int(3)]), Value::Int(5)));
        assert_eq!(Reduction::Sum.apply(&[Value::Int(2), Value::Float(0.5)]), Value::Float(2.5));
    }

    #[test]
    fn timing_reductions_per_group() {
        let rows = vec![
            record(0, "f_a", 100, 10),
            record(0, "f_a", 120, 5),
            record(0, "f_b", 50, 7),
            record(1, "f_a", 90, 3),
        ];
        let table = aggregate(&rows, &AggregateSpec::timing(&["device", "operator-name"])).unwrap();
        assert_eq!(
            table.columns,
            vec!["device", "operator-name", "ts_first", "ts_last", "dur_sum", "dur_last"]
        );

        let firsts: Vec<i64> = table.rows.iter().filter_map(|r| r.int("ts_first")).collect();
        assert_eq!(firsts, vec![50, 90, 100]);
        let dev0_a = &table.rows[2];
        assert_eq!(dev0_a.int("ts_last"), Some(120));
        assert_eq!(dev0_a.int("dur_sum"), Some(15));
        assert_eq!(dev0_a.int("dur_last"), Some(5));
    }

    #[test]
    fn weighted_mean_matches_hand_computation() {
        let mut rows = Vec::new();
        for (op, occupancy, cycles) in [("f_a", 10.0, 1.0), ("f_a", 40.0, 3.0), ("f_b", 7.0, 2.0)] {
            let mut r = record(0, op, 0, 1);
            r.metrics.insert("MeanOccupancyPerCU".into(), occupancy);
            r.metrics.insert("GRBM_GUI_ACTIVE".into(), cycles);
            rows.push(r);
        }
        let spec = AggregateSpec::new(&["operator-name"]).weighted("MeanOccupancyPerCU", "GRBM_GUI_ACTIVE");
        let table = aggregate(&rows, &spec).unwrap();

        // (10*1 + 40*3) / (1 + 3) = 32.5
        assert_eq!(table.rows[0].float("MeanOccupancyPerCU"), Some(32.5));
        assert_eq!(table.rows[0].float("GRBM_GUI_ACTIVE"), Some(4.0));
        assert_eq!(table.rows[1].float("MeanOccupancyPerCU"), Some(7.0));
    }

    #[test]
    fn weighted_mean_holds_for_random_weights() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut rows = Vec::new();
        let mut expected: BTreeMap<String, (f64, f64)> = BTreeMap::new();
        for i in 0..200 {
            let op = format!("op{}", i % 5);
            let metric: f64 = rng.random_range(0.0..100.0);
            let weight: f64 = rng.random_range(0.0..10.0);
            let entry = expected.entry(op.clone()).or_default();
            entry.0 += metric * weight;
            entry.1 += weight;
            let mut r = record(0, &op, i, 1);
            r.metrics.insert("m".into(), metric);
            r.metrics.insert("w".into(), weight);
            rows.push(r);
        }
        let table = aggregate(&rows, &AggregateSpec::new(&["operator-name"]).weighted("m", "w")).unwrap();
        for row in &table.rows {
            let (num, den) = expected[row.str("operator-name").unwrap()];
            let got = row.float("m").unwrap();
            assert!((got - num / den).abs() < 1e-9, "{got} vs {}", num / den);
        }
    }

    #[test]
    fn zero_total_weight_yields_null() {
        let mut r = record(0, "f_a", 0, 1);
        r.metrics.insert("m".into(), 5.0);
        r.metrics.insert("w".into(), 0.0);
        let table = aggregate(&[r], &AggregateSpec::new(&["device"]).weighted("m", "w")).unwrap();
        assert!(table.rows[0].get("m").is_null());
    }

    #[test]
    fn missing_source_column_is_a_schema_violation() {
        let rows = vec![record(0, "f_a", 0, 1)];
        let spec = AggregateSpec::new(&["device"]).reduce("SQ_WAVES", &[Reduction::Sum]);
        let err = aggregate(&rows, &spec).unwrap_err();
        assert!(matches!(err, AnalysisError::MissingColumns { missing, .. } if missing == vec!["SQ_WAVES"]));
    }

    #[test]
    fn double_weighting_is_rejected() {
        let spec = AggregateSpec::new(&["device"]).weighted("m", "w").weighted("m", "v");
        let rows: Vec<UnifiedRecord> = Vec::new();
        assert!(matches!(aggregate(&rows, &spec), Err(AnalysisError::InvalidAggregation(_))));
    }

    #[test]
    fn null_keys_form_their_own_trailing_group() {
        let mut rows = vec![record(0, "f_a", 5, 1), record(0, "f_a", 6, 1)];
        rows[1].operator_name = None;
        let table = aggregate(&rows, &AggregateSpec::new(&["operator-name"]).reduce("ts", &[Reduction::Min])).unwrap();
        assert_eq!(table.len(), 2);
        assert!(table.rows[1].get("operator-name").is_null());
        assert_eq!(table.rows[1].int("ts_min"), Some(6));
    }

    #[test]
    fn reductions_skip_nulls() {
        let values = vec![Value::Null, Value::Int(3), Value::Int(1), Value::Null, Value::Int(8)];
        assert_eq!(Reduction::First.apply(&values), Value::Int(3));
        assert_eq!(Reduction::Last.apply(&values), Value::Int(8));
        assert_eq!(Reduction::Sum.apply(&values), Value::Int(12));
        assert_eq!(Reduction::Median.apply(&values), Value::Float(3.0));
        assert_eq!(Reduction::Count.apply(&values), Value::Int(3));
        assert!(Reduction::Max.apply(&[Value::Null]).is_null());
    }
}
