//! Straggler lead: how far each device runs ahead of the slowest one at every
//! operator boundary, and the same lead measured on communication groups
//! (slack).

use std::collections::BTreeMap;

use tracing::info;

use crate::aggregate::{aggregate, AggregateSpec, Reduction};
use crate::config::AnalysisConfig;
use crate::error::Result;
use crate::overlap::{add_span_columns, communication_records};
use crate::prepare::prepare;
use crate::record::{col, UnifiedRecord, UnifiedTable};
use crate::table::{GroupedRow, GroupedTable, Value};

pub const S_VALUE: &str = "s-value";
pub const S_DELTA: &str = "s-delta";
pub const TS_FIRST: &str = "ts_first";

pub const CONTRIBUTOR_GROUPS: [&str; 2] = [col::DEVICE, col::OPERATOR_NAME];
pub const CONTRIBUTOR_REDUCTIONS: [Reduction; 4] =
    [Reduction::Min, Reduction::Max, Reduction::Median, Reduction::Sum];

/// One row per `(device, iteration, layer, operator[, kernel])` with the
/// reference time, `s-value` and `s-delta`.
pub fn straggler_table(table: &UnifiedTable, config: &AnalysisConfig) -> Result<GroupedTable> {
    let strategy = config.framework.strategy();
    let records = prepare(table, &config.computation_options(), strategy.as_ref())?;
    info!("🐢 Computing straggler lead over {} records", records.len());

    let grouped = aggregate(&records, &AggregateSpec::timing(&config.group_columns(true)))?;
    add_straggler_columns(grouped, &config.group_columns(false), config.reference)
}

/// Adds `ts_first_<reference>`, `s-value` and `s-delta` to a per-device timing
/// table whose rows are already in `ts_first` order.
///
/// `group_by` is the device-free grouping the reference is computed over.
pub fn add_straggler_columns(
    mut grouped: GroupedTable,
    group_by: &[&str],
    reference: Reduction,
) -> Result<GroupedTable> {
    let mut required = vec![col::DEVICE, col::ITERATION, TS_FIRST];
    required.extend_from_slice(group_by);
    grouped.require(&required, "straggler")?;

    let key_of = |row: &GroupedRow| -> Vec<Value> {
        group_by.iter().map(|c| row.get(c).clone()).collect()
    };

    let mut firsts: BTreeMap<Vec<Value>, Vec<Value>> = BTreeMap::new();
    for row in &grouped.rows {
        firsts.entry(key_of(row)).or_default().push(row.get(TS_FIRST).clone());
    }
    let references: BTreeMap<Vec<Value>, Value> = firsts
        .into_iter()
        .map(|(key, values)| (key, reference.apply(&values)))
        .collect();

    let reference_column = format!("{TS_FIRST}_{reference}");
    for row in grouped.rows.iter_mut() {
        let reference_ts = references.get(&key_of(&*row)).cloned().unwrap_or_default();
        let lead = reference_ts.sub(row.get(TS_FIRST));
        row.set(reference_column.as_str(), reference_ts);
        row.set(S_VALUE, lead);
    }

    // Forward difference within each device, in row order.
    let mut per_device: BTreeMap<Value, Vec<usize>> = BTreeMap::new();
    let mut last_of_iteration: BTreeMap<(Value, Value), usize> = BTreeMap::new();
    for (i, row) in grouped.rows.iter().enumerate() {
        per_device.entry(row.get(col::DEVICE).clone()).or_default().push(i);
        last_of_iteration.insert((row.get(col::DEVICE).clone(), row.get(col::ITERATION).clone()), i);
    }
    let mut deltas = vec![Value::Null; grouped.rows.len()];
    for positions in per_device.values() {
        for pair in positions.windows(2) {
            let (current, next) = (pair[0], pair[1]);
            deltas[current] = grouped.rows[next].get(S_VALUE).sub(grouped.rows[current].get(S_VALUE));
        }
    }
    for &i in last_of_iteration.values() {
        deltas[i] = Value::Int(0);
    }
    for (row, delta) in grouped.rows.iter_mut().zip(deltas) {
        row.set(S_DELTA, delta);
    }

    grouped.add_column(&reference_column);
    grouped.add_column(S_VALUE);
    grouped.add_column(S_DELTA);
    Ok(grouped)
}

/// Reduces `s-value` (or `s-delta`) per group to rank what contributes most
/// to the lead.
pub fn straggler_contributors(
    straggler: &GroupedTable,
    group_by: &[&str],
    use_delta: bool,
    reductions: &[Reduction],
) -> Result<GroupedTable> {
    let source = if use_delta { S_DELTA } else { S_VALUE };
    straggler.require(&[source], "straggler contributors")?;
    aggregate(&straggler.rows, &AggregateSpec::new(group_by).reduce(source, reductions))
}

/// Communication groups next to the computation groups they may hide behind.
#[derive(Debug, Clone, PartialEq)]
pub struct SlackTables {
    /// Per-device communication groups with `end_ts`, `elapsed`, the
    /// cross-device reference and `s-value`.
    pub communication: GroupedTable,
    /// Per-device computation groups with `end_ts` and `elapsed`.
    pub computation: GroupedTable,
}

/// Lead of every device at each communication group, measured like
/// [`straggler_table`] but over communication records, plus the computation
/// intervals to compare it against.
pub fn slack_table(table: &UnifiedTable, config: &AnalysisConfig) -> Result<SlackTables> {
    let strategy = config.framework.strategy();
    let raw = prepare(table, &config.raw_options(), strategy.as_ref())?;
    let comm: Vec<UnifiedRecord> = communication_records(&raw, strategy.as_ref()).cloned().collect();
    info!("⏳ Measuring slack over {} communication records", comm.len());

    let timing = AggregateSpec::timing(&config.group_columns(true));
    let grouped = aggregate(&comm, &timing)?;
    let mut communication = add_straggler_columns(grouped, &config.group_columns(false), config.reference)?;
    add_span_columns(&mut communication)?;

    let records = prepare(table, &config.computation_options(), strategy.as_ref())?;
    let mut computation = aggregate(&records, &timing)?;
    add_span_columns(&mut computation)?;

    Ok(SlackTables {
        communication,
        computation,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kernel(device: i64, iteration: i64, op: &str, ts: i64, dur: i64) -> UnifiedRecord {
        UnifiedRecord::new(device, ts, dur, "gemm_kernel")
            .with_operator(op)
            .with_iteration(iteration)
    }

    fn row_for<'a>(table: &'a GroupedTable, device: i64, op: &str) -> &'a GroupedRow {
        table
            .rows
            .iter()
            .find(|r| r.int(col::DEVICE) == Some(device) && r.str(col::OPERATOR_NAME) == Some(op))
            .unwrap()
    }

    #[test]
    fn lead_is_distance_to_slowest_device() {
        let table = UnifiedTable::new(vec![kernel(0, 0, "f_ie", 100, 10), kernel(1, 0, "f_ie", 150, 10)]);
        let out = straggler_table(&table, &AnalysisConfig::default()).unwrap();

        assert_eq!(row_for(&out, 0, "f_ie").int(S_VALUE), Some(50));
        assert_eq!(row_for(&out, 1, "f_ie").int(S_VALUE), Some(0));
        assert_eq!(row_for(&out, 0, "f_ie").int("ts_first_max"), Some(150));
        assert!(out.columns.iter().any(|c| c == S_DELTA));
    }

    #[test]
    fn terminal_delta_is_zero_per_device_iteration() {
        let mut records = Vec::new();
        for device in 0..2 {
            let skew = device * 7;
            for iteration in 0..2 {
                let base = iteration * 1000;
                records.push(kernel(device, iteration, "f_embed", base + 10 + skew, 5));
                records.push(kernel(device, iteration, "f_attn", base + 100 + skew * 2, 5));
                records.push(kernel(device, iteration, "b_attn", base + 200 + skew * 3, 5));
            }
        }
        let out = straggler_table(&UnifiedTable::new(records), &AnalysisConfig::default()).unwrap();
        assert_eq!(out.len(), 12);

        for device in 0..2 {
            let rows: Vec<_> = out.rows.iter().filter(|r| r.int(col::DEVICE) == Some(device)).collect();
            for (i, row) in rows.iter().enumerate() {
                let last_in_iteration = rows
                    .get(i + 1)
                    .map_or(true, |next| next.int(col::ITERATION) != row.int(col::ITERATION));
                if last_in_iteration {
                    assert_eq!(row.get(S_DELTA), &Value::Int(0));
                } else {
                    let expected = rows[i + 1].int(S_VALUE).unwrap() - row.int(S_VALUE).unwrap();
                    assert_eq!(row.int(S_DELTA), Some(expected));
                }
            }
        }
        // Device 0 leads device 1 by the growing skew.
        assert_eq!(row_for(&out, 0, "b_attn").int(S_VALUE), Some(21));
    }

    #[test]
    fn single_row_group_gets_zero_delta_not_null() {
        let table = UnifiedTable::new(vec![kernel(0, 3, "f_ie", 5, 1)]);
        let out = straggler_table(&table, &AnalysisConfig::default()).unwrap();
        assert_eq!(out.rows[0].get(S_DELTA), &Value::Int(0));
        assert_eq!(out.rows[0].get(S_VALUE), &Value::Int(0));
    }

    #[test]
    fn min_reference_gives_non_positive_lead() {
        let table = UnifiedTable::new(vec![kernel(0, 0, "f_ie", 100, 10), kernel(1, 0, "f_ie", 150, 10)]);
        let config = AnalysisConfig {
            reference: Reduction::Min,
            ..Default::default()
        };
        let out = straggler_table(&table, &config).unwrap();
        assert_eq!(row_for(&out, 1, "f_ie").int(S_VALUE), Some(-50));
        assert!(out.columns.iter().any(|c| c == "ts_first_min"));
    }

    #[test]
    fn kernel_granularity_splits_operator_groups() {
        let mut other = kernel(0, 0, "f_ie", 120, 3);
        other.name = "elementwise_kernel".into();
        let table = UnifiedTable::new(vec![kernel(0, 0, "f_ie", 100, 10), other]);
        let config = AnalysisConfig {
            kernel_name: true,
            ..Default::default()
        };
        assert_eq!(straggler_table(&table, &config).unwrap().len(), 2);
        assert_eq!(straggler_table(&table, &AnalysisConfig::default()).unwrap().len(), 1);
    }

    #[test]
    fn slack_measures_lead_on_communication_groups() {
        let gather = |device: i64, ts: i64, dur: i64| {
            UnifiedRecord::new(device, ts, dur, "ncclDevKernel_AllGather")
                .with_operator("f_ag")
                .with_iteration(0)
        };
        let table = UnifiedTable::new(vec![
            kernel(0, 0, "f_attn", 100, 50),
            gather(0, 200, 10),
            gather(0, 215, 15),
            kernel(1, 0, "f_attn", 150, 50),
            gather(1, 260, 20),
        ]);
        let slack = slack_table(&table, &AnalysisConfig::default()).unwrap();

        let comm = &slack.communication;
        assert_eq!(comm.len(), 2);
        assert_eq!(row_for(comm, 0, "f_ag").int(S_VALUE), Some(60));
        assert_eq!(row_for(comm, 1, "f_ag").int(S_VALUE), Some(0));
        assert_eq!(row_for(comm, 0, "f_ag").int("ts_first_max"), Some(260));
        assert_eq!(row_for(comm, 0, "f_ag").int("end_ts"), Some(230));
        assert_eq!(row_for(comm, 0, "f_ag").int("elapsed"), Some(30));

        let comp = &slack.computation;
        assert_eq!(comp.len(), 2);
        assert!(comp.rows.iter().all(|r| r.str(col::OPERATOR_NAME) == Some("f_attn")));
        assert_eq!(row_for(comp, 1, "f_attn").int("end_ts"), Some(200));
        assert!(comp.rows.iter().all(|r| r.int("elapsed") == Some(50)));
    }

    #[test]
    fn contributors_reduce_lead_per_operator() {
        let table = UnifiedTable::new(vec![
            kernel(0, 0, "f_ie", 100, 10),
            kernel(1, 0, "f_ie", 150, 10),
            kernel(0, 1, "f_ie", 1100, 10),
            kernel(1, 1, "f_ie", 1130, 10),
        ]);
        let straggler = straggler_table(&table, &AnalysisConfig::default()).unwrap();
        let out = straggler_contributors(&straggler, &CONTRIBUTOR_GROUPS, false, &CONTRIBUTOR_REDUCTIONS).unwrap();

        assert_eq!(out.len(), 2);
        let dev0 = &out.rows[0];
        assert_eq!(dev0.int("s-value_sum"), Some(80));
        assert_eq!(dev0.int("s-value_min"), Some(30));
        assert_eq!(dev0.int("s-value_max"), Some(50));
        assert_eq!(dev0.float("s-value_median"), Some(40.0));
    }
}
