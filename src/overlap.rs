//! Share of each computation interval's wall-clock time that coincides with
//! communication on the same device.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::aggregate::{aggregate, AggregateSpec};
use crate::config::AnalysisConfig;
use crate::error::Result;
use crate::framework::FrameworkStrategy;
use crate::prepare::prepare;
use crate::record::{col, UnifiedRecord, UnifiedTable};
use crate::table::{Columnar, GroupedRow, GroupedTable, Value};
use crate::time::Ns;

pub const END_TS: &str = "end_ts";
pub const ELAPSED: &str = "elapsed";
pub const OVERLAP_RATIO: &str = "overlap_ratio";
pub const CDF: &str = "cdf";
pub const OP_IDX: &str = "op_idx";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub start: Ns,
    pub end: Ns,
}

impl Interval {
    pub fn new(start: Ns, end: Ns) -> Self {
        Self { start, end }
    }

    pub fn elapsed(&self) -> Ns {
        self.end - self.start
    }

    /// Length of the intersection, 0 when disjoint.
    pub fn intersection(&self, other: &Interval) -> Ns {
        (self.end.min(other.end) - self.start.max(other.start)).max(0)
    }
}

/// Communication intervals of one device sorted by start. The longest
/// interval bounds how far back a candidate can start and still reach a query.
#[derive(Debug, Default)]
struct DeviceIntervals {
    sorted: Vec<Interval>,
    max_len: Ns,
}

impl DeviceIntervals {
    fn new(mut intervals: Vec<Interval>) -> Self {
        intervals.sort_by_key(|i| (i.start, i.end));
        let max_len = intervals.iter().map(Interval::elapsed).max().unwrap_or(0);
        Self {
            sorted: intervals,
            max_len,
        }
    }

    /// Every interval with `start <= query.end && end >= query.start`.
    fn touching<'a>(&'a self, query: &'a Interval) -> impl Iterator<Item = &'a Interval> + 'a {
        let lo = self
            .sorted
            .partition_point(|c| c.start < query.start.saturating_sub(self.max_len));
        let hi = self.sorted.partition_point(|c| c.start <= query.end);
        self.sorted[lo..hi.max(lo)]
            .iter()
            .filter(move |c| c.end >= query.start)
    }
}

/// Percentage of `interval` covered by `comm`.
///
/// Overlaps are summed per communication interval, so regions where
/// communication intervals overlap each other are counted more than once;
/// the total is clamped to the elapsed time. Zero-length intervals yield 0.
pub fn overlap_ratio(interval: &Interval, comm: &[Interval]) -> f64 {
    ratio_of(interval, comm.iter().filter(|c| c.start <= interval.end && c.end >= interval.start))
}

fn ratio_of<'a>(interval: &Interval, touching: impl Iterator<Item = &'a Interval>) -> f64 {
    let elapsed = interval.elapsed();
    if elapsed <= 0 {
        return 0.0;
    }
    let total: Ns = touching.map(|c| interval.intersection(c)).sum();
    100.0 * total.min(elapsed) as f64 / elapsed as f64
}

pub(crate) fn communication_records<'a>(
    records: &'a [UnifiedRecord],
    strategy: &'a dyn FrameworkStrategy,
) -> impl Iterator<Item = &'a UnifiedRecord> + 'a {
    records.iter().filter(move |r| strategy.is_communication(r))
}

/// Raw communication records with their `end_ts`, in timestamp order.
pub fn communication_table(table: &UnifiedTable, config: &AnalysisConfig) -> Result<GroupedTable> {
    let strategy = config.framework.strategy();
    let mut records = prepare(table, &config.raw_options(), strategy.as_ref())?;
    records.sort_by_key(|r| r.ts);

    let columns = [
        col::DEVICE,
        col::ITERATION,
        col::LAYER,
        col::OPERATOR_NAME,
        col::NAME,
        col::CPU_OP_NAME,
        col::TS,
        col::DUR,
        END_TS,
    ];
    let mut out = GroupedTable::new(columns.iter().map(|c| c.to_string()).collect());
    for record in communication_records(&records, strategy.as_ref()) {
        let mut row = GroupedRow::default();
        for column in &columns[..columns.len() - 1] {
            row.set(*column, record.column(column).unwrap_or_default());
        }
        row.set(END_TS, record.end());
        out.rows.push(row);
    }
    info!("📡 {} communication records", out.len());
    Ok(out)
}

/// Per-operator computation intervals annotated with `end_ts`, `elapsed` and
/// `overlap_ratio`, ordered by device then `ts_first`.
pub fn overlap_table(table: &UnifiedTable, config: &AnalysisConfig) -> Result<GroupedTable> {
    let strategy = config.framework.strategy();

    let raw = prepare(table, &config.raw_options(), strategy.as_ref())?;
    let mut comm: BTreeMap<i64, Vec<Interval>> = BTreeMap::new();
    for record in communication_records(&raw, strategy.as_ref()) {
        comm.entry(record.device)
            .or_default()
            .push(Interval::new(record.ts, record.end()));
    }

    let computation = prepare(table, &config.computation_options(), strategy.as_ref())?;
    info!(
        "🔀 Measuring overlap of {} computation records against {} devices with communication",
        computation.len(),
        comm.len()
    );
    let grouped = aggregate(&computation, &AggregateSpec::timing(&config.group_columns(true)))?;
    add_overlap_columns(grouped, comm)
}

/// Adds `end_ts = ts_last + dur_last` and `elapsed = end_ts - ts_first` to a
/// timing table.
pub fn add_span_columns(grouped: &mut GroupedTable) -> Result<()> {
    grouped.require(&["ts_first", "ts_last", "dur_last"], "span")?;
    for row in grouped.rows.iter_mut() {
        let end = row.int("ts_last").zip(row.int("dur_last")).map(|(ts, dur)| ts + dur);
        let elapsed = end.zip(row.int("ts_first")).map(|(end, start)| end - start);
        row.set(END_TS, end);
        row.set(ELAPSED, elapsed);
    }
    grouped.add_column(END_TS);
    grouped.add_column(ELAPSED);
    Ok(())
}

/// Adds the span and overlap columns to a per-device timing table.
pub fn add_overlap_columns(
    mut grouped: GroupedTable,
    comm: BTreeMap<i64, Vec<Interval>>,
) -> Result<GroupedTable> {
    grouped.require(&[col::DEVICE], "overlap")?;
    add_span_columns(&mut grouped)?;
    let index: BTreeMap<i64, DeviceIntervals> = comm
        .into_iter()
        .map(|(device, intervals)| (device, DeviceIntervals::new(intervals)))
        .collect();
    let empty = DeviceIntervals::default();

    for row in grouped.rows.iter_mut() {
        let (Some(start), Some(end)) = (row.int("ts_first"), row.int(END_TS)) else {
            row.set(OVERLAP_RATIO, Value::Null);
            continue;
        };
        let interval = Interval::new(start, end);
        let device = row.int(col::DEVICE).and_then(|d| index.get(&d)).unwrap_or(&empty);
        row.set(OVERLAP_RATIO, ratio_of(&interval, device.touching(&interval)));
    }
    grouped.sort_by_column(col::DEVICE);
    grouped.add_column(OVERLAP_RATIO);
    debug!("overlap computed for {} intervals", grouped.len());
    Ok(grouped)
}

/// Per device, orders intervals by overlap (then start) and attaches the
/// cumulative share `cdf` and rank `op_idx`.
pub fn overlap_cdf(overlap: &GroupedTable, sort_by_ratio: bool) -> Result<GroupedTable> {
    overlap.require(&[col::DEVICE, "ts_first", OVERLAP_RATIO], "overlap cdf")?;

    let mut per_device: BTreeMap<Value, Vec<GroupedRow>> = BTreeMap::new();
    for row in &overlap.rows {
        per_device.entry(row.get(col::DEVICE).clone()).or_default().push(row.clone());
    }

    let mut out = GroupedTable::new(overlap.columns.clone());
    for (_, mut rows) in per_device {
        rows.sort_by(|a, b| {
            let by_start = a.get("ts_first").cmp(b.get("ts_first"));
            if sort_by_ratio {
                a.get(OVERLAP_RATIO).cmp(b.get(OVERLAP_RATIO)).then(by_start)
            } else {
                by_start
            }
        });
        let n = rows.len();
        for (i, mut row) in rows.into_iter().enumerate() {
            row.set(CDF, 100.0 * (i + 1) as f64 / n as f64);
            row.set(OP_IDX, i as i64);
            out.rows.push(row);
        }
    }
    out.add_column(CDF);
    out.add_column(OP_IDX);
    Ok(out)
}
