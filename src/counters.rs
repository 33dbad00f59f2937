//! Hardware counter rows and their merge onto the unified table.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::Path;

use serde::Serialize;
use serde_json::{Map, Value as Json};
use tracing::{info, warn};

use crate::error::{AnalysisError, Result};
use crate::record::UnifiedTable;

pub const KERNEL_NAME_FIELD: &str = "Kernel_Name";
pub const AGENT_ID_FIELD: &str = "Agent_Id";
const SHORT_NAME_LEN: usize = 80;

/// One profiled kernel instance and its named counter values.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CounterRow {
    pub kernel_name: String,
    pub device: i64,
    pub agent_id: Option<i64>,
    pub counters: BTreeMap<String, f64>,
}

impl CounterRow {
    /// Reads one JSON object; every numeric field other than the agent id is a
    /// counter.
    pub fn from_object(object: &Map<String, Json>, device: i64) -> Result<Self> {
        let kernel_name = object
            .get(KERNEL_NAME_FIELD)
            .and_then(Json::as_str)
            .ok_or_else(|| AnalysisError::MalformedEvent {
                category: "counter".into(),
                reason: format!("missing `{KERNEL_NAME_FIELD}`"),
            })?
            .to_string();
        let agent_id = object.get(AGENT_ID_FIELD).and_then(Json::as_i64);
        let counters = object
            .iter()
            .filter(|(key, _)| *key != KERNEL_NAME_FIELD && *key != AGENT_ID_FIELD)
            .filter_map(|(key, value)| value.as_f64().map(|v| (key.clone(), v)))
            .collect();
        Ok(Self {
            kernel_name,
            device,
            agent_id,
            counters,
        })
    }
}

/// Reads a JSON array of counter objects collected on `device`.
pub fn load_counter_file(path: &Path, device: i64) -> Result<Vec<CounterRow>> {
    info!("📖 Reading counter data from {}", path.display());
    let content =
        fs::read_to_string(path).map_err(|e| AnalysisError::io(path.display().to_string(), e))?;
    let objects: Vec<Map<String, Json>> = serde_json::from_str(&content)?;
    objects
        .iter()
        .map(|object| CounterRow::from_object(object, device))
        .collect()
}

/// Each device must report exactly one agent id, and ids must increase by
/// one from device to device.
pub fn check_agent_ids(rows: &[CounterRow]) -> Result<()> {
    let mut per_device: BTreeMap<i64, BTreeSet<i64>> = BTreeMap::new();
    for row in rows {
        if let Some(agent) = row.agent_id {
            per_device.entry(row.device).or_default().insert(agent);
        }
    }
    let mut expected: Option<i64> = None;
    for (device, agents) in per_device {
        if agents.len() != 1 {
            return Err(AnalysisError::JoinIntegrity {
                key: format!("device {device}"),
                column: AGENT_ID_FIELD.into(),
                left: "one agent".into(),
                right: format!("{agents:?}"),
            });
        }
        let agent = agents.into_iter().next().unwrap_or_default();
        if let Some(want) = expected {
            if agent != want {
                return Err(AnalysisError::JoinIntegrity {
                    key: format!("device {device}"),
                    column: AGENT_ID_FIELD.into(),
                    left: want.to_string(),
                    right: agent.to_string(),
                });
            }
        }
        expected = Some(agent + 1);
    }
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CounterMergeReport {
    /// Kernel names with counters but no trace records; excluded.
    pub missing_from_trace: Vec<String>,
    /// Kernel names traced but never profiled; left without counters.
    pub missing_from_counters: Vec<String>,
    pub matched: usize,
}

fn short_name(name: &str) -> String {
    if name.chars().count() > SHORT_NAME_LEN {
        format!("{}...", name.chars().take(SHORT_NAME_LEN).collect::<String>())
    } else {
        name.to_string()
    }
}

/// Position of each item among items with the same key, counted from the end.
fn occurrence_from_end<K: std::hash::Hash + Eq>(keys: impl DoubleEndedIterator<Item = K> + ExactSizeIterator) -> Vec<usize> {
    let n = keys.len();
    let mut seen: HashMap<K, usize> = HashMap::new();
    let mut out = vec![0; n];
    for (i, key) in keys.enumerate().rev() {
        let count = seen.entry(key).or_default();
        out[i] = *count;
        *count += 1;
    }
    out
}

/// Attaches counter values to trace records of the same kernel name and
/// device, pairing the k-th instance from the end on both sides.
///
/// `iterations` are raw iteration numbers; when given, only records of those
/// iterations receive counters. Kernels profiled but absent from the trace are
/// dropped from both sides before pairing.
pub fn merge_counters(
    table: &mut UnifiedTable,
    counters: &[CounterRow],
    iterations: Option<&[i64]>,
) -> Result<CounterMergeReport> {
    check_agent_ids(counters)?;
    let counter_devices = counters.iter().map(|c| c.device).collect::<BTreeSet<_>>();
    let devices = table.devices();
    if devices.len() != counter_devices.len() {
        warn!("Number of counter files doesn't match {} devices:", devices.len());
        warn!("    Only the first {} devices will be used", counter_devices.len());
    }

    if let Some(iterations) = iterations {
        let available = table.iterations();
        if let Some(&bad) = iterations.iter().find(|it| !available.contains(it)) {
            return Err(AnalysisError::InvalidIterationSelection {
                index: bad,
                available: available.len(),
            });
        }
    }
    let selected = |iteration: Option<i64>| match iterations {
        Some(its) => iteration.is_some_and(|it| its.contains(&it)),
        None => true,
    };

    let trace_names: BTreeSet<&str> = table
        .records
        .iter()
        .filter(|r| counter_devices.contains(&r.device) && selected(r.iteration))
        .map(|r| r.name.as_str())
        .collect();
    let counter_names: BTreeSet<&str> = counters.iter().map(|c| c.kernel_name.as_str()).collect();

    let mut report = CounterMergeReport {
        missing_from_trace: counter_names.difference(&trace_names).map(|s| s.to_string()).collect(),
        missing_from_counters: trace_names.difference(&counter_names).map(|s| s.to_string()).collect(),
        matched: 0,
    };
    if !report.missing_from_trace.is_empty() {
        warn!("These kernel names are missing from trace data:");
        for name in &report.missing_from_trace {
            warn!("    {}", short_name(name));
        }
    }
    if !report.missing_from_counters.is_empty() {
        warn!("These kernel names are missing from counter data:");
        for name in &report.missing_from_counters {
            warn!("    {}", short_name(name));
        }
    }

    let ignored: BTreeSet<&str> = report.missing_from_trace.iter().map(String::as_str).collect();
    table.records.retain(|r| !ignored.contains(r.name.as_str()));
    let kept: Vec<&CounterRow> = counters
        .iter()
        .filter(|c| !ignored.contains(c.kernel_name.as_str()))
        .collect();

    let counter_rank = occurrence_from_end(kept.iter().map(|c| (c.kernel_name.as_str(), c.device)));
    let by_key: HashMap<(&str, i64, usize), &CounterRow> = kept
        .iter()
        .zip(counter_rank)
        .map(|(c, rank)| ((c.kernel_name.as_str(), c.device, rank), *c))
        .collect();

    info!("Merging timestamps and counters...");
    let trace_rank = occurrence_from_end(table.records.iter().map(|r| (r.name.clone(), r.device)));
    for (record, rank) in table.records.iter_mut().zip(trace_rank) {
        if !selected(record.iteration) {
            continue;
        }
        if let Some(row) = by_key.get(&(record.name.as_str(), record.device, rank)) {
            record
                .metrics
                .extend(row.counters.iter().map(|(k, v)| (k.clone(), *v)));
            report.matched += 1;
        }
    }
    info!("✅ {} records received counters", report.matched);
    Ok(report)
}
