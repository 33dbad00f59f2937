//! Trace files in, unified tables out.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use indicatif::{ProgressBar, ProgressStyle};
use tokio::task::JoinSet;
use tracing::info;

use crate::correlator::reconstruct;
use crate::error::{AnalysisError, Result};
use crate::parser::parse_trace_file;
use crate::record::UnifiedTable;

/// Parses and reconstructs one device's trace.
pub fn parse_trace(path: &Path, device: i64) -> Result<UnifiedTable> {
    let parsed = parse_trace_file(path)?;
    let table = reconstruct(device, parsed)?;
    info!("✅ device {}: {} records from {}", device, table.len(), path.display());
    Ok(table)
}

/// Paths in the order that assigns device ids: file `i` of the sorted list is
/// device `i`.
pub fn device_order(paths: &[PathBuf]) -> Vec<(i64, PathBuf)> {
    let mut sorted = paths.to_vec();
    sorted.sort();
    sorted
        .into_iter()
        .enumerate()
        .map(|(device, path)| (device as i64, path))
        .collect()
}

/// Parses every file on a blocking worker and concatenates the results,
/// ordered by `(device, ts)`. The first failure aborts the batch.
pub async fn parse_traces(paths: &[PathBuf]) -> Result<UnifiedTable> {
    let jobs = device_order(paths);
    info!("🚀 Parsing {} trace files", jobs.len());

    let progress = ProgressBar::new(jobs.len() as u64);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    progress.set_message("parsing traces...");

    let mut workers = JoinSet::new();
    for (device, path) in jobs {
        workers.spawn_blocking(move || parse_trace(&path, device));
    }

    let mut tables = Vec::with_capacity(workers.len());
    while let Some(joined) = workers.join_next().await {
        let table = joined.map_err(|e| AnalysisError::Worker(e.to_string()))??;
        tables.push(table);
        progress.inc(1);
    }
    progress.finish_with_message("done");

    Ok(UnifiedTable::concat(tables))
}

pub fn read_table(path: &Path) -> Result<UnifiedTable> {
    let file = File::open(path).map_err(|e| AnalysisError::io(path.display().to_string(), e))?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}

pub fn write_table(path: &Path, table: &UnifiedTable) -> Result<()> {
    let file = File::create(path).map_err(|e| AnalysisError::io(path.display().to_string(), e))?;
    serde_json::to_writer(BufWriter::new(file), table)?;
    info!("💾 Saved {} records to {}", table.len(), path.display());
    Ok(())
}

/// Reads several unified tables and merges them into one.
pub fn concat_tables(paths: &[PathBuf]) -> Result<UnifiedTable> {
    let tables = paths
        .iter()
        .map(|p| read_table(p))
        .collect::<Result<Vec<_>>>()?;
    Ok(UnifiedTable::concat(tables))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace(kernel_ts: &str) -> String {
        format!(
            r#"{{"traceEvents":[
                {{"cat":"cpu_op","name":"aten::mm","ts":1.0,"dur":100.0,"args":{{"External id":1}}}},
                {{"cat":"cuda_runtime","name":"cudaLaunchKernel","ts":2.0,"dur":1.0,"args":{{"correlation":10,"External id":1}}}},
                {{"cat":"kernel","name":"gemm","ts":{kernel_ts},"dur":4.0,"args":{{"correlation":10}}}}
            ]}}"#
        )
    }

    #[test]
    fn devices_follow_sorted_file_order() {
        let order = device_order(&[PathBuf::from("rank1.json"), PathBuf::from("rank0.json")]);
        assert_eq!(order[0], (0, PathBuf::from("rank0.json")));
        assert_eq!(order[1], (1, PathBuf::from("rank1.json")));
    }

    #[tokio::test]
    async fn parses_files_concurrently_into_one_table() {
        let dir = tempfile::tempdir().unwrap();
        let b = dir.path().join("b.json");
        let a = dir.path().join("a.json");
        std::fs::write(&b, trace("20.5")).unwrap();
        std::fs::write(&a, trace("10.25")).unwrap();

        let table = parse_traces(&[b, a]).await.unwrap();
        let summary: Vec<(i64, i64)> = table.records.iter().map(|r| (r.device, r.ts)).collect();
        assert_eq!(summary, vec![(0, 10_250), (1, 20_500)]);
        assert_eq!(table.records[0].launch_ts, Some(2_000));
        assert_eq!(table.records[0].cpu_op_name.as_deref(), Some("aten::mm"));
    }

    #[tokio::test]
    async fn missing_file_fails_the_batch() {
        let err = parse_traces(&[PathBuf::from("/nonexistent/trace.json")]).await.unwrap_err();
        assert!(matches!(err, AnalysisError::Io { .. }));
    }

    #[test]
    fn table_files_round_trip_through_concat() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first.json");
        let second = dir.path().join("second.json");
        write_table(&first, &UnifiedTable::new(vec![crate::record::UnifiedRecord::new(1, 5, 1, "k")])).unwrap();
        write_table(&second, &UnifiedTable::new(vec![crate::record::UnifiedRecord::new(0, 9, 1, "k")])).unwrap();

        let merged = concat_tables(&[first, second]).unwrap();
        assert_eq!(merged.devices(), vec![0, 1]);
        assert_eq!(merged.records[0].ts, 9);
    }
}
