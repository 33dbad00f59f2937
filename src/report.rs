use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::config::AnalysisConfig;
use crate::error::{AnalysisError, Result};
use crate::framework::Framework;
use crate::table::GroupedTable;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportMeta {
    pub generated_at: DateTime<Utc>,
    pub config_hash: String,
    pub framework: Framework,
    /// Analysis that produced the table, e.g. `straggler`.
    pub analysis: String,
    /// Input table the analysis ran on.
    pub source: String,
}

impl ReportMeta {
    pub fn new(config: &AnalysisConfig, analysis: &str, source: &str) -> Self {
        Self {
            generated_at: Utc::now(),
            config_hash: config.config_hash(),
            framework: config.framework,
            analysis: analysis.to_string(),
            source: source.to_string(),
        }
    }
}

/// An analysis table plus the metadata needed to reproduce it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub meta: ReportMeta,
    pub table: GroupedTable,
}

impl Report {
    pub fn new(meta: ReportMeta, table: GroupedTable) -> Self {
        Self { meta, table }
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).map_err(|e| AnalysisError::io(path.display().to_string(), e))?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content =
            fs::read_to_string(path).map_err(|e| AnalysisError::io(path.display().to_string(), e))?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn summary(&self, limit: usize) -> String {
        format!(
            "📊 {} ({} rows, framework {}, config {})\n{}",
            self.meta.analysis,
            self.table.len(),
            self.meta.framework,
            &self.meta.config_hash[..self.meta.config_hash.len().min(8)],
            self.table.display_table(limit)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::GroupedRow;

    #[test]
    fn saved_report_reloads_with_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("straggler.json");

        let mut table = GroupedTable::new(vec!["device".into(), "s-value".into()]);
        let mut row = GroupedRow::default();
        row.set("device", 0i64);
        row.set("s-value", 50i64);
        table.rows.push(row);

        let config = AnalysisConfig::default();
        let report = Report::new(ReportMeta::new(&config, "straggler", "unified.json"), table);
        report.save_to_file(&path).unwrap();

        let loaded = Report::load(&path).unwrap();
        assert_eq!(loaded, report);
        assert_eq!(loaded.meta.config_hash, config.config_hash());
        assert!(loaded.summary(10).contains("straggler"));
    }
}
