use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::aggregate::Reduction;
use crate::error::{AnalysisError, Result};
use crate::framework::Framework;
use crate::prepare::PrepareOptions;
use crate::record::col;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub framework: Framework,
    /// Offsets into the sorted distinct iteration values; negative counts from the end.
    pub iterations: Vec<i64>,
    /// Group down to individual kernel names, not only operators.
    pub kernel_name: bool,
    pub drop_unchunked: bool,
    /// Label records GEMM, FA or Vec from their operator name.
    pub assign_operator_types: bool,
    /// Reduction across devices that defines the straggler reference time.
    pub reference: Reduction,
    pub sort_overlap_cdf_by_ratio: bool,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            framework: Framework::FsdpV1,
            iterations: Vec::new(),
            kernel_name: false,
            drop_unchunked: true,
            assign_operator_types: true,
            reference: Reduction::Max,
            sort_overlap_cdf_by_ratio: true,
        }
    }
}

impl AnalysisConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content =
            fs::read_to_string(path).map_err(|e| AnalysisError::io(path.display().to_string(), e))?;
        let config: AnalysisConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).map_err(|e| AnalysisError::io(path.display().to_string(), e))?;
        Ok(())
    }

    /// Only order statistics make sense as a reference timestamp.
    pub fn validate(&self) -> Result<()> {
        match self.reference {
            Reduction::Max | Reduction::Min | Reduction::Median | Reduction::Mean => Ok(()),
            other => Err(AnalysisError::InvalidAggregation(format!(
                "`{other}` cannot serve as a straggler reference"
            ))),
        }
    }

    /// md5 of the serialized configuration, stamped into every report.
    pub fn config_hash(&self) -> String {
        let serialized = serde_json::to_string(self).unwrap_or_default();
        format!("{:x}", md5::compute(serialized.as_bytes()))
    }

    /// `iteration, layer, operator-name[, name]`, optionally led by `device`.
    pub fn group_columns(&self, with_device: bool) -> Vec<&'static str> {
        let mut columns = Vec::with_capacity(5);
        if with_device {
            columns.push(col::DEVICE);
        }
        columns.extend([col::ITERATION, col::LAYER, col::OPERATOR_NAME]);
        if self.kernel_name {
            columns.push(col::NAME);
        }
        columns
    }

    /// Computation records: communication removed, typed, chunked, names fixed.
    pub fn computation_options(&self) -> PrepareOptions {
        PrepareOptions {
            drop_unchunked: self.drop_unchunked,
            assign_operator_types: self.assign_operator_types,
            ..PrepareOptions::computation(&self.iterations)
        }
    }

    pub fn raw_options(&self) -> PrepareOptions {
        PrepareOptions {
            assign_operator_types: self.assign_operator_types,
            ..PrepareOptions::raw(&self.iterations)
        }
    }
}
