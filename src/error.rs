//! Error types shared by every pipeline stage.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, AnalysisError>;

/// Errors produced while reconstructing or analysing a trace.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("{context}: missing required columns {missing:?}")]
    MissingColumns {
        context: String,
        missing: Vec<String>,
    },

    #[error("join on `{key}` disagrees on column `{column}`: left={left}, right={right}")]
    JoinIntegrity {
        key: String,
        column: String,
        left: String,
        right: String,
    },

    #[error("iteration offset {index} is out of range ({available} distinct iterations)")]
    InvalidIterationSelection { index: i64, available: usize },

    #[error("invalid fixed-point timestamp: {0:?}")]
    InvalidTimestamp(String),

    #[error("malformed `{category}` event: {reason}")]
    MalformedEvent { category: String, reason: String },

    #[error("unknown framework variant: {0}")]
    UnknownFramework(String),

    #[error("unknown reduction: {0}")]
    UnknownReduction(String),

    #[error("invalid aggregation: {0}")]
    InvalidAggregation(String),

    #[error("unknown metric: {0}")]
    UnknownMetric(String),

    #[error("parse worker failed: {0}")]
    Worker(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AnalysisError {
    pub fn missing_columns(context: impl Into<String>, missing: Vec<String>) -> Self {
        Self::MissingColumns {
            context: context.into(),
            missing,
        }
    }

    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
