//! Reconstructs per-kernel records from multi-device profiler traces and
//! measures straggler lead and communication overlap.

pub mod aggregate;
pub mod cache;
pub mod classifier;
pub mod config;
pub mod correlator;
pub mod counters;
pub mod error;
pub mod framework;
pub mod ingest;
pub mod metrics;
pub mod overlap;
pub mod parser;
pub mod prepare;
pub mod record;
pub mod report;
pub mod straggler;
pub mod synth;
pub mod table;
pub mod time;

pub use aggregate::{aggregate, AggregateSpec, Reduction};
pub use cache::TableCache;
pub use config::AnalysisConfig;
pub use error::{AnalysisError, Result};
pub use framework::{Framework, FrameworkStrategy};
pub use metrics::MetricRegistry;
pub use record::{Chunk, OperatorType, UnifiedRecord, UnifiedTable};
pub use report::{Report, ReportMeta};
pub use table::{GroupedRow, GroupedTable, Value};
