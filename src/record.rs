//! The unified per-kernel record model.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::table::{Columnar, Value};
use crate::time::Ns;

/// Layer value for records outside any `Layer<n>` annotation.
pub const NO_LAYER: i64 = -1;

/// Canonical column names.
pub mod col {
    pub const DEVICE: &str = "device";
    pub const TS: &str = "ts";
    pub const DUR: &str = "dur";
    pub const NAME: &str = "name";
    pub const EXTERNAL_ID: &str = "external_id";
    pub const CORRELATION: &str = "correlation";
    pub const OPERATOR_NAME: &str = "operator-name";
    pub const LAYER: &str = "layer";
    pub const ITERATION: &str = "iteration";
    pub const CHUNK: &str = "chunk";
    pub const OPERATOR_TYPE: &str = "operator-type";
    pub const KIND: &str = "kind";
    pub const CPU_OP_NAME: &str = "name_cpu_op";
    pub const LAUNCH_TS: &str = "ts_launch";
    pub const LAUNCH_NAME: &str = "name_launch";
    pub const BYTES: &str = "bytes";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chunk {
    Fwd,
    Bwd,
    Opt,
}

impl Chunk {
    pub fn as_str(&self) -> &'static str {
        match self {
            Chunk::Fwd => "fwd",
            Chunk::Bwd => "bwd",
            Chunk::Opt => "opt",
        }
    }
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum OperatorType {
    #[serde(rename = "GEMM")]
    Gemm,
    #[serde(rename = "FA")]
    FlashAttention,
    #[serde(rename = "Vec")]
    Vector,
}

impl OperatorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperatorType::Gemm => "GEMM",
            OperatorType::FlashAttention => "FA",
            OperatorType::Vector => "Vec",
        }
    }
}

/// Which device-side event category produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Kernel,
    Memcpy,
    Memset,
}

impl DeviceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Kernel => "kernel",
            DeviceKind::Memcpy => "memcpy",
            DeviceKind::Memset => "memset",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedRecord {
    pub device: i64,
    pub ts: Ns,
    pub dur: Ns,
    pub name: String,
    pub kind: DeviceKind,
    pub external_id: Option<i64>,
    pub correlation: Option<i64>,
    pub operator_name: Option<String>,
    pub layer: Option<i64>,
    pub iteration: Option<i64>,
    pub chunk: Option<Chunk>,
    pub operator_type: Option<OperatorType>,
    /// Name of the host operator span that launched this record.
    pub cpu_op_name: Option<String>,
    /// Timestamp of the host-side dispatch call.
    pub launch_ts: Option<Ns>,
    pub launch_name: Option<String>,
    pub bytes: Option<i64>,
    /// Counter values and derived metrics.
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
}

impl UnifiedRecord {
    pub fn new(device: i64, ts: Ns, dur: Ns, name: impl Into<String>) -> Self {
        Self {
            device,
            ts,
            dur,
            name: name.into(),
            kind: DeviceKind::Kernel,
            external_id: None,
            correlation: None,
            operator_name: None,
            layer: None,
            iteration: None,
            chunk: None,
            operator_type: None,
            cpu_op_name: None,
            launch_ts: None,
            launch_name: None,
            bytes: None,
            metrics: BTreeMap::new(),
        }
    }

    pub fn end(&self) -> Ns {
        self.ts + self.dur
    }

    pub fn operator(&self) -> Option<&str> {
        self.operator_name.as_deref()
    }

    pub fn with_operator(mut self, operator: &str) -> Self {
        self.operator_name = Some(operator.to_string());
        self
    }

    pub fn with_iteration(mut self, iteration: i64) -> Self {
        self.iteration = Some(iteration);
        self
    }

    pub fn with_layer(mut self, layer: i64) -> Self {
        self.layer = Some(layer);
        self
    }
}

const FIXED_COLUMNS: [&str; 16] = [
    col::DEVICE,
    col::TS,
    col::DUR,
    col::NAME,
    col::KIND,
    col::EXTERNAL_ID,
    col::CORRELATION,
    col::OPERATOR_NAME,
    col::LAYER,
    col::ITERATION,
    col::CHUNK,
    col::OPERATOR_TYPE,
    col::CPU_OP_NAME,
    col::LAUNCH_TS,
    col::LAUNCH_NAME,
    col::BYTES,
];

impl Columnar for UnifiedRecord {
    fn column(&self, name: &str) -> Option<Value> {
        let value = match name {
            col::DEVICE => Value::Int(self.device),
            col::TS => Value::Int(self.ts),
            col::DUR => Value::Int(self.dur),
            col::NAME => Value::from(self.name.as_str()),
            col::KIND => Value::from(self.kind.as_str()),
            col::EXTERNAL_ID => self.external_id.into(),
            col::CORRELATION => self.correlation.into(),
            col::OPERATOR_NAME => self.operator_name.clone().into(),
            col::LAYER => self.layer.into(),
            col::ITERATION => self.iteration.into(),
            col::CHUNK => self.chunk.map(|c| c.as_str()).into(),
            col::OPERATOR_TYPE => self.operator_type.map(|t| t.as_str()).into(),
            col::CPU_OP_NAME => self.cpu_op_name.clone().into(),
            col::LAUNCH_TS => self.launch_ts.into(),
            col::LAUNCH_NAME => self.launch_name.clone().into(),
            col::BYTES => self.bytes.into(),
            other => return self.metrics.get(other).map(|v| Value::Float(*v)),
        };
        Some(value)
    }

    fn column_names(&self) -> Vec<String> {
        FIXED_COLUMNS
            .iter()
            .map(|c| c.to_string())
            .chain(self.metrics.keys().cloned())
            .collect()
    }
}

/// The reconstructed trace of one or more devices.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnifiedTable {
    pub records: Vec<UnifiedRecord>,
}

impl UnifiedTable {
    pub fn new(records: Vec<UnifiedRecord>) -> Self {
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Concatenates per-device tables and orders by `(device, ts)`.
    pub fn concat(tables: impl IntoIterator<Item = UnifiedTable>) -> Self {
        let mut records: Vec<UnifiedRecord> =
            tables.into_iter().flat_map(|t| t.records).collect();
        records.sort_by_key(|r| (r.device, r.ts));
        Self { records }
    }

    pub fn devices(&self) -> Vec<i64> {
        let mut devices: Vec<i64> = self.records.iter().map(|r| r.device).collect();
        devices.sort_unstable();
        devices.dedup();
        devices
    }

    /// Distinct non-null iteration values, ascending.
    pub fn iterations(&self) -> Vec<i64> {
        let mut iterations: Vec<i64> = self.records.iter().filter_map(|r| r.iteration).collect();
        iterations.sort_unstable();
        iterations.dedup();
        iterations
    }
}
