//! Splits a raw profiler event stream into typed per-category tables.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value as Json};
use tracing::{info, warn};

use crate::error::{AnalysisError, Result};
use crate::record::DeviceKind;
use crate::time::{self, Ns};

/// One entry of a trace file's `traceEvents` array.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawEvent {
    #[serde(default)]
    pub cat: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub ts: Option<Json>,
    #[serde(default)]
    pub dur: Option<Json>,
    #[serde(default)]
    pub id: Option<Json>,
    #[serde(default)]
    pub bp: Option<Json>,
    #[serde(default)]
    pub args: Map<String, Json>,
}

#[derive(Debug, Deserialize)]
struct TraceFile {
    #[serde(rename = "traceEvents", default)]
    trace_events: Vec<RawEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    FwdBwdLink,
    CpuOp,
    Kernel,
    UserAnnotation,
    LaunchRecord,
    MemoryCopy,
    MemorySet,
}

impl Category {
    pub fn from_trace(cat: &str) -> Option<Self> {
        match cat {
            "fwdbwd" => Some(Self::FwdBwdLink),
            "cpu_op" => Some(Self::CpuOp),
            "kernel" => Some(Self::Kernel),
            "user_annotation" => Some(Self::UserAnnotation),
            "cuda_runtime" => Some(Self::LaunchRecord),
            "gpu_memcpy" => Some(Self::MemoryCopy),
            "gpu_memset" => Some(Self::MemorySet),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FwdBwdLink => "fwdbwd",
            Self::CpuOp => "cpu_op",
            Self::Kernel => "kernel",
            Self::UserAnnotation => "user_annotation",
            Self::LaunchRecord => "cuda_runtime",
            Self::MemoryCopy => "gpu_memcpy",
            Self::MemorySet => "gpu_memset",
        }
    }
}

/// A host operator span.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CpuOpSpan {
    pub ts: Ns,
    pub dur: Ns,
    pub name: String,
    pub external_id: Option<i64>,
    pub sequence_number: Option<i64>,
    /// Causal-link id; spans carrying one are root spans.
    pub link_id: Option<i64>,
    pub operator_name: Option<String>,
    pub layer: Option<i64>,
    pub iteration: Option<i64>,
}

impl CpuOpSpan {
    pub fn end(&self) -> Ns {
        self.ts + self.dur
    }

    pub fn is_root(&self) -> bool {
        self.link_id.is_some()
    }
}

/// Host-side dispatch call for a device record.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchRecord {
    pub ts: Ns,
    pub dur: Ns,
    pub name: String,
    pub correlation: i64,
    pub external_id: Option<i64>,
}

/// A kernel, memory-copy or memory-set execution on the device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSpan {
    pub kind: DeviceKind,
    pub ts: Ns,
    pub dur: Ns,
    pub name: String,
    pub correlation: i64,
    pub external_id: Option<i64>,
    pub device: Option<i64>,
    pub bytes: Option<i64>,
    pub launch: Option<LaunchRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnnotationKind {
    Layer,
    Iteration,
    OperatorName,
}

impl AnnotationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Layer => "layer",
            Self::Iteration => "iteration",
            Self::OperatorName => "operator-name",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AnnotationValue {
    Index(i64),
    Name(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnnotationSpan {
    pub kind: AnnotationKind,
    pub start: Ns,
    pub end: Ns,
    pub value: AnnotationValue,
}

/// Marks the point where a forward operator's identity flows to its backward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CausalLink {
    pub ts: Ns,
    pub id: i64,
    pub is_backward: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedTrace {
    pub cpu_ops: Vec<CpuOpSpan>,
    pub kernels: Vec<DeviceSpan>,
    pub memcpys: Vec<DeviceSpan>,
    pub memsets: Vec<DeviceSpan>,
    pub annotations: Vec<AnnotationSpan>,
    pub links: Vec<CausalLink>,
    pub launches: Vec<LaunchRecord>,
    /// Unrecognized categories and how many events each dropped.
    pub ignored: BTreeMap<String, usize>,
}

fn layer_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^Layer(\d+)$").expect("valid regex"))
}

fn iteration_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^Iteration(\d+)$").expect("valid regex"))
}

fn malformed(category: Category, reason: impl Into<String>) -> AnalysisError {
    AnalysisError::MalformedEvent {
        category: category.as_str().to_string(),
        reason: reason.into(),
    }
}

fn json_int(value: &Json) -> Option<i64> {
    match value {
        Json::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Json::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn int_arg(event: &RawEvent, key: &str) -> Option<i64> {
    event.args.get(key).and_then(json_int)
}

fn required_int_arg(event: &RawEvent, category: Category, key: &str) -> Result<i64> {
    int_arg(event, key).ok_or_else(|| malformed(category, format!("missing arg `{key}` on {}", event.name)))
}

fn timestamp(event: &RawEvent, category: Category) -> Result<Ns> {
    let ts = event
        .ts
        .as_ref()
        .ok_or_else(|| malformed(category, format!("missing ts on {}", event.name)))?;
    time::from_json(ts)
}

fn duration(event: &RawEvent, category: Category) -> Result<Ns> {
    let dur = event
        .dur
        .as_ref()
        .ok_or_else(|| malformed(category, format!("missing dur on {}", event.name)))?;
    time::from_json(dur)
}

fn parse_link(event: &RawEvent) -> Result<CausalLink> {
    let category = Category::FwdBwdLink;
    let id = event
        .id
        .as_ref()
        .and_then(json_int)
        .ok_or_else(|| malformed(category, "missing flow id"))?;
    Ok(CausalLink {
        ts: timestamp(event, category)?,
        id,
        is_backward: event.bp.is_some(),
    })
}

fn parse_cpu_op(event: &RawEvent) -> Result<CpuOpSpan> {
    let category = Category::CpuOp;
    let name = match event.args.get("Collective name").and_then(Json::as_str) {
        Some(collective) => format!("{}:{}", event.name, collective),
        None => event.name.clone(),
    };
    Ok(CpuOpSpan {
        ts: timestamp(event, category)?,
        dur: duration(event, category)?,
        name,
        external_id: Some(required_int_arg(event, category, "External id")?),
        sequence_number: int_arg(event, "Sequence number"),
        ..Default::default()
    })
}

fn parse_device_span(event: &RawEvent, category: Category, kind: DeviceKind) -> Result<DeviceSpan> {
    Ok(DeviceSpan {
        kind,
        ts: timestamp(event, category)?,
        dur: duration(event, category)?,
        name: event.name.clone(),
        correlation: required_int_arg(event, category, "correlation")?,
        external_id: int_arg(event, "External id"),
        device: int_arg(event, "device"),
        bytes: int_arg(event, "bytes"),
        launch: None,
    })
}

fn parse_launch(event: &RawEvent) -> Result<LaunchRecord> {
    let category = Category::LaunchRecord;
    Ok(LaunchRecord {
        ts: timestamp(event, category)?,
        dur: duration(event, category)?,
        name: event.name.clone(),
        correlation: required_int_arg(event, category, "correlation")?,
        external_id: int_arg(event, "External id"),
    })
}

/// Re-classifies a user annotation into a layer, iteration or operator-name span.
pub fn parse_annotation(event: &RawEvent) -> Result<AnnotationSpan> {
    let category = Category::UserAnnotation;
    let start = timestamp(event, category)?;
    let end = start + duration(event, category)?;
    let index = |caps: regex::Captures<'_>| -> Result<i64> {
        caps[1]
            .parse()
            .map_err(|_| malformed(category, format!("index overflow in {}", event.name)))
    };

    let (kind, value) = if let Some(caps) = layer_pattern().captures(&event.name) {
        (AnnotationKind::Layer, AnnotationValue::Index(index(caps)?))
    } else if let Some(caps) = iteration_pattern().captures(&event.name) {
        (AnnotationKind::Iteration, AnnotationValue::Index(index(caps)?))
    } else {
        (AnnotationKind::OperatorName, AnnotationValue::Name(event.name.clone()))
    };
    Ok(AnnotationSpan {
        kind,
        start,
        end,
        value,
    })
}

/// Dispatches every event to its category table.
pub fn parse_events(events: impl IntoIterator<Item = RawEvent>) -> Result<ParsedTrace> {
    let mut parsed = ParsedTrace::default();

    for event in events {
        let Some(cat) = event.cat.as_deref() else {
            continue;
        };
        let Some(category) = Category::from_trace(cat) else {
            *parsed.ignored.entry(cat.to_string()).or_default() += 1;
            continue;
        };

        match category {
            Category::FwdBwdLink => parsed.links.push(parse_link(&event)?),
            Category::CpuOp => parsed.cpu_ops.push(parse_cpu_op(&event)?),
            Category::Kernel => parsed
                .kernels
                .push(parse_device_span(&event, category, DeviceKind::Kernel)?),
            Category::UserAnnotation => parsed.annotations.push(parse_annotation(&event)?),
            Category::LaunchRecord => parsed.launches.push(parse_launch(&event)?),
            Category::MemoryCopy => parsed
                .memcpys
                .push(parse_device_span(&event, category, DeviceKind::Memcpy)?),
            Category::MemorySet => parsed
                .memsets
                .push(parse_device_span(&event, category, DeviceKind::Memset)?),
        }
    }

    for (cat, count) in &parsed.ignored {
        warn!("Ignoring cat: {} ({}x)", cat, count);
    }

    Ok(parsed)
}

pub fn parse_trace_str(json: &str) -> Result<ParsedTrace> {
    let file: TraceFile = serde_json::from_str(json)?;
    parse_events(file.trace_events)
}

pub fn parse_trace_file(path: &Path) -> Result<ParsedTrace> {
    info!("📖 Reading timestamp data from {}", path.display());
    let file = File::open(path).map_err(|e| AnalysisError::io(path.display().to_string(), e))?;
    let trace: TraceFile = serde_json::from_reader(BufReader::new(file))?;
    parse_events(trace.trace_events)
}
