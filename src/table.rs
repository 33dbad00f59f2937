//! Column-addressable rows and the grouped tables produced by aggregation.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{AnalysisError, Result};

/// A single cell. `Null` is a missing value, distinct from a missing column.
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Int(i64),
    Float(f64),
    Str(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Float(v) if v.fract() == 0.0 && v.is_finite() => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// `self - other`, staying integral when both sides are.
    pub fn sub(&self, other: &Value) -> Value {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Value::Int(a - b),
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => Value::Float(a - b),
                _ => Value::Null,
            },
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Int(_) | Value::Float(_) => 0,
            Value::Str(_) => 1,
            Value::Null => 2,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

// Numbers sort before strings, nulls sort last.
impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Str(a), Value::Str(b)) => a.cmp(b),
            (Value::Null, Value::Null) => Ordering::Equal,
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => a.total_cmp(&b),
                _ => self.rank().cmp(&other.rank()),
            },
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "-"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v:.3}"),
            Value::Str(s) => write!(f, "{s}"),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_none(),
            Value::Int(v) => serializer.serialize_i64(*v),
            Value::Float(v) => serializer.serialize_f64(*v),
            Value::Str(s) => serializer.serialize_str(s),
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = serde_json::Value::deserialize(deserializer)?;
        Ok(match raw {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => n.as_f64().map(Value::Float).unwrap_or(Value::Null),
            },
            serde_json::Value::String(s) => Value::Str(s),
            serde_json::Value::Bool(b) => Value::Int(b as i64),
            other => Value::Str(other.to_string()),
        })
    }
}

/// Anything whose fields can be looked up by column name.
pub trait Columnar {
    /// `None` when the column does not exist on this row.
    fn column(&self, name: &str) -> Option<Value>;

    fn column_names(&self) -> Vec<String>;
}

/// Fails with a schema violation naming every column absent from `rows`.
pub fn require_columns<R: Columnar>(rows: &[R], columns: &[&str], context: &str) -> Result<()> {
    if rows.is_empty() {
        return Ok(());
    }
    let present: BTreeSet<String> = rows.iter().flat_map(|r| r.column_names()).collect();
    let missing: Vec<String> = columns
        .iter()
        .filter(|c| !present.contains(**c))
        .map(|c| c.to_string())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(AnalysisError::missing_columns(context, missing))
    }
}

/// One output row of an aggregation or a downstream analysis.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupedRow {
    pub cells: BTreeMap<String, Value>,
}

impl GroupedRow {
    pub fn get(&self, column: &str) -> &Value {
        static NULL: Value = Value::Null;
        self.cells.get(column).unwrap_or(&NULL)
    }

    pub fn int(&self, column: &str) -> Option<i64> {
        self.get(column).as_i64()
    }

    pub fn float(&self, column: &str) -> Option<f64> {
        self.get(column).as_f64()
    }

    pub fn str(&self, column: &str) -> Option<&str> {
        self.get(column).as_str()
    }

    pub fn set(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        self.cells.insert(column.into(), value.into());
    }
}

impl Columnar for GroupedRow {
    fn column(&self, name: &str) -> Option<Value> {
        self.cells.get(name).cloned()
    }

    fn column_names(&self) -> Vec<String> {
        self.cells.keys().cloned().collect()
    }
}

/// Rows plus the display order of their columns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupedTable {
    pub columns: Vec<String>,
    pub rows: Vec<GroupedRow>,
}

impl GroupedTable {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn add_column(&mut self, column: &str) {
        if !self.columns.iter().any(|c| c == column) {
            self.columns.push(column.to_string());
        }
    }

    /// Stable sort on one column; ties keep their current order.
    pub fn sort_by_column(&mut self, column: &str) {
        self.rows.sort_by(|a, b| a.get(column).cmp(b.get(column)));
    }

    pub fn require(&self, columns: &[&str], context: &str) -> Result<()> {
        let missing: Vec<String> = columns
            .iter()
            .filter(|c| !self.columns.iter().any(|have| have == *c))
            .map(|c| c.to_string())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(AnalysisError::missing_columns(context, missing))
        }
    }

    /// Renders at most `limit` rows.
    pub fn display_table(&self, limit: usize) -> String {
        use tabled::builder::Builder;

        let mut builder = Builder::default();
        builder.push_record(self.columns.iter().cloned());
        for row in self.rows.iter().take(limit) {
            builder.push_record(self.columns.iter().map(|c| row.get(c).to_string()));
        }
        let mut rendered = builder.build().to_string();
        if self.rows.len() > limit {
            rendered.push_str(&format!("\n... {} more rows", self.rows.len() - limit));
        }
        rendered
    }
}
