//! The structured value model.
//!
//! A [`Value`] is an owned tree covering every scalar and container kind the
//! store round-trips with full type fidelity: temporal instants, regexes,
//! byte buffers, big integers, ordered sets, mappings, typed numeric arrays,
//! and error descriptors, alongside the plain JSON kinds.
//!
//! Because the tree is owned, cyclic references are unrepresentable and no
//! cycle detection is needed at encode time.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use num_bigint::BigInt;

/// Element kind of a typed numeric array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypedArrayKind {
    Int8,
    Uint8,
    Uint8Clamped,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Float32,
    Float64,
}

impl TypedArrayKind {
    /// Wire name of the element kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Int8 => "Int8Array",
            Self::Uint8 => "Uint8Array",
            Self::Uint8Clamped => "Uint8ClampedArray",
            Self::Int16 => "Int16Array",
            Self::Uint16 => "Uint16Array",
            Self::Int32 => "Int32Array",
            Self::Uint32 => "Uint32Array",
            Self::Float32 => "Float32Array",
            Self::Float64 => "Float64Array",
        }
    }

    /// Parse a wire name back into a kind.
    #[must_use]
    pub fn from_str(name: &str) -> Option<Self> {
        Some(match name {
            "Int8Array" => Self::Int8,
            "Uint8Array" => Self::Uint8,
            "Uint8ClampedArray" => Self::Uint8Clamped,
            "Int16Array" => Self::Int16,
            "Uint16Array" => Self::Uint16,
            "Int32Array" => Self::Int32,
            "Uint32Array" => Self::Uint32,
            "Float32Array" => Self::Float32,
            "Float64Array" => Self::Float64,
            _ => return None,
        })
    }

    /// Bytes per element, used by the size estimator.
    #[must_use]
    pub fn element_size(self) -> usize {
        match self {
            Self::Int8 | Self::Uint8 | Self::Uint8Clamped => 1,
            Self::Int16 | Self::Uint16 => 2,
            Self::Int32 | Self::Uint32 | Self::Float32 => 4,
            Self::Float64 => 8,
        }
    }
}

/// A structured datum stored under a key.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    /// Distinct from `Null`: an explicitly absent value. Rejected by value
    /// validation at the top level but representable inside containers.
    Undefined,
    Bool(bool),
    /// Any numeric value, including NaN and the infinities.
    Number(f64),
    String(String),
    /// Byte buffer.
    Bytes(Vec<u8>),
    /// Byte-slice view, kept distinct from `Bytes` for round-trip fidelity.
    DataView(Vec<u8>),
    /// Arbitrary-precision integer.
    BigInt(BigInt),
    /// Temporal instant.
    Date(DateTime<Utc>),
    /// Regex with source and flags, stored uncompiled.
    Regex { source: String, flags: String },
    /// Error descriptor.
    Error {
        name: String,
        message: String,
        stack: Option<String>,
    },
    Array(Vec<Value>),
    /// String-keyed mapping with deterministic iteration order.
    Object(BTreeMap<String, Value>),
    /// Ordered set; insertion order is preserved.
    Set(Vec<Value>),
    /// Mapping that permits non-string keys; insertion order is preserved.
    Map(Vec<(Value, Value)>),
    /// Typed numeric array with a declared element kind.
    TypedArray { kind: TypedArrayKind, data: Vec<f64> },
}

impl Value {
    /// Build an object value from an iterator of fields.
    pub fn object<I, K>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Self::Object(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    #[must_use]
    pub fn is_undefined(&self) -> bool {
        matches!(self, Self::Undefined)
    }

    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Object(fields) => Some(fields),
            _ => None,
        }
    }

    /// Resolve a dotted field path (`"a.b.c"`). Returns `None` when any
    /// intermediate step is missing or not an object.
    #[must_use]
    pub fn resolve_path(&self, path: &str) -> Option<&Value> {
        let mut current = self;
        for segment in path.split('.') {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    /// String coercion used by the `contains` / `startsWith` / `endsWith`
    /// filter operators.
    #[must_use]
    pub fn coerce_string(&self) -> String {
        match self {
            Self::String(s) => s.clone(),
            Self::Null => "null".to_string(),
            Self::Undefined => "undefined".to_string(),
            Self::Bool(b) => b.to_string(),
            Self::Number(n) => format_number(*n),
            Self::BigInt(n) => n.to_string(),
            Self::Date(d) => d.to_rfc3339(),
            Self::Regex { source, flags } => format!("/{source}/{flags}"),
            Self::Error { name, message, .. } => format!("{name}: {message}"),
            other => crate::codec::encode(other),
        }
    }
}

/// Render a float the way the wire form does: integral values without a
/// trailing `.0`.
#[must_use]
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

/// Ordering across comparable value kinds. Returns `None` for mixed or
/// incomparable kinds, which filter operators treat as a non-match.
#[must_use]
pub fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.partial_cmp(y),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Date(x), Value::Date(y)) => Some(x.cmp(y)),
        (Value::BigInt(x), Value::BigInt(y)) => Some(x.cmp(y)),
        (Value::BigInt(x), Value::Number(y)) => {
            let approx: f64 = x.to_string().parse().ok()?;
            approx.partial_cmp(y)
        }
        (Value::Number(x), Value::BigInt(y)) => {
            let approx: f64 = y.to_string().parse().ok()?;
            x.partial_cmp(&approx)
        }
        _ => None,
    }
}

const NODE_OVERHEAD: usize = 24;
const MISSED_FIELD_OVERHEAD: usize = 32;
const MAX_ESTIMATE_DEPTH: usize = 10;
const MAX_SAMPLED_ELEMENTS: usize = 100;
const MAX_SAMPLED_FIELDS: usize = 50;

/// Deterministic, traversal-bounded deep-size estimate in bytes.
///
/// Depth is capped at 10; arrays sample at most 100 elements and extrapolate
/// from the sampled average; objects walk at most 50 fields and charge a
/// fixed overhead for each field past the cap.
#[must_use]
pub fn estimate_size(value: &Value) -> usize {
    estimate_at(value, 0)
}

fn estimate_at(value: &Value, depth: usize) -> usize {
    if depth >= MAX_ESTIMATE_DEPTH {
        return NODE_OVERHEAD;
    }
    match value {
        Value::Null | Value::Undefined | Value::Bool(_) | Value::Number(_) => NODE_OVERHEAD,
        Value::String(s) => NODE_OVERHEAD + s.len(),
        Value::Bytes(b) | Value::DataView(b) => NODE_OVERHEAD + b.len(),
        Value::BigInt(n) => NODE_OVERHEAD + (n.bits() as usize).div_ceil(8),
        Value::Date(_) => NODE_OVERHEAD + 8,
        Value::Regex { source, flags } => NODE_OVERHEAD + source.len() + flags.len(),
        Value::Error {
            name,
            message,
            stack,
        } => NODE_OVERHEAD + name.len() + message.len() + stack.as_ref().map_or(0, String::len),
        Value::TypedArray { kind, data } => NODE_OVERHEAD + data.len() * kind.element_size(),
        Value::Array(items) | Value::Set(items) => {
            let sampled: usize = items
                .iter()
                .take(MAX_SAMPLED_ELEMENTS)
                .map(|item| estimate_at(item, depth + 1))
                .sum();
            let counted = items.len().min(MAX_SAMPLED_ELEMENTS);
            let extrapolated = if counted > 0 {
                (items.len() - counted) * (sampled / counted)
            } else {
                0
            };
            NODE_OVERHEAD + sampled + extrapolated
        }
        Value::Object(fields) => {
            let sampled: usize = fields
                .iter()
                .take(MAX_SAMPLED_FIELDS)
                .map(|(key, item)| key.len() + estimate_at(item, depth + 1))
                .sum();
            let missed = fields.len().saturating_sub(MAX_SAMPLED_FIELDS);
            NODE_OVERHEAD + sampled + missed * MISSED_FIELD_OVERHEAD
        }
        Value::Map(entries) => {
            let sampled: usize = entries
                .iter()
                .take(MAX_SAMPLED_FIELDS)
                .map(|(key, item)| estimate_at(key, depth + 1) + estimate_at(item, depth + 1))
                .sum();
            let missed = entries.len().saturating_sub(MAX_SAMPLED_FIELDS);
            NODE_OVERHEAD + sampled + missed * MISSED_FIELD_OVERHEAD
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Number(n as f64)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Self::Number(f64::from(n))
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Self::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::Array(items)
    }
}
