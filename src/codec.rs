//! Type-preserving value codec.
//!
//! Values are encoded to self-describing JSON text. Kinds that plain JSON
//! cannot express carry a reserved `$type` discriminant naming the kind;
//! plain booleans, finite numbers, strings, arrays, and objects encode
//! untagged. Decoding inverts the encoding exactly and is *total* on
//! strings: any text that fails to parse, and any tagged mapping with a
//! malformed payload, decodes leniently (raw string or raw mapping) rather
//! than erroring.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use num_bigint::BigInt;
use serde_json::{Map, Number, json};
use tracing::warn;

use crate::value::{TypedArrayKind, Value};

/// Reserved discriminant field on tagged encodings.
pub const TYPE_FIELD: &str = "$type";

/// Encode a value to its wire text.
#[must_use]
pub fn encode(value: &Value) -> String {
    to_json(value).to_string()
}

/// Decode wire text back into a value. Total: unparseable text comes back
/// as a raw string value.
#[must_use]
pub fn decode(text: &str) -> Value {
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(json) => from_json(&json),
        Err(_) => Value::String(text.to_string()),
    }
}

/// Decode one stored entry, logging when the lenient tail kicks in. Used by
/// the backends' streaming paths, which must not abort on a bad row.
#[must_use]
pub fn decode_entry(key: &str, text: &str) -> Value {
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(json) => from_json(&json),
        Err(err) => {
            warn!(key, %err, "stored value is not valid JSON; yielding raw text");
            Value::String(text.to_string())
        }
    }
}

/// Encode a value into a JSON tree (the parsed form of the wire text).
#[must_use]
pub fn to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => json!({ "$type": "null" }),
        Value::Undefined => json!({ "$type": "undefined" }),
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Number(n) => {
            if n.is_nan() {
                json!({ "$type": "NaN" })
            } else if n.is_infinite() {
                if *n > 0.0 {
                    json!({ "$type": "Infinity" })
                } else {
                    json!({ "$type": "-Infinity" })
                }
            } else {
                number_to_json(*n)
            }
        }
        Value::String(s) => serde_json::Value::String(s.clone()),
        Value::Bytes(bytes) => json!({ "$type": "Buffer", "value": bytes }),
        Value::DataView(bytes) => json!({ "$type": "DataView", "value": bytes }),
        Value::BigInt(n) => json!({ "$type": "BigInt", "value": n.to_string() }),
        Value::Date(instant) => {
            json!({ "$type": "Date", "value": instant.to_rfc3339() })
        }
        Value::Regex { source, flags } => {
            json!({ "$type": "RegExp", "source": source, "flags": flags })
        }
        Value::Error {
            name,
            message,
            stack,
        } => {
            let mut fields = Map::new();
            fields.insert(TYPE_FIELD.to_string(), json!("Error"));
            fields.insert("name".to_string(), json!(name));
            fields.insert("message".to_string(), json!(message));
            if let Some(stack) = stack {
                fields.insert("stack".to_string(), json!(stack));
            }
            serde_json::Value::Object(fields)
        }
        Value::Array(items) => serde_json::Value::Array(items.iter().map(to_json).collect()),
        Value::Object(fields) => {
            let mut out = Map::new();
            for (key, item) in fields {
                out.insert(key.clone(), to_json(item));
            }
            serde_json::Value::Object(out)
        }
        Value::Set(items) => {
            json!({ "$type": "Set", "value": items.iter().map(to_json).collect::<Vec<_>>() })
        }
        Value::Map(entries) => {
            let pairs: Vec<serde_json::Value> = entries
                .iter()
                .map(|(k, v)| serde_json::Value::Array(vec![to_json(k), to_json(v)]))
                .collect();
            json!({ "$type": "Map", "value": pairs })
        }
        Value::TypedArray { kind, data } => {
            json!({ "$type": "TypedArray", "arrayType": kind.as_str(), "value": data })
        }
    }
}

/// Decode a JSON tree into a value, recognizing `$type` tags.
#[must_use]
pub fn from_json(json: &serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
        serde_json::Value::String(s) => Value::String(s.clone()),
        serde_json::Value::Array(items) => Value::Array(items.iter().map(from_json).collect()),
        serde_json::Value::Object(fields) => {
            if let Some(serde_json::Value::String(tag)) = fields.get(TYPE_FIELD) {
                if let Some(value) = decode_tagged(tag, fields) {
                    return value;
                }
            }
            // Untagged, unrecognized tag, or malformed payload: keep the
            // mapping as-is (lenient decode).
            let mut out = BTreeMap::new();
            for (key, item) in fields {
                out.insert(key.clone(), from_json(item));
            }
            Value::Object(out)
        }
    }
}

fn decode_tagged(tag: &str, fields: &Map<String, serde_json::Value>) -> Option<Value> {
    match tag {
        "null" => Some(Value::Null),
        "undefined" => Some(Value::Undefined),
        "NaN" => Some(Value::Number(f64::NAN)),
        "Infinity" => Some(Value::Number(f64::INFINITY)),
        "-Infinity" => Some(Value::Number(f64::NEG_INFINITY)),
        "Date" => {
            let text = fields.get("value")?.as_str()?;
            let instant = DateTime::parse_from_rfc3339(text).ok()?;
            Some(Value::Date(instant.with_timezone(&Utc)))
        }
        "RegExp" => {
            let source = fields.get("source")?.as_str()?.to_string();
            let flags = fields
                .get("flags")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default()
                .to_string();
            Some(Value::Regex { source, flags })
        }
        "BigInt" => {
            let digits = fields.get("value")?.as_str()?;
            let n: BigInt = digits.parse().ok()?;
            Some(Value::BigInt(n))
        }
        "Buffer" => Some(Value::Bytes(decode_byte_array(fields.get("value")?)?)),
        "DataView" => Some(Value::DataView(decode_byte_array(fields.get("value")?)?)),
        "Set" => {
            let items = fields.get("value")?.as_array()?;
            Some(Value::Set(items.iter().map(from_json).collect()))
        }
        "Map" => {
            let pairs = fields.get("value")?.as_array()?;
            let mut entries = Vec::with_capacity(pairs.len());
            for pair in pairs {
                let pair = pair.as_array()?;
                if pair.len() != 2 {
                    return None;
                }
                entries.push((from_json(pair.first()?), from_json(pair.get(1)?)));
            }
            Some(Value::Map(entries))
        }
        "TypedArray" => {
            let kind = TypedArrayKind::from_str(fields.get("arrayType")?.as_str()?)?;
            let data = fields
                .get("value")?
                .as_array()?
                .iter()
                .map(serde_json::Value::as_f64)
                .collect::<Option<Vec<f64>>>()?;
            Some(Value::TypedArray { kind, data })
        }
        "Error" => {
            let name = fields.get("name")?.as_str()?.to_string();
            let message = fields.get("message")?.as_str()?.to_string();
            let stack = fields
                .get("stack")
                .and_then(serde_json::Value::as_str)
                .map(ToString::to_string);
            Some(Value::Error {
                name,
                message,
                stack,
            })
        }
        _ => None,
    }
}

fn decode_byte_array(json: &serde_json::Value) -> Option<Vec<u8>> {
    json.as_array()?
        .iter()
        .map(|item| u8::try_from(item.as_u64()?).ok())
        .collect()
}

fn number_to_json(n: f64) -> serde_json::Value {
    // Keep integral values as JSON integers so files stay readable.
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        serde_json::Value::Number(Number::from(n as i64))
    } else {
        Number::from_f64(n).map_or(serde_json::Value::Null, serde_json::Value::Number)
    }
}
