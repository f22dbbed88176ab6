use serde::{Deserialize, Serialize};

/// Typed value cell carried by a datapoint.
///
/// Only `Str`, `Integer` and `Float` are forwarded by the OMF emitter;
/// the remaining variants travel through the storage payload untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DatapointValue {
    Str(String),
    Integer(i64),
    Float(f64),
    Json(serde_json::Value),
    Array(Vec<DatapointValue>),
    Buffer(Vec<u8>),
}

impl DatapointValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            DatapointValue::Str(_) => "string",
            DatapointValue::Integer(_) => "integer",
            DatapointValue::Float(_) => "float",
            DatapointValue::Json(_) => "json",
            DatapointValue::Array(_) => "array",
            DatapointValue::Buffer(_) => "buffer",
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            DatapointValue::Integer(v) => Some(*v),
            DatapointValue::Float(v) => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DatapointValue::Integer(v) => Some(*v as f64),
            DatapointValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DatapointValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Convert the cell to a JSON value for the storage payload.
    ///
    /// Buffers are rendered as hex strings; they have no JSON counterpart.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            DatapointValue::Str(s) => serde_json::Value::String(s.clone()),
            DatapointValue::Integer(i) => serde_json::Value::from(*i),
            DatapointValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            DatapointValue::Json(v) => v.clone(),
            DatapointValue::Array(items) => {
                serde_json::Value::Array(items.iter().map(|v| v.to_json()).collect())
            }
            DatapointValue::Buffer(bytes) => {
                let mut hex = String::with_capacity(bytes.len() * 2);
                for b in bytes {
                    hex.push_str(&format!("{:02x}", b));
                }
                serde_json::Value::String(hex)
            }
        }
    }

    /// Build a cell from a JSON value, as seen when re-reading persisted
    /// rows on the north path.
    pub fn from_json(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::String(s) => DatapointValue::Str(s.clone()),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    DatapointValue::Integer(i)
                } else {
                    DatapointValue::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::Array(items) => {
                DatapointValue::Array(items.iter().map(DatapointValue::from_json).collect())
            }
            other => DatapointValue::Json(other.clone()),
        }
    }
}

impl std::fmt::Display for DatapointValue {
    /// Render a JSON literal suitable for direct emission into an OMF
    /// payload: strings quoted and escaped, numbers bare.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match serde_json::to_string(&self.to_json()) {
            Ok(s) => write!(f, "{}", s),
            Err(_) => write!(f, "null"),
        }
    }
}

/// A named value within a reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datapoint {
    pub name: String,
    pub value: DatapointValue,
}

impl Datapoint {
    pub fn new(name: impl Into<String>, value: DatapointValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}
