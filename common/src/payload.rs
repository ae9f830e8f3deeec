use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Application value carried inside a frame.
///
/// Maps are ordered, so encoding a payload is deterministic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<Payload>),
    Map(BTreeMap<String, Payload>),
    /// Asks the server to tear down the sending connection and itself
    Shutdown,
}

/// What a [`Connection`](crate::connection::Connection) puts on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Packet {
    Data(Payload),
    /// No more payloads follow; the sender is closing
    Close,
}

impl Payload {
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Payload::Shutdown)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Payload::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Payload::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Payload::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Looks up `key` when this payload is a map.
    pub fn get(&self, key: &str) -> Option<&Payload> {
        match self {
            Payload::Map(map) => map.get(key),
            _ => None,
        }
    }

    /// Renders the payload as JSON.
    ///
    /// Bytes become an array of numbers and `Shutdown` becomes
    /// `{"shutdown": true}`; neither survives the trip back.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;

        match self {
            Payload::Null => Value::Null,
            Payload::Bool(b) => Value::Bool(*b),
            Payload::Int(n) => Value::from(*n),
            Payload::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Payload::String(s) => Value::String(s.clone()),
            Payload::Bytes(bytes) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
            Payload::List(items) => Value::Array(items.iter().map(Payload::to_json).collect()),
            Payload::Map(map) => Value::Object(
                map.iter()
                    .map(|(key, value)| (key.clone(), value.to_json()))
                    .collect(),
            ),
            Payload::Shutdown => serde_json::json!({ "shutdown": true }),
        }
    }
}

impl From<()> for Payload {
    fn from(_: ()) -> Self {
        Payload::Null
    }
}

impl From<bool> for Payload {
    fn from(value: bool) -> Self {
        Payload::Bool(value)
    }
}

impl From<i64> for Payload {
    fn from(value: i64) -> Self {
        Payload::Int(value)
    }
}

impl From<i32> for Payload {
    fn from(value: i32) -> Self {
        Payload::Int(value.into())
    }
}

impl From<u32> for Payload {
    fn from(value: u32) -> Self {
        Payload::Int(value.into())
    }
}

impl From<f64> for Payload {
    fn from(value: f64) -> Self {
        Payload::Float(value)
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Payload::String(value.to_string())
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Payload::String(value)
    }
}

impl<T: Into<Payload>> From<Vec<T>> for Payload {
    fn from(values: Vec<T>) -> Self {
        Payload::List(values.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Payload>> From<BTreeMap<String, T>> for Payload {
    fn from(map: BTreeMap<String, T>) -> Self {
        Payload::Map(map.into_iter().map(|(k, v)| (k, v.into())).collect())
    }
}

impl<T: Into<Payload>> From<Option<T>> for Payload {
    fn from(value: Option<T>) -> Self {
        value.map_or(Payload::Null, Into::into)
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;

        match value {
            Value::Null => Payload::Null,
            Value::Bool(b) => Payload::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Payload::Int(i),
                None => Payload::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => Payload::String(s),
            Value::Array(items) => Payload::List(items.into_iter().map(Payload::from).collect()),
            Value::Object(map) => Payload::Map(
                map.into_iter()
                    .map(|(key, value)| (key, Payload::from(value)))
                    .collect(),
            ),
        }
    }
}
