//! Wire frame types for the newline-delimited JSON protocol (§4.2, §6).
//!
//! Each line on the wire is one JSON object. [`Request`] covers the union
//! of fields any action might carry; unused fields for a given action are
//! simply `None`. Responses are built ad hoc as [`serde_json::Value`]
//! since their shape varies per action — see [`success`] and [`failure`].

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::BrokerError;

/// A parsed request frame. Fields not relevant to `action` are `None`.
#[derive(Debug, Deserialize)]
pub struct Request {
    pub action: String,
    pub key: Option<String>,
    pub value: Option<Value>,
    pub ttl: Option<i64>,
    pub compressed: Option<bool>,
    #[serde(rename = "beforeSize")]
    pub before_size: Option<u64>,
    #[serde(rename = "afterSize")]
    pub after_size: Option<u64>,
    #[serde(rename = "workerId")]
    pub worker_id: Option<String>,
}

/// Build a success response, merging `fields` into `{"ok":true}`.
pub fn success(fields: Map<String, Value>) -> Value {
    let mut map = fields;
    map.insert("ok".to_string(), Value::Bool(true));
    Value::Object(map)
}

/// Build a success response with no extra fields.
pub fn ok() -> Value {
    success(Map::new())
}

/// Build a failure response carrying the error's wire token.
pub fn failure(error: BrokerError) -> Value {
    let mut map = Map::new();
    map.insert("ok".to_string(), Value::Bool(false));
    map.insert("error".to_string(), Value::String(error.token().to_string()));
    Value::Object(map)
}
