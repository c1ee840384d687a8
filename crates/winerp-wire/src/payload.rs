//! Structured `data` shapes carried by remote object messages.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// `data` of a `function_call` message: which method of which object to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    /// UUID of the remote object on the process that owns it.
    #[serde(rename = "__uuid__")]
    pub object: String,
    /// Method name.
    #[serde(rename = "__func__")]
    pub method: String,
    #[serde(rename = "__args__", default)]
    pub args: Vec<Value>,
    #[serde(rename = "__kwargs__", default)]
    pub kwargs: Map<String, Value>,
}

/// `data` of a message flagged `pseudo_object`: a snapshot of a remote object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectPayload {
    /// Type name of the original object.
    #[serde(rename = "__name__")]
    pub name: String,
    #[serde(rename = "__uuid__")]
    pub uuid: String,
    /// Plain-data fields.
    #[serde(rename = "__attr__", default)]
    pub attrs: Map<String, Value>,
    /// Callable method names.
    #[serde(rename = "__func__", default)]
    pub methods: BTreeMap<String, bool>,
    /// Expiry as unix milliseconds.
    #[serde(rename = "__expiry__", default, skip_serializing_if = "Option::is_none")]
    pub expires_at_ms: Option<i64>,
}
