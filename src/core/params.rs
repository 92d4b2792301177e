//! Task parameter envelope.
//!
//! Params are the persisted, per-record configuration interpreted by the
//! owning callback, distinct from the volatile state bag. The envelope
//! types the two system markers that distinguish system-generated one-off
//! jobs from user-authored recurring schedules; everything else is an
//! opaque payload each callback decodes into its own typed struct.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

/// Disposition applied to a run-once record after it completes
/// successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOnceAction {
    /// Keep the record but set `enabled = false`.
    Disable,
    /// Remove the record entirely.
    Delete,
}

/// Persisted task parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskParams {
    /// Marks a system-generated run-once record and names its
    /// post-completion disposition. Absent on user-authored schedules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_once: Option<RunOnceAction>,

    /// Marks a record created by the enqueue helper.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub enqueued: bool,

    /// Callback-specific payload, stored inline in the same JSON object.
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl TaskParams {
    /// Create an empty parameter envelope.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the run-once disposition.
    pub fn with_run_once(mut self, action: RunOnceAction) -> Self {
        self.run_once = Some(action);
        self
    }

    /// Set the enqueued marker.
    pub fn with_enqueued(mut self, enqueued: bool) -> Self {
        self.enqueued = enqueued;
        self
    }

    /// Add a payload value.
    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Decode a typed payload value.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.payload
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Decode the whole payload into a typed struct.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.payload.clone()))
    }

    /// Encode a typed struct as the payload, preserving the markers.
    pub fn encode_payload<T: Serialize>(mut self, payload: &T) -> Result<Self, serde_json::Error> {
        match serde_json::to_value(payload)? {
            Value::Object(map) => {
                self.payload = map;
                Ok(self)
            }
            other => Err(serde::ser::Error::custom(format!(
                "payload must serialize to an object, got {}",
                other
            ))),
        }
    }

    /// Whether this record was generated by the enqueue helper as a
    /// run-once job. Used by the de-duplication predicate.
    pub fn is_system_one_off(&self) -> bool {
        self.run_once.is_some() && self.enqueued
    }

    /// Serialize to the persisted JSON form.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Map::new()))
    }

    /// Deserialize from the persisted JSON form. Corrupt params decay to an
    /// empty envelope rather than wedging the record.
    pub fn from_value(value: &Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }
}
