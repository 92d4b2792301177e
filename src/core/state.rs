//! Volatile per-run state bag.
//!
//! A [`StateBag`] carries scratch state between invocations of the same
//! logical run: cursor positions, batch offsets, remote backup ids. It is
//! not the task's permanent configuration: the driver seeds it from caller
//! parameters on the first invocation and round-trips the mutated bag on
//! every resume. The bag is owned by a single in-flight run chain and is
//! never shared across records or processes; for cross-process resumes the
//! driver persists a JSON snapshot on the task record.

use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors that can occur when reading or writing the state bag.
#[derive(Debug, Error)]
pub enum StateError {
    /// Key was not found in the bag.
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// Failed to deserialize a value from the bag.
    #[error("deserialization error for key '{key}': {message}")]
    Deserialization { key: String, message: String },

    /// Failed to serialize a value into the bag.
    #[error("serialization error for key '{key}': {message}")]
    Serialization { key: String, message: String },
}

/// JSON-backed key/value scratch state for one resumable run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateBag {
    inner: Map<String, Value>,
}

impl StateBag {
    /// Create a new empty state bag.
    pub fn new() -> Self {
        Self { inner: Map::new() }
    }

    /// Build a bag from a JSON object value.
    ///
    /// Non-object values produce an empty bag; a corrupt snapshot must not
    /// prevent a run from starting over.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => Self { inner: map },
            _ => Self::new(),
        }
    }

    /// Snapshot the bag as a JSON object value for persistence.
    pub fn to_value(&self) -> Value {
        Value::Object(self.inner.clone())
    }

    /// Get a typed value by key.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, StateError> {
        let value = self
            .inner
            .get(key)
            .ok_or_else(|| StateError::KeyNotFound(key.to_string()))?;
        serde_json::from_value(value.clone()).map_err(|e| StateError::Deserialization {
            key: key.to_string(),
            message: e.to_string(),
        })
    }

    /// Get a typed value by key, falling back to a default when the key is
    /// absent or the stored value does not decode.
    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.inner
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or(default)
    }

    /// Write a typed value into the bag.
    pub fn set<T: Serialize>(&mut self, key: &str, value: T) -> Result<(), StateError> {
        let json = serde_json::to_value(value).map_err(|e| StateError::Serialization {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        self.inner.insert(key.to_string(), json);
        Ok(())
    }

    /// Remove a key from the bag, returning its raw value if present.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.inner.remove(key)
    }

    /// Check whether a key exists.
    pub fn contains(&self, key: &str) -> bool {
        self.inner.contains_key(key)
    }

    /// Number of entries in the bag.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Check whether the bag is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// All keys currently present.
    pub fn keys(&self) -> Vec<String> {
        self.inner.keys().cloned().collect()
    }
}

impl From<Map<String, Value>> for StateBag {
    fn from(inner: Map<String, Value>) -> Self {
        Self { inner }
    }
}
