//! Task registry: maps a task-type string to its callback.
//!
//! The registry is built once at process startup and is read-only
//! afterwards. It is passed explicitly to drivers rather than living in
//! ambient global state.

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::core::callback::Callback;

/// Errors that can occur when resolving a callback.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No callback is registered for the requested task type.
    #[error("no callback registered for task type: {0}")]
    NotFound(String),

    /// A task type was registered twice during construction.
    #[error("duplicate callback registration for task type: {0}")]
    Duplicate(String),
}

/// Read-only mapping from task type to callback instance.
pub struct TaskRegistry {
    callbacks: HashMap<String, Arc<dyn Callback>>,
}

impl TaskRegistry {
    /// Start building a registry.
    pub fn builder() -> TaskRegistryBuilder {
        TaskRegistryBuilder {
            callbacks: HashMap::new(),
            duplicate: None,
        }
    }

    /// Resolve a callback by task type.
    pub fn resolve(&self, task_type: &str) -> Result<Arc<dyn Callback>, RegistryError> {
        self.callbacks
            .get(task_type)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(task_type.to_string()))
    }

    /// Check whether a task type is registered.
    pub fn contains(&self, task_type: &str) -> bool {
        self.callbacks.contains_key(task_type)
    }

    /// All registered task types, sorted for stable display.
    pub fn task_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.callbacks.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Number of registered callbacks.
    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    /// Check whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }
}

/// Builder for [`TaskRegistry`]. Registration happens once at startup; the
/// finished registry cannot be mutated.
pub struct TaskRegistryBuilder {
    callbacks: HashMap<String, Arc<dyn Callback>>,
    duplicate: Option<String>,
}

impl TaskRegistryBuilder {
    /// Register a callback under its own task type.
    pub fn register(mut self, callback: Arc<dyn Callback>) -> Self {
        let task_type = callback.task_type().to_string();
        if self.callbacks.insert(task_type.clone(), callback).is_some() {
            self.duplicate.get_or_insert(task_type);
        }
        self
    }

    /// Finish building. Fails if any task type was registered twice.
    pub fn build(self) -> Result<TaskRegistry, RegistryError> {
        if let Some(task_type) = self.duplicate {
            return Err(RegistryError::Duplicate(task_type));
        }
        Ok(TaskRegistry {
            callbacks: self.callbacks,
        })
    }
}
