//! Core identifier types for the task runner.
//!
//! These types provide type-safe identifiers for task records and the
//! remote sites they operate on.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a persisted task record.
///
/// A value of zero means the record has not been saved yet; the store
/// assigns a real id on first save.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(i64);

/// Unique identifier for a monitored site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SiteId(i64);

impl TaskId {
    /// Create a new TaskId from a raw integer.
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    /// Sentinel id for records that have not been persisted yet.
    pub fn unsaved() -> Self {
        Self(0)
    }

    /// Get the underlying integer value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }

    /// Whether this id has been assigned by the store.
    pub fn is_saved(&self) -> bool {
        self.0 != 0
    }
}

impl SiteId {
    /// Create a new SiteId from a raw integer.
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the underlying integer value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl From<i64> for TaskId {
    fn from(id: i64) -> Self {
        Self::new(id)
    }
}

impl From<i64> for SiteId {
    fn from(id: i64) -> Self {
        Self::new(id)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_roundtrip() {
        let id = TaskId::new(42);
        assert_eq!(id.as_i64(), 42);
        assert_eq!(format!("{}", id), "42");
    }

    #[test]
    fn test_unsaved_task_id() {
        let id = TaskId::unsaved();
        assert!(!id.is_saved());
        assert!(TaskId::new(7).is_saved());
    }

    #[test]
    fn test_site_id_equality() {
        let a = SiteId::new(1);
        let b = SiteId::new(1);
        let c = SiteId::new(2);

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_ids_are_hashable() {
        use std::collections::HashSet;

        let mut ids: HashSet<SiteId> = HashSet::new();
        ids.insert(SiteId::new(1));
        ids.insert(SiteId::new(2));
        ids.insert(SiteId::new(1)); // duplicate

        assert_eq!(ids.len(), 2);
    }
}
