//! In-memory task store.
//!
//! Useful for tests and embedded single-process deployments. Lock
//! semantics mirror the SQLite backend: acquisition is a conditional
//! update that also reclaims stale locks.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{StorageError, TaskLock, TaskRecord, TaskStore, DEFAULT_STALE_LOCK_AGE};
use crate::core::status::Status;
use crate::core::types::{SiteId, TaskId};

/// In-memory storage backend.
pub struct MemoryStore {
    records: RwLock<HashMap<TaskId, TaskRecord>>,
    next_id: AtomicI64,
    stale_lock_age: Duration,
}

impl MemoryStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            stale_lock_age: DEFAULT_STALE_LOCK_AGE,
        }
    }

    /// Override the lock staleness threshold.
    pub fn with_stale_lock_age(mut self, age: Duration) -> Self {
        self.stale_lock_age = age;
        self
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn save(&self, mut record: TaskRecord) -> Result<TaskRecord, StorageError> {
        if !record.id.is_saved() {
            record.id = TaskId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        }
        self.records
            .write()
            .await
            .insert(record.id, record.clone());
        Ok(record)
    }

    async fn get(&self, id: TaskId) -> Result<TaskRecord, StorageError> {
        self.records
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("task: {}", id)))
    }

    async fn delete(&self, id: TaskId) -> Result<(), StorageError> {
        self.records
            .write()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(format!("task: {}", id)))
    }

    async fn list(&self) -> Result<Vec<TaskRecord>, StorageError> {
        let mut records: Vec<TaskRecord> = self.records.read().await.values().cloned().collect();
        records.sort_by_key(|r| r.id);
        Ok(records)
    }

    async fn list_for_site(
        &self,
        site_id: SiteId,
        task_type: &str,
    ) -> Result<Vec<TaskRecord>, StorageError> {
        let mut records: Vec<TaskRecord> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.site_id == Some(site_id) && r.task_type == task_type)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.id);
        Ok(records)
    }

    async fn find_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, StorageError> {
        let mut due: Vec<TaskRecord> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| {
                r.enabled
                    && !r.is_locked(now, self.stale_lock_age)
                    && (r.last_exit_code == Status::WillResume
                        || r.next_execution.is_none()
                        || r.next_execution.is_some_and(|next| next <= now))
            })
            .cloned()
            .collect();

        due.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        due.truncate(limit);
        Ok(due)
    }

    async fn try_lock(&self, id: TaskId, now: DateTime<Utc>) -> Result<Uuid, StorageError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(format!("task: {}", id)))?;

        if let Some(lock) = record.lock {
            if !lock.is_stale(now, self.stale_lock_age) {
                return Err(StorageError::LockContention(id));
            }
            tracing::warn!(task_id = %id, "reclaiming stale lock");
        }

        let token = Uuid::new_v4();
        record.lock = Some(TaskLock {
            token,
            acquired_at: now,
        });
        Ok(token)
    }

    async fn unlock(&self, id: TaskId, token: Uuid) -> Result<(), StorageError> {
        let mut records = self.records.write().await;
        if let Some(record) = records.get_mut(&id) {
            if record.lock.is_some_and(|lock| lock.token == token) {
                record.lock = None;
            }
        }
        Ok(())
    }
}
