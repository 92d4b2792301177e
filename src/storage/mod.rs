//! Task record store: persisted entities describing scheduled and one-off
//! jobs, with pluggable backends (in-memory, SQLite).
//!
//! The store is shared across processes; record-level locking (a uuid
//! token plus acquisition timestamp, taken via a conditional update) is the
//! sole mechanism preventing two drivers from running the same record
//! simultaneously. Locks older than the store's staleness threshold are
//! treated as abandoned and reclaimable.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use thiserror::Error;
use uuid::Uuid;

use crate::core::cron::CronExpression;
use crate::core::params::{RunOnceAction, TaskParams};
use crate::core::state::StateBag;
use crate::core::status::Status;
use crate::core::types::{SiteId, TaskId};

/// Default staleness threshold after which a lock is reclaimable.
pub const DEFAULT_STALE_LOCK_AGE: Duration = Duration::hours(1);

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested record was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// The record is locked by another driver.
    #[error("task {0} is locked by another process")]
    LockContention(TaskId),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Generic storage error.
    #[error("storage error: {0}")]
    Other(String),
}

/// Exclusivity marker on a task record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskLock {
    /// Token owned by the driver that acquired the lock.
    pub token: Uuid,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
}

impl TaskLock {
    /// Whether this lock is older than the staleness threshold and may be
    /// reclaimed. A crashed worker must not wedge a task permanently.
    pub fn is_stale(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        now - self.acquired_at > max_age
    }
}

/// A persisted task record.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    /// Unique identifier, assigned by the store on first save.
    pub id: TaskId,
    /// Owning site; None for global tasks.
    pub site_id: Option<SiteId>,
    /// Task-type key resolved through the registry.
    pub task_type: String,
    /// Five-field schedule; literal one-off fields when generated
    /// programmatically.
    pub cron_expression: String,
    /// Persisted parameters interpreted by the callback.
    pub params: TaskParams,
    /// Snapshot of the volatile state bag for `WillResume` records.
    pub resume_state: StateBag,
    /// Disabled records are never selected.
    pub enabled: bool,
    /// Last reported status.
    pub last_exit_code: Status,
    /// When the last run started.
    pub last_execution: Option<DateTime<Utc>>,
    /// When the last run ended.
    pub last_run_end: Option<DateTime<Utc>>,
    /// Next scheduled occurrence; only meaningful while enabled.
    pub next_execution: Option<DateTime<Utc>>,
    /// Ownership marker; None means unlocked.
    pub lock: Option<TaskLock>,
    /// Ordering hint among due tasks (higher runs first).
    pub priority: i64,
}

impl TaskRecord {
    /// Create a new unsaved record for the given task type.
    pub fn new(task_type: impl Into<String>) -> Self {
        Self {
            id: TaskId::unsaved(),
            site_id: None,
            task_type: task_type.into(),
            cron_expression: crate::core::cron::DEFAULT_EXPRESSION.to_string(),
            params: TaskParams::default(),
            resume_state: StateBag::new(),
            enabled: true,
            last_exit_code: Status::InitialSchedule,
            last_execution: None,
            last_run_end: None,
            next_execution: None,
            lock: None,
            priority: 0,
        }
    }

    /// Set the owning site.
    pub fn for_site(mut self, site_id: SiteId) -> Self {
        self.site_id = Some(site_id);
        self
    }

    /// Set the cron expression.
    pub fn with_cron(mut self, expression: impl Into<String>) -> Self {
        self.cron_expression = expression.into();
        self
    }

    /// Set the params.
    pub fn with_params(mut self, params: TaskParams) -> Self {
        self.params = params;
        self
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Set whether the record is enabled.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Parse the stored cron expression, degrading to the daily default
    /// when it is invalid.
    pub fn cron(&self) -> CronExpression {
        CronExpression::parse_or_default(&self.cron_expression)
    }

    /// Whether the record currently holds a live (non-stale) lock.
    pub fn is_locked(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        self.lock.is_some_and(|lock| !lock.is_stale(now, max_age))
    }

    /// Whether this record is due for execution at `now`. A record that
    /// yielded `WillResume` is always due; otherwise its next occurrence
    /// must have arrived.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return false;
        }
        if self.last_exit_code == Status::WillResume {
            return true;
        }
        self.next_execution.is_some_and(|next| next <= now)
    }

    /// Whether the record still needs a scheduling pass to compute its
    /// next occurrence.
    pub fn needs_scheduling(&self) -> bool {
        self.next_execution.is_none() && self.last_exit_code != Status::WillResume
    }
}

/// External collaborator interface to the shared task record store.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert or update a record. Unsaved records get an id assigned; the
    /// saved record is returned.
    async fn save(&self, record: TaskRecord) -> Result<TaskRecord, StorageError>;

    /// Get a record by id.
    async fn get(&self, id: TaskId) -> Result<TaskRecord, StorageError>;

    /// Delete a record by id.
    async fn delete(&self, id: TaskId) -> Result<(), StorageError>;

    /// List all records.
    async fn list(&self) -> Result<Vec<TaskRecord>, StorageError>;

    /// List records scoped to a site and task type.
    async fn list_for_site(
        &self,
        site_id: SiteId,
        task_type: &str,
    ) -> Result<Vec<TaskRecord>, StorageError>;

    /// Select up to `limit` candidate records: enabled, not live-locked,
    /// and either resumable, due, or still unscheduled. Ordered by
    /// priority descending, then id.
    async fn find_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, StorageError>;

    /// Acquire the record lock via a conditional update (compare-and-swap
    /// on the lock token and timestamp). Succeeds when the record is
    /// unlocked or its lock is stale; returns the new token.
    async fn try_lock(&self, id: TaskId, now: DateTime<Utc>) -> Result<Uuid, StorageError>;

    /// Release the lock if it is still held with `token`. Idempotent: a
    /// missing record or an already-reclaimed lock is not an error.
    async fn unlock(&self, id: TaskId, token: Uuid) -> Result<(), StorageError>;
}

/// Post-run hook: persist the terminal status of a run and apply the
/// record's `run_once` disposition.
///
/// This is the external collaborator the execution loop hands terminal
/// results to; the loop itself never deletes or disables records. Writes
/// the status and end timestamp, clears the resume snapshot, recomputes the
/// next occurrence from the cron expression in the given timezone, and on a
/// *successful* terminal run applies the disposition: `disable` flips
/// `enabled` off, `delete` removes the record (returning `None`).
pub async fn finalize_run<S: TaskStore + ?Sized>(
    store: &S,
    mut record: TaskRecord,
    status: Status,
    now: DateTime<Utc>,
    tz: Tz,
) -> Result<Option<TaskRecord>, StorageError> {
    record.last_exit_code = status;
    record.last_run_end = Some(now);
    record.resume_state = StateBag::new();
    record.next_execution = record.cron().next_after(now, tz);

    if status.is_success() {
        match record.params.run_once {
            Some(RunOnceAction::Delete) => {
                tracing::debug!(task_id = %record.id, "run-once task finished, deleting record");
                store.delete(record.id).await?;
                return Ok(None);
            }
            Some(RunOnceAction::Disable) => {
                tracing::debug!(task_id = %record.id, "run-once task finished, disabling record");
                record.enabled = false;
                record.next_execution = None;
            }
            None => {}
        }
    }

    let saved = store.save(record).await?;
    Ok(Some(saved))
}
