//! Enqueue-and-deduplicate helper for system-generated one-off tasks.
//!
//! "Run this backup now" from the UI becomes a one-off record scheduled one
//! minute out. Repeated requests for the same site and task type reuse a
//! finished system record instead of piling up new rows; a record that is
//! still pending (scheduled, running, or resuming) blocks a second enqueue.

use chrono::{DateTime, Timelike, Utc};
use thiserror::Error;

use crate::core::cron::{resolve_timezone, CronExpression};
use crate::core::params::{RunOnceAction, TaskParams};
use crate::core::state::StateBag;
use crate::core::status::Status;
use crate::core::types::SiteId;
use crate::storage::{StorageError, TaskRecord, TaskStore};

/// Errors raised by the enqueue helper.
#[derive(Debug, Error)]
pub enum EnqueueError {
    /// Storage operation failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// A request to enqueue a one-off run.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    /// Owning site.
    pub site_id: SiteId,
    /// Task type to run.
    pub task_type: String,
    /// Callback-specific payload.
    pub params: TaskParams,
    /// Disposition after a successful run.
    pub run_once: RunOnceAction,
    /// Ordering hint among due tasks.
    pub priority: i64,
}

impl EnqueueRequest {
    /// Create a request with the default `disable` disposition.
    pub fn new(site_id: SiteId, task_type: impl Into<String>) -> Self {
        Self {
            site_id,
            task_type: task_type.into(),
            params: TaskParams::default(),
            run_once: RunOnceAction::Disable,
            priority: 0,
        }
    }

    /// Set the callback payload.
    pub fn with_params(mut self, params: TaskParams) -> Self {
        self.params = params;
        self
    }

    /// Set the post-run disposition.
    pub fn with_run_once(mut self, action: RunOnceAction) -> Self {
        self.run_once = action;
        self
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }
}

/// Whether a finished system one-off may be recycled for a new request.
///
/// A record still pending (scheduled, running, or resuming) is never
/// reused: the request is already covered. Only records carrying both
/// system markers qualify, so user-authored schedules are left alone.
fn is_reusable(record: &TaskRecord, now: DateTime<Utc>) -> bool {
    if record.last_exit_code.is_pending() {
        return false;
    }
    if !record.params.is_system_one_off() {
        return false;
    }
    record.last_execution.map_or(true, |t| t <= now)
}

/// Enqueue a one-off run of `task_type` for a site, reusing a finished
/// system record when one exists.
///
/// The run is scheduled one minute from `now`, truncated to the whole
/// minute, in the given timezone (invalid names silently fall back to
/// UTC). Returns the saved record.
pub async fn enqueue_one_off<S: TaskStore + ?Sized>(
    store: &S,
    request: EnqueueRequest,
    timezone: &str,
    now: DateTime<Utc>,
) -> Result<TaskRecord, EnqueueError> {
    let existing = store
        .list_for_site(request.site_id, &request.task_type)
        .await?;

    // A pending system one-off already covers the request.
    if let Some(record) = existing
        .iter()
        .find(|r| r.params.is_system_one_off() && r.last_exit_code.is_pending())
    {
        tracing::debug!(
            task_id = %record.id,
            site_id = %request.site_id,
            task_type = request.task_type,
            "one-off already enqueued"
        );
        return Ok(record.clone());
    }

    let mut record = existing
        .into_iter()
        .find(|r| is_reusable(r, now))
        .unwrap_or_else(|| {
            TaskRecord::new(request.task_type.clone()).for_site(request.site_id)
        });

    let tz = resolve_timezone(timezone);
    let run_at = (now + chrono::Duration::minutes(1))
        .with_timezone(&tz)
        .with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or_else(|| (now + chrono::Duration::minutes(1)).with_timezone(&tz));

    record.cron_expression = CronExpression::one_off(&run_at).expression().to_string();
    record.params = request
        .params
        .with_run_once(request.run_once)
        .with_enqueued(true);
    record.resume_state = StateBag::new();
    record.enabled = true;
    record.last_exit_code = Status::InitialSchedule;
    record.last_execution = None;
    record.last_run_end = None;
    record.next_execution = Some(run_at.with_timezone(&Utc));
    record.lock = None;
    record.priority = request.priority;

    let saved = store.save(record).await?;
    tracing::info!(
        task_id = %saved.id,
        site_id = %request.site_id,
        task_type = request.task_type,
        run_at = %run_at,
        "enqueued one-off task"
    );
    Ok(saved)
}
