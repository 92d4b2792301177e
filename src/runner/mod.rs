//! Resumable execution drivers.
//!
//! Two entry points share the invocation loop: [`Runner::run_callback`]
//! drives a callback directly (CLI usage, no task record), and
//! [`Runner::run_record`] drives a persisted record under its store lock,
//! persisting the state bag snapshot between invocations so an interrupted
//! chain resumes in a later process. [`Runner::tick`] is the scheduler pass
//! that selects due records and pushes each through `run_record`.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use uuid::Uuid;

use crate::core::callback::{Callback, CallbackError, RunContext};
use crate::core::state::StateBag;
use crate::core::status::Status;
use crate::core::types::TaskId;
use crate::events::{EventBus, RunEvent};
use crate::registry::{RegistryError, TaskRegistry};
use crate::storage::{finalize_run, StorageError, TaskRecord, TaskStore};

/// Errors raised by the execution drivers.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Task type could not be resolved.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Storage operation failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The callback failed with a non-recoverable error.
    #[error("callback failed: {0}")]
    Callback(#[from] CallbackError),

    /// The callback returned a status only the driver may set.
    #[error("callback for {task_type} returned reserved status {status}")]
    ProtocolViolation { task_type: String, status: Status },
}

/// How `run_record` treats a `WillResume` response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Keep invoking until the run reaches a terminal status.
    Batch,
    /// Perform one invocation; a `WillResume` record waits for the next
    /// tick (possibly in another process).
    SingleStep,
}

/// Counters for one scheduler pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// Records that only received a computed `next_execution`.
    pub scheduled: usize,
    /// Runs that reached `Status::Ok`.
    pub completed: usize,
    /// Runs that reached `Status::Error` or failed outright.
    pub failed: usize,
    /// Records paused mid-run (`SingleStep` resumes).
    pub resumed: usize,
    /// Records skipped because another driver holds the lock.
    pub skipped: usize,
}

/// Drives callbacks through their invocation chains.
pub struct Runner<S: TaskStore + ?Sized> {
    registry: Arc<TaskRegistry>,
    store: Arc<S>,
    events: Arc<EventBus>,
    timezone: Tz,
}

impl<S: TaskStore + ?Sized> Runner<S> {
    /// Create a runner over the given registry and store.
    pub fn new(registry: Arc<TaskRegistry>, store: Arc<S>) -> Self {
        Self {
            registry,
            store,
            events: Arc::new(EventBus::new()),
            timezone: Tz::UTC,
        }
    }

    /// Use a shared event bus instead of a private one.
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    /// Timezone used to interpret cron expressions when rescheduling.
    pub fn with_timezone(mut self, timezone: Tz) -> Self {
        self.timezone = timezone;
        self
    }

    /// The runner's event bus.
    pub fn events(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    /// Drive a callback to completion without a task record.
    ///
    /// The bag is seeded from the context params on an empty first call and
    /// then round-tripped through every invocation of the chain.
    pub async fn run_callback(
        &self,
        task_type: &str,
        ctx: &mut RunContext,
        bag: &mut StateBag,
    ) -> Result<Status, RunnerError> {
        let callback = self.registry.resolve(task_type)?;
        if let Some(observable) = callback.as_observable() {
            observable.attach(self.events.clone());
        }
        if bag.is_empty() {
            *bag = StateBag::from_value(Value::Object(ctx.params.payload.clone()));
        }

        let started = Instant::now();
        self.events
            .emit(RunEvent::RunStarted {
                task_type: task_type.to_string(),
                task_id: None,
                site_id: ctx.site_id,
            })
            .await;

        let mut iteration: u32 = 1;
        loop {
            let status = match callback.invoke(ctx, bag).await {
                Ok(status) => status,
                Err(e) if e.is_recoverable() => {
                    tracing::warn!(task_type, error = %e, "recoverable error, run ends in error status");
                    Status::Error
                }
                Err(e) => {
                    self.events
                        .emit(RunEvent::RunFailed {
                            task_type: task_type.to_string(),
                            task_id: None,
                            error: e.to_string(),
                        })
                        .await;
                    return Err(e.into());
                }
            };

            match status {
                Status::WillResume => {
                    iteration += 1;
                    self.events
                        .emit(RunEvent::RunResumed {
                            task_type: task_type.to_string(),
                            task_id: None,
                            iteration,
                        })
                        .await;
                }
                Status::Ok | Status::Error => {
                    self.events
                        .emit(RunEvent::RunCompleted {
                            task_type: task_type.to_string(),
                            task_id: None,
                            status,
                            duration: started.elapsed(),
                        })
                        .await;
                    return Ok(status);
                }
                Status::Running | Status::InitialSchedule => {
                    return Err(RunnerError::ProtocolViolation {
                        task_type: task_type.to_string(),
                        status,
                    });
                }
            }
        }
    }

    /// Run a persisted record under its store lock.
    ///
    /// The lock is taken before the record is read so the configuration
    /// seen here is the one the run executes, and it is released on every
    /// exit path.
    pub async fn run_record(
        &self,
        id: TaskId,
        now: DateTime<Utc>,
        mode: RunMode,
    ) -> Result<Status, RunnerError> {
        let token = self.store.try_lock(id, now).await?;
        let result = self.drive_record(id, now, mode).await;
        self.unlock_quietly(id, token).await;
        result
    }

    async fn unlock_quietly(&self, id: TaskId, token: Uuid) {
        if let Err(e) = self.store.unlock(id, token).await {
            tracing::error!(task_id = %id, error = %e, "failed to release task lock");
        }
    }

    async fn drive_record(
        &self,
        id: TaskId,
        now: DateTime<Utc>,
        mode: RunMode,
    ) -> Result<Status, RunnerError> {
        let record = self.store.get(id).await?;
        let callback = self.registry.resolve(&record.task_type)?;
        if let Some(observable) = callback.as_observable() {
            observable.attach(self.events.clone());
        }

        let resuming = record.last_exit_code == Status::WillResume;
        let mut bag = if resuming {
            record.resume_state.clone()
        } else {
            StateBag::from_value(Value::Object(record.params.payload.clone()))
        };
        let mut ctx = RunContext {
            site_id: record.site_id,
            params: record.params.clone(),
        };

        let mut record = record;
        record.last_exit_code = Status::Running;
        record.last_execution = Some(now);
        record = self.store.save(record).await?;

        let started = Instant::now();
        if resuming {
            self.events
                .emit(RunEvent::RunResumed {
                    task_type: record.task_type.clone(),
                    task_id: Some(id),
                    iteration: 1,
                })
                .await;
        } else {
            self.events
                .emit(RunEvent::RunStarted {
                    task_type: record.task_type.clone(),
                    task_id: Some(id),
                    site_id: record.site_id,
                })
                .await;
        }

        let mut iteration: u32 = 1;
        loop {
            let status = match callback.invoke(&mut ctx, &mut bag).await {
                Ok(status) => status,
                Err(e) if e.is_recoverable() => {
                    tracing::warn!(
                        task_id = %id,
                        task_type = record.task_type,
                        error = %e,
                        "recoverable error, run ends in error status"
                    );
                    Status::Error
                }
                Err(e) => {
                    self.events
                        .emit(RunEvent::RunFailed {
                            task_type: record.task_type.clone(),
                            task_id: Some(id),
                            error: e.to_string(),
                        })
                        .await;
                    // The run still ends in a persisted Error status; only
                    // the error itself propagates to the caller.
                    finalize_run(
                        self.store.as_ref(),
                        record.clone(),
                        Status::Error,
                        now,
                        self.timezone,
                    )
                    .await?;
                    return Err(e.into());
                }
            };

            match status {
                Status::WillResume => {
                    record.last_exit_code = Status::WillResume;
                    record.resume_state = bag.clone();
                    record = self.store.save(record).await?;

                    if mode == RunMode::SingleStep {
                        return Ok(Status::WillResume);
                    }
                    iteration += 1;
                    self.events
                        .emit(RunEvent::RunResumed {
                            task_type: record.task_type.clone(),
                            task_id: Some(id),
                            iteration,
                        })
                        .await;
                }
                Status::Ok | Status::Error => {
                    finalize_run(self.store.as_ref(), record.clone(), status, now, self.timezone)
                        .await?;
                    self.events
                        .emit(RunEvent::RunCompleted {
                            task_type: record.task_type.clone(),
                            task_id: Some(id),
                            status,
                            duration: started.elapsed(),
                        })
                        .await;
                    return Ok(status);
                }
                Status::Running | Status::InitialSchedule => {
                    return Err(RunnerError::ProtocolViolation {
                        task_type: record.task_type.clone(),
                        status,
                    });
                }
            }
        }
    }

    /// One scheduler pass: select due records and run each to completion.
    ///
    /// Records without a computed `next_execution` (and not resuming) only
    /// get one scheduled; lock contention with another driver is skipped,
    /// not fatal, and one failing record does not abort the pass.
    pub async fn tick(&self, now: DateTime<Utc>, limit: usize) -> Result<TickSummary, RunnerError> {
        let mut summary = TickSummary::default();

        for record in self.store.find_due(now, limit).await? {
            if record.needs_scheduling() {
                self.schedule_record(record, now).await?;
                summary.scheduled += 1;
                continue;
            }

            match self.run_record(record.id, now, RunMode::Batch).await {
                Ok(status) if status.is_success() => summary.completed += 1,
                Ok(Status::WillResume) => summary.resumed += 1,
                Ok(_) => summary.failed += 1,
                Err(RunnerError::Storage(StorageError::LockContention(id))) => {
                    tracing::debug!(task_id = %id, "task locked by another driver, skipping");
                    summary.skipped += 1;
                }
                Err(e) => {
                    tracing::error!(task_id = %record.id, error = %e, "task run failed");
                    summary.failed += 1;
                }
            }
        }

        Ok(summary)
    }

    async fn schedule_record(
        &self,
        mut record: TaskRecord,
        now: DateTime<Utc>,
    ) -> Result<(), RunnerError> {
        record.next_execution = record.cron().next_after(now, self.timezone);
        tracing::debug!(
            task_id = %record.id,
            next = ?record.next_execution,
            "computed next occurrence"
        );
        self.store.save(record).await?;
        Ok(())
    }
}
