//! overseer - resumable background task execution for site fleet admins.
//!
//! Tasks are persisted records (cron expression, typed params, status)
//! executed by drivers through a uniform [`Callback`] interface. A callback
//! performs one bounded slice of work per invocation and returns
//! [`Status::WillResume`] to be invoked again with the same state bag; the
//! snapshot persisted between invocations lets an interrupted run continue
//! in a later process. Record-level locking makes concurrent drivers safe.

pub mod core;
pub mod enqueue;
pub mod events;
pub mod registry;
pub mod runner;
pub mod storage;
pub mod tasks;

pub use crate::core::callback::{Callback, CallbackError, Observable, RunContext};
pub use crate::core::cron::{resolve_timezone, CronError, CronExpression};
pub use crate::core::params::{RunOnceAction, TaskParams};
pub use crate::core::state::{StateBag, StateError};
pub use crate::core::status::Status;
pub use crate::core::types::{SiteId, TaskId};
pub use enqueue::{enqueue_one_off, EnqueueError, EnqueueRequest};
pub use events::{EventBus, EventHandler, RunEvent, TracingHandler};
pub use registry::{RegistryError, TaskRegistry, TaskRegistryBuilder};
pub use runner::{RunMode, Runner, RunnerError, TickSummary};
pub use storage::{
    finalize_run, MemoryStore, SqliteStore, StorageError, TaskLock, TaskRecord, TaskStore,
};
