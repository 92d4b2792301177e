//! Run lifecycle events and event handling.
//!
//! Drivers emit events as they push a callback through its invocations,
//! giving CLI output and log sinks a uniform view of resumable runs.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::core::status::Status;
use crate::core::types::{SiteId, TaskId};

/// Lifecycle events emitted while driving a run.
#[derive(Debug, Clone)]
pub enum RunEvent {
    /// A run has started (first invocation of this chain).
    RunStarted {
        task_type: String,
        task_id: Option<TaskId>,
        site_id: Option<SiteId>,
    },

    /// The callback yielded `WillResume` and is being invoked again.
    RunResumed {
        task_type: String,
        task_id: Option<TaskId>,
        /// 1-indexed invocation about to be performed.
        iteration: u32,
    },

    /// Free-form progress report from an observable callback.
    Progress {
        task_type: String,
        message: String,
    },

    /// The run reached a terminal status.
    RunCompleted {
        task_type: String,
        task_id: Option<TaskId>,
        status: Status,
        duration: Duration,
    },

    /// The callback failed with an unexpected error; the run counts as
    /// failed and the driver reports the error upstream.
    RunFailed {
        task_type: String,
        task_id: Option<TaskId>,
        error: String,
    },
}

/// Handler for run lifecycle events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle an event. Handlers must not block for long periods.
    async fn handle(&self, event: &RunEvent);
}

/// Event bus that fans events out to registered handlers.
///
/// Handlers are invoked sequentially in registration order.
#[derive(Clone, Default)]
pub struct EventBus {
    handlers: Arc<RwLock<Vec<Arc<dyn EventHandler>>>>,
}

impl EventBus {
    /// Create a new event bus with no handlers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler.
    pub async fn register(&self, handler: Arc<dyn EventHandler>) {
        self.handlers.write().await.push(handler);
    }

    /// Emit an event to all registered handlers.
    pub async fn emit(&self, event: RunEvent) {
        let handlers = self.handlers.read().await.clone();
        for handler in handlers {
            handler.handle(&event).await;
        }
    }

    /// Number of registered handlers.
    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }
}

/// Handler that reports run events through `tracing`.
pub struct TracingHandler;

#[async_trait]
impl EventHandler for TracingHandler {
    async fn handle(&self, event: &RunEvent) {
        match event {
            RunEvent::RunStarted {
                task_type,
                task_id,
                site_id,
            } => {
                tracing::info!(task_type, ?task_id, ?site_id, "run started");
            }
            RunEvent::RunResumed {
                task_type,
                iteration,
                ..
            } => {
                tracing::debug!(task_type, iteration, "run resumed");
            }
            RunEvent::Progress { task_type, message } => {
                tracing::info!(task_type, "{}", message);
            }
            RunEvent::RunCompleted {
                task_type,
                status,
                duration,
                ..
            } => {
                if status.is_success() {
                    tracing::info!(task_type, %status, ?duration, "run completed");
                } else {
                    tracing::warn!(task_type, %status, ?duration, "run completed");
                }
            }
            RunEvent::RunFailed {
                task_type, error, ..
            } => {
                tracing::error!(task_type, error, "run failed");
            }
        }
    }
}
