//! Callback contract: the uniform interface every runnable task implements.
//!
//! A callback is invoked with a mutable [`RunContext`] (task-specific
//! configuration, typically unused) and the volatile [`StateBag`] that is
//! round-tripped between invocations of the same logical run. Each
//! invocation returns one [`Status`]; the driver keeps invoking the same
//! callback with the same bag while it returns [`Status::WillResume`].
//!
//! Callbacks must be idempotent-safe across interrupted resumes: the
//! in-memory continuation is not durable beyond what is written into the
//! state bag, so a resumed invocation must either replay the step the bag
//! describes or detect completed sub-steps from externally observable
//! evidence (for example, a remote record's own status).

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

use super::params::TaskParams;
use super::state::{StateBag, StateError};
use super::status::Status;
use super::types::SiteId;
use crate::events::EventBus;

/// Errors a callback invocation can raise.
///
/// Remote errors are recoverable: the driver converts them into a terminal
/// [`Status::Error`] for the run instead of crashing. Everything else is a
/// fatal failure of the current invocation: reported, propagated, and the
/// record's lock still released.
#[derive(Debug, Error)]
pub enum CallbackError {
    /// A downstream API or service reported a failure.
    #[error("remote service error: {0}")]
    Remote(String),

    /// Missing or invalid configuration without a safe default.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Error accessing the state bag.
    #[error("state error: {0}")]
    State(#[from] StateError),

    /// Unexpected error inside the callback body.
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl CallbackError {
    /// Whether the driver should convert this error into a terminal
    /// `Status::Error` for the run rather than failing the invocation.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CallbackError::Remote(_))
    }
}

/// Per-run execution context handed to the callback.
///
/// Carries the owning site (if any) and the record's decoded params. This
/// is configuration, not progress state; progress lives in the bag.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    /// Owning site, None for global tasks.
    pub site_id: Option<SiteId>,
    /// The record's persisted parameters.
    pub params: TaskParams,
}

impl RunContext {
    /// Create an empty context (CLI-driven runs without a task record).
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a context for a site-scoped run.
    pub fn for_site(site_id: SiteId) -> Self {
        Self {
            site_id: Some(site_id),
            params: TaskParams::default(),
        }
    }

    /// Set the params.
    pub fn with_params(mut self, params: TaskParams) -> Self {
        self.params = params;
        self
    }
}

/// Optional capability: a callback that can report progress through an
/// event bus the driver attaches before the first invocation.
pub trait Observable: Send + Sync {
    /// Attach the driver's event bus.
    fn attach(&self, bus: Arc<EventBus>);
}

/// The uniform interface every runnable task implements.
#[async_trait]
pub trait Callback: Send + Sync {
    /// The task-type key this callback is registered under.
    fn task_type(&self) -> &str;

    /// Perform one bounded slice of work.
    ///
    /// Return [`Status::WillResume`] to be invoked again with the same bag,
    /// [`Status::Ok`] or [`Status::Error`] to end the run.
    async fn invoke(
        &self,
        ctx: &mut RunContext,
        state: &mut StateBag,
    ) -> Result<Status, CallbackError>;

    /// Capability query: observable callbacks return themselves here so the
    /// driver can attach its event bus. Default: not observable.
    fn as_observable(&self) -> Option<&dyn Observable> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountdownCallback {
        steps: u64,
    }

    #[async_trait]
    impl Callback for CountdownCallback {
        fn task_type(&self) -> &str {
            "countdown"
        }

        async fn invoke(
            &self,
            _ctx: &mut RunContext,
            state: &mut StateBag,
        ) -> Result<Status, CallbackError> {
            let done: u64 = state.get_or("done", 0);
            let done = done + 1;
            state.set("done", done)?;

            if done >= self.steps {
                Ok(Status::Ok)
            } else {
                Ok(Status::WillResume)
            }
        }
    }

    #[tokio::test]
    async fn test_callback_resumes_with_same_bag() {
        let callback = CountdownCallback { steps: 3 };
        let mut ctx = RunContext::new();
        let mut bag = StateBag::new();

        assert_eq!(
            callback.invoke(&mut ctx, &mut bag).await.unwrap(),
            Status::WillResume
        );
        assert_eq!(
            callback.invoke(&mut ctx, &mut bag).await.unwrap(),
            Status::WillResume
        );
        assert_eq!(callback.invoke(&mut ctx, &mut bag).await.unwrap(), Status::Ok);
        assert_eq!(bag.get::<u64>("done").unwrap(), 3);
    }

    #[tokio::test]
    async fn test_default_capability_is_not_observable() {
        let callback = CountdownCallback { steps: 1 };
        assert!(callback.as_observable().is_none());
    }

    #[test]
    fn test_remote_errors_are_recoverable() {
        assert!(CallbackError::Remote("503".into()).is_recoverable());
        assert!(!CallbackError::Configuration("no endpoint".into()).is_recoverable());
    }
}
