//! Backup trigger callback.
//!
//! Starts a backup on the remote site through a [`BackupService`] and polls
//! it to completion, one poll per invocation. The remote backup id is the
//! only progress state, carried in the state bag so a later process can
//! keep polling the same backup.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::core::callback::{Callback, CallbackError, Observable, RunContext};
use crate::core::state::StateBag;
use crate::core::status::Status;
use crate::core::types::SiteId;
use crate::events::{EventBus, RunEvent};

const BACKUP_ID_KEY: &str = "backup_id";

/// Failure reported by a backup service implementation.
#[derive(Debug, Error)]
#[error("backup service error: {0}")]
pub struct BackupServiceError(pub String);

/// Progress snapshot of a remote backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupProgress {
    /// Identifier of the running backup on the remote site.
    pub backup_id: String,
    /// Whether the backup has finished successfully.
    pub finished: bool,
}

/// Narrow interface to whatever runs backups on the remote site.
#[async_trait]
pub trait BackupService: Send + Sync {
    /// Start a new backup with the given profile.
    async fn start_backup(
        &self,
        site_id: SiteId,
        params: &BackupParams,
    ) -> Result<BackupProgress, BackupServiceError>;

    /// Advance/poll a running backup.
    async fn step_backup(
        &self,
        site_id: SiteId,
        backup_id: &str,
    ) -> Result<BackupProgress, BackupServiceError>;
}

/// Typed payload of a backup task record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupParams {
    /// Remote backup profile to run.
    #[serde(default = "default_profile_id")]
    pub profile_id: i64,
    /// Short description shown in the remote backup list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Free-form comment stored with the backup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

fn default_profile_id() -> i64 {
    1
}

impl Default for BackupParams {
    fn default() -> Self {
        Self {
            profile_id: default_profile_id(),
            description: None,
            comment: None,
        }
    }
}

/// Callback driving a remote backup to completion.
pub struct BackupCallback<B> {
    service: Arc<B>,
    events: Mutex<Option<Arc<EventBus>>>,
}

impl<B: BackupService> BackupCallback<B> {
    /// Create a backup callback over the given service.
    pub fn new(service: Arc<B>) -> Self {
        Self {
            service,
            events: Mutex::new(None),
        }
    }

    async fn emit(&self, event: RunEvent) {
        let bus = self.events.lock().ok().and_then(|guard| guard.clone());
        if let Some(bus) = bus {
            bus.emit(event).await;
        }
    }
}

impl<B: BackupService> Observable for BackupCallback<B> {
    fn attach(&self, bus: Arc<EventBus>) {
        if let Ok(mut guard) = self.events.lock() {
            *guard = Some(bus);
        }
    }
}

#[async_trait]
impl<B: BackupService + 'static> Callback for BackupCallback<B> {
    fn task_type(&self) -> &str {
        "backup"
    }

    async fn invoke(
        &self,
        ctx: &mut RunContext,
        state: &mut StateBag,
    ) -> Result<Status, CallbackError> {
        let site_id = ctx
            .site_id
            .ok_or_else(|| CallbackError::Configuration("backup task requires a site".into()))?;

        let progress = match state.get::<String>(BACKUP_ID_KEY) {
            Ok(backup_id) => {
                tracing::debug!(%site_id, backup_id, "polling running backup");
                self.service
                    .step_backup(site_id, &backup_id)
                    .await
                    .map_err(|e| CallbackError::Remote(e.to_string()))?
            }
            Err(_) => {
                let params: BackupParams = ctx
                    .params
                    .decode_payload()
                    .map_err(|e| CallbackError::Configuration(e.to_string()))?;
                tracing::info!(%site_id, profile_id = params.profile_id, "starting backup");
                self.service
                    .start_backup(site_id, &params)
                    .await
                    .map_err(|e| CallbackError::Remote(e.to_string()))?
            }
        };

        if progress.finished {
            state.remove(BACKUP_ID_KEY);
            self.emit(RunEvent::Progress {
                task_type: "backup".into(),
                message: format!("backup {} finished", progress.backup_id),
            })
            .await;
            return Ok(Status::Ok);
        }

        self.emit(RunEvent::Progress {
            task_type: "backup".into(),
            message: format!("backup {} in progress", progress.backup_id),
        })
        .await;
        state.set(BACKUP_ID_KEY, &progress.backup_id)?;
        Ok(Status::WillResume)
    }

    fn as_observable(&self) -> Option<&dyn Observable> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::params::TaskParams;
    use std::collections::VecDeque;

    /// Scripted service: pops one pre-programmed response per call.
    struct ScriptedService {
        responses: Mutex<VecDeque<Result<BackupProgress, BackupServiceError>>>,
        started: Mutex<Vec<BackupParams>>,
        stepped: Mutex<Vec<String>>,
    }

    impl ScriptedService {
        fn new(responses: Vec<Result<BackupProgress, BackupServiceError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                started: Mutex::new(Vec::new()),
                stepped: Mutex::new(Vec::new()),
            }
        }

        fn next(&self) -> Result<BackupProgress, BackupServiceError> {
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .expect("scripted response available")
        }
    }

    #[async_trait]
    impl BackupService for ScriptedService {
        async fn start_backup(
            &self,
            _site_id: SiteId,
            params: &BackupParams,
        ) -> Result<BackupProgress, BackupServiceError> {
            self.started.lock().unwrap().push(params.clone());
            self.next()
        }

        async fn step_backup(
            &self,
            _site_id: SiteId,
            backup_id: &str,
        ) -> Result<BackupProgress, BackupServiceError> {
            self.stepped.lock().unwrap().push(backup_id.to_string());
            self.next()
        }
    }

    fn progress(backup_id: &str, finished: bool) -> BackupProgress {
        BackupProgress {
            backup_id: backup_id.into(),
            finished,
        }
    }

    #[tokio::test]
    async fn test_backup_starts_then_polls_to_completion() {
        let service = Arc::new(ScriptedService::new(vec![
            Ok(progress("bk-1", false)),
            Ok(progress("bk-1", false)),
            Ok(progress("bk-1", true)),
        ]));
        let callback = BackupCallback::new(service.clone());

        let mut ctx = RunContext::for_site(SiteId::new(7))
            .with_params(TaskParams::new().with_value("profile_id", 3));
        let mut bag = StateBag::new();

        assert_eq!(
            callback.invoke(&mut ctx, &mut bag).await.unwrap(),
            Status::WillResume
        );
        assert_eq!(bag.get::<String>(BACKUP_ID_KEY).unwrap(), "bk-1");

        assert_eq!(
            callback.invoke(&mut ctx, &mut bag).await.unwrap(),
            Status::WillResume
        );
        assert_eq!(
            callback.invoke(&mut ctx, &mut bag).await.unwrap(),
            Status::Ok
        );

        assert!(!bag.contains(BACKUP_ID_KEY));
        assert_eq!(service.started.lock().unwrap().len(), 1);
        assert_eq!(service.started.lock().unwrap()[0].profile_id, 3);
        assert_eq!(
            *service.stepped.lock().unwrap(),
            vec!["bk-1".to_string(), "bk-1".to_string()]
        );
    }

    #[tokio::test]
    async fn test_resumed_bag_skips_start() {
        let service = Arc::new(ScriptedService::new(vec![Ok(progress("bk-9", true))]));
        let callback = BackupCallback::new(service.clone());

        let mut ctx = RunContext::for_site(SiteId::new(7));
        let mut bag = StateBag::new();
        bag.set(BACKUP_ID_KEY, "bk-9").unwrap();

        assert_eq!(
            callback.invoke(&mut ctx, &mut bag).await.unwrap(),
            Status::Ok
        );
        assert!(service.started.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remote_failure_is_recoverable() {
        let service = Arc::new(ScriptedService::new(vec![Err(BackupServiceError(
            "403 from remote".into(),
        ))]));
        let callback = BackupCallback::new(service);

        let mut ctx = RunContext::for_site(SiteId::new(7));
        let mut bag = StateBag::new();
        let err = callback.invoke(&mut ctx, &mut bag).await.unwrap_err();
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_missing_site_is_configuration_error() {
        let service = Arc::new(ScriptedService::new(vec![]));
        let callback = BackupCallback::new(service);

        let mut ctx = RunContext::new();
        let mut bag = StateBag::new();
        let err = callback.invoke(&mut ctx, &mut bag).await.unwrap_err();
        assert!(matches!(err, CallbackError::Configuration(_)));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_default_params() {
        let params = BackupParams::default();
        assert_eq!(params.profile_id, 1);
        assert!(params.description.is_none());
    }
}
