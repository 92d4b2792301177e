//! End-to-end lifecycle tests: enqueue a one-off task, drive it through the
//! scheduler, and resume an interrupted run from the persisted snapshot in
//! a second driver.

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use overseer::tasks::backup::{BackupProgress, BackupService, BackupServiceError};
use overseer::tasks::BackupCallback;
use overseer::{
    enqueue_one_off, EnqueueRequest, RunMode, RunOnceAction, Runner, SiteId, SqliteStore, Status,
    TaskParams, TaskRegistry, TaskStore,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Backup service that finishes after a fixed number of polls.
struct SlowBackupService {
    polls_needed: usize,
    calls: AtomicUsize,
}

impl SlowBackupService {
    fn new(polls_needed: usize) -> Self {
        Self {
            polls_needed,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl BackupService for SlowBackupService {
    async fn start_backup(
        &self,
        _site_id: SiteId,
        _params: &overseer::tasks::BackupParams,
    ) -> Result<BackupProgress, BackupServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(BackupProgress {
            backup_id: "bk-42".into(),
            finished: self.polls_needed == 0,
        })
    }

    async fn step_backup(
        &self,
        _site_id: SiteId,
        backup_id: &str,
    ) -> Result<BackupProgress, BackupServiceError> {
        let calls = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(BackupProgress {
            backup_id: backup_id.into(),
            finished: calls >= self.polls_needed,
        })
    }
}

fn runner_for(service: Arc<SlowBackupService>, store: Arc<SqliteStore>) -> Runner<SqliteStore> {
    let registry = Arc::new(
        TaskRegistry::builder()
            .register(Arc::new(BackupCallback::new(service)))
            .build()
            .unwrap(),
    );
    Runner::new(registry, store)
}

fn t(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, h, m, 0).unwrap()
}

#[tokio::test]
async fn enqueued_backup_runs_on_schedule_and_is_disabled_after() {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    let runner = runner_for(Arc::new(SlowBackupService::new(2)), store.clone());

    let now = t(10, 0);
    let record = enqueue_one_off(
        store.as_ref(),
        EnqueueRequest::new(SiteId::new(7), "backup")
            .with_params(TaskParams::new().with_value("profile_id", 3)),
        "UTC",
        now,
    )
    .await
    .unwrap();
    assert_eq!(record.next_execution, Some(t(10, 1)));

    // Not due yet: the pass does nothing.
    let summary = runner.tick(now, 10).await.unwrap();
    assert_eq!(summary.completed + summary.scheduled + summary.failed, 0);

    // Due: the run polls the backup to completion in one batch pass.
    let summary = runner.tick(t(10, 2), 10).await.unwrap();
    assert_eq!(summary.completed, 1);

    let finished = store.get(record.id).await.unwrap();
    assert_eq!(finished.last_exit_code, Status::Ok);
    assert!(!finished.enabled);
    assert!(finished.resume_state.is_empty());
    assert!(finished.lock.is_none());
}

#[tokio::test]
async fn repeated_enqueue_reuses_records() {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    let runner = runner_for(Arc::new(SlowBackupService::new(0)), store.clone());

    let request = || EnqueueRequest::new(SiteId::new(7), "backup");

    let first = enqueue_one_off(store.as_ref(), request(), "UTC", t(10, 0))
        .await
        .unwrap();
    let second = enqueue_one_off(store.as_ref(), request(), "UTC", t(10, 0))
        .await
        .unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(store.list().await.unwrap().len(), 1);

    runner.tick(t(10, 5), 10).await.unwrap();
    assert!(!store.get(first.id).await.unwrap().enabled);

    // After completion the disabled record is recycled, not duplicated.
    let third = enqueue_one_off(store.as_ref(), request(), "UTC", t(11, 0))
        .await
        .unwrap();
    assert_eq!(third.id, first.id);
    assert!(third.enabled);
    assert_eq!(store.list().await.unwrap().len(), 1);
}

#[tokio::test]
async fn interrupted_run_resumes_in_second_driver() {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());

    let record = enqueue_one_off(
        store.as_ref(),
        EnqueueRequest::new(SiteId::new(7), "backup").with_run_once(RunOnceAction::Delete),
        "UTC",
        t(10, 0),
    )
    .await
    .unwrap();

    // First driver performs one step and stops, as if the process died
    // right after persisting the snapshot.
    {
        let runner = runner_for(Arc::new(SlowBackupService::new(2)), store.clone());
        let status = runner
            .run_record(record.id, t(10, 1), RunMode::SingleStep)
            .await
            .unwrap();
        assert_eq!(status, Status::WillResume);
    }

    let paused = store.get(record.id).await.unwrap();
    assert_eq!(paused.last_exit_code, Status::WillResume);
    assert_eq!(
        paused.resume_state.get::<String>("backup_id").unwrap(),
        "bk-42"
    );
    assert!(paused.lock.is_none());

    // A second driver with a fresh service keeps polling the same backup
    // id from the snapshot; no new backup is started.
    let service = Arc::new(SlowBackupService::new(0));
    let runner = runner_for(service.clone(), store.clone());
    let summary = runner.tick(t(10, 5), 10).await.unwrap();
    assert_eq!(summary.completed, 1);

    // run_once = delete removed the record after success.
    assert!(store.get(record.id).await.is_err());
}

#[tokio::test]
async fn stale_lock_does_not_wedge_a_task() {
    let store = Arc::new(
        SqliteStore::in_memory()
            .await
            .unwrap()
            .with_stale_lock_age(Duration::minutes(5)),
    );
    let runner = runner_for(Arc::new(SlowBackupService::new(0)), store.clone());

    let record = enqueue_one_off(
        store.as_ref(),
        EnqueueRequest::new(SiteId::new(7), "backup"),
        "UTC",
        t(10, 0),
    )
    .await
    .unwrap();

    // A crashed driver left its lock behind.
    store.try_lock(record.id, t(10, 1)).await.unwrap();

    // While the lock is live the pass skips the record.
    let summary = runner.tick(t(10, 2), 10).await.unwrap();
    assert_eq!(summary.completed, 0);

    // Past the staleness threshold the record runs again.
    let summary = runner.tick(t(10, 10), 10).await.unwrap();
    assert_eq!(summary.completed, 1);
}
