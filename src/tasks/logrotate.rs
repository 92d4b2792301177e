//! Log rotation callback.
//!
//! Purely local maintenance: scans a directory for oversized `.log` files
//! and rotates them (`app.log` → `app.log.1` → `app.log.2` …), a bounded
//! number of files per invocation. The remaining worklist is carried in the
//! state bag, so a large log directory is chipped away across invocations.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::core::callback::{Callback, CallbackError, RunContext};
use crate::core::state::StateBag;
use crate::core::status::Status;

const PENDING_KEY: &str = "pending";

/// Typed payload of a log rotation task record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRotateParams {
    /// Directory scanned for `.log` files.
    pub directory: PathBuf,
    /// Files larger than this many bytes get rotated.
    #[serde(default = "default_max_size")]
    pub max_size: u64,
    /// Number of rotated generations to keep.
    #[serde(default = "default_keep")]
    pub keep: u32,
    /// Files rotated per invocation.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_max_size() -> u64 {
    10 * 1024 * 1024
}

fn default_keep() -> u32 {
    3
}

fn default_batch_size() -> usize {
    5
}

/// Callback rotating oversized log files in batches.
#[derive(Debug, Default)]
pub struct LogRotateCallback;

impl LogRotateCallback {
    /// Create a log rotation callback.
    pub fn new() -> Self {
        Self
    }

    /// Scan the directory for `.log` files above the size threshold.
    async fn find_oversized(&self, params: &LogRotateParams) -> Result<Vec<PathBuf>, CallbackError> {
        let mut entries = fs::read_dir(&params.directory).await.map_err(|e| {
            CallbackError::Configuration(format!(
                "cannot read log directory {}: {}",
                params.directory.display(),
                e
            ))
        })?;

        let mut oversized = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CallbackError::Other(Box::new(e)))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("log") {
                continue;
            }
            let metadata = entry
                .metadata()
                .await
                .map_err(|e| CallbackError::Other(Box::new(e)))?;
            if metadata.is_file() && metadata.len() > params.max_size {
                oversized.push(path);
            }
        }

        oversized.sort();
        Ok(oversized)
    }

    /// Shift the rotated generations up and move the live file to `.1`.
    async fn rotate(&self, path: &Path, keep: u32) -> Result<(), CallbackError> {
        let oldest = rotated_name(path, keep);
        if fs::try_exists(&oldest)
            .await
            .map_err(|e| CallbackError::Other(Box::new(e)))?
        {
            fs::remove_file(&oldest)
                .await
                .map_err(|e| CallbackError::Other(Box::new(e)))?;
        }

        for generation in (1..keep).rev() {
            let from = rotated_name(path, generation);
            if fs::try_exists(&from)
                .await
                .map_err(|e| CallbackError::Other(Box::new(e)))?
            {
                fs::rename(&from, rotated_name(path, generation + 1))
                    .await
                    .map_err(|e| CallbackError::Other(Box::new(e)))?;
            }
        }

        fs::rename(path, rotated_name(path, 1))
            .await
            .map_err(|e| CallbackError::Other(Box::new(e)))?;
        tracing::info!(path = %path.display(), "rotated log file");
        Ok(())
    }
}

fn rotated_name(path: &Path, generation: u32) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{}", generation));
    PathBuf::from(name)
}

#[async_trait]
impl Callback for LogRotateCallback {
    fn task_type(&self) -> &str {
        "logrotate"
    }

    async fn invoke(
        &self,
        ctx: &mut RunContext,
        state: &mut StateBag,
    ) -> Result<Status, CallbackError> {
        let params: LogRotateParams = ctx
            .params
            .decode_payload()
            .map_err(|e| CallbackError::Configuration(e.to_string()))?;
        if params.batch_size == 0 {
            // A zero batch would yield forever without progress.
            return Err(CallbackError::Configuration(
                "rotation batch size must be positive".into(),
            ));
        }

        // First invocation scans; later ones work off the stored list so
        // files growing past the threshold mid-run don't extend the run.
        let mut pending: Vec<PathBuf> = match state.get(PENDING_KEY) {
            Ok(pending) => pending,
            Err(_) => self.find_oversized(&params).await?,
        };

        let batch: Vec<PathBuf> = pending
            .drain(..params.batch_size.min(pending.len()))
            .collect();
        for path in &batch {
            self.rotate(path, params.keep).await?;
        }

        if pending.is_empty() {
            state.remove(PENDING_KEY);
            return Ok(Status::Ok);
        }

        tracing::debug!(remaining = pending.len(), "log rotation continues next pass");
        state.set(PENDING_KEY, &pending)?;
        Ok(Status::WillResume)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::params::TaskParams;
    use tempfile::TempDir;

    async fn write_file(dir: &Path, name: &str, size: usize) {
        fs::write(dir.join(name), vec![b'x'; size]).await.unwrap();
    }

    fn params_for(dir: &Path, max_size: u64, batch_size: usize) -> TaskParams {
        TaskParams::new()
            .encode_payload(&LogRotateParams {
                directory: dir.to_path_buf(),
                max_size,
                keep: 2,
                batch_size,
            })
            .unwrap()
    }

    #[tokio::test]
    async fn test_rotates_only_oversized_logs() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "big.log", 100).await;
        write_file(dir.path(), "small.log", 10).await;
        write_file(dir.path(), "notes.txt", 100).await;

        let callback = LogRotateCallback::new();
        let mut ctx = RunContext::new().with_params(params_for(dir.path(), 50, 10));
        let mut bag = StateBag::new();

        assert_eq!(
            callback.invoke(&mut ctx, &mut bag).await.unwrap(),
            Status::Ok
        );

        assert!(!dir.path().join("big.log").exists());
        assert!(dir.path().join("big.log.1").exists());
        assert!(dir.path().join("small.log").exists());
        assert!(dir.path().join("notes.txt").exists());
    }

    #[tokio::test]
    async fn test_generations_shift_and_oldest_is_dropped() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "app.log", 100).await;
        write_file(dir.path(), "app.log.1", 1).await;
        write_file(dir.path(), "app.log.2", 1).await;

        let callback = LogRotateCallback::new();
        // keep = 2: the old `.2` is removed, `.1` becomes `.2`.
        let mut ctx = RunContext::new().with_params(params_for(dir.path(), 50, 10));
        let mut bag = StateBag::new();
        callback.invoke(&mut ctx, &mut bag).await.unwrap();

        assert!(dir.path().join("app.log.1").exists());
        assert!(dir.path().join("app.log.2").exists());
        assert!(!dir.path().join("app.log").exists());
    }

    #[tokio::test]
    async fn test_large_directory_resumes_across_invocations() {
        let dir = TempDir::new().unwrap();
        for i in 0..3 {
            write_file(dir.path(), &format!("site{}.log", i), 100).await;
        }

        let callback = LogRotateCallback::new();
        let mut ctx = RunContext::new().with_params(params_for(dir.path(), 50, 2));
        let mut bag = StateBag::new();

        assert_eq!(
            callback.invoke(&mut ctx, &mut bag).await.unwrap(),
            Status::WillResume
        );
        assert_eq!(bag.get::<Vec<PathBuf>>(PENDING_KEY).unwrap().len(), 1);

        assert_eq!(
            callback.invoke(&mut ctx, &mut bag).await.unwrap(),
            Status::Ok
        );
        for i in 0..3 {
            assert!(dir.path().join(format!("site{}.log.1", i)).exists());
        }
    }

    #[tokio::test]
    async fn test_zero_batch_size_is_rejected() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "app.log", 100).await;

        let callback = LogRotateCallback::new();
        let mut ctx = RunContext::new().with_params(params_for(dir.path(), 50, 0));
        let mut bag = StateBag::new();

        // Without the guard this would return WillResume forever while the
        // worklist never shrinks.
        let err = callback.invoke(&mut ctx, &mut bag).await.err().unwrap();
        assert!(matches!(err, CallbackError::Configuration(_)));
        assert!(dir.path().join("app.log").exists());
    }

    #[tokio::test]
    async fn test_missing_directory_is_configuration_error() {
        let callback = LogRotateCallback::new();
        let mut ctx = RunContext::new()
            .with_params(params_for(Path::new("/nonexistent/logs"), 50, 10));
        let mut bag = StateBag::new();

        let err = callback.invoke(&mut ctx, &mut bag).await.unwrap_err();
        assert!(matches!(err, CallbackError::Configuration(_)));
    }
}
