//! SQLite task store.
//!
//! Persistent storage using SQLite via sqlx, with automatic schema
//! migration on open. Lock acquisition is a single conditional `UPDATE`
//! (compare-and-swap on the lock token and timestamp) so concurrent driver
//! processes cannot both win the same record.

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

use super::{StorageError, TaskLock, TaskRecord, TaskStore, DEFAULT_STALE_LOCK_AGE};
use crate::core::params::TaskParams;
use crate::core::state::StateBag;
use crate::core::status::Status;
use crate::core::types::{SiteId, TaskId};

/// Row shape shared by all task queries.
type TaskRow = (
    i64,            // id
    Option<i64>,    // site_id
    String,         // task_type
    String,         // cron_expression
    String,         // params
    String,         // resume_state
    bool,           // enabled
    i64,            // last_exit_code
    Option<String>, // last_execution
    Option<String>, // last_run_end
    Option<String>, // next_execution
    Option<String>, // lock_token
    Option<String>, // locked_at
    i64,            // priority
);

const TASK_COLUMNS: &str = "id, site_id, task_type, cron_expression, params, resume_state, \
     enabled, last_exit_code, last_execution, last_run_end, next_execution, \
     lock_token, locked_at, priority";

/// SQLite storage backend.
pub struct SqliteStore {
    pool: SqlitePool,
    stale_lock_age: Duration,
}

impl SqliteStore {
    /// Open (or create) a database file and run migrations.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path_str = path.as_ref().to_string_lossy();
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path_str))
            .map_err(|e| StorageError::Other(e.to_string()))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let store = Self {
            pool,
            stale_lock_age: DEFAULT_STALE_LOCK_AGE,
        };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Create an in-memory database (useful for testing).
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let store = Self {
            pool,
            stale_lock_age: DEFAULT_STALE_LOCK_AGE,
        };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Override the lock staleness threshold.
    pub fn with_stale_lock_age(mut self, age: Duration) -> Self {
        self.stale_lock_age = age;
        self
    }

    /// Run database migrations.
    async fn run_migrations(&self) -> Result<(), StorageError> {
        let schema = include_str!("../../migrations/001_initial_schema.sql");
        sqlx::raw_sql(schema)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Other(format!("migration failed: {}", e)))?;
        Ok(())
    }

    /// Close the connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn stale_cutoff(&self, now: DateTime<Utc>) -> String {
        encode_time(now - self.stale_lock_age)
    }
}

// Timestamps are stored as fixed-width UTC strings so lexicographic
// comparison in SQL matches chronological order.
fn encode_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn decode_row(row: TaskRow) -> Result<TaskRecord, StorageError> {
    let params_value: serde_json::Value =
        serde_json::from_str(&row.4).map_err(|e| StorageError::Serialization(e.to_string()))?;
    let resume_value: serde_json::Value =
        serde_json::from_str(&row.5).map_err(|e| StorageError::Serialization(e.to_string()))?;
    let status = Status::from_code(row.7).map_err(|e| StorageError::Serialization(e.to_string()))?;

    let lock = match (row.11, row.12) {
        (Some(token), Some(acquired_at)) => {
            let token =
                Uuid::parse_str(&token).map_err(|e| StorageError::Serialization(e.to_string()))?;
            decode_time(&acquired_at).map(|acquired_at| TaskLock { token, acquired_at })
        }
        _ => None,
    };

    Ok(TaskRecord {
        id: TaskId::new(row.0),
        site_id: row.1.map(SiteId::new),
        task_type: row.2,
        cron_expression: row.3,
        params: TaskParams::from_value(&params_value),
        resume_state: StateBag::from_value(resume_value),
        enabled: row.6,
        last_exit_code: status,
        last_execution: row.8.as_deref().and_then(decode_time),
        last_run_end: row.9.as_deref().and_then(decode_time),
        next_execution: row.10.as_deref().and_then(decode_time),
        lock,
        priority: row.13,
    })
}

#[async_trait]
impl TaskStore for SqliteStore {
    async fn save(&self, mut record: TaskRecord) -> Result<TaskRecord, StorageError> {
        let params = record.params.to_value().to_string();
        let resume_state = record.resume_state.to_value().to_string();
        let (lock_token, locked_at) = match record.lock {
            Some(lock) => (
                Some(lock.token.to_string()),
                Some(encode_time(lock.acquired_at)),
            ),
            None => (None, None),
        };

        if record.id.is_saved() {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO tasks
                    (id, site_id, task_type, cron_expression, params, resume_state,
                     enabled, last_exit_code, last_execution, last_run_end,
                     next_execution, lock_token, locked_at, priority)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(record.id.as_i64())
            .bind(record.site_id.map(|s| s.as_i64()))
            .bind(&record.task_type)
            .bind(&record.cron_expression)
            .bind(&params)
            .bind(&resume_state)
            .bind(record.enabled)
            .bind(record.last_exit_code.code())
            .bind(record.last_execution.map(encode_time))
            .bind(record.last_run_end.map(encode_time))
            .bind(record.next_execution.map(encode_time))
            .bind(&lock_token)
            .bind(&locked_at)
            .bind(record.priority)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;
        } else {
            let result = sqlx::query(
                r#"
                INSERT INTO tasks
                    (site_id, task_type, cron_expression, params, resume_state,
                     enabled, last_exit_code, last_execution, last_run_end,
                     next_execution, lock_token, locked_at, priority)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(record.site_id.map(|s| s.as_i64()))
            .bind(&record.task_type)
            .bind(&record.cron_expression)
            .bind(&params)
            .bind(&resume_state)
            .bind(record.enabled)
            .bind(record.last_exit_code.code())
            .bind(record.last_execution.map(encode_time))
            .bind(record.last_run_end.map(encode_time))
            .bind(record.next_execution.map(encode_time))
            .bind(&lock_token)
            .bind(&locked_at)
            .bind(record.priority)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

            record.id = TaskId::new(result.last_insert_rowid());
        }

        Ok(record)
    }

    async fn get(&self, id: TaskId) -> Result<TaskRecord, StorageError> {
        let row: TaskRow = sqlx::query_as(&format!(
            "SELECT {} FROM tasks WHERE id = ?",
            TASK_COLUMNS
        ))
        .bind(id.as_i64())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Other(e.to_string()))?
        .ok_or_else(|| StorageError::NotFound(format!("task: {}", id)))?;

        decode_row(row)
    }

    async fn delete(&self, id: TaskId) -> Result<(), StorageError> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id.as_i64())
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("task: {}", id)));
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<TaskRecord>, StorageError> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {} FROM tasks ORDER BY id",
            TASK_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Other(e.to_string()))?;

        rows.into_iter().map(decode_row).collect()
    }

    async fn list_for_site(
        &self,
        site_id: SiteId,
        task_type: &str,
    ) -> Result<Vec<TaskRecord>, StorageError> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {} FROM tasks WHERE site_id = ? AND task_type = ? ORDER BY id",
            TASK_COLUMNS
        ))
        .bind(site_id.as_i64())
        .bind(task_type)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Other(e.to_string()))?;

        rows.into_iter().map(decode_row).collect()
    }

    async fn find_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, StorageError> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM tasks
            WHERE enabled = 1
              AND (lock_token IS NULL OR locked_at < ?)
              AND (last_exit_code = ? OR next_execution IS NULL OR next_execution <= ?)
            ORDER BY priority DESC, id
            LIMIT ?
            "#,
            TASK_COLUMNS
        ))
        .bind(self.stale_cutoff(now))
        .bind(Status::WillResume.code())
        .bind(encode_time(now))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Other(e.to_string()))?;

        rows.into_iter().map(decode_row).collect()
    }

    async fn try_lock(&self, id: TaskId, now: DateTime<Utc>) -> Result<Uuid, StorageError> {
        let token = Uuid::new_v4();
        let result = sqlx::query(
            r#"
            UPDATE tasks SET lock_token = ?, locked_at = ?
            WHERE id = ? AND (lock_token IS NULL OR locked_at < ?)
            "#,
        )
        .bind(token.to_string())
        .bind(encode_time(now))
        .bind(id.as_i64())
        .bind(self.stale_cutoff(now))
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Other(e.to_string()))?;

        if result.rows_affected() == 1 {
            return Ok(token);
        }

        // Lost the race or the record is gone; tell the caller which.
        let exists: Option<(i64,)> = sqlx::query_as("SELECT id FROM tasks WHERE id = ?")
            .bind(id.as_i64())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        match exists {
            Some(_) => Err(StorageError::LockContention(id)),
            None => Err(StorageError::NotFound(format!("task: {}", id))),
        }
    }

    async fn unlock(&self, id: TaskId, token: Uuid) -> Result<(), StorageError> {
        sqlx::query(
            "UPDATE tasks SET lock_token = NULL, locked_at = NULL WHERE id = ? AND lock_token = ?",
        )
        .bind(id.as_i64())
        .bind(token.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Other(e.to_string()))?;
        Ok(())
    }
}
