use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use abandon_common::retry::RetryableError;
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;

use crate::event::AbandonmentRecord;

/// Enumeration of errors for operations with the record store.
/// Errors can originate from sqlx and are wrapped by us to provide additional context.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError {
        command: String,
        error: sqlx::Error,
    },
    #[error("write timed out after {0:?}")]
    Timeout(Duration),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl RetryableError for StoreError {
    fn is_retryable(&self) -> bool {
        match self {
            StoreError::ConnectionError { .. } => true,
            StoreError::QueryError { error, .. } => is_transient(error),
            StoreError::Timeout(_) | StoreError::Unavailable(_) => true,
        }
    }
}

/// Connection trouble, exhausted pools, and serialization failures or deadlocks
/// (SQLSTATE classes 08 and 40) may succeed on a later attempt.
fn is_transient(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db_error) => db_error
            .code()
            .is_some_and(|code| code.starts_with("08") || code.starts_with("40")),
        _ => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Inserted,
    /// A record for this view instance already exists; the first write wins.
    Duplicate,
}

/// Persistence port for abandonment records. Writes must be idempotent per view instance.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn add_record(&self, record: &AbandonmentRecord) -> Result<WriteOutcome, StoreError>;
}

/// Records stored in a PostgreSQL table keyed by view instance.
pub struct PgRecordStore {
    pool: PgPool,
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

impl PgRecordStore {
    pub async fn new(url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|error| StoreError::ConnectionError { error })?;

        Ok(Self { pool })
    }

    pub fn new_from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Wait for in-flight queries and close every connection.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn add_record(&self, record: &AbandonmentRecord) -> StoreResult<WriteOutcome> {
        let query = r#"
INSERT INTO abandonment_records
    (view_instance_id, video_id, watch_timestamp, day_flag, year_week, abandon_flag)
VALUES
    ($1, $2, $3, $4, $5, $6)
ON CONFLICT (view_instance_id) DO NOTHING
        "#;

        let result = sqlx::query(query)
            .bind(&record.view_instance_id)
            .bind(&record.video_id)
            .bind(record.watch_timestamp)
            .bind(record.day_flag.as_str())
            .bind(record.year_week.encoded())
            .bind(record.abandon_flag)
            .execute(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?;

        match result.rows_affected() {
            0 => Ok(WriteOutcome::Duplicate),
            _ => Ok(WriteOutcome::Inserted),
        }
    }
}

/// In-memory store with the same first-write-wins semantics, for tests.
#[derive(Clone, Default)]
pub struct MockRecordStore {
    records: Arc<Mutex<HashMap<String, AbandonmentRecord>>>,
    attempts: Arc<AtomicUsize>,
    transient_failures: Arc<AtomicUsize>,
    write_delay: Duration,
}

impl MockRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` writes with a retryable error.
    pub fn failing_first(self, count: usize) -> Self {
        self.transient_failures.store(count, Ordering::SeqCst);
        self
    }

    /// Hold every write for `delay` before applying it.
    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = delay;
        self
    }

    pub fn records(&self) -> Vec<AbandonmentRecord> {
        self.records
            .lock()
            .expect("poisoned store lock")
            .values()
            .cloned()
            .collect()
    }

    pub fn record(&self, view_instance_id: &str) -> Option<AbandonmentRecord> {
        self.records
            .lock()
            .expect("poisoned store lock")
            .get(view_instance_id)
            .cloned()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordStore for MockRecordStore {
    async fn add_record(&self, record: &AbandonmentRecord) -> StoreResult<WriteOutcome> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.write_delay.is_zero() {
            tokio::time::sleep(self.write_delay).await;
        }

        let failed = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failed {
            return Err(StoreError::Unavailable("mock write failure".to_owned()));
        }

        let mut records = self.records.lock().expect("poisoned store lock");
        if records.contains_key(&record.view_instance_id) {
            return Ok(WriteOutcome::Duplicate);
        }
        records.insert(record.view_instance_id.clone(), record.clone());
        Ok(WriteOutcome::Inserted)
    }
}
