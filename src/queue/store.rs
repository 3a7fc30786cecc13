// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite plumbing for the job table.
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when another process holds
//! the write lock. Every queue operation runs as one closure through
//! [`execute_with_retry`], which re-runs the whole transaction with
//! exponential backoff. Inside a process, writers are already serialized by
//! the queue's write gate, so busy errors only come from other processes
//! sharing the file.
//!
//! # Timestamps
//!
//! All times are stored as INTEGER milliseconds since the Unix epoch.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use super::job::{DispatchJob, FailureRecord, JobId, JobState};
use crate::config::StoreConfig;
use crate::error::{DispatchError, Result};
use crate::event::{Change, ChangeKind};

/// Configuration for SQLite busy retry behavior
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

pub(crate) const IN_MEMORY: &str = ":memory:";

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS dispatch_jobs (
        job_id            TEXT PRIMARY KEY,
        kind              TEXT NOT NULL,
        subject_id        TEXT NOT NULL,
        generation        INTEGER NOT NULL,
        event_ref         TEXT NOT NULL,
        payload           TEXT NOT NULL,
        state             TEXT NOT NULL,
        attempt_count     INTEGER NOT NULL DEFAULT 0,
        next_eligible_at  INTEGER NOT NULL,
        received_at       INTEGER NOT NULL,
        last_received_at  INTEGER NOT NULL,
        rerun_requested   INTEGER NOT NULL DEFAULT 0,
        last_error        TEXT,
        created_at        INTEGER NOT NULL,
        updated_at        INTEGER NOT NULL,
        finished_at       INTEGER
    )
    "#,
    // At most one active job per subject
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_dispatch_jobs_active_subject
        ON dispatch_jobs (kind, subject_id)
        WHERE state IN ('pending', 'in_flight')
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_dispatch_jobs_ready
        ON dispatch_jobs (state, next_eligible_at)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS subject_generations (
        kind        TEXT NOT NULL,
        subject_id  TEXT NOT NULL,
        generation  INTEGER NOT NULL,
        PRIMARY KEY (kind, subject_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS quarantine_log (
        id             INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id         TEXT NOT NULL,
        kind           TEXT NOT NULL,
        subject_id     TEXT NOT NULL,
        event_ref      TEXT NOT NULL,
        attempt_count  INTEGER NOT NULL,
        fatal          INTEGER NOT NULL,
        reason         TEXT NOT NULL,
        recorded_at    INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_quarantine_log_recorded
        ON quarantine_log (recorded_at)
    "#,
];

/// Columns selected for a [`DispatchJob`], in [`job_from_row`] order.
pub(crate) const JOB_COLUMNS: &str = "job_id, kind, subject_id, generation, event_ref, payload, \
     state, attempt_count, next_eligible_at, received_at, last_received_at, rerun_requested, \
     last_error, created_at, updated_at, finished_at";

/// Check if an error is a retryable SQLite busy/locked error
pub fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
pub(crate) async fn execute_with_retry<F, Fut, T>(
    operation_name: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts, "SQLite operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::store_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(operation = operation_name, attempts, "SQLite busy, max retries exceeded");
                }
                return Err(e);
            }
        }
    }
}

/// Open the pool and create the schema.
pub(crate) async fn connect(config: &StoreConfig) -> Result<SqlitePool> {
    let pool = if config.sqlite_path == IN_MEMORY {
        // Each in-memory connection is its own database: pin a single one
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| DispatchError::Config(format!("Invalid SQLite path: {}", e)))?;
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?
    } else {
        let journal = if config.wal_mode {
            SqliteJournalMode::Wal
        } else {
            SqliteJournalMode::Delete
        };
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", config.sqlite_path))
            .map_err(|e| DispatchError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(journal)
            .synchronous(SqliteSynchronous::Normal)
            .create_if_missing(true);
        SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(options)
            .await?
    };

    for statement in SCHEMA {
        sqlx::query(statement).execute(&pool).await?;
    }

    Ok(pool)
}

pub(crate) fn decode_err<E>(e: E) -> sqlx::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    sqlx::Error::Decode(e.into())
}

pub(crate) fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> std::result::Result<DateTime<Utc>, sqlx::Error> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| decode_err(format!("timestamp out of range: {ms}")))
}

fn count_from(value: i64) -> std::result::Result<u32, sqlx::Error> {
    u32::try_from(value).map_err(decode_err)
}

pub(crate) fn kind_from(row: &SqliteRow) -> std::result::Result<ChangeKind, sqlx::Error> {
    let kind: String = row.try_get("kind")?;
    kind.parse::<ChangeKind>().map_err(decode_err)
}

pub(crate) fn state_from(row: &SqliteRow) -> std::result::Result<JobState, sqlx::Error> {
    let state: String = row.try_get("state")?;
    state.parse::<JobState>().map_err(decode_err)
}

pub(crate) fn job_from_row(row: &SqliteRow) -> std::result::Result<DispatchJob, sqlx::Error> {
    let job_id: String = row.try_get("job_id")?;
    let event_ref: String = row.try_get("event_ref")?;
    let payload: String = row.try_get("payload")?;
    let change: Change = serde_json::from_str(&payload).map_err(decode_err)?;
    let finished_at: Option<i64> = row.try_get("finished_at")?;

    Ok(DispatchJob {
        job_id: JobId::from(job_id),
        kind: kind_from(row)?,
        subject_id: row.try_get("subject_id")?,
        generation: row.try_get("generation")?,
        event_ref: Uuid::parse_str(&event_ref).map_err(decode_err)?,
        change,
        state: state_from(row)?,
        attempt_count: count_from(row.try_get("attempt_count")?)?,
        next_eligible_at: from_millis(row.try_get("next_eligible_at")?)?,
        received_at: from_millis(row.try_get("received_at")?)?,
        last_received_at: from_millis(row.try_get("last_received_at")?)?,
        rerun_requested: row.try_get("rerun_requested")?,
        last_error: row.try_get("last_error")?,
        created_at: from_millis(row.try_get("created_at")?)?,
        updated_at: from_millis(row.try_get("updated_at")?)?,
        finished_at: finished_at.map(from_millis).transpose()?,
    })
}

pub(crate) fn failure_from_row(row: &SqliteRow) -> std::result::Result<FailureRecord, sqlx::Error> {
    let job_id: String = row.try_get("job_id")?;
    let event_ref: String = row.try_get("event_ref")?;

    Ok(FailureRecord {
        id: row.try_get("id")?,
        job_id: JobId::from(job_id),
        kind: kind_from(row)?,
        subject_id: row.try_get("subject_id")?,
        event_ref: Uuid::parse_str(&event_ref).map_err(decode_err)?,
        attempt_count: count_from(row.try_get("attempt_count")?)?,
        fatal: row.try_get("fatal")?,
        reason: row.try_get("reason")?,
        recorded_at: from_millis(row.try_get("recorded_at")?)?,
    })
}
