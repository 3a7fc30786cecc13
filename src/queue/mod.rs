// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable dispatch queue.
//!
//! The job table is the single source of truth for job state. Every
//! transition (`enqueue`, `dequeue_ready`, `ack`, `nack`, `release`) runs as
//! one SQLite transaction under the queue's write gate, and each UPDATE is
//! conditional on the state it expects (`WHERE state = 'in_flight'`), so a
//! job can never be handed to two workers.
//!
//! # Coalescing
//!
//! ```text
//! enqueue(E) for (kind, subject):
//!   no active job      → insert pending job, generation + 1
//!   pending job        → replace payload/event_ref (last write wins),
//!                        keep received_at (FIFO position)
//!   in_flight job      → replace payload/event_ref, set rerun_requested;
//!                        ack puts the job back to pending instead of succeeded
//! ```
//!
//! # Wakeups
//!
//! Any change that makes a job pending calls `Notify::notify_one`, which
//! stores a permit if the scheduler isn't waiting yet, so wakes aren't lost.

mod job;
mod store;

pub use job::{
    AckOutcome, DispatchJob, EnqueueOutcome, FailureRecord, JobId, JobState, KindCapacity,
    NackOutcome, PurgeReport, QueueStats,
};
pub use store::is_sqlite_busy_error;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::error::{DispatchError, Result};
use crate::event::{ChangeEvent, ChangeKind};
use crate::metrics;
use crate::retry::{Failure, RetryController, RetryDecision};
use store::{execute_with_retry, failure_from_row, from_millis, job_from_row, state_from, to_millis, JOB_COLUMNS};

/// How long terminal rows are kept before [`DispatchQueue::purge_terminal`]
/// removes them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retention {
    pub succeeded: Duration,
    pub quarantined: Duration,
    pub failure_records: Duration,
}

/// Outcome of a guarded transition, decided inside the transaction.
enum Guarded<T> {
    Done(T),
    Missing,
    WrongState(String),
}

/// SQLite-backed dispatch queue.
pub struct DispatchQueue {
    pool: SqlitePool,
    /// Serializes writers inside this process
    write_gate: Mutex<()>,
    notify: Arc<Notify>,
    retry: RetryController,
    path: String,
    wal_mode: bool,
    #[cfg(test)]
    faults: std::sync::atomic::AtomicU32,
}

impl DispatchQueue {
    /// Open (or create) the job store described by `config`.
    pub async fn open(config: &StoreConfig, retry: RetryController) -> Result<Self> {
        info!(path = %config.sqlite_path, "Opening dispatch queue");
        let pool = store::connect(config).await?;

        Ok(Self {
            pool,
            write_gate: Mutex::new(()),
            notify: Arc::new(Notify::new()),
            retry,
            path: config.sqlite_path.clone(),
            wal_mode: config.wal_mode && config.sqlite_path != store::IN_MEMORY,
            #[cfg(test)]
            faults: std::sync::atomic::AtomicU32::new(0),
        })
    }

    /// Open an in-memory queue (tests, standalone use).
    pub async fn in_memory(retry: RetryController) -> Result<Self> {
        Self::open(&StoreConfig::in_memory(), retry).await
    }

    pub fn retry_controller(&self) -> &RetryController {
        &self.retry
    }

    /// Database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Completes after the next enqueue or re-pend.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    fn wake(&self) {
        self.notify.notify_one();
    }

    /// Make the next `n` enqueue/ack/nack calls fail with a pool timeout.
    #[cfg(test)]
    pub(crate) fn fail_next_ops(&self, n: u32) {
        self.faults.store(n, std::sync::atomic::Ordering::SeqCst);
    }

    #[cfg(test)]
    fn injected_fault(&self) -> Result<()> {
        use std::sync::atomic::Ordering;
        match self.faults.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)) {
            Ok(_) => Err(DispatchError::Store(sqlx::Error::PoolTimedOut)),
            Err(_) => Ok(()),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Admission
    // ═══════════════════════════════════════════════════════════════════════

    /// Admit a change event, creating a job or coalescing into the active one.
    pub async fn enqueue(&self, event: &ChangeEvent) -> Result<EnqueueOutcome> {
        #[cfg(test)]
        self.injected_fault()?;
        let payload = serde_json::to_string(&event.change)?;
        let kind = event.kind();
        let subject_id = event.subject_id();
        let event_ref = event.id.to_string();
        let received = to_millis(event.received_at);

        let _gate = self.write_gate.lock().await;
        let pool = &self.pool;
        let (outcome, state) = execute_with_retry("enqueue", || {
            let payload = &payload;
            let event_ref = &event_ref;
            async move {
                let now = to_millis(Utc::now());
                let mut tx = pool.begin().await?;

                let active = sqlx::query(
                    "SELECT job_id, state FROM dispatch_jobs \
                     WHERE kind = ? AND subject_id = ? AND state IN ('pending', 'in_flight')",
                )
                .bind(kind.as_str())
                .bind(subject_id)
                .fetch_optional(&mut *tx)
                .await?;

                let result = match active {
                    Some(row) => {
                        let job_id: String = row.try_get("job_id")?;
                        let state = state_from(&row)?;
                        let rerun = state == JobState::InFlight;
                        sqlx::query(
                            "UPDATE dispatch_jobs SET payload = ?, event_ref = ?, last_received_at = ?, \
                             rerun_requested = (rerun_requested OR ?), updated_at = ? WHERE job_id = ?",
                        )
                        .bind(payload)
                        .bind(event_ref)
                        .bind(received)
                        .bind(rerun)
                        .bind(now)
                        .bind(&job_id)
                        .execute(&mut *tx)
                        .await?;
                        (
                            EnqueueOutcome {
                                job_id: JobId::from(job_id),
                                coalesced: true,
                            },
                            state,
                        )
                    }
                    None => {
                        let generation = next_generation(&mut tx, kind, subject_id).await?;
                        let job_id = JobId::derive(kind, subject_id, generation);
                        sqlx::query(
                            "INSERT INTO dispatch_jobs (job_id, kind, subject_id, generation, event_ref, \
                             payload, state, attempt_count, next_eligible_at, received_at, last_received_at, \
                             rerun_requested, created_at, updated_at) \
                             VALUES (?, ?, ?, ?, ?, ?, 'pending', 0, ?, ?, ?, 0, ?, ?)",
                        )
                        .bind(job_id.as_str())
                        .bind(kind.as_str())
                        .bind(subject_id)
                        .bind(generation)
                        .bind(event_ref)
                        .bind(payload)
                        .bind(now)
                        .bind(received)
                        .bind(received)
                        .bind(now)
                        .bind(now)
                        .execute(&mut *tx)
                        .await?;
                        (
                            EnqueueOutcome {
                                job_id,
                                coalesced: false,
                            },
                            JobState::Pending,
                        )
                    }
                };

                tx.commit().await?;
                Ok(result)
            }
        })
        .await?;
        drop(_gate);

        debug!(
            job_id = %outcome.job_id,
            event_id = %event.id,
            coalesced = outcome.coalesced,
            state = %state,
            "Change enqueued"
        );
        metrics::record_enqueue(kind.as_str(), outcome.coalesced);
        if !outcome.coalesced {
            self.wake();
        }
        Ok(outcome)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Delivery
    // ═══════════════════════════════════════════════════════════════════════

    /// Claim up to `max_n` ready jobs, oldest `received_at` first.
    ///
    /// Returned jobs are already `in_flight`.
    pub async fn dequeue_ready(&self, max_n: usize) -> Result<Vec<DispatchJob>> {
        self.dequeue_ready_with(max_n, &KindCapacity::unlimited()).await
    }

    /// Like [`dequeue_ready`](Self::dequeue_ready), with per-kind caps.
    pub async fn dequeue_ready_with(&self, max_n: usize, capacity: &KindCapacity) -> Result<Vec<DispatchJob>> {
        if max_n == 0 {
            return Ok(Vec::new());
        }
        let limit_for = |kind: ChangeKind| capacity.limit(kind).map_or(max_n, |cap| cap.min(max_n));

        let _gate = self.write_gate.lock().await;
        let pool = &self.pool;
        let claimed = execute_with_retry("dequeue_ready", || async move {
            let now = Utc::now();
            let now_ms = to_millis(now);
            let mut tx = pool.begin().await?;

            let mut candidates: Vec<(i64, DispatchJob)> = Vec::new();
            for kind in ChangeKind::ALL {
                let limit = limit_for(kind);
                if limit == 0 {
                    continue;
                }
                let rows = sqlx::query(&format!(
                    "SELECT rowid AS seq, {JOB_COLUMNS} FROM dispatch_jobs \
                     WHERE state = 'pending' AND next_eligible_at <= ? AND kind = ? \
                     ORDER BY received_at ASC, rowid ASC LIMIT ?"
                ))
                .bind(now_ms)
                .bind(kind.as_str())
                .bind(limit as i64)
                .fetch_all(&mut *tx)
                .await?;
                for row in &rows {
                    candidates.push((row.try_get("seq")?, job_from_row(row)?));
                }
            }

            candidates.sort_by(|(seq_a, a), (seq_b, b)| {
                a.received_at.cmp(&b.received_at).then(seq_a.cmp(seq_b))
            });
            candidates.truncate(max_n);

            let mut claimed = Vec::with_capacity(candidates.len());
            for (_, mut job) in candidates {
                let updated = sqlx::query(
                    "UPDATE dispatch_jobs SET state = 'in_flight', updated_at = ? \
                     WHERE job_id = ? AND state = 'pending'",
                )
                .bind(now_ms)
                .bind(job.job_id.as_str())
                .execute(&mut *tx)
                .await?;
                if updated.rows_affected() == 1 {
                    job.state = JobState::InFlight;
                    job.updated_at = from_millis(now_ms)?;
                    claimed.push(job);
                }
            }

            tx.commit().await?;
            Ok(claimed)
        })
        .await?;

        if !claimed.is_empty() {
            debug!(count = claimed.len(), "Dequeued ready jobs");
            metrics::record_dequeue(claimed.len());
        }
        Ok(claimed)
    }

    /// Earliest `next_eligible_at` among pending jobs.
    pub async fn next_eligible_at(&self) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT MIN(next_eligible_at) AS next FROM dispatch_jobs WHERE state = 'pending'")
            .fetch_one(&self.pool)
            .await?;
        let next: Option<i64> = row.try_get("next")?;
        Ok(next.map(from_millis).transpose()?)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Outcome reports
    // ═══════════════════════════════════════════════════════════════════════

    /// Mark an in-flight job as succeeded.
    ///
    /// If a newer change arrived while the job was running, the job goes back
    /// to `pending` with its attempt count reset.
    pub async fn ack(&self, job_id: &JobId) -> Result<AckOutcome> {
        #[cfg(test)]
        self.injected_fault()?;
        let _gate = self.write_gate.lock().await;
        let pool = &self.pool;
        let guarded = execute_with_retry("ack", || async move {
            let now = to_millis(Utc::now());
            let mut tx = pool.begin().await?;

            let Some(row) = sqlx::query("SELECT state, rerun_requested, last_received_at FROM dispatch_jobs WHERE job_id = ?")
                .bind(job_id.as_str())
                .fetch_optional(&mut *tx)
                .await?
            else {
                return Ok(Guarded::Missing);
            };
            let state = state_from(&row)?;
            if state != JobState::InFlight {
                return Ok(Guarded::WrongState(state.to_string()));
            }
            let rerun: bool = row.try_get("rerun_requested")?;
            let last_received: i64 = row.try_get("last_received_at")?;

            let outcome = if rerun {
                sqlx::query(
                    "UPDATE dispatch_jobs SET state = 'pending', rerun_requested = 0, attempt_count = 0, \
                     next_eligible_at = ?, received_at = ?, last_error = NULL, updated_at = ? \
                     WHERE job_id = ? AND state = 'in_flight'",
                )
                .bind(now)
                .bind(last_received)
                .bind(now)
                .bind(job_id.as_str())
                .execute(&mut *tx)
                .await?;
                AckOutcome::Requeued
            } else {
                sqlx::query(
                    "UPDATE dispatch_jobs SET state = 'succeeded', finished_at = ?, updated_at = ? \
                     WHERE job_id = ? AND state = 'in_flight'",
                )
                .bind(now)
                .bind(now)
                .bind(job_id.as_str())
                .execute(&mut *tx)
                .await?;
                AckOutcome::Succeeded
            };

            tx.commit().await?;
            Ok(Guarded::Done(outcome))
        })
        .await?;
        drop(_gate);

        let outcome = settle(job_id, "ack", JobState::InFlight, guarded)?;
        debug!(job_id = %job_id, outcome = ?outcome, "Job acked");
        if outcome == AckOutcome::Requeued {
            self.wake();
        }
        Ok(outcome)
    }

    /// Report a failed attempt; the retry controller decides what happens next.
    pub async fn nack(&self, job_id: &JobId, failure: Failure) -> Result<NackOutcome> {
        #[cfg(test)]
        self.injected_fault()?;
        let _gate = self.write_gate.lock().await;
        let pool = &self.pool;
        let retry = &self.retry;
        let failure = &failure;
        let guarded = execute_with_retry("nack", || async move {
            let now = Utc::now();
            let now_ms = to_millis(now);
            let mut tx = pool.begin().await?;

            let Some(row) = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM dispatch_jobs WHERE job_id = ?"))
                .bind(job_id.as_str())
                .fetch_optional(&mut *tx)
                .await?
            else {
                return Ok(Guarded::Missing);
            };
            let job = job_from_row(&row)?;
            if job.state != JobState::InFlight {
                return Ok(Guarded::WrongState(job.state.to_string()));
            }

            let attempt_count = job.attempt_count.saturating_add(1);
            let outcome = match retry.decide(attempt_count, failure, now) {
                RetryDecision::Retry { next_eligible_at, .. } => {
                    sqlx::query(
                        "UPDATE dispatch_jobs SET state = 'pending', attempt_count = ?, next_eligible_at = ?, \
                         last_error = ?, rerun_requested = 0, updated_at = ? \
                         WHERE job_id = ? AND state = 'in_flight'",
                    )
                    .bind(i64::from(attempt_count))
                    .bind(to_millis(next_eligible_at))
                    .bind(failure.reason())
                    .bind(now_ms)
                    .bind(job_id.as_str())
                    .execute(&mut *tx)
                    .await?;
                    NackOutcome::Retrying {
                        attempt_count,
                        next_eligible_at: from_millis(to_millis(next_eligible_at))?,
                    }
                }
                RetryDecision::Quarantine => {
                    sqlx::query(
                        "UPDATE dispatch_jobs SET state = 'quarantined', attempt_count = ?, last_error = ?, \
                         rerun_requested = 0, finished_at = ?, updated_at = ? \
                         WHERE job_id = ? AND state = 'in_flight'",
                    )
                    .bind(i64::from(attempt_count))
                    .bind(failure.reason())
                    .bind(now_ms)
                    .bind(now_ms)
                    .bind(job_id.as_str())
                    .execute(&mut *tx)
                    .await?;

                    sqlx::query(
                        "INSERT INTO quarantine_log (job_id, kind, subject_id, event_ref, attempt_count, \
                         fatal, reason, recorded_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                    )
                    .bind(job_id.as_str())
                    .bind(job.kind.as_str())
                    .bind(&job.subject_id)
                    .bind(job.event_ref.to_string())
                    .bind(i64::from(attempt_count))
                    .bind(failure.is_fatal())
                    .bind(failure.reason())
                    .bind(now_ms)
                    .execute(&mut *tx)
                    .await?;

                    // A change that arrived mid-flight still deserves its own attempts
                    let successor = if job.rerun_requested {
                        Some(insert_successor(&mut tx, &job, now_ms).await?)
                    } else {
                        None
                    };

                    NackOutcome::Quarantined {
                        attempt_count,
                        successor,
                    }
                }
            };

            tx.commit().await?;
            Ok(Guarded::Done(outcome))
        })
        .await?;
        drop(_gate);

        let outcome = settle(job_id, "nack", JobState::InFlight, guarded)?;
        match &outcome {
            NackOutcome::Retrying {
                attempt_count,
                next_eligible_at,
            } => {
                debug!(
                    job_id = %job_id,
                    attempt_count,
                    next_eligible_at = %next_eligible_at,
                    reason = failure.reason(),
                    "Job scheduled for retry"
                );
            }
            NackOutcome::Quarantined {
                attempt_count,
                successor,
            } => {
                warn!(
                    job_id = %job_id,
                    attempt_count,
                    fatal = failure.is_fatal(),
                    reason = failure.reason(),
                    "Job quarantined"
                );
                if let Some(successor) = successor {
                    debug!(job_id = %successor, "Successor job created for mid-flight change");
                    self.wake();
                }
            }
        }
        Ok(outcome)
    }

    /// Return an interrupted in-flight job to `pending` without counting an attempt.
    pub async fn release(&self, job_id: &JobId) -> Result<()> {
        let _gate = self.write_gate.lock().await;
        let pool = &self.pool;
        let guarded = execute_with_retry("release", || async move {
            let now = to_millis(Utc::now());
            let mut tx = pool.begin().await?;

            let Some(row) = sqlx::query("SELECT state FROM dispatch_jobs WHERE job_id = ?")
                .bind(job_id.as_str())
                .fetch_optional(&mut *tx)
                .await?
            else {
                return Ok(Guarded::Missing);
            };
            let state = state_from(&row)?;
            if state != JobState::InFlight {
                return Ok(Guarded::WrongState(state.to_string()));
            }

            sqlx::query(
                "UPDATE dispatch_jobs SET state = 'pending', rerun_requested = 0, next_eligible_at = ?, \
                 updated_at = ? WHERE job_id = ? AND state = 'in_flight'",
            )
            .bind(now)
            .bind(now)
            .bind(job_id.as_str())
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(Guarded::Done(()))
        })
        .await?;
        drop(_gate);

        settle(job_id, "release", JobState::InFlight, guarded)?;
        debug!(job_id = %job_id, "Job released back to pending");
        self.wake();
        Ok(())
    }

    /// Return every `in_flight` job to `pending`.
    ///
    /// Run once at startup: jobs left in flight belong to a process that
    /// died mid-execution and must be redelivered.
    pub async fn recover_in_flight(&self) -> Result<u64> {
        let _gate = self.write_gate.lock().await;
        let pool = &self.pool;
        let recovered = execute_with_retry("recover_in_flight", || async move {
            let now = to_millis(Utc::now());
            let result = sqlx::query(
                "UPDATE dispatch_jobs SET state = 'pending', rerun_requested = 0, next_eligible_at = ?, \
                 updated_at = ? WHERE state = 'in_flight'",
            )
            .bind(now)
            .bind(now)
            .execute(pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await?;
        drop(_gate);

        if recovered > 0 {
            info!(recovered, "Recovered in-flight jobs from previous run");
            self.wake();
        }
        Ok(recovered)
    }

    /// Put a quarantined job back to `pending` with a fresh attempt budget.
    ///
    /// Refused while another job for the same subject is active; that job
    /// already carries the newer payload.
    pub async fn resubmit(&self, job_id: &JobId) -> Result<()> {
        let _gate = self.write_gate.lock().await;
        let pool = &self.pool;
        let guarded = execute_with_retry("resubmit", || async move {
            let now = to_millis(Utc::now());
            let mut tx = pool.begin().await?;

            let Some(row) = sqlx::query("SELECT state, kind, subject_id FROM dispatch_jobs WHERE job_id = ?")
                .bind(job_id.as_str())
                .fetch_optional(&mut *tx)
                .await?
            else {
                return Ok(Guarded::Missing);
            };
            let state = state_from(&row)?;
            if state != JobState::Quarantined {
                return Ok(Guarded::WrongState(state.to_string()));
            }
            let kind: String = row.try_get("kind")?;
            let subject_id: String = row.try_get("subject_id")?;

            let active = sqlx::query(
                "SELECT job_id FROM dispatch_jobs \
                 WHERE kind = ? AND subject_id = ? AND state IN ('pending', 'in_flight')",
            )
            .bind(&kind)
            .bind(&subject_id)
            .fetch_optional(&mut *tx)
            .await?;
            if let Some(active) = active {
                let other: String = active.try_get("job_id")?;
                return Ok(Guarded::WrongState(format!("superseded by active job {other}")));
            }

            sqlx::query(
                "UPDATE dispatch_jobs SET state = 'pending', attempt_count = 0, next_eligible_at = ?, \
                 received_at = ?, last_error = NULL, finished_at = NULL, updated_at = ? \
                 WHERE job_id = ? AND state = 'quarantined'",
            )
            .bind(now)
            .bind(now)
            .bind(now)
            .bind(job_id.as_str())
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(Guarded::Done(()))
        })
        .await?;
        drop(_gate);

        settle(job_id, "resubmit", JobState::Quarantined, guarded)?;
        info!(job_id = %job_id, "Quarantined job resubmitted");
        self.wake();
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Inspection
    // ═══════════════════════════════════════════════════════════════════════

    pub async fn get(&self, job_id: &JobId) -> Result<Option<DispatchJob>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM dispatch_jobs WHERE job_id = ?"))
            .bind(job_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(job_from_row).transpose()?)
    }

    /// The active (pending or in-flight) job for a subject, if any.
    pub async fn active_job(&self, kind: ChangeKind, subject_id: &str) -> Result<Option<DispatchJob>> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM dispatch_jobs \
             WHERE kind = ? AND subject_id = ? AND state IN ('pending', 'in_flight')"
        ))
        .bind(kind.as_str())
        .bind(subject_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(job_from_row).transpose()?)
    }

    /// Every job ever recorded for a subject, oldest generation first.
    pub async fn history(&self, kind: ChangeKind, subject_id: &str) -> Result<Vec<DispatchJob>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM dispatch_jobs WHERE kind = ? AND subject_id = ? ORDER BY generation ASC"
        ))
        .bind(kind.as_str())
        .bind(subject_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(job_from_row).collect::<std::result::Result<_, _>>()?)
    }

    /// Quarantined jobs, most recent first.
    pub async fn quarantined(&self, limit: usize) -> Result<Vec<DispatchJob>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM dispatch_jobs WHERE state = 'quarantined' \
             ORDER BY finished_at DESC, rowid DESC LIMIT ?"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(job_from_row).collect::<std::result::Result<_, _>>()?)
    }

    /// Durable failure records, most recent first.
    pub async fn failure_records(&self, limit: usize) -> Result<Vec<FailureRecord>> {
        let rows = sqlx::query(
            "SELECT id, job_id, kind, subject_id, event_ref, attempt_count, fatal, reason, recorded_at \
             FROM quarantine_log ORDER BY id DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(failure_from_row).collect::<std::result::Result<_, _>>()?)
    }

    /// Job counts by state.
    pub async fn stats(&self) -> Result<QueueStats> {
        let rows = sqlx::query(
            "SELECT state, COUNT(*) AS n, SUM(CASE WHEN attempt_count > 0 THEN 1 ELSE 0 END) AS failed \
             FROM dispatch_jobs GROUP BY state",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut stats = QueueStats::default();
        for row in &rows {
            let n: i64 = row.try_get("n")?;
            let n = u64::try_from(n).unwrap_or(0);
            match state_from(row)? {
                JobState::Pending => {
                    stats.pending = n;
                    let failed: i64 = row.try_get("failed")?;
                    stats.retrying = u64::try_from(failed).unwrap_or(0);
                }
                JobState::InFlight => stats.in_flight = n,
                JobState::Succeeded => stats.succeeded = n,
                JobState::Quarantined => stats.quarantined = n,
            }
        }
        Ok(stats)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Maintenance
    // ═══════════════════════════════════════════════════════════════════════

    /// Delete terminal jobs and failure records older than their retention.
    pub async fn purge_terminal(&self, retention: &Retention) -> Result<PurgeReport> {
        let now = Utc::now();
        let cutoff = |keep: Duration| {
            let keep = chrono::Duration::from_std(keep).unwrap_or(chrono::Duration::MAX);
            to_millis(now.checked_sub_signed(keep).unwrap_or(DateTime::<Utc>::MIN_UTC))
        };
        let succeeded_before = cutoff(retention.succeeded);
        let quarantined_before = cutoff(retention.quarantined);
        let records_before = cutoff(retention.failure_records);

        let _gate = self.write_gate.lock().await;
        let pool = &self.pool;
        let report = execute_with_retry("purge_terminal", || async move {
            let mut tx = pool.begin().await?;
            let succeeded = sqlx::query("DELETE FROM dispatch_jobs WHERE state = 'succeeded' AND finished_at < ?")
                .bind(succeeded_before)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            let quarantined = sqlx::query("DELETE FROM dispatch_jobs WHERE state = 'quarantined' AND finished_at < ?")
                .bind(quarantined_before)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            let failure_records = sqlx::query("DELETE FROM quarantine_log WHERE recorded_at < ?")
                .bind(records_before)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            tx.commit().await?;
            Ok(PurgeReport {
                succeeded,
                quarantined,
                failure_records,
            })
        })
        .await?;

        if report.total() > 0 {
            info!(
                succeeded = report.succeeded,
                quarantined = report.quarantined,
                failure_records = report.failure_records,
                "Purged terminal jobs"
            );
        }
        Ok(report)
    }

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn checkpoint(&self) -> Result<()> {
        if !self.wal_mode {
            return Ok(());
        }
        let pool = &self.pool;
        execute_with_retry("checkpoint", || async move {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(pool).await
        })
        .await?;
        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Checkpoint and close the connection pool.
    pub async fn close(&self) {
        if let Err(e) = self.checkpoint().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Dispatch queue closed");
    }
}

/// Map a guarded transition result to the crate error type.
fn settle<T>(job_id: &JobId, op: &'static str, expected: JobState, guarded: Guarded<T>) -> Result<T> {
    match guarded {
        Guarded::Done(value) => Ok(value),
        Guarded::Missing => Err(DispatchError::JobNotFound(job_id.to_string())),
        Guarded::WrongState(actual) => Err(DispatchError::InvalidTransition {
            job_id: job_id.to_string(),
            op,
            expected: expected.as_str(),
            actual,
        }),
    }
}

async fn next_generation(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    kind: ChangeKind,
    subject_id: &str,
) -> std::result::Result<i64, sqlx::Error> {
    let row = sqlx::query(
        "INSERT INTO subject_generations (kind, subject_id, generation) VALUES (?, ?, 1) \
         ON CONFLICT(kind, subject_id) DO UPDATE SET generation = generation + 1 \
         RETURNING generation",
    )
    .bind(kind.as_str())
    .bind(subject_id)
    .fetch_one(&mut **tx)
    .await?;
    row.try_get("generation")
}

async fn insert_successor(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    job: &DispatchJob,
    now_ms: i64,
) -> std::result::Result<JobId, sqlx::Error> {
    let generation = next_generation(tx, job.kind, &job.subject_id).await?;
    let job_id = JobId::derive(job.kind, &job.subject_id, generation);
    let payload = serde_json::to_string(&job.change).map_err(store::decode_err)?;
    let last_received = to_millis(job.last_received_at);

    sqlx::query(
        "INSERT INTO dispatch_jobs (job_id, kind, subject_id, generation, event_ref, payload, state, \
         attempt_count, next_eligible_at, received_at, last_received_at, rerun_requested, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, 'pending', 0, ?, ?, ?, 0, ?, ?)",
    )
    .bind(job_id.as_str())
    .bind(job.kind.as_str())
    .bind(&job.subject_id)
    .bind(generation)
    .bind(job.event_ref.to_string())
    .bind(payload)
    .bind(now_ms)
    .bind(last_received)
    .bind(last_received)
    .bind(now_ms)
    .bind(now_ms)
    .execute(&mut **tx)
    .await?;

    Ok(job_id)
}
