//! Dispatch job model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::event::{Change, ChangeKind};

/// Job lifecycle state.
///
/// ```text
/// pending ──dequeue──→ in_flight ──ack──→ succeeded
///    ↑                    │
///    └──nack (retry)──────┤
///    └──release───────────┤
///                         └──nack (fatal / exhausted)──→ quarantined
/// ```
///
/// A failed attempt that will be retried is stored as `pending` with a
/// future `next_eligible_at` and a non-zero `attempt_count`; see
/// [`DispatchJob::is_retrying`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    InFlight,
    Succeeded,
    Quarantined,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::InFlight => "in_flight",
            JobState::Succeeded => "succeeded",
            JobState::Quarantined => "quarantined",
        }
    }

    /// Active jobs are the ones new notifications coalesce into.
    pub fn is_active(&self) -> bool {
        matches!(self, JobState::Pending | JobState::InFlight)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "in_flight" => Ok(JobState::InFlight),
            "succeeded" => Ok(JobState::Succeeded),
            "quarantined" => Ok(JobState::Quarantined),
            other => Err(format!("invalid job state: {other}")),
        }
    }
}

/// Job identifier: `<kind>:<subject_id>#<generation>`.
///
/// Every notification for a subject maps to the same id while that
/// subject's job is active. A new generation starts once the previous job
/// reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn derive(kind: ChangeKind, subject_id: &str, generation: i64) -> Self {
        Self(format!("{}:{}#{}", kind.as_str(), subject_id, generation))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A unit of replication work, as stored in the job table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchJob {
    pub job_id: JobId,
    pub kind: ChangeKind,
    pub subject_id: String,
    pub generation: i64,
    /// Latest change event coalesced into this job (lookup only).
    pub event_ref: Uuid,
    /// Latest payload; last write wins.
    pub change: Change,
    pub state: JobState,
    /// Failed attempts so far.
    pub attempt_count: u32,
    pub next_eligible_at: DateTime<Utc>,
    /// First notification of the current window (FIFO key).
    pub received_at: DateTime<Utc>,
    pub last_received_at: DateTime<Utc>,
    /// A newer notification arrived while this job was in flight.
    pub rerun_requested: bool,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl DispatchJob {
    /// Pending after at least one failed attempt.
    pub fn is_retrying(&self) -> bool {
        self.state == JobState::Pending && self.attempt_count > 0
    }
}

/// Result of admitting a change event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnqueueOutcome {
    pub job_id: JobId,
    /// The event merged into an already active job.
    pub coalesced: bool,
}

/// Result of acknowledging a successful attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    Succeeded,
    /// A newer change arrived mid-flight; the job is pending again.
    Requeued,
}

/// Result of reporting a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum NackOutcome {
    Retrying {
        attempt_count: u32,
        next_eligible_at: DateTime<Utc>,
    },
    Quarantined {
        attempt_count: u32,
        /// Next-generation job carrying a change that arrived mid-flight.
        successor: Option<JobId>,
    },
}

/// Durable record written when a job is quarantined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub id: i64,
    pub job_id: JobId,
    pub kind: ChangeKind,
    pub subject_id: String,
    pub event_ref: Uuid,
    pub attempt_count: u32,
    pub fatal: bool,
    pub reason: String,
    pub recorded_at: DateTime<Utc>,
}

/// Per-kind cap on how many jobs a dequeue may hand out.
///
/// Kinds without an entry are limited only by the overall `max_n`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KindCapacity(BTreeMap<ChangeKind, usize>);

impl KindCapacity {
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn with_limit(mut self, kind: ChangeKind, available: usize) -> Self {
        self.0.insert(kind, available);
        self
    }

    pub fn set(&mut self, kind: ChangeKind, available: usize) {
        self.0.insert(kind, available);
    }

    pub fn limit(&self, kind: ChangeKind) -> Option<usize> {
        self.0.get(&kind).copied()
    }
}

/// Job counts by state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    /// Pending jobs waiting out a backoff (subset of `pending`).
    pub retrying: u64,
    pub in_flight: u64,
    pub succeeded: u64,
    pub quarantined: u64,
}

impl QueueStats {
    pub fn active(&self) -> u64 {
        self.pending + self.in_flight
    }

    pub fn total(&self) -> u64 {
        self.pending + self.in_flight + self.succeeded + self.quarantined
    }
}

/// Rows removed by a retention purge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub succeeded: u64,
    pub quarantined: u64,
    pub failure_records: u64,
}

impl PurgeReport {
    pub fn total(&self) -> u64 {
        self.succeeded + self.quarantined + self.failure_records
    }
}
