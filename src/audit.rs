//! Audit events for externally significant actions.
//!
//! The dispatcher does not persist audit trails itself. It emits
//! [`AuditEvent`]s to an injected [`AuditSink`]; the embedding application
//! decides where they go.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::error::ValidationError;
use crate::event::ChangeKind;
use crate::queue::JobId;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    ChangeAccepted {
        actor: String,
        event_id: Uuid,
        job_id: JobId,
        kind: ChangeKind,
        subject_id: String,
        coalesced: bool,
        at: DateTime<Utc>,
    },
    ChangeRejected {
        actor: String,
        index: usize,
        reason: String,
        at: DateTime<Utc>,
    },
    JobQuarantined {
        job_id: JobId,
        kind: ChangeKind,
        subject_id: String,
        attempt_count: u32,
        reason: String,
        at: DateTime<Utc>,
    },
    JobResubmitted {
        actor: String,
        job_id: JobId,
        at: DateTime<Utc>,
    },
}

impl AuditEvent {
    pub(crate) fn rejected(actor: &str, index: usize, error: &ValidationError) -> Self {
        AuditEvent::ChangeRejected {
            actor: actor.to_string(),
            index,
            reason: error.to_string(),
            at: Utc::now(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AuditEvent::ChangeAccepted { .. } => "change_accepted",
            AuditEvent::ChangeRejected { .. } => "change_rejected",
            AuditEvent::JobQuarantined { .. } => "job_quarantined",
            AuditEvent::JobResubmitted { .. } => "job_resubmitted",
        }
    }
}

/// Destination for audit events. Must not block.
pub trait AuditSink: Send + Sync + 'static {
    fn record(&self, event: AuditEvent);
}

/// Sink that only logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpAuditSink;

impl AuditSink for NoOpAuditSink {
    fn record(&self, event: AuditEvent) {
        info!(audit = event.name(), event = ?event, "Audit event");
    }
}
