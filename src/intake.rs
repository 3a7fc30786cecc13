// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Event intake: validates raw change notifications and admits them to the
//! dispatch queue.
//!
//! # Flow
//!
//! ```text
//! refresh_projects {projects: [..]} ─┐
//! refresh_wikis    {projects: [..]} ─┼─→ Vec<RawChange> ─→ submit()
//! receive_events   {event_name, ..} ─┘                       │
//!                                                 per item:  │
//!                                   validate ─✗─→ Rejected(ValidationError)
//!                                       │
//!                                       ✓
//!                                       ↓
//!                          ChangeEvent ─→ queue.enqueue() ─✗─→ Failed(store error)
//!                                                          │
//!                                                          ✓
//!                                                          ↓
//!                                                   Accepted{job_id}
//! ```
//!
//! A bad item never fails the batch, and neither does a store error on one
//! item. Intake performs no replication.
//!
//! # Authorization
//!
//! Authentication happens outside this crate. The boundary passes the
//! result in as a [`CallerIdentity`]; every operation here requires the
//! admin capability.

use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditSink};
use crate::error::{DispatchError, Result, ValidationError};
use crate::event::{fingerprint_of, Change, ChangeEvent, ChangeKind, KeyChange};
use crate::metrics;
use crate::queue::{DispatchQueue, JobId};

/// Who is calling, as established by the external authorization layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    pub node_id: String,
    admin: bool,
}

impl CallerIdentity {
    pub fn admin(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            admin: true,
        }
    }

    pub fn unprivileged(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            admin: false,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.admin
    }

    pub(crate) fn require_admin(&self, operation: &str) -> Result<()> {
        if self.admin {
            Ok(())
        } else {
            warn!(node_id = %self.node_id, operation, "Rejected caller without admin capability");
            Err(DispatchError::Unauthorized(format!(
                "{} requires admin capability (caller {})",
                operation, self.node_id
            )))
        }
    }
}

/// An unvalidated change descriptor as received from the boundary.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawChange {
    /// Change kind / event name, e.g. `"key_create"`.
    pub kind: String,
    /// Project id or key id; a JSON string or integer.
    pub subject_id: Option<Value>,
    /// Key material (key events only).
    pub key: Option<String>,
    /// Optional caller-supplied fingerprint (key events only).
    pub fingerprint: Option<String>,
}

impl RawChange {
    pub fn new(kind: impl Into<String>, subject_id: Option<Value>) -> Self {
        Self {
            kind: kind.into(),
            subject_id,
            ..Default::default()
        }
    }

    pub fn repository_update(project_id: impl Into<Value>) -> Self {
        Self::new(ChangeKind::RepositoryUpdate.as_str(), Some(project_id.into()))
    }

    pub fn wiki_update(project_id: impl Into<Value>) -> Self {
        Self::new(ChangeKind::WikiUpdate.as_str(), Some(project_id.into()))
    }

    pub fn key_create(key_id: impl Into<Value>, key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            ..Self::new(ChangeKind::KeyCreate.as_str(), Some(key_id.into()))
        }
    }

    pub fn key_destroy(key_id: impl Into<Value>, key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            ..Self::new(ChangeKind::KeyDestroy.as_str(), Some(key_id.into()))
        }
    }

    /// Build from `receive_events` params: `{event_name, id, key, fingerprint?}`.
    ///
    /// Only the request-level `event_name` is checked here; the rest is
    /// validated per item by [`validate`](Self::validate).
    pub fn from_event_params(params: &Value) -> std::result::Result<Self, ValidationError> {
        let kind = match params.get("event_name") {
            None | Some(Value::Null) => return Err(ValidationError::missing("event_name")),
            Some(Value::String(name)) if name.trim().is_empty() => {
                return Err(ValidationError::missing("event_name"))
            }
            Some(Value::String(name)) => name.trim().to_string(),
            Some(_) => return Err(ValidationError::malformed("event_name", "expected a string")),
        };
        let text = |field: &str| params.get(field).and_then(Value::as_str).map(str::to_string);

        Ok(Self {
            kind,
            subject_id: params.get("id").cloned(),
            key: text("key"),
            fingerprint: text("fingerprint"),
        })
    }

    /// Check the fields required by the kind and build the typed change.
    pub fn validate(&self) -> std::result::Result<Change, ValidationError> {
        let kind: ChangeKind = self.kind.parse()?;
        match kind {
            ChangeKind::RepositoryUpdate => Ok(Change::RepositoryUpdate {
                project_id: normalize_id("project_id", self.subject_id.as_ref())?,
            }),
            ChangeKind::WikiUpdate => Ok(Change::WikiUpdate {
                project_id: normalize_id("project_id", self.subject_id.as_ref())?,
            }),
            ChangeKind::KeyCreate => Ok(Change::KeyCreate(self.key_change()?)),
            ChangeKind::KeyDestroy => Ok(Change::KeyDestroy(self.key_change()?)),
        }
    }

    fn key_change(&self) -> std::result::Result<KeyChange, ValidationError> {
        let key_id = normalize_id("id", self.subject_id.as_ref())?;
        let key = self
            .key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| ValidationError::missing("key"))?;
        let fingerprint = match self.fingerprint.as_deref().map(str::trim) {
            Some(fp) if !fp.is_empty() => fp.to_string(),
            _ => fingerprint_of(key),
        };
        Ok(KeyChange {
            key_id,
            key: key.to_string(),
            fingerprint,
        })
    }
}

/// Ids arrive as strings or integers; store them as trimmed strings.
fn normalize_id(field: &'static str, value: Option<&Value>) -> std::result::Result<String, ValidationError> {
    match value {
        None | Some(Value::Null) => Err(ValidationError::missing(field)),
        Some(Value::String(s)) => {
            let s = s.trim();
            if s.is_empty() {
                Err(ValidationError::missing(field))
            } else {
                Ok(s.to_string())
            }
        }
        Some(Value::Number(n)) if n.is_u64() || n.is_i64() => Ok(n.to_string()),
        Some(other) => Err(ValidationError::malformed(
            field,
            format!("expected string or integer id, got {}", json_type(other)),
        )),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn rejection_label(error: &ValidationError) -> &'static str {
    match error {
        ValidationError::MissingField { .. } => "missing_field",
        ValidationError::Malformed { .. } => "malformed",
        ValidationError::UnknownKind(_) => "unknown_kind",
    }
}

/// Result for one item of a submitted batch.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    Accepted {
        event_id: Uuid,
        job_id: JobId,
        coalesced: bool,
    },
    Rejected(ValidationError),
    /// Valid, but the job store could not admit it. Safe to resubmit.
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ItemResult {
    /// Position in the submitted batch.
    pub index: usize,
    pub outcome: ItemOutcome,
}

/// Overall status of a submission (maps to HTTP 200 / 400 / 503 at the
/// boundary).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntakeStatus {
    Accepted,
    ValidationFailed,
    /// At least one valid item could not be stored.
    Unavailable,
}

/// Per-item results of [`EventIntake::submit`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IntakeReport {
    pub items: Vec<ItemResult>,
}

impl IntakeReport {
    pub fn status(&self) -> IntakeStatus {
        if self.failures().next().is_some() {
            IntakeStatus::Unavailable
        } else if self.errors().next().is_some() {
            IntakeStatus::ValidationFailed
        } else {
            IntakeStatus::Accepted
        }
    }

    pub fn accepted_job_ids(&self) -> Vec<&JobId> {
        self.items
            .iter()
            .filter_map(|item| match &item.outcome {
                ItemOutcome::Accepted { job_id, .. } => Some(job_id),
                ItemOutcome::Rejected(_) | ItemOutcome::Failed { .. } => None,
            })
            .collect()
    }

    /// `(index, error)` for every rejected item.
    pub fn errors(&self) -> impl Iterator<Item = (usize, &ValidationError)> {
        self.items.iter().filter_map(|item| match &item.outcome {
            ItemOutcome::Rejected(e) => Some((item.index, e)),
            ItemOutcome::Accepted { .. } | ItemOutcome::Failed { .. } => None,
        })
    }

    /// `(index, reason)` for every item the store failed to admit.
    pub fn failures(&self) -> impl Iterator<Item = (usize, &str)> {
        self.items.iter().filter_map(|item| match &item.outcome {
            ItemOutcome::Failed { reason } => Some((item.index, reason.as_str())),
            ItemOutcome::Accepted { .. } | ItemOutcome::Rejected(_) => None,
        })
    }
}

/// Validates change notifications and admits them to the queue.
#[derive(Clone)]
pub struct EventIntake {
    queue: Arc<DispatchQueue>,
    audit: Arc<dyn AuditSink>,
}

impl EventIntake {
    pub fn new(queue: Arc<DispatchQueue>, audit: Arc<dyn AuditSink>) -> Self {
        Self { queue, audit }
    }

    /// Validate and enqueue a batch; malformed items and store errors are
    /// reported per item, not fatal.
    ///
    /// Fails as a whole only for an unauthorized caller.
    #[instrument(skip_all, fields(node_id = %caller.node_id, items = batch.len()))]
    pub async fn submit(&self, caller: &CallerIdentity, batch: Vec<RawChange>) -> Result<IntakeReport> {
        caller.require_admin("submit")?;

        let mut report = IntakeReport {
            items: Vec::with_capacity(batch.len()),
        };

        for (index, raw) in batch.into_iter().enumerate() {
            let change = match raw.validate() {
                Ok(change) => change,
                Err(e) => {
                    debug!(index, kind = %raw.kind, error = %e, "Rejected change");
                    metrics::record_intake_rejected(rejection_label(&e));
                    self.audit.record(AuditEvent::rejected(&caller.node_id, index, &e));
                    report.items.push(ItemResult {
                        index,
                        outcome: ItemOutcome::Rejected(e),
                    });
                    continue;
                }
            };

            let event = ChangeEvent::new(change);
            let outcome = match self.queue.enqueue(&event).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(index, kind = %event.kind(), error = %e, "Failed to enqueue change");
                    metrics::record_intake_failed();
                    report.items.push(ItemResult {
                        index,
                        outcome: ItemOutcome::Failed { reason: e.to_string() },
                    });
                    continue;
                }
            };
            self.audit.record(AuditEvent::ChangeAccepted {
                actor: caller.node_id.clone(),
                event_id: event.id,
                job_id: outcome.job_id.clone(),
                kind: event.kind(),
                subject_id: event.subject_id().to_string(),
                coalesced: outcome.coalesced,
                at: event.received_at,
            });
            report.items.push(ItemResult {
                index,
                outcome: ItemOutcome::Accepted {
                    event_id: event.id,
                    job_id: outcome.job_id,
                    coalesced: outcome.coalesced,
                },
            });
        }

        let rejected = report.errors().count();
        let failed = report.failures().count();
        info!(
            accepted = report.items.len() - rejected - failed,
            rejected,
            failed,
            "Intake batch processed"
        );
        Ok(report)
    }

    /// `{projects: [id, ...]}` → one `repository_update` per id.
    pub async fn refresh_projects(&self, caller: &CallerIdentity, params: &Value) -> Result<IntakeReport> {
        caller.require_admin("refresh_projects")?;
        let batch = project_batch(params, RawChange::repository_update)?;
        self.submit(caller, batch).await
    }

    /// `{projects: [id, ...]}` → one `wiki_update` per id.
    pub async fn refresh_wikis(&self, caller: &CallerIdentity, params: &Value) -> Result<IntakeReport> {
        caller.require_admin("refresh_wikis")?;
        let batch = project_batch(params, RawChange::wiki_update)?;
        self.submit(caller, batch).await
    }

    /// `{event_name, key, id, ...}` → one change.
    pub async fn receive_events(&self, caller: &CallerIdentity, params: &Value) -> Result<IntakeReport> {
        caller.require_admin("receive_events")?;
        let raw = RawChange::from_event_params(params)?;
        self.submit(caller, vec![raw]).await
    }

    /// Operator re-submission of a quarantined job.
    pub async fn resubmit(&self, caller: &CallerIdentity, job_id: &JobId) -> Result<()> {
        caller.require_admin("resubmit")?;
        self.queue.resubmit(job_id).await?;
        self.audit.record(AuditEvent::JobResubmitted {
            actor: caller.node_id.clone(),
            job_id: job_id.clone(),
            at: chrono::Utc::now(),
        });
        Ok(())
    }
}

fn project_batch(params: &Value, build: fn(Value) -> RawChange) -> Result<Vec<RawChange>> {
    match params.get("projects") {
        None | Some(Value::Null) => Err(ValidationError::missing("projects").into()),
        Some(Value::Array(ids)) => Ok(ids.iter().cloned().map(build).collect()),
        Some(other) => Err(ValidationError::malformed(
            "projects",
            format!("expected an array of ids, got {}", json_type(other)),
        )
        .into()),
    }
}
