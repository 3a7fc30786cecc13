// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication workers.
//!
//! A [`ReplicationWorker`] executes one job and reports an [`Outcome`]; it
//! never touches queue state. The scheduler turns the outcome into `ack` or
//! `nack`.
//!
//! [`TargetWorker`] is the standard worker: it maps each change kind to an
//! action on a [`ReplicationTarget`] (the secondary node) behind a circuit
//! breaker.
//!
//! # Example
//!
//! ```rust,no_run
//! use replication_dispatcher::worker::{BoxFuture, ReplicationTarget};
//! use replication_dispatcher::event::KeyChange;
//!
//! struct GitTarget { /* ... */ }
//!
//! impl ReplicationTarget for GitTarget {
//!     fn fetch_repository<'a>(&'a self, _project_id: &'a str) -> BoxFuture<'a, ()> {
//!         Box::pin(async move { Ok(()) })
//!     }
//!
//!     fn fetch_wiki<'a>(&'a self, _project_id: &'a str) -> BoxFuture<'a, ()> {
//!         Box::pin(async move { Ok(()) })
//!     }
//!
//!     fn add_key<'a>(&'a self, _key: &'a KeyChange) -> BoxFuture<'a, ()> {
//!         Box::pin(async move { Ok(()) })
//!     }
//!
//!     fn remove_key<'a>(&'a self, _key: &'a KeyChange) -> BoxFuture<'a, ()> {
//!         Box::pin(async move { Ok(()) })
//!     }
//! }
//! ```

use std::future::Future;
use std::pin::Pin;
use tracing::debug;

use crate::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError, CircuitState};
use crate::event::{Change, KeyChange};
use crate::queue::DispatchJob;

/// Result type for target operations.
pub type TargetResult<T> = std::result::Result<T, TargetError>;

/// Type alias for boxed async target futures.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = TargetResult<T>> + Send + 'a>>;

/// Boxed future returned by [`ReplicationWorker::execute`].
pub type OutcomeFuture<'a> = Pin<Box<dyn Future<Output = Outcome> + Send + 'a>>;

/// Result of one job attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// Transient; the job is retried after backoff.
    RetryableFailure(String),
    /// Permanent; the job is quarantined.
    FatalFailure(String),
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::RetryableFailure(_) => "retryable",
            Outcome::FatalFailure(_) => "fatal",
        }
    }
}

/// Executes a single dispatch job.
///
/// Implementations must be idempotent: at-least-once delivery means the
/// same job can run again after a crash or a lost ack.
pub trait ReplicationWorker: Send + Sync + 'static {
    fn execute<'a>(&'a self, job: &'a DispatchJob) -> OutcomeFuture<'a>;

    /// State of the circuit in front of the target, if there is one.
    fn circuit_state(&self) -> Option<CircuitState> {
        None
    }

    /// Whether the worker's target currently looks unhealthy.
    fn is_degraded(&self) -> bool {
        self.circuit_state() == Some(CircuitState::Open)
    }
}

/// Error from a target operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TargetError {
    /// Target or primary unreachable, overloaded, timed out.
    #[error("target unavailable: {0}")]
    Unavailable(String),

    /// The subject no longer exists (project deleted, key unknown).
    #[error("not found: {0}")]
    NotFound(String),

    /// The target refused the change outright.
    #[error("rejected by target: {0}")]
    Rejected(String),
}

impl TargetError {
    /// Only unavailability is worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, TargetError::Unavailable(_))
    }
}

/// The secondary node a change is replicated to.
///
/// `add_key` must treat an existing key as success; `remove_key` may return
/// `NotFound` for a missing key, which the worker counts as success.
pub trait ReplicationTarget: Send + Sync + 'static {
    /// Fetch the project repository from the primary.
    fn fetch_repository<'a>(&'a self, project_id: &'a str) -> BoxFuture<'a, ()>;

    /// Fetch the project wiki repository from the primary.
    fn fetch_wiki<'a>(&'a self, project_id: &'a str) -> BoxFuture<'a, ()>;

    fn add_key<'a>(&'a self, key: &'a KeyChange) -> BoxFuture<'a, ()>;

    fn remove_key<'a>(&'a self, key: &'a KeyChange) -> BoxFuture<'a, ()>;
}

impl<T: ReplicationTarget> ReplicationTarget for std::sync::Arc<T> {
    fn fetch_repository<'a>(&'a self, project_id: &'a str) -> BoxFuture<'a, ()> {
        (**self).fetch_repository(project_id)
    }

    fn fetch_wiki<'a>(&'a self, project_id: &'a str) -> BoxFuture<'a, ()> {
        (**self).fetch_wiki(project_id)
    }

    fn add_key<'a>(&'a self, key: &'a KeyChange) -> BoxFuture<'a, ()> {
        (**self).add_key(key)
    }

    fn remove_key<'a>(&'a self, key: &'a KeyChange) -> BoxFuture<'a, ()> {
        (**self).remove_key(key)
    }
}

/// Worker that applies changes to a [`ReplicationTarget`].
///
/// Only transient target errors count against the circuit; a missing
/// project says nothing about the target's health.
pub struct TargetWorker<T: ReplicationTarget> {
    target: T,
    circuit: CircuitBreaker,
}

impl<T: ReplicationTarget> TargetWorker<T> {
    pub fn new(target: T, circuit: CircuitConfig) -> Self {
        Self {
            target,
            circuit: CircuitBreaker::new("replication_target", circuit),
        }
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    pub fn circuit(&self) -> &CircuitBreaker {
        &self.circuit
    }

    async fn apply(&self, change: &Change) -> TargetResult<()> {
        match change {
            Change::RepositoryUpdate { project_id } => self.target.fetch_repository(project_id).await,
            Change::WikiUpdate { project_id } => self.target.fetch_wiki(project_id).await,
            Change::KeyCreate(key) => self.target.add_key(key).await,
            Change::KeyDestroy(key) => match self.target.remove_key(key).await {
                // Already gone
                Err(TargetError::NotFound(_)) => Ok(()),
                other => other,
            },
        }
    }

    async fn run(&self, job: &DispatchJob) -> Outcome {
        let result = self
            .circuit
            .call(|| async {
                match self.apply(&job.change).await {
                    Ok(()) => Ok(Ok(())),
                    Err(e) if e.is_transient() => Err(e),
                    Err(e) => Ok(Err(e)),
                }
            })
            .await;

        let outcome = match result {
            Ok(Ok(())) => Outcome::Success,
            Ok(Err(e)) if e.is_transient() => Outcome::RetryableFailure(e.to_string()),
            Ok(Err(e)) => Outcome::FatalFailure(e.to_string()),
            Err(CircuitError::Rejected) => Outcome::RetryableFailure("circuit breaker open".to_string()),
            Err(CircuitError::Inner(e)) => Outcome::RetryableFailure(e.to_string()),
        };
        debug!(job_id = %job.job_id, outcome = outcome.label(), "Target call finished");
        outcome
    }
}

impl<T: ReplicationTarget> ReplicationWorker for TargetWorker<T> {
    fn execute<'a>(&'a self, job: &'a DispatchJob) -> OutcomeFuture<'a> {
        Box::pin(self.run(job))
    }

    fn circuit_state(&self) -> Option<CircuitState> {
        Some(self.circuit.state_estimate())
    }
}

/// Target that accepts every change without doing anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpTarget;

impl ReplicationTarget for NoOpTarget {
    fn fetch_repository<'a>(&'a self, project_id: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            debug!(project_id, "NoOpTarget: fetch_repository");
            Ok(())
        })
    }

    fn fetch_wiki<'a>(&'a self, project_id: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            debug!(project_id, "NoOpTarget: fetch_wiki");
            Ok(())
        })
    }

    fn add_key<'a>(&'a self, key: &'a KeyChange) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            debug!(key_id = %key.key_id, "NoOpTarget: add_key");
            Ok(())
        })
    }

    fn remove_key<'a>(&'a self, key: &'a KeyChange) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            debug!(key_id = %key.key_id, "NoOpTarget: remove_key");
            Ok(())
        })
    }
}
