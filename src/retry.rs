// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry/backoff decisions for failed jobs.
//!
//! The queue calls [`RetryController::decide`] from `nack` and applies the
//! result inside the same write transaction, so the decision and the state
//! change are one step.
//!
//! ```text
//! retryable, attempts < max   → pending, next_eligible_at = now + backoff(attempts)
//! retryable, attempts >= max  → quarantined
//! fatal                       → quarantined
//! ```

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::resilience::RetryConfig;

/// Why a job attempt failed, as reported to `nack`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    /// Transient: target unreachable, timeout, circuit open.
    Retryable(String),
    /// Execution is impossible: subject gone, payload rejected by the target.
    Fatal(String),
}

impl Failure {
    pub fn reason(&self) -> &str {
        match self {
            Failure::Retryable(r) | Failure::Fatal(r) => r,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Failure::Fatal(_))
    }
}

/// What to do with a job after a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Return to `pending`, not dispatchable before `next_eligible_at`.
    Retry {
        delay: Duration,
        next_eligible_at: DateTime<Utc>,
    },
    /// Terminal. Needs operator re-submission.
    Quarantine,
}

/// Applies a [`RetryConfig`] to failed attempts.
#[derive(Debug, Clone, Default)]
pub struct RetryController {
    config: RetryConfig,
}

impl RetryController {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Decide the fate of a job whose `attempt_count` already includes the
    /// failure being reported.
    pub fn decide(&self, attempt_count: u32, failure: &Failure, now: DateTime<Utc>) -> RetryDecision {
        if failure.is_fatal() || attempt_count >= self.config.max_attempts {
            return RetryDecision::Quarantine;
        }

        let delay = self.config.jittered_delay(attempt_count);
        // Out-of-range delays clamp to the configured ceiling
        let step = chrono::Duration::from_std(delay)
            .or_else(|_| chrono::Duration::from_std(self.config.max_delay))
            .unwrap_or(chrono::Duration::MAX);
        let next_eligible_at = now.checked_add_signed(step).unwrap_or(DateTime::<Utc>::MAX_UTC);

        RetryDecision::Retry {
            delay,
            next_eligible_at,
        }
    }
}
