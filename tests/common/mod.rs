//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - A scriptable, recording [`ReplicationTarget`] mock
//! - A recording [`AuditSink`]
//! - Dispatcher and queue construction helpers

pub mod mock_target;

pub use mock_target::*;

use replication_dispatcher::audit::{AuditEvent, AuditSink};
use replication_dispatcher::queue::DispatchQueue;
use replication_dispatcher::resilience::RetryConfig;
use replication_dispatcher::retry::RetryController;
use replication_dispatcher::{DispatcherConfig, JobId, JobState};
use std::sync::Mutex;
use std::time::Duration;

/// Audit sink that keeps every event for assertions.
#[derive(Default)]
pub struct RecordingAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl RecordingAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap().clone()
    }

    #[allow(dead_code)]
    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(AuditEvent::name).collect()
    }
}

impl AuditSink for RecordingAuditSink {
    fn record(&self, event: AuditEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// In-memory queue with millisecond backoff and the given attempt limit.
#[allow(dead_code)]
pub async fn test_queue(max_attempts: u32) -> DispatchQueue {
    let retry = RetryConfig {
        max_attempts,
        ..RetryConfig::testing()
    };
    DispatchQueue::in_memory(RetryController::new(retry)).await.unwrap()
}

/// Test config with the given attempt limit.
#[allow(dead_code)]
pub fn test_config(node_id: &str, max_attempts: u32) -> DispatcherConfig {
    let mut config = DispatcherConfig::for_testing(node_id);
    config.settings.retry.max_attempts = max_attempts;
    config
}

/// Poll a job until it reaches `state` or the timeout passes.
#[allow(dead_code)]
pub async fn wait_for_state(queue: &DispatchQueue, job_id: &JobId, state: JobState, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if let Ok(Some(job)) = queue.get(job_id).await {
            if job.state == state {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}
