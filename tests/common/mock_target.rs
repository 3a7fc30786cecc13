//! Mock ReplicationTarget for testing.
//!
//! Records every call. Failures are scripted per subject: a queue of errors
//! consumed one per call, or a permanent error for every call.

use replication_dispatcher::event::KeyChange;
use replication_dispatcher::worker::{BoxFuture, ReplicationTarget, TargetError};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

/// A recorded target call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetCall {
    pub op: &'static str,
    pub subject: String,
}

/// Mock implementation of ReplicationTarget that records all calls.
///
/// # Example
/// ```rust,ignore
/// let mock = MockTarget::new();
///
/// // Fail the next two pulls of project 7
/// mock.fail_next("7", 2, TargetError::Unavailable("timeout".into())).await;
///
/// // Use in tests...
///
/// assert_eq!(mock.calls_for("7").await, 3);
/// ```
#[derive(Default)]
pub struct MockTarget {
    calls: RwLock<Vec<TargetCall>>,
    /// Errors consumed one per call, by subject
    scripted: RwLock<HashMap<String, VecDeque<TargetError>>>,
    /// Errors returned on every call, by subject
    permanent: RwLock<HashMap<String, TargetError>>,
    /// Artificial latency per call
    delay: Duration,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl MockTarget {
    /// A target that accepts everything immediately.
    pub fn new() -> Self {
        Self::default()
    }

    /// A target that takes `delay` per call.
    #[allow(dead_code)]
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// Fail the next `times` calls for `subject` with `error`.
    #[allow(dead_code)]
    pub async fn fail_next(&self, subject: &str, times: usize, error: TargetError) {
        let mut scripted = self.scripted.write().await;
        let queue = scripted.entry(subject.to_string()).or_default();
        queue.extend(std::iter::repeat(error).take(times));
    }

    /// Fail every call for `subject` with `error`.
    #[allow(dead_code)]
    pub async fn fail_always(&self, subject: &str, error: TargetError) {
        self.permanent.write().await.insert(subject.to_string(), error);
    }

    pub async fn calls(&self) -> Vec<TargetCall> {
        self.calls.read().await.clone()
    }

    #[allow(dead_code)]
    pub async fn calls_for(&self, subject: &str) -> usize {
        self.calls.read().await.iter().filter(|c| c.subject == subject).count()
    }

    /// Highest number of calls observed running at once.
    #[allow(dead_code)]
    pub fn max_concurrent(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    async fn handle(&self, op: &'static str, subject: &str) -> Result<(), TargetError> {
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(running, Ordering::SeqCst);

        self.calls.write().await.push(TargetCall {
            op,
            subject: subject.to_string(),
        });
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let result = if let Some(error) = self.permanent.read().await.get(subject) {
            Err(error.clone())
        } else if let Some(error) = self
            .scripted
            .write()
            .await
            .get_mut(subject)
            .and_then(VecDeque::pop_front)
        {
            Err(error)
        } else {
            Ok(())
        };

        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

impl ReplicationTarget for MockTarget {
    fn fetch_repository<'a>(&'a self, project_id: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(self.handle("fetch_repository", project_id))
    }

    fn fetch_wiki<'a>(&'a self, project_id: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(self.handle("fetch_wiki", project_id))
    }

    fn add_key<'a>(&'a self, key: &'a KeyChange) -> BoxFuture<'a, ()> {
        Box::pin(self.handle("add_key", &key.key_id))
    }

    fn remove_key<'a>(&'a self, key: &'a KeyChange) -> BoxFuture<'a, ()> {
        Box::pin(self.handle("remove_key", &key.key_id))
    }
}
