//! Dispatcher state types.
//!
//! # State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Starting
//!    │                              │
//!    │ shutdown()                   │ (in-flight jobs recovered,
//!    ↓                              │  scheduler spawned)
//! Stopped                           ↓
//!    ↑                          Running
//!    │                              │
//!    │                    shutdown()│
//!    │                              ↓
//!    └────────────────── ShuttingDown
//!
//! Starting ──(store error)──→ Failed
//! ```
//!
//! - **Created**: After `Dispatcher::new()`. Queue open, intake usable, nothing dispatched.
//! - **Starting**: Recovering jobs a previous process left in flight.
//! - **Running**: Scheduler and maintenance tasks active.
//! - **ShuttingDown**: No new jobs pulled; running jobs get the grace period.
//! - **Stopped**: Interrupted jobs released, store closed.
//! - **Failed**: Startup failed. Check logs.

use crate::circuit_breaker::CircuitState;
use crate::queue::QueueStats;

/// State of the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Created,
    Starting,
    Running,
    ShuttingDown,
    Stopped,
    Failed,
}

impl std::fmt::Display for DispatcherState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatcherState::Created => write!(f, "Created"),
            DispatcherState::Starting => write!(f, "Starting"),
            DispatcherState::Running => write!(f, "Running"),
            DispatcherState::ShuttingDown => write!(f, "ShuttingDown"),
            DispatcherState::Stopped => write!(f, "Stopped"),
            DispatcherState::Failed => write!(f, "Failed"),
        }
    }
}

/// Health snapshot for monitoring endpoints.
///
/// Collected from the job table and in-process counters; no target calls.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub state: DispatcherState,

    /// Running and able to read the job store.
    pub ready: bool,

    /// Ready and the target circuit is not open.
    pub healthy: bool,

    /// `None` if the job store could not be read.
    pub queue: Option<QueueStats>,

    /// Jobs executing in this process right now.
    pub in_flight: usize,

    pub max_concurrent_jobs: usize,

    /// Target circuit, if the worker has one.
    pub circuit_state: Option<CircuitState>,
}
