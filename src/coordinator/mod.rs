// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Dispatcher coordinator.
//!
//! The orchestrator that ties together:
//! - Intake of change notifications via [`crate::intake::EventIntake`]
//! - The durable job store via [`crate::queue::DispatchQueue`]
//! - The scheduler, which runs jobs on a [`crate::worker::ReplicationWorker`]
//! - Background maintenance (gauges, retention purge)
//!
//! # Lifecycle
//!
//! 1. `new()` opens the job store; intake works immediately, nothing runs
//! 2. `start()` returns jobs a previous process left in flight to pending,
//!    then spawns the scheduler and maintenance tasks
//! 3. `shutdown()` stops pulling jobs, gives running jobs the grace period,
//!    releases the rest and closes the store

mod maintenance;
mod scheduler;
mod types;

pub use types::{DispatcherState, HealthCheck};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::audit::{AuditSink, NoOpAuditSink};
use crate::config::DispatcherConfig;
use crate::error::{DispatchError, Result};
use crate::intake::EventIntake;
use crate::metrics;
use crate::queue::DispatchQueue;
use crate::retry::RetryController;
use crate::worker::{NoOpTarget, ReplicationWorker, TargetWorker};
use scheduler::{JobContext, Scheduler};

/// Extra time past the grace period before a background task is abandoned.
const TASK_STOP_MARGIN: Duration = Duration::from_secs(5);

/// The replication dispatcher.
///
/// Owns the job store and the background tasks that drain it. Producers
/// submit changes through [`intake()`](Self::intake); the scheduler hands
/// ready jobs to the worker `W`.
pub struct Dispatcher<W: ReplicationWorker = TargetWorker<NoOpTarget>> {
    /// Configuration at construction time
    config: DispatcherConfig,

    /// Runtime config updates (scheduler timings)
    config_rx: watch::Receiver<DispatcherConfig>,

    /// Dispatcher state (broadcast to watchers)
    state_tx: watch::Sender<DispatcherState>,

    /// Dispatcher state receiver (for internal use)
    state_rx: watch::Receiver<DispatcherState>,

    queue: Arc<DispatchQueue>,
    intake: EventIntake,
    worker: Arc<W>,
    audit: Arc<dyn AuditSink>,

    /// Jobs currently executing in this process
    in_flight: Arc<AtomicUsize>,

    /// Shutdown signal sender
    shutdown_tx: watch::Sender<bool>,

    /// Shutdown signal receiver
    shutdown_rx: watch::Receiver<bool>,

    /// Scheduler and maintenance task handles
    handles: Vec<JoinHandle<()>>,
}

impl Dispatcher<TargetWorker<NoOpTarget>> {
    /// Create a dispatcher whose worker accepts every change (standalone/testing).
    pub async fn new(config: DispatcherConfig, config_rx: watch::Receiver<DispatcherConfig>) -> Result<Self> {
        let worker = TargetWorker::new(NoOpTarget, config.settings.circuit.to_circuit_config());
        Self::with_worker(config, config_rx, Arc::new(worker), Arc::new(NoOpAuditSink)).await
    }
}

impl<W: ReplicationWorker> Dispatcher<W> {
    /// Create a dispatcher with a worker and audit sink.
    ///
    /// Validates the config and opens the job store. The dispatcher starts
    /// in `Created` state; call [`start()`](Self::start) to begin dispatching.
    pub async fn with_worker(
        config: DispatcherConfig,
        config_rx: watch::Receiver<DispatcherConfig>,
        worker: Arc<W>,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self> {
        config.validate()?;

        let retry = RetryController::new(config.settings.retry.to_retry_config());
        let queue = Arc::new(DispatchQueue::open(&config.store, retry).await?);
        let intake = EventIntake::new(Arc::clone(&queue), Arc::clone(&audit));

        let (state_tx, state_rx) = watch::channel(DispatcherState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        metrics::set_dispatcher_state("Created");

        info!(node_id = %config.node_id, path = %config.store.sqlite_path, "Dispatcher created");

        Ok(Self {
            config,
            config_rx,
            state_tx,
            state_rx,
            queue,
            intake,
            worker,
            audit,
            in_flight: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
            shutdown_rx,
            handles: Vec::new(),
        })
    }

    /// Intake front end. Usable in any state until the store is closed.
    pub fn intake(&self) -> &EventIntake {
        &self.intake
    }

    /// The job store (for queries and diagnostics).
    pub fn queue(&self) -> &Arc<DispatchQueue> {
        &self.queue
    }

    pub fn worker(&self) -> &Arc<W> {
        &self.worker
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn state(&self) -> DispatcherState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<DispatcherState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        self.state() == DispatcherState::Running
    }

    fn set_state(&self, state: DispatcherState) {
        let _ = self.state_tx.send(state);
        metrics::set_dispatcher_state(&state.to_string());
    }

    /// Health snapshot for readiness/liveness probes.
    pub async fn health_check(&self) -> HealthCheck {
        let state = self.state();

        let queue = match self.queue.stats().await {
            Ok(stats) => Some(stats),
            Err(e) => {
                warn!(error = %e, "Health check could not read queue stats");
                None
            }
        };

        let circuit_state = self.worker.circuit_state();
        if let Some(circuit) = circuit_state {
            metrics::set_circuit_state("replication_target", &circuit.to_string());
        }

        let ready = state == DispatcherState::Running && queue.is_some();
        let healthy = ready && !self.worker.is_degraded();

        HealthCheck {
            state,
            ready,
            healthy,
            queue,
            in_flight: self.in_flight.load(Ordering::Relaxed),
            max_concurrent_jobs: self.config.settings.scheduler.max_concurrent_jobs,
            circuit_state,
        }
    }

    /// Start dispatching.
    ///
    /// 1. Returns jobs left `in_flight` by a previous process to `pending`
    /// 2. Spawns the scheduler
    /// 3. Spawns the maintenance task
    pub async fn start(&mut self) -> Result<()> {
        match self.state() {
            DispatcherState::Created => {}
            DispatcherState::ShuttingDown | DispatcherState::Stopped => return Err(DispatchError::Shutdown),
            other => {
                return Err(DispatchError::InvalidState {
                    expected: "Created".to_string(),
                    actual: other.to_string(),
                })
            }
        }

        info!(
            node_id = %self.config.node_id,
            max_concurrent_jobs = self.config.settings.scheduler.max_concurrent_jobs,
            "Starting dispatcher"
        );
        self.set_state(DispatcherState::Starting);

        match self.queue.recover_in_flight().await {
            Ok(recovered) => {
                metrics::record_recovered(recovered);
                if recovered > 0 {
                    info!(recovered, "Recovered jobs interrupted by a previous run");
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to recover in-flight jobs");
                self.set_state(DispatcherState::Failed);
                return Err(e);
            }
        }

        let ctx = JobContext {
            queue: Arc::clone(&self.queue),
            worker: Arc::clone(&self.worker),
            audit: Arc::clone(&self.audit),
        };
        let scheduler = Scheduler::new(
            ctx,
            &self.config.settings.scheduler,
            self.config_rx.clone(),
            self.shutdown_rx.clone(),
            Arc::clone(&self.in_flight),
        );
        self.handles.push(tokio::spawn(scheduler.run()));

        self.handles.push(tokio::spawn(maintenance::run_maintenance(
            Arc::clone(&self.queue),
            self.config.settings.retention.clone(),
            self.shutdown_rx.clone(),
        )));

        self.set_state(DispatcherState::Running);
        info!("Dispatcher running");
        Ok(())
    }

    /// Shutdown the dispatcher gracefully.
    ///
    /// Running jobs get `shutdown_grace` to finish; the rest are interrupted
    /// and released back to `pending`. The job store is closed afterwards,
    /// so intake stops working too.
    pub async fn shutdown(&mut self) {
        if self.state() == DispatcherState::Stopped {
            debug!("Dispatcher already stopped");
            return;
        }

        info!("Shutting down dispatcher");
        self.set_state(DispatcherState::ShuttingDown);
        let _ = self.shutdown_tx.send(true);

        let grace = self.config_rx.borrow().settings.scheduler.shutdown_grace_duration();
        let stop_timeout = grace + TASK_STOP_MARGIN;
        let handles = std::mem::take(&mut self.handles);
        for (i, handle) in handles.into_iter().enumerate() {
            stop_task(i + 1, handle, stop_timeout).await;
        }

        // Every task has finished or been aborted
        self.queue.close().await;

        self.set_state(DispatcherState::Stopped);
        info!("Dispatcher stopped");
    }
}

/// Wait for a background task, aborting it if it outlives `timeout`.
async fn stop_task(task: usize, mut handle: JoinHandle<()>, timeout: Duration) {
    match tokio::time::timeout(timeout, &mut handle).await {
        Ok(Ok(())) => debug!(task, "Task completed gracefully"),
        Ok(Err(e)) => warn!(task, error = %e, "Task panicked during shutdown"),
        Err(_) => {
            warn!(task, "Task did not stop in time, aborting; in-flight jobs recovered on next start");
            handle.abort();
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!(task, error = %e, "Task panicked while aborting");
                }
            }
        }
    }
}
