//! # Replication Dispatcher
//!
//! Event-driven dispatch of replication work on a secondary node.
//!
//! ## Architecture
//!
//! The primary notifies the secondary that something changed (a repository
//! was pushed, a wiki edited, an SSH key added or removed). The dispatcher
//! turns each notification into a durable job and runs it on a worker that
//! brings the secondary up to date:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                          replication-dispatcher                           │
//! │                                                                           │
//! │  ┌─────────────┐    ┌───────────────┐    ┌─────────────┐    ┌──────────┐  │
//! │  │ EventIntake │───►│ DispatchQueue │───►│  Scheduler  │───►│  Worker  │  │
//! │  │ (validate)  │    │ (SQLite, one  │    │ (bulkheads, │    │ (target, │  │
//! │  │             │    │  active job   │    │  rate limit)│    │  circuit)│  │
//! │  └─────────────┘    │  per subject) │    └─────────────┘    └──────────┘  │
//! │                     └───────────────┘           │                │        │
//! │                             ▲                   │  ack / nack    │        │
//! │                             └───────────────────┴────────────────┘        │
//! │                                   RetryController (backoff, quarantine)   │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Delivery
//!
//! - **At least once**: a job is acknowledged only after its worker finished;
//!   a crash mid-flight means the job runs again on the next start.
//! - **Coalescing**: at most one active job per `(kind, subject)`. Repeated
//!   notifications collapse into it; one arriving mid-flight schedules a rerun.
//! - **Bounded retries**: failures back off exponentially with jitter and
//!   are quarantined after `max_attempts`.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use replication_dispatcher::{CallerIdentity, Dispatcher, DispatcherConfig, RawChange};
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = DispatcherConfig::default();
//!     let (_tx, rx) = watch::channel(config.clone());
//!
//!     let mut dispatcher = Dispatcher::new(config, rx).await.expect("Failed to open store");
//!     dispatcher.start().await.expect("Failed to start");
//!
//!     let primary = CallerIdentity::admin("geo-primary");
//!     dispatcher
//!         .intake()
//!         .submit(&primary, vec![RawChange::repository_update(42)])
//!         .await
//!         .expect("Intake failed");
//!
//!     dispatcher.shutdown().await;
//! }
//! ```

pub mod audit;
pub mod circuit_breaker;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod event;
pub mod intake;
pub mod metrics;
pub mod queue;
pub mod resilience;
pub mod retry;
pub mod worker;

// Re-exports for convenience
pub use audit::{AuditEvent, AuditSink, NoOpAuditSink};
pub use circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError, CircuitState};
pub use config::{DispatcherConfig, DispatcherSettings, RetentionConfig, RetrySettings, SchedulerConfig, StoreConfig};
pub use coordinator::{Dispatcher, DispatcherState, HealthCheck};
pub use error::{DispatchError, Result, ValidationError};
pub use event::{Change, ChangeEvent, ChangeKind, KeyChange};
pub use intake::{CallerIdentity, EventIntake, IntakeReport, IntakeStatus, RawChange};
pub use queue::{DispatchJob, DispatchQueue, JobId, JobState, QueueStats};
pub use retry::{Failure, RetryController, RetryDecision};
pub use worker::{NoOpTarget, Outcome, ReplicationTarget, ReplicationWorker, TargetError, TargetWorker};
