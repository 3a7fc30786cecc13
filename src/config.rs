//! Configuration for the replication dispatcher.
//!
//! Configuration is passed to [`Dispatcher::new()`](crate::Dispatcher::new)
//! and can be built programmatically or deserialized from JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use replication_dispatcher::config::DispatcherConfig;
//!
//! let mut config = DispatcherConfig::for_testing("secondary-1");
//! config.settings.scheduler.max_concurrent_jobs = 4;
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! DispatcherConfig
//! ├── node_id: String                  # This secondary's ID (logs, audit)
//! ├── settings: DispatcherSettings
//! │   ├── scheduler: SchedulerConfig   # Concurrency, polling, timeouts
//! │   ├── retry: RetrySettings         # Backoff and attempt budget
//! │   ├── retention: RetentionConfig   # Terminal job cleanup
//! │   └── circuit: CircuitSettings     # Target circuit breaker
//! └── store: StoreConfig               # SQLite job table
//! ```
//!
//! # JSON Example
//!
//! ```json
//! {
//!   "node_id": "geo.secondary.eu-1",
//!   "settings": {
//!     "scheduler": {
//!       "max_concurrent_jobs": 32,
//!       "kind_limits": { "repository_update": 24, "wiki_update": 4 },
//!       "execute_timeout": "10m"
//!     },
//!     "retry": { "max_attempts": 8, "initial_delay_ms": 1000 }
//!   },
//!   "store": { "sqlite_path": "/var/lib/geo/dispatch.db" }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::circuit_breaker::CircuitConfig;
use crate::error::{DispatchError, Result};
use crate::event::ChangeKind;
use crate::queue::Retention;
use crate::resilience::{RateLimitConfig, RetryConfig};

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config: passed to Dispatcher::new()
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `Dispatcher::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Identity of the secondary node running this dispatcher.
    pub node_id: String,

    #[serde(default)]
    pub settings: DispatcherSettings,

    /// Job table persistence.
    #[serde(default)]
    pub store: StoreConfig,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            node_id: "geo.secondary.default".to_string(),
            settings: DispatcherSettings::default(),
            store: StoreConfig::default(),
        }
    }
}

impl DispatcherConfig {
    /// Minimal config for tests: in-memory store, fast polling, tiny backoff.
    pub fn for_testing(node_id: &str) -> Self {
        let retry = RetryConfig::testing();
        Self {
            node_id: node_id.to_string(),
            settings: DispatcherSettings {
                scheduler: SchedulerConfig {
                    poll_interval: "10ms".to_string(),
                    shutdown_grace: "500ms".to_string(),
                    execute_timeout: "5s".to_string(),
                    ..Default::default()
                },
                retry: RetrySettings {
                    max_attempts: retry.max_attempts,
                    initial_delay_ms: retry.initial_delay.as_millis() as u64,
                    max_delay_ms: retry.max_delay.as_millis() as u64,
                    backoff_factor: retry.backoff_factor,
                    jitter: retry.jitter,
                },
                retention: RetentionConfig::default(),
                circuit: CircuitSettings {
                    failure_threshold: 100,
                    success_threshold: 1,
                    recovery_timeout: "50ms".to_string(),
                },
            },
            store: StoreConfig::in_memory(),
        }
    }

    /// Parse a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| DispatchError::Config(format!("Invalid config JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| DispatchError::Config(format!("Cannot read {}: {}", path.display(), e)))?;
        Self::from_json_str(&json)
    }

    /// Reject settings the dispatcher cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(DispatchError::Config("node_id must not be empty".into()));
        }
        let scheduler = &self.settings.scheduler;
        if scheduler.max_concurrent_jobs == 0 {
            return Err(DispatchError::Config("max_concurrent_jobs must be at least 1".into()));
        }
        if let Some((kind, _)) = scheduler.kind_limits.iter().find(|(_, limit)| **limit == 0) {
            return Err(DispatchError::Config(format!("kind limit for {} must be at least 1", kind)));
        }
        if parse_duration_field("poll_interval", &scheduler.poll_interval)?.is_zero() {
            return Err(DispatchError::Config("poll_interval must be greater than zero".into()));
        }
        if parse_duration_field("execute_timeout", &scheduler.execute_timeout)?.is_zero() {
            return Err(DispatchError::Config("execute_timeout must be greater than zero".into()));
        }
        parse_duration_field("shutdown_grace", &scheduler.shutdown_grace)?;
        parse_duration_field("circuit.recovery_timeout", &self.settings.circuit.recovery_timeout)?;
        if scheduler.rate_limit_enabled && (scheduler.rate_limit_per_sec == 0 || scheduler.rate_limit_burst == 0) {
            return Err(DispatchError::Config("rate limit rate and burst must be positive".into()));
        }
        let retry = &self.settings.retry;
        if retry.max_attempts == 0 {
            return Err(DispatchError::Config("max_attempts must be at least 1".into()));
        }
        if !(retry.backoff_factor >= 1.0 && retry.backoff_factor.is_finite()) {
            return Err(DispatchError::Config("backoff_factor must be >= 1.0".into()));
        }
        if !(0.0..=1.0).contains(&retry.jitter) {
            return Err(DispatchError::Config("jitter must be within 0.0..=1.0".into()));
        }
        if retry.initial_delay_ms > retry.max_delay_ms {
            return Err(DispatchError::Config("initial_delay_ms must not exceed max_delay_ms".into()));
        }
        if self.store.sqlite_path.trim().is_empty() {
            return Err(DispatchError::Config("store.sqlite_path must not be empty".into()));
        }
        Ok(())
    }
}

fn parse_duration_field(field: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value)
        .map_err(|e| DispatchError::Config(format!("{} {:?} is not a valid duration: {}", field, value, e)))
}

// ═══════════════════════════════════════════════════════════════════════════════
// DispatcherSettings
// ═══════════════════════════════════════════════════════════════════════════════

/// Tunables for the dispatcher.
///
/// Scheduler timings (`poll_interval`, `execute_timeout`, `shutdown_grace`)
/// follow updates on the config watch channel. Concurrency and rate limits
/// are fixed when the dispatcher starts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatcherSettings {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub circuit: CircuitSettings,
}

// ═══════════════════════════════════════════════════════════════════════════════
// SchedulerConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Scheduler concurrency and timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Global cap on concurrently executing jobs.
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,

    /// Optional per-kind caps, each bounded by `max_concurrent_jobs`.
    #[serde(default)]
    pub kind_limits: BTreeMap<ChangeKind, usize>,

    /// Upper bound on how long the scheduler sleeps without a wakeup.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,

    /// How long shutdown waits for running jobs before interrupting them.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: String,

    /// Per-job execution timeout. An expired attempt counts as retryable.
    #[serde(default = "default_execute_timeout")]
    pub execute_timeout: String,

    // ─────────────────────────────────────────────────────────────────────────
    // Rate Limiting (protects the primary after an outage backlog)
    // ─────────────────────────────────────────────────────────────────────────
    #[serde(default = "default_false")]
    pub rate_limit_enabled: bool,

    /// Job starts per second (sustained rate).
    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,

    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,
}

fn default_max_concurrent_jobs() -> usize {
    16
}

fn default_poll_interval() -> String {
    "1s".to_string()
}

fn default_shutdown_grace() -> String {
    "30s".to_string()
}

fn default_execute_timeout() -> String {
    "10m".to_string()
}

fn default_rate_limit_per_sec() -> u32 {
    100
}

fn default_rate_limit_burst() -> u32 {
    50
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 16,
            kind_limits: BTreeMap::new(),
            poll_interval: "1s".to_string(),
            shutdown_grace: "30s".to_string(),
            execute_timeout: "10m".to_string(),
            rate_limit_enabled: false,
            rate_limit_per_sec: 100,
            rate_limit_burst: 50,
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.poll_interval).unwrap_or(Duration::from_secs(1))
    }

    pub fn shutdown_grace_duration(&self) -> Duration {
        humantime::parse_duration(&self.shutdown_grace).unwrap_or(Duration::from_secs(30))
    }

    pub fn execute_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.execute_timeout).unwrap_or(Duration::from_secs(600))
    }

    /// Effective cap for a kind (never above the global cap).
    pub fn limit_for(&self, kind: ChangeKind) -> usize {
        self.kind_limits
            .get(&kind)
            .copied()
            .unwrap_or(self.max_concurrent_jobs)
            .min(self.max_concurrent_jobs)
    }

    /// Returns `None` if rate limiting is disabled.
    pub fn rate_limit_config(&self) -> Option<RateLimitConfig> {
        if self.rate_limit_enabled {
            Some(RateLimitConfig {
                burst_size: self.rate_limit_burst,
                refill_rate: self.rate_limit_per_sec,
            })
        } else {
            None
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RetrySettings
// ═══════════════════════════════════════════════════════════════════════════════

/// Retry budget and backoff curve for failed jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Failed attempts before a job is quarantined.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry (ms).
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Backoff ceiling (ms).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Fraction of each delay that may be shaved off at random.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 {
    8
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    600_000 // 10 minutes
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.2
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            initial_delay_ms: 1_000,
            max_delay_ms: 600_000,
            backoff_factor: 2.0,
            jitter: 0.2,
        }
    }
}

impl RetrySettings {
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff_factor: self.backoff_factor,
            jitter: self.jitter,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RetentionConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// How long terminal jobs stay inspectable before the maintenance task
/// purges them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_succeeded_sec")]
    pub succeeded_sec: u64,

    #[serde(default = "default_quarantined_sec")]
    pub quarantined_sec: u64,

    #[serde(default = "default_failure_record_sec")]
    pub failure_record_sec: u64,

    /// How often the purge runs.
    #[serde(default = "default_purge_interval_sec")]
    pub purge_interval_sec: u64,
}

fn default_succeeded_sec() -> u64 {
    86_400 // 1 day
}

fn default_quarantined_sec() -> u64 {
    604_800 // 7 days
}

fn default_failure_record_sec() -> u64 {
    2_592_000 // 30 days
}

fn default_purge_interval_sec() -> u64 {
    300
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            succeeded_sec: 86_400,
            quarantined_sec: 604_800,
            failure_record_sec: 2_592_000,
            purge_interval_sec: 300,
        }
    }
}

impl RetentionConfig {
    pub fn retention(&self) -> Retention {
        Retention {
            succeeded: Duration::from_secs(self.succeeded_sec),
            quarantined: Duration::from_secs(self.quarantined_sec),
            failure_records: Duration::from_secs(self.failure_record_sec),
        }
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_sec.max(1))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CircuitSettings
// ═══════════════════════════════════════════════════════════════════════════════

/// Circuit breaker around the replication target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitSettings {
    #[serde(default = "default_circuit_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_circuit_success_threshold")]
    pub success_threshold: u32,

    #[serde(default = "default_circuit_recovery_timeout")]
    pub recovery_timeout: String,
}

fn default_circuit_failure_threshold() -> u32 {
    5
}

fn default_circuit_success_threshold() -> u32 {
    2
}

fn default_circuit_recovery_timeout() -> String {
    "30s".to_string()
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: "30s".to_string(),
        }
    }
}

impl CircuitSettings {
    pub fn to_circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.failure_threshold,
            success_threshold: self.success_threshold,
            recovery_timeout: humantime::parse_duration(&self.recovery_timeout)
                .unwrap_or(Duration::from_secs(30)),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// StoreConfig: job table persistence
// ═══════════════════════════════════════════════════════════════════════════════

/// SQLite job store configuration.
///
/// The job table must survive restarts, so production configs point at a
/// file; `":memory:"` is for tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database.
    pub sqlite_path: String,

    /// Whether to use WAL mode (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    4
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "replication_dispatch.db".to_string(),
            wal_mode: true,
            max_connections: 4,
        }
    }
}

impl StoreConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
            max_connections: 1,
        }
    }

    /// File-backed store at `path` with default settings.
    pub fn at(path: impl Into<String>) -> Self {
        Self {
            sqlite_path: path.into(),
            ..Default::default()
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
