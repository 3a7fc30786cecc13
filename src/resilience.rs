//! Resilience utilities: retry backoff, rate limiting, bulkheads.
//!
//! - [`RetryConfig`]: Exponential backoff with jitter for failed jobs
//! - [`RateLimiter`]: Token bucket capping the job dispatch rate
//! - [`Bulkhead`]: Semaphore limiting concurrent jobs (globally and per kind)
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), replication_dispatcher::resilience::BulkheadFull> {
//! use replication_dispatcher::resilience::{RateLimiter, Bulkhead, RateLimitConfig};
//!
//! // Rate limit: max 100 dispatches/sec with burst of 50
//! let limiter = RateLimiter::new(RateLimitConfig::default());
//! limiter.acquire().await; // Blocks if over limit
//!
//! // Bulkhead: max 4 concurrent repository pulls
//! let bulkhead = Bulkhead::new(4);
//! let _permit = bulkhead.acquire().await?;
//! // permit dropped = slot released
//! # Ok(())
//! # }
//! ```

use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovLimiter,
};
use rand::Rng;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Backoff policy for failed replication jobs.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Failed attempts after which a job is quarantined.
    pub max_attempts: u32,

    /// Delay after the first failure.
    pub initial_delay: Duration,

    /// Ceiling for the exponential delay.
    pub max_delay: Duration,

    /// Backoff multiplier (e.g., 2.0 = double delay each retry).
    pub backoff_factor: f64,

    /// Fraction of the delay that is randomized, in `[0.0, 1.0]`.
    ///
    /// A jittered delay lies in `[delay * (1 - jitter), delay]`, which
    /// spreads retries of jobs that failed together.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(600),
            backoff_factor: 2.0,
            jitter: 0.2,
        }
    }
}

impl RetryConfig {
    /// Keep retrying a flaky secondary for hours before giving up.
    ///
    /// # Backoff Schedule
    ///
    /// ```text
    /// Attempt  Delay (before jitter)
    /// -------  -----
    /// 1        5s
    /// 2        10s
    /// 3        20s
    /// ...
    /// 9        1280s
    /// 10+      1800s (cap), quarantined after 20 failures
    /// ```
    pub fn patient() -> Self {
        Self {
            max_attempts: 20,
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(1800),
            backoff_factor: 2.0,
            jitter: 0.2,
        }
    }

    /// Fast, deterministic retry for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_factor: 2.0,
            jitter: 0.0,
        }
    }

    /// Calculate delay for a given attempt number (1-indexed), without jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let exponent = (attempt - 1).min(i32::MAX as u32) as i32;
        let multiplier = self.backoff_factor.powi(exponent);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;

        // powi overflows to inf long before the cap matters
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(delay_secs)
    }

    /// Delay for a given attempt with jitter applied.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.delay_for_attempt(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || base.is_zero() {
            return base;
        }
        let factor = 1.0 - jitter * rand::rng().random_range(0.0..1.0);
        base.mul_f64(factor)
    }
}

// =============================================================================
// Rate Limiting
// =============================================================================

/// Configuration for rate limiting.
///
/// Uses a token bucket algorithm: tokens refill at `refill_rate` per second,
/// up to `burst_size` tokens. Each dispatched job consumes one token.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum tokens that can be accumulated (burst capacity).
    pub burst_size: u32,

    /// Tokens added per second (sustained rate).
    pub refill_rate: u32,
}

impl Default for RateLimitConfig {
    /// Default: 100 dispatches/sec with burst of 50.
    fn default() -> Self {
        Self {
            burst_size: 50,
            refill_rate: 100,
        }
    }
}

impl RateLimitConfig {
    /// Gentle limit for secondaries on constrained storage.
    pub fn conservative() -> Self {
        Self {
            burst_size: 5,
            refill_rate: 10,
        }
    }
}

/// Token bucket rate limiter.
pub struct RateLimiter {
    limiter: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
    config: RateLimitConfig,
}

impl RateLimiter {
    /// Create a new rate limiter with the given configuration.
    pub fn new(config: RateLimitConfig) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(config.refill_rate).unwrap_or(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN));

        Self {
            limiter: GovLimiter::direct(quota),
            config,
        }
    }

    /// Acquire a permit, blocking until one is available.
    ///
    /// This method is cancel-safe.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    /// Try to acquire a permit without blocking.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }

    /// Get the current configuration.
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}

// =============================================================================
// Bulkhead (Concurrency Limiter)
// =============================================================================

/// Error when bulkhead is full.
#[derive(Debug, Clone, thiserror::Error)]
#[error("bulkhead full: max {max_concurrent} concurrent operations")]
pub struct BulkheadFull {
    /// Maximum concurrent operations allowed.
    pub max_concurrent: usize,
}

/// Limits concurrent operations with a semaphore.
///
/// The scheduler holds one global bulkhead (`max_concurrent_jobs`) and one
/// per capped change kind. A running job holds a permit from each; dropping
/// the permits frees the slots.
#[derive(Debug)]
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl Bulkhead {
    /// Create a new bulkhead with the given concurrency limit.
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Acquire a permit, waiting if necessary.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, BulkheadFull> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BulkheadFull {
                max_concurrent: self.max_concurrent,
            })
    }

    /// Try to acquire a permit without waiting.
    ///
    /// Returns `None` if the bulkhead is full.
    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().try_acquire_owned().ok()
    }

    /// Get the number of available permits.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Get the maximum concurrent operations allowed.
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Number of permits currently held.
    pub fn in_use(&self) -> usize {
        self.max_concurrent.saturating_sub(self.available())
    }

    /// Check if the bulkhead is full (no permits available).
    pub fn is_full(&self) -> bool {
        self.semaphore.available_permits() == 0
    }
}
