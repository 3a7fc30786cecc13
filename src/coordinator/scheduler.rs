// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Scheduler: pulls ready jobs and runs them on worker tasks.
//!
//! # Loop
//!
//! ```text
//! loop {
//!   release jobs whose outcome could not be recorded
//!   free  = global bulkhead slots (∩ per-kind slots)
//!   jobs  = queue.dequeue_ready_with(free, per-kind capacity)   → in_flight
//!   one rate-limit token per claimed job; jobs without one are released
//!   spawn one task per job (holding its bulkhead permits)
//!   idle: select! { shutdown | enqueue notify | task finished | next retry due | poll }
//! }
//! ```
//!
//! Tokens are only taken for jobs actually claimed, so an idle scheduler
//! keeps its full burst. After running out, the scheduler holds one token
//! before claiming again instead of claiming and releasing in a loop.
//!
//! Each task runs the worker under the execution timeout and settles the
//! outcome with `ack` or `nack`, retrying store errors with backoff. A job
//! whose outcome still could not be recorded is released back to `pending`
//! by the scheduler, so it runs again. The scheduler never changes job state
//! itself except to `release` jobs it interrupted or could not settle.
//!
//! # Graceful Shutdown
//!
//! 1. Stop pulling new jobs
//! 2. Wait for running tasks up to `shutdown_grace`
//! 3. Abort the rest and `release` their jobs back to `pending`
//!
//! A crash skips step 3; those jobs are recovered by the next `start()`.

use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, OwnedSemaphorePermit};
use tokio::task::{Id as TaskId, JoinError, JoinSet};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::audit::{AuditEvent, AuditSink};
use crate::config::{DispatcherConfig, SchedulerConfig};
use crate::error::DispatchError;
use crate::event::ChangeKind;
use crate::metrics;
use crate::queue::{AckOutcome, DispatchJob, DispatchQueue, JobId, KindCapacity, NackOutcome};
use crate::resilience::{Bulkhead, RateLimiter};
use crate::retry::Failure;
use crate::worker::{Outcome, ReplicationWorker};

const SETTLE_MAX_ATTEMPTS: u32 = 4;
const SETTLE_BASE_DELAY: Duration = Duration::from_millis(50);
const SETTLE_MAX_DELAY: Duration = Duration::from_secs(1);

/// Shared pieces a job task needs.
pub(crate) struct JobContext<W: ReplicationWorker> {
    pub queue: Arc<DispatchQueue>,
    pub worker: Arc<W>,
    pub audit: Arc<dyn AuditSink>,
}

impl<W: ReplicationWorker> Clone for JobContext<W> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
            worker: Arc::clone(&self.worker),
            audit: Arc::clone(&self.audit),
        }
    }
}

pub(crate) struct Scheduler<W: ReplicationWorker> {
    ctx: JobContext<W>,
    config_rx: watch::Receiver<DispatcherConfig>,
    shutdown_rx: watch::Receiver<bool>,
    global: Bulkhead,
    per_kind: BTreeMap<ChangeKind, Bulkhead>,
    rate_limiter: Option<RateLimiter>,
    tasks: JoinSet<crate::Result<()>>,
    running: HashMap<TaskId, (JobId, ChangeKind)>,
    in_flight: Arc<AtomicUsize>,
    /// Last fill ran out of rate-limit tokens
    throttled: bool,
    /// Token taken ahead of a claim while throttled
    spare_token: bool,
    /// In-flight jobs whose outcome could not be recorded
    stranded: Vec<JobId>,
}

impl<W: ReplicationWorker> Scheduler<W> {
    pub(crate) fn new(
        ctx: JobContext<W>,
        config: &SchedulerConfig,
        config_rx: watch::Receiver<DispatcherConfig>,
        shutdown_rx: watch::Receiver<bool>,
        in_flight: Arc<AtomicUsize>,
    ) -> Self {
        let per_kind = config
            .kind_limits
            .keys()
            .map(|kind| (*kind, Bulkhead::new(config.limit_for(*kind))))
            .collect();

        let rate_limiter = config.rate_limit_config().map(|cfg| {
            info!(
                rate_per_sec = cfg.refill_rate,
                burst = cfg.burst_size,
                "Rate limiting enabled for dispatch"
            );
            RateLimiter::new(cfg)
        });

        Self {
            ctx,
            config_rx,
            shutdown_rx,
            global: Bulkhead::new(config.max_concurrent_jobs),
            per_kind,
            rate_limiter,
            tasks: JoinSet::new(),
            running: HashMap::new(),
            in_flight,
            throttled: false,
            spare_token: false,
            stranded: Vec::new(),
        }
    }

    /// Run until shutdown is signaled, then drain.
    pub(crate) async fn run(mut self) {
        let span = info_span!("scheduler", max_concurrent = self.global.max_concurrent());

        async move {
            info!("Scheduler started");
            let store_error_backoff = Duration::from_secs(1);

            loop {
                if *self.shutdown_rx.borrow() {
                    break;
                }

                let (requested, claimed) = match self.fill().await {
                    Ok(counts) => counts,
                    Err(e) => {
                        error!(error = %e, "Failed to dequeue ready jobs");
                        tokio::select! {
                            _ = self.shutdown_rx.changed() => {}
                            _ = tokio::time::sleep(store_error_backoff) => {}
                        }
                        continue;
                    }
                };

                // A full batch means more may be ready right now
                if claimed > 0 && claimed == requested {
                    continue;
                }

                let sleep_for = self.idle_timeout(requested).await;
                tokio::select! {
                    biased;
                    _ = self.shutdown_rx.changed() => {
                        if *self.shutdown_rx.borrow() {
                            info!("Shutdown signal received");
                            break;
                        }
                    }
                    Some(joined) = self.tasks.join_next_with_id(), if !self.tasks.is_empty() => {
                        self.reap(joined).await;
                    }
                    _ = self.ctx.queue.notified() => {
                        debug!("Woken by enqueue");
                    }
                    _ = tokio::time::sleep(sleep_for) => {}
                }
            }

            self.drain().await;
            info!("Scheduler stopped");
        }
        .instrument(span)
        .await
    }

    /// Claim as many ready jobs as there is capacity for and spawn them.
    ///
    /// Returns `(requested, dispatched)`.
    async fn fill(&mut self) -> crate::Result<(usize, usize)> {
        while let Some(joined) = self.tasks.try_join_next_with_id() {
            self.reap(joined).await;
        }
        self.release_stranded().await;

        let want = self.global.available();
        if want == 0 {
            return Ok((0, 0));
        }
        if self.throttled && !self.spare_token {
            match &self.rate_limiter {
                Some(limiter) if !limiter.try_acquire() => return Ok((0, 0)),
                Some(_) => self.spare_token = true,
                None => {}
            }
        }
        self.throttled = false;

        let mut capacity = KindCapacity::unlimited();
        for (kind, bulkhead) in &self.per_kind {
            capacity.set(*kind, bulkhead.available());
        }

        let jobs = self.ctx.queue.dequeue_ready_with(want, &capacity).await?;
        let timeout = self.config_rx.borrow().settings.scheduler.execute_timeout_duration();

        let mut dispatched = 0;
        let mut deferred = 0;
        for job in jobs {
            if !self.take_token() {
                deferred += 1;
                self.release_unstarted(&job.job_id).await;
                continue;
            }
            match self.acquire_permits(job.kind) {
                Some(permits) => {
                    self.spawn(job, permits, timeout);
                    dispatched += 1;
                }
                None => {
                    // Capacity was checked before dequeue; only reachable if limits shrank
                    warn!(job_id = %job.job_id, "No free slot for claimed job, releasing");
                    self.release_unstarted(&job.job_id).await;
                }
            }
        }

        if deferred > 0 {
            metrics::record_rate_limited(deferred);
            debug!(deferred, "Rate limit reached, deferring claimed jobs");
            self.throttled = true;
        }
        Ok((want, dispatched))
    }

    /// One rate-limit token for a claimed job, spare token first.
    fn take_token(&mut self) -> bool {
        let Some(limiter) = &self.rate_limiter else {
            return true;
        };
        if self.spare_token {
            self.spare_token = false;
            return true;
        }
        limiter.try_acquire()
    }

    async fn release_unstarted(&self, job_id: &JobId) {
        if let Err(e) = self.ctx.queue.release(job_id).await {
            warn!(job_id = %job_id, error = %e, "Failed to release claimed job");
        }
    }

    /// Put jobs whose outcome was never recorded back to `pending`.
    async fn release_stranded(&mut self) {
        if self.stranded.is_empty() {
            return;
        }
        let mut still_stranded = Vec::new();
        for job_id in std::mem::take(&mut self.stranded) {
            match self.ctx.queue.release(&job_id).await {
                Ok(()) => info!(job_id = %job_id, "Released job with unrecorded outcome for another run"),
                Err(e @ DispatchError::Store(_)) => {
                    warn!(job_id = %job_id, error = %e, "Still cannot release job, will retry");
                    still_stranded.push(job_id);
                }
                // Settled or released by someone else in the meantime
                Err(e) => debug!(job_id = %job_id, error = %e, "Stranded job no longer in flight"),
            }
        }
        self.stranded = still_stranded;
    }

    fn acquire_permits(&self, kind: ChangeKind) -> Option<(OwnedSemaphorePermit, Option<OwnedSemaphorePermit>)> {
        let kind_permit = match self.per_kind.get(&kind) {
            Some(bulkhead) => Some(bulkhead.try_acquire()?),
            None => None,
        };
        let global_permit = self.global.try_acquire()?;
        Some((global_permit, kind_permit))
    }

    fn spawn(
        &mut self,
        job: DispatchJob,
        permits: (OwnedSemaphorePermit, Option<OwnedSemaphorePermit>),
        timeout: Duration,
    ) {
        let span = info_span!(
            "job",
            job_id = %job.job_id,
            kind = %job.kind,
            attempt = job.attempt_count + 1
        );
        let job_id = job.job_id.clone();
        let kind = job.kind;
        let ctx = self.ctx.clone();

        let handle = self.tasks.spawn(
            async move {
                let _permits = permits;
                execute_job(&ctx, job, timeout).await
            }
            .instrument(span),
        );

        self.running.insert(handle.id(), (job_id, kind));
        let count = self.in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::set_in_flight(count);
    }

    /// Bookkeeping for a finished task. A panicked task never settled its
    /// job, so report it as a retryable failure.
    async fn reap(&mut self, joined: Result<(TaskId, crate::Result<()>), JoinError>) {
        let task_id = match &joined {
            Ok((id, _)) => *id,
            Err(e) => e.id(),
        };
        let Some((job_id, _kind)) = self.running.remove(&task_id) else {
            return;
        };
        let count = self.in_flight.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        metrics::set_in_flight(count);

        match joined {
            Ok((_, Ok(()))) => {}
            Ok((_, Err(e))) => {
                error!(job_id = %job_id, error = %e, "Job outcome not recorded, releasing for another run");
                self.stranded.push(job_id);
            }
            Err(e) if e.is_panic() => {
                error!(job_id = %job_id, "Worker task panicked");
                let failure = Failure::Retryable("worker panicked".to_string());
                match self.ctx.queue.nack(&job_id, failure).await {
                    Ok(_) => {}
                    Err(e @ DispatchError::Store(_)) => {
                        error!(job_id = %job_id, error = %e, "Failed to record panicked job");
                        self.stranded.push(job_id);
                    }
                    Err(e) => debug!(job_id = %job_id, error = %e, "Panicked job already settled"),
                }
            }
            Err(_) => {}
        }
    }

    /// How long to sleep when there is nothing to do right now.
    async fn idle_timeout(&self, requested: usize) -> Duration {
        let poll = self.config_rx.borrow().settings.scheduler.poll_interval_duration();
        if self.throttled {
            if let Some(limiter) = &self.rate_limiter {
                let refill = Duration::from_secs_f64(1.0 / f64::from(limiter.config().refill_rate.max(1)));
                return poll.min(refill);
            }
        }
        if requested == 0 {
            // At capacity: a finishing task wakes us
            return poll;
        }
        match self.ctx.queue.next_eligible_at().await {
            Ok(Some(next)) => match (next - Utc::now()).to_std() {
                // Only future retries shorten the sleep; ready-but-capped jobs
                // wait for a slot
                Ok(until) if !until.is_zero() => poll.min(until),
                _ => poll,
            },
            Ok(None) => poll,
            Err(e) => {
                warn!(error = %e, "Failed to read next eligible time");
                poll
            }
        }
    }

    /// Wait for running jobs up to the grace period, then interrupt and
    /// release the rest.
    async fn drain(&mut self) {
        let grace = self.config_rx.borrow().settings.scheduler.shutdown_grace_duration();
        let running = self.tasks.len();
        if running > 0 {
            info!(running, grace_ms = grace.as_millis() as u64, "Waiting for running jobs");
        }

        let deadline = tokio::time::Instant::now() + grace;
        while !self.tasks.is_empty() {
            match tokio::time::timeout_at(deadline, self.tasks.join_next_with_id()).await {
                Ok(Some(joined)) => self.reap(joined).await,
                Ok(None) => break,
                Err(_) => {
                    warn!(remaining = self.tasks.len(), "Grace period expired, interrupting jobs");
                    self.tasks.abort_all();
                    break;
                }
            }
        }

        let mut released = 0usize;
        while let Some(joined) = self.tasks.join_next_with_id().await {
            match joined {
                Err(e) if e.is_cancelled() => {
                    if let Some((job_id, kind)) = self.running.remove(&e.id()) {
                        self.in_flight.fetch_sub(1, Ordering::Relaxed);
                        match self.ctx.queue.release(&job_id).await {
                            Ok(()) => {
                                released += 1;
                                metrics::record_release(kind.as_str());
                            }
                            // Settled just before the abort landed
                            Err(e) => debug!(job_id = %job_id, error = %e, "Interrupted job not released"),
                        }
                    }
                }
                other => self.reap(other).await,
            }
        }

        self.release_stranded().await;
        if !self.stranded.is_empty() {
            warn!(
                stranded = self.stranded.len(),
                "Jobs left in flight, recovered on next start"
            );
        }

        metrics::set_in_flight(self.in_flight.load(Ordering::Relaxed));
        if released > 0 {
            info!(released, "Released interrupted jobs back to pending");
        }
    }
}

/// Run one job and report its outcome to the queue.
///
/// An `Err` means the outcome was not recorded and the job is still
/// `in_flight`.
async fn execute_job<W: ReplicationWorker>(
    ctx: &JobContext<W>,
    job: DispatchJob,
    timeout: Duration,
) -> crate::Result<()> {
    let started = Instant::now();
    let (outcome, label) = match tokio::time::timeout(timeout, ctx.worker.execute(&job)).await {
        Ok(outcome) => {
            let label = outcome.label();
            (outcome, label)
        }
        Err(_) => (
            Outcome::RetryableFailure(format!(
                "execution timed out after {}",
                humantime::format_duration(timeout)
            )),
            "timeout",
        ),
    };
    let elapsed = started.elapsed();
    metrics::record_job_outcome(job.kind.as_str(), label, elapsed);

    let queue = &ctx.queue;
    let job_id = &job.job_id;
    match outcome {
        Outcome::Success => match settle_with_retry("ack", move || queue.ack(job_id)).await {
            Ok(AckOutcome::Succeeded) => {
                debug!(duration_ms = elapsed.as_millis() as u64, "Job succeeded");
                Ok(())
            }
            Ok(AckOutcome::Requeued) => {
                debug!("Job succeeded, newer change pending");
                Ok(())
            }
            Err(e) => already_settled(e),
        },
        Outcome::RetryableFailure(reason) => settle_failure(ctx, &job, Failure::Retryable(reason)).await,
        Outcome::FatalFailure(reason) => settle_failure(ctx, &job, Failure::Fatal(reason)).await,
    }
}

async fn settle_failure<W: ReplicationWorker>(
    ctx: &JobContext<W>,
    job: &DispatchJob,
    failure: Failure,
) -> crate::Result<()> {
    let fatal = failure.is_fatal();
    let reason = failure.reason().to_string();

    let queue = &ctx.queue;
    let job_id = &job.job_id;
    match settle_with_retry("nack", move || queue.nack(job_id, failure.clone())).await {
        Ok(NackOutcome::Retrying {
            attempt_count,
            next_eligible_at,
        }) => {
            metrics::record_retry_scheduled(job.kind.as_str(), attempt_count);
            info!(
                attempt_count,
                next_eligible_at = %next_eligible_at,
                reason = %reason,
                "Job failed, retry scheduled"
            );
            Ok(())
        }
        Ok(NackOutcome::Quarantined { attempt_count, .. }) => {
            metrics::record_quarantine(job.kind.as_str(), fatal);
            ctx.audit.record(AuditEvent::JobQuarantined {
                job_id: job.job_id.clone(),
                kind: job.kind,
                subject_id: job.subject_id.clone(),
                attempt_count,
                reason,
                at: Utc::now(),
            });
            Ok(())
        }
        Err(e) => already_settled(e),
    }
}

/// Run `ack`/`nack`, retrying store errors with exponential backoff.
async fn settle_with_retry<T, F, Fut>(op: &'static str, mut f: F) -> crate::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = crate::Result<T>>,
{
    let mut attempts = 0;
    let mut delay = SETTLE_BASE_DELAY;
    loop {
        attempts += 1;
        match f().await {
            Err(DispatchError::Store(e)) if attempts < SETTLE_MAX_ATTEMPTS => {
                warn!(
                    op,
                    attempts,
                    max_attempts = SETTLE_MAX_ATTEMPTS,
                    error = %e,
                    "Failed to record job outcome, retrying"
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(SETTLE_MAX_DELAY);
            }
            other => return other,
        }
    }
}

/// A job that is missing or no longer `in_flight` was settled elsewhere
/// (for example released by shutdown); anything else leaves it stranded.
fn already_settled(e: DispatchError) -> crate::Result<()> {
    match e {
        DispatchError::JobNotFound(_) | DispatchError::InvalidTransition { .. } => {
            debug!(error = %e, "Job already settled");
            Ok(())
        }
        other => Err(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::NoOpAuditSink;
    use crate::event::{Change, ChangeEvent};
    use crate::queue::JobState;
    use crate::resilience::RetryConfig;
    use crate::retry::RetryController;
    use crate::worker::OutcomeFuture;

    /// Worker returning a fixed outcome after an optional delay.
    struct ScriptedWorker {
        outcome: Outcome,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl ScriptedWorker {
        fn new(outcome: Outcome, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                outcome,
                delay,
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl ReplicationWorker for ScriptedWorker {
        fn execute<'a>(&'a self, _job: &'a DispatchJob) -> OutcomeFuture<'a> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(self.delay).await;
                self.outcome.clone()
            })
        }
    }

    async fn context(worker: Arc<ScriptedWorker>) -> JobContext<ScriptedWorker> {
        let queue = DispatchQueue::in_memory(RetryController::new(RetryConfig::testing()))
            .await
            .unwrap();
        JobContext {
            queue: Arc::new(queue),
            worker,
            audit: Arc::new(NoOpAuditSink),
        }
    }

    fn repo(id: &str) -> ChangeEvent {
        ChangeEvent::new(Change::RepositoryUpdate { project_id: id.into() })
    }

    #[tokio::test]
    async fn test_execute_job_success_acks() {
        let ctx = context(ScriptedWorker::new(Outcome::Success, Duration::ZERO)).await;
        let outcome = ctx.queue.enqueue(&repo("1")).await.unwrap();
        let job = ctx.queue.dequeue_ready(1).await.unwrap().remove(0);

        execute_job(&ctx, job, Duration::from_secs(1)).await.unwrap();

        let job = ctx.queue.get(&outcome.job_id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Succeeded);
    }

    #[tokio::test]
    async fn test_execute_job_timeout_is_retryable() {
        let ctx = context(ScriptedWorker::new(Outcome::Success, Duration::from_secs(5))).await;
        let outcome = ctx.queue.enqueue(&repo("slow")).await.unwrap();
        let job = ctx.queue.dequeue_ready(1).await.unwrap().remove(0);

        execute_job(&ctx, job, Duration::from_millis(20)).await.unwrap();

        let job = ctx.queue.get(&outcome.job_id).await.unwrap().unwrap();
        assert!(job.is_retrying());
        assert!(job.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_execute_job_fatal_quarantines() {
        let ctx = context(ScriptedWorker::new(
            Outcome::FatalFailure("project deleted".into()),
            Duration::ZERO,
        ))
        .await;
        let outcome = ctx.queue.enqueue(&repo("gone")).await.unwrap();
        let job = ctx.queue.dequeue_ready(1).await.unwrap().remove(0);

        execute_job(&ctx, job, Duration::from_secs(1)).await.unwrap();

        let job = ctx.queue.get(&outcome.job_id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Quarantined);
    }

    #[tokio::test]
    async fn test_scheduler_respects_global_limit_and_drains() {
        let worker = ScriptedWorker::new(Outcome::Success, Duration::from_millis(30));
        let ctx = context(Arc::clone(&worker)).await;
        for i in 0..6 {
            ctx.queue.enqueue(&repo(&i.to_string())).await.unwrap();
        }

        let mut config = DispatcherConfig::for_testing("sched");
        config.settings.scheduler.max_concurrent_jobs = 2;
        let (_config_tx, config_rx) = watch::channel(config.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let in_flight = Arc::new(AtomicUsize::new(0));

        let scheduler = Scheduler::new(
            ctx.clone(),
            &config.settings.scheduler,
            config_rx,
            shutdown_rx,
            Arc::clone(&in_flight),
        );
        let handle = tokio::spawn(scheduler.run());

        let mut max_seen = 0;
        for _ in 0..200 {
            max_seen = max_seen.max(ctx.queue.stats().await.unwrap().in_flight);
            if ctx.queue.stats().await.unwrap().succeeded == 6 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(ctx.queue.stats().await.unwrap().succeeded, 6);
        assert!(max_seen <= 2, "saw {max_seen} jobs in flight");

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(in_flight.load(Ordering::SeqCst), 0);
        assert_eq!(worker.calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_rate_limited_scheduler_still_drains() {
        let ctx = context(ScriptedWorker::new(Outcome::Success, Duration::ZERO)).await;
        for i in 0..5 {
            ctx.queue.enqueue(&repo(&i.to_string())).await.unwrap();
        }

        let mut config = DispatcherConfig::for_testing("sched");
        config.settings.scheduler.rate_limit_enabled = true;
        config.settings.scheduler.rate_limit_burst = 1;
        config.settings.scheduler.rate_limit_per_sec = 200;
        let (_config_tx, config_rx) = watch::channel(config.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let scheduler = Scheduler::new(
            ctx.clone(),
            &config.settings.scheduler,
            config_rx,
            shutdown_rx,
            Arc::new(AtomicUsize::new(0)),
        );
        let handle = tokio::spawn(scheduler.run());

        for _ in 0..200 {
            if ctx.queue.stats().await.unwrap().succeeded == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(ctx.queue.stats().await.unwrap().succeeded, 5);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_releases_interrupted_jobs() {
        let worker = ScriptedWorker::new(Outcome::Success, Duration::from_secs(30));
        let ctx = context(worker).await;
        let outcome = ctx.queue.enqueue(&repo("stuck")).await.unwrap();

        let mut config = DispatcherConfig::for_testing("sched");
        config.settings.scheduler.shutdown_grace = "20ms".into();
        let (_config_tx, config_rx) = watch::channel(config.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let scheduler = Scheduler::new(
            ctx.clone(),
            &config.settings.scheduler,
            config_rx,
            shutdown_rx,
            Arc::new(AtomicUsize::new(0)),
        );
        let handle = tokio::spawn(scheduler.run());

        for _ in 0..100 {
            if ctx.queue.stats().await.unwrap().in_flight == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("scheduler should stop within the grace period")
            .unwrap();

        let job = ctx.queue.get(&outcome.job_id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempt_count, 0);
    }

    fn spawn_scheduler(
        ctx: &JobContext<ScriptedWorker>,
        config: &DispatcherConfig,
    ) -> (tokio::task::JoinHandle<()>, watch::Sender<bool>) {
        let (_config_tx, config_rx) = watch::channel(config.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let scheduler = Scheduler::new(
            ctx.clone(),
            &config.settings.scheduler,
            config_rx,
            shutdown_rx,
            Arc::new(AtomicUsize::new(0)),
        );
        (tokio::spawn(scheduler.run()), shutdown_tx)
    }

    async fn wait_for_succeeded(ctx: &JobContext<ScriptedWorker>, expected: u64, within: Duration) -> u64 {
        let deadline = Instant::now() + within;
        loop {
            let succeeded = ctx.queue.stats().await.unwrap().succeeded;
            if succeeded >= expected || Instant::now() >= deadline {
                return succeeded;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn rate_limited_config(burst: u32, per_sec: u32) -> DispatcherConfig {
        let mut config = DispatcherConfig::for_testing("sched");
        config.settings.scheduler.rate_limit_enabled = true;
        config.settings.scheduler.rate_limit_burst = burst;
        config.settings.scheduler.rate_limit_per_sec = per_sec;
        config
    }

    #[tokio::test]
    async fn test_idle_scheduler_keeps_full_burst() {
        let ctx = context(ScriptedWorker::new(Outcome::Success, Duration::ZERO)).await;
        let (handle, shutdown_tx) = spawn_scheduler(&ctx, &rate_limited_config(5, 1));

        // Many empty polls while idle
        tokio::time::sleep(Duration::from_millis(300)).await;

        for i in 0..5 {
            ctx.queue.enqueue(&repo(&i.to_string())).await.unwrap();
        }
        let succeeded = wait_for_succeeded(&ctx, 5, Duration::from_millis(400)).await;
        assert_eq!(succeeded, 5, "whole burst should dispatch at once after idling");

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_rate_limited_jobs_wait_in_pending() {
        let worker = ScriptedWorker::new(Outcome::Success, Duration::ZERO);
        let ctx = context(Arc::clone(&worker)).await;
        for i in 0..4 {
            ctx.queue.enqueue(&repo(&i.to_string())).await.unwrap();
        }
        let (handle, shutdown_tx) = spawn_scheduler(&ctx, &rate_limited_config(2, 1));

        assert_eq!(wait_for_succeeded(&ctx, 2, Duration::from_secs(1)).await, 2);
        tokio::time::sleep(Duration::from_millis(150)).await;

        let stats = ctx.queue.stats().await.unwrap();
        assert_eq!(stats.succeeded, 2);
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.in_flight, 0);
        assert_eq!(worker.calls.load(Ordering::SeqCst), 2);
        for job in ctx.queue.history(ChangeKind::RepositoryUpdate, "3").await.unwrap() {
            assert_eq!(job.attempt_count, 0);
        }

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_ack_is_retried() {
        let ctx = context(ScriptedWorker::new(Outcome::Success, Duration::ZERO)).await;
        let outcome = ctx.queue.enqueue(&repo("1")).await.unwrap();
        let job = ctx.queue.dequeue_ready(1).await.unwrap().remove(0);

        ctx.queue.fail_next_ops(2);
        execute_job(&ctx, job, Duration::from_secs(1)).await.unwrap();

        let job = ctx.queue.get(&outcome.job_id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Succeeded);
    }

    #[tokio::test]
    async fn test_failed_nack_is_retried() {
        let ctx = context(ScriptedWorker::new(
            Outcome::RetryableFailure("busy".into()),
            Duration::ZERO,
        ))
        .await;
        let outcome = ctx.queue.enqueue(&repo("1")).await.unwrap();
        let job = ctx.queue.dequeue_ready(1).await.unwrap().remove(0);

        ctx.queue.fail_next_ops(SETTLE_MAX_ATTEMPTS - 1);
        execute_job(&ctx, job, Duration::from_secs(1)).await.unwrap();

        let job = ctx.queue.get(&outcome.job_id).await.unwrap().unwrap();
        assert!(job.is_retrying());
        assert_eq!(job.attempt_count, 1);
    }

    #[tokio::test]
    async fn test_unrecorded_outcome_is_released_and_rerun() {
        let worker = ScriptedWorker::new(Outcome::Success, Duration::ZERO);
        let ctx = context(Arc::clone(&worker)).await;
        let outcome = ctx.queue.enqueue(&repo("stuck")).await.unwrap();

        // Every ack of the first run fails, plus one of the second
        ctx.queue.fail_next_ops(SETTLE_MAX_ATTEMPTS + 1);
        let (handle, shutdown_tx) = spawn_scheduler(&ctx, &DispatcherConfig::for_testing("sched"));

        assert_eq!(wait_for_succeeded(&ctx, 1, Duration::from_secs(5)).await, 1);
        let job = ctx.queue.get(&outcome.job_id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Succeeded);
        assert_eq!(worker.calls.load(Ordering::SeqCst), 2);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
