// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Chaos tests: simulate failures and verify graceful degradation.
//!
//! These tests verify the dispatcher handles crashes, flaky targets and
//! intake storms without losing changes, duplicating active jobs or
//! deadlocking.
//!
//! Run with: cargo test --test chaos_tests -- --nocapture

mod common;

use common::{test_config, wait_for_state, MockTarget, RecordingAuditSink};
use replication_dispatcher::worker::{TargetError, TargetWorker};
use replication_dispatcher::{
    CallerIdentity, Change, ChangeEvent, ChangeKind, Dispatcher, DispatchQueue, DispatcherConfig, JobState,
    RawChange, RetryController, StoreConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::sync::watch;
use tokio::time::sleep;

fn repo(id: &str) -> ChangeEvent {
    ChangeEvent::new(Change::RepositoryUpdate { project_id: id.into() })
}

fn file_config(node_id: &str, path: &std::path::Path) -> DispatcherConfig {
    let mut config = test_config(node_id, 5);
    config.store = StoreConfig::at(path.to_string_lossy());
    config
}

async fn dispatcher_on(
    config: DispatcherConfig,
    target: Arc<MockTarget>,
) -> Dispatcher<TargetWorker<Arc<MockTarget>>> {
    let (_tx, rx) = watch::channel(config.clone());
    let worker = TargetWorker::new(target, config.settings.circuit.to_circuit_config());
    Dispatcher::with_worker(config, rx, Arc::new(worker), Arc::new(RecordingAuditSink::new()))
        .await
        .unwrap()
}

// =============================================================================
// Crash Recovery
// =============================================================================

/// Test: a job claimed by a process that died is run again after restart
#[tokio::test]
async fn crash_mid_flight_job_is_recovered() {
    let dir = tempdir().unwrap();
    let store = StoreConfig::at(dir.path().join("crash.db").to_string_lossy());

    let job_id = {
        let queue = DispatchQueue::open(&store, RetryController::default()).await.unwrap();
        let outcome = queue.enqueue(&repo("1")).await.unwrap();
        let claimed = queue.dequeue_ready(1).await.unwrap();
        assert_eq!(claimed.len(), 1);
        // Dropped without ack, release or close
        outcome.job_id
    };

    let queue = DispatchQueue::open(&store, RetryController::default()).await.unwrap();
    assert_eq!(queue.get(&job_id).await.unwrap().unwrap().state, JobState::InFlight);

    assert_eq!(queue.recover_in_flight().await.unwrap(), 1);
    let job = queue.dequeue_ready(1).await.unwrap().remove(0);
    assert_eq!(job.job_id, job_id);
    // Interruption is not a failed attempt
    assert_eq!(job.attempt_count, 0);
    queue.close().await;
}

/// Test: a dispatcher restarted on the same store finishes the work
#[tokio::test]
async fn crash_dispatcher_restart_completes_work() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("restart.db");

    let job_id = {
        let dispatcher = dispatcher_on(file_config("node-a", &path), Arc::new(MockTarget::new())).await;
        let outcome = dispatcher.queue().enqueue(&repo("restart")).await.unwrap();
        dispatcher.queue().dequeue_ready(1).await.unwrap();
        outcome.job_id
        // Never started, never shut down
    };

    let target = Arc::new(MockTarget::new());
    let mut dispatcher = dispatcher_on(file_config("node-a", &path), Arc::clone(&target)).await;
    dispatcher.start().await.unwrap();

    assert!(wait_for_state(dispatcher.queue(), &job_id, JobState::Succeeded, Duration::from_secs(5)).await);
    assert_eq!(target.calls_for("restart").await, 1);
    dispatcher.shutdown().await;
}

// =============================================================================
// Shutdown
// =============================================================================

/// Test: shutdown interrupts a stuck job and returns it to pending
#[tokio::test]
async fn shutdown_releases_slow_job() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("shutdown.db");
    let mut config = file_config("node-b", &path);
    config.settings.scheduler.shutdown_grace = "50ms".into();

    let target = Arc::new(MockTarget::slow(Duration::from_secs(30)));
    let mut dispatcher = dispatcher_on(config, target).await;
    dispatcher.start().await.unwrap();

    let outcome = dispatcher.queue().enqueue(&repo("slow")).await.unwrap();
    assert!(wait_for_state(dispatcher.queue(), &outcome.job_id, JobState::InFlight, Duration::from_secs(5)).await);

    tokio::time::timeout(Duration::from_secs(5), dispatcher.shutdown())
        .await
        .expect("shutdown should not wait for the stuck job");

    let queue = DispatchQueue::open(&StoreConfig::at(path.to_string_lossy()), RetryController::default())
        .await
        .unwrap();
    let job = queue.get(&outcome.job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.attempt_count, 0);
    queue.close().await;
}

/// Test: repeated shutdown is harmless
#[tokio::test]
async fn shutdown_twice_is_idempotent() {
    let (_tx, rx) = watch::channel(test_config("twice", 3));
    let mut dispatcher = Dispatcher::new(test_config("twice", 3), rx).await.unwrap();
    dispatcher.start().await.unwrap();

    dispatcher.shutdown().await;
    dispatcher.shutdown().await;
    assert!(!dispatcher.is_running());
}

// =============================================================================
// Flaky Targets
// =============================================================================

/// Test: intermittent target outages delay but never lose work
#[tokio::test]
async fn flaky_target_eventually_converges() {
    let target = Arc::new(MockTarget::new());
    for i in 0..10 {
        let failures = i % 4;
        target
            .fail_next(&i.to_string(), failures, TargetError::Unavailable("connection refused".into()))
            .await;
    }

    let mut dispatcher = dispatcher_on(test_config("flaky", 5), Arc::clone(&target)).await;
    dispatcher.start().await.unwrap();

    let mut job_ids = Vec::new();
    for i in 0..10 {
        job_ids.push(dispatcher.queue().enqueue(&repo(&i.to_string())).await.unwrap().job_id);
    }
    for job_id in &job_ids {
        assert!(wait_for_state(dispatcher.queue(), job_id, JobState::Succeeded, Duration::from_secs(10)).await);
    }

    let stats = dispatcher.queue().stats().await.unwrap();
    assert_eq!(stats.succeeded, 10);
    assert_eq!(stats.quarantined, 0);
    dispatcher.shutdown().await;
}

/// Test: a change arriving while its job runs triggers exactly one rerun
#[tokio::test]
async fn change_during_flight_is_not_lost() {
    let target = Arc::new(MockTarget::slow(Duration::from_millis(100)));
    let mut dispatcher = dispatcher_on(test_config("rerun", 3), Arc::clone(&target)).await;
    dispatcher.start().await.unwrap();

    let outcome = dispatcher.queue().enqueue(&repo("hot")).await.unwrap();
    assert!(wait_for_state(dispatcher.queue(), &outcome.job_id, JobState::InFlight, Duration::from_secs(5)).await);

    // Three pushes while the pull runs collapse into one rerun
    for _ in 0..3 {
        let again = dispatcher.queue().enqueue(&repo("hot")).await.unwrap();
        assert_eq!(again.job_id, outcome.job_id);
        assert!(again.coalesced);
    }

    for _ in 0..200 {
        if target.calls_for("hot").await == 2 {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert!(wait_for_state(dispatcher.queue(), &outcome.job_id, JobState::Succeeded, Duration::from_secs(5)).await);
    assert_eq!(target.calls_for("hot").await, 2);
    dispatcher.shutdown().await;
}

// =============================================================================
// Intake Storms
// =============================================================================

/// Test: concurrent producers hammering a few subjects never create a
/// second active job for any of them
#[tokio::test]
async fn intake_storm_keeps_one_active_job_per_subject() {
    let target = Arc::new(MockTarget::slow(Duration::from_millis(2)));
    let mut dispatcher = dispatcher_on(test_config("storm", 3), Arc::clone(&target)).await;
    dispatcher.start().await.unwrap();

    let intake = dispatcher.intake().clone();
    let producers: Vec<_> = (0..8)
        .map(|p| {
            let intake = intake.clone();
            tokio::spawn(async move {
                let caller = CallerIdentity::admin(format!("producer-{p}"));
                for round in 0..20 {
                    let subject = (p + round) % 5;
                    intake
                        .submit(&caller, vec![RawChange::repository_update(subject)])
                        .await
                        .unwrap();
                }
            })
        })
        .collect();

    let queue = Arc::clone(dispatcher.queue());
    let checker = tokio::spawn(async move {
        for _ in 0..50 {
            for subject in 0..5 {
                let history = queue
                    .history(ChangeKind::RepositoryUpdate, &subject.to_string())
                    .await
                    .unwrap();
                let active = history.iter().filter(|job| job.state.is_active()).count();
                assert!(active <= 1, "subject {subject} has {active} active jobs");
            }
            sleep(Duration::from_millis(2)).await;
        }
    });

    for producer in producers {
        producer.await.unwrap();
    }
    checker.await.unwrap();

    // Everything drains
    for _ in 0..500 {
        if dispatcher.queue().stats().await.unwrap().active() == 0 {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    let stats = dispatcher.queue().stats().await.unwrap();
    assert_eq!(stats.active(), 0);
    assert_eq!(stats.quarantined, 0);
    dispatcher.shutdown().await;
}
