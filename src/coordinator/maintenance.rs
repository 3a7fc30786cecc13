//! Background maintenance: queue gauges and retention purge.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::config::RetentionConfig;
use crate::metrics;
use crate::queue::DispatchQueue;

/// How often queue depth gauges are refreshed.
const GAUGE_INTERVAL: Duration = Duration::from_secs(15);

/// Refresh gauges every [`GAUGE_INTERVAL`] and purge expired terminal rows
/// every `purge_interval_sec`, until shutdown.
pub(crate) async fn run_maintenance(
    queue: Arc<DispatchQueue>,
    retention: RetentionConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let purge_every = retention.purge_interval();
    let mut timer = interval(GAUGE_INTERVAL.min(purge_every));
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_purge = Instant::now();

    loop {
        tokio::select! {
            _ = timer.tick() => {
                match queue.stats().await {
                    Ok(stats) => metrics::set_queue_depth(&stats),
                    Err(e) => warn!(error = %e, "Failed to read queue stats"),
                }

                if retention.enabled && last_purge.elapsed() >= purge_every {
                    last_purge = Instant::now();
                    purge(&queue, &retention).await;
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    debug!("Maintenance task stopping");
                    break;
                }
            }
        }
    }
}

async fn purge(queue: &DispatchQueue, retention: &RetentionConfig) {
    match queue.purge_terminal(&retention.retention()).await {
        Ok(report) => metrics::record_purge(report.succeeded, report.quarantined, report.failure_records),
        Err(e) => warn!(error = %e, "Retention purge failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Change, ChangeEvent};
    use crate::retry::RetryController;

    #[tokio::test]
    async fn test_purge_removes_expired_succeeded_jobs() {
        let queue = DispatchQueue::in_memory(RetryController::default()).await.unwrap();
        let outcome = queue
            .enqueue(&ChangeEvent::new(Change::WikiUpdate { project_id: "9".into() }))
            .await
            .unwrap();
        queue.dequeue_ready(1).await.unwrap();
        queue.ack(&outcome.job_id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let retention = RetentionConfig {
            succeeded_sec: 0,
            ..Default::default()
        };
        purge(&queue, &retention).await;

        assert!(queue.get(&outcome.job_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_maintenance_stops_on_shutdown() {
        let queue = Arc::new(DispatchQueue::in_memory(RetryController::default()).await.unwrap());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(run_maintenance(queue, RetentionConfig::default(), shutdown_rx));
        tokio::time::sleep(Duration::from_millis(10)).await;
        shutdown_tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("maintenance should stop")
            .unwrap();
    }
}
