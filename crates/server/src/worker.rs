use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dealsync_core::SyncRetryWorker;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

/// Polls the sync queue until `shutdown` flips to `true` or its sender is dropped.
/// A pass in progress always finishes before the loop exits.
pub fn spawn(
    worker: Arc<SyncRetryWorker>,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(poll_interval.max(Duration::from_millis(10)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            event_name = "sync_queue.worker.started",
            correlation_id = "worker",
            worker_id = worker.worker_id(),
            poll_interval_ms = poll_interval.as_millis() as u64,
            "sync retry worker started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => run_pass(&worker).await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(
            event_name = "sync_queue.worker.stopped",
            correlation_id = "shutdown",
            worker_id = worker.worker_id(),
            "sync retry worker stopped"
        );
    })
}

/// Signals the worker and waits up to `grace` for it to finish its pass. A worker that
/// overruns is aborted and awaited, so nothing touches the pool once this returns.
/// Returns `false` when the worker had to be abandoned.
pub async fn stop(
    mut handle: JoinHandle<()>,
    shutdown: &watch::Sender<bool>,
    grace: Duration,
) -> bool {
    let _ = shutdown.send(true);
    if tokio::time::timeout(grace, &mut handle).await.is_ok() {
        return true;
    }

    handle.abort();
    let _ = handle.await;
    warn!(
        event_name = "sync_queue.worker.abandoned",
        correlation_id = "shutdown",
        grace_secs = grace.as_secs(),
        "sync retry worker overran the shutdown grace period; in-flight claims are retried once stale"
    );
    false
}

async fn run_pass(worker: &SyncRetryWorker) {
    match worker.run_due(Utc::now()).await {
        Ok(summary) if summary.examined > 0 => info!(
            event_name = "sync_queue.worker.pass",
            correlation_id = "worker",
            worker_id = worker.worker_id(),
            examined = summary.examined,
            completed = summary.completed,
            rescheduled = summary.rescheduled,
            escalated = summary.escalated,
            superseded = summary.superseded,
            errors = summary.errors,
            "sync retry pass finished"
        ),
        Ok(_) => {}
        Err(error) => error!(
            event_name = "sync_queue.worker.error",
            correlation_id = "worker",
            worker_id = worker.worker_id(),
            error = %error,
            "sync retry pass failed"
        ),
    }
}
