//! Drains due sync queue items. Each retry claims the item, takes the deal lock,
//! re-reads the deal, drops anything the deal has moved past, and writes what is left.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink};
use crate::dispatch::SideEffectDispatcher;
use crate::domain::deal::{Deal, SyncStatus};
use crate::domain::intent::{DealPatch, WriteIntent};
use crate::domain::sync::{AttemptOutcome, SyncItemId, SyncItemStatus, SyncQueueItem};
use crate::errors::{ReconcileError, WriteError};
use crate::locks::DealLocks;
use crate::ports::CrmGateway;
use crate::sync_queue::{SyncQueue, SyncQueueError};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RetryOutcome {
    /// Claimed by another worker, not yet due, or already finished.
    InFlight,
    Completed,
    Superseded,
    Rescheduled { next_attempt_at: DateTime<Utc> },
    Escalated,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySummary {
    pub examined: u32,
    pub completed: u32,
    pub superseded: u32,
    pub rescheduled: u32,
    pub escalated: u32,
    pub in_flight: u32,
    pub errors: u32,
}

impl RetrySummary {
    fn record(&mut self, outcome: &RetryOutcome) {
        match outcome {
            RetryOutcome::InFlight => self.in_flight += 1,
            RetryOutcome::Completed => self.completed += 1,
            RetryOutcome::Superseded => self.superseded += 1,
            RetryOutcome::Rescheduled { .. } => self.rescheduled += 1,
            RetryOutcome::Escalated => self.escalated += 1,
        }
    }
}

pub struct SyncRetryWorker {
    crm: Arc<dyn CrmGateway>,
    queue: Arc<SyncQueue>,
    dispatcher: Arc<SideEffectDispatcher>,
    locks: DealLocks,
    audit: Arc<dyn AuditSink>,
    worker_id: String,
    batch_size: u32,
}

impl SyncRetryWorker {
    pub fn new(
        crm: Arc<dyn CrmGateway>,
        queue: Arc<SyncQueue>,
        dispatcher: Arc<SideEffectDispatcher>,
        locks: DealLocks,
        audit: Arc<dyn AuditSink>,
        worker_id: impl Into<String>,
    ) -> Self {
        Self { crm, queue, dispatcher, locks, audit, worker_id: worker_id.into(), batch_size: 50 }
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// One polling pass over every item due at `now`.
    pub async fn run_due(&self, now: DateTime<Utc>) -> Result<RetrySummary, SyncQueueError> {
        let mut summary = RetrySummary::default();
        for item in self.queue.due(now, self.batch_size).await? {
            summary.examined += 1;
            match self.retry(&item.id, now).await {
                Ok(outcome) => summary.record(&outcome),
                Err(error) => {
                    summary.errors += 1;
                    warn!(
                        event_name = "sync_queue.retry.error",
                        correlation_id = %item.correlation_id,
                        sync_item_id = %item.id,
                        worker_id = %self.worker_id,
                        error = %error,
                        "retry attempt could not be recorded"
                    );
                }
            }
        }
        Ok(summary)
    }

    pub async fn retry(
        &self,
        id: &SyncItemId,
        now: DateTime<Utc>,
    ) -> Result<RetryOutcome, SyncQueueError> {
        let Some(item) = self.queue.claim(id, &self.worker_id, now).await? else {
            return Ok(RetryOutcome::InFlight);
        };

        let _guard = self.locks.acquire(&item.deal_id).await;
        let current = match self.crm.fetch_deal(&item.deal_id).await {
            Ok(Some(deal)) => deal,
            Ok(None) => {
                let error =
                    WriteError::Permanent(format!("deal `{}` no longer exists", item.deal_id));
                return self.record_failure(item, error, now).await;
            }
            Err(error) => return self.record_failure(item, error, now).await,
        };

        let intent = item.write_intent.revalidated(&current);
        if intent.is_empty() {
            let item = self.queue.complete(item, AttemptOutcome::Superseded, now).await?;
            self.run_follow_up(&item, &current, now).await;
            return Ok(RetryOutcome::Superseded);
        }

        match self.crm.write(&intent).await {
            Ok(()) => {
                let item = self.queue.complete(item, AttemptOutcome::Succeeded, now).await?;
                let mut updated = current;
                if let Err(error) = updated.apply_properties(&intent.properties()) {
                    warn!(
                        event_name = "sync_queue.retry.local_apply_failed",
                        correlation_id = %item.correlation_id,
                        deal_id = %item.deal_id,
                        error = %error,
                        "retried write could not be mirrored locally"
                    );
                }
                self.run_follow_up(&item, &updated, now).await;
                Ok(RetryOutcome::Completed)
            }
            Err(error) => self.record_failure(item, error, now).await,
        }
    }

    async fn record_failure(
        &self,
        item: SyncQueueItem,
        error: WriteError,
        now: DateTime<Utc>,
    ) -> Result<RetryOutcome, SyncQueueError> {
        let item = self.queue.fail(item, &error, now).await?;
        if item.status != SyncItemStatus::FailedManualReview {
            return Ok(RetryOutcome::Rescheduled { next_attempt_at: item.next_attempt_at });
        }
        let escalation = ReconcileError::Escalation(item.id.to_string());

        self.audit.emit(
            AuditEvent::new(
                Some(item.deal_id.clone()),
                item.correlation_id.clone(),
                "sync_queue.item.escalated",
                AuditCategory::SyncQueue,
                self.worker_id.clone(),
                AuditOutcome::Failed,
            )
            .with_metadata("sync_item_id", item.id.to_string())
            .with_metadata("attempts", item.attempts.to_string())
            .with_metadata("error_class", escalation.class())
            .with_metadata("error", error.message()),
        );
        self.mark_deal_failed(&item, &escalation, &error).await;
        Ok(RetryOutcome::Escalated)
    }

    /// Best effort: the item is already in manual review whatever happens here.
    async fn mark_deal_failed(
        &self,
        item: &SyncQueueItem,
        escalation: &ReconcileError,
        error: &WriteError,
    ) {
        let intent = WriteIntent::new(
            item.deal_id.clone(),
            DealPatch {
                sync_status: Some(SyncStatus::Failed),
                sync_error: Some(format!("{escalation}: {}", error.message())),
                ..DealPatch::default()
            },
            "sync retries exhausted",
        );
        if let Err(write_error) = self.crm.write(&intent).await {
            warn!(
                event_name = "sync_queue.item.mark_failed_error",
                correlation_id = %item.correlation_id,
                deal_id = %item.deal_id,
                sync_item_id = %item.id,
                error = %write_error,
                "could not flag deal after escalation"
            );
        }
    }

    async fn run_follow_up(&self, item: &SyncQueueItem, deal: &Deal, now: DateTime<Utc>) {
        let Some(request) = &item.follow_up else {
            return;
        };
        match self
            .dispatcher
            .dispatch_and_record(
                request,
                deal,
                self.crm.as_ref(),
                &self.queue,
                &item.correlation_id,
                now,
            )
            .await
        {
            Ok(outcome) => info!(
                event_name = "sync_queue.follow_up.dispatched",
                correlation_id = %item.correlation_id,
                deal_id = %item.deal_id,
                sync_item_id = %item.id,
                triggered = outcome.is_triggered(),
                "follow-up dispatch evaluated"
            ),
            Err(error) => warn!(
                event_name = "sync_queue.follow_up.failed",
                correlation_id = %item.correlation_id,
                deal_id = %item.deal_id,
                sync_item_id = %item.id,
                error = %error,
                "follow-up dispatch could not reach the ledger"
            ),
        }
    }
}
