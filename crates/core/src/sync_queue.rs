//! Sync Retry Queue
//!
//! Write intents that failed transiently are captured as queue items and
//! retried on a fixed schedule. The state machine lives in [`SyncRetryEngine`]
//! and takes the clock as an argument so schedules can be exercised exactly;
//! [`SyncQueue`] pairs it with a store.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::dispatch::DispatchRequest;
use crate::domain::intent::WriteIntent;
use crate::domain::sync::{
    AttemptOutcome, SyncAttempt, SyncItemId, SyncItemStatus, SyncQueueFilter, SyncQueueItem,
    SyncQueueStats,
};
use crate::errors::{ReconcileError, StoreError, WriteError};
use crate::ports::{CrmGateway, SyncQueueStore};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncQueueConfig {
    pub max_attempts: u32,
    /// Delay before attempt n+1, measured from attempt n (the original write for n = 0).
    pub retry_intervals_secs: Vec<u64>,
    /// How long before a claimed item is considered abandoned.
    pub claim_timeout_seconds: i64,
}

impl Default for SyncQueueConfig {
    fn default() -> Self {
        Self { max_attempts: 3, retry_intervals_secs: vec![1, 5, 30], claim_timeout_seconds: 300 }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SyncQueueError {
    #[error("invalid sync item transition from {from:?}: {reason}")]
    InvalidTransition { from: SyncItemStatus, reason: String },
    #[error("sync item not found: {0}")]
    NotFound(SyncItemId),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone, Debug, Default)]
pub struct SyncRetryEngine {
    config: SyncQueueConfig,
}

impl SyncRetryEngine {
    pub fn new(config: SyncQueueConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SyncQueueConfig {
        &self.config
    }

    /// Delay before the retry that follows `completed_attempts` failed tries.
    pub fn delay_after(&self, completed_attempts: u32) -> Duration {
        let intervals = &self.config.retry_intervals_secs;
        let seconds = intervals
            .get(completed_attempts as usize)
            .or_else(|| intervals.last())
            .copied()
            .unwrap_or(0);
        Duration::seconds(i64::try_from(seconds).unwrap_or(i64::MAX / 1_000))
    }

    pub fn stale_before(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::seconds(self.config.claim_timeout_seconds)
    }

    pub fn create_item(
        &self,
        intent: WriteIntent,
        follow_up: Option<DispatchRequest>,
        initial_error: impl Into<String>,
        correlation_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> SyncQueueItem {
        SyncQueueItem {
            id: SyncItemId(format!("SYNC-{}", Uuid::new_v4().simple())),
            deal_id: intent.target_deal_id.clone(),
            write_intent: intent,
            follow_up,
            attempts: 0,
            max_attempts: self.config.max_attempts,
            retry_intervals_secs: self.config.retry_intervals_secs.clone(),
            status: SyncItemStatus::Queued,
            history: Vec::new(),
            next_attempt_at: now + self.delay_after(0),
            last_error: Some(initial_error.into()),
            claimed_by: None,
            claimed_at: None,
            state_version: 1,
            correlation_id: correlation_id.into(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether a worker may try to claim the item at `now`.
    pub fn is_due(&self, item: &SyncQueueItem, now: DateTime<Utc>) -> bool {
        item.status.is_pending() && item.next_attempt_at <= now
    }

    pub fn record_success(
        &self,
        mut item: SyncQueueItem,
        outcome: AttemptOutcome,
        now: DateTime<Utc>,
    ) -> Result<SyncQueueItem, SyncQueueError> {
        Self::validate_claimed(&item)?;

        item.attempts += 1;
        item.history.push(SyncAttempt {
            attempt: item.attempts,
            outcome,
            error: None,
            attempted_at: now,
        });
        item.status = SyncItemStatus::Completed;
        item.last_error = None;
        Self::release(&mut item, now);
        Ok(item)
    }

    /// Records a failed attempt. Transient failures are rescheduled until the attempt budget
    /// runs out; permanent failures go straight to manual review.
    pub fn record_failure(
        &self,
        mut item: SyncQueueItem,
        error: &WriteError,
        now: DateTime<Utc>,
    ) -> Result<SyncQueueItem, SyncQueueError> {
        Self::validate_claimed(&item)?;

        item.attempts += 1;
        let outcome = if error.is_transient() {
            AttemptOutcome::TransientFailure
        } else {
            AttemptOutcome::PermanentFailure
        };
        item.history.push(SyncAttempt {
            attempt: item.attempts,
            outcome,
            error: Some(error.message().to_string()),
            attempted_at: now,
        });
        item.last_error = Some(error.message().to_string());

        if error.is_transient() && item.attempts < item.max_attempts {
            item.status = SyncItemStatus::Scheduled;
            item.next_attempt_at = now + self.delay_after(item.attempts);
        } else {
            item.status = SyncItemStatus::FailedManualReview;
        }
        Self::release(&mut item, now);
        Ok(item)
    }

    fn validate_claimed(item: &SyncQueueItem) -> Result<(), SyncQueueError> {
        if !item.status.is_pending() {
            return Err(SyncQueueError::InvalidTransition {
                from: item.status,
                reason: "item already in terminal state".to_string(),
            });
        }
        if item.claimed_by.is_none() {
            return Err(SyncQueueError::InvalidTransition {
                from: item.status,
                reason: "attempt recorded without a claim".to_string(),
            });
        }
        Ok(())
    }

    fn release(item: &mut SyncQueueItem, now: DateTime<Utc>) {
        item.claimed_by = None;
        item.claimed_at = None;
        item.state_version += 1;
        item.updated_at = now;
    }
}

/// Result of writing an intent with retry capture.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    Applied,
    /// Nothing left to write.
    Unchanged,
    Queued(SyncItemId),
    Rejected(String),
}

pub struct SyncQueue {
    engine: SyncRetryEngine,
    store: Arc<dyn SyncQueueStore>,
}

impl SyncQueue {
    pub fn new(engine: SyncRetryEngine, store: Arc<dyn SyncQueueStore>) -> Self {
        Self { engine, store }
    }

    pub fn engine(&self) -> &SyncRetryEngine {
        &self.engine
    }

    pub async fn enqueue(
        &self,
        intent: WriteIntent,
        follow_up: Option<DispatchRequest>,
        error: &str,
        correlation_id: &str,
        now: DateTime<Utc>,
    ) -> Result<SyncQueueItem, StoreError> {
        let item = self.engine.create_item(intent, follow_up, error, correlation_id, now);
        self.store.insert(&item).await?;
        info!(
            event_name = "sync_queue.item.enqueued",
            correlation_id = %item.correlation_id,
            deal_id = %item.deal_id,
            sync_item_id = %item.id,
            next_attempt_at = %item.next_attempt_at,
            error = %error,
            "write intent queued for retry"
        );
        Ok(item)
    }

    /// Writes the intent, capturing transient failures as a queue item.
    pub async fn write_or_enqueue(
        &self,
        crm: &dyn CrmGateway,
        intent: &WriteIntent,
        follow_up: Option<DispatchRequest>,
        correlation_id: &str,
        now: DateTime<Utc>,
    ) -> Result<WriteOutcome, StoreError> {
        if intent.is_empty() {
            return Ok(WriteOutcome::Unchanged);
        }

        let error = match crm.write(intent).await {
            Ok(()) => return Ok(WriteOutcome::Applied),
            Err(error) => error,
        };
        let message = error.message().to_string();
        let classified = ReconcileError::from(error);
        if classified.is_retryable() {
            let item =
                self.enqueue(intent.clone(), follow_up, &message, correlation_id, now).await?;
            return Ok(WriteOutcome::Queued(item.id));
        }

        warn!(
            event_name = "crm.write.rejected",
            correlation_id = %correlation_id,
            deal_id = %intent.target_deal_id,
            reason = %intent.reason,
            error_class = classified.class(),
            error = %message,
            "crm rejected write intent"
        );
        Ok(WriteOutcome::Rejected(message))
    }

    /// Claims a due item. `None` means it is in flight elsewhere, not yet due, or finished.
    pub async fn claim(
        &self,
        id: &SyncItemId,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<SyncQueueItem>, SyncQueueError> {
        let item =
            self.store.find(id).await?.ok_or_else(|| SyncQueueError::NotFound(id.clone()))?;
        if !self.engine.is_due(&item, now) {
            return Ok(None);
        }
        Ok(self.store.try_claim(id, worker_id, now, self.engine.stale_before(now)).await?)
    }

    pub async fn complete(
        &self,
        item: SyncQueueItem,
        outcome: AttemptOutcome,
        now: DateTime<Utc>,
    ) -> Result<SyncQueueItem, SyncQueueError> {
        let claimed_version = item.state_version;
        let item = self.engine.record_success(item, outcome, now)?;
        self.store.save(&item, claimed_version).await?;
        info!(
            event_name = "sync_queue.item.completed",
            correlation_id = %item.correlation_id,
            deal_id = %item.deal_id,
            sync_item_id = %item.id,
            attempts = item.attempts,
            "sync item completed"
        );
        Ok(item)
    }

    pub async fn fail(
        &self,
        item: SyncQueueItem,
        error: &WriteError,
        now: DateTime<Utc>,
    ) -> Result<SyncQueueItem, SyncQueueError> {
        let claimed_version = item.state_version;
        let item = self.engine.record_failure(item, error, now)?;
        self.store.save(&item, claimed_version).await?;
        if item.status == SyncItemStatus::FailedManualReview {
            warn!(
                event_name = "sync_queue.item.escalated",
                correlation_id = %item.correlation_id,
                deal_id = %item.deal_id,
                sync_item_id = %item.id,
                attempts = item.attempts,
                error = %error,
                "sync item moved to manual review"
            );
        } else {
            info!(
                event_name = "sync_queue.item.rescheduled",
                correlation_id = %item.correlation_id,
                deal_id = %item.deal_id,
                sync_item_id = %item.id,
                attempts = item.attempts,
                next_attempt_at = %item.next_attempt_at,
                error = %error,
                "sync item rescheduled"
            );
        }
        Ok(item)
    }

    pub async fn find(&self, id: &SyncItemId) -> Result<Option<SyncQueueItem>, StoreError> {
        self.store.find(id).await
    }

    pub async fn due(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<SyncQueueItem>, StoreError> {
        self.store.due(now, limit).await
    }

    pub async fn stats(&self) -> Result<SyncQueueStats, StoreError> {
        self.store.stats().await
    }

    pub async fn list(&self, filter: &SyncQueueFilter) -> Result<Vec<SyncQueueItem>, StoreError> {
        self.store.list(filter).await
    }

    pub async fn oldest_failed(&self) -> Result<Option<SyncQueueItem>, StoreError> {
        self.store.oldest_failed().await
    }

    pub async fn prune(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let removed = self.store.prune_completed(older_than).await?;
        info!(
            event_name = "sync_queue.pruned",
            removed,
            older_than = %older_than,
            "completed sync items pruned"
        );
        Ok(removed)
    }
}
