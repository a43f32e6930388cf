//! Seams between the reconciliation core and the systems it talks to.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::deal::{Deal, DealId};
use crate::domain::dispatch::{
    DispatchKey, DispatchRecord, DispatchState, ReceiptRequest, ReceiptResult,
};
use crate::domain::event::CorrelationKey;
use crate::domain::intent::WriteIntent;
use crate::domain::sync::{SyncItemId, SyncQueueFilter, SyncQueueItem, SyncQueueStats};
use crate::errors::{AutomationError, StoreError, WriteError};

/// CRM write adapter. The CRM owns the deal; the engine reads it and sends property patches.
#[async_trait]
pub trait CrmGateway: Send + Sync {
    async fn fetch_deal(&self, deal_id: &DealId) -> Result<Option<Deal>, WriteError>;

    /// Resolves a deal from any correlation key it carries.
    async fn find_deal(&self, key: &CorrelationKey) -> Result<Option<Deal>, WriteError>;

    async fn write(&self, intent: &WriteIntent) -> Result<(), WriteError>;
}

#[async_trait]
pub trait SyncQueueStore: Send + Sync {
    async fn insert(&self, item: &SyncQueueItem) -> Result<(), StoreError>;

    async fn find(&self, id: &SyncItemId) -> Result<Option<SyncQueueItem>, StoreError>;

    /// Pending items whose next attempt is due, oldest first.
    async fn due(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<SyncQueueItem>, StoreError>;

    /// Claims a pending item for `worker_id` when it is unclaimed or its claim is older than
    /// `stale_before`. Returns `None` when another worker holds it.
    async fn try_claim(
        &self,
        id: &SyncItemId,
        worker_id: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<SyncQueueItem>, StoreError>;

    /// Writes back an item claimed at `claimed_version`. Fails with [`StoreError::Conflict`]
    /// when the stored item has moved on, so a late worker cannot clobber a takeover.
    async fn save(&self, item: &SyncQueueItem, claimed_version: u32) -> Result<(), StoreError>;

    async fn list(&self, filter: &SyncQueueFilter) -> Result<Vec<SyncQueueItem>, StoreError>;

    async fn stats(&self) -> Result<SyncQueueStats, StoreError>;

    async fn oldest_failed(&self) -> Result<Option<SyncQueueItem>, StoreError>;

    /// Deletes completed items last updated before `older_than`.
    async fn prune_completed(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait DispatchLedger: Send + Sync {
    /// Inserts the record if no row exists for its key. Returns `false` when one already does.
    async fn reserve(&self, record: &DispatchRecord) -> Result<bool, StoreError>;

    async fn finish(
        &self,
        key: &DispatchKey,
        state: DispatchState,
        message: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn find(&self, key: &DispatchKey) -> Result<Option<DispatchRecord>, StoreError>;
}

#[async_trait]
pub trait ReceiptAutomationExecutor: Send + Sync {
    async fn execute(&self, request: &ReceiptRequest) -> Result<ReceiptResult, AutomationError>;
}

/// Executor used when automation is switched off. Never reached through the dispatcher,
/// which skips before calling it, but keeps wiring uniform.
pub struct DisabledReceiptExecutor;

#[async_trait]
impl ReceiptAutomationExecutor for DisabledReceiptExecutor {
    async fn execute(&self, _request: &ReceiptRequest) -> Result<ReceiptResult, AutomationError> {
        Err(AutomationError::Unavailable("receipt automation is disabled".to_string()))
    }
}
