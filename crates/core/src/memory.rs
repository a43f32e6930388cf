//! In-memory adapters for every port. Used by tests and by the `local` CRM mode in dev setups.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};

use crate::domain::deal::{Deal, DealId};
use crate::domain::dispatch::{
    DispatchKey, DispatchRecord, DispatchState, ReceiptRequest, ReceiptResult,
};
use crate::domain::event::CorrelationKey;
use crate::domain::intent::WriteIntent;
use crate::domain::sync::{
    SyncItemId, SyncItemStatus, SyncQueueFilter, SyncQueueItem, SyncQueueStats,
};
use crate::errors::{AutomationError, StoreError, WriteError};
use crate::ports::{CrmGateway, DispatchLedger, ReceiptAutomationExecutor, SyncQueueStore};

#[derive(Default)]
pub struct InMemoryCrm {
    deals: RwLock<HashMap<DealId, Deal>>,
    scripted_failures: Mutex<VecDeque<WriteError>>,
    writes: RwLock<Vec<WriteIntent>>,
}

impl InMemoryCrm {
    pub async fn insert(&self, deal: Deal) {
        self.deals.write().await.insert(deal.id.clone(), deal);
    }

    pub async fn deal(&self, deal_id: &DealId) -> Option<Deal> {
        self.deals.read().await.get(deal_id).cloned()
    }

    /// The next writes fail with these errors, in order.
    pub async fn fail_next_writes(&self, errors: impl IntoIterator<Item = WriteError>) {
        self.scripted_failures.lock().await.extend(errors);
    }

    /// Every write that reached the store.
    pub async fn writes(&self) -> Vec<WriteIntent> {
        self.writes.read().await.clone()
    }
}

#[async_trait]
impl CrmGateway for InMemoryCrm {
    async fn fetch_deal(&self, deal_id: &DealId) -> Result<Option<Deal>, WriteError> {
        Ok(self.deal(deal_id).await)
    }

    async fn find_deal(&self, key: &CorrelationKey) -> Result<Option<Deal>, WriteError> {
        let deals = self.deals.read().await;
        let found = match key {
            CorrelationKey::Deal(deal_id) => deals.get(deal_id).cloned(),
            CorrelationKey::SettlementReference(reference) => deals
                .values()
                .find(|deal| deal.settlement_reference_id.as_deref() == Some(reference.as_str()))
                .cloned(),
            CorrelationKey::PracticeMatter(matter_id) => deals
                .values()
                .find(|deal| deal.practice_matter_id.as_deref() == Some(matter_id.as_str()))
                .cloned(),
            CorrelationKey::Envelope(envelope_id) => deals
                .values()
                .find(|deal| deal.envelope_ids.values().any(|id| id == envelope_id))
                .cloned(),
        };
        Ok(found)
    }

    async fn write(&self, intent: &WriteIntent) -> Result<(), WriteError> {
        if let Some(error) = self.scripted_failures.lock().await.pop_front() {
            return Err(error);
        }

        let mut deals = self.deals.write().await;
        let deal = deals.get_mut(&intent.target_deal_id).ok_or_else(|| {
            WriteError::Permanent(format!("deal `{}` does not exist", intent.target_deal_id))
        })?;
        deal.apply_properties(&intent.properties())
            .map_err(|error| WriteError::Permanent(error.to_string()))?;
        deal.updated_at = Utc::now();
        drop(deals);

        self.writes.write().await.push(intent.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemorySyncQueueStore {
    items: RwLock<HashMap<String, SyncQueueItem>>,
}

#[async_trait]
impl SyncQueueStore for InMemorySyncQueueStore {
    async fn insert(&self, item: &SyncQueueItem) -> Result<(), StoreError> {
        self.items.write().await.insert(item.id.0.clone(), item.clone());
        Ok(())
    }

    async fn find(&self, id: &SyncItemId) -> Result<Option<SyncQueueItem>, StoreError> {
        Ok(self.items.read().await.get(&id.0).cloned())
    }

    async fn due(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<SyncQueueItem>, StoreError> {
        let items = self.items.read().await;
        let mut due: Vec<SyncQueueItem> = items
            .values()
            .filter(|item| item.status.is_pending() && item.next_attempt_at <= now)
            .cloned()
            .collect();
        due.sort_by(|a, b| a.next_attempt_at.cmp(&b.next_attempt_at).then(a.id.0.cmp(&b.id.0)));
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn try_claim(
        &self,
        id: &SyncItemId,
        worker_id: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<SyncQueueItem>, StoreError> {
        let mut items = self.items.write().await;
        let Some(item) = items.get_mut(&id.0) else {
            return Ok(None);
        };
        if !item.status.is_pending() || item.next_attempt_at > now {
            return Ok(None);
        }
        let held = item.claimed_by.is_some()
            && item.claimed_at.is_some_and(|claimed_at| claimed_at >= stale_before);
        if held {
            return Ok(None);
        }

        item.claimed_by = Some(worker_id.to_string());
        item.claimed_at = Some(now);
        item.state_version += 1;
        Ok(Some(item.clone()))
    }

    async fn save(&self, item: &SyncQueueItem, claimed_version: u32) -> Result<(), StoreError> {
        let mut items = self.items.write().await;
        let Some(stored) = items.get_mut(&item.id.0) else {
            return Err(StoreError::NotFound(format!("sync item {}", item.id)));
        };
        if stored.state_version != claimed_version {
            return Err(StoreError::Conflict(format!(
                "sync item {} changed since claim version {claimed_version}",
                item.id
            )));
        }
        *stored = item.clone();
        Ok(())
    }

    async fn list(&self, filter: &SyncQueueFilter) -> Result<Vec<SyncQueueItem>, StoreError> {
        let items = self.items.read().await;
        let mut listed: Vec<SyncQueueItem> =
            items.values().filter(|item| filter.matches(item)).cloned().collect();
        listed.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.0.cmp(&b.id.0)));
        if let Some(limit) = filter.limit {
            listed.truncate(limit as usize);
        }
        Ok(listed)
    }

    async fn stats(&self) -> Result<SyncQueueStats, StoreError> {
        let items = self.items.read().await;
        let mut stats = SyncQueueStats::default();
        for item in items.values() {
            stats.record(item.status, 1);
        }
        Ok(stats)
    }

    async fn oldest_failed(&self) -> Result<Option<SyncQueueItem>, StoreError> {
        let items = self.items.read().await;
        Ok(items
            .values()
            .filter(|item| item.status == SyncItemStatus::FailedManualReview)
            .min_by(|a, b| a.created_at.cmp(&b.created_at))
            .cloned())
    }

    async fn prune_completed(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut items = self.items.write().await;
        let before = items.len();
        items.retain(|_, item| {
            !(item.status == SyncItemStatus::Completed && item.updated_at < older_than)
        });
        Ok((before - items.len()) as u64)
    }
}

#[derive(Default)]
pub struct InMemoryDispatchLedger {
    records: RwLock<HashMap<DispatchKey, DispatchRecord>>,
}

impl InMemoryDispatchLedger {
    pub async fn records(&self) -> Vec<DispatchRecord> {
        let mut records: Vec<DispatchRecord> =
            self.records.read().await.values().cloned().collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        records
    }
}

#[async_trait]
impl DispatchLedger for InMemoryDispatchLedger {
    async fn reserve(&self, record: &DispatchRecord) -> Result<bool, StoreError> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.key) {
            return Ok(false);
        }
        records.insert(record.key.clone(), record.clone());
        Ok(true)
    }

    async fn finish(
        &self,
        key: &DispatchKey,
        state: DispatchState,
        message: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(format!("dispatch record {key}")))?;
        record.state = state;
        record.message = message;
        record.updated_at = now;
        Ok(())
    }

    async fn find(&self, key: &DispatchKey) -> Result<Option<DispatchRecord>, StoreError> {
        Ok(self.records.read().await.get(key).cloned())
    }
}

/// Executor that records every request and answers with a scripted response.
pub struct RecordingReceiptExecutor {
    requests: Mutex<Vec<ReceiptRequest>>,
    response: Mutex<Result<ReceiptResult, AutomationError>>,
}

impl Default for RecordingReceiptExecutor {
    fn default() -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            response: Mutex::new(Ok(ReceiptResult {
                success: true,
                message: "receipt form filled".to_string(),
                error: None,
            })),
        }
    }
}

impl RecordingReceiptExecutor {
    pub async fn respond_with(&self, response: Result<ReceiptResult, AutomationError>) {
        *self.response.lock().await = response;
    }

    pub async fn requests(&self) -> Vec<ReceiptRequest> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl ReceiptAutomationExecutor for RecordingReceiptExecutor {
    async fn execute(&self, request: &ReceiptRequest) -> Result<ReceiptResult, AutomationError> {
        self.requests.lock().await.push(request.clone());
        self.response.lock().await.clone()
    }
}
