use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::domain::deal::DealId;

/// Serializes work per deal. Webhook deliveries and queue retries for the same deal take the
/// same lock; different deals proceed in parallel. Idle entries are dropped on release.
#[derive(Clone, Default)]
pub struct DealLocks {
    inner: Arc<Mutex<HashMap<DealId, Arc<AsyncMutex<()>>>>>,
}

pub struct DealLockGuard {
    deal_id: DealId,
    lock: Arc<AsyncMutex<()>>,
    registry: Arc<Mutex<HashMap<DealId, Arc<AsyncMutex<()>>>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl DealLocks {
    pub async fn acquire(&self, deal_id: &DealId) -> DealLockGuard {
        let lock = {
            let mut locks = match self.inner.lock() {
                Ok(locks) => locks,
                Err(poisoned) => poisoned.into_inner(),
            };
            locks.entry(deal_id.clone()).or_default().clone()
        };
        let guard = lock.clone().lock_owned().await;

        DealLockGuard {
            deal_id: deal_id.clone(),
            lock,
            registry: self.inner.clone(),
            guard: Some(guard),
        }
    }

    /// Number of deals with a live lock entry.
    pub fn tracked(&self) -> usize {
        match self.inner.lock() {
            Ok(locks) => locks.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

impl Drop for DealLockGuard {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = match self.registry.lock() {
            Ok(locks) => locks,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Registry entry plus our own handle: nobody else is waiting.
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.deal_id);
        }
    }
}
