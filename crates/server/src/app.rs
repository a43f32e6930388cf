use axum::Router;

use crate::bootstrap::AppState;
use crate::{admin, health, webhooks};

pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(health::router(state.db_pool.clone(), state.queue.clone()))
        .merge(webhooks::router(state.clone()))
        .merge(admin::router(state))
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use dealsync_core::dispatch::DispatchSettings;
    use dealsync_core::memory::{
        InMemoryCrm, InMemoryDispatchLedger, InMemorySyncQueueStore, RecordingReceiptExecutor,
    };
    use dealsync_core::reconcile::HandlerSettings;
    use dealsync_core::{
        DealLocks, EventGateway, GatewaySettings, HandlerRegistry, InMemoryAuditSink,
        ReconciliationPipeline, SideEffectDispatcher, SyncQueue, SyncRetryEngine,
        SyncRetryWorker,
    };
    use dealsync_db::connect_with_settings;
    use secrecy::SecretString;

    use crate::bootstrap::AppState;

    pub const PRACTICE_SECRET: &str = "practice-secret";
    pub const ADMIN_TOKEN: &str = "admin-token";

    pub struct TestApp {
        pub state: AppState,
        pub crm: Arc<InMemoryCrm>,
        pub store: Arc<InMemorySyncQueueStore>,
        pub executor: Arc<RecordingReceiptExecutor>,
        pub worker: Arc<SyncRetryWorker>,
    }

    /// Server state over in-memory adapters. Only the practice webhook and the admin API
    /// are configured.
    pub async fn test_app() -> TestApp {
        let db_pool = connect_with_settings("sqlite::memory:", 1, 5).await.expect("pool");
        let crm = Arc::new(InMemoryCrm::default());
        let store = Arc::new(InMemorySyncQueueStore::default());
        let executor = Arc::new(RecordingReceiptExecutor::default());
        let audit = Arc::new(InMemoryAuditSink::default());
        let locks = DealLocks::default();

        let queue = Arc::new(SyncQueue::new(SyncRetryEngine::default(), store.clone()));
        let dispatcher = Arc::new(SideEffectDispatcher::new(
            Arc::new(InMemoryDispatchLedger::default()),
            executor.clone(),
            audit.clone(),
            DispatchSettings::default(),
        ));
        let pipeline = Arc::new(ReconciliationPipeline::new(
            crm.clone(),
            queue.clone(),
            dispatcher.clone(),
            HandlerRegistry::standard(&HandlerSettings::default()),
            locks.clone(),
            audit.clone(),
        ));
        let worker = Arc::new(SyncRetryWorker::new(
            crm.clone(),
            queue.clone(),
            dispatcher,
            locks,
            audit,
            "worker-test".to_string(),
        ));

        let gateway = EventGateway::new(GatewaySettings {
            practice_secret: Some(SecretString::from(PRACTICE_SECRET.to_string())),
            ..GatewaySettings::default()
        });

        let state = AppState {
            db_pool,
            gateway: Arc::new(gateway),
            pipeline,
            queue,
            crm: crm.clone(),
            admin_token: Some(SecretString::from(ADMIN_TOKEN.to_string())),
        };

        TestApp { state, crm, store, executor, worker }
    }
}
