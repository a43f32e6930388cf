use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use dealsync_core::SyncQueue;
use dealsync_db::DbPool;
use serde::Serialize;

#[derive(Clone)]
pub struct HealthState {
    db_pool: DbPool,
    queue: Arc<SyncQueue>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: HealthCheck,
    pub database: HealthCheck,
    pub sync_queue: HealthCheck,
    pub checked_at: String,
}

pub fn router(db_pool: DbPool, queue: Arc<SyncQueue>) -> Router {
    Router::new().route("/health", get(health)).with_state(HealthState { db_pool, queue })
}

/// Readiness follows the database alone. Items awaiting manual review show as `attention`.
pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let database = database_check(&state.db_pool).await;
    let ready = database.status == "ready";
    let sync_queue = sync_queue_check(&state.queue).await;

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        service: HealthCheck {
            status: "ready",
            detail: "dealsync-server accepting webhooks".to_string(),
        },
        database,
        sync_queue,
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

async fn database_check(pool: &DbPool) -> HealthCheck {
    match dealsync_db::ping(pool).await {
        Ok(()) => HealthCheck { status: "ready", detail: "database query succeeded".to_string() },
        Err(error) => {
            HealthCheck { status: "degraded", detail: format!("database query failed: {error}") }
        }
    }
}

async fn sync_queue_check(queue: &SyncQueue) -> HealthCheck {
    match queue.stats().await {
        Ok(stats) => {
            let pending = stats.queued + stats.scheduled;
            let detail = format!(
                "{pending} pending, {} awaiting manual review",
                stats.failed_manual_review
            );
            let status = if stats.failed_manual_review > 0 { "attention" } else { "ready" };
            HealthCheck { status, detail }
        }
        Err(error) => {
            HealthCheck { status: "degraded", detail: format!("sync queue unreadable: {error}") }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{extract::State, http::StatusCode, Json};
    use chrono::Utc;
    use dealsync_core::domain::intent::{DealPatch, WriteIntent};
    use dealsync_core::memory::InMemorySyncQueueStore;
    use dealsync_core::{DealId, SyncItemStatus, SyncQueue, SyncQueueStore, SyncRetryEngine};
    use dealsync_db::connect_with_settings;

    use crate::health::{health, HealthState};

    fn queue_over(store: Arc<InMemorySyncQueueStore>) -> Arc<SyncQueue> {
        Arc::new(SyncQueue::new(SyncRetryEngine::default(), store))
    }

    #[tokio::test]
    async fn health_returns_ready_when_database_is_reachable() {
        let pool = connect_with_settings("sqlite::memory:", 1, 5).await.expect("pool should connect");
        let queue = queue_over(Arc::new(InMemorySyncQueueStore::default()));

        let (status, Json(payload)) =
            health(State(HealthState { db_pool: pool.clone(), queue })).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload.status, "ready");
        assert_eq!(payload.database.status, "ready");
        assert_eq!(payload.sync_queue.status, "ready");
        assert_eq!(payload.sync_queue.detail, "0 pending, 0 awaiting manual review");

        pool.close().await;
    }

    #[tokio::test]
    async fn health_returns_service_unavailable_when_database_is_closed() {
        let pool = connect_with_settings("sqlite::memory:", 1, 5).await.expect("pool should connect");
        pool.close().await;
        let queue = queue_over(Arc::new(InMemorySyncQueueStore::default()));

        let (status, Json(payload)) = health(State(HealthState { db_pool: pool, queue })).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(payload.status, "degraded");
        assert_eq!(payload.database.status, "degraded");
        assert!(payload.database.detail.starts_with("database query failed"));
        assert_eq!(payload.service.status, "ready");
    }

    #[tokio::test]
    async fn manual_review_backlog_needs_attention_without_failing_readiness() {
        let pool = connect_with_settings("sqlite::memory:", 1, 5).await.expect("pool should connect");
        let store = Arc::new(InMemorySyncQueueStore::default());
        let intent = WriteIntent::new(
            DealId("D-1".into()),
            DealPatch { sync_error: Some("crm timeout".into()), ..DealPatch::default() },
            "receipt failed",
        );
        let mut item = SyncRetryEngine::default().create_item(intent, None, "503", "evt-1", Utc::now());
        item.status = SyncItemStatus::FailedManualReview;
        store.insert(&item).await.expect("insert");

        let (status, Json(payload)) =
            health(State(HealthState { db_pool: pool.clone(), queue: queue_over(store) })).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload.status, "ready");
        assert_eq!(payload.sync_queue.status, "attention");
        assert_eq!(payload.sync_queue.detail, "0 pending, 1 awaiting manual review");

        pool.close().await;
    }
}
