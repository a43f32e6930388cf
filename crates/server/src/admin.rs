//! Operator API: manual settlement recovery and sync queue inspection.
//! Every route requires `Authorization: Bearer <server.admin_token>`; with no
//! token configured the API refuses all requests.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header::AUTHORIZATION, HeaderMap},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use dealsync_core::domain::event::PropertyConfirmationPayload;
use dealsync_core::ingest::verify_shared_secret;
use dealsync_core::{
    ApplicationError, CanonicalEvent, CorrelationKey, DealId, DealOutcome, DealReport,
    EventKind, EventPayload, PaymentMethod, SourceSystem, SyncItemStatus, SyncQueueFilter,
    SyncQueueItem, SyncQueueStats,
};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::bootstrap::AppState;
use crate::error::ApiError;

const DEFAULT_ITEM_LIMIT: u32 = 100;
const MAX_ITEM_LIMIT: u32 = 500;

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct ReconcileSettlementRequest {
    #[serde(default)]
    pub payment_method: Option<String>,
    #[serde(default)]
    pub reference_id: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ItemsQuery {
    pub status: Option<String>,
    pub deal_id: Option<String>,
    pub limit: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct QueueStatsResponse {
    #[serde(flatten)]
    pub stats: SyncQueueStats,
    pub total: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QueueItemsResponse {
    pub items: Vec<SyncQueueItem>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OldestFailedResponse {
    pub item: Option<SyncQueueItem>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/deals/{deal_id}/reconcile-settlement", post(reconcile_settlement))
        .route("/api/v1/sync-queue/stats", get(queue_stats))
        .route("/api/v1/sync-queue/items", get(queue_items))
        .route("/api/v1/sync-queue/oldest-failed", get(oldest_failed))
        .with_state(state)
}

fn request_id() -> String {
    format!("REQ-{}", Uuid::new_v4().simple())
}

fn authorize(state: &AppState, headers: &HeaderMap, correlation_id: &str) -> Result<(), ApiError> {
    let Some(expected) = state.admin_token.as_ref() else {
        return Err(ApiError::unauthorized("admin api is not configured", correlation_id));
    };
    let provided = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim);

    verify_shared_secret(provided, expected.expose_secret())
        .map_err(|_| ApiError::unauthorized("invalid admin token", correlation_id))
}

/// Replays a settlement confirmation for one deal through the pipeline. Used when
/// a payment was confirmed out of band or its webhook was lost.
pub async fn reconcile_settlement(
    State(state): State<AppState>,
    Path(deal_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<DealReport>, ApiError> {
    let correlation_id = request_id();
    authorize(&state, &headers, &correlation_id)?;

    let request = if body.iter().all(u8::is_ascii_whitespace) {
        ReconcileSettlementRequest::default()
    } else {
        serde_json::from_slice::<ReconcileSettlementRequest>(&body).map_err(|error| {
            ApiError::bad_request(format!("invalid request body: {error}"), &correlation_id)
        })?
    };
    let payment_method = match request.payment_method.as_deref() {
        Some(raw) => Some(PaymentMethod::parse(raw).ok_or_else(|| {
            ApiError::bad_request(format!("unknown payment method `{raw}`"), &correlation_id)
        })?),
        None => None,
    };

    let deal_id = DealId(deal_id);
    let known = state.crm.fetch_deal(&deal_id).await.map_err(|error| {
        ApiError::from_application(ApplicationError::Integration(error.to_string()), &correlation_id)
    })?;
    if known.is_none() {
        return Err(ApiError::from_application(
            ApplicationError::NotFound(format!("deal `{deal_id}`")),
            &correlation_id,
        ));
    }

    let now = Utc::now();
    let event = CanonicalEvent::new(
        Some(correlation_id.clone()),
        EventKind::PropertyStatusConfirmed,
        SourceSystem::Operator,
        CorrelationKey::Deal(deal_id.clone()),
        EventPayload::PropertyConfirmed(PropertyConfirmationPayload {
            deal_id: deal_id.clone(),
            payment_method,
            reference_id: request.reference_id.filter(|value| !value.trim().is_empty()),
            confirmed_at: now,
        }),
        now,
    );

    info!(
        event_name = "admin.settlement.reconcile",
        correlation_id = %correlation_id,
        deal_id = %deal_id,
        "manual settlement reconciliation requested"
    );

    let report = state
        .pipeline
        .process(&event)
        .await
        .map_err(|error| ApiError::from_application(error.into(), &correlation_id))?;
    let deal = report.deals.into_iter().next().ok_or_else(|| {
        ApiError::from_application(
            ApplicationError::NotFound(format!("deal `{deal_id}`")),
            &correlation_id,
        )
    })?;

    match deal.outcome {
        DealOutcome::Untracked => Err(ApiError::from_application(
            ApplicationError::NotFound(format!("deal `{deal_id}`")),
            &correlation_id,
        )),
        DealOutcome::Failed => Err(ApiError::from_application(
            ApplicationError::Integration(deal.detail.unwrap_or_default()),
            &correlation_id,
        )),
        _ => Ok(Json(deal)),
    }
}

pub async fn queue_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<QueueStatsResponse>, ApiError> {
    let correlation_id = request_id();
    authorize(&state, &headers, &correlation_id)?;

    let stats = state
        .queue
        .stats()
        .await
        .map_err(|error| ApiError::from_application(error.into(), &correlation_id))?;
    let total = stats.total();
    Ok(Json(QueueStatsResponse { stats, total }))
}

pub async fn queue_items(
    State(state): State<AppState>,
    Query(query): Query<ItemsQuery>,
    headers: HeaderMap,
) -> Result<Json<QueueItemsResponse>, ApiError> {
    let correlation_id = request_id();
    authorize(&state, &headers, &correlation_id)?;

    let status = match query.status.as_deref() {
        Some(raw) => Some(SyncItemStatus::parse(raw).ok_or_else(|| {
            ApiError::bad_request(format!("unknown sync item status `{raw}`"), &correlation_id)
        })?),
        None => None,
    };
    let filter = SyncQueueFilter {
        status,
        deal_id: query.deal_id.filter(|value| !value.trim().is_empty()).map(DealId),
        limit: Some(query.limit.unwrap_or(DEFAULT_ITEM_LIMIT).clamp(1, MAX_ITEM_LIMIT)),
    };

    let items = state
        .queue
        .list(&filter)
        .await
        .map_err(|error| ApiError::from_application(error.into(), &correlation_id))?;
    Ok(Json(QueueItemsResponse { items }))
}

pub async fn oldest_failed(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<OldestFailedResponse>, ApiError> {
    let correlation_id = request_id();
    authorize(&state, &headers, &correlation_id)?;

    let item = state
        .queue
        .oldest_failed()
        .await
        .map_err(|error| ApiError::from_application(error.into(), &correlation_id))?;
    Ok(Json(OldestFailedResponse { item }))
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{to_bytes, Body, Bytes},
        extract::{Path, Query, State},
        http::{header::AUTHORIZATION, HeaderMap, HeaderValue, Request, StatusCode},
    };
    use chrono::Utc;
    use dealsync_core::errors::WriteError;
    use rust_decimal::Decimal;
    use dealsync_core::{
        Deal, DealId, DealOutcome, DealStage, PaymentMethod, PaymentStatus, SyncItemStatus,
    };
    use serde_json::Value;
    use tower::ServiceExt;

    use super::{queue_items, reconcile_settlement, ItemsQuery};
    use crate::app::{
        router,
        testing::{test_app, ADMIN_TOKEN},
    };

    fn admin_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {ADMIN_TOKEN}")).expect("header"),
        );
        headers
    }

    fn awaiting_funds() -> Deal {
        let mut deal = Deal::new(DealId("D-7".into()), DealStage::FundsRequested, Utc::now());
        deal.payment_status = PaymentStatus::Paid;
        deal.payment_method = Some(PaymentMethod::BankTransfer);
        deal.practice_matter_id = Some("M-7".into());
        deal.payment_amount = Some(Decimal::new(4_400, 0));
        deal
    }

    #[tokio::test]
    async fn manual_recovery_advances_the_deal() {
        let app = test_app().await;
        app.crm.insert(awaiting_funds()).await;

        let report = reconcile_settlement(
            State(app.state.clone()),
            Path("D-7".to_string()),
            admin_headers(),
            Bytes::from_static(br#"{"reference_id": "EFT-42"}"#),
        )
        .await
        .expect("reconciled");

        assert_eq!(report.outcome, DealOutcome::Applied);
        let deal = app.crm.deal(&DealId("D-7".into())).await.expect("deal");
        assert_eq!(deal.stage, DealStage::FundsProvided);
        assert_eq!(deal.settlement_reference_id.as_deref(), Some("EFT-42"));
        let receipts = app.executor.requests().await;
        assert_eq!(receipts.len(), 1);
        assert_eq!(receipts[0].matter_id, "M-7");
    }

    #[tokio::test]
    async fn manual_recovery_for_unknown_deal_is_404() {
        let app = test_app().await;

        let response = router(app.state.clone())
            .oneshot(
                Request::post("/api/v1/deals/D-404/reconcile-settlement")
                    .header(AUTHORIZATION, format!("Bearer {ADMIN_TOKEN}"))
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_payment_method_is_400() {
        let app = test_app().await;
        app.crm.insert(awaiting_funds()).await;

        let error = reconcile_settlement(
            State(app.state.clone()),
            Path("D-7".to_string()),
            admin_headers(),
            Bytes::from_static(br#"{"payment_method": "cheque"}"#),
        )
        .await
        .expect_err("rejected");

        assert_eq!(error.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn admin_routes_require_the_bearer_token() {
        let app = test_app().await;

        for (uri, token) in [
            ("/api/v1/sync-queue/stats", None),
            ("/api/v1/sync-queue/stats", Some("Bearer wrong")),
            ("/api/v1/sync-queue/oldest-failed", Some(ADMIN_TOKEN)),
        ] {
            let mut request = Request::get(uri);
            if let Some(token) = token {
                request = request.header(AUTHORIZATION, token);
            }
            let response = router(app.state.clone())
                .oneshot(request.body(Body::empty()).expect("request"))
                .await
                .expect("response");
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{uri} {token:?}");
        }
    }

    #[tokio::test]
    async fn missing_admin_token_fails_closed() {
        let mut app = test_app().await;
        app.state.admin_token = None;

        let response = router(app.state.clone())
            .oneshot(
                Request::get("/api/v1/sync-queue/stats")
                    .header(AUTHORIZATION, format!("Bearer {ADMIN_TOKEN}"))
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn queue_inspection_reports_items_waiting_for_retry() {
        let app = test_app().await;
        app.crm.insert(awaiting_funds()).await;
        app.crm.fail_next_writes([WriteError::Transient("crm timeout".into())]).await;

        let report = reconcile_settlement(
            State(app.state.clone()),
            Path("D-7".to_string()),
            admin_headers(),
            Bytes::new(),
        )
        .await
        .expect("queued");
        assert_eq!(report.outcome, DealOutcome::QueuedForRetry);

        let response = router(app.state.clone())
            .oneshot(
                Request::get("/api/v1/sync-queue/stats")
                    .header(AUTHORIZATION, format!("Bearer {ADMIN_TOKEN}"))
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let stats: Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(stats["queued"], 1);
        assert_eq!(stats["total"], 1);

        let items = queue_items(
            State(app.state.clone()),
            Query(ItemsQuery {
                status: Some("queued".into()),
                deal_id: Some("D-7".into()),
                limit: None,
            }),
            admin_headers(),
        )
        .await
        .expect("items");
        assert_eq!(items.items.len(), 1);
        assert_eq!(items.items[0].status, SyncItemStatus::Queued);
    }

    #[tokio::test]
    async fn unknown_status_filter_is_400() {
        let app = test_app().await;

        let error = queue_items(
            State(app.state.clone()),
            Query(ItemsQuery { status: Some("stuck".into()), ..ItemsQuery::default() }),
            admin_headers(),
        )
        .await
        .expect_err("rejected");

        assert_eq!(error.status(), StatusCode::BAD_REQUEST);
    }
}
