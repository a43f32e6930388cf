//! Webhook receivers. Every authenticated delivery is acknowledged with 200,
//! including ones that fail to parse or reconcile, so upstream systems do not
//! redeliver poison payloads. Only authentication failures are refused.

use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    routing::post,
    Json, Router,
};
use chrono::Utc;
use dealsync_core::{IngestOutcome, InboundWebhook, ReconcileError, WebhookSource};
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::bootstrap::AppState;
use crate::error::ApiError;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Acknowledgement {
    pub received: bool,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/webhooks/payments", post(payments))
        .route("/webhooks/esign", post(esign))
        .route("/webhooks/practice", post(practice))
        .route("/webhooks/crm", post(crm))
        .with_state(state)
}

async fn payments(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Acknowledgement>, ApiError> {
    receive(&state, WebhookSource::Payments, &headers, body).await
}

async fn esign(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Acknowledgement>, ApiError> {
    receive(&state, WebhookSource::ESign, &headers, body).await
}

async fn practice(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Acknowledgement>, ApiError> {
    receive(&state, WebhookSource::Practice, &headers, body).await
}

async fn crm(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Acknowledgement>, ApiError> {
    receive(&state, WebhookSource::Crm, &headers, body).await
}

pub async fn receive(
    state: &AppState,
    source: WebhookSource,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Json<Acknowledgement>, ApiError> {
    let delivery_id = format!("DLV-{}", Uuid::new_v4().simple());
    let webhook = InboundWebhook {
        source,
        credential: headers
            .get(source.credential_header())
            .and_then(|value| value.to_str().ok())
            .map(str::to_string),
        body: body.to_vec(),
        received_at: Utc::now(),
    };

    let event = match state.gateway.ingest(&webhook) {
        Ok(IngestOutcome::Event(event)) => event,
        Ok(IngestOutcome::Ignored(reason)) => {
            info!(
                event_name = "webhook.delivery.ignored",
                correlation_id = %delivery_id,
                source = source.as_str(),
                reason = %reason,
                "webhook acknowledged without processing"
            );
            return Ok(acknowledged());
        }
        Err(ReconcileError::Authentication(message)) => {
            return Err(ApiError::unauthorized(message, delivery_id));
        }
        Err(error) => {
            warn!(
                event_name = "webhook.delivery.rejected",
                correlation_id = %delivery_id,
                source = source.as_str(),
                error = %error,
                "webhook acknowledged but could not be normalized"
            );
            return Ok(acknowledged());
        }
    };

    match state.pipeline.process(&event).await {
        Ok(report) => {
            info!(
                event_name = "webhook.delivery.processed",
                correlation_id = %event.event_id,
                source = source.as_str(),
                event_kind = %event.kind,
                deals = report.deals.len(),
                "webhook reconciled"
            );
        }
        Err(error) => {
            error!(
                event_name = "webhook.delivery.failed",
                correlation_id = %event.event_id,
                source = source.as_str(),
                event_kind = %event.kind,
                retryable = error.is_retryable(),
                error = %error,
                "webhook acknowledged but reconciliation failed"
            );
        }
    }

    Ok(acknowledged())
}

fn acknowledged() -> Json<Acknowledgement> {
    Json(Acknowledgement { received: true })
}
