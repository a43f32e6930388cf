//! HTTP client for the receipt automation service.

use std::time::Duration;

use dealsync_core::domain::dispatch::{ReceiptRequest, ReceiptResult};
use dealsync_core::errors::AutomationError;
use dealsync_core::ports::ReceiptAutomationExecutor;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::info;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReceiptBody<'a> {
    deal_id: &'a str,
    matter_id: &'a str,
    amount: Decimal,
    payer_name: Option<&'a str>,
    date: &'a str,
    reason: &'a str,
    description: &'a str,
    rehearsal_mode: bool,
}

impl<'a> From<&'a ReceiptRequest> for ReceiptBody<'a> {
    fn from(request: &'a ReceiptRequest) -> Self {
        Self {
            deal_id: &request.deal_id.0,
            matter_id: &request.matter_id,
            amount: request.amount,
            payer_name: request.payer_name.as_deref(),
            date: &request.date,
            reason: &request.reason,
            description: &request.description,
            rehearsal_mode: request.rehearsal_mode,
        }
    }
}

pub struct HttpReceiptExecutor {
    client: Client,
    endpoint: String,
}

impl HttpReceiptExecutor {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, endpoint: format!("{}/receipts", base_url.trim_end_matches('/')) })
    }
}

#[async_trait::async_trait]
impl ReceiptAutomationExecutor for HttpReceiptExecutor {
    async fn execute(&self, request: &ReceiptRequest) -> Result<ReceiptResult, AutomationError> {
        info!(
            event_name = "automation.receipt.request",
            deal_id = %request.deal_id,
            matter_id = %request.matter_id,
            rehearsal = request.rehearsal_mode,
            "calling receipt automation"
        );

        let response = self
            .client
            .post(&self.endpoint)
            .json(&ReceiptBody::from(request))
            .send()
            .await
            .map_err(|error| AutomationError::Unavailable(error.to_string()))?;

        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(AutomationError::Unavailable(format!("receipt automation returned {status}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AutomationError::Rejected(format!("{status}: {}", body.trim())));
        }

        response
            .json::<ReceiptResult>()
            .await
            .map_err(|error| AutomationError::Rejected(format!("unreadable response: {error}")))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
    use dealsync_core::domain::deal::DealId;
    use dealsync_core::domain::dispatch::ReceiptRequest;
    use dealsync_core::errors::AutomationError;
    use dealsync_core::ports::ReceiptAutomationExecutor;
    use rust_decimal::Decimal;
    use serde_json::{json, Value};

    use super::HttpReceiptExecutor;

    type Received = Arc<Mutex<Vec<Value>>>;

    async fn receipts(
        State(received): State<Received>,
        Json(body): Json<Value>,
    ) -> (StatusCode, Json<Value>) {
        let matter = body["matterId"].as_str().unwrap_or_default().to_string();
        received.lock().expect("received").push(body);
        match matter.as_str() {
            "M-down" => (StatusCode::BAD_GATEWAY, Json(json!({}))),
            "M-bad" => (StatusCode::UNPROCESSABLE_ENTITY, Json(json!({"error": "unknown matter"}))),
            _ => (StatusCode::OK, Json(json!({"success": true, "message": "receipt rehearsed"}))),
        }
    }

    async fn spawn_fake(received: Received) -> String {
        let router = Router::new().route("/receipts", post(receipts)).with_state(received);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("address");
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("serve");
        });
        format!("http://{address}/")
    }

    fn request(matter_id: &str) -> ReceiptRequest {
        ReceiptRequest {
            deal_id: DealId("D-1".into()),
            matter_id: matter_id.into(),
            amount: Decimal::new(950_000, 2),
            payer_name: Some("Nguyen, Ana".into()),
            date: "01/03/2026".into(),
            reason: "Payment for legal services".into(),
            description: "Settlement pi_1".into(),
            rehearsal_mode: true,
        }
    }

    #[tokio::test]
    async fn sends_camel_case_body_and_reads_result() {
        let received = Received::default();
        let executor = HttpReceiptExecutor::new(&spawn_fake(received.clone()).await, Duration::from_secs(5))
            .expect("client");

        let result = executor.execute(&request("M-1")).await.expect("execute");

        assert!(result.success);
        assert_eq!(result.message, "receipt rehearsed");
        let body = received.lock().expect("received")[0].clone();
        assert_eq!(body["dealId"], "D-1");
        assert_eq!(body["payerName"], "Nguyen, Ana");
        assert_eq!(body["rehearsalMode"], true);
    }

    #[tokio::test]
    async fn maps_failures_by_status() {
        let executor =
            HttpReceiptExecutor::new(&spawn_fake(Received::default()).await, Duration::from_secs(5))
                .expect("client");

        let down = executor.execute(&request("M-down")).await.expect_err("down");
        let bad = executor.execute(&request("M-bad")).await.expect_err("bad");

        assert!(matches!(down, AutomationError::Unavailable(_)));
        assert!(matches!(bad, AutomationError::Rejected(_)));
    }
}
