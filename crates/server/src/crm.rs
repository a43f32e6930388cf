//! HTTP adapter for the CRM deal property API.
//!
//! Deals are read and patched as flat property maps:
//! - `GET   {base}/crm/v3/objects/deals/{id}?properties=...`
//! - `PATCH {base}/crm/v3/objects/deals/{id}` with `{"properties": {...}}`
//! - `POST  {base}/crm/v3/objects/deals/search` for lookups by secondary key
//!
//! Throttling, server errors and transport failures are transient; any other
//! rejection is permanent.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use dealsync_core::config::CrmConfig;
use dealsync_core::domain::deal::{property, Deal, DealId, PropertyMap};
use dealsync_core::domain::event::CorrelationKey;
use dealsync_core::domain::intent::WriteIntent;
use dealsync_core::errors::WriteError;
use dealsync_core::ports::CrmGateway;
use reqwest::{Client, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum CrmClientError {
    #[error("crm setting `{0}` is required for http mode")]
    MissingSetting(&'static str),
    #[error("failed to build crm http client: {0}")]
    Client(#[from] reqwest::Error),
}

pub struct HttpCrmClient {
    client: Client,
    base_url: String,
    access_token: SecretString,
    envelope_document_types: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct DealObject {
    id: String,
    #[serde(default)]
    properties: BTreeMap<String, Option<String>>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<DealObject>,
}

impl HttpCrmClient {
    pub fn new(
        base_url: impl Into<String>,
        access_token: SecretString,
        timeout: Duration,
        envelope_document_types: Vec<String>,
    ) -> Result<Self, CrmClientError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            access_token,
            envelope_document_types,
        })
    }

    pub fn from_config(config: &CrmConfig, document_types: &[String]) -> Result<Self, CrmClientError> {
        let base_url = config.base_url.clone().ok_or(CrmClientError::MissingSetting("crm.base_url"))?;
        let access_token =
            config.access_token.clone().ok_or(CrmClientError::MissingSetting("crm.access_token"))?;
        Self::new(
            base_url,
            access_token,
            Duration::from_secs(config.timeout_secs),
            document_types.to_vec(),
        )
    }

    fn deal_url(&self, deal_id: &DealId) -> String {
        format!("{}/crm/v3/objects/deals/{}", self.base_url, deal_id)
    }

    fn requested_properties(&self) -> Vec<String> {
        let mut properties: Vec<String> = [
            property::STAGE,
            property::PAYMENT_STATUS,
            property::PAYMENT_METHOD,
            property::SETTLEMENT_REFERENCE_ID,
            property::PRACTICE_MATTER_ID,
            property::SYNC_STATUS,
            property::SYNC_ERROR,
            property::LAST_SYNCED_AT,
            property::PAYMENT_AMOUNT,
            property::PROCESSOR_FEE,
            property::NET_AMOUNT,
            property::PAYMENT_FAILURE_REASON,
            property::PAYER_FIRST_NAME,
            property::PAYER_LAST_NAME,
            property::UPDATED_AT,
        ]
        .iter()
        .map(|name| name.to_string())
        .collect();
        properties.extend(self.envelope_properties());
        properties
    }

    fn envelope_properties(&self) -> impl Iterator<Item = String> + '_ {
        self.envelope_document_types
            .iter()
            .map(|document_type| format!("{}{document_type}", property::ENVELOPE_ID_PREFIX))
    }

    /// One filter group per property; the CRM ORs groups together.
    fn search_filters(&self, key: &CorrelationKey) -> Option<(Vec<String>, String)> {
        match key {
            CorrelationKey::Deal(_) => None,
            CorrelationKey::SettlementReference(reference) => {
                Some((vec![property::SETTLEMENT_REFERENCE_ID.to_string()], reference.clone()))
            }
            CorrelationKey::PracticeMatter(matter_id) => {
                Some((vec![property::PRACTICE_MATTER_ID.to_string()], matter_id.clone()))
            }
            CorrelationKey::Envelope(envelope_id) => {
                Some((self.envelope_properties().collect(), envelope_id.clone()))
            }
        }
    }

    async fn search(&self, key: &CorrelationKey) -> Result<Option<Deal>, WriteError> {
        let Some((property_names, value)) = self.search_filters(key) else {
            return Ok(None);
        };
        if property_names.is_empty() {
            return Ok(None);
        }

        let filter_groups: Vec<Value> = property_names
            .iter()
            .map(|name| {
                json!({ "filters": [{ "propertyName": name, "operator": "EQ", "value": value }] })
            })
            .collect();
        let body = json!({
            "filterGroups": filter_groups,
            "properties": self.requested_properties(),
            "limit": 1,
        });

        let response = self
            .client
            .post(format!("{}/crm/v3/objects/deals/search", self.base_url))
            .bearer_auth(self.access_token.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        let response = ensure_success(response, "search").await?;
        let found: SearchResponse = response
            .json()
            .await
            .map_err(|error| WriteError::Permanent(format!("crm search response: {error}")))?;

        found.results.into_iter().next().map(into_deal).transpose()
    }
}

#[async_trait::async_trait]
impl CrmGateway for HttpCrmClient {
    async fn fetch_deal(&self, deal_id: &DealId) -> Result<Option<Deal>, WriteError> {
        let response = self
            .client
            .get(self.deal_url(deal_id))
            .bearer_auth(self.access_token.expose_secret())
            .query(&[("properties", self.requested_properties().join(","))])
            .send()
            .await
            .map_err(transport_error)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = ensure_success(response, "fetch").await?;
        let object: DealObject = response
            .json()
            .await
            .map_err(|error| WriteError::Permanent(format!("crm deal response: {error}")))?;

        into_deal(object).map(Some)
    }

    async fn find_deal(&self, key: &CorrelationKey) -> Result<Option<Deal>, WriteError> {
        match key {
            CorrelationKey::Deal(deal_id) => self.fetch_deal(deal_id).await,
            other => self.search(other).await,
        }
    }

    async fn write(&self, intent: &WriteIntent) -> Result<(), WriteError> {
        let properties = intent.properties();
        debug!(
            event_name = "crm.write.request",
            deal_id = %intent.target_deal_id,
            reason = %intent.reason,
            property_count = properties.len(),
            "patching crm deal"
        );

        let response = self
            .client
            .patch(self.deal_url(&intent.target_deal_id))
            .bearer_auth(self.access_token.expose_secret())
            .json(&json!({ "properties": properties }))
            .send()
            .await
            .map_err(transport_error)?;

        ensure_success(response, "write").await.map(|_| ())
    }
}

fn into_deal(object: DealObject) -> Result<Deal, WriteError> {
    let properties: PropertyMap = object
        .properties
        .into_iter()
        .filter_map(|(key, value)| value.map(|value| (key, value)))
        .collect();
    Deal::from_properties(DealId(object.id), &properties, Utc::now())
        .map_err(|error| WriteError::Permanent(error.to_string()))
}

fn transport_error(error: reqwest::Error) -> WriteError {
    if error.is_builder() {
        WriteError::Permanent(format!("crm request could not be built: {error}"))
    } else {
        WriteError::Transient(format!("crm request failed: {error}"))
    }
}

async fn ensure_success(response: Response, operation: &str) -> Result<Response, WriteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = format!("crm {operation} returned {status}: {}", body.trim());
    warn!(
        event_name = "crm.http.error",
        operation,
        status = status.as_u16(),
        "crm request rejected"
    );
    Err(classify_status(status, message))
}

fn classify_status(status: StatusCode, message: String) -> WriteError {
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        WriteError::Transient(message)
    } else {
        WriteError::Permanent(message)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use axum::{
        extract::{Path, State},
        http::StatusCode,
        routing::{get, post},
        Json, Router,
    };
    use dealsync_core::domain::deal::{DealId, DealStage, PaymentStatus};
    use dealsync_core::domain::event::CorrelationKey;
    use dealsync_core::domain::intent::{DealPatch, WriteIntent};
    use dealsync_core::errors::WriteError;
    use dealsync_core::ports::CrmGateway;
    use secrecy::SecretString;
    use serde_json::{json, Value};

    use super::{classify_status, HttpCrmClient};

    #[derive(Clone, Default)]
    struct FakeCrm {
        patches: Arc<Mutex<Vec<Value>>>,
        searches: Arc<Mutex<Vec<Value>>>,
    }

    async fn get_deal(Path(id): Path<String>) -> (StatusCode, Json<Value>) {
        match id.as_str() {
            "D-1" => (
                StatusCode::OK,
                Json(json!({
                    "id": "D-1",
                    "properties": {
                        "dealstage": "documents_sent",
                        "payment_status": "pending",
                        "settlement_reference_id": "pi_1",
                        "envelope_id__engagement": "env-1",
                        "payer_first_name": null
                    }
                })),
            ),
            "D-busy" => (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"message": "busy"}))),
            _ => (StatusCode::NOT_FOUND, Json(json!({"message": "not found"}))),
        }
    }

    async fn patch_deal(
        Path(id): Path<String>,
        State(fake): State<FakeCrm>,
        Json(body): Json<Value>,
    ) -> (StatusCode, Json<Value>) {
        if id == "D-throttled" {
            return (StatusCode::TOO_MANY_REQUESTS, Json(json!({"message": "slow down"})));
        }
        if id == "D-invalid" {
            return (StatusCode::BAD_REQUEST, Json(json!({"message": "bad property"})));
        }
        fake.patches.lock().expect("patches").push(body);
        (StatusCode::OK, Json(json!({"id": id})))
    }

    async fn search(State(fake): State<FakeCrm>, Json(body): Json<Value>) -> Json<Value> {
        fake.searches.lock().expect("searches").push(body);
        Json(json!({
            "results": [{
                "id": "D-7",
                "properties": { "dealstage": "funds_requested", "practice_matter_id": "M-7" }
            }]
        }))
    }

    async fn spawn_fake(fake: FakeCrm) -> String {
        let router = Router::new()
            .route("/crm/v3/objects/deals/search", post(search))
            .route("/crm/v3/objects/deals/{id}", get(get_deal).patch(patch_deal))
            .with_state(fake);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("address");
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("serve");
        });
        format!("http://{address}")
    }

    fn client(base_url: String) -> HttpCrmClient {
        HttpCrmClient::new(
            base_url,
            SecretString::from("token".to_string()),
            Duration::from_secs(5),
            vec!["engagement".to_string(), "final_agreement".to_string()],
        )
        .expect("client")
    }

    #[tokio::test]
    async fn fetch_maps_properties_and_skips_nulls() {
        let crm = client(spawn_fake(FakeCrm::default()).await);

        let deal = crm.fetch_deal(&DealId("D-1".into())).await.expect("fetch").expect("deal");

        assert_eq!(deal.stage, DealStage::DocumentsSent);
        assert_eq!(deal.payment_status, PaymentStatus::Pending);
        assert_eq!(deal.envelope_id("engagement"), Some("env-1"));
        assert_eq!(deal.payer_first_name, None);
        assert_eq!(crm.fetch_deal(&DealId("D-404".into())).await, Ok(None));
    }

    #[tokio::test]
    async fn server_errors_are_transient() {
        let crm = client(spawn_fake(FakeCrm::default()).await);

        let error = crm.fetch_deal(&DealId("D-busy".into())).await.expect_err("busy");

        assert!(error.is_transient());
    }

    #[tokio::test]
    async fn write_patches_flat_properties() {
        let fake = FakeCrm::default();
        let crm = client(spawn_fake(fake.clone()).await);
        let intent = WriteIntent::new(
            DealId("D-1".into()),
            DealPatch { payment_status: Some(PaymentStatus::Paid), ..DealPatch::default() },
            "settlement",
        );

        crm.write(&intent).await.expect("write");

        let patches = fake.patches.lock().expect("patches").clone();
        assert_eq!(patches, vec![json!({"properties": {"payment_status": "paid"}})]);
    }

    #[tokio::test]
    async fn write_failures_are_classified() {
        let crm = client(spawn_fake(FakeCrm::default()).await);
        let patch = DealPatch { payment_status: Some(PaymentStatus::Paid), ..DealPatch::default() };

        let throttled = crm
            .write(&WriteIntent::new(DealId("D-throttled".into()), patch.clone(), "settlement"))
            .await
            .expect_err("throttled");
        let invalid = crm
            .write(&WriteIntent::new(DealId("D-invalid".into()), patch, "settlement"))
            .await
            .expect_err("invalid");

        assert!(matches!(throttled, WriteError::Transient(_)));
        assert!(matches!(invalid, WriteError::Permanent(_)));
    }

    #[tokio::test]
    async fn envelope_lookup_searches_each_document_type() {
        let fake = FakeCrm::default();
        let crm = client(spawn_fake(fake.clone()).await);

        let deal = crm
            .find_deal(&CorrelationKey::Envelope("env-9".into()))
            .await
            .expect("search")
            .expect("deal");

        assert_eq!(deal.id, DealId("D-7".into()));
        let searches = fake.searches.lock().expect("searches").clone();
        let groups = searches[0]["filterGroups"].as_array().expect("groups").len();
        assert_eq!(groups, 2);
        assert_eq!(searches[0]["filterGroups"][0]["filters"][0]["value"], "env-9");
    }

    #[tokio::test]
    async fn unreachable_crm_is_transient() {
        let crm = client("http://127.0.0.1:9".to_string());

        let error = crm.fetch_deal(&DealId("D-1".into())).await.expect_err("unreachable");

        assert!(error.is_transient());
    }

    #[test]
    fn status_classification() {
        assert!(classify_status(StatusCode::BAD_GATEWAY, String::new()).is_transient());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, String::new()).is_transient());
        assert!(!classify_status(StatusCode::UNPROCESSABLE_ENTITY, String::new()).is_transient());
        assert!(!classify_status(StatusCode::UNAUTHORIZED, String::new()).is_transient());
    }
}
