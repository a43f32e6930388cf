//! Event Ingestion Gateway
//!
//! Authenticates a raw webhook delivery and normalizes it into a
//! [`CanonicalEvent`]. The payment processor signs its payloads; the other
//! sources send a shared secret header. A source without a configured secret
//! rejects every delivery.

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::domain::event::CanonicalEvent;
use crate::errors::ReconcileError;

pub mod crm;
pub mod esign;
pub mod payments;
pub mod practice;
pub mod signature;

pub use signature::{sign_payload, verify_shared_secret, verify_signed_payload, SignatureError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookSource {
    Payments,
    ESign,
    Practice,
    Crm,
}

impl WebhookSource {
    pub const ALL: [WebhookSource; 4] = [Self::Payments, Self::ESign, Self::Practice, Self::Crm];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Payments => "payments",
            Self::ESign => "esign",
            Self::Practice => "practice",
            Self::Crm => "crm",
        }
    }

    /// Header carrying the signature or shared secret.
    pub fn credential_header(self) -> &'static str {
        match self {
            Self::Payments => "x-processor-signature",
            Self::ESign => "x-esign-secret",
            Self::Practice => "x-practice-secret",
            Self::Crm => "x-crm-secret",
        }
    }
}

#[derive(Clone, Debug)]
pub struct GatewaySettings {
    pub payments_signing_secret: Option<SecretString>,
    pub signature_tolerance_secs: u64,
    pub esign_secret: Option<SecretString>,
    pub practice_secret: Option<SecretString>,
    pub crm_secret: Option<SecretString>,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            payments_signing_secret: None,
            signature_tolerance_secs: 300,
            esign_secret: None,
            practice_secret: None,
            crm_secret: None,
        }
    }
}

impl GatewaySettings {
    fn secret(&self, source: WebhookSource) -> Option<&str> {
        let secret = match source {
            WebhookSource::Payments => self.payments_signing_secret.as_ref(),
            WebhookSource::ESign => self.esign_secret.as_ref(),
            WebhookSource::Practice => self.practice_secret.as_ref(),
            WebhookSource::Crm => self.crm_secret.as_ref(),
        };
        secret.map(|secret| secret.expose_secret()).filter(|value| !value.trim().is_empty())
    }
}

#[derive(Clone, Debug)]
pub struct InboundWebhook {
    pub source: WebhookSource,
    pub credential: Option<String>,
    pub body: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum IngestOutcome {
    Event(CanonicalEvent),
    /// Authenticated but not something the engine consumes.
    Ignored(String),
}

pub struct EventGateway {
    settings: GatewaySettings,
}

impl EventGateway {
    pub fn new(settings: GatewaySettings) -> Self {
        Self { settings }
    }

    pub fn authenticate(&self, webhook: &InboundWebhook) -> Result<(), ReconcileError> {
        let source = webhook.source;
        let Some(secret) = self.settings.secret(source) else {
            warn!(
                event_name = "ingest.auth.unconfigured",
                source = source.as_str(),
                "webhook secret not configured, rejecting"
            );
            return Err(ReconcileError::Authentication(format!(
                "{} webhooks are not configured",
                source.as_str()
            )));
        };

        let credential = webhook.credential.as_deref();
        let verified = match source {
            WebhookSource::Payments => verify_signed_payload(
                credential,
                &webhook.body,
                secret,
                self.settings.signature_tolerance_secs,
                webhook.received_at,
            ),
            _ => verify_shared_secret(credential, secret),
        };

        verified.map_err(|error| {
            warn!(
                event_name = "ingest.auth.rejected",
                source = source.as_str(),
                header = source.credential_header(),
                error = %error,
                "webhook authentication failed"
            );
            ReconcileError::Authentication(error.to_string())
        })
    }

    /// Authenticates and normalizes one delivery. Malformed bodies surface as
    /// [`ReconcileError::PermanentValidation`], which callers acknowledge.
    pub fn ingest(&self, webhook: &InboundWebhook) -> Result<IngestOutcome, ReconcileError> {
        self.authenticate(webhook)?;

        let normalized = match webhook.source {
            WebhookSource::Payments => payments::normalize(&webhook.body, webhook.received_at),
            WebhookSource::ESign => esign::normalize(&webhook.body, webhook.received_at),
            WebhookSource::Practice => practice::normalize(&webhook.body, webhook.received_at),
            WebhookSource::Crm => crm::normalize(&webhook.body, webhook.received_at),
        };

        match normalized {
            Ok(Some(event)) => {
                info!(
                    event_name = "ingest.event.accepted",
                    correlation_id = %event.event_id,
                    source = webhook.source.as_str(),
                    event_kind = %event.kind,
                    correlation_key = %event.correlation_key,
                    "webhook normalized"
                );
                Ok(IngestOutcome::Event(event))
            }
            Ok(None) => {
                info!(
                    event_name = "ingest.event.ignored",
                    source = webhook.source.as_str(),
                    "webhook type not consumed"
                );
                Ok(IngestOutcome::Ignored(format!(
                    "{} event type not consumed",
                    webhook.source.as_str()
                )))
            }
            Err(error) => {
                warn!(
                    event_name = "ingest.event.malformed",
                    source = webhook.source.as_str(),
                    error = %error,
                    "webhook body could not be normalized"
                );
                Err(error.into())
            }
        }
    }
}
