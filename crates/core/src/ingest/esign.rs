//! E-signature provider webhooks.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::domain::deal::DealId;
use crate::domain::event::{
    CanonicalEvent, CorrelationKey, EnvelopeCompletedPayload, EventKind, EventPayload,
    SignerCompletedPayload, SourceSystem,
};
use crate::errors::DomainError;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Notification {
    event: String,
    event_id: Option<String>,
    data: NotificationData,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NotificationData {
    envelope_id: String,
    routing_order: Option<Value>,
    #[serde(default)]
    custom_fields: HashMap<String, String>,
}

fn custom_field(fields: &HashMap<String, String>, name: &str) -> Option<String> {
    fields.get(name).map(|value| value.trim()).filter(|value| !value.is_empty()).map(str::to_string)
}

fn routing_order(value: Option<&Value>) -> Result<u32, DomainError> {
    let parsed = match value {
        Some(Value::Number(number)) => number.as_u64().and_then(|value| u32::try_from(value).ok()),
        Some(Value::String(text)) => text.trim().parse::<u32>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| {
        DomainError::MalformedPayload("e-signature webhook: missing routingOrder".to_string())
    })
}

pub fn normalize(body: &[u8], received_at: DateTime<Utc>) -> Result<Option<CanonicalEvent>, DomainError> {
    let notification: Notification = serde_json::from_slice(body)
        .map_err(|error| DomainError::MalformedPayload(format!("e-signature webhook: {error}")))?;
    let data = notification.data;
    let document_type = custom_field(&data.custom_fields, "document_type");
    let deal_hint = custom_field(&data.custom_fields, "deal_id").map(DealId);

    let (kind, payload) = match notification.event.as_str() {
        "recipient-completed" => (
            EventKind::EnvelopeSignerCompleted,
            EventPayload::SignerCompleted(SignerCompletedPayload {
                envelope_id: data.envelope_id.clone(),
                document_type,
                routing_order: routing_order(data.routing_order.as_ref())?,
                deal_hint,
            }),
        ),
        "envelope-completed" => (
            EventKind::EnvelopeFullyCompleted,
            EventPayload::EnvelopeCompleted(EnvelopeCompletedPayload {
                envelope_id: data.envelope_id.clone(),
                document_type,
                deal_hint,
            }),
        ),
        _ => return Ok(None),
    };

    Ok(Some(CanonicalEvent::new(
        notification.event_id,
        kind,
        SourceSystem::ESignature,
        CorrelationKey::Envelope(data.envelope_id),
        payload,
        received_at,
    )))
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::normalize;
    use crate::domain::event::{CorrelationKey, EventKind, EventPayload};

    #[test]
    fn recipient_completed_maps_routing_order_and_document_type() {
        let body = br#"{
            "event": "recipient-completed",
            "eventId": "ds-1",
            "data": {
                "envelopeId": "env-1",
                "routingOrder": "1",
                "customFields": {"document_type": "engagement", "deal_id": "D-1"}
            }
        }"#;

        let event = normalize(body, Utc::now()).expect("parse").expect("consumed");

        assert_eq!(event.kind, EventKind::EnvelopeSignerCompleted);
        assert_eq!(event.correlation_key, CorrelationKey::Envelope("env-1".into()));
        let EventPayload::SignerCompleted(payload) = event.payload else {
            panic!("expected signer payload");
        };
        assert_eq!(payload.routing_order, 1);
        assert_eq!(payload.document_type.as_deref(), Some("engagement"));
    }

    #[test]
    fn envelope_completed_without_custom_fields() {
        let body = br#"{"event": "envelope-completed", "data": {"envelopeId": "env-2"}}"#;

        let event = normalize(body, Utc::now()).expect("parse").expect("consumed");

        assert_eq!(event.kind, EventKind::EnvelopeFullyCompleted);
    }

    #[test]
    fn signer_without_routing_order_is_malformed() {
        let body = br#"{"event": "recipient-completed", "data": {"envelopeId": "env-3"}}"#;
        assert!(normalize(body, Utc::now()).is_err());

        let sent = br#"{"event": "envelope-sent", "data": {"envelopeId": "env-3"}}"#;
        assert_eq!(normalize(sent, Utc::now()), Ok(None));
    }
}
