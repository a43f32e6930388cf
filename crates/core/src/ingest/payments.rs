//! Payment processor webhooks.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;

use crate::domain::deal::DealId;
use crate::domain::event::{
    AuthorizationPayload, CanonicalEvent, CorrelationKey, EventKind, EventPayload,
    PaymentStoppedPayload, SettledAuthorization, SettlementPayload, SourceSystem,
};
use crate::errors::DomainError;

#[derive(Debug, Deserialize)]
struct Envelope {
    id: Option<String>,
    #[serde(rename = "type")]
    event_type: String,
    created: Option<i64>,
    data: Data,
}

#[derive(Debug, Deserialize)]
struct Data {
    object: Value,
}

#[derive(Debug, Deserialize)]
struct PaymentIntent {
    id: String,
    #[serde(default)]
    amount: i64,
    #[serde(default)]
    currency: String,
    #[serde(default)]
    metadata: HashMap<String, Value>,
    last_payment_error: Option<PaymentError>,
    cancellation_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PaymentError {
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Payout {
    id: String,
    arrival_date: Option<i64>,
    #[serde(default)]
    authorizations: Vec<PayoutAuthorization>,
}

#[derive(Debug, Deserialize)]
struct PayoutAuthorization {
    #[serde(alias = "payment_intent")]
    reference_id: String,
    amount: Option<i64>,
    #[serde(default)]
    metadata: HashMap<String, Value>,
}

fn malformed(error: impl std::fmt::Display) -> DomainError {
    DomainError::MalformedPayload(format!("payment webhook: {error}"))
}

fn from_minor_units(cents: i64) -> Decimal {
    Decimal::new(cents, 2)
}

fn metadata_decimal(metadata: &HashMap<String, Value>, key: &str) -> Option<Decimal> {
    match metadata.get(key)? {
        Value::String(value) => Decimal::from_str(value.trim()).ok(),
        Value::Number(value) => Decimal::from_str(&value.to_string()).ok(),
        _ => None,
    }
}

fn deal_hint(metadata: &HashMap<String, Value>) -> Option<DealId> {
    metadata
        .get("deal_id")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| DealId(value.to_string()))
}

fn unix(seconds: Option<i64>) -> Option<DateTime<Utc>> {
    seconds.and_then(|seconds| Utc.timestamp_opt(seconds, 0).single())
}

/// `Ok(None)` for event types the engine does not consume.
pub fn normalize(body: &[u8], received_at: DateTime<Utc>) -> Result<Option<CanonicalEvent>, DomainError> {
    let envelope: Envelope = serde_json::from_slice(body).map_err(malformed)?;

    let kind = match envelope.event_type.as_str() {
        "payment_intent.amount_capturable_updated" | "payment_intent.succeeded" => {
            EventKind::PaymentAuthorized
        }
        "payout.paid" => EventKind::PaymentSettled,
        "payment_intent.payment_failed" => EventKind::PaymentFailed,
        "payment_intent.canceled" => EventKind::PaymentCanceled,
        _ => return Ok(None),
    };

    let (correlation_key, payload) = match kind {
        EventKind::PaymentSettled => {
            let payout: Payout =
                serde_json::from_value(envelope.data.object).map_err(malformed)?;
            let settled_at = unix(payout.arrival_date)
                .or_else(|| unix(envelope.created))
                .unwrap_or(received_at);
            let authorizations = payout
                .authorizations
                .into_iter()
                .map(|authorization| SettledAuthorization {
                    deal_hint: deal_hint(&authorization.metadata),
                    amount: metadata_decimal(&authorization.metadata, "gross_amount")
                        .or(authorization.amount.map(from_minor_units)),
                    reference_id: authorization.reference_id,
                })
                .collect();
            (
                CorrelationKey::SettlementReference(payout.id.clone()),
                EventPayload::Settlement(SettlementPayload {
                    payout_id: payout.id,
                    settled_at,
                    authorizations,
                }),
            )
        }
        EventKind::PaymentAuthorized => {
            let intent: PaymentIntent =
                serde_json::from_value(envelope.data.object).map_err(malformed)?;
            let gross = metadata_decimal(&intent.metadata, "gross_amount")
                .unwrap_or_else(|| from_minor_units(intent.amount));
            let fee = metadata_decimal(&intent.metadata, "processor_fee").unwrap_or(Decimal::ZERO);
            let net = match metadata_decimal(&intent.metadata, "net_amount") {
                Some(net) => net,
                None => gross
                    .checked_sub(fee)
                    .ok_or_else(|| malformed(format!("net of {gross} less {fee} overflows")))?,
            };
            (
                CorrelationKey::SettlementReference(intent.id.clone()),
                EventPayload::Authorization(AuthorizationPayload {
                    deal_hint: deal_hint(&intent.metadata),
                    reference_id: intent.id,
                    gross_amount: gross,
                    processor_fee: fee,
                    net_amount: net,
                    currency: intent.currency,
                }),
            )
        }
        _ => {
            let intent: PaymentIntent =
                serde_json::from_value(envelope.data.object).map_err(malformed)?;
            let reason = intent
                .last_payment_error
                .and_then(|error| error.message)
                .or(intent.cancellation_reason)
                .unwrap_or_else(|| "no reason given".to_string());
            (
                CorrelationKey::SettlementReference(intent.id.clone()),
                EventPayload::PaymentStopped(PaymentStoppedPayload {
                    deal_hint: deal_hint(&intent.metadata),
                    reference_id: intent.id,
                    reason,
                }),
            )
        }
    };

    Ok(Some(CanonicalEvent::new(
        envelope.id,
        kind,
        SourceSystem::PaymentProcessor,
        correlation_key,
        payload,
        received_at,
    )))
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rust_decimal::Decimal;

    use super::normalize;
    use crate::domain::deal::DealId;
    use crate::domain::event::{EventKind, EventPayload};
    use crate::errors::DomainError;

    #[test]
    fn authorization_reads_amounts_from_metadata_with_fallbacks() {
        let body = br#"{
            "id": "evt_1",
            "type": "payment_intent.amount_capturable_updated",
            "data": {"object": {
                "id": "pi_1", "amount": 950000, "currency": "aud",
                "metadata": {"deal_id": "D-1", "processor_fee": "275.80"}
            }}
        }"#;

        let event = normalize(body, Utc::now()).expect("parse").expect("consumed");

        assert_eq!(event.kind, EventKind::PaymentAuthorized);
        assert_eq!(event.event_id, "evt_1");
        let EventPayload::Authorization(payload) = event.payload else {
            panic!("expected authorization payload");
        };
        assert_eq!(payload.gross_amount, Decimal::new(9500, 0));
        assert_eq!(payload.processor_fee, Decimal::new(27580, 2));
        assert_eq!(payload.net_amount, Decimal::new(922420, 2));
        assert_eq!(payload.deal_hint, Some(DealId("D-1".into())));
    }

    #[test]
    fn authorization_with_overflowing_net_is_malformed() {
        let body = br#"{
            "id": "evt_9",
            "type": "payment_intent.amount_capturable_updated",
            "data": {"object": {
                "id": "pi_9", "amount": 100, "currency": "aud",
                "metadata": {"gross_amount": "79228162514264337593543950335", "processor_fee": "-1"}
            }}
        }"#;

        let error = normalize(body, Utc::now()).expect_err("overflow is rejected");

        assert!(matches!(error, DomainError::MalformedPayload(_)));
    }

    #[test]
    fn payout_lists_each_settled_authorization() {
        let body = br#"{
            "id": "evt_2", "type": "payout.paid", "created": 1700000000,
            "data": {"object": {
                "id": "po_1", "arrival_date": 1700003600,
                "authorizations": [
                    {"payment_intent": "pi_1", "amount": 950000, "metadata": {"deal_id": "D-1"}},
                    {"reference_id": "pi_2"}
                ]
            }}
        }"#;

        let event = normalize(body, Utc::now()).expect("parse").expect("consumed");

        let EventPayload::Settlement(payload) = &event.payload else {
            panic!("expected settlement payload");
        };
        assert_eq!(payload.payout_id, "po_1");
        assert_eq!(payload.settled_at.timestamp(), 1_700_003_600);
        assert_eq!(payload.authorizations.len(), 2);
        assert_eq!(payload.authorizations[0].amount, Some(Decimal::new(9500, 0)));
        assert_eq!(payload.authorizations[1].amount, None);
        assert_eq!(event.subjects().len(), 2);
    }

    #[test]
    fn failed_payment_carries_reason() {
        let body = br#"{
            "type": "payment_intent.payment_failed",
            "data": {"object": {"id": "pi_3", "last_payment_error": {"message": "card declined"}}}
        }"#;

        let event = normalize(body, Utc::now()).expect("parse").expect("consumed");

        assert_eq!(event.kind, EventKind::PaymentFailed);
        assert!(event.event_id.starts_with("EVT-"));
        let EventPayload::PaymentStopped(payload) = event.payload else {
            panic!("expected stopped payload");
        };
        assert_eq!(payload.reason, "card declined");
    }

    #[test]
    fn unknown_types_are_skipped_and_garbage_is_malformed() {
        let unknown = br#"{"type": "customer.created", "data": {"object": {}}}"#;
        assert_eq!(normalize(unknown, Utc::now()), Ok(None));
        assert!(normalize(b"not json", Utc::now()).is_err());
    }
}
