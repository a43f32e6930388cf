//! CRM property-change notifications. Only a deal flipping to `payment_status = paid`
//! is consumed; it confirms a deferred payment such as a bank transfer.

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::domain::deal::{property, DealId, PaymentMethod, PaymentStatus};
use crate::domain::event::{
    CanonicalEvent, CorrelationKey, EventKind, EventPayload, PropertyConfirmationPayload,
    SourceSystem,
};
use crate::errors::DomainError;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PropertyChange {
    event_id: Option<Value>,
    object_id: Value,
    property_name: String,
    property_value: Option<String>,
    occurred_at: Option<i64>,
    payment_method: Option<String>,
    reference_id: Option<String>,
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

pub fn normalize(body: &[u8], received_at: DateTime<Utc>) -> Result<Option<CanonicalEvent>, DomainError> {
    let change: PropertyChange = serde_json::from_slice(body)
        .map_err(|error| DomainError::MalformedPayload(format!("crm webhook: {error}")))?;

    let is_paid = change.property_value.as_deref().and_then(PaymentStatus::parse)
        == Some(PaymentStatus::Paid);
    if change.property_name != property::PAYMENT_STATUS || !is_paid {
        return Ok(None);
    }

    let deal_id = as_text(&change.object_id).map(DealId).ok_or_else(|| {
        DomainError::MalformedPayload("crm webhook: objectId is empty".to_string())
    })?;
    // CRM timestamps are epoch milliseconds.
    let confirmed_at = change
        .occurred_at
        .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
        .unwrap_or(received_at);

    Ok(Some(CanonicalEvent::new(
        change.event_id.as_ref().and_then(as_text),
        EventKind::PropertyStatusConfirmed,
        SourceSystem::Crm,
        CorrelationKey::Deal(deal_id.clone()),
        EventPayload::PropertyConfirmed(PropertyConfirmationPayload {
            deal_id,
            payment_method: change.payment_method.as_deref().and_then(PaymentMethod::parse),
            reference_id: change.reference_id.filter(|value| !value.trim().is_empty()),
            confirmed_at,
        }),
        received_at,
    )))
}
