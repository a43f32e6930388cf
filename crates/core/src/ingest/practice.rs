//! Practice-management webhooks.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::domain::deal::DealId;
use crate::domain::event::{
    CanonicalEvent, CorrelationKey, EventKind, EventPayload, MatterChange, MatterPayload,
    SourceSystem,
};
use crate::errors::DomainError;

#[derive(Debug, Deserialize)]
struct Notification {
    id: Option<String>,
    #[serde(rename = "type")]
    event_type: String,
    payload: MatterRecord,
}

#[derive(Debug, Deserialize)]
struct MatterRecord {
    id: String,
    #[serde(default)]
    external_reference: Option<String>,
}

pub fn normalize(body: &[u8], received_at: DateTime<Utc>) -> Result<Option<CanonicalEvent>, DomainError> {
    let notification: Notification = serde_json::from_slice(body).map_err(|error| {
        DomainError::MalformedPayload(format!("practice webhook: {error}"))
    })?;

    let change = match notification.event_type.as_str() {
        "matter.created" => MatterChange::MatterCreated,
        "matter.updated" => MatterChange::MatterUpdated,
        "matter.converted" => MatterChange::LeadConverted,
        "lead.created" => MatterChange::LeadCreated,
        "lead.updated" => MatterChange::LeadUpdated,
        _ => return Ok(None),
    };
    let matter_id = notification.payload.id;
    let deal_hint = notification
        .payload
        .external_reference
        .filter(|value| !value.trim().is_empty())
        .map(DealId);

    Ok(Some(CanonicalEvent::new(
        notification.id,
        EventKind::MatterLifecycleChanged,
        SourceSystem::PracticeManagement,
        CorrelationKey::PracticeMatter(matter_id.clone()),
        EventPayload::Matter(MatterPayload { matter_id, deal_hint, change }),
        received_at,
    )))
}
