use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::deal::{DealId, PaymentMethod};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PaymentAuthorized,
    PaymentSettled,
    PaymentFailed,
    PaymentCanceled,
    EnvelopeSignerCompleted,
    EnvelopeFullyCompleted,
    MatterLifecycleChanged,
    PropertyStatusConfirmed,
}

impl EventKind {
    pub const ALL: [EventKind; 8] = [
        Self::PaymentAuthorized,
        Self::PaymentSettled,
        Self::PaymentFailed,
        Self::PaymentCanceled,
        Self::EnvelopeSignerCompleted,
        Self::EnvelopeFullyCompleted,
        Self::MatterLifecycleChanged,
        Self::PropertyStatusConfirmed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PaymentAuthorized => "payment_authorized",
            Self::PaymentSettled => "payment_settled",
            Self::PaymentFailed => "payment_failed",
            Self::PaymentCanceled => "payment_canceled",
            Self::EnvelopeSignerCompleted => "envelope_signer_completed",
            Self::EnvelopeFullyCompleted => "envelope_fully_completed",
            Self::MatterLifecycleChanged => "matter_lifecycle_changed",
            Self::PropertyStatusConfirmed => "property_status_confirmed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceSystem {
    PaymentProcessor,
    ESignature,
    PracticeManagement,
    Crm,
    Operator,
}

impl SourceSystem {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PaymentProcessor => "payment_processor",
            Self::ESignature => "e_signature",
            Self::PracticeManagement => "practice_management",
            Self::Crm => "crm",
            Self::Operator => "operator",
        }
    }
}

/// External identifier used to resolve an inbound event to a deal.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum CorrelationKey {
    Deal(DealId),
    SettlementReference(String),
    PracticeMatter(String),
    Envelope(String),
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deal(id) => write!(f, "deal:{id}"),
            Self::SettlementReference(value) => write!(f, "settlement:{value}"),
            Self::PracticeMatter(value) => write!(f, "matter:{value}"),
            Self::Envelope(value) => write!(f, "envelope:{value}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationPayload {
    pub reference_id: String,
    pub deal_hint: Option<DealId>,
    pub gross_amount: Decimal,
    pub processor_fee: Decimal,
    pub net_amount: Decimal,
    pub currency: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SettledAuthorization {
    pub reference_id: String,
    pub deal_hint: Option<DealId>,
    pub amount: Option<Decimal>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SettlementPayload {
    pub payout_id: String,
    pub settled_at: DateTime<Utc>,
    pub authorizations: Vec<SettledAuthorization>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PaymentStoppedPayload {
    pub reference_id: String,
    pub deal_hint: Option<DealId>,
    pub reason: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SignerCompletedPayload {
    pub envelope_id: String,
    pub document_type: Option<String>,
    pub routing_order: u32,
    pub deal_hint: Option<DealId>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeCompletedPayload {
    pub envelope_id: String,
    pub document_type: Option<String>,
    pub deal_hint: Option<DealId>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatterChange {
    LeadCreated,
    LeadUpdated,
    MatterCreated,
    MatterUpdated,
    LeadConverted,
}

impl MatterChange {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LeadCreated => "lead_created",
            Self::LeadUpdated => "lead_updated",
            Self::MatterCreated => "matter_created",
            Self::MatterUpdated => "matter_updated",
            Self::LeadConverted => "lead_converted",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatterPayload {
    pub matter_id: String,
    pub deal_hint: Option<DealId>,
    pub change: MatterChange,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PropertyConfirmationPayload {
    pub deal_id: DealId,
    pub payment_method: Option<PaymentMethod>,
    pub reference_id: Option<String>,
    pub confirmed_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum EventPayload {
    Authorization(AuthorizationPayload),
    Settlement(SettlementPayload),
    PaymentStopped(PaymentStoppedPayload),
    SignerCompleted(SignerCompletedPayload),
    EnvelopeCompleted(EnvelopeCompletedPayload),
    Matter(MatterPayload),
    PropertyConfirmed(PropertyConfirmationPayload),
}

/// One deal an event needs to be applied to: the key to resolve it by, an optional
/// fallback key, and which item of the payload it concerns.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subject {
    pub key: CorrelationKey,
    pub fallback: Option<CorrelationKey>,
    pub item: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    pub event_id: String,
    pub kind: EventKind,
    pub source: SourceSystem,
    pub correlation_key: CorrelationKey,
    pub payload: EventPayload,
    pub received_at: DateTime<Utc>,
}

impl CanonicalEvent {
    pub fn new(
        event_id: Option<String>,
        kind: EventKind,
        source: SourceSystem,
        correlation_key: CorrelationKey,
        payload: EventPayload,
        received_at: DateTime<Utc>,
    ) -> Self {
        let event_id = event_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("EVT-{}", Uuid::new_v4().simple()));
        Self { event_id, kind, source, correlation_key, payload, received_at }
    }

    /// Deals touched by this event. Settlements may reference several authorizations,
    /// everything else resolves to exactly one subject.
    pub fn subjects(&self) -> Vec<Subject> {
        let hint = |hint: &Option<DealId>| hint.clone().map(CorrelationKey::Deal);

        match &self.payload {
            EventPayload::Settlement(settlement) => settlement
                .authorizations
                .iter()
                .enumerate()
                .map(|(item, authorization)| Subject {
                    key: CorrelationKey::SettlementReference(authorization.reference_id.clone()),
                    fallback: hint(&authorization.deal_hint),
                    item,
                })
                .collect(),
            EventPayload::Authorization(payload) => {
                vec![self.subject(hint(&payload.deal_hint))]
            }
            EventPayload::PaymentStopped(payload) => {
                vec![self.subject(hint(&payload.deal_hint))]
            }
            EventPayload::SignerCompleted(payload) => {
                vec![self.subject(hint(&payload.deal_hint))]
            }
            EventPayload::EnvelopeCompleted(payload) => {
                vec![self.subject(hint(&payload.deal_hint))]
            }
            EventPayload::Matter(payload) => vec![self.subject(hint(&payload.deal_hint))],
            EventPayload::PropertyConfirmed(_) => vec![self.subject(None)],
        }
    }

    fn subject(&self, fallback: Option<CorrelationKey>) -> Subject {
        let fallback = fallback.filter(|key| *key != self.correlation_key);
        Subject { key: self.correlation_key.clone(), fallback, item: 0 }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::{
        CanonicalEvent, CorrelationKey, EventKind, EventPayload, SettledAuthorization,
        SettlementPayload, SourceSystem,
    };
    use crate::domain::deal::DealId;

    #[test]
    fn settlement_yields_one_subject_per_authorization() {
        let event = CanonicalEvent::new(
            Some("evt_1".to_string()),
            EventKind::PaymentSettled,
            SourceSystem::PaymentProcessor,
            CorrelationKey::SettlementReference("pi_a".to_string()),
            EventPayload::Settlement(SettlementPayload {
                payout_id: "po_1".to_string(),
                settled_at: Utc::now(),
                authorizations: vec![
                    SettledAuthorization {
                        reference_id: "pi_a".to_string(),
                        deal_hint: Some(DealId("D-1".to_string())),
                        amount: None,
                    },
                    SettledAuthorization {
                        reference_id: "pi_b".to_string(),
                        deal_hint: None,
                        amount: None,
                    },
                ],
            }),
            Utc::now(),
        );

        let subjects = event.subjects();
        assert_eq!(subjects.len(), 2);
        assert_eq!(subjects[0].fallback, Some(CorrelationKey::Deal(DealId("D-1".to_string()))));
        assert_eq!(subjects[1].key, CorrelationKey::SettlementReference("pi_b".to_string()));
        assert_eq!(subjects[1].item, 1);
    }

    #[test]
    fn blank_event_id_is_replaced() {
        let event = CanonicalEvent::new(
            Some("  ".to_string()),
            EventKind::PropertyStatusConfirmed,
            SourceSystem::Crm,
            CorrelationKey::Deal(DealId("D-1".to_string())),
            EventPayload::PropertyConfirmed(super::PropertyConfirmationPayload {
                deal_id: DealId("D-1".to_string()),
                payment_method: None,
                reference_id: None,
                confirmed_at: Utc::now(),
            }),
            Utc::now(),
        );

        assert!(event.event_id.starts_with("EVT-"));
    }
}
