use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::DomainError;

/// Flat CRM property map, keyed by property name.
pub type PropertyMap = BTreeMap<String, String>;

/// CRM property names written and read by the engine.
pub mod property {
    pub const STAGE: &str = "dealstage";
    pub const PAYMENT_STATUS: &str = "payment_status";
    pub const PAYMENT_METHOD: &str = "payment_method";
    pub const SETTLEMENT_REFERENCE_ID: &str = "settlement_reference_id";
    pub const PRACTICE_MATTER_ID: &str = "practice_matter_id";
    pub const ENVELOPE_ID_PREFIX: &str = "envelope_id__";
    pub const SYNC_STATUS: &str = "sync_status";
    pub const SYNC_ERROR: &str = "sync_error";
    pub const LAST_SYNCED_AT: &str = "last_synced_at";
    pub const PAYMENT_AMOUNT: &str = "payment_amount";
    pub const PROCESSOR_FEE: &str = "processor_fee";
    pub const NET_AMOUNT: &str = "net_amount";
    pub const PAYMENT_FAILURE_REASON: &str = "payment_failure_reason";
    pub const PAYER_FIRST_NAME: &str = "payer_first_name";
    pub const PAYER_LAST_NAME: &str = "payer_last_name";
    pub const UPDATED_AT: &str = "updated_at";
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DealId(pub String);

impl fmt::Display for DealId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DealStage {
    LeadCreated,
    QuoteAccepted,
    DocumentsSent,
    FundsRequested,
    FundsProvided,
    Closed,
}

impl DealStage {
    pub const ALL: [DealStage; 6] = [
        Self::LeadCreated,
        Self::QuoteAccepted,
        Self::DocumentsSent,
        Self::FundsRequested,
        Self::FundsProvided,
        Self::Closed,
    ];

    pub fn index(self) -> usize {
        match self {
            Self::LeadCreated => 0,
            Self::QuoteAccepted => 1,
            Self::DocumentsSent => 2,
            Self::FundsRequested => 3,
            Self::FundsProvided => 4,
            Self::Closed => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::LeadCreated => "lead_created",
            Self::QuoteAccepted => "quote_accepted",
            Self::DocumentsSent => "documents_sent",
            Self::FundsRequested => "funds_requested",
            Self::FundsProvided => "funds_provided",
            Self::Closed => "closed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let normalized = value.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        Self::ALL.into_iter().find(|stage| stage.as_str() == normalized)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    #[default]
    Unset,
    Pending,
    Paid,
    Failed,
    Canceled,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unset => "unset",
            Self::Pending => "pending",
            Self::Paid => "paid",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "unset" => Some(Self::Unset),
            "pending" => Some(Self::Pending),
            "paid" => Some(Self::Paid),
            "failed" => Some(Self::Failed),
            "canceled" | "cancelled" => Some(Self::Canceled),
            _ => None,
        }
    }

    /// Whether the status may move to `next`. Re-asserting the current status is not a move.
    pub fn permits(self, next: PaymentStatus) -> bool {
        use PaymentStatus::{Canceled, Failed, Paid, Pending, Unset};

        match (self, next) {
            (current, next) if current == next => false,
            (_, Unset) => false,
            (Unset, _) => true,
            (Pending, Paid | Failed | Canceled) => true,
            (Failed | Canceled, Pending | Paid) => true,
            _ => false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    CardProcessor,
    BankTransfer,
}

impl PaymentMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CardProcessor => "card_processor",
            Self::BankTransfer => "bank_transfer",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "card_processor" | "card" | "stripe" => Some(Self::CardProcessor),
            "bank_transfer" | "bank" | "eft" => Some(Self::BankTransfer),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    #[default]
    NotSynced,
    Successful,
    Failed,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotSynced => "not_synced",
            Self::Successful => "successful",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "not_synced" => Some(Self::NotSynced),
            "successful" | "success" => Some(Self::Successful),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// The two fields the stage guard looks at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DealSnapshot {
    pub stage: DealStage,
    pub payment_status: PaymentStatus,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Deal {
    pub id: DealId,
    pub stage: DealStage,
    pub payment_status: PaymentStatus,
    pub payment_method: Option<PaymentMethod>,
    pub settlement_reference_id: Option<String>,
    pub practice_matter_id: Option<String>,
    /// Envelope ids keyed by document type.
    pub envelope_ids: BTreeMap<String, String>,
    pub sync_status: SyncStatus,
    pub sync_error: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub payment_amount: Option<Decimal>,
    pub processor_fee: Option<Decimal>,
    pub net_amount: Option<Decimal>,
    pub payment_failure_reason: Option<String>,
    pub payer_first_name: Option<String>,
    pub payer_last_name: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Deal {
    pub fn new(id: DealId, stage: DealStage, now: DateTime<Utc>) -> Self {
        Self {
            id,
            stage,
            payment_status: PaymentStatus::Unset,
            payment_method: None,
            settlement_reference_id: None,
            practice_matter_id: None,
            envelope_ids: BTreeMap::new(),
            sync_status: SyncStatus::NotSynced,
            sync_error: None,
            last_synced_at: None,
            payment_amount: None,
            processor_fee: None,
            net_amount: None,
            payment_failure_reason: None,
            payer_first_name: None,
            payer_last_name: None,
            updated_at: now,
        }
    }

    pub fn snapshot(&self) -> DealSnapshot {
        DealSnapshot { stage: self.stage, payment_status: self.payment_status }
    }

    pub fn envelope_id(&self, document_type: &str) -> Option<&str> {
        self.envelope_ids.get(document_type).map(String::as_str)
    }

    /// Payer display name in "Last, First" form, or whichever half is known.
    pub fn payer_name(&self) -> Option<String> {
        let first = self.payer_first_name.as_deref().map(str::trim).filter(|v| !v.is_empty());
        let last = self.payer_last_name.as_deref().map(str::trim).filter(|v| !v.is_empty());
        match (last, first) {
            (Some(last), Some(first)) => Some(format!("{last}, {first}")),
            (Some(only), None) | (None, Some(only)) => Some(only.to_string()),
            (None, None) => None,
        }
    }

    pub fn to_properties(&self) -> PropertyMap {
        let mut map = PropertyMap::new();
        map.insert(property::STAGE.to_string(), self.stage.as_str().to_string());
        map.insert(property::PAYMENT_STATUS.to_string(), self.payment_status.as_str().to_string());
        map.insert(property::SYNC_STATUS.to_string(), self.sync_status.as_str().to_string());
        map.insert(property::UPDATED_AT.to_string(), self.updated_at.to_rfc3339());

        let optional = [
            (property::PAYMENT_METHOD, self.payment_method.map(|m| m.as_str().to_string())),
            (property::SETTLEMENT_REFERENCE_ID, self.settlement_reference_id.clone()),
            (property::PRACTICE_MATTER_ID, self.practice_matter_id.clone()),
            (property::SYNC_ERROR, self.sync_error.clone()),
            (property::LAST_SYNCED_AT, self.last_synced_at.map(|at| at.to_rfc3339())),
            (property::PAYMENT_AMOUNT, self.payment_amount.map(|v| v.to_string())),
            (property::PROCESSOR_FEE, self.processor_fee.map(|v| v.to_string())),
            (property::NET_AMOUNT, self.net_amount.map(|v| v.to_string())),
            (property::PAYMENT_FAILURE_REASON, self.payment_failure_reason.clone()),
            (property::PAYER_FIRST_NAME, self.payer_first_name.clone()),
            (property::PAYER_LAST_NAME, self.payer_last_name.clone()),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                map.insert(key.to_string(), value);
            }
        }

        for (document_type, envelope_id) in &self.envelope_ids {
            map.insert(format!("{}{document_type}", property::ENVELOPE_ID_PREFIX), envelope_id.clone());
        }

        map
    }

    /// Rebuilds a deal from a CRM property map. Unknown properties are ignored.
    pub fn from_properties(
        id: DealId,
        properties: &PropertyMap,
        now: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        let stage_raw = properties.get(property::STAGE).ok_or_else(|| {
            DomainError::InvariantViolation(format!("deal `{id}` has no `{}`", property::STAGE))
        })?;
        let stage = DealStage::parse(stage_raw).ok_or_else(|| {
            DomainError::InvariantViolation(format!("deal `{id}` has unknown stage `{stage_raw}`"))
        })?;

        let mut deal = Deal::new(id, stage, now);
        deal.apply_properties(properties)?;
        Ok(deal)
    }

    /// Applies a flat property patch to the in-memory record. Empty values clear optional fields.
    pub fn apply_properties(&mut self, properties: &PropertyMap) -> Result<(), DomainError> {
        for (key, raw) in properties {
            let value = raw.trim();
            match key.as_str() {
                property::STAGE => {
                    self.stage = DealStage::parse(value).ok_or_else(|| invalid(key, value))?;
                }
                property::PAYMENT_STATUS => {
                    self.payment_status =
                        PaymentStatus::parse(value).ok_or_else(|| invalid(key, value))?;
                }
                property::PAYMENT_METHOD => {
                    self.payment_method = match value {
                        "" => None,
                        other => Some(PaymentMethod::parse(other).ok_or_else(|| invalid(key, other))?),
                    };
                }
                property::SYNC_STATUS => {
                    self.sync_status = SyncStatus::parse(value).ok_or_else(|| invalid(key, value))?;
                }
                property::SETTLEMENT_REFERENCE_ID => self.settlement_reference_id = text(value),
                property::PRACTICE_MATTER_ID => self.practice_matter_id = text(value),
                property::SYNC_ERROR => self.sync_error = text(value),
                property::PAYMENT_FAILURE_REASON => self.payment_failure_reason = text(value),
                property::PAYER_FIRST_NAME => self.payer_first_name = text(value),
                property::PAYER_LAST_NAME => self.payer_last_name = text(value),
                property::LAST_SYNCED_AT => self.last_synced_at = timestamp(key, value)?,
                property::UPDATED_AT => {
                    if let Some(updated_at) = timestamp(key, value)? {
                        self.updated_at = updated_at;
                    }
                }
                property::PAYMENT_AMOUNT => self.payment_amount = decimal(key, value)?,
                property::PROCESSOR_FEE => self.processor_fee = decimal(key, value)?,
                property::NET_AMOUNT => self.net_amount = decimal(key, value)?,
                other => {
                    if let Some(document_type) = other.strip_prefix(property::ENVELOPE_ID_PREFIX) {
                        match text(value) {
                            Some(envelope_id) => {
                                self.envelope_ids.insert(document_type.to_string(), envelope_id);
                            }
                            None => {
                                self.envelope_ids.remove(document_type);
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

fn invalid(key: &str, value: &str) -> DomainError {
    DomainError::InvariantViolation(format!("invalid value `{value}` for property `{key}`"))
}

fn text(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

fn timestamp(key: &str, value: &str) -> Result<Option<DateTime<Utc>>, DomainError> {
    if value.is_empty() {
        return Ok(None);
    }
    DateTime::parse_from_rfc3339(value)
        .map(|at| Some(at.with_timezone(&Utc)))
        .map_err(|_| invalid(key, value))
}

fn decimal(key: &str, value: &str) -> Result<Option<Decimal>, DomainError> {
    if value.is_empty() {
        return Ok(None);
    }
    value.parse::<Decimal>().map(Some).map_err(|_| invalid(key, value))
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rust_decimal::Decimal;

    use super::{property, Deal, DealId, DealStage, PaymentMethod, PaymentStatus, PropertyMap};

    #[test]
    fn stages_are_strictly_ordered() {
        let indexes: Vec<usize> = DealStage::ALL.iter().map(|stage| stage.index()).collect();
        assert_eq!(indexes, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(DealStage::parse("Funds Provided"), Some(DealStage::FundsProvided));
        assert_eq!(DealStage::parse("nonsense"), None);
    }

    #[test]
    fn payment_status_never_moves_backward() {
        assert!(PaymentStatus::Unset.permits(PaymentStatus::Pending));
        assert!(PaymentStatus::Unset.permits(PaymentStatus::Paid));
        assert!(PaymentStatus::Pending.permits(PaymentStatus::Paid));
        assert!(PaymentStatus::Pending.permits(PaymentStatus::Failed));
        assert!(PaymentStatus::Failed.permits(PaymentStatus::Paid));

        assert!(!PaymentStatus::Paid.permits(PaymentStatus::Pending));
        assert!(!PaymentStatus::Paid.permits(PaymentStatus::Failed));
        assert!(!PaymentStatus::Pending.permits(PaymentStatus::Unset));
        assert!(!PaymentStatus::Pending.permits(PaymentStatus::Pending));
    }

    #[test]
    fn property_map_round_trips_core_fields() {
        let now = Utc::now();
        let mut deal = Deal::new(DealId("D-1".to_string()), DealStage::DocumentsSent, now);
        deal.payment_status = PaymentStatus::Pending;
        deal.payment_method = Some(PaymentMethod::CardProcessor);
        deal.settlement_reference_id = Some("pi_123".to_string());
        deal.payment_amount = Some(Decimal::new(950_000, 2));
        deal.envelope_ids.insert("engagement".to_string(), "env-1".to_string());

        let properties = deal.to_properties();
        assert_eq!(properties.get(property::STAGE).map(String::as_str), Some("documents_sent"));
        assert_eq!(
            properties.get("envelope_id__engagement").map(String::as_str),
            Some("env-1")
        );

        let rebuilt = Deal::from_properties(deal.id.clone(), &properties, now).expect("rebuild");
        assert_eq!(rebuilt, deal);
    }

    #[test]
    fn empty_property_values_clear_optional_fields() {
        let now = Utc::now();
        let mut deal = Deal::new(DealId("D-2".to_string()), DealStage::FundsProvided, now);
        deal.sync_error = Some("automation timed out".to_string());

        let mut patch = PropertyMap::new();
        patch.insert(property::SYNC_ERROR.to_string(), String::new());
        deal.apply_properties(&patch).expect("apply");

        assert_eq!(deal.sync_error, None);
    }

    #[test]
    fn unknown_stage_is_rejected() {
        let mut properties = PropertyMap::new();
        properties.insert(property::STAGE.to_string(), "appointmentscheduled".to_string());

        let result = Deal::from_properties(DealId("D-3".to_string()), &properties, Utc::now());
        assert!(result.is_err());
    }

    #[test]
    fn payer_name_prefers_last_comma_first() {
        let mut deal = Deal::new(DealId("D-4".to_string()), DealStage::LeadCreated, Utc::now());
        assert_eq!(deal.payer_name(), None);

        deal.payer_first_name = Some("Logan".to_string());
        assert_eq!(deal.payer_name().as_deref(), Some("Logan"));

        deal.payer_last_name = Some("Stanford".to_string());
        assert_eq!(deal.payer_name().as_deref(), Some("Stanford, Logan"));
    }
}
