use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::deal::{DealId, PaymentMethod};

/// Dedup key for receipt automation: one dispatch per settlement of a deal.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DispatchKey {
    pub deal_id: DealId,
    pub settlement_reference_id: String,
}

impl std::fmt::Display for DispatchKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.deal_id, self.settlement_reference_id)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub deal_id: DealId,
    pub settlement_reference_id: String,
    pub payment_method: Option<PaymentMethod>,
    pub settled_at: DateTime<Utc>,
}

impl DispatchRequest {
    pub fn key(&self) -> DispatchKey {
        DispatchKey {
            deal_id: self.deal_id.clone(),
            settlement_reference_id: self.settlement_reference_id.clone(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchState {
    Reserved,
    Completed,
    Failed,
}

impl DispatchState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reserved => "reserved",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "reserved" => Some(Self::Reserved),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub key: DispatchKey,
    pub state: DispatchState,
    pub rehearsal: bool,
    pub message: Option<String>,
    pub correlation_id: String,
    pub reserved_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DispatchRecord {
    pub fn reserve(
        key: DispatchKey,
        rehearsal: bool,
        correlation_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            key,
            state: DispatchState::Reserved,
            rehearsal,
            message: None,
            correlation_id: correlation_id.into(),
            reserved_at: now,
            updated_at: now,
        }
    }
}

/// Input handed to the receipt automation executor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptRequest {
    pub deal_id: DealId,
    pub matter_id: String,
    pub amount: Decimal,
    pub payer_name: Option<String>,
    /// Settlement date as `dd/mm/yyyy`.
    pub date: String,
    pub reason: String,
    pub description: String,
    pub rehearsal_mode: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptResult {
    pub success: bool,
    pub message: String,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AlreadyDispatched,
    AutomationDisabled,
    MissingPracticeMatter,
    MissingAmount,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AlreadyDispatched => "already_dispatched",
            Self::AutomationDisabled => "automation_disabled",
            Self::MissingPracticeMatter => "missing_practice_matter",
            Self::MissingAmount => "missing_amount",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum DispatchOutcome {
    Triggered { success: bool, rehearsal: bool, message: String, error: Option<String> },
    Skipped { reason: SkipReason },
}

impl DispatchOutcome {
    pub fn is_triggered(&self) -> bool {
        matches!(self, Self::Triggered { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::DispatchState;

    #[test]
    fn dispatch_state_round_trips_from_storage_encoding() {
        for state in [DispatchState::Reserved, DispatchState::Completed, DispatchState::Failed] {
            assert_eq!(DispatchState::parse(state.as_str()), Some(state));
        }
    }
}
