use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::deal::{
    property, Deal, DealId, DealStage, PaymentMethod, PaymentStatus, PropertyMap, SyncStatus,
};
use crate::stage_guard::{GuardDecision, StageGuard};

/// Typed property-level patch against a deal. `None` leaves a field untouched.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DealPatch {
    pub stage: Option<DealStage>,
    pub payment_status: Option<PaymentStatus>,
    pub payment_method: Option<PaymentMethod>,
    pub settlement_reference_id: Option<String>,
    pub practice_matter_id: Option<String>,
    #[serde(default)]
    pub envelope_ids: BTreeMap<String, String>,
    pub sync_status: Option<SyncStatus>,
    /// `Some("")` clears the stored error.
    pub sync_error: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub payment_amount: Option<Decimal>,
    pub processor_fee: Option<Decimal>,
    pub net_amount: Option<Decimal>,
    pub payment_failure_reason: Option<String>,
}

impl DealPatch {
    pub fn is_empty(&self) -> bool {
        self.to_properties().is_empty()
    }

    pub fn to_properties(&self) -> PropertyMap {
        let mut map = PropertyMap::new();
        let fields = [
            (property::STAGE, self.stage.map(|stage| stage.as_str().to_string())),
            (property::PAYMENT_STATUS, self.payment_status.map(|s| s.as_str().to_string())),
            (property::PAYMENT_METHOD, self.payment_method.map(|m| m.as_str().to_string())),
            (property::SETTLEMENT_REFERENCE_ID, self.settlement_reference_id.clone()),
            (property::PRACTICE_MATTER_ID, self.practice_matter_id.clone()),
            (property::SYNC_STATUS, self.sync_status.map(|s| s.as_str().to_string())),
            (property::SYNC_ERROR, self.sync_error.clone()),
            (property::LAST_SYNCED_AT, self.last_synced_at.map(|at| at.to_rfc3339())),
            (property::PAYMENT_AMOUNT, self.payment_amount.map(|v| v.to_string())),
            (property::PROCESSOR_FEE, self.processor_fee.map(|v| v.to_string())),
            (property::NET_AMOUNT, self.net_amount.map(|v| v.to_string())),
            (property::PAYMENT_FAILURE_REASON, self.payment_failure_reason.clone()),
        ];
        for (key, value) in fields {
            if let Some(value) = value {
                map.insert(key.to_string(), value);
            }
        }
        for (document_type, envelope_id) in &self.envelope_ids {
            map.insert(
                format!("{}{document_type}", property::ENVELOPE_ID_PREFIX),
                envelope_id.clone(),
            );
        }
        map
    }

    /// Re-checks the monotonic fields against the deal as it stands now, dropping any
    /// stage or payment status that would move the record backward.
    pub fn revalidate(&self, current: &Deal) -> DealPatch {
        let mut patch = self.clone();

        if let Some(stage) = patch.stage {
            let decision = if stage == DealStage::Closed {
                StageGuard::evaluate_terminal(current.snapshot(), stage)
            } else {
                StageGuard::evaluate(current.snapshot(), stage)
            };
            if !matches!(decision, GuardDecision::Allow) || stage == current.stage {
                patch.stage = None;
            }
        }

        if let Some(status) = patch.payment_status {
            if !current.payment_status.permits(status) {
                patch.payment_status = None;
            }
        }

        patch
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WriteIntent {
    pub target_deal_id: DealId,
    pub patch: DealPatch,
    pub reason: String,
}

impl WriteIntent {
    pub fn new(target_deal_id: DealId, patch: DealPatch, reason: impl Into<String>) -> Self {
        Self { target_deal_id, patch, reason: reason.into() }
    }

    /// The flat field→value map sent to the CRM.
    pub fn properties(&self) -> PropertyMap {
        self.patch.to_properties()
    }

    pub fn is_empty(&self) -> bool {
        self.patch.is_empty()
    }

    pub fn revalidated(&self, current: &Deal) -> WriteIntent {
        Self {
            target_deal_id: self.target_deal_id.clone(),
            patch: self.patch.revalidate(current),
            reason: self.reason.clone(),
        }
    }
}
