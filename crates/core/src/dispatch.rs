//! Side-Effect Dispatcher
//!
//! Receipt automation runs at most once per `(deal, settlement reference)`.
//! The ledger row is reserved before the executor is called, so a replayed
//! settlement or a racing recovery request finds the reservation and skips.
//! Automation failures are reported back as deal properties and never touch
//! payment status or stage.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink};
use crate::domain::deal::{Deal, PaymentMethod, SyncStatus};
use crate::domain::dispatch::{
    DispatchOutcome, DispatchRecord, DispatchRequest, DispatchState, ReceiptRequest, SkipReason,
};
use crate::domain::intent::{DealPatch, WriteIntent};
use crate::errors::{ReconcileError, StoreError};
use crate::ports::{CrmGateway, DispatchLedger, ReceiptAutomationExecutor};
use crate::sync_queue::SyncQueue;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DispatchSettings {
    pub enabled: bool,
    /// Fill the receipt without submitting it.
    pub rehearsal_mode: bool,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self { enabled: true, rehearsal_mode: true }
    }
}

pub struct SideEffectDispatcher {
    ledger: Arc<dyn DispatchLedger>,
    executor: Arc<dyn ReceiptAutomationExecutor>,
    audit: Arc<dyn AuditSink>,
    settings: DispatchSettings,
}

impl SideEffectDispatcher {
    pub fn new(
        ledger: Arc<dyn DispatchLedger>,
        executor: Arc<dyn ReceiptAutomationExecutor>,
        audit: Arc<dyn AuditSink>,
        settings: DispatchSettings,
    ) -> Self {
        Self { ledger, executor, audit, settings }
    }

    pub fn settings(&self) -> DispatchSettings {
        self.settings
    }

    /// `deal` is the record as it stands after the settlement write.
    pub async fn maybe_trigger(
        &self,
        request: &DispatchRequest,
        deal: &Deal,
        correlation_id: &str,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome, StoreError> {
        let key = request.key();

        if !self.settings.enabled {
            return Ok(self.skipped(request, SkipReason::AutomationDisabled, correlation_id));
        }
        let Some(matter_id) = deal.practice_matter_id.clone() else {
            return Ok(self.skipped(request, SkipReason::MissingPracticeMatter, correlation_id));
        };
        let Some(amount) = deal.payment_amount.or(deal.net_amount) else {
            return Ok(self.skipped(request, SkipReason::MissingAmount, correlation_id));
        };

        let record =
            DispatchRecord::reserve(key.clone(), self.settings.rehearsal_mode, correlation_id, now);
        if !self.ledger.reserve(&record).await? {
            return Ok(self.skipped(request, SkipReason::AlreadyDispatched, correlation_id));
        }

        let receipt = build_receipt(request, deal, matter_id, amount, self.settings.rehearsal_mode);
        info!(
            event_name = "dispatch.receipt.triggered",
            correlation_id = %correlation_id,
            deal_id = %request.deal_id,
            settlement_reference_id = %request.settlement_reference_id,
            rehearsal_mode = receipt.rehearsal_mode,
            "receipt automation triggered"
        );

        let (success, message, error) = match self.executor.execute(&receipt).await {
            Ok(result) => (result.success, result.message, result.error),
            Err(error) => {
                let error = ReconcileError::from(error);
                (false, "receipt automation failed".to_string(), Some(error.to_string()))
            }
        };

        let (state, ledger_message, audit_outcome) = if success {
            (DispatchState::Completed, message.clone(), AuditOutcome::Success)
        } else {
            let failure = error.clone().unwrap_or_else(|| message.clone());
            warn!(
                event_name = "dispatch.receipt.failed",
                correlation_id = %correlation_id,
                deal_id = %request.deal_id,
                settlement_reference_id = %request.settlement_reference_id,
                error = %failure,
                "receipt automation reported failure"
            );
            (DispatchState::Failed, failure, AuditOutcome::Failed)
        };
        self.ledger.finish(&key, state, Some(ledger_message), now).await?;

        self.audit.emit(
            AuditEvent::new(
                Some(request.deal_id.clone()),
                correlation_id,
                "dispatch.receipt.triggered",
                AuditCategory::Dispatch,
                "side_effect_dispatcher",
                audit_outcome,
            )
            .with_metadata("settlement_reference_id", request.settlement_reference_id.clone())
            .with_metadata("state", state.as_str()),
        );

        Ok(DispatchOutcome::Triggered {
            success,
            rehearsal: receipt.rehearsal_mode,
            message,
            error,
        })
    }

    /// Triggers the dispatch and writes its result onto the deal, queueing that write when
    /// the CRM is briefly unavailable.
    pub async fn dispatch_and_record(
        &self,
        request: &DispatchRequest,
        deal: &Deal,
        crm: &dyn CrmGateway,
        queue: &SyncQueue,
        correlation_id: &str,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome, StoreError> {
        let outcome = self.maybe_trigger(request, deal, correlation_id, now).await?;
        if let Some(intent) = record_intent(request, &outcome, now) {
            queue.write_or_enqueue(crm, &intent, None, correlation_id, now).await?;
        }
        Ok(outcome)
    }

    fn skipped(
        &self,
        request: &DispatchRequest,
        reason: SkipReason,
        correlation_id: &str,
    ) -> DispatchOutcome {
        info!(
            event_name = "dispatch.receipt.skipped",
            correlation_id = %correlation_id,
            deal_id = %request.deal_id,
            settlement_reference_id = %request.settlement_reference_id,
            reason = reason.as_str(),
            "receipt automation skipped"
        );
        DispatchOutcome::Skipped { reason }
    }
}

fn build_receipt(
    request: &DispatchRequest,
    deal: &Deal,
    matter_id: String,
    amount: rust_decimal::Decimal,
    rehearsal_mode: bool,
) -> ReceiptRequest {
    let description = match request.payment_method.or(deal.payment_method) {
        Some(PaymentMethod::CardProcessor) => "Card payment deposit",
        _ => "Bank Transfer deposit",
    };
    ReceiptRequest {
        deal_id: request.deal_id.clone(),
        matter_id,
        amount: amount.round_dp(2),
        payer_name: deal.payer_name(),
        date: request.settled_at.format("%d/%m/%Y").to_string(),
        reason: format!("On account of {}", request.deal_id),
        description: description.to_string(),
        rehearsal_mode,
    }
}

/// Deal properties recording a dispatch result. Skips leave the deal untouched.
pub fn record_intent(
    request: &DispatchRequest,
    outcome: &DispatchOutcome,
    now: DateTime<Utc>,
) -> Option<WriteIntent> {
    let DispatchOutcome::Triggered { success, message, error, .. } = outcome else {
        return None;
    };

    let patch = if *success {
        DealPatch {
            sync_status: Some(SyncStatus::Successful),
            sync_error: Some(String::new()),
            last_synced_at: Some(now),
            ..DealPatch::default()
        }
    } else {
        DealPatch {
            sync_status: Some(SyncStatus::Failed),
            sync_error: Some(error.clone().unwrap_or_else(|| message.clone())),
            ..DealPatch::default()
        }
    };
    Some(WriteIntent::new(request.deal_id.clone(), patch, "receipt automation result"))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;

    use super::{record_intent, DispatchSettings, SideEffectDispatcher};
    use crate::audit::InMemoryAuditSink;
    use crate::domain::deal::{Deal, DealId, DealStage, PaymentMethod, SyncStatus};
    use crate::domain::dispatch::{DispatchOutcome, DispatchRequest, DispatchState, SkipReason};
    use crate::errors::AutomationError;
    use crate::memory::{InMemoryDispatchLedger, RecordingReceiptExecutor};
    use crate::ports::DispatchLedger;

    struct Fixture {
        ledger: Arc<InMemoryDispatchLedger>,
        executor: Arc<RecordingReceiptExecutor>,
        dispatcher: SideEffectDispatcher,
    }

    fn fixture(settings: DispatchSettings) -> Fixture {
        let ledger = Arc::new(InMemoryDispatchLedger::default());
        let executor = Arc::new(RecordingReceiptExecutor::default());
        let dispatcher = SideEffectDispatcher::new(
            ledger.clone(),
            executor.clone(),
            Arc::new(InMemoryAuditSink::default()),
            settings,
        );
        Fixture { ledger, executor, dispatcher }
    }

    fn settled_deal() -> Deal {
        let mut deal = Deal::new(DealId("D-7".into()), DealStage::FundsProvided, Utc::now());
        deal.practice_matter_id = Some("ce2582fe".into());
        deal.payment_amount = Some(Decimal::new(8170, 2));
        deal.payer_first_name = Some("Logan".into());
        deal.payer_last_name = Some("Stanford".into());
        deal
    }

    fn request() -> DispatchRequest {
        DispatchRequest {
            deal_id: DealId("D-7".into()),
            settlement_reference_id: "po_1".into(),
            payment_method: Some(PaymentMethod::BankTransfer),
            settled_at: Utc.with_ymd_and_hms(2026, 2, 3, 10, 0, 0).single().expect("date"),
        }
    }

    #[tokio::test]
    async fn first_call_triggers_in_rehearsal_and_replay_skips() {
        let fx = fixture(DispatchSettings::default());

        let first = fx
            .dispatcher
            .maybe_trigger(&request(), &settled_deal(), "corr-1", Utc::now())
            .await
            .expect("dispatch");
        let second = fx
            .dispatcher
            .maybe_trigger(&request(), &settled_deal(), "corr-2", Utc::now())
            .await
            .expect("dispatch");

        assert!(first.is_triggered());
        assert_eq!(second, DispatchOutcome::Skipped { reason: SkipReason::AlreadyDispatched });

        let requests = fx.executor.requests().await;
        assert_eq!(requests.len(), 1);
        assert!(requests[0].rehearsal_mode);
        assert_eq!(requests[0].date, "03/02/2026");
        assert_eq!(requests[0].payer_name.as_deref(), Some("Stanford, Logan"));
        assert_eq!(requests[0].reason, "On account of D-7");
        assert_eq!(requests[0].description, "Bank Transfer deposit");
        assert_eq!(requests[0].amount, Decimal::new(8170, 2));

        let record = fx.ledger.find(&request().key()).await.expect("find").expect("record");
        assert_eq!(record.state, DispatchState::Completed);
    }

    #[tokio::test]
    async fn disabled_automation_skips_without_reserving() {
        let fx = fixture(DispatchSettings { enabled: false, rehearsal_mode: true });

        let outcome = fx
            .dispatcher
            .maybe_trigger(&request(), &settled_deal(), "corr-1", Utc::now())
            .await
            .expect("dispatch");

        assert_eq!(outcome, DispatchOutcome::Skipped { reason: SkipReason::AutomationDisabled });
        assert!(fx.ledger.records().await.is_empty());
    }

    #[tokio::test]
    async fn missing_matter_leaves_key_available_for_later() {
        let fx = fixture(DispatchSettings::default());
        let mut deal = settled_deal();
        deal.practice_matter_id = None;

        let skipped =
            fx.dispatcher.maybe_trigger(&request(), &deal, "corr-1", Utc::now()).await.expect("dispatch");
        assert_eq!(skipped, DispatchOutcome::Skipped { reason: SkipReason::MissingPracticeMatter });

        let triggered = fx
            .dispatcher
            .maybe_trigger(&request(), &settled_deal(), "corr-2", Utc::now())
            .await
            .expect("dispatch");
        assert!(triggered.is_triggered());
    }

    #[tokio::test]
    async fn automation_failure_is_recorded_and_still_blocks_retrigger() {
        let fx = fixture(DispatchSettings::default());
        fx.executor
            .respond_with(Err(AutomationError::Unavailable("browser session expired".into())))
            .await;

        let outcome = fx
            .dispatcher
            .maybe_trigger(&request(), &settled_deal(), "corr-1", Utc::now())
            .await
            .expect("dispatch");

        let intent = record_intent(&request(), &outcome, Utc::now()).expect("record intent");
        assert_eq!(intent.patch.sync_status, Some(SyncStatus::Failed));
        let sync_error = intent.patch.sync_error.as_deref().unwrap_or_default();
        assert!(sync_error.starts_with("downstream automation failure"), "{sync_error}");
        assert!(sync_error.contains("browser session"));
        assert_eq!(intent.patch.stage, None);
        assert_eq!(intent.patch.payment_status, None);

        let record = fx.ledger.find(&request().key()).await.expect("find").expect("record");
        assert_eq!(record.state, DispatchState::Failed);

        let replay = fx
            .dispatcher
            .maybe_trigger(&request(), &settled_deal(), "corr-2", Utc::now())
            .await
            .expect("dispatch");
        assert_eq!(replay, DispatchOutcome::Skipped { reason: SkipReason::AlreadyDispatched });
    }

    #[test]
    fn successful_dispatch_clears_sync_error() {
        let outcome = DispatchOutcome::Triggered {
            success: true,
            rehearsal: true,
            message: "filled".into(),
            error: None,
        };

        let intent = record_intent(&request(), &outcome, Utc::now()).expect("record intent");

        assert_eq!(intent.patch.sync_status, Some(SyncStatus::Successful));
        assert_eq!(intent.patch.sync_error.as_deref(), Some(""));
        assert!(record_intent(
            &request(),
            &DispatchOutcome::Skipped { reason: SkipReason::MissingAmount },
            Utc::now()
        )
        .is_none());
    }
}
