use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::domain::deal::{Deal, DealStage, PaymentMethod, PaymentStatus};
use crate::domain::dispatch::DispatchRequest;
use crate::domain::event::{CanonicalEvent, EventKind, EventPayload, Subject};
use crate::domain::intent::DealPatch;
use crate::errors::ReconcileError;
use crate::reconcile::{changed, payload_mismatch, DealAction, ReconciliationHandler, StageProposal};
use crate::stage_guard::StageGuard;

/// Funds authorized by the card processor but not yet paid out.
pub struct AuthorizationHandler;

impl ReconciliationHandler for AuthorizationHandler {
    fn name(&self) -> &'static str {
        "payment_authorized"
    }

    fn reconcile(
        &self,
        event: &CanonicalEvent,
        _subject: &Subject,
        deal: &Deal,
    ) -> Result<DealAction, ReconcileError> {
        let EventPayload::Authorization(payload) = &event.payload else {
            return Err(payload_mismatch(event));
        };

        let patch = DealPatch {
            payment_status: deal
                .payment_status
                .permits(PaymentStatus::Pending)
                .then_some(PaymentStatus::Pending),
            payment_method: deal.payment_method.is_none().then_some(PaymentMethod::CardProcessor),
            settlement_reference_id: changed(
                deal.settlement_reference_id.as_ref(),
                Some(&payload.reference_id),
            ),
            payment_amount: changed(deal.payment_amount.as_ref(), Some(&payload.gross_amount)),
            processor_fee: changed(deal.processor_fee.as_ref(), Some(&payload.processor_fee)),
            net_amount: changed(deal.net_amount.as_ref(), Some(&payload.net_amount)),
            ..DealPatch::default()
        };

        Ok(DealAction::from_patch(deal, patch, "payment authorized"))
    }
}

/// Funds landed. Serves both processor payouts and CRM-confirmed deferred payments.
pub struct SettlementHandler;

struct Settlement {
    reference_id: String,
    method: Option<PaymentMethod>,
    amount: Option<Decimal>,
    settled_at: DateTime<Utc>,
}

impl SettlementHandler {
    fn settlement(
        event: &CanonicalEvent,
        subject: &Subject,
        deal: &Deal,
    ) -> Result<Settlement, ReconcileError> {
        match &event.payload {
            EventPayload::Settlement(payload) => {
                let authorization = payload.authorizations.get(subject.item).ok_or_else(|| {
                    ReconcileError::PermanentValidation(format!(
                        "payout `{}` has no authorization at position {}",
                        payload.payout_id, subject.item
                    ))
                })?;
                Ok(Settlement {
                    reference_id: authorization.reference_id.clone(),
                    method: Some(deal.payment_method.unwrap_or(PaymentMethod::CardProcessor)),
                    amount: authorization.amount,
                    settled_at: payload.settled_at,
                })
            }
            EventPayload::PropertyConfirmed(payload) => {
                let method = payload.payment_method.or(deal.payment_method);
                let reference_id = payload
                    .reference_id
                    .clone()
                    .or_else(|| deal.settlement_reference_id.clone())
                    .unwrap_or_else(|| {
                        let method = method.map_or("manual", PaymentMethod::as_str);
                        format!("{method}:{}", deal.id)
                    });
                Ok(Settlement {
                    reference_id,
                    method,
                    amount: None,
                    settled_at: payload.confirmed_at,
                })
            }
            _ => Err(payload_mismatch(event)),
        }
    }
}

impl ReconciliationHandler for SettlementHandler {
    fn name(&self) -> &'static str {
        "payment_settled"
    }

    fn reconcile(
        &self,
        event: &CanonicalEvent,
        subject: &Subject,
        deal: &Deal,
    ) -> Result<DealAction, ReconcileError> {
        let settlement = Self::settlement(event, subject, deal)?;

        let decision = StageGuard::evaluate(deal.snapshot(), DealStage::FundsProvided);
        let proposal = StageProposal { proposed: DealStage::FundsProvided, decision };

        let patch = DealPatch {
            stage: proposal.advances(deal.stage).then_some(DealStage::FundsProvided),
            payment_status: deal
                .payment_status
                .permits(PaymentStatus::Paid)
                .then_some(PaymentStatus::Paid),
            payment_method: changed(deal.payment_method.as_ref(), settlement.method.as_ref()),
            settlement_reference_id: deal
                .settlement_reference_id
                .is_none()
                .then(|| settlement.reference_id.clone()),
            payment_amount: match deal.payment_amount {
                Some(_) => None,
                None => settlement.amount,
            },
            ..DealPatch::default()
        };

        // Funds landing is what the receipt records, so a deal already past
        // FundsProvided still gets its one dispatch.
        let dispatch_allowed = decision.is_allowed()
            || deal.stage.index() > DealStage::FundsProvided.index();
        let dispatch = dispatch_allowed.then(|| DispatchRequest {
            deal_id: deal.id.clone(),
            settlement_reference_id: settlement.reference_id.clone(),
            payment_method: settlement.method,
            settled_at: settlement.settled_at,
        });

        let reason = match event.kind {
            EventKind::PropertyStatusConfirmed => "payment confirmed in crm",
            _ => "payment settled",
        };
        Ok(DealAction::from_patch(deal, patch, reason)
            .with_stage(Some(proposal))
            .with_dispatch(dispatch))
    }
}

/// Authorization failed or was canceled. Records the status and reason only.
pub struct PaymentStoppedHandler;

impl ReconciliationHandler for PaymentStoppedHandler {
    fn name(&self) -> &'static str {
        "payment_stopped"
    }

    fn reconcile(
        &self,
        event: &CanonicalEvent,
        _subject: &Subject,
        deal: &Deal,
    ) -> Result<DealAction, ReconcileError> {
        let EventPayload::PaymentStopped(payload) = &event.payload else {
            return Err(payload_mismatch(event));
        };
        let status = match event.kind {
            EventKind::PaymentCanceled => PaymentStatus::Canceled,
            _ => PaymentStatus::Failed,
        };

        if !deal.payment_status.permits(status) {
            return Ok(DealAction::ignored(format!(
                "payment status `{}` cannot move to `{}`",
                deal.payment_status.as_str(),
                status.as_str()
            )));
        }

        let patch = DealPatch {
            payment_status: Some(status),
            payment_failure_reason: Some(payload.reason.clone()),
            settlement_reference_id: deal
                .settlement_reference_id
                .is_none()
                .then(|| payload.reference_id.clone()),
            ..DealPatch::default()
        };
        Ok(DealAction::from_patch(deal, patch, format!("payment {}", status.as_str()).as_str()))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rust_decimal::Decimal;

    use super::{AuthorizationHandler, PaymentStoppedHandler, SettlementHandler};
    use crate::domain::deal::{Deal, DealId, DealStage, PaymentMethod, PaymentStatus};
    use crate::domain::event::{
        AuthorizationPayload, CanonicalEvent, CorrelationKey, EventKind, EventPayload,
        PaymentStoppedPayload, PropertyConfirmationPayload, SettledAuthorization,
        SettlementPayload, SourceSystem,
    };
    use crate::reconcile::ReconciliationHandler;
    use crate::stage_guard::{DenyReason, GuardDecision};

    fn deal(stage: DealStage, payment_status: PaymentStatus) -> Deal {
        let mut deal = Deal::new(DealId("D-1".into()), stage, Utc::now());
        deal.payment_status = payment_status;
        deal
    }

    fn event(kind: EventKind, payload: EventPayload) -> CanonicalEvent {
        CanonicalEvent::new(
            Some("evt_1".into()),
            kind,
            SourceSystem::PaymentProcessor,
            CorrelationKey::SettlementReference("pi_1".into()),
            payload,
            Utc::now(),
        )
    }

    fn authorized() -> CanonicalEvent {
        event(
            EventKind::PaymentAuthorized,
            EventPayload::Authorization(AuthorizationPayload {
                reference_id: "pi_1".into(),
                deal_hint: Some(DealId("D-1".into())),
                gross_amount: Decimal::new(9500, 0),
                processor_fee: Decimal::new(27580, 2),
                net_amount: Decimal::new(922420, 2),
                currency: "aud".into(),
            }),
        )
    }

    fn settled() -> CanonicalEvent {
        event(
            EventKind::PaymentSettled,
            EventPayload::Settlement(SettlementPayload {
                payout_id: "po_1".into(),
                settled_at: Utc::now(),
                authorizations: vec![SettledAuthorization {
                    reference_id: "pi_1".into(),
                    deal_hint: Some(DealId("D-1".into())),
                    amount: Some(Decimal::new(9500, 0)),
                }],
            }),
        )
    }

    #[test]
    fn authorization_sets_pending_and_amounts_without_stage_change() {
        let event = authorized();
        let subject = &event.subjects()[0];

        let action = AuthorizationHandler
            .reconcile(&event, subject, &deal(DealStage::DocumentsSent, PaymentStatus::Unset))
            .expect("reconcile");

        let intent = action.intent.expect("intent");
        assert_eq!(intent.patch.payment_status, Some(PaymentStatus::Pending));
        assert_eq!(intent.patch.settlement_reference_id.as_deref(), Some("pi_1"));
        assert_eq!(intent.patch.payment_amount, Some(Decimal::new(9500, 0)));
        assert_eq!(intent.patch.stage, None);
        assert!(action.stage.is_none());
        assert!(action.dispatch.is_none());
    }

    #[test]
    fn authorization_after_settlement_keeps_paid() {
        let event = authorized();
        let subject = &event.subjects()[0];
        let mut current = deal(DealStage::FundsProvided, PaymentStatus::Paid);
        current.settlement_reference_id = Some("pi_1".into());

        let action = AuthorizationHandler.reconcile(&event, subject, &current).expect("reconcile");

        let intent = action.intent.expect("amounts still recorded");
        assert_eq!(intent.patch.payment_status, None);
        assert_eq!(intent.patch.settlement_reference_id, None);
    }

    #[test]
    fn settlement_marks_paid_advances_and_requests_dispatch() {
        let event = settled();
        let subject = &event.subjects()[0];

        let action = SettlementHandler
            .reconcile(&event, subject, &deal(DealStage::DocumentsSent, PaymentStatus::Pending))
            .expect("reconcile");

        let intent = action.intent.expect("intent");
        assert_eq!(intent.patch.payment_status, Some(PaymentStatus::Paid));
        assert_eq!(intent.patch.stage, Some(DealStage::FundsProvided));
        let dispatch = action.dispatch.expect("dispatch");
        assert_eq!(dispatch.settlement_reference_id, "pi_1");
    }

    #[test]
    fn replayed_settlement_writes_nothing_new_but_still_asks_dispatcher() {
        let event = settled();
        let subject = &event.subjects()[0];
        let mut current = deal(DealStage::FundsProvided, PaymentStatus::Paid);
        current.settlement_reference_id = Some("pi_1".into());
        current.payment_method = Some(PaymentMethod::CardProcessor);
        current.payment_amount = Some(Decimal::new(9500, 0));

        let action = SettlementHandler.reconcile(&event, subject, &current).expect("reconcile");

        assert!(action.intent.is_none());
        assert!(action.dispatch.is_some());
    }

    #[test]
    fn settlement_on_closed_deal_keeps_stage_and_still_dispatches() {
        let event = settled();
        let subject = &event.subjects()[0];

        let action = SettlementHandler
            .reconcile(&event, subject, &deal(DealStage::Closed, PaymentStatus::Pending))
            .expect("reconcile");

        let proposal = action.stage.expect("proposal");
        assert!(matches!(proposal.decision, GuardDecision::Deny(DenyReason::Regression { .. })));
        assert_eq!(action.intent.expect("intent").patch.stage, None);
        assert!(action.dispatch.is_some());
    }

    #[test]
    fn crm_confirmation_derives_reference_from_method() {
        let event = CanonicalEvent::new(
            None,
            EventKind::PropertyStatusConfirmed,
            SourceSystem::Crm,
            CorrelationKey::Deal(DealId("D-1".into())),
            EventPayload::PropertyConfirmed(PropertyConfirmationPayload {
                deal_id: DealId("D-1".into()),
                payment_method: Some(PaymentMethod::BankTransfer),
                reference_id: None,
                confirmed_at: Utc::now(),
            }),
            Utc::now(),
        );
        let subject = &event.subjects()[0];

        let action = SettlementHandler
            .reconcile(&event, subject, &deal(DealStage::FundsRequested, PaymentStatus::Paid))
            .expect("reconcile");

        let dispatch = action.dispatch.expect("dispatch");
        assert_eq!(dispatch.settlement_reference_id, "bank_transfer:D-1");
        assert_eq!(dispatch.payment_method, Some(PaymentMethod::BankTransfer));
        let intent = action.intent.expect("intent");
        assert_eq!(intent.patch.stage, Some(DealStage::FundsProvided));
        assert_eq!(intent.reason, "payment confirmed in crm");
    }

    #[test]
    fn failure_records_reason_but_never_overrides_paid() {
        let event = event(
            EventKind::PaymentFailed,
            EventPayload::PaymentStopped(PaymentStoppedPayload {
                reference_id: "pi_1".into(),
                deal_hint: None,
                reason: "card_declined".into(),
            }),
        );
        let subject = &event.subjects()[0];

        let pending = PaymentStoppedHandler
            .reconcile(&event, subject, &deal(DealStage::DocumentsSent, PaymentStatus::Pending))
            .expect("reconcile");
        let intent = pending.intent.expect("intent");
        assert_eq!(intent.patch.payment_status, Some(PaymentStatus::Failed));
        assert_eq!(intent.patch.payment_failure_reason.as_deref(), Some("card_declined"));
        assert_eq!(intent.patch.stage, None);

        let paid = PaymentStoppedHandler
            .reconcile(&event, subject, &deal(DealStage::FundsProvided, PaymentStatus::Paid))
            .expect("reconcile");
        assert!(paid.intent.is_none());
        assert!(paid.ignored.is_some());
    }

    #[test]
    fn mismatched_payload_is_a_permanent_validation_error() {
        let event = event(
            EventKind::PaymentAuthorized,
            EventPayload::PaymentStopped(PaymentStoppedPayload {
                reference_id: "pi_1".into(),
                deal_hint: None,
                reason: "n/a".into(),
            }),
        );
        let subject = &event.subjects()[0];

        let result = AuthorizationHandler.reconcile(
            &event,
            subject,
            &deal(DealStage::DocumentsSent, PaymentStatus::Unset),
        );
        assert!(matches!(result, Err(crate::errors::ReconcileError::PermanentValidation(_))));
    }
}
