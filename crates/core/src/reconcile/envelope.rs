use std::collections::BTreeMap;

use crate::domain::deal::{Deal, DealStage};
use crate::domain::event::{CanonicalEvent, EventPayload, Subject};
use crate::domain::intent::DealPatch;
use crate::errors::ReconcileError;
use crate::reconcile::{payload_mismatch, DealAction, ReconciliationHandler, StageProposal};
use crate::stage_guard::StageGuard;

/// Only the first signer's completion moves the deal; later signers are informational.
const AUTHORITATIVE_ROUTING_ORDER: u32 = 1;

fn envelope_ids(deal: &Deal, document_type: Option<&str>, envelope_id: &str) -> BTreeMap<String, String> {
    let mut ids = BTreeMap::new();
    if let Some(document_type) = document_type.filter(|value| !value.trim().is_empty()) {
        if deal.envelope_id(document_type) != Some(envelope_id) {
            ids.insert(document_type.to_string(), envelope_id.to_string());
        }
    }
    ids
}

pub struct SignerCompletedHandler;

impl ReconciliationHandler for SignerCompletedHandler {
    fn name(&self) -> &'static str {
        "envelope_signer_completed"
    }

    fn reconcile(
        &self,
        event: &CanonicalEvent,
        _subject: &Subject,
        deal: &Deal,
    ) -> Result<DealAction, ReconcileError> {
        let EventPayload::SignerCompleted(payload) = &event.payload else {
            return Err(payload_mismatch(event));
        };
        if payload.routing_order != AUTHORITATIVE_ROUTING_ORDER {
            return Ok(DealAction::ignored(format!(
                "routing order {} is not authoritative",
                payload.routing_order
            )));
        }

        let decision = StageGuard::evaluate(deal.snapshot(), DealStage::FundsRequested);
        let proposal = StageProposal { proposed: DealStage::FundsRequested, decision };

        let patch = DealPatch {
            stage: proposal.advances(deal.stage).then_some(DealStage::FundsRequested),
            envelope_ids: envelope_ids(deal, payload.document_type.as_deref(), &payload.envelope_id),
            ..DealPatch::default()
        };
        Ok(DealAction::from_patch(deal, patch, "signer completed").with_stage(Some(proposal)))
    }
}

pub struct EnvelopeCompletedHandler {
    final_document_type: String,
}

impl EnvelopeCompletedHandler {
    pub fn new(final_document_type: impl Into<String>) -> Self {
        Self { final_document_type: final_document_type.into() }
    }
}

impl ReconciliationHandler for EnvelopeCompletedHandler {
    fn name(&self) -> &'static str {
        "envelope_fully_completed"
    }

    fn reconcile(
        &self,
        event: &CanonicalEvent,
        _subject: &Subject,
        deal: &Deal,
    ) -> Result<DealAction, ReconcileError> {
        let EventPayload::EnvelopeCompleted(payload) = &event.payload else {
            return Err(payload_mismatch(event));
        };

        let is_final = payload
            .document_type
            .as_deref()
            .is_some_and(|document_type| document_type.eq_ignore_ascii_case(&self.final_document_type));

        // Closing ignores the funds-in-flight rule; only regression applies.
        let proposal = is_final.then(|| StageProposal {
            proposed: DealStage::Closed,
            decision: StageGuard::evaluate_terminal(deal.snapshot(), DealStage::Closed),
        });

        let patch = DealPatch {
            stage: proposal
                .filter(|proposal| proposal.advances(deal.stage))
                .map(|proposal| proposal.proposed),
            envelope_ids: envelope_ids(deal, payload.document_type.as_deref(), &payload.envelope_id),
            ..DealPatch::default()
        };

        let action = DealAction::from_patch(deal, patch, "envelope completed").with_stage(proposal);
        if action.intent.is_none() && action.stage.is_none() {
            return Ok(DealAction::ignored("envelope already recorded"));
        }
        Ok(action)
    }
}
