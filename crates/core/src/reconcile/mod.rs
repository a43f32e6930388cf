//! Reconciliation handlers and the registry that routes canonical events to them.
//!
//! Handlers are pure: given an event, the subject it concerns and the deal as
//! currently persisted, they return the patch to write, the stage proposal and
//! its guard decision, and any side effect to dispatch. All I/O happens in
//! [`pipeline::ReconciliationPipeline`].

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::domain::deal::{Deal, DealStage};
use crate::domain::dispatch::DispatchRequest;
use crate::domain::event::{CanonicalEvent, EventKind, Subject};
use crate::domain::intent::{DealPatch, WriteIntent};
use crate::errors::ReconcileError;
use crate::stage_guard::GuardDecision;

pub mod envelope;
pub mod matter;
pub mod payment;
pub mod pipeline;

pub use envelope::{EnvelopeCompletedHandler, SignerCompletedHandler};
pub use matter::MatterLifecycleHandler;
pub use payment::{AuthorizationHandler, PaymentStoppedHandler, SettlementHandler};
pub use pipeline::{DealOutcome, DealReport, ReconcileReport, ReconciliationPipeline};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageProposal {
    pub proposed: DealStage,
    pub decision: GuardDecision,
}

impl StageProposal {
    /// Allowed and actually moves the deal.
    pub fn advances(&self, current: DealStage) -> bool {
        self.decision.is_allowed() && self.proposed != current
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DealAction {
    pub intent: Option<WriteIntent>,
    pub stage: Option<StageProposal>,
    pub dispatch: Option<DispatchRequest>,
    /// Set when the event is acknowledged but has nothing to do for this deal.
    pub ignored: Option<String>,
}

impl DealAction {
    pub fn ignored(reason: impl Into<String>) -> Self {
        Self { ignored: Some(reason.into()), ..Self::default() }
    }

    /// Builds the action from a patch, dropping it when there is nothing to write.
    pub fn from_patch(deal: &Deal, patch: DealPatch, reason: &str) -> Self {
        let intent = (!patch.is_empty()).then(|| WriteIntent::new(deal.id.clone(), patch, reason));
        Self { intent, ..Self::default() }
    }

    pub fn with_stage(mut self, stage: Option<StageProposal>) -> Self {
        self.stage = stage;
        self
    }

    pub fn with_dispatch(mut self, dispatch: Option<DispatchRequest>) -> Self {
        self.dispatch = dispatch;
        self
    }
}

pub trait ReconciliationHandler: Send + Sync {
    fn name(&self) -> &'static str;

    fn reconcile(
        &self,
        event: &CanonicalEvent,
        subject: &Subject,
        deal: &Deal,
    ) -> Result<DealAction, ReconcileError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandlerSettings {
    /// Envelope document type whose completion closes the deal.
    pub final_document_type: String,
}

impl Default for HandlerSettings {
    fn default() -> Self {
        Self { final_document_type: "final_agreement".to_string() }
    }
}

/// One handler per event kind.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<EventKind, Arc<dyn ReconciliationHandler>>,
}

impl HandlerRegistry {
    pub fn standard(settings: &HandlerSettings) -> Self {
        let settlement: Arc<dyn ReconciliationHandler> = Arc::new(SettlementHandler);
        let stopped: Arc<dyn ReconciliationHandler> = Arc::new(PaymentStoppedHandler);

        let mut registry = Self::default();
        registry.register(EventKind::PaymentAuthorized, Arc::new(AuthorizationHandler));
        registry.register(EventKind::PaymentSettled, settlement.clone());
        registry.register(EventKind::PropertyStatusConfirmed, settlement);
        registry.register(EventKind::PaymentFailed, stopped.clone());
        registry.register(EventKind::PaymentCanceled, stopped);
        registry.register(EventKind::EnvelopeSignerCompleted, Arc::new(SignerCompletedHandler));
        registry.register(
            EventKind::EnvelopeFullyCompleted,
            Arc::new(EnvelopeCompletedHandler::new(settings.final_document_type.clone())),
        );
        registry.register(EventKind::MatterLifecycleChanged, Arc::new(MatterLifecycleHandler));
        registry
    }

    pub fn register(&mut self, kind: EventKind, handler: Arc<dyn ReconciliationHandler>) {
        self.handlers.insert(kind, handler);
    }

    pub fn get(&self, kind: EventKind) -> Option<Arc<dyn ReconciliationHandler>> {
        self.handlers.get(&kind).cloned()
    }
}

pub(crate) fn payload_mismatch(event: &CanonicalEvent) -> ReconcileError {
    ReconcileError::PermanentValidation(format!(
        "event `{}` of kind `{}` carries an unexpected payload",
        event.event_id, event.kind
    ))
}

/// `Some(value)` only when it differs from what the deal already stores.
pub(crate) fn changed<T: PartialEq + Clone>(current: Option<&T>, next: Option<&T>) -> Option<T> {
    match next {
        Some(value) if current != Some(value) => Some(value.clone()),
        _ => None,
    }
}
