use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink};
use crate::dispatch::SideEffectDispatcher;
use crate::domain::deal::{Deal, DealId};
use crate::domain::dispatch::DispatchOutcome;
use crate::domain::event::{CanonicalEvent, CorrelationKey, EventKind, SourceSystem, Subject};
use crate::domain::sync::SyncItemId;
use crate::errors::{ReconcileError, WriteError};
use crate::locks::DealLocks;
use crate::ports::CrmGateway;
use crate::reconcile::{DealAction, HandlerRegistry, ReconciliationHandler, StageProposal};
use crate::stage_guard::GuardDecision;
use crate::sync_queue::{SyncQueue, WriteOutcome};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DealOutcome {
    Applied,
    Unchanged,
    Denied,
    Ignored,
    QueuedForRetry,
    Rejected,
    Untracked,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DealReport {
    pub correlation_key: CorrelationKey,
    pub deal_id: Option<DealId>,
    pub outcome: DealOutcome,
    pub stage: Option<StageProposal>,
    pub sync_item_id: Option<SyncItemId>,
    pub dispatch: Option<DispatchOutcome>,
    pub detail: Option<String>,
}

impl DealReport {
    fn new(correlation_key: CorrelationKey) -> Self {
        Self {
            correlation_key,
            deal_id: None,
            outcome: DealOutcome::Unchanged,
            stage: None,
            sync_item_id: None,
            dispatch: None,
            detail: None,
        }
    }

    fn finish(mut self, outcome: DealOutcome, detail: Option<String>) -> Self {
        self.outcome = outcome;
        self.detail = detail;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub event_id: String,
    pub kind: EventKind,
    pub source: SourceSystem,
    pub deals: Vec<DealReport>,
}

/// Event → handler → stage guard → CRM write → dispatcher, with transient write
/// failures captured by the retry queue. Work for one deal runs under its lock.
pub struct ReconciliationPipeline {
    crm: Arc<dyn CrmGateway>,
    queue: Arc<SyncQueue>,
    dispatcher: Arc<SideEffectDispatcher>,
    registry: HandlerRegistry,
    locks: DealLocks,
    audit: Arc<dyn AuditSink>,
}

impl ReconciliationPipeline {
    pub fn new(
        crm: Arc<dyn CrmGateway>,
        queue: Arc<SyncQueue>,
        dispatcher: Arc<SideEffectDispatcher>,
        registry: HandlerRegistry,
        locks: DealLocks,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self { crm, queue, dispatcher, registry, locks, audit }
    }

    pub async fn process(&self, event: &CanonicalEvent) -> Result<ReconcileReport, ReconcileError> {
        let handler = self.registry.get(event.kind).ok_or_else(|| {
            ReconcileError::PermanentValidation(format!("no handler for `{}`", event.kind))
        })?;

        info!(
            event_name = "reconcile.event.received",
            correlation_id = %event.event_id,
            event_kind = %event.kind,
            source = event.source.as_str(),
            correlation_key = %event.correlation_key,
            "reconciling event"
        );

        let mut deals = Vec::new();
        for subject in event.subjects() {
            deals.push(self.process_subject(event, &subject, handler.as_ref()).await);
        }

        Ok(ReconcileReport { event_id: event.event_id.clone(), kind: event.kind, source: event.source, deals })
    }

    async fn resolve(&self, subject: &Subject) -> Result<Option<DealId>, WriteError> {
        if let Some(deal) = self.crm.find_deal(&subject.key).await? {
            return Ok(Some(deal.id));
        }
        match &subject.fallback {
            Some(fallback) => Ok(self.crm.find_deal(fallback).await?.map(|deal| deal.id)),
            None => Ok(None),
        }
    }

    async fn process_subject(
        &self,
        event: &CanonicalEvent,
        subject: &Subject,
        handler: &dyn ReconciliationHandler,
    ) -> DealReport {
        let correlation_id = event.event_id.as_str();
        let report = DealReport::new(subject.key.clone());

        let deal_id = match self.resolve(subject).await {
            Ok(Some(deal_id)) => deal_id,
            Ok(None) => return self.untracked(event, subject, report),
            Err(error) => {
                warn!(
                    event_name = "reconcile.deal.lookup_failed",
                    correlation_id = %correlation_id,
                    correlation_key = %subject.key,
                    error = %error,
                    "deal lookup failed"
                );
                return report.finish(DealOutcome::Failed, Some(error.to_string()));
            }
        };
        let mut report = DealReport { deal_id: Some(deal_id.clone()), ..report };

        let _guard = self.locks.acquire(&deal_id).await;
        let deal = match self.crm.fetch_deal(&deal_id).await {
            Ok(Some(deal)) => deal,
            Ok(None) => return self.untracked(event, subject, report),
            Err(error) => return report.finish(DealOutcome::Failed, Some(error.to_string())),
        };

        let action = match handler.reconcile(event, subject, &deal) {
            Ok(action) => action,
            Err(error) => {
                warn!(
                    event_name = "reconcile.event.rejected",
                    correlation_id = %correlation_id,
                    deal_id = %deal_id,
                    event_kind = %event.kind,
                    error_class = error.class(),
                    error = %error,
                    "handler rejected event"
                );
                return report.finish(DealOutcome::Rejected, Some(error.to_string()));
            }
        };
        report.stage = action.stage;

        if let Some(reason) = action.ignored.clone() {
            info!(
                event_name = "reconcile.event.ignored",
                correlation_id = %correlation_id,
                deal_id = %deal_id,
                event_kind = %event.kind,
                reason = %reason,
                "event acknowledged without changes"
            );
            return report.finish(DealOutcome::Ignored, Some(reason));
        }

        self.record_denial(event, &deal, &action);

        let now = Utc::now();
        let write = match &action.intent {
            Some(intent) => {
                let result = self
                    .queue
                    .write_or_enqueue(
                        self.crm.as_ref(),
                        intent,
                        action.dispatch.clone(),
                        correlation_id,
                        now,
                    )
                    .await;
                match result {
                    Ok(write) => write,
                    Err(error) => {
                        warn!(
                            event_name = "reconcile.write.enqueue_failed",
                            correlation_id = %correlation_id,
                            deal_id = %deal_id,
                            error = %error,
                            "could not capture failed write for retry"
                        );
                        return report.finish(DealOutcome::Failed, Some(error.to_string()));
                    }
                }
            }
            None => WriteOutcome::Unchanged,
        };

        let mut updated = deal.clone();
        if let (WriteOutcome::Applied, Some(intent)) = (&write, &action.intent) {
            self.record_transition(event, &deal, &action);
            if let Err(error) = updated.apply_properties(&intent.properties()) {
                warn!(
                    event_name = "reconcile.deal.local_apply_failed",
                    correlation_id = %correlation_id,
                    deal_id = %deal_id,
                    error = %error,
                    "applied write could not be mirrored locally"
                );
            }
        }

        // Queued writes carry the dispatch request and run it once they land.
        let dispatch_now = matches!(write, WriteOutcome::Applied | WriteOutcome::Unchanged);
        if let (Some(request), true) = (&action.dispatch, dispatch_now) {
            match self
                .dispatcher
                .dispatch_and_record(
                    request,
                    &updated,
                    self.crm.as_ref(),
                    &self.queue,
                    correlation_id,
                    now,
                )
                .await
            {
                Ok(outcome) => report.dispatch = Some(outcome),
                Err(error) => {
                    warn!(
                        event_name = "dispatch.receipt.ledger_failed",
                        correlation_id = %correlation_id,
                        deal_id = %deal_id,
                        error = %error,
                        "dispatch ledger unavailable"
                    );
                    report.detail = Some(error.to_string());
                }
            }
        }

        let denied = action.stage.is_some_and(|stage| !stage.decision.is_allowed());
        match write {
            WriteOutcome::Rejected(message) => {
                report.finish(DealOutcome::Rejected, Some(message))
            }
            WriteOutcome::Queued(item_id) => {
                report.sync_item_id = Some(item_id);
                let detail = report.detail.take();
                report.finish(DealOutcome::QueuedForRetry, detail)
            }
            WriteOutcome::Applied => {
                let detail = report.detail.take();
                report.finish(DealOutcome::Applied, detail)
            }
            WriteOutcome::Unchanged if denied => {
                let detail = report.detail.take().or_else(|| denial_detail(action.stage));
                report.finish(DealOutcome::Denied, detail)
            }
            WriteOutcome::Unchanged => {
                let detail = report.detail.take();
                report.finish(DealOutcome::Unchanged, detail)
            }
        }
    }

    fn untracked(&self, event: &CanonicalEvent, subject: &Subject, report: DealReport) -> DealReport {
        let error = ReconcileError::UntrackedEvent(subject.key.to_string());
        info!(
            event_name = "reconcile.event.untracked",
            correlation_id = %event.event_id,
            event_kind = %event.kind,
            correlation_key = %subject.key,
            "no tracked deal for event, dropping"
        );
        report.finish(DealOutcome::Untracked, Some(error.to_string()))
    }

    fn record_denial(&self, event: &CanonicalEvent, deal: &Deal, action: &DealAction) {
        let Some(StageProposal { proposed, decision: GuardDecision::Deny(reason) }) = action.stage
        else {
            return;
        };
        warn!(
            event_name = "reconcile.stage.denied",
            correlation_id = %event.event_id,
            deal_id = %deal.id,
            event_kind = %event.kind,
            current_stage = deal.stage.as_str(),
            proposed_stage = proposed.as_str(),
            reason = %reason,
            "stage transition denied"
        );
        self.audit.emit(
            AuditEvent::new(
                Some(deal.id.clone()),
                event.event_id.clone(),
                "reconcile.stage.denied",
                AuditCategory::Reconcile,
                event.source.as_str(),
                AuditOutcome::Rejected,
            )
            .with_metadata("current", deal.stage.as_str())
            .with_metadata("proposed", proposed.as_str())
            .with_metadata("reason", reason.to_string()),
        );
    }

    fn record_transition(&self, event: &CanonicalEvent, deal: &Deal, action: &DealAction) {
        let Some(to) = action.intent.as_ref().and_then(|intent| intent.patch.stage) else {
            return;
        };
        info!(
            event_name = "reconcile.stage.applied",
            correlation_id = %event.event_id,
            deal_id = %deal.id,
            event_kind = %event.kind,
            from_stage = deal.stage.as_str(),
            to_stage = to.as_str(),
            "stage advanced"
        );
        self.audit.emit(
            AuditEvent::new(
                Some(deal.id.clone()),
                event.event_id.clone(),
                "reconcile.stage.applied",
                AuditCategory::Reconcile,
                event.source.as_str(),
                AuditOutcome::Success,
            )
            .with_metadata("from", deal.stage.as_str())
            .with_metadata("to", to.as_str()),
        );
    }
}

fn denial_detail(stage: Option<StageProposal>) -> Option<String> {
    match stage {
        Some(StageProposal { decision: GuardDecision::Deny(reason), .. }) => Some(reason.to_string()),
        _ => None,
    }
}
