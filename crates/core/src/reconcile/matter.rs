use crate::domain::deal::{Deal, SyncStatus};
use crate::domain::event::{CanonicalEvent, EventPayload, Subject};
use crate::domain::intent::DealPatch;
use crate::errors::ReconcileError;
use crate::reconcile::{changed, payload_mismatch, DealAction, ReconciliationHandler};

/// Practice-management bookkeeping. Never proposes a stage.
pub struct MatterLifecycleHandler;

impl ReconciliationHandler for MatterLifecycleHandler {
    fn name(&self) -> &'static str {
        "matter_lifecycle_changed"
    }

    fn reconcile(
        &self,
        event: &CanonicalEvent,
        _subject: &Subject,
        deal: &Deal,
    ) -> Result<DealAction, ReconcileError> {
        let EventPayload::Matter(payload) = &event.payload else {
            return Err(payload_mismatch(event));
        };

        // A recorded receipt failure stays visible until a dispatch clears it.
        let sync_status = (deal.sync_status != SyncStatus::Failed).then_some(SyncStatus::Successful);
        let patch = DealPatch {
            practice_matter_id: changed(deal.practice_matter_id.as_ref(), Some(&payload.matter_id)),
            sync_status,
            last_synced_at: Some(event.received_at),
            ..DealPatch::default()
        };
        let reason = format!("practice {}", payload.change.as_str().replace('_', " "));
        Ok(DealAction::from_patch(deal, patch, &reason))
    }
}
