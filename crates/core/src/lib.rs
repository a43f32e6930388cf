pub mod audit;
pub mod config;
pub mod dispatch;
pub mod domain;
pub mod errors;
pub mod ingest;
pub mod locks;
pub mod memory;
pub mod ports;
pub mod reconcile;
pub mod retry_worker;
pub mod stage_guard;
pub mod sync_queue;

pub use audit::{AuditEvent, AuditSink, InMemoryAuditSink, TracingAuditSink};
pub use dispatch::{DispatchSettings, SideEffectDispatcher};
pub use domain::deal::{Deal, DealId, DealStage, PaymentMethod, PaymentStatus, SyncStatus};
pub use domain::event::{CanonicalEvent, CorrelationKey, EventKind, EventPayload, SourceSystem};
pub use domain::intent::{DealPatch, WriteIntent};
pub use domain::sync::{SyncItemId, SyncItemStatus, SyncQueueFilter, SyncQueueItem, SyncQueueStats};
pub use errors::{ApplicationError, DomainError, InterfaceError, ReconcileError, StoreError, WriteError};
pub use ingest::{EventGateway, GatewaySettings, InboundWebhook, IngestOutcome, WebhookSource};
pub use locks::DealLocks;
pub use ports::{CrmGateway, DispatchLedger, ReceiptAutomationExecutor, SyncQueueStore};
pub use reconcile::{DealOutcome, DealReport, HandlerRegistry, ReconcileReport, ReconciliationPipeline};
pub use retry_worker::{RetryOutcome, RetrySummary, SyncRetryWorker};
pub use stage_guard::{DenyReason, GuardDecision, StageGuard};
pub use sync_queue::{SyncQueue, SyncQueueConfig, SyncRetryEngine, WriteOutcome};
