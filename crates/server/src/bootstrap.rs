use std::sync::Arc;
use std::time::Duration;

use dealsync_core::config::{AppConfig, ConfigError, CrmMode, LoadOptions};
use dealsync_core::ports::{CrmGateway, DisabledReceiptExecutor, ReceiptAutomationExecutor};
use dealsync_core::{
    AuditSink, DealLocks, EventGateway, HandlerRegistry, ReconciliationPipeline,
    SideEffectDispatcher, SyncQueue, SyncRetryEngine, SyncRetryWorker, TracingAuditSink,
};
use dealsync_db::{
    connect_with_config, migrations, DbPool, SqlDealRepository, SqlDispatchLedger,
    SqlSyncQueueStore,
};
use secrecy::SecretString;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::automation::HttpReceiptExecutor;
use crate::crm::{CrmClientError, HttpCrmClient};

/// Shared handles for the HTTP routes.
#[derive(Clone)]
pub struct AppState {
    pub db_pool: DbPool,
    pub gateway: Arc<EventGateway>,
    pub pipeline: Arc<ReconciliationPipeline>,
    pub queue: Arc<SyncQueue>,
    pub crm: Arc<dyn CrmGateway>,
    pub admin_token: Option<SecretString>,
}

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub state: AppState,
    pub worker: Arc<SyncRetryWorker>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error(transparent)]
    Crm(#[from] CrmClientError),
    #[error("receipt automation client failed: {0}")]
    Automation(#[source] reqwest::Error),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool = connect_with_config(&config.database)
        .await
        .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let crm: Arc<dyn CrmGateway> = match config.crm.mode {
        CrmMode::Local => Arc::new(SqlDealRepository::new(db_pool.clone())),
        CrmMode::Http => {
            Arc::new(HttpCrmClient::from_config(&config.crm, &config.esign.document_types)?)
        }
    };

    let executor: Arc<dyn ReceiptAutomationExecutor> =
        match (config.automation.enabled, config.automation.base_url.as_deref()) {
            (true, Some(base_url)) => Arc::new(
                HttpReceiptExecutor::new(
                    base_url,
                    Duration::from_secs(config.automation.timeout_secs),
                )
                .map_err(BootstrapError::Automation)?,
            ),
            _ => Arc::new(DisabledReceiptExecutor),
        };

    let audit: Arc<dyn AuditSink> = Arc::new(TracingAuditSink);
    let locks = DealLocks::default();
    let queue = Arc::new(SyncQueue::new(
        SyncRetryEngine::new(config.sync_queue_config()),
        Arc::new(SqlSyncQueueStore::new(db_pool.clone())),
    ));
    let dispatcher = Arc::new(SideEffectDispatcher::new(
        Arc::new(SqlDispatchLedger::new(db_pool.clone())),
        executor,
        audit.clone(),
        config.dispatch_settings(),
    ));
    let pipeline = Arc::new(ReconciliationPipeline::new(
        crm.clone(),
        queue.clone(),
        dispatcher.clone(),
        HandlerRegistry::standard(&config.handler_settings()),
        locks.clone(),
        audit.clone(),
    ));
    let worker = Arc::new(
        SyncRetryWorker::new(
            crm.clone(),
            queue.clone(),
            dispatcher,
            locks,
            audit,
            format!("worker-{}", Uuid::new_v4().simple()),
        )
        .with_batch_size(config.sync_queue.batch_size),
    );

    let unconfigured = config.unconfigured_webhook_sources();
    if !unconfigured.is_empty() {
        tracing::warn!(
            event_name = "system.bootstrap.webhooks_unconfigured",
            correlation_id = "bootstrap",
            sources = %unconfigured.join(","),
            "webhook sources without secrets will reject every delivery"
        );
    }

    let state = AppState {
        db_pool: db_pool.clone(),
        gateway: Arc::new(EventGateway::new(config.gateway_settings())),
        pipeline,
        queue,
        crm,
        admin_token: config.server.admin_token.clone(),
    };

    Ok(Application { config, db_pool, state, worker })
}
