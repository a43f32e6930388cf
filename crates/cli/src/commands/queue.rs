use std::sync::Arc;

use chrono::{Duration, Utc};
use clap::Subcommand;
use dealsync_core::{
    DealId, StoreError, SyncItemStatus, SyncQueue, SyncQueueFilter, SyncRetryEngine,
};
use dealsync_db::{connect_with_config, SqlSyncQueueStore};
use serde::Serialize;
use serde_json::Value;

use crate::commands::{load_config, runtime, CommandResult};

#[derive(Debug, Clone, Subcommand)]
pub enum QueueCommand {
    #[command(about = "Count sync items per status")]
    Stats,
    #[command(about = "List sync items, oldest first")]
    List {
        #[arg(long, help = "queued | scheduled | completed | failed_manual_review")]
        status: Option<String>,
        #[arg(long, help = "Only items targeting this deal")]
        deal_id: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
    #[command(about = "Show the longest-waiting item in manual review")]
    OldestFailed,
    #[command(about = "Delete completed items last updated before the cutoff")]
    Prune {
        #[arg(long, default_value_t = 30)]
        older_than_days: u32,
    },
}

impl QueueCommand {
    fn name(&self) -> &'static str {
        match self {
            Self::Stats => "queue stats",
            Self::List { .. } => "queue list",
            Self::OldestFailed => "queue oldest-failed",
            Self::Prune { .. } => "queue prune",
        }
    }
}

#[derive(Debug)]
enum QueueFailure {
    Connect(String),
    Store(StoreError),
    Serialize(serde_json::Error),
}

pub fn run(command: QueueCommand) -> CommandResult {
    let name = command.name();

    let filter = match &command {
        QueueCommand::List { status, deal_id, limit } => {
            let status = match status.as_deref() {
                Some(raw) => match SyncItemStatus::parse(raw) {
                    Some(status) => Some(status),
                    None => {
                        return CommandResult::failure(
                            name,
                            "invalid_argument",
                            format!("unknown sync item status `{raw}`"),
                            7,
                        );
                    }
                },
                None => None,
            };
            SyncQueueFilter {
                status,
                deal_id: deal_id.clone().map(DealId),
                limit: Some((*limit).max(1)),
            }
        }
        _ => SyncQueueFilter::default(),
    };

    let config = match load_config(name) {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match runtime(name) {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    let result = runtime.block_on(async {
        let pool = connect_with_config(&config.database)
            .await
            .map_err(|error| QueueFailure::Connect(error.to_string()))?;
        let queue = SyncQueue::new(
            SyncRetryEngine::new(config.sync_queue_config()),
            Arc::new(SqlSyncQueueStore::new(pool.clone())),
        );
        let outcome = execute(&queue, &command, &filter).await;
        pool.close().await;
        outcome
    });

    match result {
        Ok((message, data)) => CommandResult::success_with_data(name, message, Some(data)),
        Err(QueueFailure::Connect(message)) => {
            CommandResult::failure(name, "db_connectivity", message, 4)
        }
        Err(QueueFailure::Store(error)) => {
            CommandResult::failure(name, "queue_store", error.to_string(), 6)
        }
        Err(QueueFailure::Serialize(error)) => {
            CommandResult::failure(name, "serialization", error.to_string(), 6)
        }
    }
}

async fn execute(
    queue: &SyncQueue,
    command: &QueueCommand,
    filter: &SyncQueueFilter,
) -> Result<(String, Value), QueueFailure> {
    match command {
        QueueCommand::Stats => {
            let stats = queue.stats().await.map_err(QueueFailure::Store)?;
            let message = format!(
                "{} queued, {} scheduled, {} completed, {} awaiting manual review",
                stats.queued, stats.scheduled, stats.completed, stats.failed_manual_review
            );
            Ok((message, to_data(&stats)?))
        }
        QueueCommand::List { .. } => {
            let items = queue.list(filter).await.map_err(QueueFailure::Store)?;
            Ok((format!("{} sync item(s)", items.len()), to_data(&items)?))
        }
        QueueCommand::OldestFailed => {
            let item = queue.oldest_failed().await.map_err(QueueFailure::Store)?;
            let message = match &item {
                Some(item) => format!(
                    "{} for deal {} queued at {}",
                    item.id,
                    item.deal_id,
                    item.created_at.to_rfc3339()
                ),
                None => "no items awaiting manual review".to_string(),
            };
            Ok((message, to_data(&item)?))
        }
        QueueCommand::Prune { older_than_days } => {
            let cutoff = Utc::now() - Duration::days(i64::from(*older_than_days));
            let removed = queue.prune(cutoff).await.map_err(QueueFailure::Store)?;
            Ok((
                format!("pruned {removed} completed item(s)"),
                Value::from(removed),
            ))
        }
    }
}

fn to_data<T: Serialize>(value: &T) -> Result<Value, QueueFailure> {
    serde_json::to_value(value).map_err(QueueFailure::Serialize)
}
