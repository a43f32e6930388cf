use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use dealsync_core::domain::deal::DealId;
use dealsync_core::domain::sync::{
    SyncItemId, SyncItemStatus, SyncQueueFilter, SyncQueueItem, SyncQueueStats,
};
use dealsync_core::errors::StoreError;
use dealsync_core::ports::SyncQueueStore;

use super::{
    parse_json, parse_optional_timestamp, parse_timestamp, parse_u32, to_json, RepositoryError,
};
use crate::DbPool;

const ITEM_COLUMNS: &str = "id,
    deal_id,
    write_intent_json,
    follow_up_json,
    attempts,
    max_attempts,
    retry_intervals_json,
    status,
    history_json,
    next_attempt_at,
    last_error,
    claimed_by,
    claimed_at,
    state_version,
    correlation_id,
    created_at,
    updated_at";

/// Queue timestamps are compared as text, so they are written with a fixed precision.
fn sortable(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub struct SqlSyncQueueStore {
    pool: DbPool,
}

impl SqlSyncQueueStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn upsert(&self, item: &SyncQueueItem) -> Result<(), RepositoryError> {
        let follow_up_json =
            item.follow_up.as_ref().map(|follow_up| to_json("follow_up_json", follow_up)).transpose()?;

        sqlx::query(&format!(
            "INSERT INTO sync_queue_item ({ITEM_COLUMNS})
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                deal_id = excluded.deal_id,
                write_intent_json = excluded.write_intent_json,
                follow_up_json = excluded.follow_up_json,
                attempts = excluded.attempts,
                max_attempts = excluded.max_attempts,
                retry_intervals_json = excluded.retry_intervals_json,
                status = excluded.status,
                history_json = excluded.history_json,
                next_attempt_at = excluded.next_attempt_at,
                last_error = excluded.last_error,
                claimed_by = excluded.claimed_by,
                claimed_at = excluded.claimed_at,
                state_version = excluded.state_version,
                correlation_id = excluded.correlation_id,
                updated_at = excluded.updated_at"
        ))
        .bind(&item.id.0)
        .bind(&item.deal_id.0)
        .bind(to_json("write_intent_json", &item.write_intent)?)
        .bind(follow_up_json)
        .bind(i64::from(item.attempts))
        .bind(i64::from(item.max_attempts))
        .bind(to_json("retry_intervals_json", &item.retry_intervals_secs)?)
        .bind(item.status.as_str())
        .bind(to_json("history_json", &item.history)?)
        .bind(sortable(item.next_attempt_at))
        .bind(item.last_error.as_deref())
        .bind(item.claimed_by.as_deref())
        .bind(item.claimed_at.map(sortable))
        .bind(i64::from(item.state_version))
        .bind(&item.correlation_id)
        .bind(sortable(item.created_at))
        .bind(sortable(item.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Replaces the row only while it still carries the version this worker claimed.
    async fn update_claimed(
        &self,
        item: &SyncQueueItem,
        claimed_version: u32,
    ) -> Result<(), RepositoryError> {
        let updated = sqlx::query(
            "UPDATE sync_queue_item
             SET attempts = ?,
                 status = ?,
                 history_json = ?,
                 next_attempt_at = ?,
                 last_error = ?,
                 claimed_by = ?,
                 claimed_at = ?,
                 state_version = ?,
                 updated_at = ?
             WHERE id = ? AND state_version = ?",
        )
        .bind(i64::from(item.attempts))
        .bind(item.status.as_str())
        .bind(to_json("history_json", &item.history)?)
        .bind(sortable(item.next_attempt_at))
        .bind(item.last_error.as_deref())
        .bind(item.claimed_by.as_deref())
        .bind(item.claimed_at.map(sortable))
        .bind(i64::from(item.state_version))
        .bind(sortable(item.updated_at))
        .bind(&item.id.0)
        .bind(i64::from(claimed_version))
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(RepositoryError::Conflict(format!(
                "sync item {} changed since claim version {claimed_version}",
                item.id
            )));
        }
        Ok(())
    }

    async fn find_item(&self, id: &SyncItemId) -> Result<Option<SyncQueueItem>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {ITEM_COLUMNS} FROM sync_queue_item WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(item_from_row).transpose()
    }
}

#[async_trait::async_trait]
impl SyncQueueStore for SqlSyncQueueStore {
    async fn insert(&self, item: &SyncQueueItem) -> Result<(), StoreError> {
        Ok(self.upsert(item).await?)
    }

    async fn find(&self, id: &SyncItemId) -> Result<Option<SyncQueueItem>, StoreError> {
        Ok(self.find_item(id).await?)
    }

    async fn due(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<SyncQueueItem>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS}
             FROM sync_queue_item
             WHERE status IN ('queued', 'scheduled') AND next_attempt_at <= ?
             ORDER BY next_attempt_at ASC, id ASC
             LIMIT ?"
        ))
        .bind(sortable(now))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(rows.into_iter().map(item_from_row).collect::<Result<Vec<_>, RepositoryError>>()?)
    }

    async fn try_claim(
        &self,
        id: &SyncItemId,
        worker_id: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<SyncQueueItem>, StoreError> {
        let claimed = sqlx::query(
            "UPDATE sync_queue_item
             SET claimed_by = ?, claimed_at = ?, state_version = state_version + 1
             WHERE id = ?
               AND status IN ('queued', 'scheduled')
               AND next_attempt_at <= ?
               AND (claimed_by IS NULL OR claimed_at IS NULL OR claimed_at < ?)",
        )
        .bind(worker_id)
        .bind(sortable(now))
        .bind(&id.0)
        .bind(sortable(now))
        .bind(sortable(stale_before))
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        if claimed.rows_affected() == 0 {
            return Ok(None);
        }
        Ok(self.find_item(id).await?)
    }

    async fn save(&self, item: &SyncQueueItem, claimed_version: u32) -> Result<(), StoreError> {
        Ok(self.update_claimed(item, claimed_version).await?)
    }

    async fn list(&self, filter: &SyncQueueFilter) -> Result<Vec<SyncQueueItem>, StoreError> {
        let limit = filter.limit.map_or(-1, i64::from);
        let rows = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS}
             FROM sync_queue_item
             WHERE (? IS NULL OR status = ?) AND (? IS NULL OR deal_id = ?)
             ORDER BY created_at ASC, id ASC
             LIMIT ?"
        ))
        .bind(filter.status.map(SyncItemStatus::as_str))
        .bind(filter.status.map(SyncItemStatus::as_str))
        .bind(filter.deal_id.as_ref().map(|deal_id| deal_id.0.as_str()))
        .bind(filter.deal_id.as_ref().map(|deal_id| deal_id.0.as_str()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(rows.into_iter().map(item_from_row).collect::<Result<Vec<_>, RepositoryError>>()?)
    }

    async fn stats(&self) -> Result<SyncQueueStats, StoreError> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS count FROM sync_queue_item GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        let mut stats = SyncQueueStats::default();
        for row in rows {
            let status_raw = row.try_get::<String, _>("status").map_err(RepositoryError::from)?;
            let status = SyncItemStatus::parse(&status_raw).ok_or_else(|| {
                StoreError::Decode(format!("unknown sync queue status `{status_raw}`"))
            })?;
            let count = row.try_get::<i64, _>("count").map_err(RepositoryError::from)?;
            stats.record(status, u64::try_from(count).unwrap_or_default());
        }
        Ok(stats)
    }

    async fn oldest_failed(&self) -> Result<Option<SyncQueueItem>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS}
             FROM sync_queue_item
             WHERE status = 'failed_manual_review'
             ORDER BY created_at ASC, id ASC
             LIMIT 1"
        ))
        .fetch_optional(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(row.map(item_from_row).transpose()?)
    }

    async fn prune_completed(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let pruned = sqlx::query(
            "DELETE FROM sync_queue_item WHERE status = 'completed' AND updated_at < ?",
        )
        .bind(sortable(older_than))
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(pruned.rows_affected())
    }
}

fn item_from_row(row: SqliteRow) -> Result<SyncQueueItem, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = SyncItemStatus::parse(&status_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown sync queue status `{status_raw}`"))
    })?;

    let follow_up = row
        .try_get::<Option<String>, _>("follow_up_json")?
        .map(|value| parse_json("follow_up_json", &value))
        .transpose()?;

    Ok(SyncQueueItem {
        id: SyncItemId(row.try_get("id")?),
        deal_id: DealId(row.try_get("deal_id")?),
        write_intent: parse_json("write_intent_json", &row.try_get::<String, _>("write_intent_json")?)?,
        follow_up,
        attempts: parse_u32("attempts", row.try_get("attempts")?)?,
        max_attempts: parse_u32("max_attempts", row.try_get("max_attempts")?)?,
        retry_intervals_secs: parse_json(
            "retry_intervals_json",
            &row.try_get::<String, _>("retry_intervals_json")?,
        )?,
        status,
        history: parse_json("history_json", &row.try_get::<String, _>("history_json")?)?,
        next_attempt_at: parse_timestamp("next_attempt_at", row.try_get("next_attempt_at")?)?,
        last_error: row.try_get("last_error")?,
        claimed_by: row.try_get("claimed_by")?,
        claimed_at: parse_optional_timestamp("claimed_at", row.try_get("claimed_at")?)?,
        state_version: parse_u32("state_version", row.try_get("state_version")?)?,
        correlation_id: row.try_get("correlation_id")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}
