use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use dealsync_core::domain::deal::DealId;
use dealsync_core::domain::dispatch::{DispatchKey, DispatchRecord, DispatchState};
use dealsync_core::errors::StoreError;
use dealsync_core::ports::DispatchLedger;

use super::{parse_timestamp, RepositoryError};
use crate::DbPool;

/// Durable dedup ledger for receipt automation, keyed by deal and settlement reference.
pub struct SqlDispatchLedger {
    pool: DbPool,
}

impl SqlDispatchLedger {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl DispatchLedger for SqlDispatchLedger {
    async fn reserve(&self, record: &DispatchRecord) -> Result<bool, StoreError> {
        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO dispatch_ledger (
                deal_id,
                settlement_reference_id,
                state,
                rehearsal,
                message,
                correlation_id,
                reserved_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.key.deal_id.0)
        .bind(&record.key.settlement_reference_id)
        .bind(record.state.as_str())
        .bind(record.rehearsal)
        .bind(record.message.as_deref())
        .bind(&record.correlation_id)
        .bind(record.reserved_at.to_rfc3339())
        .bind(record.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(inserted.rows_affected() == 1)
    }

    async fn finish(
        &self,
        key: &DispatchKey,
        state: DispatchState,
        message: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let updated = sqlx::query(
            "UPDATE dispatch_ledger
             SET state = ?, message = ?, updated_at = ?
             WHERE deal_id = ? AND settlement_reference_id = ?",
        )
        .bind(state.as_str())
        .bind(message)
        .bind(now.to_rfc3339())
        .bind(&key.deal_id.0)
        .bind(&key.settlement_reference_id)
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        if updated.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("dispatch ledger entry {key}")));
        }
        Ok(())
    }

    async fn find(&self, key: &DispatchKey) -> Result<Option<DispatchRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT
                deal_id,
                settlement_reference_id,
                state,
                rehearsal,
                message,
                correlation_id,
                reserved_at,
                updated_at
             FROM dispatch_ledger
             WHERE deal_id = ? AND settlement_reference_id = ?",
        )
        .bind(&key.deal_id.0)
        .bind(&key.settlement_reference_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(row.map(record_from_row).transpose()?)
    }
}

fn record_from_row(row: SqliteRow) -> Result<DispatchRecord, RepositoryError> {
    let state_raw = row.try_get::<String, _>("state")?;
    let state = DispatchState::parse(&state_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown dispatch state `{state_raw}`")))?;

    Ok(DispatchRecord {
        key: DispatchKey {
            deal_id: DealId(row.try_get("deal_id")?),
            settlement_reference_id: row.try_get("settlement_reference_id")?,
        },
        state,
        rehearsal: row.try_get("rehearsal")?,
        message: row.try_get("message")?,
        correlation_id: row.try_get("correlation_id")?,
        reserved_at: parse_timestamp("reserved_at", row.try_get("reserved_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};

    use dealsync_core::domain::deal::DealId;
    use dealsync_core::domain::dispatch::{DispatchKey, DispatchRecord, DispatchState};
    use dealsync_core::errors::StoreError;
    use dealsync_core::ports::DispatchLedger;

    use super::SqlDispatchLedger;
    use crate::{connect_with_settings, migrations, DbPool};

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        pool
    }

    fn parse_ts(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value).expect("timestamp").with_timezone(&Utc)
    }

    fn key() -> DispatchKey {
        DispatchKey { deal_id: DealId("D-1".into()), settlement_reference_id: "pi_1".into() }
    }

    #[tokio::test]
    async fn reservation_wins_once_per_settlement() {
        let pool = setup_pool().await;
        let ledger = SqlDispatchLedger::new(pool.clone());
        let record = DispatchRecord::reserve(key(), true, "evt-1", parse_ts("2026-03-01T09:00:00Z"));

        assert!(ledger.reserve(&record).await.expect("first reserve"));
        assert!(!ledger.reserve(&record).await.expect("second reserve"));

        let other_settlement = DispatchRecord::reserve(
            DispatchKey { settlement_reference_id: "pi_2".into(), ..key() },
            true,
            "evt-2",
            parse_ts("2026-03-01T09:00:00Z"),
        );
        assert!(ledger.reserve(&other_settlement).await.expect("other settlement"));
        pool.close().await;
    }

    #[tokio::test]
    async fn finish_records_terminal_state() {
        let pool = setup_pool().await;
        let ledger = SqlDispatchLedger::new(pool.clone());
        let reserved_at = parse_ts("2026-03-01T09:00:00Z");
        ledger
            .reserve(&DispatchRecord::reserve(key(), false, "evt-1", reserved_at))
            .await
            .expect("reserve");

        let finished_at = parse_ts("2026-03-01T09:00:03Z");
        ledger
            .finish(&key(), DispatchState::Completed, Some("receipt created".into()), finished_at)
            .await
            .expect("finish");

        let stored = ledger.find(&key()).await.expect("find").expect("record");
        assert_eq!(stored.state, DispatchState::Completed);
        assert_eq!(stored.message.as_deref(), Some("receipt created"));
        assert!(!stored.rehearsal);
        assert_eq!(stored.reserved_at, reserved_at);
        assert_eq!(stored.updated_at, finished_at);
        pool.close().await;
    }

    #[tokio::test]
    async fn finishing_an_unknown_entry_is_not_found() {
        let pool = setup_pool().await;
        let ledger = SqlDispatchLedger::new(pool.clone());

        let error = ledger
            .finish(&key(), DispatchState::Failed, None, parse_ts("2026-03-01T09:00:00Z"))
            .await
            .expect_err("missing");

        assert!(matches!(error, StoreError::NotFound(_)));
        pool.close().await;
    }
}
