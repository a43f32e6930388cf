use std::collections::BTreeMap;

use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection};

use dealsync_core::domain::deal::{
    Deal, DealId, DealStage, PaymentMethod, PaymentStatus, SyncStatus,
};
use dealsync_core::domain::event::CorrelationKey;
use dealsync_core::domain::intent::WriteIntent;
use dealsync_core::errors::WriteError;
use dealsync_core::ports::CrmGateway;

use super::{parse_optional_timestamp, parse_timestamp, RepositoryError};
use crate::DbPool;

const DEAL_COLUMNS: &str = "id,
    stage,
    payment_status,
    payment_method,
    settlement_reference_id,
    practice_matter_id,
    sync_status,
    sync_error,
    last_synced_at,
    payment_amount,
    processor_fee,
    net_amount,
    payment_failure_reason,
    payer_first_name,
    payer_last_name,
    updated_at";

/// SQLite mirror of CRM deals. Serves as the CRM adapter in `local` mode and as the
/// fixture store behind the CLI.
pub struct SqlDealRepository {
    pool: DbPool,
}

impl SqlDealRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn find_by_id(&self, id: &DealId) -> Result<Option<Deal>, RepositoryError> {
        let mut conn = self.pool.acquire().await?;
        load_deal(&mut conn, id).await
    }

    pub async fn find_by_key(&self, key: &CorrelationKey) -> Result<Option<Deal>, RepositoryError> {
        let mut conn = self.pool.acquire().await?;
        let deal_id = match key {
            CorrelationKey::Deal(deal_id) => Some(deal_id.clone()),
            CorrelationKey::SettlementReference(reference) => {
                first_id(
                    &mut conn,
                    "SELECT id FROM deal WHERE settlement_reference_id = ? ORDER BY id LIMIT 1",
                    reference,
                )
                .await?
            }
            CorrelationKey::PracticeMatter(matter_id) => {
                first_id(
                    &mut conn,
                    "SELECT id FROM deal WHERE practice_matter_id = ? ORDER BY id LIMIT 1",
                    matter_id,
                )
                .await?
            }
            CorrelationKey::Envelope(envelope_id) => {
                first_id(
                    &mut conn,
                    "SELECT deal_id AS id FROM deal_envelope WHERE envelope_id = ?
                     ORDER BY deal_id LIMIT 1",
                    envelope_id,
                )
                .await?
            }
        };

        match deal_id {
            Some(deal_id) => load_deal(&mut conn, &deal_id).await,
            None => Ok(None),
        }
    }

    pub async fn save(&self, deal: &Deal) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;
        store_deal(&mut tx, deal).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn list(&self, limit: u32) -> Result<Vec<Deal>, RepositoryError> {
        let mut conn = self.pool.acquire().await?;
        let ids: Vec<String> = sqlx::query("SELECT id FROM deal ORDER BY updated_at DESC, id LIMIT ?")
            .bind(i64::from(limit))
            .fetch_all(&mut *conn)
            .await?
            .into_iter()
            .map(|row| row.try_get::<String, _>("id"))
            .collect::<Result<_, _>>()?;

        let mut deals = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(deal) = load_deal(&mut conn, &DealId(id)).await? {
                deals.push(deal);
            }
        }
        Ok(deals)
    }

    /// Applies the intent's properties inside one transaction. A missing deal is permanent.
    pub async fn apply(&self, intent: &WriteIntent) -> Result<Deal, WriteError> {
        let mut tx = self.pool.begin().await.map_err(RepositoryError::from)?;
        let mut deal = load_deal(&mut tx, &intent.target_deal_id).await?.ok_or_else(|| {
            WriteError::Permanent(format!("deal `{}` does not exist", intent.target_deal_id))
        })?;

        deal.apply_properties(&intent.properties())
            .map_err(|error| WriteError::Permanent(error.to_string()))?;
        deal.updated_at = Utc::now();

        store_deal(&mut tx, &deal).await?;
        tx.commit().await.map_err(RepositoryError::from)?;
        Ok(deal)
    }
}

#[async_trait::async_trait]
impl CrmGateway for SqlDealRepository {
    async fn fetch_deal(&self, deal_id: &DealId) -> Result<Option<Deal>, WriteError> {
        Ok(self.find_by_id(deal_id).await?)
    }

    async fn find_deal(&self, key: &CorrelationKey) -> Result<Option<Deal>, WriteError> {
        Ok(self.find_by_key(key).await?)
    }

    async fn write(&self, intent: &WriteIntent) -> Result<(), WriteError> {
        self.apply(intent).await.map(|_| ())
    }
}

async fn first_id(
    conn: &mut SqliteConnection,
    sql: &str,
    value: &str,
) -> Result<Option<DealId>, RepositoryError> {
    let row = sqlx::query(sql).bind(value).fetch_optional(&mut *conn).await?;
    row.map(|row| row.try_get::<String, _>("id").map(DealId)).transpose().map_err(Into::into)
}

async fn load_deal(
    conn: &mut SqliteConnection,
    id: &DealId,
) -> Result<Option<Deal>, RepositoryError> {
    let row = sqlx::query(&format!("SELECT {DEAL_COLUMNS} FROM deal WHERE id = ?"))
        .bind(&id.0)
        .fetch_optional(&mut *conn)
        .await?;
    let Some(row) = row else {
        return Ok(None);
    };

    let envelopes = sqlx::query(
        "SELECT document_type, envelope_id FROM deal_envelope WHERE deal_id = ?
         ORDER BY document_type",
    )
    .bind(&id.0)
    .fetch_all(&mut *conn)
    .await?;

    let mut envelope_ids = BTreeMap::new();
    for envelope in envelopes {
        envelope_ids.insert(envelope.try_get("document_type")?, envelope.try_get("envelope_id")?);
    }

    deal_from_row(row, envelope_ids).map(Some)
}

async fn store_deal(conn: &mut SqliteConnection, deal: &Deal) -> Result<(), RepositoryError> {
    sqlx::query(&format!(
        "INSERT INTO deal ({DEAL_COLUMNS})
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
            stage = excluded.stage,
            payment_status = excluded.payment_status,
            payment_method = excluded.payment_method,
            settlement_reference_id = excluded.settlement_reference_id,
            practice_matter_id = excluded.practice_matter_id,
            sync_status = excluded.sync_status,
            sync_error = excluded.sync_error,
            last_synced_at = excluded.last_synced_at,
            payment_amount = excluded.payment_amount,
            processor_fee = excluded.processor_fee,
            net_amount = excluded.net_amount,
            payment_failure_reason = excluded.payment_failure_reason,
            payer_first_name = excluded.payer_first_name,
            payer_last_name = excluded.payer_last_name,
            updated_at = excluded.updated_at"
    ))
    .bind(&deal.id.0)
    .bind(deal.stage.as_str())
    .bind(deal.payment_status.as_str())
    .bind(deal.payment_method.map(PaymentMethod::as_str))
    .bind(deal.settlement_reference_id.as_deref())
    .bind(deal.practice_matter_id.as_deref())
    .bind(deal.sync_status.as_str())
    .bind(deal.sync_error.as_deref())
    .bind(deal.last_synced_at.map(|value| value.to_rfc3339()))
    .bind(deal.payment_amount.map(|value| value.to_string()))
    .bind(deal.processor_fee.map(|value| value.to_string()))
    .bind(deal.net_amount.map(|value| value.to_string()))
    .bind(deal.payment_failure_reason.as_deref())
    .bind(deal.payer_first_name.as_deref())
    .bind(deal.payer_last_name.as_deref())
    .bind(deal.updated_at.to_rfc3339())
    .execute(&mut *conn)
    .await?;

    sqlx::query("DELETE FROM deal_envelope WHERE deal_id = ?")
        .bind(&deal.id.0)
        .execute(&mut *conn)
        .await?;
    for (document_type, envelope_id) in &deal.envelope_ids {
        sqlx::query(
            "INSERT INTO deal_envelope (deal_id, document_type, envelope_id) VALUES (?, ?, ?)",
        )
        .bind(&deal.id.0)
        .bind(document_type)
        .bind(envelope_id)
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}

fn deal_from_row(
    row: SqliteRow,
    envelope_ids: BTreeMap<String, String>,
) -> Result<Deal, RepositoryError> {
    let stage_raw = row.try_get::<String, _>("stage")?;
    let stage = DealStage::parse(&stage_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown deal stage `{stage_raw}`")))?;

    let payment_status_raw = row.try_get::<String, _>("payment_status")?;
    let payment_status = PaymentStatus::parse(&payment_status_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown payment status `{payment_status_raw}`"))
    })?;

    let payment_method = row
        .try_get::<Option<String>, _>("payment_method")?
        .map(|value| {
            PaymentMethod::parse(&value)
                .ok_or_else(|| RepositoryError::Decode(format!("unknown payment method `{value}`")))
        })
        .transpose()?;

    let sync_status_raw = row.try_get::<String, _>("sync_status")?;
    let sync_status = SyncStatus::parse(&sync_status_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown sync status `{sync_status_raw}`"))
    })?;

    Ok(Deal {
        id: DealId(row.try_get("id")?),
        stage,
        payment_status,
        payment_method,
        settlement_reference_id: row.try_get("settlement_reference_id")?,
        practice_matter_id: row.try_get("practice_matter_id")?,
        envelope_ids,
        sync_status,
        sync_error: row.try_get("sync_error")?,
        last_synced_at: parse_optional_timestamp("last_synced_at", row.try_get("last_synced_at")?)?,
        payment_amount: parse_decimal("payment_amount", row.try_get("payment_amount")?)?,
        processor_fee: parse_decimal("processor_fee", row.try_get("processor_fee")?)?,
        net_amount: parse_decimal("net_amount", row.try_get("net_amount")?)?,
        payment_failure_reason: row.try_get("payment_failure_reason")?,
        payer_first_name: row.try_get("payer_first_name")?,
        payer_last_name: row.try_get("payer_last_name")?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

fn parse_decimal(column: &str, value: Option<String>) -> Result<Option<Decimal>, RepositoryError> {
    value
        .map(|raw| {
            raw.parse::<Decimal>().map_err(|error| {
                RepositoryError::Decode(format!("invalid decimal in `{column}`: `{raw}` ({error})"))
            })
        })
        .transpose()
}
