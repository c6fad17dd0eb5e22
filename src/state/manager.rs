//! PostgreSQL record store

use super::record::{NetworkRef, TransactionRecord, TransferInfo, TxStatus};
use super::store::{NonceFilter, RecordFilter, RecordStore, RecordUpdate, StatusCounts};
use crate::config::DatabaseConfig;
use crate::error::{WatcherError, WatcherResult};

use alloy_primitives::B256;
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use std::collections::HashSet;
use tracing::{debug, info};

const SELECT_COLUMNS: &str = "SELECT hash, account, network_kind, network_id, nonce, status, \
     block_number, confirmed, is_replacement, timestamp_ms, label, site_url, token_id, \
     value, to_address FROM transactions";

/// Record store backed by PostgreSQL
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    /// Connect to the database
    pub async fn new(config: &DatabaseConfig) -> WatcherResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Create tables and indexes
    pub async fn run_migrations(&self) -> WatcherResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS transactions (
                hash BYTEA PRIMARY KEY,
                account VARCHAR(128) NOT NULL,
                network_kind VARCHAR(16) NOT NULL,
                network_id VARCHAR(80) NOT NULL,
                nonce BIGINT NOT NULL,
                status VARCHAR(16) NOT NULL,
                block_number BIGINT,
                confirmed BOOLEAN NOT NULL DEFAULT FALSE,
                is_replacement BOOLEAN NOT NULL DEFAULT FALSE,
                timestamp_ms BIGINT NOT NULL,
                label TEXT NOT NULL DEFAULT '',
                site_url TEXT,
                token_id TEXT,
                value TEXT,
                to_address TEXT,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_transactions_status ON transactions (status)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_transactions_timestamp ON transactions (timestamp_ms)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_transactions_slot
            ON transactions (account, network_kind, network_id, nonce)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }
}

fn push_filter(builder: &mut QueryBuilder<'_, Postgres>, filter: &RecordFilter) {
    builder.push(" WHERE TRUE");
    if let Some(account) = &filter.account {
        builder.push(" AND account = ").push_bind(account.clone());
    }
    if let Some(network) = &filter.network {
        builder
            .push(" AND network_kind = ")
            .push_bind(network.kind())
            .push(" AND network_id = ")
            .push_bind(network.id_string());
    }
    match filter.nonce {
        Some(NonceFilter::Eq(nonce)) => {
            builder.push(" AND nonce = ").push_bind(nonce as i64);
        }
        Some(NonceFilter::Lt(nonce)) => {
            builder.push(" AND nonce < ").push_bind(nonce as i64);
        }
        None => {}
    }
    if let Some(statuses) = &filter.statuses {
        let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        builder.push(" AND status = ANY(").push_bind(statuses).push(")");
    }
    if let Some(hash) = &filter.exclude_hash {
        builder.push(" AND hash <> ").push_bind(hash.to_vec());
    }
}

fn push_update(builder: &mut QueryBuilder<'_, Postgres>, update: &RecordUpdate) {
    builder.push("UPDATE transactions SET updated_at = NOW()");
    if let Some(status) = update.status {
        builder.push(", status = ").push_bind(status.as_str());
    }
    if let Some(block_number) = update.block_number {
        builder.push(", block_number = ").push_bind(block_number as i64);
    }
    if let Some(confirmed) = update.confirmed {
        builder.push(", confirmed = ").push_bind(confirmed);
    }
}

fn record_from_row(row: &PgRow) -> WatcherResult<TransactionRecord> {
    let hash: Vec<u8> = row.try_get("hash")?;
    if hash.len() != 32 {
        return Err(WatcherError::Decode(format!(
            "stored hash has {} bytes",
            hash.len()
        )));
    }

    let network_kind: String = row.try_get("network_kind")?;
    let network_id: String = row.try_get("network_id")?;
    let status: String = row.try_get("status")?;

    let token_id: Option<String> = row.try_get("token_id")?;
    let value: Option<String> = row.try_get("value")?;
    let to: Option<String> = row.try_get("to_address")?;
    let transfer = match (token_id, value, to) {
        (Some(token_id), Some(value), Some(to)) => Some(TransferInfo { token_id, value, to }),
        _ => None,
    };

    Ok(TransactionRecord {
        hash: B256::from_slice(&hash),
        account: row.try_get("account")?,
        network: NetworkRef::from_parts(&network_kind, &network_id)?,
        nonce: row.try_get::<i64, _>("nonce")? as u64,
        status: status.parse::<TxStatus>()?,
        block_number: row
            .try_get::<Option<i64>, _>("block_number")?
            .map(|b| b as u64),
        confirmed: row.try_get("confirmed")?,
        is_replacement: row.try_get("is_replacement")?,
        timestamp: row.try_get("timestamp_ms")?,
        label: row.try_get("label")?,
        site_url: row.try_get("site_url")?,
        transfer,
    })
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn add(&self, record: TransactionRecord) -> WatcherResult<()> {
        let (token_id, value, to) = match &record.transfer {
            Some(t) => (Some(t.token_id.clone()), Some(t.value.clone()), Some(t.to.clone())),
            None => (None, None, None),
        };

        let result = sqlx::query(
            r#"
            INSERT INTO transactions
                (hash, account, network_kind, network_id, nonce, status, block_number,
                 confirmed, is_replacement, timestamp_ms, label, site_url, token_id, value,
                 to_address)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (hash) DO NOTHING
            "#,
        )
        .bind(record.hash.to_vec())
        .bind(&record.account)
        .bind(record.network.kind())
        .bind(record.network.id_string())
        .bind(record.nonce as i64)
        .bind(record.status.as_str())
        .bind(record.block_number.map(|b| b as i64))
        .bind(record.confirmed)
        .bind(record.is_replacement)
        .bind(record.timestamp)
        .bind(&record.label)
        .bind(&record.site_url)
        .bind(token_id)
        .bind(value)
        .bind(to)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(WatcherError::DuplicateTransaction {
                hash: record.hash.to_string(),
            });
        }
        Ok(())
    }

    async fn get(&self, hash: &B256) -> WatcherResult<Option<TransactionRecord>> {
        let row = sqlx::query(&format!("{} WHERE hash = $1", SELECT_COLUMNS))
            .bind(hash.to_vec())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(record_from_row).transpose()
    }

    async fn update(&self, hash: &B256, update: &RecordUpdate) -> WatcherResult<bool> {
        let mut builder = QueryBuilder::new("");
        push_update(&mut builder, update);
        builder.push(" WHERE hash = ").push_bind(hash.to_vec());

        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find(&self, filter: &RecordFilter) -> WatcherResult<Vec<TransactionRecord>> {
        let mut builder = QueryBuilder::new(SELECT_COLUMNS);
        push_filter(&mut builder, filter);
        builder.push(" ORDER BY timestamp_ms DESC, hash ASC");

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn update_where(
        &self,
        filter: &RecordFilter,
        update: &RecordUpdate,
    ) -> WatcherResult<Vec<B256>> {
        let mut builder = QueryBuilder::new("");
        push_update(&mut builder, update);
        push_filter(&mut builder, filter);
        builder.push(" RETURNING hash");

        let rows = builder.build().fetch_all(&self.pool).await?;
        let touched = rows
            .iter()
            .map(|row| {
                row.try_get::<Vec<u8>, _>("hash")
                    .map(|h| B256::from_slice(&h))
            })
            .collect::<Result<Vec<_>, _>>()?;

        debug!("Bulk update touched {} records", touched.len());
        Ok(touched)
    }

    async fn delete(&self, hash: &B256) -> WatcherResult<bool> {
        let result = sqlx::query("DELETE FROM transactions WHERE hash = $1")
            .bind(hash.to_vec())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn recent(&self, limit: usize) -> WatcherResult<Vec<TransactionRecord>> {
        let rows = sqlx::query(&format!(
            "{} ORDER BY timestamp_ms DESC, hash ASC LIMIT $1",
            SELECT_COLUMNS
        ))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    async fn prune(&self, keep: usize, protected: &HashSet<B256>) -> WatcherResult<usize> {
        let protected: Vec<Vec<u8>> = protected.iter().map(|h| h.to_vec()).collect();

        let result = sqlx::query(
            r#"
            DELETE FROM transactions
            WHERE hash IN (
                SELECT hash FROM transactions
                ORDER BY timestamp_ms DESC, hash ASC
                OFFSET $1
            )
            AND status <> 'pending'
            AND NOT (hash = ANY($2))
            "#,
        )
        .bind(i64::try_from(keep).unwrap_or(i64::MAX))
        .bind(protected)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() as usize)
    }

    async fn count_by_status(&self) -> WatcherResult<StatusCounts> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS count FROM transactions GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let count: i64 = row.try_get("count")?;
            counts.add(status.parse()?, count as u64);
        }
        Ok(counts)
    }

    async fn health_check(&self) -> WatcherResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
