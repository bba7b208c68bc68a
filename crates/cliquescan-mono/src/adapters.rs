//! Adapter implementations wiring the generic sync framework to a real
//! JSON-RPC endpoint and a PostgreSQL block table.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder, Row};

use cliquescan_sync::{
    BlockRecord, BlockStore, JsonRpcClient, JsonRpcError, JsonRpcRequest, SyncError, SyncResult,
};

/// JSON-RPC 2.0 client over HTTP POST.
///
/// Performs exactly one request per invocation; retrying is the caller's
/// policy (the controllers skip failed blocks rather than retry them).
#[derive(Clone)]
pub struct HttpRpcClient {
    url: String,
    client: reqwest::Client,
}

impl HttpRpcClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl JsonRpcClient for HttpRpcClient {
    async fn call(&self, method: &str, params: Vec<Value>) -> SyncResult<Value> {
        let request = JsonRpcRequest {
            id: 1,
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
        };
        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| SyncError::Transport(format!("{} request failed: {}", method, e)))?;
        let response = response
            .error_for_status()
            .map_err(|e| SyncError::Transport(format!("{} returned HTTP error: {}", method, e)))?;
        let envelope: Value = response
            .json()
            .await
            .map_err(|e| SyncError::Protocol(format!("{} response is not JSON: {}", method, e)))?;
        if let Some(error) = envelope.get("error").filter(|error| !error.is_null()) {
            let detail = serde_json::from_value::<JsonRpcError>(error.clone())
                .map(|e| format!("{} ({})", e.message, e.code))
                .unwrap_or_else(|_| error.to_string());
            return Err(SyncError::Protocol(format!("{} failed: {}", method, detail)));
        }
        match envelope.get("result") {
            Some(result) => Ok(result.clone()),
            None => Err(SyncError::Protocol(format!(
                "{} response has no result field",
                method
            ))),
        }
    }
}

const UPSERT_CONFLICT: &str = " ON CONFLICT (block_number) DO UPDATE SET \
     timestamp = EXCLUDED.timestamp, \
     hash = EXCLUDED.hash, \
     signer_address = EXCLUDED.signer_address, \
     transaction_count = EXCLUDED.transaction_count, \
     fee_earned = EXCLUDED.fee_earned";

/// PostgreSQL-backed block table.
#[derive(Clone)]
pub struct PgBlockStore {
    pool: PgPool,
}

impl PgBlockStore {
    /// Connect to the database.
    pub async fn connect(database_url: &str, max_connections: u32) -> SyncResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| SyncError::Persistence(format!("cannot connect to database: {}", e)))?;
        Ok(Self { pool })
    }

    /// Create the block table when it does not exist yet.
    pub async fn ensure_schema(&self) -> SyncResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS block (
                block_number BIGINT PRIMARY KEY,
                timestamp BIGINT NOT NULL,
                hash TEXT NOT NULL,
                signer_address TEXT NOT NULL,
                transaction_count BIGINT NOT NULL,
                fee_earned NUMERIC NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Persistence(format!("cannot create block table: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl BlockStore for PgBlockStore {
    async fn max_block_number(&self) -> SyncResult<Option<u64>> {
        let row = sqlx::query("SELECT MAX(block_number) AS watermark FROM block")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| SyncError::Persistence(format!("cannot read high watermark: {}", e)))?;
        let watermark: Option<i64> = row
            .try_get("watermark")
            .map_err(|e| SyncError::Persistence(format!("cannot decode high watermark: {}", e)))?;
        Ok(watermark.map(|n| n as u64))
    }

    async fn min_block_number(&self) -> SyncResult<Option<u64>> {
        let row = sqlx::query("SELECT MIN(block_number) AS watermark FROM block")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| SyncError::Persistence(format!("cannot read low watermark: {}", e)))?;
        let watermark: Option<i64> = row
            .try_get("watermark")
            .map_err(|e| SyncError::Persistence(format!("cannot decode low watermark: {}", e)))?;
        Ok(watermark.map(|n| n as u64))
    }

    async fn upsert_block(&self, record: &BlockRecord) -> SyncResult<()> {
        let statement = format!(
            "INSERT INTO block (block_number, timestamp, hash, signer_address, \
             transaction_count, fee_earned) VALUES ($1, $2, $3, $4, $5, $6){}",
            UPSERT_CONFLICT
        );
        sqlx::query(&statement)
            .bind(record.block_number as i64)
            .bind(record.timestamp as i64)
            .bind(&record.hash)
            .bind(record.signer_address.to_lowercase())
            .bind(record.transaction_count as i64)
            .bind(BigDecimal::from(record.fee_earned))
            .execute(&self.pool)
            .await
            .map_err(|e| {
                SyncError::Persistence(format!(
                    "cannot upsert block {}: {}",
                    record.block_number, e
                ))
            })?;
        Ok(())
    }

    async fn upsert_batch(&self, records: &[BlockRecord]) -> SyncResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        // One multi-row statement cannot touch the same key twice; keep the
        // last occurrence per block number (file order wins).
        let mut deduped: BTreeMap<u64, &BlockRecord> = BTreeMap::new();
        for record in records {
            deduped.insert(record.block_number, record);
        }
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO block (block_number, timestamp, hash, signer_address, \
             transaction_count, fee_earned) ",
        );
        builder.push_values(deduped.values(), |mut row, record| {
            row.push_bind(record.block_number as i64)
                .push_bind(record.timestamp as i64)
                .push_bind(record.hash.clone())
                .push_bind(record.signer_address.to_lowercase())
                .push_bind(record.transaction_count as i64)
                .push_bind(BigDecimal::from(record.fee_earned));
        });
        builder.push(UPSERT_CONFLICT);
        builder.build().execute(&self.pool).await.map_err(|e| {
            SyncError::Persistence(format!(
                "cannot upsert batch of {} blocks: {}",
                records.len(),
                e
            ))
        })?;
        Ok(())
    }

    async fn last_signed_timestamp(&self, signer_address: &str) -> SyncResult<Option<u64>> {
        let row =
            sqlx::query("SELECT MAX(timestamp) AS last_seen FROM block WHERE signer_address = $1")
                .bind(signer_address.to_lowercase())
                .fetch_one(&self.pool)
                .await
                .map_err(|e| {
                    SyncError::Persistence(format!(
                        "cannot read last timestamp for {}: {}",
                        signer_address, e
                    ))
                })?;
        let last_seen: Option<i64> = row
            .try_get("last_seen")
            .map_err(|e| SyncError::Persistence(format!("cannot decode last timestamp: {}", e)))?;
        Ok(last_seen.map(|t| t as u64))
    }
}
