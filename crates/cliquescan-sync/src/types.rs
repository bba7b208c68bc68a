//! Common types for cliquescan-sync

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{SyncError, SyncResult};

/// Metadata kept for one block of the chain.
///
/// The block table holds at most one row per `block_number`; writes are
/// upserts and the latest write wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRecord {
    pub block_number: u64,
    /// Unix seconds.
    pub timestamp: u64,
    /// `0x`-prefixed hex string, kept opaque.
    pub hash: String,
    /// Lowercase-normalized producer address.
    pub signer_address: String,
    pub transaction_count: u32,
    /// gas used times the gas price snapshot of the ingesting run, in wei.
    pub fee_earned: u128,
}

/// Header row of the staging file.
pub const CSV_HEADER: &str =
    "block_number,timestamp,hash,signer_address,transaction_count,fee_earned";

impl BlockRecord {
    /// Encode as one staging-file row, field order matching [`CSV_HEADER`].
    pub fn to_csv_row(&self) -> String {
        format!(
            "{},{},{},{},{},{}",
            self.block_number,
            self.timestamp,
            self.hash,
            self.signer_address,
            self.transaction_count,
            self.fee_earned
        )
    }

    /// Parse one staging-file row.
    pub fn from_csv_row(line: &str) -> SyncResult<Self> {
        let fields: Vec<&str> = line.trim_end().split(',').collect();
        if fields.len() != 6 {
            return Err(SyncError::Parse(format!(
                "expected 6 fields in staging row, got {}",
                fields.len()
            )));
        }
        Ok(Self {
            block_number: parse_field(fields[0], "block_number")?,
            timestamp: parse_field(fields[1], "timestamp")?,
            hash: fields[2].to_string(),
            signer_address: fields[3].to_lowercase(),
            transaction_count: parse_field(fields[4], "transaction_count")?,
            fee_earned: parse_field(fields[5], "fee_earned")?,
        })
    }
}

fn parse_field<T: std::str::FromStr>(value: &str, name: &str) -> SyncResult<T> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| SyncError::Parse(format!("invalid {} in staging row: {}", name, value)))
}

/// Configuration for the sync controllers.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Block number both watermarks fall back to when the store is empty.
    pub default_start_block: u64,
    /// Blocks withheld below the chain head; blocks closer to the head than
    /// this may still be reorganized and are not ingested yet.
    pub confirmation_lag: u64,
    /// Minimum pause between consecutive per-block units (rate limit toward
    /// the RPC endpoint).
    pub block_delay: Duration,
    /// Sleep when the forward controller has caught up to the lagged head.
    pub idle_interval: Duration,
    /// Sleep after a range-determination failure before retrying.
    pub backoff_delay: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            default_start_block: 0,
            confirmation_lag: 10,
            block_delay: Duration::from_millis(100),
            idle_interval: Duration::from_secs(10),
            backoff_delay: Duration::from_secs(5),
        }
    }
}

/// JSON-RPC request structure
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct JsonRpcRequest {
    pub id: u32,
    pub jsonrpc: String,
    pub method: String,
    pub params: Vec<serde_json::Value>,
}

/// JSON-RPC error structure
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    pub data: Option<serde_json::Value>,
}
