//! Typed access to the chain through a [`JsonRpcClient`].
//!
//! [`NodeClient`] is where raw JSON-RPC results become numbers and records:
//! hex integer fields are decoded here, transaction counts are taken from
//! the embedded transaction list, and signer addresses are normalized to
//! lowercase. Everything above this module works with decoded values only.

use log::debug;
use serde_json::{json, Value};

use crate::{BlockRecord, JsonRpcClient, SyncError, SyncResult};

/// Decoded summary of an `eth_getBlockByNumber` response.
#[derive(Debug, Clone)]
pub struct BlockSummary {
    pub hash: String,
    pub timestamp: u64,
    pub transaction_count: u32,
    pub gas_used: u64,
}

/// Fetches and decodes chain data.
pub struct NodeClient<C> {
    client: C,
}

impl<C: JsonRpcClient> NodeClient<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }

    /// Current chain head via `eth_blockNumber`.
    pub async fn chain_head(&self) -> SyncResult<u64> {
        let result = self.client.call("eth_blockNumber", vec![]).await?;
        parse_hex_u64(&result, "eth_blockNumber result")
    }

    /// Current gas price via `eth_gasPrice`, in wei.
    pub async fn gas_price(&self) -> SyncResult<u128> {
        let result = self.client.call("eth_gasPrice", vec![]).await?;
        parse_hex_u128(&result, "eth_gasPrice result")
    }

    /// Fetch one block with transactions embedded for the count.
    pub async fn fetch_block(&self, number: u64) -> SyncResult<BlockSummary> {
        let params = vec![json!(format!("0x{:x}", number)), json!(true)];
        let block = self.client.call("eth_getBlockByNumber", params).await?;
        if block.is_null() {
            return Err(SyncError::Parse(format!(
                "block {} not returned by node",
                number
            )));
        }
        let hash = block
            .get("hash")
            .and_then(Value::as_str)
            .ok_or_else(|| SyncError::Parse(format!("block {} has no hash", number)))?
            .to_string();
        let timestamp = parse_hex_u64(require(&block, "timestamp", number)?, "timestamp")?;
        let gas_used = parse_hex_u64(require(&block, "gasUsed", number)?, "gasUsed")?;
        let transactions = block
            .get("transactions")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                SyncError::Parse(format!("block {} has no transaction list", number))
            })?;
        Ok(BlockSummary {
            hash,
            timestamp,
            transaction_count: transactions.len() as u32,
            gas_used,
        })
    }

    /// Resolve the producing signer for a block hash via `clique_getSigner`.
    ///
    /// An absent or empty result is a valid outcome, not an error: the block
    /// has no resolvable signer and must not be persisted.
    pub async fn resolve_signer(&self, block_hash: &str) -> SyncResult<Option<String>> {
        let result = self
            .client
            .call("clique_getSigner", vec![json!(block_hash)])
            .await?;
        match result {
            Value::Null => Ok(None),
            Value::String(address) if address.is_empty() => Ok(None),
            Value::String(address) => Ok(Some(address.to_lowercase())),
            other => Err(SyncError::Parse(format!(
                "clique_getSigner returned {}",
                other
            ))),
        }
    }

    /// Run the full per-block unit: fetch, compute the fee, resolve the
    /// signer. Returns `Ok(None)` when the signer is unresolvable.
    pub async fn block_record(
        &self,
        number: u64,
        gas_price: u128,
    ) -> SyncResult<Option<BlockRecord>> {
        let summary = self.fetch_block(number).await?;
        let fee_earned = u128::from(summary.gas_used) * gas_price;
        let signer = match self.resolve_signer(&summary.hash).await? {
            Some(signer) => signer,
            None => return Ok(None),
        };
        Ok(Some(BlockRecord {
            block_number: number,
            timestamp: summary.timestamp,
            hash: summary.hash,
            signer_address: signer,
            transaction_count: summary.transaction_count,
            fee_earned,
        }))
    }
}

fn require<'a>(block: &'a Value, field: &str, number: u64) -> SyncResult<&'a Value> {
    block
        .get(field)
        .filter(|value| !value.is_null())
        .ok_or_else(|| SyncError::Parse(format!("block {} is missing {}", number, field)))
}

/// Decode a `0x`-prefixed hex integer field.
pub fn parse_hex_u64(value: &Value, what: &str) -> SyncResult<u64> {
    let text = value
        .as_str()
        .ok_or_else(|| SyncError::Parse(format!("{} is not a string", what)))?;
    u64::from_str_radix(text.trim_start_matches("0x"), 16)
        .map_err(|_| SyncError::Parse(format!("{} is not hex: {}", what, text)))
}

/// Decode a `0x`-prefixed hex integer field that may exceed 64 bits.
pub fn parse_hex_u128(value: &Value, what: &str) -> SyncResult<u128> {
    let text = value
        .as_str()
        .ok_or_else(|| SyncError::Parse(format!("{} is not a string", what)))?;
    u128::from_str_radix(text.trim_start_matches("0x"), 16)
        .map_err(|_| SyncError::Parse(format!("{} is not hex: {}", what, text)))
}

/// Gas price captured once per controller run.
///
/// Lazily initialized on first use and reused for every fee computation in
/// that run; it is never refreshed, so it goes stale over a long run. That
/// staleness is part of the fee contract, not an oversight.
#[derive(Debug, Default)]
pub struct GasPriceSnapshot(Option<u128>);

impl GasPriceSnapshot {
    pub fn new() -> Self {
        Self(None)
    }

    pub async fn get<C: JsonRpcClient>(&mut self, node: &NodeClient<C>) -> SyncResult<u128> {
        match self.0 {
            Some(price) => Ok(price),
            None => {
                let price = node.gas_price().await?;
                debug!("captured gas price snapshot: {} wei", price);
                self.0 = Some(price);
                Ok(price)
            }
        }
    }
}
