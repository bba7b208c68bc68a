//! Core trait definitions for the synchronization framework.
//!
//! The framework abstracts its two external dependencies behind adapter
//! traits, so controllers can be driven against a real node and database in
//! production and against in-memory mocks in tests:
//!
//! - [`JsonRpcClient`] abstracts the transport to the node endpoint.
//! - [`BlockStore`] abstracts the persisted block table.
//!
//! Both traits are async-first and `Send + Sync` so adapters can be shared
//! between long-running controller tasks.

use async_trait::async_trait;
use serde_json::Value;

use crate::{BlockRecord, SyncResult};

/// Executes JSON-RPC 2.0 calls against the node endpoint.
///
/// Implementations perform exactly one request per invocation and only
/// handle transport and envelope concerns. Failures map to
/// `SyncError::Transport` (network/HTTP failure) or `SyncError::Protocol`
/// (response envelope carries an error object or lacks a `result` field).
/// A JSON `null` result is a present, usable result and is returned as-is;
/// `clique_getSigner` relies on that. Hex-encoded integers in results are
/// decoded by the caller, never here.
#[async_trait]
pub trait JsonRpcClient: Send + Sync {
    async fn call(&self, method: &str, params: Vec<Value>) -> SyncResult<Value>;
}

/// The persisted block table: watermark reads and idempotent upserts.
///
/// The store is the single source of truth for resumability; controllers
/// re-derive their watermarks from it on every iteration and keep no cursor
/// of their own. All write failures map to `SyncError::Persistence`.
#[async_trait]
pub trait BlockStore: Send + Sync {
    /// Highest persisted block number, `None` when the table is empty.
    async fn max_block_number(&self) -> SyncResult<Option<u64>>;

    /// Lowest persisted block number, `None` when the table is empty.
    async fn min_block_number(&self) -> SyncResult<Option<u64>>;

    /// Insert or overwrite the row keyed by `record.block_number`.
    async fn upsert_block(&self, record: &BlockRecord) -> SyncResult<()>;

    /// Upsert a batch as one statement.
    ///
    /// When the same block number occurs more than once in `records`, the
    /// later occurrence wins.
    async fn upsert_batch(&self, records: &[BlockRecord]) -> SyncResult<()>;

    /// Most recent block timestamp attributed to a signer address
    /// (lowercase). Read-only; used by the liveness endpoint.
    async fn last_signed_timestamp(&self, signer_address: &str) -> SyncResult<Option<u64>>;
}
