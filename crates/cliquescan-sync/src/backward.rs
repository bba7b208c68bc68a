//! Backward synchronization: fill history from the low watermark down to
//! genesis.
//!
//! Symmetric to the forward controller, walking decreasing block numbers
//! with the same per-block skip-on-error policy and the same rate-limit
//! pause. This is the only controller with a natural terminal state: once
//! the low watermark reaches block 0 the backfill is complete and the
//! controller exits.

use log::{error, info, warn};
use tokio::time::sleep;

use crate::{
    BlockStore, GasPriceSnapshot, JsonRpcClient, NodeClient, SyncConfig, SyncResult,
};

/// States of the backward controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackwardState {
    /// Read the low watermark and decide whether anything is left to fill.
    DetermineRange,
    /// Process `next`, then walk toward genesis.
    Iterate { next: u64 },
    /// Watermark read failed; sleep before retrying.
    BackoffWait,
    /// Backfill reached block 0; the controller exits.
    Done,
}

/// Retreats the low watermark toward genesis, then stops.
pub struct BackwardSync<C, S> {
    node: NodeClient<C>,
    store: S,
    config: SyncConfig,
    state: BackwardState,
    gas_price: GasPriceSnapshot,
}

impl<C: JsonRpcClient, S: BlockStore> BackwardSync<C, S> {
    pub fn new(node: NodeClient<C>, store: S, config: SyncConfig) -> Self {
        Self {
            node,
            store,
            config,
            state: BackwardState::DetermineRange,
            gas_price: GasPriceSnapshot::new(),
        }
    }

    pub fn state(&self) -> BackwardState {
        self.state
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Execute the current state, including its pause, and transition.
    pub async fn tick(&mut self) {
        self.state = match self.state {
            BackwardState::DetermineRange => match self.store.min_block_number().await {
                Ok(low) => {
                    let low = low.unwrap_or(self.config.default_start_block);
                    if low == 0 {
                        info!("all blocks processed down to genesis");
                        BackwardState::Done
                    } else {
                        info!("backfilling from {} toward genesis", low - 1);
                        BackwardState::Iterate { next: low - 1 }
                    }
                }
                Err(e) => {
                    error!("failed to read low watermark: {}", e);
                    BackwardState::BackoffWait
                }
            },
            BackwardState::Iterate { next } => {
                self.process_block(next).await;
                sleep(self.config.block_delay).await;
                if next == 0 {
                    BackwardState::DetermineRange
                } else {
                    BackwardState::Iterate { next: next - 1 }
                }
            }
            BackwardState::BackoffWait => {
                sleep(self.config.backoff_delay).await;
                BackwardState::DetermineRange
            }
            BackwardState::Done => BackwardState::Done,
        };
    }

    /// Drive the state machine until genesis is reached.
    pub async fn run(&mut self) {
        info!("starting backward sync");
        while self.state != BackwardState::Done {
            self.tick().await;
        }
        info!("backward sync finished");
    }

    async fn process_block(&mut self, number: u64) {
        if let Err(e) = self.ingest(number).await {
            // Best-effort: the block is skipped for this run, not retried.
            warn!("skipping block {}: {}", number, e);
        }
    }

    async fn ingest(&mut self, number: u64) -> SyncResult<()> {
        let gas_price = self.gas_price.get(&self.node).await?;
        match self.node.block_record(number, gas_price).await? {
            Some(record) => {
                self.store.upsert_block(&record).await?;
                info!(
                    "persisted block {} signed by {}",
                    record.block_number, record.signer_address
                );
                Ok(())
            }
            None => {
                info!("block {} has no resolvable signer, skipping", number);
                Ok(())
            }
        }
    }
}
