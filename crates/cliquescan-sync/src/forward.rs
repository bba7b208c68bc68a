//! Forward synchronization: advance the high watermark toward the chain
//! head, staying a configured confirmation lag behind it.
//!
//! The controller is an explicit state machine so tests can drive single
//! transitions without running the infinite loop:
//!
//! ```text
//! DetermineRange -> Iterate -> ... -> Iterate -> DetermineRange
//!       |                                             |
//!       +-> Idle --------------> DetermineRange       |
//!       +-> BackoffWait -------> DetermineRange <-----+
//! ```
//!
//! Each `Iterate` tick runs one per-block unit (fetch, fee, resolve,
//! upsert) followed by the fixed rate-limit pause. A failure inside the
//! unit is logged and the block is skipped for good; a failure while
//! determining the range triggers a backoff and a fresh range read.

use log::{error, info, warn};
use tokio::time::sleep;

use crate::{
    BlockStore, GasPriceSnapshot, JsonRpcClient, NodeClient, SyncConfig, SyncResult,
};

/// States of the forward controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardState {
    /// Read the chain head and high watermark, compute the next range.
    DetermineRange,
    /// Process `next`, then advance toward `target` (inclusive).
    Iterate { next: u64, target: u64 },
    /// Caught up to `head - confirmation_lag`; sleep before re-checking.
    Idle,
    /// Range determination failed; sleep before retrying.
    BackoffWait,
}

/// Advances the high watermark toward the (lagged) chain head.
///
/// Runs indefinitely; there is no terminal state under normal operation.
pub struct ForwardSync<C, S> {
    node: NodeClient<C>,
    store: S,
    config: SyncConfig,
    state: ForwardState,
    gas_price: GasPriceSnapshot,
}

impl<C: JsonRpcClient, S: BlockStore> ForwardSync<C, S> {
    pub fn new(node: NodeClient<C>, store: S, config: SyncConfig) -> Self {
        Self {
            node,
            store,
            config,
            state: ForwardState::DetermineRange,
            gas_price: GasPriceSnapshot::new(),
        }
    }

    pub fn state(&self) -> ForwardState {
        self.state
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Execute the current state, including its pause, and transition.
    pub async fn tick(&mut self) {
        self.state = match self.state {
            ForwardState::DetermineRange => match self.determine_range().await {
                Ok(Some((next, target))) => {
                    info!("syncing forward from {} to {}", next, target);
                    ForwardState::Iterate { next, target }
                }
                Ok(None) => {
                    info!("no new blocks beyond the confirmation lag");
                    ForwardState::Idle
                }
                Err(e) => {
                    error!("failed to determine forward range: {}", e);
                    ForwardState::BackoffWait
                }
            },
            ForwardState::Iterate { next, target } => {
                self.process_block(next).await;
                sleep(self.config.block_delay).await;
                if next >= target {
                    ForwardState::DetermineRange
                } else {
                    ForwardState::Iterate {
                        next: next + 1,
                        target,
                    }
                }
            }
            ForwardState::Idle => {
                sleep(self.config.idle_interval).await;
                ForwardState::DetermineRange
            }
            ForwardState::BackoffWait => {
                sleep(self.config.backoff_delay).await;
                ForwardState::DetermineRange
            }
        };
    }

    /// Drive the state machine forever.
    pub async fn run(&mut self) {
        info!("starting forward sync");
        loop {
            self.tick().await;
        }
    }

    async fn determine_range(&self) -> SyncResult<Option<(u64, u64)>> {
        let head = self.node.chain_head().await?;
        let target = head.saturating_sub(self.config.confirmation_lag);
        // An empty store starts at the configured default block itself;
        // otherwise resume just above the high watermark.
        let next = match self.store.max_block_number().await? {
            Some(high) => high + 1,
            None => self.config.default_start_block,
        };
        if target < next {
            return Ok(None);
        }
        Ok(Some((next, target)))
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockBlockStore, MockChain};
    use std::time::{Duration, Instant};

    const SIGNER: &str = "0xABCDEF0000000000000000000000000000000001";

    fn config(start: u64) -> SyncConfig {
        SyncConfig {
            default_start_block: start,
            confirmation_lag: 10,
            block_delay: Duration::ZERO,
            idle_interval: Duration::from_millis(1),
            backoff_delay: Duration::from_millis(1),
        }
    }

    async fn drive_until_idle<C: JsonRpcClient, S: BlockStore>(sync: &mut ForwardSync<C, S>) {
        for _ in 0..500 {
            if sync.state() == ForwardState::Idle {
                return;
            }
            sync.tick().await;
        }
        panic!("controller did not reach Idle");
    }

    #[tokio::test]
    async fn catches_up_to_the_lagged_head_from_an_empty_store() {
        let chain = MockChain::new();
        chain.add_range(4_834_000..=4_834_050, SIGNER);
        let store = MockBlockStore::new();
        let node = NodeClient::new(chain);
        let mut sync = ForwardSync::new(node, store.clone(), config(4_834_000));

        drive_until_idle(&mut sync).await;

        let expected: Vec<u64> = (4_834_000..=4_834_040).collect();
        assert_eq!(store.block_numbers(), expected);
        // Nothing above head - lag is ever written.
        assert!(store.block_numbers().iter().all(|&n| n <= 4_834_040));
    }

    #[tokio::test]
    async fn resumes_above_the_high_watermark() {
        let chain = MockChain::new();
        chain.add_range(0..=60, SIGNER);
        let store = MockBlockStore::new();
        let node = NodeClient::new(chain.clone());
        let mut sync = ForwardSync::new(node, store.clone(), config(0));

        // Seed the store as a previous run would have left it.
        let seeded = NodeClient::new(chain);
        let record = seeded.block_record(20, 1).await.unwrap().unwrap();
        store.upsert_block(&record).await.unwrap();

        drive_until_idle(&mut sync).await;

        let expected: Vec<u64> = (20..=50).collect();
        assert_eq!(store.block_numbers(), expected);
    }

    #[tokio::test]
    async fn stores_normalized_records() {
        let chain = MockChain::new();
        chain.add_range(0..=20, SIGNER);
        chain.set_gas_price(3);
        let store = MockBlockStore::new();
        let mut sync = ForwardSync::new(NodeClient::new(chain), store.clone(), config(0));

        drive_until_idle(&mut sync).await;

        let record = store.get(5).unwrap();
        assert_eq!(record.signer_address, SIGNER.to_lowercase());
        assert_eq!(record.timestamp, 1_700_000_005);
        assert_eq!(record.transaction_count, 1);
        assert_eq!(record.fee_earned, 21_000 * 3);
    }

    #[tokio::test]
    async fn unresolvable_signer_is_skipped_without_raising() {
        let chain = MockChain::new();
        chain.add_range(0..=20, SIGNER);
        chain.add_block(5, None);
        let store = MockBlockStore::new();
        let mut sync = ForwardSync::new(NodeClient::new(chain), store.clone(), config(0));

        drive_until_idle(&mut sync).await;

        assert!(store.get(5).is_none());
        assert!(store.get(4).is_some());
        assert!(store.get(6).is_some());
    }

    #[tokio::test]
    async fn failed_block_is_skipped_and_the_range_completes() {
        let chain = MockChain::new();
        chain.add_range(0..=20, SIGNER);
        chain.fail_block(7);
        let store = MockBlockStore::new();
        let mut sync = ForwardSync::new(NodeClient::new(chain), store.clone(), config(0));

        drive_until_idle(&mut sync).await;

        assert!(store.get(7).is_none());
        assert_eq!(store.len(), 10);
    }

    #[tokio::test]
    async fn range_failure_backs_off_then_recovers() {
        let chain = MockChain::new();
        chain.add_range(0..=15, SIGNER);
        chain.set_head_available(false);
        let store = MockBlockStore::new();
        let mut sync = ForwardSync::new(NodeClient::new(chain.clone()), store.clone(), config(0));

        sync.tick().await;
        assert_eq!(sync.state(), ForwardState::BackoffWait);

        chain.set_head_available(true);
        drive_until_idle(&mut sync).await;
        let expected: Vec<u64> = (0..=5).collect();
        assert_eq!(store.block_numbers(), expected);
    }

    #[tokio::test]
    async fn idempotent_upsert_keeps_the_latest_payload() {
        let store = MockBlockStore::new();
        let mut record = crate::BlockRecord {
            block_number: 9,
            timestamp: 1,
            hash: "0xaa".to_string(),
            signer_address: "0x01".to_string(),
            transaction_count: 0,
            fee_earned: 0,
        };
        store.upsert_block(&record).await.unwrap();
        record.timestamp = 2;
        record.signer_address = "0x02".to_string();
        store.upsert_block(&record).await.unwrap();

        assert_eq!(store.len(), 1);
        let kept = store.get(9).unwrap();
        assert_eq!(kept.timestamp, 2);
        assert_eq!(kept.signer_address, "0x02");
    }

    #[tokio::test]
    async fn rate_limit_floor_holds_between_blocks() {
        let chain = MockChain::new();
        chain.add_range(0..=30, SIGNER);
        let store = MockBlockStore::new();
        let mut cfg = config(0);
        cfg.block_delay = Duration::from_millis(20);
        let mut sync = ForwardSync::new(NodeClient::new(chain), store, cfg);

        // Enter Iterate first, then time three per-block ticks.
        sync.tick().await;
        assert!(matches!(sync.state(), ForwardState::Iterate { .. }));
        let started = Instant::now();
        sync.tick().await;
        sync.tick().await;
        sync.tick().await;
        assert!(started.elapsed() >= Duration::from_millis(60));
    }
}
