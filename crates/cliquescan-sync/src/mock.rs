//! Mock implementations for testing

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock};

use crate::{BlockRecord, BlockStore, JsonRpcClient, SyncError, SyncResult};

/// One block served by [`MockChain`].
#[derive(Debug, Clone)]
pub struct MockBlock {
    pub hash: String,
    pub timestamp: u64,
    pub gas_used: u64,
    pub transaction_count: u32,
    pub signer: Option<String>,
}

/// Scripted JSON-RPC endpoint backed by an in-memory chain.
#[derive(Debug, Clone)]
pub struct MockChain {
    blocks: Arc<RwLock<HashMap<u64, MockBlock>>>,
    head: Arc<RwLock<u64>>,
    gas_price: Arc<RwLock<u128>>,
    failing_blocks: Arc<RwLock<HashSet<u64>>>,
    head_available: Arc<RwLock<bool>>,
}

impl MockChain {
    pub fn new() -> Self {
        Self {
            blocks: Arc::new(RwLock::new(HashMap::new())),
            head: Arc::new(RwLock::new(0)),
            gas_price: Arc::new(RwLock::new(1)),
            failing_blocks: Arc::new(RwLock::new(HashSet::new())),
            head_available: Arc::new(RwLock::new(true)),
        }
    }

    /// Add a block with a deterministic hash and timestamp.
    pub fn add_block(&self, number: u64, signer: Option<&str>) {
        self.insert(
            number,
            MockBlock {
                hash: format!("0x{:064x}", number),
                timestamp: 1_700_000_000 + number,
                gas_used: 21_000,
                transaction_count: 1,
                signer: signer.map(|s| s.to_string()),
            },
        );
    }

    /// Populate a contiguous range of blocks all signed by `signer`.
    pub fn add_range(&self, range: std::ops::RangeInclusive<u64>, signer: &str) {
        for number in range {
            self.add_block(number, Some(signer));
        }
    }

    pub fn insert(&self, number: u64, block: MockBlock) {
        let mut blocks = self.blocks.write().unwrap();
        blocks.insert(number, block);
        let mut head = self.head.write().unwrap();
        if number > *head {
            *head = number;
        }
    }

    pub fn set_head(&self, head: u64) {
        *self.head.write().unwrap() = head;
    }

    pub fn set_gas_price(&self, price: u128) {
        *self.gas_price.write().unwrap() = price;
    }

    /// Make `eth_getBlockByNumber` fail for this block.
    pub fn fail_block(&self, number: u64) {
        self.failing_blocks.write().unwrap().insert(number);
    }

    /// Toggle whether `eth_blockNumber` succeeds.
    pub fn set_head_available(&self, available: bool) {
        *self.head_available.write().unwrap() = available;
    }
}

#[async_trait]
impl JsonRpcClient for MockChain {
    async fn call(&self, method: &str, params: Vec<Value>) -> SyncResult<Value> {
        match method {
            "eth_blockNumber" => {
                if !*self.head_available.read().unwrap() {
                    return Err(SyncError::Transport("node unreachable".to_string()));
                }
                Ok(json!(format!("0x{:x}", *self.head.read().unwrap())))
            }
            "eth_gasPrice" => Ok(json!(format!("0x{:x}", *self.gas_price.read().unwrap()))),
            "eth_getBlockByNumber" => {
                let number = params
                    .first()
                    .and_then(Value::as_str)
                    .and_then(|s| u64::from_str_radix(s.trim_start_matches("0x"), 16).ok())
                    .ok_or_else(|| {
                        SyncError::Protocol("bad eth_getBlockByNumber params".to_string())
                    })?;
                if self.failing_blocks.read().unwrap().contains(&number) {
                    return Err(SyncError::Transport(format!(
                        "block {} request timed out",
                        number
                    )));
                }
                match self.blocks.read().unwrap().get(&number) {
                    Some(block) => Ok(json!({
                        "hash": block.hash,
                        "timestamp": format!("0x{:x}", block.timestamp),
                        "gasUsed": format!("0x{:x}", block.gas_used),
                        "transactions": vec![json!({}); block.transaction_count as usize],
                    })),
                    None => Ok(Value::Null),
                }
            }
            "clique_getSigner" => {
                let hash = params.first().and_then(Value::as_str).ok_or_else(|| {
                    SyncError::Protocol("bad clique_getSigner params".to_string())
                })?;
                let blocks = self.blocks.read().unwrap();
                let signer = blocks
                    .values()
                    .find(|block| block.hash == hash)
                    .and_then(|block| block.signer.clone());
                match signer {
                    Some(signer) => Ok(json!(signer)),
                    None => Ok(Value::Null),
                }
            }
            other => Err(SyncError::Protocol(format!("unexpected method {}", other))),
        }
    }
}

/// In-memory block store for testing.
#[derive(Debug, Clone)]
pub struct MockBlockStore {
    records: Arc<RwLock<BTreeMap<u64, BlockRecord>>>,
    available: Arc<RwLock<bool>>,
    failing_batches: Arc<RwLock<u32>>,
}

impl MockBlockStore {
    pub fn new() -> Self {
        Self {
            records: Arc::new(RwLock::new(BTreeMap::new())),
            available: Arc::new(RwLock::new(true)),
            failing_batches: Arc::new(RwLock::new(0)),
        }
    }

    pub fn set_available(&self, available: bool) {
        *self.available.write().unwrap() = available;
    }

    /// Fail the next `count` batch upserts.
    pub fn fail_batches(&self, count: u32) {
        *self.failing_batches.write().unwrap() = count;
    }

    pub fn records(&self) -> Vec<BlockRecord> {
        self.records.read().unwrap().values().cloned().collect()
    }

    pub fn block_numbers(&self) -> Vec<u64> {
        self.records.read().unwrap().keys().copied().collect()
    }

    pub fn get(&self, number: u64) -> Option<BlockRecord> {
        self.records.read().unwrap().get(&number).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> SyncResult<()> {
        if *self.available.read().unwrap() {
            Ok(())
        } else {
            Err(SyncError::Persistence("store not available".to_string()))
        }
    }
}

#[async_trait]
impl BlockStore for MockBlockStore {
    async fn max_block_number(&self) -> SyncResult<Option<u64>> {
        self.check_available()?;
        Ok(self.records.read().unwrap().keys().next_back().copied())
    }

    async fn min_block_number(&self) -> SyncResult<Option<u64>> {
        self.check_available()?;
        Ok(self.records.read().unwrap().keys().next().copied())
    }

    async fn upsert_block(&self, record: &BlockRecord) -> SyncResult<()> {
        self.check_available()?;
        self.records
            .write()
            .unwrap()
            .insert(record.block_number, record.clone());
        Ok(())
    }

    async fn upsert_batch(&self, records: &[BlockRecord]) -> SyncResult<()> {
        self.check_available()?;
        {
            let mut failing = self.failing_batches.write().unwrap();
            if *failing > 0 {
                *failing -= 1;
                return Err(SyncError::Persistence(
                    "injected batch failure".to_string(),
                ));
            }
        }
        let mut map = self.records.write().unwrap();
        for record in records {
            map.insert(record.block_number, record.clone());
        }
        Ok(())
    }

    async fn last_signed_timestamp(&self, signer_address: &str) -> SyncResult<Option<u64>> {
        self.check_available()?;
        Ok(self
            .records
            .read()
            .unwrap()
            .values()
            .filter(|record| record.signer_address == signer_address)
            .map(|record| record.timestamp)
            .max())
    }
}
