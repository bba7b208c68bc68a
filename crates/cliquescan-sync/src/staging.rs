//! CSV staging: a buffered append-only writer and the ingestion walker
//! that feeds it instead of the store.
//!
//! The staging file decouples ingestion from bulk loading. The writer is a
//! pure write-amortization layer: rows buffered but not yet flushed are
//! lost when the process dies, which is an accepted durability gap.

use std::path::{Path, PathBuf};

use log::{info, warn};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::time::sleep;

use crate::{
    BlockRecord, GasPriceSnapshot, JsonRpcClient, NodeClient, SyncConfig, SyncError, SyncResult,
    CSV_HEADER,
};

/// Buffers resolved records and flushes them to an append-only delimited
/// file, writing the fixed header row first when the file does not exist
/// yet.
pub struct CsvStagingWriter {
    path: PathBuf,
    batch_size: usize,
    buffer: Vec<BlockRecord>,
}

impl CsvStagingWriter {
    pub fn new(path: impl Into<PathBuf>, batch_size: usize) -> Self {
        Self {
            path: path.into(),
            batch_size: batch_size.max(1),
            buffer: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rows buffered and not yet flushed.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Buffer one record, flushing when the batch size is reached.
    pub async fn stage(&mut self, record: BlockRecord) -> SyncResult<()> {
        self.buffer.push(record);
        if self.buffer.len() >= self.batch_size {
            self.flush().await?;
        }
        Ok(())
    }

    /// Append all buffered rows to the staging file.
    pub async fn flush(&mut self) -> SyncResult<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let mut chunk = String::new();
        if !file_exists(&self.path).await {
            chunk.push_str(CSV_HEADER);
            chunk.push('\n');
        }
        for record in &self.buffer {
            chunk.push_str(&record.to_csv_row());
            chunk.push('\n');
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| {
                SyncError::Persistence(format!("cannot open {}: {}", self.path.display(), e))
            })?;
        file.write_all(chunk.as_bytes()).await.map_err(|e| {
            SyncError::Persistence(format!("cannot append to {}: {}", self.path.display(), e))
        })?;
        info!(
            "flushed {} staged rows to {}",
            self.buffer.len(),
            self.path.display()
        );
        self.buffer.clear();
        Ok(())
    }
}

async fn file_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// Walks block numbers upward from a fixed start and stages every
/// resolvable block.
///
/// The staging path has no watermark: the file is never consulted, the
/// walker just counts upward and never terminates. Per-block failures are
/// logged, penalized with the backoff delay, and the block is skipped.
pub struct StagingSync<C> {
    node: NodeClient<C>,
    writer: CsvStagingWriter,
    next: u64,
    config: SyncConfig,
    gas_price: GasPriceSnapshot,
}

impl<C: JsonRpcClient> StagingSync<C> {
    pub fn new(
        node: NodeClient<C>,
        writer: CsvStagingWriter,
        start_block: u64,
        config: SyncConfig,
    ) -> Self {
        Self {
            node,
            writer,
            next: start_block,
            config,
            gas_price: GasPriceSnapshot::new(),
        }
    }

    /// The block number the next tick will process.
    pub fn next_block(&self) -> u64 {
        self.next
    }

    pub fn writer(&self) -> &CsvStagingWriter {
        &self.writer
    }

    /// Process one block number and advance to its successor.
    pub async fn tick(&mut self) {
        if let Err(e) = self.ingest(self.next).await {
            warn!("skipping block {}: {}", self.next, e);
            sleep(self.config.backoff_delay).await;
        }
        sleep(self.config.block_delay).await;
        self.next += 1;
    }

    /// Drive the walker forever.
    pub async fn run(&mut self) {
        info!(
            "staging blocks from {} into {}",
            self.next,
            self.writer.path.display()
        );
        loop {
            self.tick().await;
        }
    }

    async fn ingest(&mut self, number: u64) -> SyncResult<()> {
        let gas_price = self.gas_price.get(&self.node).await?;
        match self.node.block_record(number, gas_price).await? {
            Some(record) => self.writer.stage(record).await,
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
    use crate::mock::MockChain;
    use std::time::Duration;

    fn record(number: u64) -> BlockRecord {
        BlockRecord {
            block_number: number,
            timestamp: number,
            hash: format!("0x{:064x}", number),
            signer_address: "0x01".to_string(),
            transaction_count: 0,
            fee_earned: 0,
        }
    }

    #[tokio::test]
    async fn flushes_once_the_batch_size_is_reached() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocks.csv");
        let mut writer = CsvStagingWriter::new(&path, 2);

        writer.stage(record(1)).await.unwrap();
        assert_eq!(writer.buffered(), 1);
        assert!(!path.exists());

        writer.stage(record(2)).await.unwrap();
        assert_eq!(writer.buffered(), 0);

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines[0], CSV_HEADER);
        assert_eq!(lines.len(), 3);
    }

    #[tokio::test]
    async fn header_is_written_only_for_a_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocks.csv");
        let mut writer = CsvStagingWriter::new(&path, 1);

        writer.stage(record(1)).await.unwrap();
        writer.stage(record(2)).await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let headers = contents
            .lines()
            .filter(|line| *line == CSV_HEADER)
            .count();
        assert_eq!(headers, 1);
        assert_eq!(contents.lines().count(), 3);
    }

    #[tokio::test]
    async fn duplicate_rows_are_appended_not_deduplicated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocks.csv");
        let mut writer = CsvStagingWriter::new(&path, 1);

        writer.stage(record(1)).await.unwrap();
        writer.stage(record(1)).await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 3);
    }

    #[tokio::test]
    async fn walker_stages_resolvable_blocks_and_skips_the_rest() {
        let chain = MockChain::new();
        chain.add_range(0..=9, "0xaa00000000000000000000000000000000000001");
        chain.add_block(3, None);
        chain.fail_block(6);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocks.csv");
        let writer = CsvStagingWriter::new(&path, 1);
        let config = SyncConfig {
            block_delay: Duration::ZERO,
            backoff_delay: Duration::from_millis(1),
            ..SyncConfig::default()
        };
        let mut sync = StagingSync::new(NodeClient::new(chain), writer, 0, config);

        for _ in 0..10 {
            sync.tick().await;
        }
        assert_eq!(sync.next_block(), 10);

        let contents = std::fs::read_to_string(&path).unwrap();
        let staged: Vec<u64> = contents
            .lines()
            .skip(1)
            .map(|line| BlockRecord::from_csv_row(line).unwrap().block_number)
            .collect();
        assert_eq!(staged, vec![0, 1, 2, 4, 5, 7, 8, 9]);
    }
}
