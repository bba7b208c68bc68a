//! Bulk loading of a staging file into the block store.
//!
//! The loader is a pull-based consumer: it requests the next row only after
//! any in-flight batch upsert has resolved, so memory stays bounded by the
//! batch size regardless of file size.

use std::path::Path;

use log::{error, info, warn};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};

use crate::{BlockRecord, BlockStore, SyncError, SyncResult, CSV_HEADER};

/// Outcome of one bulk-load run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadOutcome {
    /// Data rows read from the file.
    pub rows_read: u64,
    /// Rows upserted into the store.
    pub rows_upserted: u64,
    /// Rows dropped: malformed, or part of a failed mid-stream batch.
    pub rows_dropped: u64,
    /// Whether the max-block bound halted consumption early.
    pub reached_bound: bool,
}

/// Streams a staging file and upserts it into the store in batches.
pub struct CsvBulkLoader<S> {
    store: S,
    batch_size: usize,
    max_block: Option<u64>,
}

impl<S: BlockStore> CsvBulkLoader<S> {
    pub fn new(store: S, batch_size: usize, max_block: Option<u64>) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            max_block,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Load `path` into the store.
    ///
    /// A failed mid-stream batch is logged and dropped while the stream
    /// continues. Failing to read the file, or to flush the final batch at
    /// the max-block bound, aborts the run.
    pub async fn load(&self, path: &Path) -> SyncResult<LoadOutcome> {
        let file = File::open(path).await.map_err(|e| {
            SyncError::Persistence(format!(
                "cannot open staging file {}: {}",
                path.display(),
                e
            ))
        })?;
        let mut lines = BufReader::new(file).lines();
        let mut outcome = LoadOutcome::default();
        let mut batch: Vec<BlockRecord> = Vec::with_capacity(self.batch_size);
        let mut first_line = true;

        while let Some(line) = next_line(&mut lines, path).await? {
            if first_line {
                first_line = false;
                if line.trim() == CSV_HEADER {
                    continue;
                }
            }
            if line.trim().is_empty() {
                continue;
            }
            outcome.rows_read += 1;
            let record = match BlockRecord::from_csv_row(&line) {
                Ok(record) => record,
                Err(e) => {
                    warn!("dropping malformed staging row: {}", e);
                    outcome.rows_dropped += 1;
                    continue;
                }
            };
            if let Some(bound) = self.max_block {
                if record.block_number > bound {
                    info!("reached max block {}; halting staging file consumption", bound);
                    outcome.reached_bound = true;
                    // Rows gathered below the bound still land; rows past it
                    // never do. A flush failure here is fatal.
                    if !batch.is_empty() {
                        self.store.upsert_batch(&batch).await?;
                        outcome.rows_upserted += batch.len() as u64;
                    }
                    return Ok(outcome);
                }
            }
            batch.push(record);
            if batch.len() >= self.batch_size {
                self.flush_lossy(&mut batch, &mut outcome).await;
            }
        }
        self.flush_lossy(&mut batch, &mut outcome).await;
        info!(
            "staging file {} consumed: {} rows read, {} upserted, {} dropped",
            path.display(),
            outcome.rows_read,
            outcome.rows_upserted,
            outcome.rows_dropped
        );
        Ok(outcome)
    }

    async fn flush_lossy(&self, batch: &mut Vec<BlockRecord>, outcome: &mut LoadOutcome) {
        if batch.is_empty() {
            return;
        }
        match self.store.upsert_batch(batch).await {
            Ok(()) => outcome.rows_upserted += batch.len() as u64,
            Err(e) => {
                // Rows in a failed batch are dropped, not retried.
                error!("batch upsert of {} rows failed: {}", batch.len(), e);
                outcome.rows_dropped += batch.len() as u64;
            }
        }
        batch.clear();
    }
}

async fn next_line(lines: &mut Lines<BufReader<File>>, path: &Path) -> SyncResult<Option<String>> {
    lines.next_line().await.map_err(|e| {
        SyncError::Persistence(format!(
            "error reading staging file {}: {}",
            path.display(),
            e
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockBlockStore;
    use std::path::PathBuf;

    fn record(number: u64) -> BlockRecord {
        BlockRecord {
            block_number: number,
            timestamp: 1_700_000_000 + number,
            hash: format!("0x{:064x}", number),
            signer_address: "0xaa00000000000000000000000000000000000001".to_string(),
            transaction_count: 2,
            fee_earned: 42_000,
        }
    }

    fn write_staging_file(dir: &tempfile::TempDir, rows: &[BlockRecord]) -> PathBuf {
        let path = dir.path().join("blocks.csv");
        let mut contents = String::from(CSV_HEADER);
        contents.push('\n');
        for row in rows {
            contents.push_str(&row.to_csv_row());
            contents.push('\n');
        }
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[tokio::test]
    async fn bound_enforcement() {
        let dir = tempfile::tempdir().unwrap();
        let rows: Vec<BlockRecord> = (1..=200).map(record).collect();
        let path = write_staging_file(&dir, &rows);

        let loader = CsvBulkLoader::new(MockBlockStore::new(), 30, Some(100));
        let outcome = loader.load(&path).await.unwrap();

        assert!(outcome.reached_bound);
        assert_eq!(outcome.rows_upserted, 100);
        let expected: Vec<u64> = (1..=100).collect();
        assert_eq!(loader.store().block_numbers(), expected);
    }

    #[tokio::test]
    async fn loading_twice_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let rows: Vec<BlockRecord> = (1..=25).map(record).collect();
        let path = write_staging_file(&dir, &rows);

        let loader = CsvBulkLoader::new(MockBlockStore::new(), 10, None);
        loader.load(&path).await.unwrap();
        let first = loader.store().records();
        loader.load(&path).await.unwrap();
        assert_eq!(loader.store().records(), first);
    }

    #[tokio::test]
    async fn final_partial_batch_is_flushed_at_end_of_input() {
        let dir = tempfile::tempdir().unwrap();
        let rows: Vec<BlockRecord> = (1..=7).map(record).collect();
        let path = write_staging_file(&dir, &rows);

        let loader = CsvBulkLoader::new(MockBlockStore::new(), 5, None);
        let outcome = loader.load(&path).await.unwrap();

        assert_eq!(outcome.rows_upserted, 7);
        assert_eq!(loader.store().len(), 7);
    }

    #[tokio::test]
    async fn failed_batch_is_dropped_and_the_stream_continues() {
        let dir = tempfile::tempdir().unwrap();
        let rows: Vec<BlockRecord> = (1..=20).map(record).collect();
        let path = write_staging_file(&dir, &rows);

        let store = MockBlockStore::new();
        store.fail_batches(1);
        let loader = CsvBulkLoader::new(store, 10, None);
        let outcome = loader.load(&path).await.unwrap();

        assert_eq!(outcome.rows_dropped, 10);
        assert_eq!(outcome.rows_upserted, 10);
        let expected: Vec<u64> = (11..=20).collect();
        assert_eq!(loader.store().block_numbers(), expected);
    }

    #[tokio::test]
    async fn flush_failure_at_the_bound_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let rows: Vec<BlockRecord> = (1..=20).map(record).collect();
        let path = write_staging_file(&dir, &rows);

        let store = MockBlockStore::new();
        store.fail_batches(1);
        let loader = CsvBulkLoader::new(store, 100, Some(10));
        assert!(loader.load(&path).await.is_err());
    }

    #[tokio::test]
    async fn duplicate_rows_keep_the_last_occurrence() {
        let dir = tempfile::tempdir().unwrap();
        let mut rows: Vec<BlockRecord> = (1..=5).map(record).collect();
        let mut updated = record(3);
        updated.timestamp = 9_999;
        rows.push(updated);
        let path = write_staging_file(&dir, &rows);

        let loader = CsvBulkLoader::new(MockBlockStore::new(), 100, None);
        loader.load(&path).await.unwrap();
        assert_eq!(loader.store().get(3).unwrap().timestamp, 9_999);
    }

    #[tokio::test]
    async fn malformed_rows_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocks.csv");
        let mut contents = String::from(CSV_HEADER);
        contents.push('\n');
        contents.push_str(&record(1).to_csv_row());
        contents.push('\n');
        contents.push_str("not,a,real,row\n");
        contents.push_str(&record(2).to_csv_row());
        contents.push('\n');
        std::fs::write(&path, contents).unwrap();

        let loader = CsvBulkLoader::new(MockBlockStore::new(), 100, None);
        let outcome = loader.load(&path).await.unwrap();

        assert_eq!(outcome.rows_read, 3);
        assert_eq!(outcome.rows_dropped, 1);
        assert_eq!(loader.store().block_numbers(), vec![1, 2]);
    }

    #[tokio::test]
    async fn missing_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let loader = CsvBulkLoader::new(MockBlockStore::new(), 100, None);
        assert!(loader.load(&dir.path().join("absent.csv")).await.is_err());
    }
}
