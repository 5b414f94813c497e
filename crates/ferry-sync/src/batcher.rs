//! Coalesces block uploads from many files into bounded push requests.
//!
//! Blocks are first collected per file. A per-file batch is emitted on its
//! own once it is nearly full; smaller batches that have waited at least
//! `max_batch_wait` are packed together into mixed requests on the next
//! [`Batcher::tick`]. The batcher never talks to the node: requests go out
//! on a bounded channel drained by the pushers.

use std::collections::HashMap;
use std::mem;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use ferry_node::FileBlocks;
use ferry_types::config::BatcherConfig;
use ferry_types::{Block, FileId, FullFileId};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A batch older than this many `max_batch_wait` periods is emitted even if
/// it is below `min_mixed_fill`.
const STALE_FACTOR: u32 = 10;

/// Errors returned by the batcher.
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    /// A single block cannot fit in any request.
    #[error("block of {size} bytes exceeds the batch limit of {max} bytes")]
    BlockTooLarge { size: u64, max: u64 },

    /// Nobody drains the request channel anymore.
    #[error("batcher closed")]
    Closed,
}

/// One multi-file push.
#[derive(Debug, Clone, Default)]
pub struct BlockPushRequest {
    pub files: Vec<FileBlocks>,
    /// Owning object of each file in `files`.
    pub object_ids: HashMap<FullFileId, String>,
}

impl BlockPushRequest {
    /// Total raw bytes across every file.
    pub fn size(&self) -> u64 {
        self.files.iter().map(FileBlocks::size).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    fn push(&mut self, key: FullFileId, batch: Batch) {
        self.object_ids.insert(key.clone(), batch.object_id);
        self.files.push(FileBlocks {
            space_id: key.space_id,
            file_id: key.file_id,
            blocks: batch.blocks,
        });
    }
}

#[derive(Debug)]
struct Batch {
    object_id: String,
    blocks: Vec<Block>,
    total_size: u64,
    created_at: Instant,
}

impl Batch {
    fn new(object_id: &str) -> Self {
        Self {
            object_id: object_id.to_string(),
            blocks: Vec::new(),
            total_size: 0,
            created_at: Instant::now(),
        }
    }
}

/// Size- and time-bounded block batcher.
pub struct Batcher {
    cfg: BatcherConfig,
    batches: Mutex<HashMap<FullFileId, Batch>>,
    tx: mpsc::Sender<BlockPushRequest>,
}

impl Batcher {
    /// Create a batcher and the receiving end of its request channel.
    pub fn new(cfg: BatcherConfig) -> (Self, mpsc::Receiver<BlockPushRequest>) {
        let (tx, rx) = mpsc::channel(cfg.channel_capacity.max(1));
        let batcher = Self {
            cfg,
            batches: Mutex::new(HashMap::new()),
            tx,
        };
        (batcher, rx)
    }

    /// Upper bound on the payload of one request.
    pub fn max_batch_size(&self) -> u64 {
        self.cfg.max_batch_size
    }

    /// Queue `blocks` of one file. May emit requests when the file's batch
    /// fills up, waiting for room on the channel.
    pub async fn add_file(
        &self,
        space_id: &str,
        file_id: FileId,
        object_id: &str,
        blocks: Vec<Block>,
    ) -> Result<(), BatchError> {
        let max = self.max_batch_size();
        if let Some(big) = blocks.iter().find(|b| b.len() > max) {
            return Err(BatchError::BlockTooLarge { size: big.len(), max });
        }

        let key = FullFileId::new(space_id, file_id);
        let mut ready = Vec::new();
        {
            let mut batches = self.batches.lock().expect("lock poisoned");
            for block in blocks {
                let batch = batches.entry(key.clone()).or_insert_with(|| Batch::new(object_id));
                if batch.total_size + block.len() > max {
                    let full = mem::replace(batch, Batch::new(object_id));
                    ready.push(single(key.clone(), full));
                }

                let batch = batches.entry(key.clone()).or_insert_with(|| Batch::new(object_id));
                batch.total_size += block.len();
                batch.blocks.push(block);
                if batch.total_size >= max - max / 10 {
                    if let Some(full) = batches.remove(&key) {
                        ready.push(single(key.clone(), full));
                    }
                }
            }
        }
        self.emit(ready).await
    }

    /// Pack batches that have waited long enough into mixed requests.
    pub async fn tick(&self) -> Result<(), BatchError> {
        let wait = self.cfg.max_batch_wait();
        let stale = wait * STALE_FACTOR;
        let min_fill = self.cfg.min_mixed_fill;
        let now = Instant::now();

        let taken = {
            let mut batches = self.batches.lock().expect("lock poisoned");
            let keys: Vec<FullFileId> = batches
                .iter()
                .filter(|(_, b)| {
                    let age = now.duration_since(b.created_at);
                    age >= stale || (age >= wait && b.total_size >= min_fill)
                })
                .map(|(k, _)| k.clone())
                .collect();
            keys.into_iter()
                .filter_map(|k| batches.remove(&k).map(|b| (k, b)))
                .collect()
        };
        self.emit(self.pack(taken)).await
    }

    /// Emit every pending batch regardless of age.
    pub async fn flush_all(&self) -> Result<(), BatchError> {
        let taken: Vec<(FullFileId, Batch)> = {
            let mut batches = self.batches.lock().expect("lock poisoned");
            batches.drain().collect()
        };
        self.emit(self.pack(taken)).await
    }

    /// Files with blocks waiting in a batch.
    pub fn pending_files(&self) -> usize {
        self.batches.lock().expect("lock poisoned").len()
    }

    /// Tick every `max_batch_wait` until `cancel` fires, then flush.
    pub async fn run(&self, cancel: CancellationToken) {
        let period = self.cfg.max_batch_wait().max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!(error = %e, "batcher tick failed");
                    }
                }
            }
        }
        if let Err(e) = self.flush_all().await {
            warn!(error = %e, "final batcher flush failed");
        }
        debug!("batcher stopped");
    }

    /// Oldest first, each request bounded by `max_batch_size`.
    fn pack(&self, mut taken: Vec<(FullFileId, Batch)>) -> Vec<BlockPushRequest> {
        taken.sort_by_key(|(_, b)| b.created_at);
        let mut out = Vec::new();
        let mut mixed = BlockPushRequest::default();
        let mut mixed_size = 0;
        for (key, batch) in taken {
            if !mixed.is_empty() && mixed_size + batch.total_size > self.max_batch_size() {
                out.push(mem::take(&mut mixed));
                mixed_size = 0;
            }
            mixed_size += batch.total_size;
            mixed.push(key, batch);
        }
        if !mixed.is_empty() {
            out.push(mixed);
        }
        out
    }

    async fn emit(&self, requests: Vec<BlockPushRequest>) -> Result<(), BatchError> {
        for req in requests {
            debug!(files = req.files.len(), bytes = req.size(), "emitting push request");
            self.tx.send(req).await.map_err(|_| BatchError::Closed)?;
        }
        Ok(())
    }
}

fn single(key: FullFileId, batch: Batch) -> BlockPushRequest {
    let mut req = BlockPushRequest::default();
    req.push(key, batch);
    req
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_id(seed: &str) -> FileId {
        FileId::from_cid(Block::new(seed.as_bytes().to_vec()).cid).unwrap()
    }

    fn blocks(count: usize, size: usize) -> Vec<Block> {
        (0..count)
            .map(|i| {
                let mut data = vec![0u8; size];
                data[..8].copy_from_slice(&(i as u64).to_be_bytes());
                Block::new(data)
            })
            .collect()
    }

    fn batcher(max: u64, wait_ms: u64) -> (Batcher, mpsc::Receiver<BlockPushRequest>) {
        Batcher::new(BatcherConfig {
            max_batch_size: max,
            max_batch_wait_ms: wait_ms,
            channel_capacity: 100,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_rejects_oversized_block() {
        let (batcher, _rx) = batcher(100, 10);
        let err = batcher
            .add_file("s", file_id("f"), "o", blocks(1, 101))
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::BlockTooLarge { size: 101, max: 100 }));
        assert_eq!(batcher.pending_files(), 0);
    }

    #[tokio::test]
    async fn test_full_batches_are_emitted_immediately() {
        let (batcher, mut rx) = batcher(100, 60_000);
        // 40-byte blocks: two fit (80), the third overflows; 5 blocks give
        // two full batches and one leftover.
        batcher.add_file("s", file_id("f"), "o", blocks(5, 40)).await.unwrap();

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(first.size(), 80);
        assert_eq!(second.size(), 80);
        assert_eq!(first.object_ids.values().next().unwrap(), "o");
        assert_eq!(batcher.pending_files(), 1);
    }

    #[tokio::test]
    async fn test_nearly_full_batch_is_flushed() {
        let (batcher, mut rx) = batcher(100, 60_000);
        batcher.add_file("s", file_id("f"), "o", blocks(1, 95)).await.unwrap();
        assert_eq!(rx.try_recv().unwrap().size(), 95);
        assert_eq!(batcher.pending_files(), 0);
    }

    #[tokio::test]
    async fn test_tick_mixes_aged_batches() {
        let (batcher, mut rx) = batcher(100, 20);
        batcher.add_file("s", file_id("a"), "oa", blocks(1, 30)).await.unwrap();
        batcher.add_file("s", file_id("b"), "ob", blocks(1, 30)).await.unwrap();
        batcher.add_file("t", file_id("c"), "oc", blocks(1, 50)).await.unwrap();

        // Too young: nothing moves.
        batcher.tick().await.unwrap();
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(30)).await;
        batcher.tick().await.unwrap();

        let mut sizes = vec![rx.try_recv().unwrap().size(), rx.try_recv().unwrap().size()];
        sizes.sort();
        // 30 + 30 + 50 does not fit in 100: two mixed requests.
        assert!(sizes == vec![30, 80] || sizes == vec![50, 60]);
        assert!(rx.try_recv().is_err());
        assert_eq!(batcher.pending_files(), 0);
    }

    #[tokio::test]
    async fn test_min_fill_holds_small_batches() {
        let (batcher, mut rx) = Batcher::new(BatcherConfig {
            max_batch_size: 100,
            max_batch_wait_ms: 10,
            min_mixed_fill: 50,
            channel_capacity: 10,
        });
        batcher.add_file("s", file_id("a"), "oa", blocks(1, 20)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        batcher.tick().await.unwrap();
        assert!(rx.try_recv().is_err());

        // Stale batches go out anyway.
        tokio::time::sleep(Duration::from_millis(100)).await;
        batcher.tick().await.unwrap();
        assert_eq!(rx.try_recv().unwrap().size(), 20);
    }

    #[tokio::test]
    async fn test_flush_all_and_closed_channel() {
        let (batcher, mut rx) = batcher(100, 60_000);
        batcher.add_file("s", file_id("a"), "oa", blocks(1, 10)).await.unwrap();
        batcher.add_file("s", file_id("b"), "ob", blocks(1, 10)).await.unwrap();
        batcher.flush_all().await.unwrap();

        let req = rx.try_recv().unwrap();
        assert_eq!(req.files.len(), 2);
        assert_eq!(req.object_ids.len(), 2);

        drop(rx);
        batcher.add_file("s", file_id("c"), "oc", blocks(1, 10)).await.unwrap();
        assert!(matches!(batcher.flush_all().await, Err(BatchError::Closed)));
    }
}
