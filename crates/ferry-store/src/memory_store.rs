//! In-memory block storage backend.

use std::collections::HashMap;
use std::sync::RwLock;

use bytes::Bytes;
use cid::Cid;
use ferry_types::{Block, block_cid};
use tracing::debug;

use crate::error::StoreError;
use crate::traits::BlockStore;

/// In-memory block store backed by a `RwLock<HashMap>`.
///
/// Tracks total bytes stored against a configurable maximum.
pub struct MemoryBlockStore {
    blocks: RwLock<HashMap<Cid, Bytes>>,
    max_bytes: u64,
}

impl MemoryBlockStore {
    /// Create a store with the given capacity limit.
    pub fn new(max_bytes: u64) -> Self {
        Self {
            blocks: RwLock::new(HashMap::new()),
            max_bytes,
        }
    }

    /// Create a store with no practical capacity limit.
    pub fn unbounded() -> Self {
        Self::new(u64::MAX)
    }

    /// Bytes currently stored.
    pub fn used_bytes(&self) -> u64 {
        let map = self.blocks.read().expect("lock poisoned");
        Self::used_bytes_unlocked(&map)
    }

    fn used_bytes_unlocked(map: &HashMap<Cid, Bytes>) -> u64 {
        map.values().map(|v| v.len() as u64).sum()
    }

    /// Re-hash a stored block and compare with its CID.
    pub fn verify(&self, cid: &Cid) -> Result<bool, StoreError> {
        let map = self.blocks.read().expect("lock poisoned");
        match map.get(cid) {
            Some(data) => Ok(block_cid(data) == *cid),
            None => Err(StoreError::NotFound(*cid)),
        }
    }
}

#[async_trait::async_trait]
impl BlockStore for MemoryBlockStore {
    async fn put(&self, block: Block) -> Result<(), StoreError> {
        let mut map = self.blocks.write().expect("lock poisoned");
        if map.contains_key(&block.cid) {
            return Ok(());
        }
        let used = Self::used_bytes_unlocked(&map);
        if used + block.len() > self.max_bytes {
            return Err(StoreError::CapacityExceeded {
                needed: block.len(),
                available: self.max_bytes.saturating_sub(used),
            });
        }
        debug!(cid = %block.cid, size = block.len(), "storing block in memory");
        map.insert(block.cid, block.data);
        Ok(())
    }

    async fn get(&self, cid: &Cid) -> Result<Option<Block>, StoreError> {
        let map = self.blocks.read().expect("lock poisoned");
        Ok(map.get(cid).map(|data| Block {
            cid: *cid,
            data: data.clone(),
        }))
    }

    async fn delete(&self, cid: &Cid) -> Result<(), StoreError> {
        let mut map = self.blocks.write().expect("lock poisoned");
        map.remove(cid);
        Ok(())
    }

    async fn contains(&self, cid: &Cid) -> Result<bool, StoreError> {
        let map = self.blocks.read().expect("lock poisoned");
        Ok(map.contains_key(cid))
    }

    async fn list(&self) -> Result<Vec<Cid>, StoreError> {
        let map = self.blocks.read().expect("lock poisoned");
        Ok(map.keys().copied().collect())
    }
}
