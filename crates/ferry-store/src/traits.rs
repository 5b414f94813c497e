//! Core trait for block storage.

use cid::Cid;
use ferry_types::Block;

use crate::error::StoreError;

/// Content-addressed block storage.
///
/// All implementations must be `Send + Sync` for use across async tasks.
#[async_trait::async_trait]
pub trait BlockStore: Send + Sync {
    /// Store a block. Storing the same block twice is a no-op.
    async fn put(&self, block: Block) -> Result<(), StoreError>;

    /// Retrieve a block. Returns `None` if not stored.
    async fn get(&self, cid: &Cid) -> Result<Option<Block>, StoreError>;

    /// Delete a block. Deleting a missing block is not an error.
    async fn delete(&self, cid: &Cid) -> Result<(), StoreError>;

    /// Whether a block is stored.
    async fn contains(&self, cid: &Cid) -> Result<bool, StoreError>;

    /// Every stored CID.
    async fn list(&self) -> Result<Vec<Cid>, StoreError>;

    /// Retrieve several blocks, failing on the first missing one.
    async fn get_many(&self, cids: &[Cid]) -> Result<Vec<Block>, StoreError> {
        let mut out = Vec::with_capacity(cids.len());
        for cid in cids {
            match self.get(cid).await? {
                Some(block) => out.push(block),
                None => return Err(StoreError::NotFound(*cid)),
            }
        }
        Ok(out)
    }
}
