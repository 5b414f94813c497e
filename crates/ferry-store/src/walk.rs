//! Batched traversal of file DAGs.

use std::collections::{HashSet, VecDeque};

use cid::Cid;
use ferry_types::{Block, FileId};

use crate::dag::PbNode;
use crate::error::StoreError;
use crate::traits::BlockStore;

/// Default number of blocks per batch.
pub const WALK_BATCH: usize = 10;

/// Breadth-first walk over one or more file DAGs.
///
/// Roots are visited in the order given (variants first, then the file
/// root), and every block is yielded once even when DAGs share blocks.
///
/// ```rust,ignore
/// let mut walker = DagWalker::new(store, variants.iter().copied().chain([root]));
/// while let Some(batch) = walker.next_batch().await? {
///     check(batch).await?;
/// }
/// ```
pub struct DagWalker<'a> {
    store: &'a dyn BlockStore,
    pending: VecDeque<Cid>,
    visited: HashSet<Cid>,
    batch_size: usize,
}

impl<'a> DagWalker<'a> {
    /// Walk the given roots in order.
    pub fn new(store: &'a dyn BlockStore, roots: impl IntoIterator<Item = FileId>) -> Self {
        let mut walker = Self {
            store,
            pending: VecDeque::new(),
            visited: HashSet::new(),
            batch_size: WALK_BATCH,
        };
        for root in roots {
            walker.enqueue(root.cid());
        }
        walker
    }

    /// Override the batch size.
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    fn enqueue(&mut self, cid: Cid) {
        if self.visited.insert(cid) {
            self.pending.push_back(cid);
        }
    }

    /// Next batch of blocks, or `None` once every block was yielded.
    pub async fn next_batch(&mut self) -> Result<Option<Vec<Block>>, StoreError> {
        let mut batch = Vec::with_capacity(self.batch_size);
        while batch.len() < self.batch_size {
            let Some(cid) = self.pending.pop_front() else {
                break;
            };
            let block = self
                .store
                .get(&cid)
                .await?
                .ok_or(StoreError::NotFound(cid))?;
            for link in PbNode::decode(&block)?.links {
                self.enqueue(link.cid);
            }
            batch.push(block);
        }
        Ok((!batch.is_empty()).then_some(batch))
    }

    /// Drain the walk into one vector.
    pub async fn collect(mut self) -> Result<Vec<Block>, StoreError> {
        let mut all = Vec::new();
        while let Some(batch) = self.next_batch().await? {
            all.extend(batch);
        }
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DagBuilder, MemoryBlockStore};

    #[tokio::test]
    async fn test_walk_visits_every_block_once() {
        let store = MemoryBlockStore::unbounded();
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let dag = DagBuilder::new(100).max_links(8).import(&store, &data).await.unwrap();

        let mut walker = DagWalker::new(&store, [dag.root]).batch_size(7);
        let mut seen = Vec::new();
        while let Some(batch) = walker.next_batch().await.unwrap() {
            assert!(batch.len() <= 7);
            seen.extend(batch.into_iter().map(|b| b.cid));
        }
        assert_eq!(seen[0], dag.root.cid(), "root comes first");

        let unique: HashSet<Cid> = dag.blocks.iter().map(|b| b.cid).collect();
        assert_eq!(seen.len(), unique.len());
        assert_eq!(seen.iter().copied().collect::<HashSet<_>>(), unique);
    }

    #[tokio::test]
    async fn test_variants_walked_first_and_shared_blocks_once() {
        let store = MemoryBlockStore::unbounded();
        let builder = DagBuilder::new(4);
        let variant = builder.import(&store, b"aaaabbbb").await.unwrap();
        let original = builder.import(&store, b"aaaacccc").await.unwrap();

        let blocks = DagWalker::new(&store, [variant.root, original.root])
            .collect()
            .await
            .unwrap();
        assert_eq!(blocks[0].cid, variant.root.cid());
        // "aaaa" leaf is shared: 2 roots + 3 distinct leaves.
        assert_eq!(blocks.len(), 5);
    }

    #[tokio::test]
    async fn test_missing_block_is_error() {
        let store = MemoryBlockStore::unbounded();
        let dag = DagBuilder::new(4).build(b"12345678");
        let root = dag.blocks.last().unwrap().clone();
        store.put(root).await.unwrap();

        let err = DagWalker::new(&store, [dag.root]).collect().await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
