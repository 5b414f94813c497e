//! Failure injection around another node.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use cid::Cid;
use ferry_types::FileId;
use tracing::debug;

use crate::error::RemoteError;
use crate::types::{AccountInfo, BlockAvailability, FileBlocks, RemoteFileInfo, SpaceInfo};
use crate::RemoteNode;

/// Remote operations, for targeting injected failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    AccountInfo,
    SpaceInfo,
    CheckAvailability,
    BindCids,
    BlockPushMany,
    DeleteFiles,
    FilesInfo,
}

#[derive(Default)]
struct Faults {
    queued: HashMap<Op, VecDeque<RemoteError>>,
    calls: HashMap<Op, usize>,
    hangs: HashMap<Op, usize>,
    down: bool,
}

/// Wraps a node and fails selected calls.
///
/// Injected errors are consumed in order, one per call of the targeted
/// operation. Every call is counted, failed or not.
pub struct FlakyNode {
    inner: Arc<dyn RemoteNode>,
    faults: Mutex<Faults>,
}

impl FlakyNode {
    pub fn new(inner: Arc<dyn RemoteNode>) -> Self {
        Self {
            inner,
            faults: Mutex::new(Faults::default()),
        }
    }

    /// Fail the next call of `op` with `err`.
    pub fn fail_next(&self, op: Op, err: RemoteError) {
        self.fail_times(op, 1, err);
    }

    /// Fail the next `times` calls of `op` with `err`.
    pub fn fail_times(&self, op: Op, times: usize, err: RemoteError) {
        let mut faults = self.faults.lock().expect("lock poisoned");
        faults.queued.entry(op).or_default().extend(std::iter::repeat_n(err, times));
    }

    /// Make the next `times` calls of `op` never return. Callers only get
    /// out through their own deadline.
    pub fn hang_times(&self, op: Op, times: usize) {
        let mut faults = self.faults.lock().expect("lock poisoned");
        *faults.hangs.entry(op).or_default() += times;
    }

    /// While down, every call fails with [`RemoteError::Unavailable`].
    pub fn set_down(&self, down: bool) {
        self.faults.lock().expect("lock poisoned").down = down;
    }

    /// Number of calls of `op` seen so far.
    pub fn calls(&self, op: Op) -> usize {
        let faults = self.faults.lock().expect("lock poisoned");
        faults.calls.get(&op).copied().unwrap_or(0)
    }

    async fn enter(&self, op: Op) -> Result<(), RemoteError> {
        let hang = {
            let mut faults = self.faults.lock().expect("lock poisoned");
            *faults.calls.entry(op).or_default() += 1;
            if faults.down {
                return Err(RemoteError::Unavailable);
            }
            if let Some(err) = faults.queued.get_mut(&op).and_then(VecDeque::pop_front) {
                debug!(?op, %err, "injecting failure");
                return Err(err);
            }
            match faults.hangs.get_mut(&op) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    true
                }
                _ => false,
            }
        };
        if hang {
            debug!(?op, "hanging call");
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteNode for FlakyNode {
    async fn account_info(&self) -> Result<AccountInfo, RemoteError> {
        self.enter(Op::AccountInfo).await?;
        self.inner.account_info().await
    }

    async fn space_info(&self, space_id: &str) -> Result<SpaceInfo, RemoteError> {
        self.enter(Op::SpaceInfo).await?;
        self.inner.space_info(space_id).await
    }

    async fn check_availability(
        &self,
        space_id: &str,
        cids: &[Cid],
    ) -> Result<Vec<BlockAvailability>, RemoteError> {
        self.enter(Op::CheckAvailability).await?;
        self.inner.check_availability(space_id, cids).await
    }

    async fn bind_cids(&self, space_id: &str, file_id: FileId, cids: &[Cid]) -> Result<(), RemoteError> {
        self.enter(Op::BindCids).await?;
        self.inner.bind_cids(space_id, file_id, cids).await
    }

    async fn block_push_many(&self, files: Vec<FileBlocks>) -> Result<(), RemoteError> {
        self.enter(Op::BlockPushMany).await?;
        self.inner.block_push_many(files).await
    }

    async fn delete_files(&self, space_id: &str, file_ids: &[FileId]) -> Result<(), RemoteError> {
        self.enter(Op::DeleteFiles).await?;
        self.inner.delete_files(space_id, file_ids).await
    }

    async fn files_info(&self, space_id: &str, file_ids: &[FileId]) -> Result<Vec<RemoteFileInfo>, RemoteError> {
        self.enter(Op::FilesInfo).await?;
        self.inner.files_info(space_id, file_ids).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryNode;

    #[tokio::test]
    async fn test_injected_failures_are_consumed_in_order() {
        let node = FlakyNode::new(Arc::new(MemoryNode::new(10)));
        node.fail_times(Op::DeleteFiles, 2, RemoteError::Unavailable);

        assert_eq!(node.delete_files("s", &[]).await, Err(RemoteError::Unavailable));
        assert_eq!(node.delete_files("s", &[]).await, Err(RemoteError::Unavailable));
        assert_eq!(node.delete_files("s", &[]).await, Ok(()));
        assert_eq!(node.calls(Op::DeleteFiles), 3);
        assert_eq!(node.calls(Op::AccountInfo), 0);
    }

    #[tokio::test]
    async fn test_down_fails_everything() {
        let node = FlakyNode::new(Arc::new(MemoryNode::new(10)));
        node.set_down(true);
        assert_eq!(node.account_info().await.unwrap_err(), RemoteError::Unavailable);
        node.set_down(false);
        assert_eq!(node.account_info().await.unwrap().limit_bytes, 10);
    }

    #[tokio::test]
    async fn test_hanging_call_only_ends_by_deadline() {
        let node = FlakyNode::new(Arc::new(MemoryNode::new(10)));
        node.hang_times(Op::SpaceInfo, 1);

        let hung = tokio::time::timeout(std::time::Duration::from_millis(100), node.space_info("s")).await;
        assert!(hung.is_err());
        assert_eq!(node.space_info("s").await.unwrap().limit_bytes, 10);
        assert_eq!(node.calls(Op::SpaceInfo), 2);
    }
}
