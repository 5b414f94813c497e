//! The remote storage node as seen by the sync engine.
//!
//! [`RemoteNode`] is the RPC contract: usage queries, block availability,
//! binding already stored blocks to a space, batched block pushes and file
//! deletion. [`MemoryNode`] implements it in memory with an account-wide
//! byte limit; [`FlakyNode`] wraps any node and injects failures.

mod error;
mod flaky;
mod memory;
mod types;

use cid::Cid;
use ferry_types::FileId;

pub use error::{RemoteError, SPACE_LIMIT_EXCEEDED};
pub use flaky::{FlakyNode, Op};
pub use memory::{MemoryNode, NodeStats};
pub use types::{AccountInfo, Availability, BlockAvailability, FileBlocks, RemoteFileInfo, SpaceInfo};

/// Remote storage node RPC surface.
///
/// All implementations must be `Send + Sync` for use across async tasks.
#[async_trait::async_trait]
pub trait RemoteNode: Send + Sync {
    /// Account-wide usage and the per-space breakdown.
    async fn account_info(&self) -> Result<AccountInfo, RemoteError>;

    /// Usage of one space.
    async fn space_info(&self, space_id: &str) -> Result<SpaceInfo, RemoteError>;

    /// Whether each CID exists on the node and whether it is bound to the space.
    async fn check_availability(
        &self,
        space_id: &str,
        cids: &[Cid],
    ) -> Result<Vec<BlockAvailability>, RemoteError>;

    /// Charge blocks already stored on the node to `(space_id, file_id)`.
    async fn bind_cids(&self, space_id: &str, file_id: FileId, cids: &[Cid]) -> Result<(), RemoteError>;

    /// Store blocks for several files in one request.
    async fn block_push_many(&self, files: Vec<FileBlocks>) -> Result<(), RemoteError>;

    /// Unbind files from a space.
    async fn delete_files(&self, space_id: &str, file_ids: &[FileId]) -> Result<(), RemoteError>;

    /// Per-file usage. Unknown files are omitted.
    async fn files_info(&self, space_id: &str, file_ids: &[FileId]) -> Result<Vec<RemoteFileInfo>, RemoteError>;
}
