//! Request and response types of the remote node.

use cid::Cid;
use ferry_types::{Block, FileId};

/// Usage of one space on the node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpaceInfo {
    /// Space identifier.
    pub space_id: String,
    /// Account-wide byte limit.
    pub limit_bytes: u64,
    /// Bytes charged to this space.
    pub space_usage_bytes: u64,
    /// Bytes used by the whole account.
    pub total_usage_bytes: u64,
    /// Files bound to the space.
    pub files_count: u64,
    /// CIDs bound to the space.
    pub cids_count: u64,
}

/// Account-wide usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountInfo {
    /// Account-wide byte limit.
    pub limit_bytes: u64,
    /// Bytes used by the whole account.
    pub total_usage_bytes: u64,
    /// CIDs stored for the account.
    pub total_cids_count: u64,
    /// Per-space breakdown, in no particular order.
    pub spaces: Vec<SpaceInfo>,
}

/// Where a block stands on the node relative to a space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    /// Not stored anywhere; must be uploaded.
    NotExists,
    /// Stored, but not bound to this space; can be bound.
    Exists,
    /// Stored and bound to this space already.
    ExistsInSpace,
}

/// Availability of one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockAvailability {
    /// Block in question.
    pub cid: Cid,
    /// Its status.
    pub status: Availability,
}

/// Blocks of one file inside a batched push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileBlocks {
    /// Owning space.
    pub space_id: String,
    /// File root.
    pub file_id: FileId,
    /// Blocks to store.
    pub blocks: Vec<Block>,
}

impl FileBlocks {
    /// Sum of the raw block lengths.
    pub fn size(&self) -> u64 {
        self.blocks.iter().map(Block::len).sum()
    }
}

/// Per-file usage on the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFileInfo {
    /// File root.
    pub file_id: FileId,
    /// CIDs recorded for the file.
    pub cids_count: u64,
    /// Bytes recorded for the file.
    pub usage_bytes: u64,
}
