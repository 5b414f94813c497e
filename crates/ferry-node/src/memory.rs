//! In-memory remote node.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use cid::Cid;
use ferry_types::{Block, FileId};
use tracing::debug;

use crate::error::RemoteError;
use crate::types::{AccountInfo, Availability, BlockAvailability, FileBlocks, RemoteFileInfo, SpaceInfo};
use crate::RemoteNode;

/// Operation counters of a [`MemoryNode`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeStats {
    /// Blocks stored by `block_push_many`.
    pub blocks_added: u64,
    /// CIDs bound by `bind_cids`.
    pub cids_bound: u64,
    /// Files removed by `delete_files`.
    pub files_deleted: u64,
}

#[derive(Default)]
struct Counters {
    blocks_added: AtomicU64,
    cids_bound: AtomicU64,
    files_deleted: AtomicU64,
}

#[derive(Default)]
struct Space {
    files: HashMap<FileId, HashSet<Cid>>,
    cids: HashSet<Cid>,
}

impl Space {
    fn bind(&mut self, file_id: FileId, cid: Cid) {
        self.files.entry(file_id).or_default().insert(cid);
        self.cids.insert(cid);
    }

    fn rebuild_cids(&mut self) {
        self.cids = self.files.values().flatten().copied().collect();
    }
}

#[derive(Default)]
struct State {
    blocks: HashMap<Cid, u64>,
    spaces: HashMap<String, Space>,
}

impl State {
    fn size_of(&self, cids: impl IntoIterator<Item = Cid>) -> u64 {
        cids.into_iter().filter_map(|c| self.blocks.get(&c)).sum()
    }

    /// Distinct CIDs bound to any space.
    fn bound(&self) -> HashSet<Cid> {
        self.spaces.values().flat_map(|s| s.cids.iter().copied()).collect()
    }

    fn total_usage(&self) -> u64 {
        self.size_of(self.bound())
    }

    /// Bytes that binding `cids` would add to the account total.
    fn growth(&self, cids: impl IntoIterator<Item = Cid>) -> u64 {
        let bound = self.bound();
        let fresh: HashSet<Cid> = cids.into_iter().filter(|c| !bound.contains(c)).collect();
        self.size_of(fresh)
    }

    fn space_info(&self, space_id: &str, limit: u64) -> SpaceInfo {
        let total = self.total_usage();
        match self.spaces.get(space_id) {
            Some(space) => SpaceInfo {
                space_id: space_id.to_string(),
                limit_bytes: limit,
                space_usage_bytes: self.size_of(space.cids.iter().copied()),
                total_usage_bytes: total,
                files_count: space.files.len() as u64,
                cids_count: space.cids.len() as u64,
            },
            None => SpaceInfo {
                space_id: space_id.to_string(),
                limit_bytes: limit,
                total_usage_bytes: total,
                ..Default::default()
            },
        }
    }
}

/// Remote node kept entirely in memory, with an account-wide byte limit.
///
/// Usage counts every distinct block bound to at least one space. Blocks
/// stay stored after their files are deleted and can be bound again
/// without a new push.
pub struct MemoryNode {
    state: RwLock<State>,
    limit: AtomicU64,
    counters: Counters,
}

impl MemoryNode {
    /// Create a node with the given account limit in bytes.
    pub fn new(limit: u64) -> Self {
        Self {
            state: RwLock::new(State::default()),
            limit: AtomicU64::new(limit),
            counters: Counters::default(),
        }
    }

    /// Change the account limit.
    pub fn set_limit(&self, limit: u64) {
        self.limit.store(limit, Ordering::Relaxed);
    }

    /// Current account limit.
    pub fn limit(&self) -> u64 {
        self.limit.load(Ordering::Relaxed)
    }

    /// Snapshot of the operation counters.
    pub fn stats(&self) -> NodeStats {
        NodeStats {
            blocks_added: self.counters.blocks_added.load(Ordering::Relaxed),
            cids_bound: self.counters.cids_bound.load(Ordering::Relaxed),
            files_deleted: self.counters.files_deleted.load(Ordering::Relaxed),
        }
    }

    /// Bytes used by the account.
    pub fn total_usage(&self) -> u64 {
        self.state.read().expect("lock poisoned").total_usage()
    }

    /// Whether the block is stored, bound or not.
    pub fn contains_block(&self, cid: &Cid) -> bool {
        self.state.read().expect("lock poisoned").blocks.contains_key(cid)
    }

    /// Whether the file is bound to the space.
    pub fn has_file(&self, space_id: &str, file_id: &FileId) -> bool {
        let state = self.state.read().expect("lock poisoned");
        state
            .spaces
            .get(space_id)
            .is_some_and(|s| s.files.contains_key(file_id))
    }

    fn check_limit(&self, state: &State, growth: u64) -> Result<(), RemoteError> {
        let limit = self.limit();
        let total = state.total_usage();
        if total + growth > limit {
            debug!(total, growth, limit, "space limit exceeded");
            return Err(RemoteError::SpaceLimitExceeded);
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteNode for MemoryNode {
    async fn account_info(&self) -> Result<AccountInfo, RemoteError> {
        let state = self.state.read().expect("lock poisoned");
        let limit = self.limit();
        Ok(AccountInfo {
            limit_bytes: limit,
            total_usage_bytes: state.total_usage(),
            total_cids_count: state.bound().len() as u64,
            spaces: state.spaces.keys().map(|id| state.space_info(id, limit)).collect(),
        })
    }

    async fn space_info(&self, space_id: &str) -> Result<SpaceInfo, RemoteError> {
        let state = self.state.read().expect("lock poisoned");
        Ok(state.space_info(space_id, self.limit()))
    }

    async fn check_availability(
        &self,
        space_id: &str,
        cids: &[Cid],
    ) -> Result<Vec<BlockAvailability>, RemoteError> {
        let state = self.state.read().expect("lock poisoned");
        let space = state.spaces.get(space_id);
        Ok(cids
            .iter()
            .map(|cid| {
                let status = if space.is_some_and(|s| s.cids.contains(cid)) {
                    Availability::ExistsInSpace
                } else if state.blocks.contains_key(cid) {
                    Availability::Exists
                } else {
                    Availability::NotExists
                };
                BlockAvailability { cid: *cid, status }
            })
            .collect())
    }

    async fn bind_cids(&self, space_id: &str, file_id: FileId, cids: &[Cid]) -> Result<(), RemoteError> {
        let mut state = self.state.write().expect("lock poisoned");
        if let Some(missing) = cids.iter().find(|c| !state.blocks.contains_key(c)) {
            return Err(RemoteError::Rpc(format!("cid {missing} is not stored")));
        }
        self.check_limit(&state, state.growth(cids.iter().copied()))?;

        let space = state.spaces.entry(space_id.to_string()).or_default();
        for cid in cids {
            space.bind(file_id, *cid);
        }
        self.counters
            .cids_bound
            .fetch_add(cids.len() as u64, Ordering::Relaxed);
        debug!(space_id, %file_id, count = cids.len(), "bound cids");
        Ok(())
    }

    async fn block_push_many(&self, files: Vec<FileBlocks>) -> Result<(), RemoteError> {
        let mut state = self.state.write().expect("lock poisoned");

        // Blocks new to the account, each counted once.
        let bound = state.bound();
        let mut fresh: HashMap<Cid, u64> = HashMap::new();
        for block in files.iter().flat_map(|f| &f.blocks) {
            if !bound.contains(&block.cid) {
                fresh.insert(block.cid, block.len());
            }
        }
        self.check_limit(&state, fresh.values().sum())?;

        let mut added = 0;
        for file in files {
            for Block { cid, data } in file.blocks {
                state.blocks.insert(cid, data.len() as u64);
                state.spaces.entry(file.space_id.clone()).or_default().bind(file.file_id, cid);
                added += 1;
            }
            debug!(space_id = %file.space_id, file_id = %file.file_id, "pushed file blocks");
        }
        self.counters.blocks_added.fetch_add(added, Ordering::Relaxed);
        Ok(())
    }

    async fn delete_files(&self, space_id: &str, file_ids: &[FileId]) -> Result<(), RemoteError> {
        let mut state = self.state.write().expect("lock poisoned");
        let Some(space) = state.spaces.get_mut(space_id) else {
            return Ok(());
        };
        let mut deleted = 0;
        for file_id in file_ids {
            if space.files.remove(file_id).is_some() {
                deleted += 1;
            }
        }
        space.rebuild_cids();
        self.counters.files_deleted.fetch_add(deleted, Ordering::Relaxed);
        debug!(space_id, deleted, "deleted files");
        Ok(())
    }

    async fn files_info(&self, space_id: &str, file_ids: &[FileId]) -> Result<Vec<RemoteFileInfo>, RemoteError> {
        let state = self.state.read().expect("lock poisoned");
        let Some(space) = state.spaces.get(space_id) else {
            return Ok(Vec::new());
        };
        Ok(file_ids
            .iter()
            .filter_map(|id| {
                space.files.get(id).map(|cids| RemoteFileInfo {
                    file_id: *id,
                    cids_count: cids.len() as u64,
                    usage_bytes: state.size_of(cids.iter().copied()),
                })
            })
            .collect())
    }
}
