//! Shared fixtures.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ferry_meta::MetaStore;
use ferry_node::{FlakyNode, MemoryNode, RemoteNode};
use ferry_store::{BlockStore, DagBuilder, FileDag, MemoryBlockStore};
use ferry_types::config::{BatcherConfig, SyncConfig, UsageConfig};
use ferry_types::events::EventBus;
use ferry_types::FullFileId;
use rand::RngCore;

use crate::{AddFileRequest, FileInfo, FileState, FileSync, FileSyncConfig};

pub(super) const SPACE: &str = "space-1";
pub(super) const MIB: u64 = 1024 * 1024;

pub(super) fn fast_config() -> FileSyncConfig {
    FileSyncConfig {
        sync: SyncConfig {
            upload_workers: 2,
            deletion_workers: 1,
            pushers: 2,
            retry_delay_ms: 50,
            upload_timeout_ms: 5_000,
            batch_timeout_ms: 5_000,
        },
        batcher: BatcherConfig {
            max_batch_wait_ms: 10,
            ..Default::default()
        },
        usage: UsageConfig {
            active_interval_ms: 50,
            idle_interval_ms: 200,
            ..Default::default()
        },
    }
}

pub(super) struct Harness {
    pub meta: MetaStore,
    pub node: Arc<MemoryNode>,
    pub flaky: Arc<FlakyNode>,
    pub blocks: Arc<MemoryBlockStore>,
    pub events: EventBus,
    pub sync: FileSync,
}

impl Harness {
    /// Service over a memory node with `limit` bytes, not started yet.
    pub fn new(limit: u64) -> Self {
        Self::with_config(limit, fast_config())
    }

    pub fn with_config(limit: u64, cfg: FileSyncConfig) -> Self {
        let meta = MetaStore::open_temporary().unwrap();
        Self::over(meta, Arc::new(MemoryNode::new(limit)), cfg)
    }

    /// Service over an existing metadata store and node.
    pub fn over(meta: MetaStore, node: Arc<MemoryNode>, cfg: FileSyncConfig) -> Self {
        let flaky = Arc::new(FlakyNode::new(node.clone() as Arc<dyn RemoteNode>));
        let blocks = Arc::new(MemoryBlockStore::unbounded());
        let events = EventBus::new();
        let sync = FileSync::new(
            &meta,
            flaky.clone() as Arc<dyn RemoteNode>,
            blocks.clone() as Arc<dyn BlockStore>,
            events.clone(),
            cfg,
        )
        .unwrap();
        Self {
            meta,
            node,
            flaky,
            blocks,
            events,
            sync,
        }
    }

    /// Store a random file of `len` bytes locally.
    pub async fn import(&self, len: usize) -> FileDag {
        let mut data = vec![0u8; len];
        rand::rng().fill_bytes(&mut data);
        DagBuilder::default()
            .import(self.blocks.as_ref(), &data)
            .await
            .unwrap()
    }

    pub async fn add(&self, object_id: &str, dag: &FileDag) {
        self.sync
            .add_file(AddFileRequest {
                object_id: object_id.to_string(),
                file: FullFileId::new(SPACE, dag.root),
                variants: Vec::new(),
                added_by_user: true,
                imported: false,
            })
            .await
            .unwrap();
    }

    pub fn item(&self, object_id: &str) -> Option<FileInfo> {
        self.sync
            .list()
            .unwrap()
            .into_iter()
            .find(|it| it.object_id == object_id)
    }

    pub fn state(&self, object_id: &str) -> Option<FileState> {
        self.item(object_id).map(|it| it.state)
    }

    pub async fn wait_for_state(&self, object_id: &str, state: FileState) {
        wait_until(&format!("{object_id} to reach {state:?}"), || {
            self.state(object_id) == Some(state)
        })
        .await;
    }
}

/// Poll `cond` until it holds, failing after ten seconds.
pub(super) async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
