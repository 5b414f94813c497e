//! Shared test harness for ferry integration tests.
//!
//! A [`Device`] is one running [`FileSync`] with its own metadata and block
//! store. Several devices can share one [`MemoryNode`], the way clients of
//! one account share the remote node.

use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

use ferry_meta::MetaStore;
use ferry_node::{FlakyNode, MemoryNode, RemoteNode};
use ferry_store::{BlockStore, DagBuilder, FileDag, MemoryBlockStore};
use ferry_sync::{AddFileRequest, FileInfo, FileState, FileSync, FileSyncConfig};
use ferry_types::FullFileId;
use ferry_types::config::{BatcherConfig, SyncConfig, UsageConfig};
use ferry_types::events::EventBus;
use rand::RngCore;

pub const MIB: u64 = 1024 * 1024;

/// Install a test subscriber once; `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Config with short timers so retries happen within a test.
pub fn fast_config() -> FileSyncConfig {
    FileSyncConfig {
        sync: SyncConfig {
            upload_workers: 4,
            deletion_workers: 2,
            pushers: 4,
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

/// Random bytes; distinct payloads never share blocks.
pub fn random_data(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::rng().fill_bytes(&mut data);
    data
}

/// One client of the remote node.
pub struct Device {
    _meta: MetaStore,
    pub blocks: Arc<MemoryBlockStore>,
    pub flaky: Arc<FlakyNode>,
    pub events: EventBus,
    pub sync: FileSync,
}

impl Device {
    /// Started device talking to `node` through a fault injector.
    pub async fn start(node: Arc<MemoryNode>) -> Self {
        init_tracing();
        let meta = MetaStore::open_temporary().expect("temporary meta store");
        let flaky = Arc::new(FlakyNode::new(node as Arc<dyn RemoteNode>));
        let blocks = Arc::new(MemoryBlockStore::unbounded());
        let events = EventBus::new();
        let sync = FileSync::new(
            &meta,
            flaky.clone() as Arc<dyn RemoteNode>,
            blocks.clone() as Arc<dyn BlockStore>,
            events.clone(),
            fast_config(),
        )
        .expect("file sync");
        sync.start().await.expect("start");
        Self {
            _meta: meta,
            blocks,
            flaky,
            events,
            sync,
        }
    }

    /// Import `data` locally and queue it under `object_id`.
    pub async fn add(&self, object_id: &str, space_id: &str, data: &[u8]) -> FileDag {
        let dag = DagBuilder::new(64 * 1024)
            .import(self.blocks.as_ref(), data)
            .await
            .expect("import");
        self.sync
            .add_file(AddFileRequest {
                object_id: object_id.to_string(),
                file: FullFileId::new(space_id, dag.root),
                variants: Vec::new(),
                added_by_user: true,
                imported: false,
            })
            .await
            .expect("add file");
        dag
    }

    pub fn item(&self, object_id: &str) -> Option<FileInfo> {
        self.sync
            .list()
            .expect("list")
            .into_iter()
            .find(|it| it.object_id == object_id)
    }

    pub fn state(&self, object_id: &str) -> Option<FileState> {
        self.item(object_id).map(|it| it.state)
    }

    pub fn count_in(&self, state: FileState) -> usize {
        self.sync
            .list()
            .expect("list")
            .iter()
            .filter(|it| it.state == state)
            .count()
    }

    pub async fn wait_for_state(&self, object_id: &str, state: FileState) {
        wait_until(&format!("{object_id} to reach {state:?}"), || {
            self.state(object_id) == Some(state)
        })
        .await;
    }

    pub async fn shutdown(self) {
        self.sync.close().await;
    }
}

/// Poll `cond` until it holds, panicking after fifteen seconds.
pub async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(15);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
