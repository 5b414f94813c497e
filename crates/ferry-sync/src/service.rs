//! The [`FileSync`] service: wiring, lifecycle and the public API.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use ferry_meta::{ItemStore, MetaStore};
use ferry_node::RemoteNode;
use ferry_queue::{Entry, Queue, Release};
use ferry_store::BlockStore;
use ferry_types::config::{BatcherConfig, SyncConfig, UsageConfig};
use ferry_types::events::EventBus;
use ferry_types::{FileId, FullFileId, NodeUsage, SpaceStat, TypesError};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::batcher::{Batcher, BlockPushRequest};
use crate::error::{SyncError, with_timeout};
use crate::info::{FileInfo, FileState, unix_ms};
use crate::limits::{LimitManager, SpaceView};
use crate::status::{StatusBridge, StatusObserver};
use crate::usage::UsagePoller;

/// Keyspace holding the file queue.
pub const QUEUE_NAME: &str = "filesync_queue";

/// Engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileSyncConfig {
    pub sync: SyncConfig,
    pub batcher: BatcherConfig,
    pub usage: UsageConfig,
}

/// Request to upload a file.
#[derive(Debug, Clone)]
pub struct AddFileRequest {
    /// Object owning the file; also the queue key.
    pub object_id: String,
    pub file: FullFileId,
    pub variants: Vec<FileId>,
    pub added_by_user: bool,
    pub imported: bool,
}

/// Object ids grouped by state, for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueInfo {
    pub pending_upload: Vec<String>,
    pub uploading: Vec<String>,
    pub limited: Vec<String>,
    pub pending_deletion: Vec<String>,
    pub done: usize,
    pub deleted: usize,
}

/// State shared by every background task.
pub(crate) struct Shared {
    pub(crate) queue: Queue<FileInfo>,
    pub(crate) node: Arc<dyn RemoteNode>,
    pub(crate) blocks: Arc<dyn BlockStore>,
    pub(crate) limits: Arc<LimitManager>,
    pub(crate) batcher: Batcher,
    pub(crate) status: StatusBridge,
    pub(crate) usage: UsagePoller,
    pub(crate) cfg: SyncConfig,
}

#[derive(Default)]
struct Tasks {
    workers: Vec<JoinHandle<()>>,
    batcher: Option<JoinHandle<()>>,
    pushers: Vec<JoinHandle<()>>,
}

/// File synchronization service.
///
/// Create it inside a tokio runtime, register observers, then call
/// [`start`](Self::start). [`close`](Self::close) stops the workers, ships
/// pending batches and closes the queue.
pub struct FileSync {
    shared: Arc<Shared>,
    /// Stops workers, the batcher tick, the poller and the limited loop.
    cancel: CancellationToken,
    /// Stops pushers, after the final batcher flush.
    push_cancel: CancellationToken,
    push_rx: Mutex<Option<mpsc::Receiver<BlockPushRequest>>>,
    tasks: Mutex<Tasks>,
    started: AtomicBool,
}

impl FileSync {
    /// Build the service over the metadata store, the remote node and the
    /// local block store.
    pub fn new(
        meta: &MetaStore,
        node: Arc<dyn RemoteNode>,
        blocks: Arc<dyn BlockStore>,
        events: EventBus,
        cfg: FileSyncConfig,
    ) -> Result<Self, SyncError> {
        let store: Arc<dyn ItemStore<FileInfo>> = Arc::new(meta.item_store::<FileInfo>(QUEUE_NAME)?);
        let limits = Arc::new(LimitManager::new(Arc::clone(&node), cfg.sync.batch_timeout()));
        let (batcher, push_rx) = Batcher::new(cfg.batcher.clone());
        let usage = UsagePoller::new(
            Arc::clone(&node),
            meta.system(),
            events.clone(),
            Arc::clone(&limits),
            cfg.usage.clone(),
            cfg.sync.batch_timeout(),
        );

        let shared = Arc::new(Shared {
            queue: Queue::new(store),
            node,
            blocks,
            limits,
            batcher,
            status: StatusBridge::new(events),
            usage,
            cfg: cfg.sync,
        });
        Ok(Self {
            shared,
            cancel: CancellationToken::new(),
            push_cancel: CancellationToken::new(),
            push_rx: Mutex::new(Some(push_rx)),
            tasks: Mutex::new(Tasks::default()),
            started: AtomicBool::new(false),
        })
    }

    /// Recover interrupted uploads and spawn every background task.
    /// Calling it again is a no-op.
    pub async fn start(&self) -> Result<(), SyncError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let shared = &self.shared;
        shared.usage.seed_default()?;
        shared.reset_uploading().await?;
        shared.track_limited_spaces().await?;

        let cfg = &shared.cfg;
        let mut tasks = Tasks::default();
        for worker in 0..cfg.upload_workers {
            let task = Arc::clone(shared).run_upload_worker(worker, self.cancel.clone());
            tasks.workers.push(tokio::spawn(task));
        }
        for worker in 0..cfg.deletion_workers {
            let task = Arc::clone(shared).run_deletion_worker(worker, self.cancel.clone());
            tasks.workers.push(tokio::spawn(task));
        }
        if let Some(updates) = shared.limits.take_updates() {
            let task = Arc::clone(shared).run_limited(updates, self.cancel.clone());
            tasks.workers.push(tokio::spawn(task));
        }
        {
            let shared = Arc::clone(shared);
            let cancel = self.cancel.clone();
            tasks
                .workers
                .push(tokio::spawn(async move { shared.usage.run(cancel).await }));
        }
        {
            let shared = Arc::clone(shared);
            let cancel = self.cancel.clone();
            tasks.batcher = Some(tokio::spawn(async move { shared.batcher.run(cancel).await }));
        }
        if let Some(rx) = self.push_rx.lock().expect("lock poisoned").take() {
            let rx = Arc::new(tokio::sync::Mutex::new(rx));
            for pusher in 0..cfg.pushers.max(1) {
                let task = Arc::clone(shared).run_pusher(pusher, Arc::clone(&rx), self.push_cancel.clone());
                tasks.pushers.push(tokio::spawn(task));
            }
        }

        {
            let mut current = self.tasks.lock().expect("lock poisoned");
            current.workers.extend(tasks.workers);
            current.batcher = tasks.batcher;
            current.pushers = tasks.pushers;
        }
        info!(
            upload_workers = cfg.upload_workers,
            deletion_workers = cfg.deletion_workers,
            pushers = cfg.pushers,
            "file sync started"
        );
        Ok(())
    }

    /// Stop every task and close the queue. Blocks handed to the batcher
    /// are pushed before the pushers stop.
    pub async fn close(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().expect("lock poisoned"));
        self.cancel.cancel();
        futures::future::join_all(tasks.workers).await;
        if let Some(batcher) = tasks.batcher {
            let _ = batcher.await;
        }
        self.push_cancel.cancel();
        futures::future::join_all(tasks.pushers).await;
        self.shared.queue.close();
        info!("file sync stopped");
    }

    /// Queue a file for upload. An existing item for the object is
    /// replaced and scheduled now.
    pub async fn add_file(&self, req: AddFileRequest) -> Result<(), SyncError> {
        if req.object_id.is_empty() {
            return Err(TypesError::Bad("empty object id".into()).into());
        }
        let object_id = req.object_id.clone();
        let mut info = FileInfo::new(req.object_id, req.file, FileState::PendingUpload);
        info.variants = req.variants;
        info.added_by_user = req.added_by_user;
        info.imported = req.imported;

        debug!(%object_id, file_id = %info.file_id, space_id = %info.space_id, "adding file");
        self.shared.queue.upsert(&object_id, move |_| info).await?;
        Ok(())
    }

    /// Upload a file immediately, outside the queue.
    pub async fn upload_synchronously(&self, space_id: &str, file_id: FileId) -> Result<(), SyncError> {
        self.shared.upload_synchronously(space_id, file_id).await
    }

    /// Register a status observer.
    pub fn on_status_updated(&self, observer: Arc<dyn StatusObserver>) {
        self.shared.status.register(observer);
    }

    /// Schedule the file for deletion from the node. Repeating the call for
    /// a file already pending deletion or deleted changes nothing.
    pub async fn delete_file(&self, object_id: &str, file: FullFileId) -> Result<(), SyncError> {
        let id = object_id.to_string();
        self.shared
            .queue
            .upsert(object_id, move |prev| match prev {
                Some(prev)
                    if prev.file_id == file.file_id
                        && prev.space_id == file.space_id
                        && matches!(prev.state, FileState::PendingDeletion | FileState::Deleted) =>
                {
                    prev
                }
                Some(mut prev) => {
                    prev.file_id = file.file_id;
                    prev.space_id = file.space_id;
                    prev.set_state(FileState::PendingDeletion);
                    prev.scheduled_at = unix_ms(SystemTime::now());
                    prev
                }
                None => FileInfo::new(id, file, FileState::PendingDeletion),
            })
            .await?;
        Ok(())
    }

    /// Undo a pending deletion. Does nothing if none is pending.
    pub async fn cancel_deletion(&self, object_id: &str, file: FullFileId) -> Result<(), SyncError> {
        self.shared
            .queue
            .process(object_id, |entry| async move {
                match entry {
                    Entry::Occupied(mut it)
                        if it.state == FileState::PendingDeletion && it.file_id == file.file_id =>
                    {
                        it.set_state(FileState::Done);
                        Ok(Release::Update(it))
                    }
                    _ => Ok::<_, SyncError>(Release::Keep),
                }
            })
            .await
    }

    /// Delete the file from the node right now, outside the queue.
    pub async fn delete_file_synchronously(&self, file: &FullFileId) -> Result<(), SyncError> {
        let file_ids = [file.file_id];
        let call = self.shared.node.delete_files(&file.space_id, &file_ids);
        with_timeout(self.shared.cfg.batch_timeout(), call).await?;
        info!(space_id = %file.space_id, file_id = %file.file_id, "file deleted synchronously");
        Ok(())
    }

    /// Poll the node for account usage now.
    pub async fn update_node_usage(&self) -> Result<NodeUsage, SyncError> {
        self.shared.usage.update().await
    }

    /// Cached account usage.
    pub async fn node_usage(&self) -> Result<NodeUsage, SyncError> {
        self.shared.usage.node_usage().await
    }

    pub async fn space_stat(&self, space_id: &str) -> Result<SpaceStat, SyncError> {
        self.shared.usage.space_stat(space_id).await
    }

    /// Every queue record.
    pub fn list(&self) -> Result<Vec<FileInfo>, SyncError> {
        Ok(self.shared.queue.list()?)
    }

    /// Queue contents grouped by state.
    pub fn debug_queue(&self) -> Result<QueueInfo, SyncError> {
        let mut info = QueueInfo::default();
        for it in self.list()? {
            let id = it.object_id;
            match it.state {
                FileState::PendingUpload => info.pending_upload.push(id),
                FileState::Uploading => info.uploading.push(id),
                FileState::Limited => info.limited.push(id),
                FileState::PendingDeletion => info.pending_deletion.push(id),
                FileState::Done => info.done += 1,
                FileState::Deleted => info.deleted += 1,
            }
        }
        Ok(info)
    }

    pub fn send_import_events(&self) {
        self.shared.status.send_import_events();
    }

    pub fn clear_import_events(&self) {
        self.shared.status.clear_import_events();
    }

    /// Track spaces from the account's space list until it closes or the
    /// service stops.
    pub fn watch_spaces(&self, views: mpsc::Receiver<SpaceView>) {
        let limits = Arc::clone(&self.shared.limits);
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move { limits.watch_spaces(views, cancel).await });
        self.tasks.lock().expect("lock poisoned").workers.push(handle);
    }

    pub fn events(&self) -> &EventBus {
        self.shared.status.events()
    }

    pub fn limits(&self) -> &LimitManager {
        &self.shared.limits
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Shared {
        &self.shared
    }
}

impl Drop for FileSync {
    fn drop(&mut self) {
        if self.started.load(Ordering::SeqCst) && !self.cancel.is_cancelled() {
            warn!("file sync dropped without close");
        }
        self.cancel.cancel();
        self.push_cancel.cancel();
    }
}
