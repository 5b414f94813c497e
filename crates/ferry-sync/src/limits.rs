//! Per-space quota accounting.
//!
//! Each known space gets a [`SpaceUsage`] tracker. Upload workers reserve
//! bytes before talking to the node and either convert the reservation into
//! node usage once the file is complete or give it back on failure. When a
//! refresh from the node shows that free space grew, the tracker publishes
//! an [`UpdateMessage`] so that `Limited` files can be retried.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use ferry_node::RemoteNode;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{SyncError, with_timeout};

/// Free space of a space grew.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateMessage {
    pub space_id: String,
    /// Account-wide limit in bytes.
    pub limit: u64,
    /// Bytes in use as reported by the node.
    pub usage: u64,
}

impl UpdateMessage {
    pub fn free_space(&self) -> u64 {
        self.limit.saturating_sub(self.usage)
    }
}

/// Point-in-time view of a tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpaceUsageSnapshot {
    pub space_id: String,
    pub limit: u64,
    pub usage_from_node: u64,
    pub allocated_usage: u64,
    /// Files holding a reservation.
    pub files: usize,
}

#[derive(Debug, Default)]
struct Usage {
    limit: u64,
    usage_from_node: u64,
    allocated_usage: u64,
    files: HashMap<String, u64>,
}

impl Usage {
    fn free(&self) -> u64 {
        self.limit
            .saturating_sub(self.usage_from_node)
            .saturating_sub(self.allocated_usage)
    }

    fn release(&mut self, key: &str) -> Option<u64> {
        let size = self.files.remove(key)?;
        self.allocated_usage = self.allocated_usage.saturating_sub(size);
        Some(size)
    }
}

/// Quota tracker of one space.
pub struct SpaceUsage {
    space_id: String,
    node: Arc<dyn RemoteNode>,
    usage: Mutex<Usage>,
    updates: mpsc::UnboundedSender<UpdateMessage>,
    /// Deadline of one `space_info` call.
    timeout: Duration,
}

impl SpaceUsage {
    fn new(
        space_id: String,
        node: Arc<dyn RemoteNode>,
        updates: mpsc::UnboundedSender<UpdateMessage>,
        timeout: Duration,
    ) -> Self {
        Self {
            space_id,
            node,
            usage: Mutex::new(Usage::default()),
            updates,
            timeout,
        }
    }

    pub fn space_id(&self) -> &str {
        &self.space_id
    }

    /// Reserve `size` bytes for `key`, replacing any earlier reservation of
    /// the same key. Fails without side effects if the space is too full.
    pub fn allocate_file(&self, key: &str, size: u64) -> Result<(), SyncError> {
        let mut usage = self.usage.lock().expect("lock poisoned");
        let previous = usage.files.get(key).copied().unwrap_or(0);
        let free = usage.free() + previous;
        if size > free {
            debug!(space_id = %self.space_id, key, size, free, "allocation rejected");
            return Err(SyncError::LimitReached {
                file_size: size,
                account_limit: usage.limit,
                total_bytes_usage: usage.usage_from_node + usage.allocated_usage,
            });
        }
        usage.release(key);
        usage.files.insert(key.to_string(), size);
        usage.allocated_usage += size;
        Ok(())
    }

    /// Give back the reservation of `key`, if any.
    pub fn deallocate_file(&self, key: &str) {
        let mut usage = self.usage.lock().expect("lock poisoned");
        if let Some(size) = usage.release(key) {
            debug!(space_id = %self.space_id, key, size, "allocation released");
        }
    }

    /// Turn the reservation of `key` into node usage.
    pub fn mark_file_uploaded(&self, key: &str) {
        let mut usage = self.usage.lock().expect("lock poisoned");
        if let Some(size) = usage.release(key) {
            usage.usage_from_node += size;
        }
    }

    /// Bytes that can still be reserved.
    pub fn free_space(&self) -> u64 {
        self.usage.lock().expect("lock poisoned").free()
    }

    pub fn snapshot(&self) -> SpaceUsageSnapshot {
        let usage = self.usage.lock().expect("lock poisoned");
        SpaceUsageSnapshot {
            space_id: self.space_id.clone(),
            limit: usage.limit,
            usage_from_node: usage.usage_from_node,
            allocated_usage: usage.allocated_usage,
            files: usage.files.len(),
        }
    }

    /// Refresh limit and usage from the node. Publishes an
    /// [`UpdateMessage`] if free space grew.
    pub async fn update(&self) -> Result<(), SyncError> {
        let info = with_timeout(self.timeout, self.node.space_info(&self.space_id)).await?;
        let message = {
            let mut usage = self.usage.lock().expect("lock poisoned");
            let before = usage.free();
            usage.limit = info.limit_bytes;
            usage.usage_from_node = info.total_usage_bytes;
            (usage.free() > before).then(|| UpdateMessage {
                space_id: self.space_id.clone(),
                limit: usage.limit,
                usage: usage.usage_from_node,
            })
        };
        if let Some(message) = message {
            debug!(space_id = %self.space_id, free = message.free_space(), "free space grew");
            let _ = self.updates.send(message);
        }
        Ok(())
    }
}

/// Lifecycle status of a space as seen by the account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceStatus {
    Active,
    Removing,
    Deleted,
}

/// Space membership record from the account's space list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpaceView {
    pub space_id: String,
    pub status: SpaceStatus,
}

/// Owns the per-space trackers and the shared update channel.
pub struct LimitManager {
    node: Arc<dyn RemoteNode>,
    spaces: RwLock<HashMap<String, Arc<SpaceUsage>>>,
    updates_tx: mpsc::UnboundedSender<UpdateMessage>,
    updates_rx: Mutex<Option<mpsc::UnboundedReceiver<UpdateMessage>>>,
    /// Serializes tracker creation so each space is refreshed once.
    creating: tokio::sync::Mutex<()>,
    timeout: Duration,
}

impl LimitManager {
    /// Manager whose trackers give up on a `space_info` call after `timeout`.
    pub fn new(node: Arc<dyn RemoteNode>, timeout: Duration) -> Self {
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        Self {
            node,
            timeout,
            spaces: RwLock::new(HashMap::new()),
            updates_tx,
            updates_rx: Mutex::new(Some(updates_rx)),
            creating: tokio::sync::Mutex::new(()),
        }
    }

    /// Tracker for `space_id`, creating and refreshing it on first use.
    pub async fn get_space(&self, space_id: &str) -> Result<Arc<SpaceUsage>, SyncError> {
        if let Some(space) = self.existing(space_id) {
            return Ok(space);
        }
        let _creating = self.creating.lock().await;
        if let Some(space) = self.existing(space_id) {
            return Ok(space);
        }
        let space = Arc::new(SpaceUsage::new(
            space_id.to_string(),
            Arc::clone(&self.node),
            self.updates_tx.clone(),
            self.timeout,
        ));
        space.update().await?;

        self.spaces
            .write()
            .expect("lock poisoned")
            .insert(space_id.to_string(), Arc::clone(&space));
        debug!(space_id, "tracking space");
        Ok(space)
    }

    /// Tracker for `space_id` if one exists.
    pub fn existing(&self, space_id: &str) -> Option<Arc<SpaceUsage>> {
        self.spaces.read().expect("lock poisoned").get(space_id).cloned()
    }

    /// Forget a space.
    pub fn remove_space(&self, space_id: &str) {
        if self.spaces.write().expect("lock poisoned").remove(space_id).is_some() {
            info!(space_id, "stopped tracking space");
        }
    }

    /// Ids of every tracked space.
    pub fn space_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.spaces.read().expect("lock poisoned").keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Refresh every tracker; failures are logged per space.
    pub async fn update_all(&self) {
        let spaces: Vec<Arc<SpaceUsage>> = self.spaces.read().expect("lock poisoned").values().cloned().collect();
        for space in spaces {
            if let Err(e) = space.update().await {
                warn!(space_id = %space.space_id, error = %e, "failed to refresh space usage");
            }
        }
    }

    /// The delivery end of the update channel. Only the first caller gets it.
    pub fn take_updates(&self) -> Option<mpsc::UnboundedReceiver<UpdateMessage>> {
        self.updates_rx.lock().expect("lock poisoned").take()
    }

    /// Follow the account's space list until `views` closes or `cancel`
    /// fires.
    pub async fn watch_spaces(&self, mut views: mpsc::Receiver<SpaceView>, cancel: CancellationToken) {
        loop {
            let view = tokio::select! {
                _ = cancel.cancelled() => break,
                view = views.recv() => match view {
                    Some(view) => view,
                    None => break,
                },
            };
            match view.status {
                SpaceStatus::Active => {
                    if let Err(e) = self.get_space(&view.space_id).await {
                        warn!(space_id = %view.space_id, error = %e, "failed to track space");
                    }
                }
                SpaceStatus::Removing | SpaceStatus::Deleted => self.remove_space(&view.space_id),
            }
        }
        debug!("space watcher stopped");
    }
}
