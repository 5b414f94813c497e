//! Account usage polling.
//!
//! The poller keeps the latest [`NodeUsage`] in the system store under
//! [`keys::NODE_USAGE`], emits events when the limit or a space's usage
//! changes, and refreshes the quota trackers after every poll. It polls
//! quickly while usage moves and backs off once it settles.

use std::sync::Arc;
use std::time::Duration;

use ferry_meta::{SystemStore, keys};
use ferry_node::RemoteNode;
use ferry_types::config::UsageConfig;
use ferry_types::events::{EventBus, FileLimitUpdated, FileSpaceUsage};
use ferry_types::{NodeUsage, SpaceStat};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{SyncError, with_timeout};
use crate::limits::LimitManager;

/// Adaptive poll interval.
///
/// Polls at the active interval until two consecutive polls report the
/// same `bytes_left`, then at the idle interval until it changes again.
#[derive(Debug, Clone)]
pub struct Cadence {
    active: Duration,
    idle: Duration,
    last: Option<u64>,
}

impl Cadence {
    pub fn new(cfg: &UsageConfig) -> Self {
        Self {
            active: cfg.active_interval(),
            idle: cfg.idle_interval(),
            last: None,
        }
    }

    /// Record a poll result and return the delay until the next poll.
    pub fn observe(&mut self, bytes_left: u64) -> Duration {
        let settled = self.last == Some(bytes_left);
        self.last = Some(bytes_left);
        if settled { self.idle } else { self.active }
    }

    /// Delay after a failed poll.
    pub fn failed(&mut self) -> Duration {
        self.last = None;
        self.active
    }
}

/// Polls the node for account usage.
pub struct UsagePoller {
    node: Arc<dyn RemoteNode>,
    system: SystemStore,
    events: EventBus,
    limits: Arc<LimitManager>,
    cfg: UsageConfig,
    timeout: Duration,
    poll_lock: Mutex<()>,
}

impl UsagePoller {
    pub fn new(
        node: Arc<dyn RemoteNode>,
        system: SystemStore,
        events: EventBus,
        limits: Arc<LimitManager>,
        cfg: UsageConfig,
        timeout: Duration,
    ) -> Self {
        Self {
            node,
            system,
            events,
            limits,
            cfg,
            timeout,
            poll_lock: Mutex::new(()),
        }
    }

    /// Cached usage without touching the node.
    pub fn cached(&self) -> Result<Option<NodeUsage>, SyncError> {
        Ok(self.system.get(keys::NODE_USAGE)?)
    }

    /// Store the default limit if nothing is cached yet.
    pub fn seed_default(&self) -> Result<(), SyncError> {
        if self.cached()?.is_none() {
            let limit = self.cfg.default_limit;
            self.system.set(
                keys::NODE_USAGE,
                &NodeUsage {
                    account_bytes_limit: limit,
                    bytes_left: limit,
                    ..Default::default()
                },
            )?;
            debug!(limit, "seeded default node usage");
        }
        Ok(())
    }

    /// Cached usage, polling once if there is none.
    pub async fn node_usage(&self) -> Result<NodeUsage, SyncError> {
        match self.cached()? {
            Some(usage) => Ok(usage),
            None => self.update().await,
        }
    }

    /// Usage of one space, derived from the cached account usage.
    pub async fn space_stat(&self, space_id: &str) -> Result<SpaceStat, SyncError> {
        Ok(self.node_usage().await?.space_usage(space_id))
    }

    /// Poll the node once and publish what changed.
    pub async fn update(&self) -> Result<NodeUsage, SyncError> {
        let guard = self.poll_lock.lock().await;

        let info = with_timeout(self.timeout, self.node.account_info()).await?;
        let mut spaces: Vec<SpaceStat> = info
            .spaces
            .into_iter()
            .map(|s| SpaceStat {
                space_id: s.space_id,
                file_count: s.files_count,
                cids_count: s.cids_count,
                total_bytes_usage: s.total_usage_bytes,
                space_bytes_usage: s.space_usage_bytes,
                account_bytes_limit: s.limit_bytes,
            })
            .collect();
        spaces.sort_by(|a, b| a.space_id.cmp(&b.space_id));
        let usage = NodeUsage {
            account_bytes_limit: info.limit_bytes,
            total_bytes_usage: info.total_usage_bytes,
            total_cids_count: info.total_cids_count,
            bytes_left: info.limit_bytes.saturating_sub(info.total_usage_bytes),
            spaces,
        };

        let previous = self.cached()?;
        if previous.as_ref() != Some(&usage) {
            self.system.set(keys::NODE_USAGE, &usage)?;
            if let Some(previous) = &previous {
                self.publish_changes(previous, &usage);
            }
        }
        drop(guard);

        self.limits.update_all().await;
        Ok(usage)
    }

    fn publish_changes(&self, previous: &NodeUsage, current: &NodeUsage) {
        if previous.account_bytes_limit != current.account_bytes_limit {
            info!(
                old = previous.account_bytes_limit,
                new = current.account_bytes_limit,
                "account limit changed"
            );
            self.events.emit(FileLimitUpdated {
                bytes_limit: current.account_bytes_limit,
            });
        }
        for space in &current.spaces {
            if previous.space_usage(&space.space_id) != *space {
                self.events.emit(FileSpaceUsage {
                    space_id: space.space_id.clone(),
                    bytes_usage: space.space_bytes_usage,
                });
            }
        }
    }

    /// Poll until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        if let Err(e) = self.seed_default() {
            warn!(error = %e, "failed to seed node usage");
        }
        let mut cadence = Cadence::new(&self.cfg);
        loop {
            let delay = match self.update().await {
                Ok(usage) => cadence.observe(usage.bytes_left),
                Err(e) => {
                    warn!(error = %e, "failed to update node usage");
                    cadence.failed()
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        debug!("usage poller stopped");
    }
}

#[cfg(test)]
mod tests {
    use ferry_meta::MetaStore;
    use ferry_node::{FileBlocks, MemoryNode};
    use ferry_types::{Block, FileId};

    use super::*;

    fn poller(meta: &MetaStore, node: Arc<MemoryNode>, events: EventBus) -> UsagePoller {
        let limits = Arc::new(LimitManager::new(node.clone(), Duration::from_secs(5)));
        UsagePoller::new(
            node,
            meta.system(),
            events,
            limits,
            UsageConfig::default(),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn test_cadence_backs_off_when_settled() {
        let mut cadence = Cadence::new(&UsageConfig {
            active_interval_ms: 10,
            idle_interval_ms: 60,
            ..Default::default()
        });
        assert_eq!(cadence.observe(100), Duration::from_millis(10));
        assert_eq!(cadence.observe(100), Duration::from_millis(60));
        assert_eq!(cadence.observe(100), Duration::from_millis(60));
        assert_eq!(cadence.observe(90), Duration::from_millis(10));
        assert_eq!(cadence.failed(), Duration::from_millis(10));
        assert_eq!(cadence.observe(90), Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_seed_then_poll_emits_changes() {
        let meta = MetaStore::open_temporary().unwrap();
        let node = Arc::new(MemoryNode::new(5000));
        let events = EventBus::new();
        let mut limit_rx = events.subscribe::<FileLimitUpdated>();
        let mut space_rx = events.subscribe::<FileSpaceUsage>();
        let poller = poller(&meta, node.clone(), events);

        poller.seed_default().unwrap();
        assert_eq!(poller.cached().unwrap().unwrap().account_bytes_limit, 1024 * 1024 * 1024);

        let root = Block::new(&b"root"[..]);
        node.block_push_many(vec![FileBlocks {
            space_id: "space".into(),
            file_id: FileId::from_cid(root.cid).unwrap(),
            blocks: vec![Block::new(&b"0123456789"[..])],
        }])
        .await
        .unwrap();

        let usage = poller.update().await.unwrap();
        assert_eq!(usage.bytes_left, 4990);
        assert_eq!(limit_rx.try_recv().unwrap().bytes_limit, 5000);
        let space = space_rx.try_recv().unwrap();
        assert_eq!((space.space_id.as_str(), space.bytes_usage), ("space", 10));

        // Nothing changed: no new events.
        poller.update().await.unwrap();
        assert!(limit_rx.try_recv().is_none());
        assert!(space_rx.try_recv().is_none());

        let stat = poller.space_stat("space").await.unwrap();
        assert_eq!(stat.space_bytes_usage, 10);
        let unknown = poller.space_stat("other").await.unwrap();
        assert_eq!((unknown.total_bytes_usage, unknown.account_bytes_limit), (10, 5000));
    }

    #[tokio::test]
    async fn test_node_usage_polls_when_cache_is_empty() {
        let meta = MetaStore::open_temporary().unwrap();
        let node = Arc::new(MemoryNode::new(777));
        let events = EventBus::new();
        let mut limit_rx = events.subscribe::<FileLimitUpdated>();
        let poller = poller(&meta, node, events);

        let usage = poller.node_usage().await.unwrap();
        assert_eq!(usage.account_bytes_limit, 777);
        // First poll without a cached value publishes nothing.
        assert!(limit_rx.try_recv().is_none());
    }
}
