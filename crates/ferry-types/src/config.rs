//! Engine configuration with production defaults.
//!
//! Durations are stored as integer milliseconds so the structs serialize
//! cleanly into TOML; accessor methods turn them into [`Duration`]s.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Worker counts, retry policy and remote-call deadlines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Tasks draining `PendingUpload` items.
    pub upload_workers: usize,
    /// Tasks draining `PendingDeletion` items.
    pub deletion_workers: usize,
    /// Tasks performing batched block pushes.
    pub pushers: usize,
    /// Backoff applied to an item after a failed remote call.
    pub retry_delay_ms: u64,
    /// Deadline for the per-file steps of an upload.
    pub upload_timeout_ms: u64,
    /// Deadline for a batched block push or a deletion.
    pub batch_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            upload_workers: 10,
            deletion_workers: 1,
            pushers: 10,
            retry_delay_ms: 60_000,
            upload_timeout_ms: 120_000,
            batch_timeout_ms: 60_000,
        }
    }
}

impl SyncConfig {
    /// Backoff as a duration.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Upload deadline as a duration.
    pub fn upload_timeout(&self) -> Duration {
        Duration::from_millis(self.upload_timeout_ms)
    }

    /// Batch/deletion deadline as a duration.
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }
}

/// Limits for coalescing block pushes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatcherConfig {
    /// Upper bound on the payload of one push request.
    pub max_batch_size: u64,
    /// Age after which a per-file batch is merged into a mixed batch.
    pub max_batch_wait_ms: u64,
    /// Minimum fill (bytes) a per-file batch needs before it is merged by age.
    ///
    /// Zero merges every aged batch regardless of size.
    pub min_mixed_fill: u64,
    /// Capacity of the outbound request channel.
    pub channel_capacity: usize,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 1024 * 1024 + 14,
            max_batch_wait_ms: 100,
            min_mixed_fill: 0,
            channel_capacity: 10,
        }
    }
}

impl BatcherConfig {
    /// Maximum batch age as a duration.
    pub fn max_batch_wait(&self) -> Duration {
        Duration::from_millis(self.max_batch_wait_ms)
    }
}

/// Node usage polling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageConfig {
    /// Poll interval while usage keeps changing.
    pub active_interval_ms: u64,
    /// Poll interval after two identical polls.
    pub idle_interval_ms: u64,
    /// Limit assumed before the first successful poll.
    pub default_limit: u64,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            active_interval_ms: 10_000,
            idle_interval_ms: 60_000,
            default_limit: 1024 * 1024 * 1024, // 1 GiB
        }
    }
}

impl UsageConfig {
    /// Active interval as a duration.
    pub fn active_interval(&self) -> Duration {
        Duration::from_millis(self.active_interval_ms)
    }

    /// Idle interval as a duration.
    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }
}
