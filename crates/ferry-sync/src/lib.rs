//! File synchronization engine.
//!
//! [`FileSync`] drives every file through its lifecycle on a durable
//! [`ferry_queue::Queue`] of [`FileInfo`] records:
//!
//! - upload workers check which blocks the remote node is missing, reserve
//!   quota in the space's [`SpaceUsage`] tracker, bind blocks the node
//!   already has and hand the rest to the [`Batcher`];
//! - pushers ship batched blocks and complete files once every block landed;
//! - files that do not fit wait in the `Limited` state until the quota grows;
//! - deletion workers unbind deleted files from the node, retrying with a
//!   backoff.
//!
//! The [`UsagePoller`] keeps the account usage cached in the system store
//! and the [`StatusBridge`] reports per-file progress to observers.

mod batcher;
mod deletion;
mod error;
mod info;
mod limits;
mod service;
mod status;
mod upload;
mod usage;

pub use batcher::{BatchError, Batcher, BlockPushRequest};
pub use error::SyncError;
pub use info::{FileInfo, FileState};
pub use limits::{LimitManager, SpaceStatus, SpaceUsage, SpaceUsageSnapshot, SpaceView, UpdateMessage};
pub use service::{AddFileRequest, FileSync, FileSyncConfig, QUEUE_NAME, QueueInfo};
pub use status::{FileStatus, ObserverError, StatusBridge, StatusObserver};
pub use usage::{Cadence, UsagePoller};

#[cfg(test)]
mod tests;
