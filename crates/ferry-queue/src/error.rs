//! Error types for the queue.

use ferry_meta::MetaError;

/// Errors returned by [`Queue`](crate::Queue) operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The queue has been closed.
    #[error("queue closed")]
    Closed,

    /// The caller's cancellation token fired before an item was handed over.
    #[error("request canceled")]
    Canceled,

    /// No item matched a non-subscribing request.
    #[error("no rows")]
    NoRows,

    /// Release of an id that is not locked.
    #[error("item is not locked: {0}")]
    NotLocked(String),

    /// The backing item store failed.
    #[error("store error: {0}")]
    Store(#[from] MetaError),
}
