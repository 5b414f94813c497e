//! Error types for the sync engine.

use ferry_meta::MetaError;
use ferry_node::RemoteError;
use ferry_queue::QueueError;
use ferry_store::StoreError;
use ferry_types::TypesError;

use crate::batcher::BatchError;

/// Errors that can occur in the sync engine.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Invalid input at the API boundary.
    #[error(transparent)]
    Bad(#[from] TypesError),

    /// The space has no room for the file.
    #[error(
        "space limit reached: file needs {file_size} bytes, limit is {account_limit}, {total_bytes_usage} in use"
    )]
    LimitReached {
        file_size: u64,
        account_limit: u64,
        total_bytes_usage: u64,
    },

    /// An observer reported that the file's object no longer exists.
    #[error("object deleted")]
    ObjectDeleted,

    /// A remote call exceeded its deadline.
    #[error("remote call timed out")]
    Timeout,

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("block store error: {0}")]
    Store(#[from] StoreError),

    #[error("metadata error: {0}")]
    Meta(#[from] MetaError),

    #[error("batch error: {0}")]
    Batch(#[from] BatchError),
}

impl SyncError {
    /// Whether this error means the remote account is out of space.
    pub fn is_space_limit_exceeded(&self) -> bool {
        match self {
            Self::Remote(e) => e.is_space_limit_exceeded(),
            Self::LimitReached { .. } => true,
            _ => false,
        }
    }
}

/// Run `fut` under `limit`, mapping expiry to [`SyncError::Timeout`].
pub(crate) async fn with_timeout<T, E>(
    limit: std::time::Duration,
    fut: impl Future<Output = Result<T, E>>,
) -> Result<T, SyncError>
where
    SyncError: From<E>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => Ok(res?),
        Err(_) => Err(SyncError::Timeout),
    }
}
