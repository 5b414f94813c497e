//! Deletion workers.

use std::sync::Arc;

use ferry_queue::QueueError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::with_timeout;
use crate::info::{FileInfo, FileState};
use crate::service::Shared;
use crate::upload::{ERROR_PAUSE, due_in_state};

impl Shared {
    pub(crate) async fn run_deletion_worker(self: Arc<Self>, worker: usize, cancel: CancellationToken) {
        debug!(worker, "deletion worker started");
        loop {
            match self.queue.get_next_scheduled(&cancel, due_in_state(FileState::PendingDeletion)).await {
                Ok(item) => {
                    let id = item.object_id.clone();
                    let next = self.process_pending_deletion(item).await;
                    if let Err(e) = self.queue.release_and_update(&id, next).await {
                        warn!(worker, object_id = %id, error = %e, "failed to release deletion item");
                    }
                }
                Err(QueueError::Canceled | QueueError::Closed) => break,
                Err(e) => {
                    error!(worker, error = %e, "failed to take next deletion");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(ERROR_PAUSE) => {}
                    }
                }
            }
        }
        debug!(worker, "deletion worker stopped");
    }

    /// One attempt at unbinding the file from the node. Failures keep the
    /// item pending and push it back by the retry delay.
    pub(crate) async fn process_pending_deletion(&self, mut it: FileInfo) -> FileInfo {
        it.touch();
        info!(object_id = %it.object_id, file_id = %it.file_id, "removing file");
        let file_ids = [it.file_id];
        let call = self.node.delete_files(&it.space_id, &file_ids);
        match with_timeout(self.cfg.batch_timeout(), call).await {
            Ok(()) => {
                self.deallocate(&it);
                it.set_state(FileState::Deleted);
                info!(object_id = %it.object_id, file_id = %it.file_id, "file deleted");
            }
            Err(e) => {
                warn!(
                    object_id = %it.object_id,
                    file_id = %it.file_id,
                    error = %e,
                    "file deletion failed, retrying later"
                );
                it.schedule_in(self.cfg.retry_delay());
            }
        }
        it
    }
}
