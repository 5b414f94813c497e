//! Upload workers, pushers and the limited-files loop.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use cid::Cid;
use ferry_meta::{Filter, Order, StoreQuery};
use ferry_node::{Availability, FileBlocks};
use ferry_queue::{Entry, GetNextRequest, GetNextScheduledRequest, QueueError, Release};
use ferry_store::DagWalker;
use ferry_types::{Block, FileId, FullFileId};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batcher::BlockPushRequest;
use crate::error::{SyncError, with_timeout};
use crate::info::{FileInfo, FileState, unix_ms};
use crate::limits::UpdateMessage;
use crate::service::Shared;
use crate::status::{FileStatus, ObserverError};

/// Pause after an unexpected queue error before asking again.
pub(crate) const ERROR_PAUSE: Duration = Duration::from_secs(1);

/// Residual remote work found by an availability check.
#[derive(Debug, Default)]
pub(crate) struct BlocksAvailability {
    pub(crate) bytes: u64,
    pub(crate) to_upload: BTreeSet<Cid>,
    pub(crate) to_bind: BTreeSet<Cid>,
}

/// Subscribing request for the earliest due item in `state`.
pub(crate) fn due_in_state(state: FileState) -> GetNextScheduledRequest<FileInfo> {
    GetNextScheduledRequest::new(move |it: &FileInfo| it.state == state, FileInfo::scheduled_at)
        .subscribe()
        .query(StoreQuery::new(Filter::eq("state", state.code())).order_by(Order::asc("scheduled_at")))
}

fn roots(it: &FileInfo) -> Vec<FileId> {
    it.variants.iter().copied().chain([it.file_id]).collect()
}

impl Shared {
    pub(crate) async fn run_upload_worker(self: Arc<Self>, worker: usize, cancel: CancellationToken) {
        debug!(worker, "upload worker started");
        loop {
            match self.queue.get_next_scheduled(&cancel, due_in_state(FileState::PendingUpload)).await {
                Ok(item) => {
                    let id = item.object_id.clone();
                    let next = self.process_pending_upload(item).await;
                    if let Err(e) = self.queue.release_and_update(&id, next).await {
                        warn!(worker, object_id = %id, error = %e, "failed to release upload item");
                    }
                }
                Err(QueueError::Canceled | QueueError::Closed) => break,
                Err(e) => {
                    error!(worker, error = %e, "failed to take next upload");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(ERROR_PAUSE) => {}
                    }
                }
            }
        }
        debug!(worker, "upload worker stopped");
    }

    /// One processing step of a `PendingUpload` item. Never fails: errors
    /// release the reservation and reschedule the item.
    pub(crate) async fn process_pending_upload(&self, mut it: FileInfo) -> FileInfo {
        it.touch();
        if let Err(e) = self.upload_file(&mut it).await {
            self.deallocate(&it);
            warn!(
                object_id = %it.object_id,
                file_id = %it.file_id,
                error = %e,
                "upload failed, retrying later"
            );
            it.set_state(FileState::PendingUpload);
            it.schedule_in(self.cfg.retry_delay());
        }
        it
    }

    async fn upload_file(&self, it: &mut FileInfo) -> Result<(), SyncError> {
        let timeout = self.cfg.upload_timeout();
        let availability =
            with_timeout(timeout, self.check_blocks_availability(&it.space_id, &roots(it))).await?;
        it.bytes_to_upload_or_bind = availability.bytes;
        it.cids_to_upload = availability.to_upload;
        it.cids_to_bind = availability.to_bind;

        let space = with_timeout(timeout, self.limits.get_space(&it.space_id)).await?;
        if let Err(e) = space.allocate_file(&it.object_id, it.bytes_to_upload_or_bind) {
            debug!(object_id = %it.object_id, error = %e, "file does not fit");
            self.handle_limit_reached(it).await;
            return Ok(());
        }

        if let Err(ObserverError::ObjectDeleted) = self.notify(it, FileStatus::Syncing).await {
            space.deallocate_file(&it.object_id);
            it.set_state(FileState::PendingDeletion);
            it.scheduled_at = unix_ms(SystemTime::now());
            return Ok(());
        }

        match with_timeout(timeout, self.upload_or_bind(it)).await {
            Ok(queued) => debug!(object_id = %it.object_id, queued, "blocks handed to batcher"),
            Err(e) if e.is_space_limit_exceeded() => {
                space.deallocate_file(&it.object_id);
                self.handle_limit_reached(it).await;
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        it.cids_to_bind.clear();

        if it.cids_to_upload.is_empty() {
            // Everything was already on the node.
            self.complete_upload(it).await;
            self.refresh_usage().await;
        } else {
            it.set_state(FileState::Uploading);
        }
        Ok(())
    }

    /// Ask the node which blocks of the DAGs under `roots` it is missing.
    pub(crate) async fn check_blocks_availability(
        &self,
        space_id: &str,
        roots: &[FileId],
    ) -> Result<BlocksAvailability, SyncError> {
        let mut result = BlocksAvailability::default();
        let mut walker = DagWalker::new(self.blocks.as_ref(), roots.iter().copied());
        while let Some(batch) = walker.next_batch().await? {
            let sizes: HashMap<Cid, u64> = batch.iter().map(|b| (b.cid, b.len())).collect();
            let cids: Vec<Cid> = batch.iter().map(|b| b.cid).collect();
            for answer in self.node.check_availability(space_id, &cids).await? {
                let size = sizes.get(&answer.cid).copied().unwrap_or(0);
                match answer.status {
                    Availability::NotExists => {
                        result.to_upload.insert(answer.cid);
                        result.bytes += size;
                    }
                    Availability::Exists => {
                        result.to_bind.insert(answer.cid);
                        result.bytes += size;
                    }
                    Availability::ExistsInSpace => {}
                }
            }
        }
        Ok(result)
    }

    /// Bind blocks the node already stores and queue the missing ones.
    /// Returns the number of bytes queued.
    async fn upload_or_bind(&self, it: &FileInfo) -> Result<u64, SyncError> {
        let mut queued = 0;
        let mut walker = DagWalker::new(self.blocks.as_ref(), roots(it));
        while let Some(batch) = walker.next_batch().await? {
            let bind: Vec<Cid> = batch
                .iter()
                .map(|b| b.cid)
                .filter(|c| it.cids_to_bind.contains(c))
                .collect();
            if !bind.is_empty() {
                self.node.bind_cids(&it.space_id, it.file_id, &bind).await?;
            }

            let upload: Vec<Block> = batch
                .into_iter()
                .filter(|b| it.cids_to_upload.contains(&b.cid))
                .collect();
            if !upload.is_empty() {
                queued += upload.iter().map(Block::len).sum::<u64>();
                self.batcher
                    .add_file(&it.space_id, it.file_id, &it.object_id, upload)
                    .await?;
            }
        }
        Ok(queued)
    }

    /// Record a fully uploaded file.
    async fn complete_upload(&self, it: &mut FileInfo) {
        if let Some(space) = self.limits.existing(&it.space_id) {
            space.mark_file_uploaded(&it.object_id);
        }
        if let Err(ObserverError::ObjectDeleted) = self.notify(it, FileStatus::Synced).await {
            it.set_state(FileState::PendingDeletion);
            it.scheduled_at = unix_ms(SystemTime::now());
            return;
        }
        it.set_state(FileState::Done);
        info!(object_id = %it.object_id, file_id = %it.file_id, space_id = %it.space_id, "file uploaded");
    }

    /// Park a file that does not fit and tell the user.
    pub(crate) async fn handle_limit_reached(&self, it: &mut FileInfo) {
        it.set_state(FileState::Limited);
        info!(
            object_id = %it.object_id,
            space_id = %it.space_id,
            bytes = it.bytes_to_upload_or_bind,
            "space limit reached"
        );

        // Drop whatever part of the file the node already charged.
        let file_ids = [it.file_id];
        let unbind = self.node.delete_files(&it.space_id, &file_ids);
        if let Err(e) = with_timeout(self.cfg.batch_timeout(), unbind).await {
            warn!(file_id = %it.file_id, error = %e, "failed to unbind off-limit file");
        }

        let _ = self.notify(it, FileStatus::Limited).await;
        if it.added_by_user && !it.imported {
            self.status.limit_reached(&it.space_id);
        }
        if it.imported {
            self.status.buffer_import_event(&it.space_id);
        }
    }

    pub(crate) async fn notify(&self, it: &FileInfo, status: FileStatus) -> Result<(), ObserverError> {
        if it.object_id.is_empty() {
            return Ok(());
        }
        self.status.notify(&it.object_id, &it.full_file_id(), status).await
    }

    pub(crate) fn deallocate(&self, it: &FileInfo) {
        if let Some(space) = self.limits.existing(&it.space_id) {
            space.deallocate_file(&it.object_id);
        }
    }

    /// Poll account usage after a change; also refreshes every tracker.
    pub(crate) async fn refresh_usage(&self) {
        if let Err(e) = self.usage.update().await {
            warn!(error = %e, "failed to refresh node usage");
        }
    }

    pub(crate) async fn run_pusher(
        self: Arc<Self>,
        pusher: usize,
        requests: Arc<Mutex<mpsc::Receiver<BlockPushRequest>>>,
        cancel: CancellationToken,
    ) {
        debug!(pusher, "pusher started");
        loop {
            let next = {
                let mut rx = requests.lock().await;
                tokio::select! {
                    _ = cancel.cancelled() => None,
                    req = rx.recv() => req,
                }
            };
            match next {
                Some(req) => Arc::clone(&self).push(req).await,
                None => break,
            }
        }

        // Ship what the final batcher flush left behind.
        loop {
            let next = requests.lock().await.try_recv();
            match next {
                Ok(req) => Arc::clone(&self).push(req).await,
                Err(_) => break,
            }
        }
        debug!(pusher, "pusher stopped");
    }

    /// Push one request. Per-file bookkeeping waits on item locks, so it
    /// runs in its own task and the pusher moves on.
    pub(crate) async fn push(self: Arc<Self>, req: BlockPushRequest) {
        let files: Vec<(FullFileId, String, Vec<Cid>)> = req
            .files
            .iter()
            .map(|f| {
                let key = FullFileId::new(f.space_id.clone(), f.file_id);
                let object_id = req.object_ids.get(&key).cloned().unwrap_or_default();
                (key, object_id, f.blocks.iter().map(|b| b.cid).collect())
            })
            .collect();
        let bytes = req.size();

        let result = with_timeout(self.cfg.batch_timeout(), self.node.block_push_many(req.files)).await;
        match &result {
            Ok(()) => debug!(files = files.len(), bytes, "pushed blocks"),
            Err(e) => warn!(files = files.len(), bytes, error = %e, "block push failed"),
        }
        let result = Arc::new(result);

        for (file, object_id, cids) in files {
            if object_id.is_empty() {
                continue;
            }
            let shared = Arc::clone(&self);
            let result = Arc::clone(&result);
            tokio::spawn(async move {
                let outcome = match result.as_ref() {
                    Ok(()) => shared.on_pushed(&object_id, &file, &cids).await,
                    Err(e) => shared.on_push_failed(&object_id, &file, e).await,
                };
                if let Err(e) = outcome {
                    warn!(%object_id, error = %e, "failed to record push result");
                }
            });
        }
    }

    async fn on_pushed(&self, object_id: &str, file: &FullFileId, cids: &[Cid]) -> Result<(), SyncError> {
        let mut completed = false;
        let done = &mut completed;
        self.queue
            .process(object_id, |entry| async move {
                let Entry::Occupied(mut it) = entry else {
                    return Ok(Release::Keep);
                };
                if it.state != FileState::Uploading || it.full_file_id() != *file {
                    return Ok(Release::Keep);
                }
                for cid in cids {
                    it.cids_to_upload.remove(cid);
                }
                if it.cids_to_upload.is_empty() {
                    self.complete_upload(&mut it).await;
                    *done = true;
                }
                Ok::<_, SyncError>(Release::Update(it))
            })
            .await?;
        if completed {
            self.refresh_usage().await;
        }
        Ok(())
    }

    async fn on_push_failed(&self, object_id: &str, file: &FullFileId, err: &SyncError) -> Result<(), SyncError> {
        self.queue
            .process(object_id, |entry| async move {
                let Entry::Occupied(mut it) = entry else {
                    return Ok(Release::Keep);
                };
                if it.state != FileState::Uploading || it.full_file_id() != *file {
                    return Ok(Release::Keep);
                }
                self.deallocate(&it);
                if err.is_space_limit_exceeded() {
                    self.handle_limit_reached(&mut it).await;
                } else {
                    it.set_state(FileState::PendingUpload);
                    it.schedule_in(self.cfg.retry_delay());
                }
                Ok::<_, SyncError>(Release::Update(it))
            })
            .await
    }

    /// Put items left `Uploading` by a previous run back in line.
    pub(crate) async fn reset_uploading(&self) -> Result<usize, SyncError> {
        let cancel = CancellationToken::new();
        let mut reset = 0;
        loop {
            let req = GetNextRequest::new(|it: &FileInfo| it.state == FileState::Uploading)
                .query(StoreQuery::new(Filter::eq("state", FileState::Uploading.code())));
            match self.queue.get_next(&cancel, req).await {
                Ok(mut it) => {
                    it.set_state(FileState::PendingUpload);
                    it.scheduled_at = unix_ms(SystemTime::now());
                    let id = it.object_id.clone();
                    self.queue.release_and_update(&id, it).await?;
                    reset += 1;
                }
                Err(QueueError::NoRows) => break,
                Err(e) => return Err(e.into()),
            }
        }
        if reset > 0 {
            info!(reset, "requeued interrupted uploads");
        }
        Ok(reset)
    }

    /// Create trackers for spaces that still hold `Limited` files, so their
    /// first refresh can release whatever fits now.
    pub(crate) async fn track_limited_spaces(&self) -> Result<(), SyncError> {
        let spaces: BTreeSet<String> = self
            .queue
            .list()?
            .into_iter()
            .filter(|it| it.state == FileState::Limited)
            .map(|it| it.space_id)
            .collect();
        for space_id in spaces {
            if let Err(e) = self.limits.get_space(&space_id).await {
                warn!(%space_id, error = %e, "failed to track space with limited files");
            }
        }
        Ok(())
    }

    pub(crate) async fn run_limited(
        self: Arc<Self>,
        mut updates: mpsc::UnboundedReceiver<UpdateMessage>,
        cancel: CancellationToken,
    ) {
        loop {
            let update = tokio::select! {
                _ = cancel.cancelled() => break,
                update = updates.recv() => match update {
                    Some(update) => update,
                    None => break,
                },
            };
            self.release_limited(&update, &cancel).await;
        }
        debug!("limited loop stopped");
    }

    /// Move `Limited` files of the space that now fit back to
    /// `PendingUpload`, oldest first, until the free space is spent.
    pub(crate) async fn release_limited(&self, update: &UpdateMessage, cancel: &CancellationToken) {
        let mut free = update.free_space();
        loop {
            let space_id = update.space_id.clone();
            let budget = free;
            let req = GetNextRequest::new(move |it: &FileInfo| {
                it.state == FileState::Limited && it.space_id == space_id && it.bytes_to_upload_or_bind <= budget
            })
            .query(
                StoreQuery::new(
                    Filter::eq("state", FileState::Limited.code())
                        .and(Filter::eq("space_id", update.space_id.as_str()))
                        .and(Filter::lte("bytes_to_upload_or_bind", budget)),
                )
                .order_by(Order::asc("scheduled_at")),
            );

            let mut it = match self.queue.get_next(cancel, req).await {
                Ok(it) => it,
                Err(QueueError::NoRows | QueueError::Canceled | QueueError::Closed) => break,
                Err(e) => {
                    warn!(space_id = %update.space_id, error = %e, "failed to take limited file");
                    break;
                }
            };
            free = free.saturating_sub(it.bytes_to_upload_or_bind);
            it.set_state(FileState::PendingUpload);
            it.scheduled_at = unix_ms(SystemTime::now());
            info!(object_id = %it.object_id, space_id = %it.space_id, "retrying limited file");

            let id = it.object_id.clone();
            if let Err(e) = self.queue.release_and_update(&id, it).await {
                warn!(object_id = %id, error = %e, "failed to requeue limited file");
                break;
            }
        }
    }

    /// Upload a file right now, bypassing the queue.
    pub(crate) async fn upload_synchronously(&self, space_id: &str, file_id: FileId) -> Result<(), SyncError> {
        let max = self.batcher.max_batch_size();
        let work = async {
            let availability = self.check_blocks_availability(space_id, &[file_id]).await?;
            let mut walker = DagWalker::new(self.blocks.as_ref(), [file_id]);
            let mut pending: Vec<Block> = Vec::new();
            let mut pending_size = 0;
            while let Some(batch) = walker.next_batch().await? {
                let bind: Vec<Cid> = batch
                    .iter()
                    .map(|b| b.cid)
                    .filter(|c| availability.to_bind.contains(c))
                    .collect();
                if !bind.is_empty() {
                    self.node.bind_cids(space_id, file_id, &bind).await?;
                }
                for block in batch.into_iter().filter(|b| availability.to_upload.contains(&b.cid)) {
                    if !pending.is_empty() && pending_size + block.len() > max {
                        self.push_now(space_id, file_id, std::mem::take(&mut pending)).await?;
                        pending_size = 0;
                    }
                    pending_size += block.len();
                    pending.push(block);
                }
            }
            if !pending.is_empty() {
                self.push_now(space_id, file_id, pending).await?;
            }
            Ok::<_, SyncError>(())
        };
        with_timeout(self.cfg.upload_timeout(), work).await?;
        info!(space_id, %file_id, "file uploaded synchronously");
        self.refresh_usage().await;
        Ok(())
    }

    async fn push_now(&self, space_id: &str, file_id: FileId, blocks: Vec<Block>) -> Result<(), SyncError> {
        let file = FileBlocks {
            space_id: space_id.to_string(),
            file_id,
            blocks,
        };
        Ok(self.node.block_push_many(vec![file]).await?)
    }
}
