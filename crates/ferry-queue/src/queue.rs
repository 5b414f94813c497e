//! Public handle onto the queue actor.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ferry_meta::{ItemStore, Record};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::QueueError;
use crate::actor::{Actor, Command, Search};
use crate::request::{GetNextRequest, GetNextScheduledRequest};

type Result<T> = std::result::Result<T, QueueError>;

/// Outcome of [`Queue::get_by_id`]. The lock on the id is held either way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry<T> {
    /// The record exists.
    Occupied(T),
    /// No record is stored under this id yet.
    Vacant(String),
}

impl<T> Entry<T> {
    /// The stored record, if any.
    pub fn into_option(self) -> Option<T> {
        match self {
            Self::Occupied(item) => Some(item),
            Self::Vacant(_) => None,
        }
    }

    /// Whether no record exists.
    pub fn is_vacant(&self) -> bool {
        matches!(self, Self::Vacant(_))
    }
}

/// How [`Queue::process`] releases the lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Release<T> {
    /// Persist the new value, then unlock.
    Update(T),
    /// Unlock without writing.
    Keep,
}

/// Durable work queue over an [`ItemStore`].
///
/// Must be created inside a tokio runtime; the actor task runs until
/// [`close`](Self::close) is called or the queue is dropped.
pub struct Queue<T: Record> {
    commands: mpsc::UnboundedSender<Command<T>>,
    store: Arc<dyn ItemStore<T>>,
    close: CancellationToken,
    next_request: AtomicU64,
}

impl<T: Record> Queue<T> {
    /// Start a queue over `store`.
    pub fn new(store: Arc<dyn ItemStore<T>>) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (due_tx, due_rx) = mpsc::unbounded_channel();
        let close = CancellationToken::new();

        let actor = Actor::new(Arc::clone(&store), close.clone(), due_tx);
        tokio::spawn(actor.run(command_rx, due_rx));

        Self {
            commands,
            store,
            close,
            next_request: AtomicU64::new(1),
        }
    }

    fn send(&self, cmd: Command<T>) -> Result<()> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }
        self.commands.send(cmd).map_err(|_| QueueError::Closed)
    }

    /// Lock `id` and return its record, waiting while another consumer
    /// holds it. The lock is taken even if no record exists, so a caller
    /// can initialize the item race-free.
    pub async fn get_by_id(&self, id: &str) -> Result<Entry<T>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::GetById {
            id: id.to_string(),
            reply,
        })?;
        rx.await.unwrap_or(Err(QueueError::Closed))
    }

    /// Lock and return the next free item matching `req`.
    ///
    /// With `req.subscribe` the call waits until such an item appears;
    /// otherwise it fails with [`QueueError::NoRows`].
    pub async fn get_next(&self, cancel: &CancellationToken, req: GetNextRequest<T>) -> Result<T> {
        self.search(cancel, |request, reply| {
            Command::GetNext(Search {
                request,
                subscribe: req.subscribe,
                query: req.query,
                filter: req.filter,
                scheduled_at: None,
                reply,
            })
        })
        .await
    }

    /// Lock and return the next item matching `req` whose scheduled time
    /// has come, waiting for its timer if needed.
    pub async fn get_next_scheduled(
        &self,
        cancel: &CancellationToken,
        req: GetNextScheduledRequest<T>,
    ) -> Result<T> {
        self.search(cancel, |request, reply| {
            Command::GetNextScheduled(Search {
                request,
                subscribe: req.subscribe,
                query: req.query,
                filter: req.filter,
                scheduled_at: Some(req.scheduled_at),
                reply,
            })
        })
        .await
    }

    async fn search(
        &self,
        cancel: &CancellationToken,
        build: impl FnOnce(u64, oneshot::Sender<Result<T>>) -> Command<T>,
    ) -> Result<T> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }
        if cancel.is_cancelled() {
            return Err(QueueError::Canceled);
        }

        let request = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (reply, mut rx) = oneshot::channel();
        self.send(build(request, reply))?;

        tokio::select! {
            biased;
            res = &mut rx => return res.unwrap_or(Err(QueueError::Closed)),
            _ = cancel.cancelled() => {}
        }

        let _ = self.commands.send(Command::Cancel { request });
        match rx.await {
            // Handed over while the cancel was in flight.
            Ok(Ok(item)) => {
                if let Err(e) = self.release(item.id()).await {
                    warn!(id = item.id(), error = %e, "failed to release item after cancel");
                }
                Err(QueueError::Canceled)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(QueueError::Closed),
        }
    }

    async fn release_with(&self, id: &str, update: Option<T>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Release {
            id: id.to_string(),
            update,
            reply,
        })?;
        rx.await.unwrap_or(Err(QueueError::Closed))
    }

    /// Unlock `id` without writing. Waiters observe the stored value.
    pub async fn release(&self, id: &str) -> Result<()> {
        self.release_with(id, None).await
    }

    /// Persist `item` under `id` and unlock it.
    pub async fn release_and_update(&self, id: &str, item: T) -> Result<()> {
        self.release_with(id, Some(item)).await
    }

    /// Lock `id`, let `f` derive the new value from the stored one, persist
    /// it and unlock.
    pub async fn upsert(&self, id: &str, f: impl FnOnce(Option<T>) -> T) -> Result<()> {
        self.process(id, |entry| async move {
            Ok::<_, QueueError>(Release::Update(f(entry.into_option())))
        })
        .await
    }

    /// Lock `id`, run `f` on its entry and release according to the result.
    ///
    /// The lock is released on every exit path: [`Release::Update`] persists,
    /// [`Release::Keep`] and errors unlock without writing. Dropping the
    /// returned future mid-way also unlocks.
    pub async fn process<F, Fut, E>(&self, id: &str, f: F) -> std::result::Result<(), E>
    where
        F: FnOnce(Entry<T>) -> Fut,
        Fut: Future<Output = std::result::Result<Release<T>, E>>,
        E: From<QueueError>,
    {
        let entry = self.get_by_id(id).await?;
        let mut guard = LockGuard {
            queue: self,
            id,
            armed: true,
        };

        let outcome = f(entry).await;
        guard.armed = false;
        match outcome {
            Ok(Release::Update(item)) => Ok(self.release_and_update(id, item).await?),
            Ok(Release::Keep) => Ok(self.release(id).await?),
            Err(e) => {
                if let Err(release_err) = self.release(id).await {
                    warn!(id, error = %release_err, "failed to release item after error");
                }
                Err(e)
            }
        }
    }

    /// All stored records, bypassing the lock table.
    pub fn list(&self) -> Result<Vec<T>> {
        Ok(self.store.list_all()?)
    }

    /// Stop the actor. Every waiter receives [`QueueError::Closed`], and so
    /// does every later call.
    pub fn close(&self) {
        if !self.close.is_cancelled() {
            debug!("closing queue");
        }
        self.close.cancel();
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.close.is_cancelled()
    }
}

impl<T: Record> Drop for Queue<T> {
    fn drop(&mut self) {
        self.close.cancel();
    }
}

/// Releases the lock if the owning [`Queue::process`] future is dropped
/// before it reaches its own release.
struct LockGuard<'a, T: Record> {
    queue: &'a Queue<T>,
    id: &'a str,
    armed: bool,
}

impl<T: Record> Drop for LockGuard<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            let (reply, _) = oneshot::channel();
            let _ = self.queue.send(Command::Release {
                id: self.id.to_string(),
                update: None,
                reply,
            });
        }
    }
}
