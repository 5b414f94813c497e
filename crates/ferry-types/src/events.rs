//! Typed pub/sub for user-facing sync events.
//!
//! Components publish plain event structs on an [`EventBus`]; the embedding
//! application subscribes per event type. Each type gets its own lazily
//! created `tokio::sync::broadcast` channel, looked up by `TypeId`.
//!
//! ```rust
//! use ferry_types::events::{EventBus, FileLimitReached};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let bus = EventBus::new();
//! let mut rx = bus.subscribe::<FileLimitReached>();
//! bus.emit(FileLimitReached { space_id: "space1".into() });
//! assert_eq!(rx.recv().await.unwrap().space_id, "space1");
//! # });
//! ```

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::warn;

/// Marker trait for anything that can travel through the [`EventBus`].
pub trait Event: Any + Send + Sync + Clone + std::fmt::Debug + 'static {}

/// Bytes used by a space changed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileSpaceUsage {
    /// Space whose usage changed.
    pub space_id: String,
    /// New usage of the space in bytes.
    pub bytes_usage: u64,
}
impl Event for FileSpaceUsage {}

/// The account-wide byte limit changed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileLimitUpdated {
    /// New limit in bytes.
    pub bytes_limit: u64,
}
impl Event for FileLimitUpdated {}

/// An upload could not proceed because the space ran out of quota.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileLimitReached {
    /// Space that hit its limit.
    pub space_id: String,
}
impl Event for FileLimitReached {}

/// Capacity of each per-type broadcast channel.
const CHANNEL_CAPACITY: usize = 256;

/// Clonable, thread-safe bus. Emitting never blocks.
#[derive(Clone, Default)]
pub struct EventBus {
    channels: Arc<Mutex<HashMap<TypeId, Box<dyn Any + Send + Sync>>>>,
}

impl EventBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    fn sender<E: Event>(&self) -> broadcast::Sender<E> {
        let mut channels = self.channels.lock().expect("event bus lock poisoned");
        channels
            .entry(TypeId::of::<E>())
            .or_insert_with(|| Box::new(broadcast::channel::<E>(CHANNEL_CAPACITY).0))
            .downcast_ref::<broadcast::Sender<E>>()
            .expect("event bus channel registered under the wrong type")
            .clone()
    }

    /// Publish an event; returns how many subscribers received it.
    ///
    /// Events emitted while nobody is subscribed are dropped.
    pub fn emit<E: Event>(&self, event: E) -> usize {
        self.sender::<E>().send(event).unwrap_or(0)
    }

    /// Subscribe to events of type `E` emitted from now on.
    pub fn subscribe<E: Event>(&self) -> EventReceiver<E> {
        EventReceiver {
            rx: self.sender::<E>().subscribe(),
        }
    }

    /// Number of live subscribers for `E`.
    pub fn subscriber_count<E: Event>(&self) -> usize {
        self.sender::<E>().receiver_count()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let channels = self.channels.lock().expect("event bus lock poisoned");
        f.debug_struct("EventBus")
            .field("channels", &channels.len())
            .finish()
    }
}

/// Receiver for one event type.
pub struct EventReceiver<E: Event> {
    rx: broadcast::Receiver<E>,
}

impl<E: Event> EventReceiver<E> {
    /// Wait for the next event, skipping over lag. `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<E> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        skipped,
                        event_type = std::any::type_name::<E>(),
                        "event receiver lagged"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking receive of an already queued event.
    pub fn try_recv(&mut self) -> Option<E> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}
