//! Per-file status callbacks and user-facing quota events.

use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use ferry_types::FullFileId;
use ferry_types::events::{EventBus, FileLimitReached};
use tracing::{debug, warn};

/// Sync status of a file as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileStatus {
    Syncing,
    Synced,
    Limited,
}

/// Errors an observer can return.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ObserverError {
    /// The object owning the file is gone; the file should be deleted.
    #[error("object deleted")]
    ObjectDeleted,

    #[error("{0}")]
    Other(String),
}

/// Receives status transitions of files.
#[async_trait]
pub trait StatusObserver: Send + Sync {
    async fn on_status(&self, object_id: &str, file: &FullFileId, status: FileStatus) -> Result<(), ObserverError>;
}

#[async_trait]
impl<F> StatusObserver for F
where
    F: Fn(&str, &FullFileId, FileStatus) -> Result<(), ObserverError> + Send + Sync,
{
    async fn on_status(&self, object_id: &str, file: &FullFileId, status: FileStatus) -> Result<(), ObserverError> {
        self(object_id, file, status)
    }
}

/// Fans status updates out to observers and quota events onto the bus.
pub struct StatusBridge {
    observers: RwLock<Vec<Arc<dyn StatusObserver>>>,
    events: EventBus,
    import_events: Mutex<Vec<FileLimitReached>>,
}

impl StatusBridge {
    pub fn new(events: EventBus) -> Self {
        Self {
            observers: RwLock::new(Vec::new()),
            events,
            import_events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Register an observer; it sees every later transition.
    pub fn register(&self, observer: Arc<dyn StatusObserver>) {
        self.observers.write().expect("lock poisoned").push(observer);
    }

    /// Call every observer. [`ObserverError::ObjectDeleted`] from any of them
    /// is returned after all have run; other errors are only logged.
    pub async fn notify(&self, object_id: &str, file: &FullFileId, status: FileStatus) -> Result<(), ObserverError> {
        let observers: Vec<Arc<dyn StatusObserver>> = self.observers.read().expect("lock poisoned").clone();
        let mut deleted = false;
        for observer in observers {
            match observer.on_status(object_id, file, status).await {
                Ok(()) => {}
                Err(ObserverError::ObjectDeleted) => deleted = true,
                Err(e) => warn!(object_id, ?status, error = %e, "status observer failed"),
            }
        }
        if deleted {
            debug!(object_id, "observer reported object deleted");
            return Err(ObserverError::ObjectDeleted);
        }
        Ok(())
    }

    /// Tell the user the space is out of quota.
    pub fn limit_reached(&self, space_id: &str) {
        self.events.emit(FileLimitReached {
            space_id: space_id.to_string(),
        });
    }

    /// Hold a limit event until the running import finishes.
    pub fn buffer_import_event(&self, space_id: &str) {
        self.import_events.lock().expect("lock poisoned").push(FileLimitReached {
            space_id: space_id.to_string(),
        });
    }

    /// Emit buffered import events, one per space.
    pub fn send_import_events(&self) {
        let mut pending = std::mem::take(&mut *self.import_events.lock().expect("lock poisoned"));
        pending.sort_by(|a, b| a.space_id.cmp(&b.space_id));
        pending.dedup();
        for event in pending {
            self.events.emit(event);
        }
    }

    pub fn clear_import_events(&self) {
        self.import_events.lock().expect("lock poisoned").clear();
    }
}
