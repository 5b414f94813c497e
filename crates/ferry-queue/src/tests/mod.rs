//! Tests for the ferry-queue crate.


use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ferry_meta::{FieldValue, ItemStore, MetaStore, Record};
use serde::{Deserialize, Serialize};

use crate::Queue;

/// Grace period for "should not block" assertions.
const GRACE: Duration = Duration::from_secs(2);

/// Window used to assert that a call is still blocked.
const PENDING: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Job {
    id: String,
    kind: String,
    due_ms: i64,
}

impl Job {
    fn new(id: &str, kind: &str) -> Self {
        Self::due(id, kind, SystemTime::now())
    }

    fn due(id: &str, kind: &str, at: SystemTime) -> Self {
        let due_ms = at.duration_since(UNIX_EPOCH).unwrap().as_millis() as i64;
        Self {
            id: id.into(),
            kind: kind.into(),
            due_ms,
        }
    }

    fn due_at(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.due_ms as u64)
    }
}

impl Record for Job {
    const INDEXED: &'static [&'static str] = &["kind"];

    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: &str) {
        self.id = id.to_string();
    }

    fn field(&self, name: &str) -> Option<FieldValue> {
        match name {
            "kind" => Some(self.kind.as_str().into()),
            "due_ms" => Some(self.due_ms.into()),
            _ => None,
        }
    }
}

/// Fresh queue over a temporary database. Keep the `MetaStore` alive for
/// the duration of the test.
fn queue() -> (MetaStore, Arc<Queue<Job>>) {
    let meta = MetaStore::open_temporary().unwrap();
    let store: Arc<dyn ItemStore<Job>> = Arc::new(meta.item_store::<Job>("jobs").unwrap());
    (meta, Arc::new(Queue::new(store)))
}

/// Store `job` through the queue.
async fn put(queue: &Queue<Job>, job: Job) {
    let id = job.id.clone();
    queue.get_by_id(&id).await.unwrap();
    queue.release_and_update(&id, job).await.unwrap();
}
