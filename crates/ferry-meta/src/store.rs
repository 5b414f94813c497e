//! [`MetaStore`]: the Fjall database and the stores carved out of it.

use std::path::Path;

use fjall::{Database, KeyspaceCreateOptions};
use tempfile::TempDir;
use tracing::debug;

use crate::item_store::FjallItemStore;
use crate::record::Record;
use crate::system::SystemStore;
use crate::MetaError;

type Result<T> = std::result::Result<T, MetaError>;

/// Local metadata database.
///
/// Item stores are named; each name maps to a records keyspace and an
/// `<name>_idx` index keyspace. Names must be valid Fjall keyspace names
/// (ASCII letters, digits, `_` and `-`).
pub struct MetaStore {
    db: Database,
    system: SystemStore,
    _tmp: Option<TempDir>,
}

impl MetaStore {
    /// Open a persistent store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::builder(path.as_ref()).open()?;
        debug!(path = %path.as_ref().display(), "opened meta store");
        Self::init(db, None)
    }

    /// Open a temporary store that is removed on drop.
    pub fn open_temporary() -> Result<Self> {
        let tmp = tempfile::tempdir()?;
        let db = Database::builder(tmp.path()).temporary(true).open()?;
        Self::init(db, Some(tmp))
    }

    fn init(db: Database, tmp: Option<TempDir>) -> Result<Self> {
        let system = db.keyspace("system", KeyspaceCreateOptions::default)?;
        Ok(Self {
            db,
            system: SystemStore::new(system),
            _tmp: tmp,
        })
    }

    /// Item store for records of type `T` under `name`.
    ///
    /// Opening the same name twice yields handles onto the same data.
    pub fn item_store<T: Record>(&self, name: &str) -> Result<FjallItemStore<T>> {
        let items = self.db.keyspace(name, KeyspaceCreateOptions::default)?;
        let index = self
            .db
            .keyspace(&format!("{name}_idx"), KeyspaceCreateOptions::default)?;
        Ok(FjallItemStore::new(name, self.db.clone(), items, index))
    }

    /// Process-wide key/value store.
    pub fn system(&self) -> SystemStore {
        self.system.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ItemStore;
    use crate::record::tests::Task;

    #[test]
    fn test_same_name_shares_data() {
        let meta = MetaStore::open_temporary().unwrap();
        let a = meta.item_store::<Task>("filesync_queue").unwrap();
        let b = meta.item_store::<Task>("filesync_queue").unwrap();
        a.set("x", &Task::new("x", "k", 1)).unwrap();
        assert_eq!(b.get("x").unwrap().unwrap().priority, 1);
    }

    #[test]
    fn test_system_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let meta = MetaStore::open(dir.path()).unwrap();
            meta.system().set("answer", &42u64).unwrap();
        }
        let meta = MetaStore::open(dir.path()).unwrap();
        assert_eq!(meta.system().get::<u64>("answer").unwrap(), Some(42));
    }
}
