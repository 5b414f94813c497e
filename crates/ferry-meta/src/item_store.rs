//! Keyed record persistence with a secondary index.

use std::marker::PhantomData;

use fjall::{Database, Keyspace};
use tracing::{debug, warn};

use crate::MetaError;
use crate::record::{FieldValue, Record, StoreQuery};

type Result<T> = std::result::Result<T, MetaError>;

/// Persistence contract the work queue is built on.
///
/// Implementations must be safe to call from any thread. A `query` returns
/// the first record, in query order, that matches both the storage filter
/// and the caller's predicate.
pub trait ItemStore<T: Record>: Send + Sync {
    /// Read one record.
    fn get(&self, id: &str) -> Result<Option<T>>;

    /// Write a record under `id`. The record's own id is overwritten with `id`.
    fn set(&self, id: &str, item: &T) -> Result<()>;

    /// Remove a record. Removing a missing record is not an error.
    fn delete(&self, id: &str) -> Result<()>;

    /// First record matching `query` and `predicate`, in query order.
    fn query(&self, query: &StoreQuery, predicate: &mut dyn FnMut(&T) -> bool) -> Result<Option<T>>;

    /// Every stored record, in key order.
    fn list_all(&self) -> Result<Vec<T>>;
}

/// [`ItemStore`] over two Fjall keyspaces: records and their index.
///
/// Index keys are `field ++ 0x00 ++ encoded value ++ id`, so every record
/// with a given indexed value lives under one key prefix. A record and its
/// index entries are always written in one batch.
pub struct FjallItemStore<T> {
    name: String,
    db: Database,
    items: Keyspace,
    index: Keyspace,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Record> FjallItemStore<T> {
    pub(crate) fn new(name: &str, db: Database, items: Keyspace, index: Keyspace) -> Self {
        Self {
            name: name.to_string(),
            db,
            items,
            index,
            _marker: PhantomData,
        }
    }

    fn decode(bytes: &[u8]) -> Result<T> {
        Ok(postcard::from_bytes(bytes)?)
    }

    fn index_entries(item: &T) -> Vec<Vec<u8>> {
        T::INDEXED
            .iter()
            .filter_map(|field| item.field(field).map(|v| index_key(field, &v, item.id())))
            .collect()
    }

    /// Records referenced by the index under `field = value`.
    fn indexed_candidates(&self, field: &str, value: &FieldValue) -> Result<Vec<T>> {
        let prefix = index_prefix(field, value);
        let mut out = Vec::new();
        for guard in self.index.prefix(&prefix) {
            let id = guard.value()?;
            let Some(bytes) = self.items.get(&*id)? else {
                continue;
            };
            match Self::decode(&bytes) {
                Ok(item) => out.push(item),
                Err(e) => warn!(store = %self.name, error = %e, "skipping undecodable record"),
            }
        }
        Ok(out)
    }
}

impl<T: Record> ItemStore<T> for FjallItemStore<T> {
    fn get(&self, id: &str) -> Result<Option<T>> {
        match self.items.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn set(&self, id: &str, item: &T) -> Result<()> {
        let mut item = item.clone();
        item.set_id(id);

        let old = self.items.get(id.as_bytes())?.and_then(|b| Self::decode(&b).ok());
        let new_entries = Self::index_entries(&item);
        let value = postcard::to_allocvec(&item)?;

        let mut batch = self.db.batch();
        if let Some(old) = old {
            for key in Self::index_entries(&old) {
                if !new_entries.contains(&key) {
                    batch.remove(&self.index, key);
                }
            }
        }
        batch.insert(&self.items, id.as_bytes(), value);
        for key in new_entries {
            batch.insert(&self.index, key, id.as_bytes());
        }
        batch.commit()?;
        debug!(store = %self.name, id, "stored record");
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<()> {
        if let Some(bytes) = self.items.get(id.as_bytes())? {
            let mut batch = self.db.batch();
            if let Ok(old) = Self::decode(&bytes) {
                for key in Self::index_entries(&old) {
                    batch.remove(&self.index, key);
                }
            }
            batch.remove(&self.items, id.as_bytes());
            batch.commit()?;
            debug!(store = %self.name, id, "deleted record");
        }
        Ok(())
    }

    fn query(&self, query: &StoreQuery, predicate: &mut dyn FnMut(&T) -> bool) -> Result<Option<T>> {
        let candidates = match query.filter.index_hint(T::INDEXED) {
            Some((field, value)) => self.indexed_candidates(field, value)?,
            None => self.list_all()?,
        };

        let mut matching: Vec<T> = candidates
            .into_iter()
            .filter(|item| query.filter.matches(item))
            .collect();
        if let Some(order) = &query.order {
            matching.sort_by(|a, b| order.compare(a, b));
        }
        Ok(matching.into_iter().find(|item| predicate(item)))
    }

    fn list_all(&self) -> Result<Vec<T>> {
        let mut out = Vec::new();
        for guard in self.items.iter() {
            let v = guard.value()?;
            match Self::decode(&v) {
                Ok(item) => out.push(item),
                Err(e) => warn!(store = %self.name, error = %e, "skipping undecodable record"),
            }
        }
        Ok(out)
    }
}

fn index_prefix(field: &str, value: &FieldValue) -> Vec<u8> {
    let mut key = Vec::with_capacity(field.len() + 16);
    key.extend_from_slice(field.as_bytes());
    key.push(0);
    value.encode(&mut key);
    key
}

fn index_key(field: &str, value: &FieldValue, id: &str) -> Vec<u8> {
    let mut key = index_prefix(field, value);
    key.extend_from_slice(id.as_bytes());
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::tests::Task;
    use crate::{Filter, MetaStore, Order};

    fn store() -> (MetaStore, FjallItemStore<Task>) {
        let meta = MetaStore::open_temporary().unwrap();
        let items = meta.item_store::<Task>("tasks").unwrap();
        (meta, items)
    }

    #[test]
    fn test_set_get_delete() {
        let (_meta, items) = store();
        assert!(items.get("a").unwrap().is_none());

        items.set("a", &Task::new("ignored", "upload", 1)).unwrap();
        let got = items.get("a").unwrap().unwrap();
        assert_eq!(got.id, "a", "set must overwrite the payload id");
        assert_eq!(got.kind, "upload");

        items.delete("a").unwrap();
        assert!(items.get("a").unwrap().is_none());
        items.delete("a").unwrap();
    }

    #[test]
    fn test_query_uses_index_and_drops_stale_entries() {
        let (_meta, items) = store();
        items.set("a", &Task::new("a", "upload", 1)).unwrap();
        items.set("b", &Task::new("b", "delete", 1)).unwrap();

        let q = StoreQuery::new(Filter::eq("kind", "upload"));
        assert_eq!(items.query(&q, &mut |_| true).unwrap().unwrap().id, "a");

        // Moving "a" to another kind must remove it from the old index prefix.
        items.set("a", &Task::new("a", "delete", 1)).unwrap();
        assert!(items.query(&q, &mut |_| true).unwrap().is_none());

        let q = StoreQuery::new(Filter::eq("kind", "delete")).order_by(Order::asc("priority"));
        let mut seen = Vec::new();
        items
            .query(&q, &mut |t| {
                seen.push(t.id.clone());
                false
            })
            .unwrap();
        assert_eq!(seen, vec!["a", "b"]);
    }

    #[test]
    fn test_index_tracks_record_writes() {
        let (_meta, items) = store();
        let index_keys = |items: &FjallItemStore<Task>| -> Vec<Vec<u8>> {
            items.index.iter().map(|g| g.key().unwrap().to_vec()).collect()
        };

        items.set("a", &Task::new("a", "upload", 1)).unwrap();
        items.set("a", &Task::new("a", "delete", 2)).unwrap();
        items.set("a", &Task::new("a", "delete", 3)).unwrap();
        assert_eq!(
            index_keys(&items),
            vec![index_key("kind", &FieldValue::from("delete"), "a")]
        );

        items.delete("a").unwrap();
        assert!(index_keys(&items).is_empty());
        assert!(items.items.iter().next().is_none());
    }

    #[test]
    fn test_query_order_and_predicate() {
        let (_meta, items) = store();
        items.set("x", &Task::new("x", "upload", 30)).unwrap();
        items.set("y", &Task::new("y", "upload", 10)).unwrap();
        items.set("z", &Task::new("z", "upload", 20)).unwrap();

        let q = StoreQuery::new(Filter::eq("kind", "upload")).order_by(Order::asc("priority"));
        assert_eq!(items.query(&q, &mut |_| true).unwrap().unwrap().id, "y");
        assert_eq!(
            items.query(&q, &mut |t| t.id != "y").unwrap().unwrap().id,
            "z"
        );

        let q = StoreQuery::new(Filter::lte("priority", 20i64)).order_by(Order::desc("priority"));
        assert_eq!(items.query(&q, &mut |_| true).unwrap().unwrap().id, "z");
    }

    #[test]
    fn test_list_all_in_key_order() {
        let (_meta, items) = store();
        for id in ["c", "a", "b"] {
            items.set(id, &Task::new(id, "k", 0)).unwrap();
        }
        let ids: Vec<String> = items.list_all().unwrap().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_stores_are_isolated_by_name() {
        let meta = MetaStore::open_temporary().unwrap();
        let one = meta.item_store::<Task>("one").unwrap();
        let two = meta.item_store::<Task>("two").unwrap();
        one.set("a", &Task::new("a", "k", 0)).unwrap();
        assert!(two.get("a").unwrap().is_none());
        assert!(two.list_all().unwrap().is_empty());
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let meta = MetaStore::open(dir.path()).unwrap();
            let items = meta.item_store::<Task>("tasks").unwrap();
            items.set("a", &Task::new("a", "upload", 4)).unwrap();
        }
        let meta = MetaStore::open(dir.path()).unwrap();
        let items = meta.item_store::<Task>("tasks").unwrap();
        let q = StoreQuery::new(Filter::eq("kind", "upload"));
        assert_eq!(items.query(&q, &mut |_| true).unwrap().unwrap().priority, 4);
    }
}
