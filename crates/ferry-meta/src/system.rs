//! Typed key/value store for process-wide state.

use fjall::Keyspace;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::MetaError;

type Result<T> = std::result::Result<T, MetaError>;

/// Well-known system keys.
pub mod keys {
    /// Last [`NodeUsage`](https://docs.rs/ferry-types) snapshot fetched from the remote node.
    pub const NODE_USAGE: &str = "node_usage";
    /// Cached account status.
    pub const ACCOUNT_STATUS: &str = "account_status";
    /// Port of the local RPC server.
    pub const DRPC_SERVER_PORT: &str = "drpc_server_port";
}

/// Small typed key/value store. Values are postcard-encoded.
#[derive(Clone)]
pub struct SystemStore {
    keyspace: Keyspace,
}

impl SystemStore {
    pub(crate) fn new(keyspace: Keyspace) -> Self {
        Self { keyspace }
    }

    /// Read a value.
    pub fn get<V: DeserializeOwned>(&self, key: &str) -> Result<Option<V>> {
        match self.keyspace.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Write a value.
    pub fn set<V: Serialize>(&self, key: &str, value: &V) -> Result<()> {
        let bytes = postcard::to_allocvec(value)?;
        self.keyspace.insert(key.as_bytes(), bytes.as_slice())?;
        debug!(key, "stored system value");
        Ok(())
    }

    /// Remove a value.
    pub fn delete(&self, key: &str) -> Result<()> {
        self.keyspace.remove(key.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;
    use crate::MetaStore;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Usage {
        limit: u64,
        spaces: Vec<String>,
    }

    #[test]
    fn test_set_get_delete() {
        let meta = MetaStore::open_temporary().unwrap();
        let sys = meta.system();
        assert!(sys.get::<Usage>(keys::NODE_USAGE).unwrap().is_none());

        let usage = Usage {
            limit: 10,
            spaces: vec!["a".into()],
        };
        sys.set(keys::NODE_USAGE, &usage).unwrap();
        assert_eq!(sys.get::<Usage>(keys::NODE_USAGE).unwrap(), Some(usage));

        sys.delete(keys::NODE_USAGE).unwrap();
        assert!(sys.get::<Usage>(keys::NODE_USAGE).unwrap().is_none());
    }

    #[test]
    fn test_type_mismatch_is_serde_error() {
        let meta = MetaStore::open_temporary().unwrap();
        let sys = meta.system();
        sys.set(keys::DRPC_SERVER_PORT, &true).unwrap();
        assert!(matches!(
            sys.get::<Usage>(keys::DRPC_SERVER_PORT),
            Err(MetaError::Serde(_))
        ));
    }
}
