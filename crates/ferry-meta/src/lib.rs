//! Record persistence layer wrapping Fjall.
//!
//! [`MetaStore`] owns the database and hands out two kinds of stores:
//!
//! - [`FjallItemStore`]: one postcard-encoded record per queue item, keyed
//!   by the item id, with a secondary index over the fields a [`Record`]
//!   declares in [`Record::INDEXED`]. Queries combine a storage-side
//!   [`Filter`] and [`Order`] with an in-memory predicate supplied by the
//!   caller.
//! - [`SystemStore`]: a small typed key/value store for process-wide state
//!   such as the cached node usage ([`keys::NODE_USAGE`]).

mod error;
mod item_store;
mod record;
mod store;
mod system;

pub use error::MetaError;
pub use item_store::{FjallItemStore, ItemStore};
pub use record::{FieldValue, Filter, Order, Record, StoreQuery};
pub use store::MetaStore;
pub use system::{SystemStore, keys};
