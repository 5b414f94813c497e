//! Local block storage for Ferry.
//!
//! - [`BlockStore`]: async trait for content-addressed blocks, with the
//!   in-memory [`MemoryBlockStore`] backend.
//! - [`DagBuilder`]: splits file data into DAG-ProtoBuf blocks and links
//!   them under a root, the root CID being the file's [`FileId`](ferry_types::FileId).
//! - [`DagWalker`]: breadth-first traversal of one or more file DAGs in
//!   batches, visiting every block once.

mod dag;
mod error;
mod memory_store;
mod traits;
mod walk;

pub use dag::{DEFAULT_CHUNK_SIZE, DagBuilder, FileDag, PbLink, PbNode, read_file};
pub use error::StoreError;
pub use memory_store::MemoryBlockStore;
pub use traits::BlockStore;
pub use walk::{DagWalker, WALK_BATCH};
