//! Error types for block storage.

use cid::Cid;

/// Errors that can occur during block storage and DAG operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested block is not stored locally.
    #[error("block not found: {0}")]
    NotFound(Cid),

    /// The store has reached its capacity limit.
    #[error("store capacity exceeded: need {needed} bytes, only {available} available")]
    CapacityExceeded {
        /// Bytes needed for the operation.
        needed: u64,
        /// Bytes currently available.
        available: u64,
    },

    /// Block bytes do not hash to the CID they were stored under.
    #[error("block corruption detected: expected {expected}, actual {actual}")]
    Corrupt {
        /// The CID that was requested.
        expected: Cid,
        /// The CID computed from the stored bytes.
        actual: Cid,
    },

    /// A block is not a well-formed DAG-ProtoBuf node.
    #[error("malformed dag-pb node {cid}: {reason}")]
    Malformed {
        /// Offending block.
        cid: Cid,
        /// What went wrong.
        reason: String,
    },
}
