//! Shared types and identifiers for Ferry.
//!
//! This crate defines the core types used across the Ferry workspace:
//! identifiers ([`FileId`], [`FullFileId`]), content blocks ([`Block`]),
//! remote usage records ([`NodeUsage`], [`SpaceStat`]), the typed
//! [`events::EventBus`] and engine configuration ([`config`]).

pub mod config;
pub mod events;

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use cid::Cid;
use cid::multihash::Multihash;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

/// Multicodec code for DAG-ProtoBuf.
pub const DAG_PB: u64 = 0x70;

/// Multihash code for SHA2-256.
pub const SHA2_256: u64 = 0x12;

/// Errors produced when validating identifiers at the crate boundary.
#[derive(Debug, thiserror::Error)]
pub enum TypesError {
    /// The input is not an acceptable identifier.
    #[error("bad input: {0}")]
    Bad(String),
}

// ---------------------------------------------------------------------------
// Content identifiers
// ---------------------------------------------------------------------------

/// Compute the CIDv1 (DAG-ProtoBuf, SHA-256) of an encoded block.
pub fn block_cid(data: &[u8]) -> Cid {
    let digest = Sha256::digest(data);
    let hash = Multihash::<64>::wrap(SHA2_256, &digest).expect("sha-256 digest fits in a multihash");
    Cid::new_v1(DAG_PB, hash)
}

/// Root identifier of a file DAG.
///
/// Always a CID with the DAG-ProtoBuf codec and a SHA-256 multihash; any
/// other CID is rejected by [`FileId::parse`] and [`FileId::from_cid`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(Cid);

impl FileId {
    /// Parse and validate a textual CID.
    pub fn parse(s: &str) -> Result<Self, TypesError> {
        let cid = Cid::from_str(s).map_err(|e| TypesError::Bad(format!("invalid cid {s:?}: {e}")))?;
        Self::from_cid(cid)
    }

    /// Validate an already decoded CID.
    pub fn from_cid(cid: Cid) -> Result<Self, TypesError> {
        if cid.codec() != DAG_PB {
            return Err(TypesError::Bad(format!(
                "cid {cid} has codec {:#x}, expected dag-pb",
                cid.codec()
            )));
        }
        if cid.hash().code() != SHA2_256 {
            return Err(TypesError::Bad(format!(
                "cid {cid} has multihash {:#x}, expected sha2-256",
                cid.hash().code()
            )));
        }
        Ok(Self(cid))
    }

    /// The underlying CID.
    pub fn cid(&self) -> Cid {
        self.0
    }
}

impl FromStr for FileId {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileId({})", self.0)
    }
}

impl Serialize for FileId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for FileId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// A file root together with the space that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FullFileId {
    /// Owning space.
    pub space_id: String,
    /// Root of the file DAG.
    pub file_id: FileId,
}

impl FullFileId {
    /// Pair a file root with its space.
    pub fn new(space_id: impl Into<String>, file_id: FileId) -> Self {
        Self {
            space_id: space_id.into(),
            file_id,
        }
    }
}

/// Serde adapter storing a set of CIDs as their string forms.
pub mod cid_set {
    use std::collections::BTreeSet;
    use std::str::FromStr;

    use cid::Cid;
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize the set as a sequence of strings.
    pub fn serialize<S: Serializer>(set: &BTreeSet<Cid>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(set.iter().map(|c| c.to_string()))
    }

    /// Deserialize a sequence of strings back into CIDs.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BTreeSet<Cid>, D::Error> {
        let raw = Vec::<String>::deserialize(deserializer)?;
        raw.iter()
            .map(|s| Cid::from_str(s).map_err(serde::de::Error::custom))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Blocks
// ---------------------------------------------------------------------------

/// A content-addressed block: its CID and raw encoded bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Identifier of the block.
    pub cid: Cid,
    /// Raw encoded bytes.
    pub data: Bytes,
}

impl Block {
    /// Build a block, deriving its CID from the data.
    pub fn new(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            cid: block_cid(&data),
            data,
        }
    }

    /// Size of the raw bytes.
    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    /// Whether the block carries no bytes.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Remote usage
// ---------------------------------------------------------------------------

/// Usage of a single space as reported by the remote node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceStat {
    /// Space identifier.
    pub space_id: String,
    /// Number of files bound to the space.
    pub file_count: u64,
    /// Number of CIDs bound to the space.
    pub cids_count: u64,
    /// Bytes used by the whole account.
    pub total_bytes_usage: u64,
    /// Bytes used by this space.
    pub space_bytes_usage: u64,
    /// Account-wide byte limit.
    pub account_bytes_limit: u64,
}

/// Account-wide usage snapshot, cached locally between polls.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeUsage {
    /// Account-wide byte limit.
    pub account_bytes_limit: u64,
    /// Bytes used across every space.
    pub total_bytes_usage: u64,
    /// Number of CIDs stored for the account.
    pub total_cids_count: u64,
    /// `max(0, limit - usage)`.
    pub bytes_left: u64,
    /// Per-space breakdown, sorted by space id.
    pub spaces: Vec<SpaceStat>,
}

impl NodeUsage {
    /// Usage of one space.
    ///
    /// Spaces the node has not reported yet get a synthesized stat carrying
    /// the account-wide totals.
    pub fn space_usage(&self, space_id: &str) -> SpaceStat {
        self.spaces
            .iter()
            .find(|s| s.space_id == space_id)
            .cloned()
            .unwrap_or_else(|| SpaceStat {
                space_id: space_id.to_string(),
                total_bytes_usage: self.total_bytes_usage,
                account_bytes_limit: self.account_bytes_limit,
                ..Default::default()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_cid_is_valid_file_id() {
        let block = Block::new(&b"hello"[..]);
        let id = FileId::from_cid(block.cid).unwrap();
        assert_eq!(id.cid(), block.cid);
        assert_eq!(block.len(), 5);
    }

    #[test]
    fn test_parse_roundtrips_display() {
        let id = FileId::from_cid(block_cid(b"root")).unwrap();
        let parsed = FileId::parse(&id.to_string()).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(FileId::parse("not-a-cid"), Err(TypesError::Bad(_))));
        assert!(matches!(FileId::parse(""), Err(TypesError::Bad(_))));
    }

    #[test]
    fn test_rejects_raw_codec() {
        let digest = Sha256::digest(b"raw leaf");
        let hash = Multihash::<64>::wrap(SHA2_256, &digest).unwrap();
        let raw = Cid::new_v1(0x55, hash);
        assert!(matches!(FileId::from_cid(raw), Err(TypesError::Bad(_))));
        assert!(FileId::parse(&raw.to_string()).is_err());
    }

    #[test]
    fn test_rejects_non_sha256_multihash() {
        let hash = Multihash::<64>::wrap(0x1e, &[7u8; 32]).unwrap();
        let cid = Cid::new_v1(DAG_PB, hash);
        assert!(matches!(FileId::from_cid(cid), Err(TypesError::Bad(_))));
    }

    #[test]
    fn test_file_id_serde_uses_string_form() {
        let id = FileId::from_cid(block_cid(b"serde")).unwrap();
        let bytes = postcard::to_allocvec(&id).unwrap();
        let back: FileId = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_space_usage_known_and_unknown() {
        let usage = NodeUsage {
            account_bytes_limit: 1000,
            total_bytes_usage: 300,
            total_cids_count: 3,
            bytes_left: 700,
            spaces: vec![SpaceStat {
                space_id: "a".into(),
                file_count: 1,
                cids_count: 3,
                total_bytes_usage: 300,
                space_bytes_usage: 300,
                account_bytes_limit: 1000,
            }],
        };
        assert_eq!(usage.space_usage("a").space_bytes_usage, 300);

        let unknown = usage.space_usage("b");
        assert_eq!(unknown.space_id, "b");
        assert_eq!(unknown.space_bytes_usage, 0);
        assert_eq!(unknown.total_bytes_usage, 300);
        assert_eq!(unknown.account_bytes_limit, 1000);
    }
}
