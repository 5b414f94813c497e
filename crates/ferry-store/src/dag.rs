//! DAG-ProtoBuf file layout.
//!
//! A file is split into fixed-size chunks. Each chunk becomes a leaf node
//! carrying the bytes in its `Data` field; leaves are linked from parent
//! nodes of at most [`DagBuilder::max_links`] children until a single root
//! remains. Every block is CIDv1 / dag-pb / sha2-256.
//!
//! Only the subset of the PBNode schema needed here is encoded: `Links`
//! (field 2) with `Hash` (1) and `Tsize` (3), then `Data` (field 1).

use bytes::{Bytes, BytesMut};
use cid::Cid;
use ferry_types::{Block, FileId};

use crate::error::StoreError;
use crate::traits::BlockStore;

/// Default chunk size: 256 KiB.
pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

/// Default fan-out of intermediate nodes.
const DEFAULT_MAX_LINKS: usize = 174;

/// Link from one node to a child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PbLink {
    /// Child block.
    pub cid: Cid,
    /// Cumulative encoded size of the child's subtree.
    pub tsize: u64,
}

/// Decoded DAG-ProtoBuf node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PbNode {
    /// Children in order.
    pub links: Vec<PbLink>,
    /// Inline payload (file bytes for leaves).
    pub data: Option<Bytes>,
}

impl PbNode {
    /// Encode into protobuf bytes.
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::new();
        for link in &self.links {
            let hash = link.cid.to_bytes();
            let mut inner = Vec::with_capacity(hash.len() + 12);
            put_tag(&mut inner, 1, WIRE_LEN);
            put_varint(&mut inner, hash.len() as u64);
            inner.extend_from_slice(&hash);
            put_tag(&mut inner, 3, WIRE_VARINT);
            put_varint(&mut inner, link.tsize);

            let mut head = Vec::with_capacity(6);
            put_tag(&mut head, 2, WIRE_LEN);
            put_varint(&mut head, inner.len() as u64);
            out.extend_from_slice(&head);
            out.extend_from_slice(&inner);
        }
        if let Some(data) = &self.data {
            let mut head = Vec::with_capacity(6);
            put_tag(&mut head, 1, WIRE_LEN);
            put_varint(&mut head, data.len() as u64);
            out.extend_from_slice(&head);
            out.extend_from_slice(data);
        }
        out.freeze()
    }

    /// Decode a block.
    pub fn decode(block: &Block) -> Result<Self, StoreError> {
        let malformed = |reason: &str| StoreError::Malformed {
            cid: block.cid,
            reason: reason.to_string(),
        };

        let mut node = PbNode::default();
        let mut reader = Reader::new(&block.data);
        while !reader.is_empty() {
            let (field, wire) = reader.tag().ok_or_else(|| malformed("truncated tag"))?;
            match (field, wire) {
                (1, WIRE_LEN) => {
                    let len = reader.len_prefixed().ok_or_else(|| malformed("truncated data"))?;
                    node.data = Some(block.data.slice(reader.pos - len..reader.pos));
                }
                (2, WIRE_LEN) => {
                    let len = reader.len_prefixed().ok_or_else(|| malformed("truncated link"))?;
                    let raw = &block.data[reader.pos - len..reader.pos];
                    node.links.push(decode_link(raw).ok_or_else(|| malformed("bad link"))?);
                }
                _ => return Err(malformed("unexpected field")),
            }
        }
        Ok(node)
    }

    fn into_block(self) -> Block {
        Block::new(self.encode())
    }
}

fn decode_link(raw: &[u8]) -> Option<PbLink> {
    let mut reader = Reader::new(raw);
    let mut cid = None;
    let mut tsize = 0;
    while !reader.is_empty() {
        match reader.tag()? {
            (1, WIRE_LEN) => {
                let len = reader.len_prefixed()?;
                cid = Cid::try_from(&raw[reader.pos - len..reader.pos]).ok();
            }
            (2, WIRE_LEN) => {
                reader.len_prefixed()?;
            }
            (3, WIRE_VARINT) => tsize = reader.varint()?,
            _ => return None,
        }
    }
    Some(PbLink { cid: cid?, tsize })
}

const WIRE_VARINT: u64 = 0;
const WIRE_LEN: u64 = 2;

fn put_tag(out: &mut Vec<u8>, field: u64, wire: u64) {
    put_varint(out, (field << 3) | wire);
}

fn put_varint(out: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        out.push((v as u8) | 0x80);
        v >>= 7;
    }
    out.push(v as u8);
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn varint(&mut self) -> Option<u64> {
        let mut v = 0u64;
        for shift in (0..64).step_by(7) {
            let byte = *self.buf.get(self.pos)?;
            self.pos += 1;
            v |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Some(v);
            }
        }
        None
    }

    fn tag(&mut self) -> Option<(u64, u64)> {
        let v = self.varint()?;
        Some((v >> 3, v & 0x7))
    }

    /// Skip over a length-prefixed field, returning its length. The bytes
    /// end at the new position.
    fn len_prefixed(&mut self) -> Option<usize> {
        let len = usize::try_from(self.varint()?).ok()?;
        let end = self.pos.checked_add(len)?;
        if end > self.buf.len() {
            return None;
        }
        self.pos = end;
        Some(len)
    }
}

/// Blocks of one file DAG, root last.
#[derive(Debug, Clone)]
pub struct FileDag {
    /// Root block CID.
    pub root: FileId,
    /// Every block, leaves first, root last.
    pub blocks: Vec<Block>,
}

impl FileDag {
    /// Sum of the raw lengths of every block.
    pub fn total_size(&self) -> u64 {
        self.blocks.iter().map(Block::len).sum()
    }

    /// Store every block.
    pub async fn store(&self, store: &dyn BlockStore) -> Result<(), StoreError> {
        for block in &self.blocks {
            store.put(block.clone()).await?;
        }
        Ok(())
    }
}

/// Builds file DAGs.
#[derive(Debug, Clone)]
pub struct DagBuilder {
    chunk_size: usize,
    max_links: usize,
}

impl Default for DagBuilder {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_links: DEFAULT_MAX_LINKS,
        }
    }
}

impl DagBuilder {
    /// Builder with the given chunk size and the default fan-out.
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            ..Default::default()
        }
    }

    /// Override the maximum number of links per intermediate node.
    pub fn max_links(mut self, max_links: usize) -> Self {
        self.max_links = max_links.max(2);
        self
    }

    /// Split `data` into a DAG. Empty input yields a single empty leaf.
    pub fn build(&self, data: &[u8]) -> FileDag {
        let mut blocks = Vec::new();
        let mut layer: Vec<(Cid, u64)> = Vec::new();

        let chunks: Vec<&[u8]> = if data.is_empty() {
            vec![&[][..]]
        } else {
            data.chunks(self.chunk_size).collect()
        };
        for chunk in chunks {
            let block = PbNode {
                links: Vec::new(),
                data: Some(Bytes::copy_from_slice(chunk)),
            }
            .into_block();
            layer.push((block.cid, block.len()));
            blocks.push(block);
        }

        while layer.len() > 1 {
            let mut parents = Vec::with_capacity(layer.len() / self.max_links + 1);
            for group in layer.chunks(self.max_links) {
                let links: Vec<PbLink> = group
                    .iter()
                    .map(|&(cid, tsize)| PbLink { cid, tsize })
                    .collect();
                let subtree: u64 = links.iter().map(|l| l.tsize).sum();
                let block = PbNode { links, data: None }.into_block();
                parents.push((block.cid, subtree + block.len()));
                blocks.push(block);
            }
            layer = parents;
        }

        let root = blocks
            .last()
            .map(|b| b.cid)
            .and_then(|cid| FileId::from_cid(cid).ok())
            .expect("builder always emits a dag-pb root");
        FileDag { root, blocks }
    }

    /// Build a DAG for `data` and store every block.
    pub async fn import(&self, store: &dyn BlockStore, data: &[u8]) -> Result<FileDag, StoreError> {
        let dag = self.build(data);
        dag.store(store).await?;
        Ok(dag)
    }
}

/// Reassemble a file's bytes from its DAG.
pub async fn read_file(store: &dyn BlockStore, root: FileId) -> Result<Bytes, StoreError> {
    let mut out = BytesMut::new();
    let mut stack = vec![root.cid()];
    while let Some(cid) = stack.pop() {
        let block = store.get(&cid).await?.ok_or(StoreError::NotFound(cid))?;
        let node = PbNode::decode(&block)?;
        if let Some(data) = node.data {
            out.extend_from_slice(&data);
        }
        stack.extend(node.links.iter().rev().map(|l| l.cid));
    }
    Ok(out.freeze())
}
