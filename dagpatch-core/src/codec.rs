use cid::Cid;
use ipld_core::ipld::Ipld;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use crate::block::{Block, DAG_CBOR, compute_cid};
use crate::error::{Error, Result};
use crate::store::BlockStore;
use crate::value::{Value, from_ipld, is_circular, to_ipld};

/// Sentinel key marking a node as the root of a multi-block object.
const SPLIT_KEY: &str = "._";
const SPLIT_VALUE: &str = "dag-split";
const CHUNKS_KEY: &str = "chunks";

/// Size and chunking knobs for the codec.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    /// Hard ceiling for one encoded object; exceeding it fails serialization.
    pub max_object_size: usize,
    /// Soft per-block ceiling; larger objects are split across chunk blocks.
    pub max_block_size: usize,
    /// Top-level keys per chunk block when splitting.
    pub chunk_keys: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_object_size: 10_000_000,
            max_block_size: 1_000_000,
            chunk_keys: 500,
        }
    }
}

/// DAG-CBOR codec over a block store.
///
/// Encodes [`Value`] trees into content-addressed blocks and back. Links are
/// CBOR tag 42 on the wire; objects above the per-block ceiling become a
/// series of chunk blocks referenced from a split-root node. The store is
/// only consulted when following links or reassembling split objects.
pub struct Codec<S> {
    store: Arc<S>,
    limits: Limits,
}

/// Outcome of a path resolution: the value reached and whatever path was
/// left unconsumed (non-empty only when traversal stopped at a foreign,
/// non-dag-cbor link).
#[derive(Debug, PartialEq)]
pub struct Resolved {
    pub value: Value,
    pub remaining: String,
}

impl<S: BlockStore> Codec<S> {
    pub fn new(store: Arc<S>) -> Self {
        Codec {
            store,
            limits: Limits::default(),
        }
    }

    pub fn with_limits(store: Arc<S>, limits: Limits) -> Self {
        Codec { store, limits }
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    /// Serializes a value into a lazy sequence of blocks.
    ///
    /// Under the soft ceiling the sequence is exactly one block. Above it the
    /// top-level map is partitioned into fixed-size key groups, one block per
    /// group, with a split-root block last - deserializing the final block is
    /// the entry point into the whole object. Fails up front with
    /// `CircularReference` or `ObjectTooLarge`; in both cases no block is
    /// produced. The input is never mutated.
    pub fn serialize(&self, value: &Value) -> Result<Blocks> {
        if is_circular(value) {
            return Err(Error::CircularReference);
        }
        let ipld = to_ipld(value);
        let data = encode(&ipld)?;
        if data.len() > self.limits.max_object_size {
            return Err(Error::ObjectTooLarge {
                size: data.len(),
                limit: self.limits.max_object_size,
            });
        }
        if data.len() <= self.limits.max_block_size {
            return Ok(Blocks::single(Block::new(DAG_CBOR, data)));
        }
        match ipld {
            Ipld::Map(map) => Ok(Blocks::split(
                map.into_iter().collect(),
                self.limits.chunk_keys,
            )),
            _ => Err(Error::Encode(
                "only top-level maps can be split across blocks".to_string(),
            )),
        }
    }

    /// Decodes a buffer back into a value.
    ///
    /// A split root triggers a fetch and decode of every chunk block; the
    /// chunk maps are merged by key union, later chunks winning on a
    /// duplicate key.
    pub async fn deserialize(&self, data: &[u8]) -> Result<Value> {
        let ipld = decode(data)?;
        if let Ipld::Map(map) = &ipld {
            if is_split(map) {
                let mut merged: BTreeMap<String, Ipld> = BTreeMap::new();
                for cid in chunk_cids(map)? {
                    let bytes = self.fetch(&cid).await?;
                    match decode(&bytes)? {
                        Ipld::Map(chunk) => merged.extend(chunk),
                        _ => {
                            return Err(Error::Decode(format!("chunk {cid} is not a map")));
                        }
                    }
                }
                return Ok(from_ipld(Ipld::Map(merged)));
            }
        }
        Ok(from_ipld(ipld))
    }

    /// Resolves a `/`-separated path through the decoded buffer, following
    /// dag-cbor links across blocks. Stops early at a link with any other
    /// codec, handing the CID and the unconsumed path back to the caller.
    pub async fn resolve(&self, data: &[u8], path: &str) -> Result<Resolved> {
        let mut segments: VecDeque<String> = path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        let mut value = self.deserialize(data).await?;
        loop {
            if let Value::Link(cid) = value {
                if cid.codec() != DAG_CBOR {
                    let remaining: Vec<String> = segments.into_iter().collect();
                    return Ok(Resolved {
                        value: Value::Link(cid),
                        remaining: remaining.join("/"),
                    });
                }
                let bytes = self.fetch(&cid).await?;
                value = self.deserialize(&bytes).await?;
            }
            let Some(segment) = segments.pop_front() else {
                break;
            };
            let Value::Map(node) = &value else {
                return Err(Error::NotFound(segment));
            };
            value = node.get(&segment).ok_or(Error::NotFound(segment))?;
        }
        Ok(Resolved {
            value,
            remaining: String::new(),
        })
    }

    /// Enumerates the CIDs covered by this buffer: its own CID first, then -
    /// for a split root - each chunk CID in list order. The buffer is decoded
    /// up front and the iterator runs over the already-built list. Shallow;
    /// links inside the object are not followed.
    pub fn cids(&self, data: &[u8]) -> Result<std::vec::IntoIter<Cid>> {
        let mut out = vec![compute_cid(DAG_CBOR, data)];
        if let Ipld::Map(map) = decode(data)? {
            if is_split(&map) {
                out.extend(chunk_cids(&map)?);
            }
        }
        Ok(out.into_iter())
    }

    /// Top-level keys of the decoded object, following splits. Non-map roots
    /// have no keys.
    pub async fn tree(&self, data: &[u8]) -> Result<Vec<String>> {
        match self.deserialize(data).await? {
            Value::Map(node) => Ok(node.keys()),
            _ => Ok(Vec::new()),
        }
    }

    pub(crate) async fn fetch(&self, cid: &Cid) -> Result<Vec<u8>> {
        self.store
            .get(cid)
            .await
            .map_err(Error::store)?
            .ok_or(Error::BlockNotFound(*cid))
    }
}

fn encode(ipld: &Ipld) -> Result<Vec<u8>> {
    serde_ipld_dagcbor::to_vec(ipld).map_err(|e| Error::Encode(e.to_string()))
}

fn decode(data: &[u8]) -> Result<Ipld> {
    serde_ipld_dagcbor::from_slice(data).map_err(|e| Error::Decode(e.to_string()))
}

fn is_split(map: &BTreeMap<String, Ipld>) -> bool {
    matches!(map.get(SPLIT_KEY), Some(Ipld::String(s)) if s == SPLIT_VALUE)
}

fn chunk_cids(map: &BTreeMap<String, Ipld>) -> Result<Vec<Cid>> {
    let Some(Ipld::List(items)) = map.get(CHUNKS_KEY) else {
        return Err(Error::Decode("split node has no chunks list".to_string()));
    };
    items
        .iter()
        .map(|item| match item {
            Ipld::Link(cid) => Ok(*cid),
            _ => Err(Error::Decode("split chunk entry is not a link".to_string())),
        })
        .collect()
}

/// Lazy block sequence produced by [`Codec::serialize`].
///
/// For split objects each chunk is encoded on demand; consumers may stop
/// early, but only the last block is a valid deserialization entry point.
#[derive(Debug)]
pub struct Blocks {
    state: BlocksState,
}

#[derive(Debug)]
enum BlocksState {
    Single(Option<Block>),
    Split {
        entries: Vec<(String, Ipld)>,
        pos: usize,
        chunk_keys: usize,
        tail_emitted: bool,
        links: Vec<Ipld>,
        finished: bool,
    },
}

impl Blocks {
    fn single(block: Block) -> Self {
        Blocks {
            state: BlocksState::Single(Some(block)),
        }
    }

    fn split(entries: Vec<(String, Ipld)>, chunk_keys: usize) -> Self {
        Blocks {
            state: BlocksState::Split {
                entries,
                pos: 0,
                chunk_keys,
                tail_emitted: false,
                links: Vec::new(),
                finished: false,
            },
        }
    }
}

impl Iterator for Blocks {
    type Item = Result<Block>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.state {
            BlocksState::Single(slot) => slot.take().map(Ok),
            BlocksState::Split {
                entries,
                pos,
                chunk_keys,
                tail_emitted,
                links,
                finished,
            } => {
                if *finished {
                    return None;
                }
                let group: BTreeMap<String, Ipld> = if *pos < entries.len() {
                    let end = (*pos + *chunk_keys).min(entries.len());
                    let group = entries[*pos..end].iter().cloned().collect();
                    *pos += *chunk_keys;
                    group
                } else if !*tail_emitted {
                    // The chunker always closes with an empty remainder group.
                    *tail_emitted = true;
                    BTreeMap::new()
                } else {
                    *finished = true;
                    let mut split = BTreeMap::new();
                    split.insert(
                        SPLIT_KEY.to_string(),
                        Ipld::String(SPLIT_VALUE.to_string()),
                    );
                    split.insert(CHUNKS_KEY.to_string(), Ipld::List(std::mem::take(links)));
                    return Some(
                        encode(&Ipld::Map(split)).map(|data| Block::new(DAG_CBOR, data)),
                    );
                };
                match encode(&Ipld::Map(group)) {
                    Ok(data) => {
                        let block = Block::new(DAG_CBOR, data);
                        links.push(Ipld::Link(*block.cid()));
                        Some(Ok(block))
                    }
                    Err(e) => {
                        *finished = true;
                        Some(Err(e))
                    }
                }
            }
        }
    }
}
