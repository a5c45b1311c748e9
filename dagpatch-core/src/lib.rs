//! Dagpatch builds and incrementally updates a content-addressed Merkle DAG
//! of CBOR-encoded nodes with typed links.
//!
//! Core concepts:
//! - **Value**: a decoded DAG node - scalars, lists, shared map nodes and
//!   first-class links to other blocks
//! - **Block**: an immutable byte buffer plus its CID
//! - **Codec**: DAG-CBOR encode/decode, link tagging and transparent
//!   splitting of objects too large for one block
//! - **ShardRouter**: rewrites logical paths into physical storage paths
//!   through registered wildcard handlers
//! - **GraphBuilder**: accumulates path-keyed patches and, on flush,
//!   rewrites only the ancestor chain of each touched path, producing a new
//!   root CID through one bulk store transaction
//!
//! # Example
//!
//! ```
//! use dagpatch_core::{Codec, MapNode, MemoryStore, Value};
//! use std::sync::Arc;
//!
//! let store = Arc::new(MemoryStore::new());
//! let codec = Codec::new(store);
//!
//! let node = MapNode::new();
//! node.insert("answer", 42i64);
//! let blocks: Vec<_> = codec.serialize(&Value::Map(node)).unwrap().collect();
//! assert_eq!(blocks.len(), 1);
//! ```
//!
//! # Serialization
//!
//! Nodes are DAG-CBOR (via `serde_ipld_dagcbor`) with canonical map key
//! ordering and CBOR tag 42 for links, so content addressing is consistent
//! across implementations. Objects above the per-block ceiling are split
//! into chunk blocks referenced from a split-root node; the split root is
//! the deserialization entry point for the whole object.

mod block;
mod codec;
mod error;
mod graph;
mod shard;
mod store;
mod value;

pub use block::{Block, DAG_CBOR, RAW, compute_cid};
pub use cid::Cid;
pub use codec::{Blocks, Codec, Limits, Resolved};
pub use error::{Error, Result};
pub use graph::{FlushStats, GraphBuilder};
pub use shard::{ShardHandler, ShardRouter};
pub use store::{BlockStore, BulkWriter, MemoryBulk, MemoryStore};
pub use value::{MapNode, Value};
