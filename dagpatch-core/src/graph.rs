use cid::Cid;
use indexmap::IndexMap;
use log::{debug, trace};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crate::block::{Block, DAG_CBOR};
use crate::codec::{Codec, Limits, Resolved};
use crate::error::{Error, Result};
use crate::shard::ShardRouter;
use crate::store::{BlockStore, BulkWriter};
use crate::value::{MapNode, Value};

/// Pending updates, keyed by physical path segment. Each entry is either a
/// deeper subtree or a terminal leaf CID; the two are mutually exclusive at
/// a key and the last write decides which occupies it.
#[derive(Debug, Default)]
struct PatchTree {
    entries: IndexMap<String, PatchEntry>,
}

#[derive(Debug)]
enum PatchEntry {
    Leaf(Cid),
    Tree(PatchTree),
}

impl PatchTree {
    fn nest(&mut self, path: &[String], cid: Cid) {
        match path {
            [] => {}
            [last] => {
                self.entries.insert(last.clone(), PatchEntry::Leaf(cid));
            }
            [head, rest @ ..] => {
                let entry = self
                    .entries
                    .entry(head.clone())
                    .or_insert_with(|| PatchEntry::Tree(PatchTree::default()));
                if matches!(entry, PatchEntry::Leaf(_)) {
                    *entry = PatchEntry::Tree(PatchTree::default());
                }
                if let PatchEntry::Tree(sub) = entry {
                    sub.nest(rest, cid);
                }
            }
        }
    }
}

/// Diagnostics from the last flush.
#[derive(Debug, Clone, Copy)]
pub struct FlushStats {
    /// Patch-tree nodes visited while rebuilding the ancestor chains.
    pub visited_nodes: u64,
    pub build_time: Duration,
    pub commit_time: Duration,
}

/// Accumulates path-keyed updates against a DAG snapshot and merges them in
/// one flush, rewriting only the ancestor chain of each touched path.
///
/// A builder is single-use per snapshot transition: after `flush` returns
/// (or fails), the builder is spent and further `add`/`flush` calls fail
/// with `AlreadyFlushed`. Continue by constructing a new builder against
/// the returned root.
pub struct GraphBuilder<S: BlockStore> {
    store: Arc<S>,
    codec: Codec<S>,
    shards: ShardRouter,
    root: Option<Cid>,
    /// logical path -> (physical path, leaf block); last write per logical
    /// path wins.
    pending: IndexMap<String, (Vec<String>, Block)>,
    /// Per-builder decode cache; write-once per key since a CID's decoded
    /// form cannot change.
    cache: RwLock<HashMap<Cid, Value>>,
    clobber: bool,
    spent: bool,
    stats: Option<FlushStats>,
}

impl<S: BlockStore> GraphBuilder<S> {
    pub fn new(store: Arc<S>) -> Self {
        let codec = Codec::new(store.clone());
        GraphBuilder {
            store,
            codec,
            shards: ShardRouter::new(),
            root: None,
            pending: IndexMap::new(),
            cache: RwLock::new(HashMap::new()),
            clobber: true,
            spent: false,
            stats: None,
        }
    }

    pub fn with_root(store: Arc<S>, root: Cid) -> Self {
        let mut builder = Self::new(store);
        builder.root = Some(root);
        builder
    }

    pub fn with_limits(store: Arc<S>, root: Cid, limits: Limits) -> Self {
        let codec = Codec::with_limits(store.clone(), limits);
        GraphBuilder {
            store,
            codec,
            shards: ShardRouter::new(),
            root: Some(root),
            pending: IndexMap::new(),
            cache: RwLock::new(HashMap::new()),
            clobber: true,
            spent: false,
            stats: None,
        }
    }

    pub fn root(&self) -> Option<&Cid> {
        self.root.as_ref()
    }

    pub fn set_root(&mut self, root: Cid) {
        self.root = Some(root);
    }

    /// When off, superseded nodes are left in the store instead of being
    /// deleted through the bulk transaction.
    pub fn set_clobber(&mut self, clobber: bool) {
        self.clobber = clobber;
    }

    pub fn is_spent(&self) -> bool {
        self.spent
    }

    pub fn stats(&self) -> Option<FlushStats> {
        self.stats
    }

    pub fn codec(&self) -> &Codec<S> {
        &self.codec
    }

    /// Registers a shard handler; the pattern must end in `*`.
    pub fn shard_path<F>(&mut self, pattern: &str, handler: F) -> Result<()>
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.shards.register(pattern, handler)
    }

    /// Queues `block` under `logical` path. The block's bytes are committed
    /// through the bulk transaction at flush time.
    ///
    /// Also primes the decode cache along the physical path so flush can
    /// assume warm reads; priming failures are absorbed - a missing
    /// intermediate node just means that path starts from an empty node at
    /// flush time.
    pub async fn add(&mut self, logical: &str, block: Block) -> Result<()> {
        if self.spent {
            return Err(Error::AlreadyFlushed);
        }
        let physical = self.shards.rewrite(logical);
        if physical.is_empty() {
            return Err(Error::NotFound(logical.to_string()));
        }
        self.pending
            .insert(logical.to_string(), (physical.clone(), block));
        self.prime(&physical).await;
        Ok(())
    }

    /// Merges all queued patches into the DAG and returns the new root CID.
    ///
    /// Walks the patch tree depth-first against the existing nodes, rewrites
    /// only the ancestor chain of each touched path and commits every write
    /// (leaf blocks plus re-serialized ancestors) through one bulk
    /// transaction. The builder is spent afterwards, even on failure.
    pub async fn flush(&mut self) -> Result<Cid> {
        if self.spent {
            return Err(Error::AlreadyFlushed);
        }
        let root = self.root.ok_or(Error::NoRoot)?;
        self.spent = true;

        let start = Instant::now();
        let mut bulk = self.store.bulk();
        let mut patches = PatchTree::default();
        for (_, (physical, block)) in std::mem::take(&mut self.pending) {
            bulk.put(block.cid(), block.data());
            patches.nest(&physical, *block.cid());
        }

        let root_node = self.node(&root).await?;
        let mut visited = 0u64;
        let new_root = self.apply(&patches, root_node, &mut bulk, &mut visited).await?;
        if self.clobber && new_root != root {
            bulk.del(&root);
        }
        let build_time = start.elapsed();

        let start = Instant::now();
        bulk.commit().await.map_err(Error::store)?;
        let commit_time = start.elapsed();

        debug!(
            "flush: visited {visited} patch nodes, build {build_time:?}, commit {commit_time:?}, root {new_root}"
        );
        self.stats = Some(FlushStats {
            visited_nodes: visited,
            build_time,
            commit_time,
        });
        self.root = Some(new_root);
        Ok(new_root)
    }

    /// Fetches and decodes the node named by `cid`, deduplicating repeated
    /// fetches through the per-builder cache. Returns a deep clone so the
    /// cached entry stays immutable.
    pub async fn get(&self, cid: &Cid) -> Result<Value> {
        if let Some(hit) = self.cache.read().unwrap().get(cid) {
            return Ok(hit.deep_clone());
        }
        let bytes = self.codec.fetch(cid).await?;
        let value = self.codec.deserialize(&bytes).await?;
        let mut cache = self.cache.write().unwrap();
        Ok(cache.entry(*cid).or_insert(value).deep_clone())
    }

    /// Resolves a logical path from the builder's current root.
    pub async fn resolve(&self, logical: &str) -> Result<Resolved> {
        let root = self.root.ok_or(Error::NoRoot)?;
        self.resolve_from(logical, &root).await
    }

    /// Resolves a logical path from the given root, hopping link-by-link
    /// through the store. Stops early with the CID and the unconsumed path
    /// at a non-dag-cbor link.
    pub async fn resolve_from(&self, logical: &str, root: &Cid) -> Result<Resolved> {
        let mut segments: VecDeque<String> = self.shards.rewrite(logical).into();
        let mut value = Value::Link(*root);
        loop {
            if let Value::Link(cid) = value {
                if cid.codec() != DAG_CBOR {
                    let remaining: Vec<String> = segments.into_iter().collect();
                    return Ok(Resolved {
                        value: Value::Link(cid),
                        remaining: remaining.join("/"),
                    });
                }
                value = self.get(&cid).await?;
                continue;
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

    async fn node(&self, cid: &Cid) -> Result<MapNode> {
        match self.get(cid).await? {
            Value::Map(node) => Ok(node),
            _ => Err(Error::Decode(format!("node {cid} is not a map"))),
        }
    }

    /// Applies one patch-tree level onto the existing node: subtrees recurse
    /// first and land as links to the rebuilt child, leaves become links
    /// directly; then the node itself is serialized and staged. Returns the
    /// rebuilt node's CID.
    async fn apply(
        &self,
        patches: &PatchTree,
        node: MapNode,
        bulk: &mut S::Bulk<'_>,
        visited: &mut u64,
    ) -> Result<Cid> {
        *visited += 1;
        for (key, entry) in &patches.entries {
            match entry {
                PatchEntry::Tree(sub) => {
                    let (existing, child) = match node.get(key) {
                        None => (None, MapNode::new()),
                        Some(Value::Link(cid)) => {
                            if cid.codec() != DAG_CBOR {
                                return Err(Error::InvalidLinkValue(key.clone()));
                            }
                            (Some(cid), self.node(&cid).await?)
                        }
                        Some(Value::Map(inline)) => (None, inline),
                        Some(_) => return Err(Error::InvalidLinkValue(key.clone())),
                    };
                    let child_cid =
                        Box::pin(self.apply(sub, child, bulk, visited)).await?;
                    node.insert(key.clone(), Value::Link(child_cid));
                    if self.clobber {
                        if let Some(old) = existing {
                            if old != child_cid {
                                bulk.del(&old);
                            }
                        }
                    }
                }
                PatchEntry::Leaf(cid) => {
                    node.insert(key.clone(), Value::Link(*cid));
                }
            }
        }

        let mut last = None;
        for block in self.codec.serialize(&Value::Map(node))? {
            let block = block?;
            bulk.put(block.cid(), block.data());
            last = Some(*block.cid());
        }
        last.ok_or_else(|| Error::Encode("serializer yielded no blocks".to_string()))
    }

    async fn prime(&self, physical: &[String]) {
        let Some(mut cid) = self.root else {
            return;
        };
        for segment in physical {
            if cid.codec() != DAG_CBOR {
                return;
            }
            let node = match self.get(&cid).await {
                Ok(Value::Map(node)) => node,
                Ok(_) => return,
                Err(e) => {
                    trace!("priming stopped at \"{segment}\": {e}");
                    return;
                }
            };
            match node.get(segment) {
                Some(Value::Link(next)) => cid = next,
                _ => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::compute_cid;

    fn cid(n: u8) -> Cid {
        compute_cid(DAG_CBOR, &[n])
    }

    #[test]
    fn nest_builds_subtrees() {
        let mut tree = PatchTree::default();
        tree.nest(&["a".into(), "b".into(), "c".into()], cid(1));
        let PatchEntry::Tree(a) = &tree.entries["a"] else {
            panic!("expected subtree at a");
        };
        let PatchEntry::Tree(b) = &a.entries["b"] else {
            panic!("expected subtree at b");
        };
        assert!(matches!(b.entries["c"], PatchEntry::Leaf(c) if c == cid(1)));
    }

    #[test]
    fn nest_last_write_wins_per_path() {
        let mut tree = PatchTree::default();
        tree.nest(&["a".into(), "b".into()], cid(1));
        tree.nest(&["a".into(), "b".into()], cid(2));
        let PatchEntry::Tree(a) = &tree.entries["a"] else {
            panic!("expected subtree at a");
        };
        assert!(matches!(a.entries["b"], PatchEntry::Leaf(c) if c == cid(2)));
    }

    #[test]
    fn nest_subtree_replaces_leaf() {
        let mut tree = PatchTree::default();
        tree.nest(&["a".into()], cid(1));
        tree.nest(&["a".into(), "b".into()], cid(2));
        let PatchEntry::Tree(a) = &tree.entries["a"] else {
            panic!("leaf should have been replaced by a subtree");
        };
        assert!(matches!(a.entries["b"], PatchEntry::Leaf(c) if c == cid(2)));
    }

    #[test]
    fn nest_leaf_replaces_subtree() {
        let mut tree = PatchTree::default();
        tree.nest(&["a".into(), "b".into()], cid(1));
        tree.nest(&["a".into()], cid(2));
        assert!(matches!(tree.entries["a"], PatchEntry::Leaf(c) if c == cid(2)));
    }
}
