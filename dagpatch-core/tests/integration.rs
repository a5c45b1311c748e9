//! End-to-end tests over the codec and the graph builder.

use cid::Cid;
use dagpatch_core::{
    Block, BlockStore, BulkWriter, Codec, Error, GraphBuilder, MapNode, MemoryBulk, MemoryStore,
    RAW, Value, compute_cid,
};
use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

async fn write<S: BlockStore>(store: &S, codec: &Codec<S>, value: &Value) -> Cid {
    let mut last = None;
    for block in codec.serialize(value).unwrap() {
        let block = block.unwrap();
        store.put(block.cid(), block.data()).await.unwrap();
        last = Some(*block.cid());
    }
    last.unwrap()
}

async fn empty_root(store: &Arc<MemoryStore>) -> Cid {
    let codec = Codec::new(store.clone());
    write(store.as_ref(), &codec, &Value::Map(MapNode::new())).await
}

fn leaf_block(store: &Arc<MemoryStore>) -> Block {
    let codec = Codec::new(store.clone());
    let node = MapNode::new();
    node.insert("test", 1234i64);
    codec
        .serialize(&Value::Map(node))
        .unwrap()
        .next()
        .unwrap()
        .unwrap()
}

fn big_object(keys: usize) -> Value {
    let root = MapNode::new();
    for i in 0..keys {
        let inner = MapNode::new();
        inner.insert(
            "a reasonably long field name to inflate the encoded size",
            "and a matching filler value that pads each entry well past cbor overhead",
        );
        root.insert(format!("-{i}"), inner);
    }
    Value::Map(root)
}

#[tokio::test]
async fn large_object_chunking() {
    let store = Arc::new(MemoryStore::new());
    let codec = Codec::new(store.clone());
    let object = big_object(10_000);

    let blocks: Vec<Block> = codec
        .serialize(&object)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    // 20 full chunks of 500 keys, the empty remainder chunk, the split root.
    assert_eq!(blocks.len(), 22);

    for block in &blocks {
        store.put(block.cid(), block.data()).await.unwrap();
    }
    let root = blocks.last().unwrap();
    assert_eq!(codec.cids(root.data()).unwrap().count(), 22);
    assert_eq!(codec.tree(root.data()).await.unwrap().len(), 10_000);

    let back = codec.deserialize(root.data()).await.unwrap();
    assert_eq!(back, object);
}

/// Counts store round-trips to observe the builder's decode cache.
struct CountingStore {
    inner: MemoryStore,
    gets: AtomicUsize,
}

impl CountingStore {
    fn new() -> Self {
        CountingStore {
            inner: MemoryStore::new(),
            gets: AtomicUsize::new(0),
        }
    }
}

impl BlockStore for CountingStore {
    type Error = Infallible;
    type Bulk<'a>
        = MemoryBulk<'a>
    where
        Self: 'a;

    async fn get(&self, cid: &Cid) -> Result<Option<Vec<u8>>, Infallible> {
        self.gets.fetch_add(1, Ordering::Relaxed);
        self.inner.get(cid).await
    }

    async fn put(&self, cid: &Cid, data: &[u8]) -> Result<(), Infallible> {
        self.inner.put(cid, data).await
    }

    async fn has(&self, cid: &Cid) -> Result<bool, Infallible> {
        self.inner.has(cid).await
    }

    fn bulk(&self) -> MemoryBulk<'_> {
        self.inner.bulk()
    }

    async fn cids(&self) -> Result<Vec<Cid>, Infallible> {
        self.inner.cids().await
    }
}

#[tokio::test]
async fn get_is_cached_per_builder() {
    let store = Arc::new(CountingStore::new());
    let codec = Codec::new(store.clone());
    let node = MapNode::new();
    node.insert("payload", "cached");
    let cid = write(store.as_ref(), &codec, &Value::Map(node)).await;

    let builder = GraphBuilder::new(store.clone());
    let first = builder.get(&cid).await.unwrap();
    let second = builder.get(&cid).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(store.gets.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn link_round_trip() {
    let store = Arc::new(MemoryStore::new());
    let codec = Codec::new(store.clone());

    let c = MapNode::new();
    c.insert("c", 5i64);
    let b = MapNode::new();
    b.insert("b", c);
    let a = MapNode::new();
    a.insert("a", b);
    let target = write(store.as_ref(), &codec, &Value::Map(a)).await;

    let root = MapNode::new();
    root.insert("x", target);
    let root_cid = write(store.as_ref(), &codec, &Value::Map(root)).await;

    let builder = GraphBuilder::with_root(store, root_cid);
    let resolved = builder.resolve("/x/a/b/c").await.unwrap();
    assert_eq!(resolved.value, Value::Integer(5));
    assert_eq!(resolved.remaining, "");
}

#[tokio::test]
async fn basic_graph_build() {
    let store = Arc::new(MemoryStore::new());
    let root = empty_root(&store).await;
    let block = leaf_block(&store);

    let mut graph = GraphBuilder::with_root(store.clone(), root);
    graph.add("/one/two/three", block.clone()).await.unwrap();
    graph.add("/one/three/four", block).await.unwrap();
    let new_root = graph.flush().await.unwrap();
    assert_ne!(new_root, root);

    // Leaf block plus four rebuilt nodes; the superseded empty root was
    // deleted through the bulk transaction.
    assert_eq!(store.cids().await.unwrap().len(), 5);

    let two = graph.resolve("/one/two").await.unwrap();
    assert!(two.value.as_map().unwrap().get("three").is_some());

    let leaf = graph.resolve("/one/three/four").await.unwrap();
    let expected = MapNode::new();
    expected.insert("test", 1234i64);
    assert_eq!(leaf.value, Value::Map(expected));
}

#[tokio::test]
async fn clobber_off_keeps_superseded_nodes() {
    let store = Arc::new(MemoryStore::new());
    let root = empty_root(&store).await;
    let block = leaf_block(&store);

    let mut graph = GraphBuilder::with_root(store.clone(), root);
    graph.set_clobber(false);
    graph.add("/one/two/three", block.clone()).await.unwrap();
    graph.add("/one/three/four", block).await.unwrap();
    graph.flush().await.unwrap();

    // Same five new blocks, but the old empty root survives.
    assert_eq!(store.cids().await.unwrap().len(), 6);
}

#[tokio::test]
async fn patch_locality() {
    let store = Arc::new(MemoryStore::new());
    let root = empty_root(&store).await;
    let block = leaf_block(&store);

    let mut first = GraphBuilder::with_root(store.clone(), root);
    first.add("/one/two/three", block.clone()).await.unwrap();
    first.add("/one/three/four", block.clone()).await.unwrap();
    let root1 = first.flush().await.unwrap();

    let untouched_before = subtree_cid(&store, &root1, &["one", "three"]).await;

    let mut second = GraphBuilder::with_root(store.clone(), root1);
    second.add("/one/two/edge", block).await.unwrap();
    let root2 = second.flush().await.unwrap();

    let untouched_after = subtree_cid(&store, &root2, &["one", "three"]).await;
    assert_eq!(untouched_before, untouched_after);

    // The touched chain was rewritten top to bottom.
    assert_ne!(
        subtree_cid(&store, &root1, &["one"]).await,
        subtree_cid(&store, &root2, &["one"]).await
    );

    // And the old leaf under the untouched subtree still resolves.
    let reader = GraphBuilder::with_root(store, root2);
    let leaf = reader.resolve("/one/three/four").await.unwrap();
    assert!(leaf.value.as_map().unwrap().get("test").is_some());
}

/// Follows links segment by segment and returns the CID linked at the end.
async fn subtree_cid(store: &Arc<MemoryStore>, root: &Cid, path: &[&str]) -> Cid {
    let builder = GraphBuilder::with_root(store.clone(), *root);
    let mut cid = *root;
    for segment in path {
        let node = builder.get(&cid).await.unwrap();
        let value = node.as_map().unwrap().get(segment).unwrap();
        cid = *value.as_link().unwrap();
    }
    cid
}

#[tokio::test]
async fn spent_builder_rejects_further_use() {
    let store = Arc::new(MemoryStore::new());
    let root = empty_root(&store).await;
    let block = leaf_block(&store);

    let mut graph = GraphBuilder::with_root(store.clone(), root);
    graph.add("/a/b", block.clone()).await.unwrap();
    graph.flush().await.unwrap();
    assert!(graph.is_spent());

    let before = store.cids().await.unwrap().len();
    let err = graph.add("/a/c", block).await.unwrap_err();
    assert!(matches!(err, Error::AlreadyFlushed));
    let err = graph.flush().await.unwrap_err();
    assert!(matches!(err, Error::AlreadyFlushed));
    assert_eq!(store.cids().await.unwrap().len(), before);
}

#[tokio::test]
async fn scalar_in_path_blocks_descent() {
    let store = Arc::new(MemoryStore::new());
    let codec = Codec::new(store.clone());
    let node = MapNode::new();
    node.insert("one", 42i64);
    let root = write(store.as_ref(), &codec, &Value::Map(node)).await;
    let block = leaf_block(&store);

    let before = store.cids().await.unwrap().len();
    let mut graph = GraphBuilder::with_root(store.clone(), root);
    graph.add("/one/two", block).await.unwrap();
    let err = graph.flush().await.unwrap_err();
    assert!(matches!(err, Error::InvalidLinkValue(key) if key == "one"));

    // The failed flush still spends the builder and writes nothing.
    assert!(graph.is_spent());
    assert_eq!(store.cids().await.unwrap().len(), before);
}

#[tokio::test]
async fn foreign_link_in_path_blocks_descent() {
    let store = Arc::new(MemoryStore::new());
    let codec = Codec::new(store.clone());
    let node = MapNode::new();
    node.insert("one", compute_cid(RAW, b"opaque payload"));
    let root = write(store.as_ref(), &codec, &Value::Map(node)).await;
    let block = leaf_block(&store);

    let before = store.cids().await.unwrap().len();
    let mut graph = GraphBuilder::with_root(store.clone(), root);
    graph.add("/one/two", block).await.unwrap();
    let err = graph.flush().await.unwrap_err();
    assert!(matches!(err, Error::InvalidLinkValue(key) if key == "one"));
    assert!(graph.is_spent());
    assert_eq!(store.cids().await.unwrap().len(), before);
}

#[derive(Debug)]
struct CommitRefused;

impl std::fmt::Display for CommitRefused {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "commit refused")
    }
}

impl std::error::Error for CommitRefused {}

/// Delegates to a MemoryStore but refuses every bulk commit.
struct FailingStore {
    inner: MemoryStore,
}

impl BlockStore for FailingStore {
    type Error = CommitRefused;
    type Bulk<'a>
        = FailingBulk<'a>
    where
        Self: 'a;

    async fn get(&self, cid: &Cid) -> Result<Option<Vec<u8>>, CommitRefused> {
        Ok(self.inner.get(cid).await.unwrap())
    }

    async fn put(&self, cid: &Cid, data: &[u8]) -> Result<(), CommitRefused> {
        self.inner.put(cid, data).await.unwrap();
        Ok(())
    }

    async fn has(&self, cid: &Cid) -> Result<bool, CommitRefused> {
        Ok(self.inner.has(cid).await.unwrap())
    }

    fn bulk(&self) -> FailingBulk<'_> {
        FailingBulk {
            inner: self.inner.bulk(),
        }
    }

    async fn cids(&self) -> Result<Vec<Cid>, CommitRefused> {
        Ok(self.inner.cids().await.unwrap())
    }
}

struct FailingBulk<'a> {
    inner: MemoryBulk<'a>,
}

impl BulkWriter for FailingBulk<'_> {
    type Error = CommitRefused;

    fn put(&mut self, cid: &Cid, data: &[u8]) {
        self.inner.put(cid, data);
    }

    fn del(&mut self, cid: &Cid) {
        self.inner.del(cid);
    }

    async fn commit(self) -> Result<(), CommitRefused> {
        Err(CommitRefused)
    }
}

#[tokio::test]
async fn failed_commit_spends_the_builder() {
    let store = Arc::new(FailingStore {
        inner: MemoryStore::new(),
    });
    let codec = Codec::new(store.clone());
    let root = write(store.as_ref(), &codec, &Value::Map(MapNode::new())).await;

    let node = MapNode::new();
    node.insert("test", 1234i64);
    let leaf = codec
        .serialize(&Value::Map(node))
        .unwrap()
        .next()
        .unwrap()
        .unwrap();

    let mut graph = GraphBuilder::with_root(store.clone(), root);
    graph.add("/one/two", leaf.clone()).await.unwrap();
    let err = graph.flush().await.unwrap_err();
    assert!(matches!(err, Error::Store(_)));

    // Spent despite the failure; nothing landed in the store.
    assert!(graph.is_spent());
    let err = graph.add("/one/three", leaf).await.unwrap_err();
    assert!(matches!(err, Error::AlreadyFlushed));
    let err = graph.flush().await.unwrap_err();
    assert!(matches!(err, Error::AlreadyFlushed));
    assert_eq!(store.inner.len(), 1);
}

#[tokio::test]
async fn flush_without_root_fails() {
    let store = Arc::new(MemoryStore::new());
    let mut graph = GraphBuilder::new(store);
    let err = graph.flush().await.unwrap_err();
    assert!(matches!(err, Error::NoRoot));
}

#[tokio::test]
async fn empty_flush_returns_same_root() {
    let store = Arc::new(MemoryStore::new());
    let root = empty_root(&store).await;
    let mut graph = GraphBuilder::with_root(store, root);
    let new_root = graph.flush().await.unwrap();
    assert_eq!(new_root, root);
}

#[tokio::test]
async fn sharded_paths_end_to_end() {
    let store = Arc::new(MemoryStore::new());
    let root = empty_root(&store).await;
    let block = leaf_block(&store);

    let mut graph = GraphBuilder::with_root(store.clone(), root);
    graph
        .shard_path("/accounts/:region/*", |name| {
            format!("{}/{}", &name[..2], name)
        })
        .unwrap();
    graph.add("/accounts/eu/alice", block).await.unwrap();
    let new_root = graph.flush().await.unwrap();

    // The sharding builder resolves through the same rewrite.
    let leaf = graph.resolve("/accounts/eu/alice").await.unwrap();
    assert!(leaf.value.as_map().unwrap().get("test").is_some());

    // A reader without the shard handler sees the physical layout.
    let plain = GraphBuilder::with_root(store, new_root);
    let leaf = plain.resolve("/accounts/eu/al/alice").await.unwrap();
    assert!(leaf.value.as_map().unwrap().get("test").is_some());
    let err = plain.resolve("/accounts/eu/alice").await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn priming_tolerates_missing_intermediates() {
    let store = Arc::new(MemoryStore::new());
    let root = empty_root(&store).await;
    let block = leaf_block(&store);

    let mut graph = GraphBuilder::with_root(store, root);
    // No intermediate nodes exist yet; priming just stops quietly.
    graph.add("/deep/chain/of/new/nodes", block).await.unwrap();
    let new_root = graph.flush().await.unwrap();
    assert_ne!(new_root, root);

    let leaf = graph.resolve("/deep/chain/of/new/nodes").await.unwrap();
    assert!(leaf.value.as_map().unwrap().get("test").is_some());
}

#[tokio::test]
async fn flush_stats_count_patch_nodes() {
    let store = Arc::new(MemoryStore::new());
    let root = empty_root(&store).await;
    let block = leaf_block(&store);

    let mut graph = GraphBuilder::with_root(store, root);
    graph.add("/one/two/three", block.clone()).await.unwrap();
    graph.add("/one/three/four", block).await.unwrap();
    graph.flush().await.unwrap();

    // Root, "one", and the two subtrees under it.
    let stats = graph.stats().unwrap();
    assert_eq!(stats.visited_nodes, 4);
}
