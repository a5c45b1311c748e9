use cid::Cid;
use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::sync::RwLock;

/// Async CID-keyed store for block bytes.
///
/// Stores operate on raw bytes - serialization is handled by higher layers
/// (Codec, GraphBuilder). Methods take `&self` to support stores with
/// internal locking.
pub trait BlockStore: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;
    type Bulk<'a>: BulkWriter<Error = Self::Error> + 'a
    where
        Self: 'a;

    /// Retrieves the bytes associated with a CID, or None if not present.
    fn get(&self, cid: &Cid) -> impl Future<Output = Result<Option<Vec<u8>>, Self::Error>> + Send;

    /// Stores bytes at the given CID.
    fn put(&self, cid: &Cid, data: &[u8]) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Checks whether a CID exists in the store.
    fn has(&self, cid: &Cid) -> impl Future<Output = Result<bool, Self::Error>> + Send;

    /// Opens a bulk transaction. Writes buffer in memory until `commit`.
    fn bulk(&self) -> Self::Bulk<'_>;

    /// Enumerates every stored CID. Used by callers and tests, not by the
    /// graph core itself.
    fn cids(&self) -> impl Future<Output = Result<Vec<Cid>, Self::Error>> + Send;
}

/// A buffered write transaction against a [`BlockStore`].
///
/// `put` and `del` only record the operation; `commit` applies everything
/// in recorded order and consumes the transaction. A dropped transaction
/// applies nothing.
pub trait BulkWriter: Send {
    type Error: std::error::Error + Send + Sync + 'static;

    fn put(&mut self, cid: &Cid, data: &[u8]);

    fn del(&mut self, cid: &Cid);

    fn commit(self) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

enum BulkOp {
    Put(Cid, Vec<u8>),
    Del(Cid),
}

/// An in-memory store backed by a HashMap.
///
/// Useful for testing and as a reference implementation.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: RwLock<HashMap<Cid, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().unwrap().is_empty()
    }
}

impl BlockStore for MemoryStore {
    type Error = Infallible;
    type Bulk<'a>
        = MemoryBulk<'a>
    where
        Self: 'a;

    async fn get(&self, cid: &Cid) -> Result<Option<Vec<u8>>, Self::Error> {
        Ok(self.data.read().unwrap().get(cid).cloned())
    }

    async fn put(&self, cid: &Cid, data: &[u8]) -> Result<(), Self::Error> {
        self.data.write().unwrap().insert(*cid, data.to_vec());
        Ok(())
    }

    async fn has(&self, cid: &Cid) -> Result<bool, Self::Error> {
        Ok(self.data.read().unwrap().contains_key(cid))
    }

    fn bulk(&self) -> MemoryBulk<'_> {
        MemoryBulk {
            store: self,
            ops: Vec::new(),
        }
    }

    async fn cids(&self) -> Result<Vec<Cid>, Self::Error> {
        Ok(self.data.read().unwrap().keys().copied().collect())
    }
}

/// Bulk transaction for [`MemoryStore`]; applies under one write lock.
pub struct MemoryBulk<'a> {
    store: &'a MemoryStore,
    ops: Vec<BulkOp>,
}

impl BulkWriter for MemoryBulk<'_> {
    type Error = Infallible;

    fn put(&mut self, cid: &Cid, data: &[u8]) {
        self.ops.push(BulkOp::Put(*cid, data.to_vec()));
    }

    fn del(&mut self, cid: &Cid) {
        self.ops.push(BulkOp::Del(*cid));
    }

    async fn commit(self) -> Result<(), Self::Error> {
        let mut data = self.store.data.write().unwrap();
        for op in self.ops {
            match op {
                BulkOp::Put(cid, bytes) => {
                    data.insert(cid, bytes);
                }
                BulkOp::Del(cid) => {
                    data.remove(&cid);
                }
            }
        }
        Ok(())
    }
}
