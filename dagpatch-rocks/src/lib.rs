//! RocksDB-backed block store for Dagpatch.

use std::path::Path;

use cid::Cid;
use dagpatch_core::{BlockStore, BulkWriter};
use rocksdb::{DB, IteratorMode, Options, WriteBatch};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RocksError {
    #[error("RocksDB error: {0}")]
    Db(#[from] rocksdb::Error),
    #[error("store key is not a CID: {0}")]
    Key(cid::Error),
}

/// A persistent block store backed by RocksDB, keyed by CID bytes.
pub struct RocksStore {
    db: DB,
}

impl RocksStore {
    /// Opens a RocksDB store at the given path.
    ///
    /// Creates the database if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RocksError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path)?;
        Ok(Self { db })
    }
}

impl BlockStore for RocksStore {
    type Error = RocksError;
    type Bulk<'a>
        = RocksBulk<'a>
    where
        Self: 'a;

    async fn get(&self, cid: &Cid) -> Result<Option<Vec<u8>>, Self::Error> {
        Ok(self.db.get(cid.to_bytes())?)
    }

    async fn put(&self, cid: &Cid, data: &[u8]) -> Result<(), Self::Error> {
        self.db.put(cid.to_bytes(), data)?;
        Ok(())
    }

    async fn has(&self, cid: &Cid) -> Result<bool, Self::Error> {
        Ok(self.db.get_pinned(cid.to_bytes())?.is_some())
    }

    fn bulk(&self) -> RocksBulk<'_> {
        RocksBulk {
            db: &self.db,
            batch: WriteBatch::default(),
        }
    }

    async fn cids(&self) -> Result<Vec<Cid>, Self::Error> {
        let mut out = Vec::new();
        for item in self.db.iterator(IteratorMode::Start) {
            let (key, _) = item?;
            out.push(Cid::try_from(&key[..]).map_err(RocksError::Key)?);
        }
        Ok(out)
    }
}

/// Bulk transaction backed by a RocksDB write batch; one atomic write on
/// commit.
pub struct RocksBulk<'a> {
    db: &'a DB,
    batch: WriteBatch,
}

impl BulkWriter for RocksBulk<'_> {
    type Error = RocksError;

    fn put(&mut self, cid: &Cid, data: &[u8]) {
        self.batch.put(cid.to_bytes(), data);
    }

    fn del(&mut self, cid: &Cid) {
        self.batch.delete(cid.to_bytes());
    }

    async fn commit(self) -> Result<(), Self::Error> {
        self.db.write(self.batch)?;
        Ok(())
    }
}
