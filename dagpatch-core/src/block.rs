use cid::Cid;
use multihash_codetable::{Code, MultihashDigest};

/// DAG-CBOR multicodec code (0x71). Graph-internal nodes always carry this.
pub const DAG_CBOR: u64 = 0x71;

/// Raw-bytes multicodec code (0x55). Typical for leaf data blocks.
pub const RAW: u64 = 0x55;

/// Computes the CIDv1 for a block: sha2-256 over the encoded bytes plus the
/// codec tag. Identical bytes and codec always produce an identical CID.
pub fn compute_cid(codec: u64, data: &[u8]) -> Cid {
    let hash = Code::Sha2_256.digest(data);
    Cid::new_v1(codec, hash)
}

/// An immutable byte buffer together with its content identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    cid: Cid,
    data: Vec<u8>,
}

impl Block {
    /// Hashes `data` under the given codec tag and wraps both.
    pub fn new(codec: u64, data: Vec<u8>) -> Self {
        let cid = compute_cid(codec, &data);
        Block { cid, data }
    }

    /// Wraps bytes under an already-known CID, e.g. when reading back from a
    /// store. The CID is trusted, not re-verified.
    pub fn with_cid(cid: Cid, data: Vec<u8>) -> Self {
        Block { cid, data }
    }

    pub fn cid(&self) -> &Cid {
        &self.cid
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_parts(self) -> (Cid, Vec<u8>) {
        (self.cid, self.data)
    }
}
