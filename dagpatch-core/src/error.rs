use cid::Cid;
use thiserror::Error;

/// Error type for codec and graph operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A path segment does not exist in the node being resolved.
    #[error("cannot find link \"{0}\"")]
    NotFound(String),
    /// A block is missing from the store.
    #[error("block not found: {0}")]
    BlockNotFound(Cid),
    #[error("the object passed has circular references")]
    CircularReference,
    #[error("encoded node is {size} bytes, exceeding the {limit} byte limit")]
    ObjectTooLarge { size: usize, limit: usize },
    #[error("shard pattern must end in \"*\": {0}")]
    InvalidShardPattern(String),
    /// An existing value in the graph is neither a link nor a map where a
    /// patch needs to descend.
    #[error("value at \"{0}\" is not a link or nested node")]
    InvalidLinkValue(String),
    #[error("graph builder already flushed")]
    AlreadyFlushed,
    #[error("no root node")]
    NoRoot,
    #[error("encode: {0}")]
    Encode(String),
    #[error("decode: {0}")]
    Decode(String),
    #[error("store: {0}")]
    Store(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    pub(crate) fn store<E: std::error::Error + Send + Sync + 'static>(err: E) -> Self {
        Error::Store(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
