//! Content-Addressable Storage (CAS) module
//!
//! Derives content identifiers from payload bytes and persists blocks plus
//! their metadata in a sharded directory tree.

pub mod metadata;
pub mod storage;

pub use metadata::{format_bytes, BlockKind, BlockMetadata, StoreStats};
pub use storage::BlockStore;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

/// Format tag carried by every identifier
pub const ID_PREFIX: &str = "Qm";

/// Length of the encoded digest following the prefix
pub const ID_BODY_LEN: usize = 44;

/// Total identifier length
pub const ID_LEN: usize = ID_PREFIX.len() + ID_BODY_LEN;

/// Block store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid content identifier: {0:?}")]
    InvalidIdentifier(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("metadata error: {0}")]
    Metadata(#[from] serde_json::Error),
}

/// Result type for block store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Content identifier: `Qm` followed by a 44-char Base58 SHA-256 digest
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentId(String);

impl ContentId {
    /// Compute the identifier of a payload
    pub fn derive(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        let encoded = bs58::encode(digest.as_slice()).into_string();

        // Small digests encode to fewer symbols; pad with the zero symbol so
        // every identifier has the same width.
        let mut id = String::with_capacity(ID_LEN);
        id.push_str(ID_PREFIX);
        for _ in encoded.len()..ID_BODY_LEN {
            id.push('1');
        }
        id.push_str(&encoded[..encoded.len().min(ID_BODY_LEN)]);
        ContentId(id)
    }

    /// Parse an identifier, checking only its syntax
    pub fn parse(s: &str) -> StoreResult<Self> {
        if is_valid_identifier(s) {
            Ok(ContentId(s.to_string()))
        } else {
            Err(StoreError::InvalidIdentifier(s.to_string()))
        }
    }

    /// Directory shard: the two characters after the format tag
    pub fn shard(&self) -> &str {
        &self.0[2..4]
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Syntactic check only: prefix and length. Says nothing about the content.
pub fn is_valid_identifier(s: &str) -> bool {
    s.len() == ID_LEN && s.starts_with(ID_PREFIX) && s.is_ascii()
}

impl TryFrom<String> for ContentId {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if is_valid_identifier(&value) {
            Ok(ContentId(value))
        } else {
            Err(StoreError::InvalidIdentifier(value))
        }
    }
}

impl From<ContentId> for String {
    fn from(id: ContentId) -> Self {
        id.0
    }
}

impl std::str::FromStr for ContentId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ContentId::parse(s)
    }
}

impl AsRef<str> for ContentId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentId({})", self.0)
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
