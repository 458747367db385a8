//! Content addressing: SHA-256 digest of a blob, printed as `sha256:<hex>`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Scheme prefix of the current (and only) addressing version.
pub const SHA256_SCHEME: &str = "sha256";

/// Digest width in bytes.
pub const DIGEST_LEN: usize = 32;

/// Content identifier: SHA-256 of the blob bytes. Two equal buffers always map to the same id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentId(#[serde(with = "bytes_32")] [u8; DIGEST_LEN]);

mod bytes_32 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    pub fn serialize<S: Serializer>(v: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        v.as_slice().serialize(serializer)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let buf: Vec<u8> = Deserialize::deserialize(d)?;
        buf.try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

impl ContentId {
    /// Hash `bytes` into their content identifier. Pure; the only failure mode is allocation.
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        ContentId(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// First 8 hex characters, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// True when `bytes` re-hash to this identifier.
    pub fn matches(&self, bytes: &[u8]) -> bool {
        ContentId::of(bytes) == *self
    }
}

/// Free-function form used by the store: `hash(bytes) -> ContentId`.
pub fn hash(bytes: &[u8]) -> ContentId {
    ContentId::of(bytes)
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", SHA256_SCHEME, hex::encode(self.0))
    }
}

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentId({}:{}..)", SHA256_SCHEME, self.short())
    }
}

impl FromStr for ContentId {
    type Err = ParseContentIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (scheme, digest) = s
            .split_once(':')
            .ok_or(ParseContentIdError::MissingScheme)?;
        if scheme != SHA256_SCHEME {
            return Err(ParseContentIdError::UnknownScheme(scheme.to_string()));
        }
        let bytes = hex::decode(digest)?;
        let digest: [u8; DIGEST_LEN] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| ParseContentIdError::Length(b.len()))?;
        Ok(ContentId(digest))
    }
}

/// Error parsing the printable form of a [`ContentId`].
#[derive(Debug, thiserror::Error)]
pub enum ParseContentIdError {
    #[error("identifier has no scheme prefix")]
    MissingScheme,
    #[error("unknown identifier scheme {0:?}")]
    UnknownScheme(String),
    #[error("identifier digest is not hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("identifier digest has {0} bytes, expected 32")]
    Length(usize),
}
