//! Error taxonomy surfaced by the node.
//!
//! Peer-level failures (`ConnectError`, a session dying mid-query or mid-transfer) are
//! recovered inside the node by asking the remaining peers, and only logged. `NotFound` and
//! `IntegrityMismatch` end a single `get`/`collect` and reach the caller. A `ChunkStream`
//! is bound to one peer, so its `SessionLost`, `Protocol` and `Timeout` reach the caller.

use hoard_core::{ContentId, IntegrityMismatch, ParseContentIdError};

use crate::config::ConfigError;

/// Failure to establish a session with one peer.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// TCP connect refused, timed out, or the host did not resolve.
    #[error("peer {addr} unreachable: {reason}")]
    Unreachable { addr: String, reason: String },
    /// Version mismatch, forged or unexpected identity, or failed key confirmation.
    #[error("handshake with {addr} failed: {reason}")]
    HandshakeFailed { addr: String, reason: String },
    #[error("invalid peer address {0:?}")]
    InvalidAddress(String),
}

impl ConnectError {
    pub fn is_unreachable(&self) -> bool {
        matches!(self, ConnectError::Unreachable { .. })
    }
}

/// Errors from the content store and the `submit` boundary.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0} not found locally or on any peer")]
    NotFound(ContentId),
    #[error(transparent)]
    IntegrityMismatch(#[from] IntegrityMismatch),
    #[error("blob of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(#[from] ParseContentIdError),
}

/// Errors from the retrieval pipeline and the `fetch` boundary.
#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("{0} not found locally or on any peer")]
    NotFound(ContentId),
    #[error(transparent)]
    IntegrityMismatch(#[from] IntegrityMismatch),
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(#[from] ParseContentIdError),
    /// The session carrying the stream closed, or the peer overran the stream window, before
    /// the last chunk.
    #[error("session to {peer} lost mid-stream")]
    SessionLost { peer: String },
    /// The peer sent something that cannot be part of a valid chunk stream.
    #[error("protocol violation from {peer}: {reason}")]
    Protocol { peer: String, reason: String },
    #[error("no chunk within {0:?}")]
    Timeout(std::time::Duration),
}

/// Node startup failures.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("binding {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        source: std::io::Error,
    },
    #[error("starting runtime: {0}")]
    Runtime(std::io::Error),
}
