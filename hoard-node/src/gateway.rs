//! Blocking `submit`/`fetch` boundary for callers outside the async runtime (UI layers,
//! the CLI).

use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hoard_core::ContentId;
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, info};

use crate::config::NodeConfig;
use crate::error::{NodeError, RetrievalError, StoreError};
use crate::node::NodeHandle;

/// Owns a small multi-thread runtime and the node running on it.
pub struct Gateway {
    runtime: Runtime,
    node: NodeHandle,
}

impl Gateway {
    /// Build the runtime (`worker_threads` from config) and start the node on it.
    pub fn start(config: NodeConfig) -> Result<Self, NodeError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(config.worker_threads)
            .thread_name("hoard-worker")
            .enable_all()
            .build()
            .map_err(NodeError::Runtime)?;
        let node = runtime.block_on(NodeHandle::start(config))?;
        Ok(Self { runtime, node })
    }

    pub fn node(&self) -> &NodeHandle {
        &self.node
    }

    /// Run a future on the gateway runtime.
    pub fn block_on<F: std::future::Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    /// Store `bytes` and return the identifier string. The media type is not part of the
    /// address; identical bytes give the same identifier whatever it is.
    pub fn submit(&self, bytes: &[u8], media_type: &str) -> Result<String, StoreError> {
        let id = self.node.put(bytes)?;
        debug!(content_id = %id, media_type, len = bytes.len(), "submitted");
        Ok(id.to_string())
    }

    /// Retrieve and verify the blob named by `id`.
    pub fn fetch(&self, id: &str, media_type: &str) -> Result<DownloadHandle, RetrievalError> {
        let content_id: ContentId = id.trim().parse()?;
        let bytes = self.runtime.block_on(self.node.collect(&content_id))?;
        info!(content_id = %content_id, len = bytes.len(), "fetched");
        Ok(DownloadHandle {
            content_id,
            media_type: media_type.to_string(),
            bytes: bytes.to_vec(),
        })
    }

    pub fn shutdown(self) {
        let Gateway { runtime, node } = self;
        runtime.block_on(node.shutdown());
    }
}

/// Verified bytes of a fetched blob, tagged with the media type the caller declared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadHandle {
    content_id: ContentId,
    media_type: String,
    bytes: Vec<u8>,
}

impl DownloadHandle {
    pub fn content_id(&self) -> ContentId {
        self.content_id
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn write_to(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        std::fs::write(path, &self.bytes)
    }

    /// `data:<media type>;base64,<payload>` link to the bytes.
    pub fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.media_type, STANDARD.encode(&self.bytes))
    }
}
