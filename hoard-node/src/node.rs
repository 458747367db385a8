//! Node lifecycle: the root handle owning the overlay, the store and the pipeline.

use std::net::SocketAddr;
use std::sync::Arc;

use hoard_core::{ContentId, DeviceId, Keypair};
use tracing::info;

use crate::config::NodeConfig;
use crate::discovery::{PeerAddress, PeerDiscovery};
use crate::error::{ConnectError, NodeError, RetrievalError, StoreError};
use crate::overlay::OverlayNode;
use crate::retrieval::{ChunkStream, RetrievalPipeline};
use crate::session::Blob;
use crate::store::{BlobTable, ContentStore};

/// This process in the network. Created once by the entry point, shut down once.
pub struct NodeHandle {
    config: NodeConfig,
    overlay: Arc<OverlayNode>,
    store: Arc<ContentStore>,
    pipeline: RetrievalPipeline,
    local_addr: SocketAddr,
}

impl NodeHandle {
    /// Generate an identity, start listening, and bootstrap from the seed list.
    /// Unreachable seeds leave the node running local-only.
    pub async fn start(config: NodeConfig) -> Result<Self, NodeError> {
        config.validate()?;
        let keypair = Arc::new(Keypair::generate());
        let blobs = Arc::new(BlobTable::new(config.cache_capacity_bytes));
        let overlay = Arc::new(OverlayNode::new(keypair, blobs.clone(), &config));
        let local_addr = overlay.listen(config.listen_addr).await?;
        let store = Arc::new(ContentStore::new(
            blobs,
            overlay.clone(),
            config.max_blob_bytes,
        ));
        let pipeline = RetrievalPipeline::new(store.clone(), overlay.clone(), config.chunk_size);

        let discovery = PeerDiscovery::new(overlay.transport().clone(), config.bootstrap_backoff());
        let sessions = discovery.bootstrap(&config.seed_peers).await;
        info!(
            device_id = %overlay.device_id(),
            addr = %local_addr,
            sessions,
            "node ready"
        );
        Ok(Self {
            config,
            overlay,
            store,
            pipeline,
            local_addr,
        })
    }

    pub fn device_id(&self) -> DeviceId {
        self.overlay.device_id()
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn overlay(&self) -> &Arc<OverlayNode> {
        &self.overlay
    }

    pub fn store(&self) -> &Arc<ContentStore> {
        &self.store
    }

    pub fn pipeline(&self) -> &RetrievalPipeline {
        &self.pipeline
    }

    pub fn put(&self, bytes: &[u8]) -> Result<ContentId, StoreError> {
        self.store.put(bytes)
    }

    pub async fn get(&self, id: &ContentId) -> Result<Blob, StoreError> {
        self.store.get(id).await
    }

    pub async fn stream(&self, id: &ContentId) -> Result<ChunkStream, RetrievalError> {
        self.pipeline.stream(id).await
    }

    pub async fn collect(&self, id: &ContentId) -> Result<Blob, RetrievalError> {
        self.pipeline.collect(id).await
    }

    /// Open a session to one more peer after startup.
    pub async fn connect(&self, address: &str) -> Result<DeviceId, ConnectError> {
        let address: PeerAddress = address.parse()?;
        let session = self.overlay.transport().open(&address).await?;
        Ok(session.peer())
    }

    pub async fn session_count(&self) -> usize {
        self.overlay.sessions().len().await
    }

    pub async fn shutdown(self) {
        self.overlay.shutdown().await;
        info!(device_id = %self.device_id(), "node stopped");
    }
}
