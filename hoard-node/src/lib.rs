//! Hoard node: sessions, seed discovery, overlay queries, the content store and retrieval,
//! run on tokio. The protocol itself lives in `hoard-core`.

pub mod config;
pub mod discovery;
pub mod error;
pub mod gateway;
pub mod node;
pub mod overlay;
pub mod retrieval;
pub mod session;
pub mod store;
pub mod table;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{ConfigError, NodeConfig};
pub use discovery::{PeerAddress, PeerDiscovery};
pub use error::{ConnectError, NodeError, RetrievalError, StoreError};
pub use gateway::{DownloadHandle, Gateway};
pub use node::NodeHandle;
pub use overlay::{OverlayNode, PeerStream};
pub use retrieval::{ChunkSource, ChunkStream, RetrievalPipeline};
pub use session::{
    Blob, BlobSource, LogicalStream, Session, SessionClosed, SessionSettings, TransportSession,
    STREAM_WINDOW,
};
pub use store::{BlobTable, ContentStore};
pub use table::SessionTable;
