//! Retrieval pipeline: lazy chunk streams and verified reassembly.

use std::collections::HashSet;
use std::sync::Arc;

use hoard_core::chunk::{self, effective_chunk_size};
use hoard_core::{Chunk, ContentId, DeviceId};
use tracing::debug;

use crate::error::RetrievalError;
use crate::overlay::{OverlayNode, PeerStream};
use crate::session::Blob;
use crate::store::ContentStore;

/// Where a [`ChunkStream`] reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkSource {
    Local,
    Peer(DeviceId),
}

enum Source {
    Local {
        blob: Blob,
        chunk_size: usize,
        next: u64,
        count: u64,
    },
    Remote(PeerStream),
}

/// Finite, non-restartable sequence of the chunks of one blob. Dropping it early cancels
/// the transfer without closing the session.
pub struct ChunkStream {
    content_id: ContentId,
    source: Source,
}

impl ChunkStream {
    pub fn content_id(&self) -> ContentId {
        self.content_id
    }

    pub fn source(&self) -> ChunkSource {
        match &self.source {
            Source::Local { .. } => ChunkSource::Local,
            Source::Remote(stream) => ChunkSource::Peer(stream.peer()),
        }
    }

    /// Next chunk, `Ok(None)` once all have been yielded. Local chunks come in ordinal order;
    /// remote chunks in arrival order.
    pub async fn next(&mut self) -> Result<Option<Chunk>, RetrievalError> {
        match &mut self.source {
            Source::Local {
                blob,
                chunk_size,
                next,
                count,
            } => {
                if *next >= *count {
                    return Ok(None);
                }
                let chunk = chunk::chunk_at(&blob[..], *chunk_size, *next);
                *next += 1;
                Ok(Some(chunk))
            }
            Source::Remote(stream) => stream.next_chunk().await,
        }
    }
}

/// Fetches blobs as chunk streams and reassembles them with an integrity check.
pub struct RetrievalPipeline {
    store: Arc<ContentStore>,
    overlay: Arc<OverlayNode>,
    chunk_size: usize,
}

impl RetrievalPipeline {
    pub fn new(store: Arc<ContentStore>, overlay: Arc<OverlayNode>, chunk_size: usize) -> Self {
        Self {
            store,
            overlay,
            chunk_size: effective_chunk_size(chunk_size),
        }
    }

    /// Open a chunk stream for `id`: sliced from the local table, or from the first peer
    /// that answers. A remote stream stays on that peer; a failure part way is returned
    /// from [`ChunkStream::next`].
    pub async fn stream(&self, id: &ContentId) -> Result<ChunkStream, RetrievalError> {
        if let Some(blob) = self.store.get_local(id) {
            debug!(content_id = %id, len = blob.len(), "streaming from local table");
            let count = chunk::chunk_count(blob.len(), self.chunk_size);
            return Ok(ChunkStream {
                content_id: *id,
                source: Source::Local {
                    blob,
                    chunk_size: self.chunk_size,
                    next: 0,
                    count,
                },
            });
        }
        match self.overlay.open_query(*id, &HashSet::new()).await {
            Some(stream) => Ok(ChunkStream {
                content_id: *id,
                source: Source::Remote(stream),
            }),
            None => Err(RetrievalError::NotFound(*id)),
        }
    }

    /// The whole blob, verified. A remote transfer that fails part way (session lost,
    /// stalled, malformed) moves on to the remaining peers; a blob that fails verification
    /// ends the call. A verified peer blob is cached; a mismatch is recorded against the
    /// peer.
    pub async fn collect(&self, id: &ContentId) -> Result<Blob, RetrievalError> {
        if let Some(blob) = self.store.get_local(id) {
            return Ok(blob);
        }
        self.store
            .fetch_from_peers(id)
            .await?
            .ok_or(RetrievalError::NotFound(*id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::BlobTable;
    use crate::testing::test_config;
    use hoard_core::Keypair;
    use proptest::prelude::*;

    fn pipeline(chunk_size: usize) -> RetrievalPipeline {
        let mut config = test_config();
        config.chunk_size = chunk_size;
        let blobs = Arc::new(BlobTable::new(config.cache_capacity_bytes));
        let overlay = Arc::new(OverlayNode::new(
            Arc::new(Keypair::generate()),
            blobs.clone(),
            &config,
        ));
        let store = Arc::new(ContentStore::new(blobs, overlay.clone(), None));
        RetrievalPipeline::new(store, overlay, chunk_size)
    }

    fn block_on<F: std::future::Future>(f: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(f)
    }

    #[tokio::test]
    async fn local_round_trip() {
        let p = pipeline(4);
        let id = p.store.put(b"hello, hoard").unwrap();
        assert_eq!(p.collect(&id).await.unwrap().as_ref(), b"hello, hoard");
    }

    #[tokio::test]
    async fn local_stream_is_ordered_and_bounded() {
        let p = pipeline(4);
        let id = p.store.put(b"0123456789").unwrap();
        let mut stream = p.stream(&id).await.unwrap();
        assert_eq!(stream.source(), ChunkSource::Local);
        let mut chunks = Vec::new();
        while let Some(c) = stream.next().await.unwrap() {
            assert!(c.bytes.len() <= 4);
            chunks.push(c);
        }
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().enumerate().all(|(i, c)| c.ordinal == i as u64));
        assert!(chunks.last().unwrap().is_last);
        assert!(stream.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_blob_collects_empty() {
        let p = pipeline(4);
        let id = p.store.put(&[]).unwrap();
        let mut stream = p.stream(&id).await.unwrap();
        let only = stream.next().await.unwrap().unwrap();
        assert!(only.bytes.is_empty() && only.is_last);
        assert!(p.collect(&id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let p = pipeline(4);
        let id = ContentId::of(b"nowhere");
        assert!(matches!(p.collect(&id).await, Err(RetrievalError::NotFound(got)) if got == id));
    }

    proptest! {
        #[test]
        fn stream_concat_equals_collect(
            blob in proptest::collection::vec(any::<u8>(), 0..2048),
            chunk_size in 1usize..300,
        ) {
            let p = pipeline(chunk_size);
            let id = p.store.put(&blob).unwrap();
            let (streamed, collected) = block_on(async {
                let mut stream = p.stream(&id).await.unwrap();
                let mut parts = Vec::new();
                while let Some(c) = stream.next().await.unwrap() {
                    parts.push(c);
                }
                parts.sort_by_key(|c| c.ordinal);
                let streamed: Vec<u8> = parts.into_iter().flat_map(|c| c.bytes).collect();
                (streamed, p.collect(&id).await.unwrap())
            });
            prop_assert_eq!(&streamed, &blob);
            prop_assert_eq!(collected.as_ref(), blob.as_slice());
        }
    }
}
