//! Content store: pinned local blobs, an LRU cache of blobs fetched from peers, and the
//! `put`/`get` operations that fall back to the overlay.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use hoard_core::{verify_blob, ContentId, IntegrityMismatch};
use lru::LruCache;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::overlay::OverlayNode;
use crate::session::{Blob, BlobSource};

struct Cache {
    entries: LruCache<ContentId, Blob>,
    bytes: usize,
}

/// In-process blob table. Blobs written by `put` are pinned for the life of the node;
/// blobs fetched from peers share a byte budget and are evicted least recently used first.
pub struct BlobTable {
    pinned: DashMap<ContentId, Blob>,
    cache: Mutex<Cache>,
    capacity_bytes: usize,
}

impl BlobTable {
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            pinned: DashMap::new(),
            cache: Mutex::new(Cache {
                entries: LruCache::unbounded(),
                bytes: 0,
            }),
            capacity_bytes,
        }
    }

    fn cache(&self) -> MutexGuard<'_, Cache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pin `bytes` under `id`. Rewriting identical content is a no-op.
    pub fn pin(&self, id: ContentId, bytes: Blob) {
        self.pinned.entry(id).or_insert(bytes);
        let mut cache = self.cache();
        if let Some(dup) = cache.entries.pop(&id) {
            cache.bytes -= dup.len();
        }
    }

    /// Cache a verified peer blob. Returns false when it does not fit the budget at all.
    pub fn cache_insert(&self, id: ContentId, bytes: Blob) -> bool {
        if self.pinned.contains_key(&id) {
            return true;
        }
        if bytes.len() > self.capacity_bytes {
            debug!(content_id = %id, len = bytes.len(), "blob exceeds cache budget, not cached");
            return false;
        }
        let mut cache = self.cache();
        let len = bytes.len();
        if let Some(old) = cache.entries.put(id, bytes) {
            cache.bytes -= old.len();
        }
        cache.bytes += len;
        while cache.bytes > self.capacity_bytes {
            match cache.entries.pop_lru() {
                Some((evicted, blob)) => {
                    cache.bytes -= blob.len();
                    debug!(content_id = %evicted, len = blob.len(), "evicted from cache");
                }
                None => break,
            }
        }
        true
    }

    pub fn get(&self, id: &ContentId) -> Option<Blob> {
        if let Some(blob) = self.pinned.get(id) {
            return Some(blob.value().clone());
        }
        self.cache().entries.get(id).cloned()
    }

    pub fn contains(&self, id: &ContentId) -> bool {
        self.pinned.contains_key(id) || self.cache().entries.contains(id)
    }

    pub fn is_pinned(&self, id: &ContentId) -> bool {
        self.pinned.contains_key(id)
    }

    pub fn pinned_count(&self) -> usize {
        self.pinned.len()
    }

    /// Blob currently held by the peer-blob cache.
    pub fn cached_bytes(&self) -> usize {
        self.cache().bytes
    }

    pub fn capacity_bytes(&self) -> usize {
        self.capacity_bytes
    }
}

impl BlobSource for BlobTable {
    fn lookup(&self, id: &ContentId) -> Option<Blob> {
        self.get(id)
    }
}

/// Maps content ids to blobs: the local table first, then connected peers.
pub struct ContentStore {
    blobs: Arc<BlobTable>,
    overlay: Arc<OverlayNode>,
    max_blob_bytes: Option<usize>,
}

impl ContentStore {
    pub fn new(
        blobs: Arc<BlobTable>,
        overlay: Arc<OverlayNode>,
        max_blob_bytes: Option<usize>,
    ) -> Self {
        Self {
            blobs,
            overlay,
            max_blob_bytes,
        }
    }

    pub fn blobs(&self) -> &Arc<BlobTable> {
        &self.blobs
    }

    /// Store `bytes` and return their content id. The blob is readable before the id is
    /// returned. Idempotent.
    pub fn put(&self, bytes: &[u8]) -> Result<ContentId, StoreError> {
        if let Some(limit) = self.max_blob_bytes {
            if bytes.len() > limit {
                return Err(StoreError::TooLarge {
                    size: bytes.len(),
                    limit,
                });
            }
        }
        let id = ContentId::of(bytes);
        if !self.blobs.is_pinned(&id) {
            self.blobs.pin(id, Blob::from(bytes));
            info!(content_id = %id, len = bytes.len(), "stored blob");
        }
        Ok(id)
    }

    pub fn get_local(&self, id: &ContentId) -> Option<Blob> {
        self.blobs.get(id)
    }

    /// Local lookup, else ask connected peers. A peer blob is verified before it is cached
    /// and returned; a mismatch counts against that peer.
    pub async fn get(&self, id: &ContentId) -> Result<Blob, StoreError> {
        if let Some(blob) = self.blobs.get(id) {
            debug!(content_id = %id, "local hit");
            return Ok(blob);
        }
        self.fetch_from_peers(id)
            .await?
            .ok_or(StoreError::NotFound(*id))
    }

    /// Transfer `id` from the first peer that completes it, verify it and write it through
    /// to the cache. `Ok(None)` when no peer delivered it.
    pub(crate) async fn fetch_from_peers(
        &self,
        id: &ContentId,
    ) -> Result<Option<Blob>, IntegrityMismatch> {
        let Some((peer, bytes)) = self.overlay.query_peers(*id).await else {
            return Ok(None);
        };
        if let Err(e) = verify_blob(id, &bytes) {
            warn!(peer = %peer, content_id = %id, "peer served corrupt blob");
            self.overlay.record_integrity_failure(peer);
            return Err(e);
        }
        let bytes = Blob::from(bytes);
        debug!(peer = %peer, content_id = %id, len = bytes.len(), "retrieved from peer");
        self.blobs.cache_insert(*id, bytes.clone());
        Ok(Some(bytes))
    }
}
