//! Integrity: blob verification against its content id, peer trust tracking.

use std::collections::HashMap;

use crate::address::ContentId;
use crate::identity::DeviceId;

/// Default maximum integrity failures before a peer is isolated.
pub const DEFAULT_MAX_INTEGRITY_FAILURES: u32 = 3;

/// Reassembled bytes whose hash differs from the requested id.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("integrity mismatch: expected {expected}, got {actual}")]
pub struct IntegrityMismatch {
    pub expected: ContentId,
    pub actual: ContentId,
}

/// Re-hash `bytes` and compare against `expected`.
pub fn verify_blob(expected: &ContentId, bytes: &[u8]) -> Result<(), IntegrityMismatch> {
    let actual = ContentId::of(bytes);
    if actual == *expected {
        Ok(())
    } else {
        Err(IntegrityMismatch {
            expected: *expected,
            actual,
        })
    }
}

/// Tracks integrity failures per peer for malicious peer detection.
#[derive(Debug, Default)]
pub struct PeerTrustTracker {
    failures: HashMap<DeviceId, u32>,
}

impl PeerTrustTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an integrity failure for a peer.
    pub fn record_failure(&mut self, peer_id: DeviceId) {
        *self.failures.entry(peer_id).or_insert(0) += 1;
    }

    /// Check if a peer should be isolated (failures >= max_failures).
    pub fn is_isolated(&self, peer_id: &DeviceId, max_failures: u32) -> bool {
        self.failure_count(peer_id) >= max_failures
    }

    pub fn failure_count(&self, peer_id: &DeviceId) -> u32 {
        self.failures.get(peer_id).copied().unwrap_or(0)
    }
}
