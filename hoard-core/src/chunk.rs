//! Chunking: split a blob into ordinal-tagged slices and reassemble them by ordinal.

use std::collections::BTreeMap;
use std::ops::Range;

/// Default chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024; // 64 KiB

/// Largest chunk a node will produce or accept; keeps frames far below the wire limit.
pub const MAX_CHUNK_SIZE: usize = 4 * 1024 * 1024; // 4 MiB

/// One slice of a blob. Reassembly is by `ordinal`, never by arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub ordinal: u64,
    pub bytes: Vec<u8>,
    pub is_last: bool,
}

/// Clamp a requested chunk size into `1..=MAX_CHUNK_SIZE`; zero means the default.
pub fn effective_chunk_size(chunk_size: usize) -> usize {
    match chunk_size {
        0 => DEFAULT_CHUNK_SIZE,
        n => n.min(MAX_CHUNK_SIZE),
    }
}

/// Number of chunks a blob of `total_len` bytes splits into. An empty blob is one empty chunk.
pub fn chunk_count(total_len: usize, chunk_size: usize) -> u64 {
    let size = effective_chunk_size(chunk_size);
    if total_len == 0 {
        return 1;
    }
    total_len.div_ceil(size) as u64
}

/// Byte range of chunk `ordinal`. Ordinals past the end yield an empty range at `total_len`.
pub fn chunk_range(total_len: usize, chunk_size: usize, ordinal: u64) -> Range<usize> {
    let size = effective_chunk_size(chunk_size);
    let start = usize::try_from(ordinal)
        .ok()
        .and_then(|o| o.checked_mul(size))
        .unwrap_or(total_len)
        .min(total_len);
    let end = start.saturating_add(size).min(total_len);
    start..end
}

/// Copy chunk `ordinal` out of `blob`.
pub fn chunk_at(blob: &[u8], chunk_size: usize, ordinal: u64) -> Chunk {
    let count = chunk_count(blob.len(), chunk_size);
    Chunk {
        ordinal,
        bytes: blob[chunk_range(blob.len(), chunk_size, ordinal)].to_vec(),
        is_last: ordinal + 1 == count,
    }
}

/// Ordinals a chunk sequence may use when nothing tighter is known: every chunk but an
/// empty blob's single chunk carries at least one byte.
pub const MAX_ORDINALS: u64 = usize::MAX as u64;

/// Collects chunks arriving in any order and rebuilds the blob once every ordinal up to the
/// one flagged `is_last` is present.
#[derive(Debug)]
pub struct Reassembler {
    received: BTreeMap<u64, Vec<u8>>,
    last: Option<u64>,
    total_bytes: usize,
    max_ordinals: u64,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::with_limit(MAX_ORDINALS)
    }
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reassembler that rejects any ordinal at or above `max_ordinals`.
    pub fn with_limit(max_ordinals: u64) -> Self {
        Self {
            received: BTreeMap::new(),
            last: None,
            total_bytes: 0,
            max_ordinals: max_ordinals.max(1),
        }
    }

    /// Record a chunk. Returns true if the blob is now complete.
    /// A duplicate ordinal is ignored (first copy wins).
    pub fn insert(&mut self, chunk: Chunk) -> Result<bool, ReassemblyError> {
        if chunk.ordinal >= self.max_ordinals {
            return Err(ReassemblyError::OutOfRange {
                ordinal: chunk.ordinal,
                limit: self.max_ordinals,
            });
        }
        if chunk.is_last {
            match self.last {
                Some(last) if last != chunk.ordinal => {
                    return Err(ReassemblyError::ConflictingLast {
                        first: last,
                        second: chunk.ordinal,
                    })
                }
                _ => {}
            }
            if let Some((&highest, _)) = self.received.last_key_value() {
                if highest > chunk.ordinal {
                    return Err(ReassemblyError::PastLast {
                        ordinal: highest,
                        last: chunk.ordinal,
                    });
                }
            }
            self.last = Some(chunk.ordinal);
        } else if let Some(last) = self.last {
            if chunk.ordinal >= last {
                return Err(ReassemblyError::PastLast {
                    ordinal: chunk.ordinal,
                    last,
                });
            }
        }
        if !self.received.contains_key(&chunk.ordinal) {
            self.total_bytes += chunk.bytes.len();
            self.received.insert(chunk.ordinal, chunk.bytes);
        }
        Ok(self.is_complete())
    }

    pub fn is_complete(&self) -> bool {
        self.last
            .and_then(|last| last.checked_add(1))
            .is_some_and(|count| self.received.len() as u64 == count)
    }

    /// Reassemble chunks in ordinal order. Returns `None` until complete.
    pub fn into_bytes(self) -> Option<Vec<u8>> {
        if !self.is_complete() {
            return None;
        }
        let mut out = Vec::with_capacity(self.total_bytes);
        for payload in self.received.into_values() {
            out.extend_from_slice(&payload);
        }
        Some(out)
    }
}

/// A chunk sequence that cannot describe any blob.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReassemblyError {
    #[error("chunk {ordinal} lies past the last chunk {last}")]
    PastLast { ordinal: u64, last: u64 },
    #[error("two different last chunks: {first} and {second}")]
    ConflictingLast { first: u64, second: u64 },
    #[error("chunk {ordinal} is outside the {limit} ordinals a blob may have")]
    OutOfRange { ordinal: u64, limit: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn blob(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn split_into_chunks(blob: &[u8], chunk_size: usize) -> Vec<Chunk> {
        (0..chunk_count(blob.len(), chunk_size))
            .map(|ordinal| chunk_at(blob, chunk_size, ordinal))
            .collect()
    }

    #[test]
    fn split_chunks() {
        let chunks = split_into_chunks(&blob(100), 30);
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0].bytes.len(), 30);
        assert_eq!(chunks[3].bytes.len(), 10);
        assert!(chunks[3].is_last);
        assert!(!chunks[2].is_last);
    }

    #[test]
    fn split_exact_multiple() {
        let chunks = split_into_chunks(&blob(90), 30);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].ordinal, 2);
        assert_eq!(chunks[2].bytes.len(), 30);
    }

    #[test]
    fn split_zero_length_is_one_empty_last_chunk() {
        let chunks = split_into_chunks(&[], 30);
        assert_eq!(
            chunks,
            vec![Chunk {
                ordinal: 0,
                bytes: vec![],
                is_last: true
            }]
        );
    }

    #[test]
    fn split_zero_chunk_size_uses_default() {
        assert_eq!(chunk_count(DEFAULT_CHUNK_SIZE * 2, 0), 2);
        assert_eq!(effective_chunk_size(usize::MAX), MAX_CHUNK_SIZE);
    }

    #[test]
    fn range_past_end_is_empty() {
        assert_eq!(chunk_range(10, 4, 9), 10..10);
        assert_eq!(chunk_range(10, 4, u64::MAX), 10..10);
    }

    #[test]
    fn reassemble_out_of_order() {
        let data = blob(100);
        let mut chunks = split_into_chunks(&data, 30);
        chunks.reverse();
        let mut r = Reassembler::new();
        let mut done = false;
        for c in chunks {
            done = r.insert(c).unwrap();
        }
        assert!(done);
        assert_eq!(r.into_bytes().unwrap(), data);
    }

    #[test]
    fn duplicate_chunk_is_idempotent() {
        let data = blob(50);
        let chunks = split_into_chunks(&data, 25);
        let mut r = Reassembler::new();
        assert!(!r.insert(chunks[0].clone()).unwrap());
        assert!(!r.insert(chunks[0].clone()).unwrap());
        assert!(r.insert(chunks[1].clone()).unwrap());
        assert_eq!(r.into_bytes().unwrap(), data);
    }

    #[test]
    fn incomplete_yields_nothing() {
        let chunks = split_into_chunks(&blob(90), 30);
        let mut r = Reassembler::new();
        r.insert(chunks[2].clone()).unwrap();
        r.insert(chunks[0].clone()).unwrap();
        assert!(!r.is_complete());
        assert!(r.into_bytes().is_none());
    }

    #[test]
    fn chunk_past_last_rejected() {
        let mut r = Reassembler::new();
        r.insert(Chunk {
            ordinal: 1,
            bytes: vec![1],
            is_last: true,
        })
        .unwrap();
        let err = r
            .insert(Chunk {
                ordinal: 5,
                bytes: vec![1],
                is_last: false,
            })
            .unwrap_err();
        assert_eq!(err, ReassemblyError::PastLast { ordinal: 5, last: 1 });
    }

    #[test]
    fn late_last_below_received_rejected() {
        let mut r = Reassembler::new();
        r.insert(Chunk {
            ordinal: 4,
            bytes: vec![1],
            is_last: false,
        })
        .unwrap();
        assert!(r
            .insert(Chunk {
                ordinal: 2,
                bytes: vec![1],
                is_last: true,
            })
            .is_err());
    }

    #[test]
    fn conflicting_last_rejected() {
        let mut r = Reassembler::new();
        r.insert(Chunk {
            ordinal: 3,
            bytes: vec![],
            is_last: true,
        })
        .unwrap();
        assert!(matches!(
            r.insert(Chunk {
                ordinal: 4,
                bytes: vec![],
                is_last: true,
            }),
            Err(ReassemblyError::ConflictingLast { first: 3, second: 4 })
        ));
    }

    #[test]
    fn highest_possible_ordinal_rejected() {
        let mut r = Reassembler::new();
        let err = r
            .insert(Chunk {
                ordinal: u64::MAX,
                bytes: vec![1],
                is_last: true,
            })
            .unwrap_err();
        assert!(matches!(err, ReassemblyError::OutOfRange { ordinal: u64::MAX, .. }));
        assert!(!r.is_complete());
    }

    #[test]
    fn ordinal_beyond_limit_rejected() {
        let mut r = Reassembler::with_limit(4);
        r.insert(Chunk {
            ordinal: 3,
            bytes: vec![1],
            is_last: false,
        })
        .unwrap();
        assert_eq!(
            r.insert(Chunk {
                ordinal: 4,
                bytes: vec![1],
                is_last: false,
            }),
            Err(ReassemblyError::OutOfRange { ordinal: 4, limit: 4 })
        );
    }

    proptest! {
        /// Any chunk size, any arrival order: reassembly reproduces the blob.
        #[test]
        fn split_then_reassemble_any_order(
            data in prop::collection::vec(any::<u8>(), 0..2048),
            chunk_size in 1usize..300,
            seed in any::<u64>(),
        ) {
            let mut chunks = split_into_chunks(&data, chunk_size);
            let n = chunks.len();
            for i in 0..n {
                let j = (seed.wrapping_mul(i as u64 + 1) % n as u64) as usize;
                chunks.swap(i, j);
            }
            let mut r = Reassembler::new();
            for c in chunks {
                r.insert(c).unwrap();
            }
            prop_assert_eq!(r.into_bytes().unwrap(), data);
        }
    }
}
