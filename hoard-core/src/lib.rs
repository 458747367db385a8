//! Hoard protocol library.
//! I/O-free: content addressing, identity, handshake, wire framing, chunking. The node crate
//! does the networking.

pub mod address;
pub mod chunk;
pub mod handshake;
pub mod identity;
pub mod integrity;
pub mod protocol;
pub mod wire;

pub use address::{hash, ContentId, ParseContentIdError};
pub use chunk::{Chunk, Reassembler, DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE};
pub use identity::{DeviceId, Keypair, PublicKey};
pub use integrity::{verify_blob, IntegrityMismatch};
pub use protocol::{Envelope, Message, StreamId, PROTOCOL_VERSION};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
