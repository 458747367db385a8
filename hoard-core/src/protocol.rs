//! Hoard wire protocol: message types and version.

use serde::{Deserialize, Serialize};

use crate::address::ContentId;

/// Current protocol version. Sent in the handshake hello.
pub const PROTOCOL_VERSION: u8 = 1;

/// Logical stream inside a session. Dialing side uses odd ids, accepting side even ids.
pub type StreamId = u32;

/// One multiplexed frame: which logical stream it belongs to, and the message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub stream_id: StreamId,
    pub message: Message,
}

/// All wire message types. Encoding is bincode; framing is length-prefix (see wire module).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Opens a stream: "do you have this blob?" Chunks must not exceed `max_chunk_size`, and
    /// at most `window` of them may be sent before the requester grants more with `Credit`.
    Want {
        content_id: ContentId,
        max_chunk_size: u32,
        window: u32,
    },
    /// One slice of the blob. `is_last` marks the highest ordinal.
    Chunk {
        content_id: ContentId,
        ordinal: u64,
        payload: Vec<u8>,
        is_last: bool,
    },
    /// The peer does not hold the blob. Closes the stream.
    DontHave { content_id: ContentId },
    /// Requester consumed `chunks` more chunks; the responder may send that many more.
    Credit { chunks: u32 },
    /// Requester abandoned the stream; responder stops sending.
    Cancel,
}

impl Message {
    /// Short name for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Want { .. } => "want",
            Message::Chunk { .. } => "chunk",
            Message::DontHave { .. } => "dont-have",
            Message::Credit { .. } => "credit",
            Message::Cancel => "cancel",
        }
    }
}
