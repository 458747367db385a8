//! Shared test utilities: tracing setup, loopback node config, an in-memory blob source, a
//! scripted peer and a polling wait helper.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hoard_core::chunk;
use hoard_core::handshake::{Role, CONFIRM_NONCE};
use hoard_core::identity::{decrypt_wire, encrypt_wire};
use hoard_core::{wire, ContentId, DeviceId, Envelope, Keypair, Message};
use tokio::net::{TcpListener, TcpStream};

use crate::config::NodeConfig;
use crate::session::{read_sealed, run_handshake, write_sealed, Blob, BlobSource};

/// Poll interval for [`wait_until`].
const POLL_INTERVAL_MS: u64 = 10;

/// Give up on [`wait_until`] after this long.
const WAIT_TIMEOUT_SECS: u64 = 5;

/// Initialise a tracing subscriber for tests.
///
/// Respects `RUST_LOG`, defaults to `hoard_node=debug`. Safe to call more than once.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hoard_node=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Loopback node on an ephemeral port with short timeouts and small chunks.
pub fn test_config() -> NodeConfig {
    NodeConfig {
        listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        chunk_size: 1024,
        connect_timeout_ms: 500,
        handshake_timeout_ms: 1_000,
        query_timeout_ms: 1_000,
        bootstrap_backoff_ms: 20,
        ..NodeConfig::default()
    }
}

/// Fixed set of blobs served to peers.
#[derive(Default)]
pub struct MapSource {
    blobs: Mutex<HashMap<ContentId, Blob>>,
}

impl MapSource {
    pub fn with(blobs: &[&[u8]]) -> Self {
        let source = Self::default();
        for blob in blobs {
            source.insert(blob);
        }
        source
    }

    pub fn insert(&self, blob: &[u8]) -> ContentId {
        let id = ContentId::of(blob);
        self.blobs
            .lock()
            .unwrap()
            .insert(id, Blob::from(blob));
        id
    }
}

impl BlobSource for MapSource {
    fn lookup(&self, id: &ContentId) -> Option<Blob> {
        self.blobs.lock().unwrap().get(id).cloned()
    }
}

/// How a [`ScriptedPeer`] answers one `Want`.
#[derive(Debug, Clone, Default)]
pub struct Answer {
    pub delay: Duration,
    pub messages: Vec<Message>,
    pub hang_up: bool,
}

impl Answer {
    /// Never reply.
    pub fn silent() -> Self {
        Self::default()
    }

    /// Close the connection without replying.
    pub fn hang_up() -> Self {
        Self {
            hang_up: true,
            ..Self::default()
        }
    }

    pub fn send(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    /// Every chunk of `blob` at `chunk_size`, ignoring credit.
    pub fn blob(blob: &[u8], chunk_size: usize) -> Self {
        let id = ContentId::of(blob);
        let messages = (0..chunk::chunk_count(blob.len(), chunk_size))
            .map(|ordinal| {
                let c = chunk::chunk_at(blob, chunk_size, ordinal);
                Message::Chunk {
                    content_id: id,
                    ordinal: c.ordinal,
                    payload: c.bytes,
                    is_last: c.is_last,
                }
            })
            .collect();
        Self::send(messages)
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn then_hang_up(mut self) -> Self {
        self.hang_up = true;
        self
    }
}

/// Peer that completes the real handshake, then answers every `Want` from a script instead
/// of a blob table.
pub struct ScriptedPeer {
    pub addr: SocketAddr,
    pub device_id: DeviceId,
}

impl ScriptedPeer {
    pub async fn start<F>(script: F) -> Self
    where
        F: Fn(ContentId) -> Answer + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let keypair = Arc::new(Keypair::generate());
        let device_id = keypair.device_id();
        let script = Arc::new(script);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(run_script(stream, keypair.clone(), script.clone()));
            }
        });
        Self { addr, device_id }
    }
}

async fn run_script<F>(mut stream: TcpStream, keypair: Arc<Keypair>, script: Arc<F>)
where
    F: Fn(ContentId) -> Answer,
{
    let Ok((_, keys)) = run_handshake(&mut stream, &keypair, Role::Responder).await else {
        return;
    };
    let mut recv_nonce = CONFIRM_NONCE + 1;
    let mut send_nonce = CONFIRM_NONCE + 1;
    while let Ok(sealed) = read_sealed(&mut stream).await {
        let plain = decrypt_wire(&keys.recv, recv_nonce, &sealed).unwrap();
        recv_nonce += 1;
        let (env, _) = wire::decode_frame(&plain).unwrap();
        let Message::Want { content_id, .. } = env.message else {
            continue;
        };
        let answer = script(content_id);
        tokio::time::sleep(answer.delay).await;
        for message in answer.messages {
            let plain = wire::encode_frame(&Envelope {
                stream_id: env.stream_id,
                message,
            })
            .unwrap();
            let sealed = encrypt_wire(&keys.send, send_nonce, &plain).unwrap();
            send_nonce += 1;
            if write_sealed(&mut stream, &sealed).await.is_err() {
                return;
            }
        }
        if answer.hang_up {
            return;
        }
    }
}

/// Poll `check` until it returns true. Panics after a few seconds.
pub async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(WAIT_TIMEOUT_SECS);
    while !check().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within {WAIT_TIMEOUT_SECS}s"
        );
        tokio::time::sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
    }
}
