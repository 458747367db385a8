//! Transport sessions: TCP connect, handshake, encrypted frames multiplexed into logical streams.
//!
//! Each session runs one reader task and one writer task. The writer drains a control queue
//! (stream opens, cancels, credits, refusals) ahead of a bounded data queue (chunks), so a
//! large transfer on one stream cannot starve requests on the others. The reader routes
//! replies to the [`LogicalStream`] that asked and serves `Want` requests from the local
//! [`BlobSource`].
//!
//! Reply streams are flow controlled per stream: a requester announces a window of chunks in
//! `Want` and grants more with `Credit` as it consumes them. A serving task waits for credit,
//! so an idle consumer holds at most one window of chunks and never blocks the reader.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use hoard_core::chunk::{self, effective_chunk_size};
use hoard_core::handshake::{self, Handshake, HandshakeError, Hello, Role, SessionKeys, HELLO_LEN};
use hoard_core::identity::{decrypt_wire, encrypt_wire};
use hoard_core::wire::{self, LEN_SIZE, MAX_FRAME_LEN};
use hoard_core::{ContentId, DeviceId, Envelope, Keypair, Message, StreamId};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::AbortHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::discovery::PeerAddress;
use crate::error::ConnectError;
use crate::table::SessionTable;

/// Chunk frames queued per session before serving tasks wait for the socket.
const DATA_QUEUE_DEPTH: usize = 16;

/// Chunks a requester lets a peer send ahead of consumption.
pub const STREAM_WINDOW: u32 = 32;

/// Largest window (initial plus granted credit) a serving task honors.
const MAX_STREAM_WINDOW: u32 = 256;

/// Largest sealed frame: plaintext frame + Poly1305 tag.
const MAX_SEALED_LEN: usize = LEN_SIZE + MAX_FRAME_LEN as usize + 16;

/// Shared, immutable blob bytes.
pub type Blob = Arc<[u8]>;

/// Blobs this node hands out to peers. Implemented by the local blob table.
pub trait BlobSource: Send + Sync + 'static {
    fn lookup(&self, id: &ContentId) -> Option<Blob>;
}

/// Timeouts and sizes every session is opened with.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Bound on a single frame write.
    pub write_timeout: Duration,
    /// Largest chunk this node serves.
    pub chunk_size: usize,
}

/// The session was closed before the operation could be queued.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("session closed")]
pub struct SessionClosed;

#[derive(Debug, thiserror::Error)]
pub(crate) enum HandshakeFailure {
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Protocol(#[from] HandshakeError),
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A peer-opened stream being answered.
struct Serving {
    task: AbortHandle,
    credit: Arc<Semaphore>,
}

/// Open logical streams of one session.
#[derive(Default)]
struct StreamTable {
    /// Streams we opened, keyed to the handle waiting for replies.
    outbound: Mutex<HashMap<StreamId, mpsc::Sender<Message>>>,
    /// Streams the peer opened, keyed to the task serving them.
    inbound: Mutex<HashMap<StreamId, Serving>>,
}

impl StreamTable {
    fn len(&self) -> usize {
        lock(&self.outbound).len() + lock(&self.inbound).len()
    }

    /// Drop every reply channel (waiters see end-of-stream) and stop every serving task.
    fn close_all(&self) {
        lock(&self.outbound).clear();
        for (_, serving) in lock(&self.inbound).drain() {
            serving.task.abort();
        }
    }
}

/// A live authenticated connection to one peer.
pub struct Session {
    id: Uuid,
    peer: DeviceId,
    local: DeviceId,
    remote_addr: SocketAddr,
    role: Role,
    transcript: [u8; 32],
    control: mpsc::UnboundedSender<Envelope>,
    streams: Arc<StreamTable>,
    next_stream: AtomicU32,
    tasks: Mutex<Vec<AbortHandle>>,
}

impl Session {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn peer(&self) -> DeviceId {
        self.peer
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Device that dialed this connection.
    pub fn initiator(&self) -> DeviceId {
        match self.role {
            Role::Initiator => self.local,
            Role::Responder => self.peer,
        }
    }

    /// Ordering both ends agree on for duplicate sessions to the same peer; smaller is kept.
    pub fn preference(&self) -> (DeviceId, [u8; 32]) {
        (self.initiator(), self.transcript)
    }

    /// The writer has stopped; nothing more can be sent.
    pub fn is_closed(&self) -> bool {
        self.control.is_closed()
    }

    /// Logical streams currently open in either direction.
    pub fn open_streams(&self) -> usize {
        self.streams.len()
    }

    /// Allocate a new logical stream. Nothing is sent until [`LogicalStream::send`]. The
    /// reply queue holds [`STREAM_WINDOW`] messages; a peer that sends more than the window
    /// it was granted loses the stream.
    pub fn open_stream(&self) -> Result<LogicalStream, SessionClosed> {
        if self.is_closed() {
            return Err(SessionClosed);
        }
        let id = self.next_stream.fetch_add(2, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(STREAM_WINDOW as usize);
        lock(&self.streams.outbound).insert(id, tx);
        Ok(LogicalStream {
            id,
            peer: self.peer,
            replies: rx,
            control: self.control.clone(),
            streams: self.streams.clone(),
            finished: false,
        })
    }

    /// Tear the connection down: stop both tasks and release every stream.
    pub fn close(&self) {
        self.streams.close_all();
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("remote_addr", &self.remote_addr)
            .field("role", &self.role)
            .finish()
    }
}

/// One request/response exchange inside a session. Dropping it before the peer finished
/// sends `Cancel` and releases the stream slot; the session itself stays up.
pub struct LogicalStream {
    id: StreamId,
    peer: DeviceId,
    replies: mpsc::Receiver<Message>,
    control: mpsc::UnboundedSender<Envelope>,
    streams: Arc<StreamTable>,
    finished: bool,
}

impl LogicalStream {
    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn peer(&self) -> DeviceId {
        self.peer
    }

    pub fn send(&self, message: Message) -> Result<(), SessionClosed> {
        self.control
            .send(Envelope {
                stream_id: self.id,
                message,
            })
            .map_err(|_| SessionClosed)
    }

    /// Next reply from the peer. `None` once the session is gone.
    pub async fn recv(&mut self) -> Option<Message> {
        self.replies.recv().await
    }

    /// The peer completed the exchange; release the slot without cancelling.
    pub fn finish(&mut self) {
        self.finished = true;
        lock(&self.streams.outbound).remove(&self.id);
    }
}

impl Drop for LogicalStream {
    fn drop(&mut self) {
        lock(&self.streams.outbound).remove(&self.id);
        if !self.finished {
            let _ = self.control.send(Envelope {
                stream_id: self.id,
                message: Message::Cancel,
            });
        }
    }
}

/// Opens and accepts sessions and registers them in the session table.
pub struct TransportSession {
    keypair: Arc<Keypair>,
    table: Arc<SessionTable>,
    source: Arc<dyn BlobSource>,
    settings: SessionSettings,
}

impl TransportSession {
    pub fn new(
        keypair: Arc<Keypair>,
        table: Arc<SessionTable>,
        source: Arc<dyn BlobSource>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            keypair,
            table,
            source,
            settings,
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Connect, authenticate and register a session with the peer at `address`.
    /// Returns the already-registered session if one exists for that address or peer.
    pub async fn open(&self, address: &PeerAddress) -> Result<Arc<Session>, ConnectError> {
        let label = address.to_string();
        let unreachable = |reason: String| ConnectError::Unreachable {
            addr: label.clone(),
            reason,
        };
        let addrs = match timeout(self.settings.connect_timeout, address.resolve()).await {
            Ok(Ok(addrs)) if !addrs.is_empty() => addrs,
            Ok(Ok(_)) => return Err(unreachable("no addresses resolved".into())),
            Ok(Err(e)) => return Err(unreachable(e.to_string())),
            Err(_) => return Err(unreachable("resolve timed out".into())),
        };
        for addr in &addrs {
            if let Some(existing) = self.table.find_by_addr(*addr).await {
                return Ok(existing);
            }
        }
        if let Some(peer) = address.expected_peer() {
            if let Some(existing) = self.table.get(&peer).await {
                return Ok(existing);
            }
        }

        let mut last_err = String::new();
        let mut connected = None;
        for addr in &addrs {
            match timeout(self.settings.connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    connected = Some((stream, *addr));
                    break;
                }
                Ok(Err(e)) => last_err = e.to_string(),
                Err(_) => {
                    last_err = format!(
                        "connect timed out after {:?}",
                        self.settings.connect_timeout
                    )
                }
            }
        }
        let Some((mut stream, remote)) = connected else {
            return Err(unreachable(last_err));
        };
        let _ = stream.set_nodelay(true);

        let (hello, keys) = self.handshake(&mut stream, Role::Initiator, &label).await?;
        if let Some(expected) = address.expected_peer() {
            if expected != hello.device_id {
                return Err(ConnectError::HandshakeFailed {
                    addr: label,
                    reason: format!("expected peer {expected}, got {}", hello.device_id),
                });
            }
        }
        let session = self
            .register(stream, remote, hello.device_id, Role::Initiator, keys)
            .await;
        info!(peer = %session.peer(), addr = %remote, "session opened");
        Ok(session)
    }

    /// Run the responder side of the handshake on an accepted connection.
    pub async fn accept(
        &self,
        mut stream: TcpStream,
        remote: SocketAddr,
    ) -> Result<Arc<Session>, ConnectError> {
        let _ = stream.set_nodelay(true);
        let (hello, keys) = self
            .handshake(&mut stream, Role::Responder, &remote.to_string())
            .await?;
        let session = self
            .register(stream, remote, hello.device_id, Role::Responder, keys)
            .await;
        info!(peer = %session.peer(), addr = %remote, "session accepted");
        Ok(session)
    }

    async fn handshake(
        &self,
        stream: &mut TcpStream,
        role: Role,
        label: &str,
    ) -> Result<(Hello, SessionKeys), ConnectError> {
        let failed = |reason: String| ConnectError::HandshakeFailed {
            addr: label.to_string(),
            reason,
        };
        match timeout(
            self.settings.handshake_timeout,
            run_handshake(stream, &self.keypair, role),
        )
        .await
        {
            Ok(Ok(done)) => Ok(done),
            Ok(Err(e)) => Err(failed(e.to_string())),
            Err(_) => Err(failed(format!(
                "timed out after {:?}",
                self.settings.handshake_timeout
            ))),
        }
    }

    /// Start the session tasks and insert into the table. If the table already holds the
    /// preferred session for this peer, the new one is closed and the existing one returned.
    async fn register(
        &self,
        stream: TcpStream,
        remote: SocketAddr,
        peer: DeviceId,
        role: Role,
        keys: SessionKeys,
    ) -> Arc<Session> {
        let (read_half, write_half) = stream.into_split();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (data_tx, data_rx) = mpsc::channel(DATA_QUEUE_DEPTH);
        let streams = Arc::new(StreamTable::default());
        let first_stream = match role {
            Role::Initiator => 1,
            Role::Responder => 2,
        };
        let session = Arc::new(Session {
            id: Uuid::new_v4(),
            peer,
            local: self.keypair.device_id(),
            remote_addr: remote,
            role,
            transcript: keys.transcript,
            control: control_tx,
            streams: streams.clone(),
            next_stream: AtomicU32::new(first_stream),
            tasks: Mutex::new(Vec::new()),
        });

        let writer = tokio::spawn(write_loop(
            write_half,
            keys.send,
            control_rx,
            data_rx,
            self.settings.write_timeout,
            streams,
            peer,
        ));
        let reader = tokio::spawn(read_loop(Reader {
            half: read_half,
            key: keys.recv,
            session: session.clone(),
            data: data_tx,
            source: self.source.clone(),
            chunk_size: self.settings.chunk_size,
            table: Arc::downgrade(&self.table),
        }));
        lock(&session.tasks).extend([writer.abort_handle(), reader.abort_handle()]);

        let kept = self.table.insert(session.clone()).await;
        if kept.id() != session.id() {
            debug!(peer = %peer, "duplicate session, keeping existing");
            session.close();
        }
        kept
    }
}

pub(crate) async fn run_handshake(
    stream: &mut TcpStream,
    keypair: &Keypair,
    role: Role,
) -> Result<(Hello, SessionKeys), HandshakeFailure> {
    let hs = Handshake::new(keypair, role);
    let ours = hs.hello().to_bytes();
    let mut theirs = [0u8; HELLO_LEN];
    match role {
        Role::Initiator => {
            stream.write_all(&ours).await?;
            stream.flush().await?;
            stream.read_exact(&mut theirs).await?;
        }
        Role::Responder => {
            stream.read_exact(&mut theirs).await?;
            stream.write_all(&ours).await?;
            stream.flush().await?;
        }
    }
    let peer = Hello::from_bytes(&theirs)?;
    let keys = hs.finish(&peer)?;
    write_sealed(stream, &handshake::confirmation(&keys)?).await?;
    let confirm = read_sealed(stream).await?;
    handshake::verify_confirmation(&keys, &confirm)?;
    Ok((peer, keys))
}

pub(crate) async fn write_sealed<W: AsyncWrite + Unpin>(
    w: &mut W,
    sealed: &[u8],
) -> std::io::Result<()> {
    let len = u32::try_from(sealed.len())
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "frame too large"))?;
    w.write_all(&len.to_le_bytes()).await?;
    w.write_all(sealed).await?;
    w.flush().await
}

pub(crate) async fn read_sealed<R: AsyncRead + Unpin>(r: &mut R) -> std::io::Result<Vec<u8>> {
    let mut len_buf = [0u8; LEN_SIZE];
    r.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_SEALED_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "frame too large",
        ));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn write_loop(
    mut half: OwnedWriteHalf,
    key: [u8; 32],
    mut control: mpsc::UnboundedReceiver<Envelope>,
    mut data: mpsc::Receiver<Envelope>,
    write_timeout: Duration,
    streams: Arc<StreamTable>,
    peer: DeviceId,
) {
    let mut nonce: u64 = handshake::CONFIRM_NONCE + 1;
    loop {
        let env = tokio::select! {
            biased;
            Some(env) = control.recv() => env,
            Some(env) = data.recv() => env,
            else => break,
        };
        trace!(peer = %peer, stream = env.stream_id, kind = env.message.kind(), "send");
        let sealed = match wire::encode_frame(&env)
            .map_err(|e| e.to_string())
            .and_then(|plain| encrypt_wire(&key, nonce, &plain).map_err(|e| e.to_string()))
        {
            Ok(sealed) => sealed,
            Err(e) => {
                warn!(peer = %peer, error = %e, "dropping unencodable frame");
                continue;
            }
        };
        nonce += 1;
        match timeout(write_timeout, write_sealed(&mut half, &sealed)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(peer = %peer, error = %e, "session write failed");
                break;
            }
            Err(_) => {
                warn!(peer = %peer, "session write timed out");
                break;
            }
        }
    }
    streams.close_all();
}

struct Reader {
    half: OwnedReadHalf,
    key: [u8; 32],
    session: Arc<Session>,
    data: mpsc::Sender<Envelope>,
    source: Arc<dyn BlobSource>,
    chunk_size: usize,
    table: Weak<SessionTable>,
}

async fn read_loop(mut r: Reader) {
    let peer = r.session.peer();
    let mut nonce: u64 = handshake::CONFIRM_NONCE + 1;
    let reason = loop {
        let sealed = match read_sealed(&mut r.half).await {
            Ok(sealed) => sealed,
            Err(e) => break e.to_string(),
        };
        let plain = match decrypt_wire(&r.key, nonce, &sealed) {
            Ok(plain) => plain,
            Err(e) => break e.to_string(),
        };
        nonce += 1;
        match wire::decode_frame(&plain) {
            Ok((env, _)) => r.dispatch(env),
            Err(e) => break e.to_string(),
        }
    };
    debug!(peer = %peer, reason = %reason, "session reader stopped");
    if let Some(table) = r.table.upgrade() {
        table.remove(&peer, r.session.id()).await;
    }
    info!(peer = %peer, "session closed");
    r.session.close();
}

impl Reader {
    fn dispatch(&self, env: Envelope) {
        let stream_id = env.stream_id;
        let peer = self.session.peer();
        trace!(peer = %peer, stream = stream_id, kind = env.message.kind(), "recv");
        match env.message {
            Message::Want {
                content_id,
                max_chunk_size,
                window,
            } => self.serve(stream_id, content_id, max_chunk_size, window),
            Message::Credit { chunks } => {
                if let Some(serving) = lock(&self.session.streams.inbound).get(&stream_id) {
                    let held = serving.credit.available_permits();
                    let room = (MAX_STREAM_WINDOW as usize).saturating_sub(held);
                    serving.credit.add_permits((chunks as usize).min(room));
                }
            }
            Message::Cancel => {
                if let Some(serving) = lock(&self.session.streams.inbound).remove(&stream_id) {
                    debug!(peer = %peer, stream = stream_id, "stream cancelled by peer");
                    serving.task.abort();
                }
            }
            reply => {
                let mut outbound = lock(&self.session.streams.outbound);
                let overrun = match outbound.get(&stream_id) {
                    Some(tx) => matches!(tx.try_send(reply), Err(TrySendError::Full(_))),
                    None => false,
                };
                if overrun {
                    warn!(peer = %peer, stream = stream_id, "peer overran stream window");
                    outbound.remove(&stream_id);
                }
            }
        }
    }

    /// Streams the peer may open: odd if it dialed, even if it accepted.
    fn peer_opened(&self, stream_id: StreamId) -> bool {
        let peer_parity = match self.session.role {
            Role::Initiator => 0,
            Role::Responder => 1,
        };
        stream_id % 2 == peer_parity
    }

    fn serve(&self, stream_id: StreamId, content_id: ContentId, max_chunk_size: u32, window: u32) {
        let peer = self.session.peer();
        if !self.peer_opened(stream_id) {
            warn!(peer = %peer, stream = stream_id, "want on a stream id the peer cannot open");
            return;
        }
        let mut inbound = lock(&self.session.streams.inbound);
        if inbound.contains_key(&stream_id) {
            warn!(peer = %peer, stream = stream_id, "want on a stream already being served");
            return;
        }
        let chunk_size = effective_chunk_size(self.chunk_size.min(max_chunk_size as usize));
        let credit = Arc::new(Semaphore::new(window.clamp(1, MAX_STREAM_WINDOW) as usize));
        let data = self.data.clone();
        let source = self.source.clone();
        let streams = self.session.streams.clone();
        let request = ServeRequest {
            stream_id,
            content_id,
            chunk_size,
            credit: credit.clone(),
        };
        let task = tokio::spawn(async move {
            serve_want(data, source, request, peer).await;
            lock(&streams.inbound).remove(&stream_id);
        });
        inbound.insert(
            stream_id,
            Serving {
                task: task.abort_handle(),
                credit,
            },
        );
    }
}

/// A `Want` accepted for serving.
struct ServeRequest {
    stream_id: StreamId,
    content_id: ContentId,
    chunk_size: usize,
    credit: Arc<Semaphore>,
}

async fn serve_want(
    data: mpsc::Sender<Envelope>,
    source: Arc<dyn BlobSource>,
    request: ServeRequest,
    peer: DeviceId,
) {
    let ServeRequest {
        stream_id,
        content_id,
        chunk_size,
        credit,
    } = request;
    let Some(blob) = source.lookup(&content_id) else {
        debug!(peer = %peer, content_id = %content_id, "not held, refusing");
        let _ = data
            .send(Envelope {
                stream_id,
                message: Message::DontHave { content_id },
            })
            .await;
        return;
    };
    debug!(peer = %peer, content_id = %content_id, len = blob.len(), "serving blob");
    for ordinal in 0..chunk::chunk_count(blob.len(), chunk_size) {
        match credit.acquire().await {
            Ok(permit) => permit.forget(),
            Err(_) => return,
        }
        let c = chunk::chunk_at(&blob, chunk_size, ordinal);
        let env = Envelope {
            stream_id,
            message: Message::Chunk {
                content_id,
                ordinal,
                payload: c.bytes,
                is_last: c.is_last,
            },
        };
        if data.send(env).await.is_err() {
            return;
        }
    }
}
