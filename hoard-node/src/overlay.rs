//! Overlay node: the session table, the accept loop, and peer queries.
//!
//! A query sends `Want` on a fresh stream of every eligible session at once. The first
//! peer to answer with a chunk wins and every other request is aborted, which drops its
//! stream and sends `Cancel`. `DontHave` answers are ignored; a session that dies during
//! the race is dropped from the table and the race goes on without it.

use std::collections::{BTreeSet, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use hoard_core::chunk::{ReassemblyError, MAX_ORDINALS};
use hoard_core::integrity::PeerTrustTracker;
use hoard_core::{Chunk, ContentId, DeviceId, Keypair, Message, Reassembler};
use tokio::net::TcpListener;
use tokio::task::{AbortHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::error::{NodeError, RetrievalError};
use crate::session::{
    BlobSource, LogicalStream, Session, SessionSettings, TransportSession, STREAM_WINDOW,
};
use crate::table::SessionTable;

/// Pause after a failed accept (e.g. out of file descriptors).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// This process's presence in the network.
pub struct OverlayNode {
    keypair: Arc<Keypair>,
    table: Arc<SessionTable>,
    transport: Arc<TransportSession>,
    trust: Mutex<PeerTrustTracker>,
    max_integrity_failures: u32,
    query_timeout: Duration,
    chunk_size: usize,
    max_blob_bytes: Option<usize>,
    listener: Mutex<Option<AbortHandle>>,
}

impl OverlayNode {
    pub fn new(keypair: Arc<Keypair>, source: Arc<dyn BlobSource>, config: &NodeConfig) -> Self {
        let table = Arc::new(SessionTable::new());
        let settings = SessionSettings {
            connect_timeout: config.connect_timeout(),
            handshake_timeout: config.handshake_timeout(),
            write_timeout: config.query_timeout(),
            chunk_size: config.chunk_size,
        };
        let transport = Arc::new(TransportSession::new(
            keypair.clone(),
            table.clone(),
            source,
            settings,
        ));
        Self {
            keypair,
            table,
            transport,
            trust: Mutex::new(PeerTrustTracker::new()),
            max_integrity_failures: config.max_integrity_failures,
            query_timeout: config.query_timeout(),
            chunk_size: config.chunk_size,
            max_blob_bytes: config.max_blob_bytes,
            listener: Mutex::new(None),
        }
    }

    pub fn device_id(&self) -> DeviceId {
        self.keypair.device_id()
    }

    pub fn transport(&self) -> &Arc<TransportSession> {
        &self.transport
    }

    pub fn sessions(&self) -> &Arc<SessionTable> {
        &self.table
    }

    pub fn query_timeout(&self) -> Duration {
        self.query_timeout
    }

    fn trust(&self) -> MutexGuard<'_, PeerTrustTracker> {
        self.trust.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind `addr` and accept sessions until shutdown. Returns the bound address.
    pub async fn listen(&self, addr: SocketAddr) -> Result<SocketAddr, NodeError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| NodeError::Bind { addr, source })?;
        let local = listener
            .local_addr()
            .map_err(|source| NodeError::Bind { addr, source })?;
        let transport = self.transport.clone();
        let task = tokio::spawn(async move {
            loop {
                let (stream, remote) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                };
                let transport = transport.clone();
                tokio::spawn(async move {
                    if let Err(e) = transport.accept(stream, remote).await {
                        warn!(addr = %remote, error = %e, "inbound session rejected");
                    }
                });
            }
        });
        if let Some(old) = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task.abort_handle())
        {
            old.abort();
        }
        info!(addr = %local, device_id = %self.device_id(), "listening");
        Ok(local)
    }

    /// Record a blob from `peer` that failed verification.
    pub fn record_integrity_failure(&self, peer: DeviceId) {
        let mut trust = self.trust();
        trust.record_failure(peer);
        if trust.is_isolated(&peer, self.max_integrity_failures) {
            let failures = trust.failure_count(&peer);
            warn!(peer = %peer, failures, "peer isolated from queries");
        }
    }

    pub fn is_isolated(&self, peer: &DeviceId) -> bool {
        self.trust().is_isolated(peer, self.max_integrity_failures)
    }

    /// Race `Want` across every live, trusted session not in `exclude`. Returns the first
    /// peer that starts sending the blob, or `None` if none does within the query timeout.
    pub async fn open_query(
        &self,
        id: ContentId,
        exclude: &HashSet<DeviceId>,
    ) -> Option<PeerStream> {
        let sessions: Vec<_> = self
            .table
            .snapshot()
            .await
            .into_iter()
            .filter(|s| !exclude.contains(&s.peer()) && !self.is_isolated(&s.peer()))
            .collect();
        if sessions.is_empty() {
            debug!(content_id = %id, "no peers to ask");
            return None;
        }
        debug!(content_id = %id, peers = sessions.len(), "querying peers");

        let limits = StreamLimits {
            max_chunk_size: self.chunk_size,
            max_blob_bytes: self.max_blob_bytes,
            idle_timeout: self.query_timeout,
        };
        let mut race = JoinSet::new();
        for session in sessions {
            race.spawn(ask(session, id, limits));
        }
        let deadline = tokio::time::sleep(self.query_timeout);
        tokio::pin!(deadline);
        loop {
            let joined = tokio::select! {
                joined = race.join_next() => joined,
                _ = &mut deadline => {
                    debug!(content_id = %id, timeout = ?self.query_timeout, "query timed out");
                    return None;
                }
            };
            match joined {
                None => {
                    debug!(content_id = %id, "no peer holds blob");
                    return None;
                }
                Some(Ok(Ok(stream))) => {
                    debug!(content_id = %id, peer = %stream.peer(), "peer answered first");
                    race.abort_all();
                    return Some(stream);
                }
                Some(Ok(Err(Refusal::DontHave))) => {}
                Some(Ok(Err(Refusal::Lost(session)))) => self.drop_session(&session).await,
                Some(Ok(Err(Refusal::Invalid { peer, reason }))) => {
                    warn!(peer = %peer, content_id = %id, reason = %reason, "ignoring bad answer");
                }
                Some(Err(e)) => warn!(error = %e, "query task failed"),
            }
        }
    }

    /// Fetch the whole blob from the first peer that has it. A peer that fails mid-transfer
    /// is skipped and the remaining peers are asked again. Bytes are not verified here.
    pub async fn query_peers(&self, id: ContentId) -> Option<(DeviceId, Vec<u8>)> {
        let mut tried = HashSet::new();
        while let Some(stream) = self.open_query(id, &tried).await {
            let peer = stream.peer();
            match stream.read_to_end().await {
                Ok(bytes) => return Some((peer, bytes)),
                Err(e) => {
                    warn!(
                        peer = %peer,
                        content_id = %id,
                        error = %e,
                        "transfer failed, trying other peers"
                    );
                    tried.insert(peer);
                }
            }
        }
        None
    }

    async fn drop_session(&self, session: &Session) {
        warn!(peer = %session.peer(), "session lost during query");
        self.table.remove(&session.peer(), session.id()).await;
        session.close();
    }

    /// Stop accepting and close every session.
    pub async fn shutdown(&self) {
        if let Some(listener) = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            listener.abort();
        }
        for session in self.table.drain().await {
            session.close();
        }
        info!("overlay stopped");
    }
}

enum Refusal {
    DontHave,
    Lost(Arc<Session>),
    Invalid { peer: DeviceId, reason: String },
}

/// Bounds a [`PeerStream`] holds its peer to.
#[derive(Debug, Clone, Copy)]
struct StreamLimits {
    max_chunk_size: usize,
    max_blob_bytes: Option<usize>,
    idle_timeout: Duration,
}

impl StreamLimits {
    /// Every chunk but an empty blob's only chunk carries a byte, so a blob of at most
    /// `max_blob_bytes` has at most that many ordinals.
    fn max_ordinals(&self) -> u64 {
        match self.max_blob_bytes {
            Some(limit) => (limit as u64).max(1),
            None => MAX_ORDINALS,
        }
    }
}

async fn ask(
    session: Arc<Session>,
    id: ContentId,
    limits: StreamLimits,
) -> Result<PeerStream, Refusal> {
    let peer = session.peer();
    let Ok(mut stream) = session.open_stream() else {
        return Err(Refusal::Lost(session));
    };
    let want = Message::Want {
        content_id: id,
        max_chunk_size: u32::try_from(limits.max_chunk_size).unwrap_or(u32::MAX),
        window: STREAM_WINDOW,
    };
    if stream.send(want).is_err() {
        return Err(Refusal::Lost(session));
    }
    match stream.recv().await {
        Some(first @ Message::Chunk { .. }) => Ok(PeerStream {
            stream,
            content_id: id,
            limits,
            pending: Some(first),
            seen: BTreeSet::new(),
            last: None,
            received_bytes: 0,
            ungranted: 0,
        }),
        Some(Message::DontHave { .. }) => {
            stream.finish();
            Err(Refusal::DontHave)
        }
        Some(other) => Err(Refusal::Invalid {
            peer,
            reason: format!("unexpected {} as first answer", other.kind()),
        }),
        None => Err(Refusal::Lost(session)),
    }
}

/// Chunks of one blob arriving from the peer that won a query. Dropping it before the last
/// chunk cancels the transfer on that peer.
pub struct PeerStream {
    stream: LogicalStream,
    content_id: ContentId,
    limits: StreamLimits,
    pending: Option<Message>,
    seen: BTreeSet<u64>,
    last: Option<u64>,
    received_bytes: usize,
    /// Chunks consumed since credit was last granted.
    ungranted: u32,
}

impl PeerStream {
    pub fn peer(&self) -> DeviceId {
        self.stream.peer()
    }

    pub fn content_id(&self) -> ContentId {
        self.content_id
    }

    fn is_done(&self) -> bool {
        self.last
            .and_then(|last| last.checked_add(1))
            .is_some_and(|count| self.seen.len() as u64 == count)
    }

    /// Let the peer send as many chunks as were consumed, half a window at a time.
    fn grant_credit(&mut self) {
        self.ungranted += 1;
        if self.ungranted >= STREAM_WINDOW / 2 {
            let _ = self.stream.send(Message::Credit {
                chunks: self.ungranted,
            });
            self.ungranted = 0;
        }
    }

    fn violation(&self, reason: impl Into<String>) -> RetrievalError {
        RetrievalError::Protocol {
            peer: self.peer().to_string(),
            reason: reason.into(),
        }
    }

    /// Next chunk in arrival order, `Ok(None)` after every ordinal up to the last arrived.
    pub async fn next_chunk(&mut self) -> Result<Option<Chunk>, RetrievalError> {
        if self.is_done() {
            return Ok(None);
        }
        let message = match self.pending.take() {
            Some(message) => message,
            None => match timeout(self.limits.idle_timeout, self.stream.recv()).await {
                Ok(Some(message)) => message,
                Ok(None) => {
                    return Err(RetrievalError::SessionLost {
                        peer: self.peer().to_string(),
                    })
                }
                Err(_) => return Err(RetrievalError::Timeout(self.limits.idle_timeout)),
            },
        };
        let (content_id, ordinal, payload, is_last) = match message {
            Message::Chunk {
                content_id,
                ordinal,
                payload,
                is_last,
            } => (content_id, ordinal, payload, is_last),
            other => {
                return Err(self.violation(format!("unexpected {} mid-stream", other.kind())))
            }
        };
        if content_id != self.content_id {
            let asked = self.content_id;
            return Err(self.violation(format!("chunk for {content_id}, asked for {asked}")));
        }
        if payload.len() > self.limits.max_chunk_size {
            return Err(self.violation(format!(
                "chunk of {} bytes exceeds {}",
                payload.len(),
                self.limits.max_chunk_size
            )));
        }
        let max_ordinals = self.limits.max_ordinals();
        if ordinal >= max_ordinals {
            return Err(self.violation(format!(
                "chunk {ordinal} outside the {max_ordinals} ordinals a blob may have"
            )));
        }
        if payload.is_empty() && !(is_last && ordinal == 0) {
            return Err(self.violation(format!("empty chunk {ordinal}")));
        }
        self.received_bytes = self.received_bytes.saturating_add(payload.len());
        if let Some(limit) = self.limits.max_blob_bytes {
            if self.received_bytes > limit {
                return Err(self.violation(format!("blob exceeds the {limit} byte limit")));
            }
        }
        if let Some(last) = self.last {
            if ordinal > last || (is_last && ordinal != last) {
                return Err(self.violation(format!("chunk {ordinal} beyond last {last}")));
            }
        }
        if !self.seen.insert(ordinal) {
            return Err(self.violation(format!("duplicate chunk {ordinal}")));
        }
        if is_last {
            if let Some(&max) = self.seen.last() {
                if max > ordinal {
                    return Err(self.violation(format!("chunk {max} beyond last {ordinal}")));
                }
            }
            self.last = Some(ordinal);
        }
        if self.is_done() {
            self.stream.finish();
        } else {
            self.grant_credit();
        }
        Ok(Some(Chunk {
            ordinal,
            bytes: payload,
            is_last,
        }))
    }

    /// Drain and reassemble by ordinal.
    pub async fn read_to_end(mut self) -> Result<Vec<u8>, RetrievalError> {
        let mut reassembler = Reassembler::with_limit(self.limits.max_ordinals());
        while let Some(chunk) = self.next_chunk().await? {
            reassembler
                .insert(chunk)
                .map_err(|e: ReassemblyError| self.violation(e.to_string()))?;
        }
        reassembler
            .into_bytes()
            .ok_or_else(|| self.violation("stream ended incomplete"))
    }
}
