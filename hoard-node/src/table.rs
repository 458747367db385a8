//! Live sessions keyed by peer device id.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use hoard_core::DeviceId;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::session::Session;

/// At most one session per peer. Shared by the accept loop, bootstrap and queries.
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: RwLock<HashMap<DeviceId, Arc<Session>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `session` unless a preferred live session to the same peer exists; returns the
    /// session that stays. Both ends rank duplicates by [`Session::preference`], so they keep
    /// the same connection.
    pub async fn insert(&self, session: Arc<Session>) -> Arc<Session> {
        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(&session.peer()) {
            if !existing.is_closed() && existing.preference() <= session.preference() {
                return existing.clone();
            }
        }
        if let Some(old) = sessions.insert(session.peer(), session.clone()) {
            old.close();
        }
        session
    }

    /// Remove the entry for `peer` if it is still the session `id`.
    pub async fn remove(&self, peer: &DeviceId, id: Uuid) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.write().await;
        match sessions.get(peer) {
            Some(s) if s.id() == id => sessions.remove(peer),
            _ => None,
        }
    }

    pub async fn get(&self, peer: &DeviceId) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .await
            .get(peer)
            .filter(|s| !s.is_closed())
            .cloned()
    }

    pub async fn find_by_addr(&self, addr: SocketAddr) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .await
            .values()
            .find(|s| s.remote_addr() == addr && !s.is_closed())
            .cloned()
    }

    /// Live sessions, in no particular order.
    pub async fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| !s.is_closed())
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Remove every session; the caller closes them.
    pub async fn drain(&self) -> Vec<Arc<Session>> {
        self.sessions.write().await.drain().map(|(_, s)| s).collect()
    }
}
