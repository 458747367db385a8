//! Seed-list discovery: parse peer addresses, open sessions to every seed once at startup.

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use hoard_core::DeviceId;
use tokio::net::lookup_host;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::ConnectError;
use crate::session::TransportSession;

/// `host:port`, optionally pinned to a peer identity as `<device-id-hex>@host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerAddress {
    host_port: String,
    pinned: Option<DeviceId>,
}

impl PeerAddress {
    pub fn host_port(&self) -> &str {
        &self.host_port
    }

    /// Identity the remote must prove during the handshake, if pinned.
    pub fn expected_peer(&self) -> Option<DeviceId> {
        self.pinned
    }

    pub async fn resolve(&self) -> std::io::Result<Vec<SocketAddr>> {
        Ok(lookup_host(self.host_port.as_str()).await?.collect())
    }
}

impl From<SocketAddr> for PeerAddress {
    fn from(addr: SocketAddr) -> Self {
        Self {
            host_port: addr.to_string(),
            pinned: None,
        }
    }
}

impl FromStr for PeerAddress {
    type Err = ConnectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConnectError::InvalidAddress(s.to_string());
        let s = s.trim();
        let (pinned, host_port) = match s.split_once('@') {
            Some((id, rest)) => (Some(id.parse::<DeviceId>().map_err(|_| invalid())?), rest),
            None => (None, s),
        };
        let (host, port) = host_port.rsplit_once(':').ok_or_else(invalid)?;
        if host.is_empty() || port.parse::<u16>().is_err() {
            return Err(invalid());
        }
        Ok(Self {
            host_port: host_port.to_string(),
            pinned,
        })
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.pinned {
            Some(id) => write!(f, "{id}@{}", self.host_port),
            None => f.write_str(&self.host_port),
        }
    }
}

/// Dials the seed list at startup. An unreachable seed is retried once after `backoff`;
/// handshake failures and unparsable seeds are not retried.
pub struct PeerDiscovery {
    transport: Arc<TransportSession>,
    backoff: Duration,
}

impl PeerDiscovery {
    pub fn new(transport: Arc<TransportSession>, backoff: Duration) -> Self {
        Self { transport, backoff }
    }

    /// Open sessions to every seed concurrently. Returns the number of distinct peers
    /// reached; never fails, zero means the node runs local-only.
    pub async fn bootstrap(&self, seeds: &[String]) -> usize {
        let mut tasks = JoinSet::new();
        for seed in seeds {
            let address = match seed.parse::<PeerAddress>() {
                Ok(address) => address,
                Err(e) => {
                    warn!(seed = %seed, error = %e, "skipping seed");
                    continue;
                }
            };
            let transport = self.transport.clone();
            let backoff = self.backoff;
            tasks.spawn(async move { dial_with_retry(&transport, &address, backoff).await });
        }

        let mut peers = HashSet::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(peer)) => {
                    peers.insert(peer);
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "bootstrap task failed"),
            }
        }
        if peers.is_empty() && !seeds.is_empty() {
            warn!(seeds = seeds.len(), "no seed reachable, running local-only");
        } else {
            info!(sessions = peers.len(), seeds = seeds.len(), "bootstrap finished");
        }
        peers.len()
    }
}

async fn dial_with_retry(
    transport: &TransportSession,
    address: &PeerAddress,
    backoff: Duration,
) -> Option<DeviceId> {
    let mut retried = false;
    loop {
        match transport.open(address).await {
            Ok(session) => return Some(session.peer()),
            Err(e) if e.is_unreachable() && !retried => {
                debug!(seed = %address, error = %e, ?backoff, "seed unreachable, retrying once");
                retried = true;
                tokio::time::sleep(backoff).await;
            }
            Err(e) => {
                warn!(seed = %address, error = %e, "seed failed");
                return None;
            }
        }
    }
}
