//! Load node config from file and environment.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use hoard_core::chunk::{DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE};
use hoard_core::integrity::DEFAULT_MAX_INTEGRITY_FAILURES;
use serde::Deserialize;

/// Node configuration. File: ~/.config/hoard/config.toml or /etc/hoard/config.toml.
/// Env overrides: HOARD_LISTEN_ADDR, HOARD_SEED_PEERS (comma separated), HOARD_CHUNK_SIZE,
/// HOARD_QUERY_TIMEOUT_MS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    /// TCP address to accept sessions on (default 0.0.0.0:45700).
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    /// Seed peers, `host:port` or `<device-id-hex>@host:port`. Dialed once at startup.
    #[serde(default)]
    pub seed_peers: Vec<String>,
    /// Chunk size for streaming (default 64 KiB).
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Bound on waiting for a first peer answer, and on the gap between chunks.
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
    /// Delay before the single retry of an unreachable seed.
    #[serde(default = "default_bootstrap_backoff_ms")]
    pub bootstrap_backoff_ms: u64,
    /// Byte budget of the LRU cache holding blobs fetched from peers.
    #[serde(default = "default_cache_capacity_bytes")]
    pub cache_capacity_bytes: usize,
    /// Reject `put` of larger blobs. Unbounded when absent.
    #[serde(default)]
    pub max_blob_bytes: Option<usize>,
    /// Integrity failures after which a peer is no longer queried.
    #[serde(default = "default_max_integrity_failures")]
    pub max_integrity_failures: u32,
    /// Runtime worker threads used by the blocking gateway.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 45700))
}
fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}
fn default_connect_timeout_ms() -> u64 {
    3_000
}
fn default_handshake_timeout_ms() -> u64 {
    5_000
}
fn default_query_timeout_ms() -> u64 {
    10_000
}
fn default_bootstrap_backoff_ms() -> u64 {
    500
}
fn default_cache_capacity_bytes() -> usize {
    64 * 1024 * 1024
}
fn default_max_integrity_failures() -> u32 {
    DEFAULT_MAX_INTEGRITY_FAILURES
}
fn default_worker_threads() -> usize {
    2
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            seed_peers: Vec::new(),
            chunk_size: default_chunk_size(),
            connect_timeout_ms: default_connect_timeout_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            query_timeout_ms: default_query_timeout_ms(),
            bootstrap_backoff_ms: default_bootstrap_backoff_ms(),
            cache_capacity_bytes: default_cache_capacity_bytes(),
            max_blob_bytes: None,
            max_integrity_failures: default_max_integrity_failures(),
            worker_threads: default_worker_threads(),
        }
    }
}

impl NodeConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn bootstrap_backoff(&self) -> Duration {
        Duration::from_millis(self.bootstrap_backoff_ms)
    }

    /// Parse a TOML document.
    pub fn from_toml(s: &str) -> Result<Self, ConfigError> {
        let config: NodeConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the node cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(ConfigError::Invalid(format!(
                "chunk_size must be in 1..={MAX_CHUNK_SIZE}, got {}",
                self.chunk_size
            )));
        }
        for (name, ms) in [
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("handshake_timeout_ms", self.handshake_timeout_ms),
            ("query_timeout_ms", self.query_timeout_ms),
        ] {
            if ms == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be positive")));
            }
        }
        if self.worker_threads == 0 {
            return Err(ConfigError::Invalid("worker_threads must be positive".into()));
        }
        Ok(())
    }

    /// Apply HOARD_* environment overrides.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(s) = lookup("HOARD_LISTEN_ADDR") {
            self.listen_addr = s
                .parse()
                .map_err(|_| ConfigError::Env("HOARD_LISTEN_ADDR", s))?;
        }
        if let Some(s) = lookup("HOARD_SEED_PEERS") {
            self.seed_peers = s
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(s) = lookup("HOARD_CHUNK_SIZE") {
            self.chunk_size = s.parse().map_err(|_| ConfigError::Env("HOARD_CHUNK_SIZE", s))?;
        }
        if let Some(s) = lookup("HOARD_QUERY_TIMEOUT_MS") {
            self.query_timeout_ms = s
                .parse()
                .map_err(|_| ConfigError::Env("HOARD_QUERY_TIMEOUT_MS", s))?;
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for {0}: {1:?}")]
    Env(&'static str, String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Load config: default, then first config file found, then env vars.
pub fn load() -> Result<NodeConfig, ConfigError> {
    let mut c = match config_paths().into_iter().find(|p| p.exists()) {
        Some(path) => load_file(&path)?,
        None => NodeConfig::default(),
    };
    c.apply_env()?;
    c.validate()?;
    Ok(c)
}

/// Load an explicit config file, then env vars.
pub fn load_from(path: &Path) -> Result<NodeConfig, ConfigError> {
    let mut c = load_file(path)?;
    c.apply_env()?;
    c.validate()?;
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(h) = std::env::var_os("HOME").map(PathBuf::from) {
        out.push(h.join(".config/hoard/config.toml"));
    }
    out.push(PathBuf::from("/etc/hoard/config.toml"));
    out
}

fn load_file(path: &Path) -> Result<NodeConfig, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    NodeConfig::from_toml(&s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_file_gives_defaults() {
        let c = NodeConfig::from_toml("").unwrap();
        assert_eq!(c.listen_addr.port(), 45700);
        assert_eq!(c.chunk_size, DEFAULT_CHUNK_SIZE);
        assert!(c.seed_peers.is_empty());
        assert_eq!(c.query_timeout(), Duration::from_secs(10));
        assert_eq!(c.max_blob_bytes, None);
    }

    #[test]
    fn file_values_parsed() {
        let c = NodeConfig::from_toml(
            r#"
            listen_addr = "127.0.0.1:9000"
            seed_peers = ["10.0.0.2:45700", "node.example:45700"]
            chunk_size = 16384
            query_timeout_ms = 250
            max_blob_bytes = 1048576
            "#,
        )
        .unwrap();
        assert_eq!(c.listen_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(c.seed_peers.len(), 2);
        assert_eq!(c.chunk_size, 16384);
        assert_eq!(c.query_timeout(), Duration::from_millis(250));
        assert_eq!(c.max_blob_bytes, Some(1 << 20));
    }

    #[test]
    fn unknown_key_rejected() {
        assert!(matches!(
            NodeConfig::from_toml("proxy_port = 3128"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn zero_chunk_size_rejected() {
        assert!(matches!(
            NodeConfig::from_toml("chunk_size = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(NodeConfig::from_toml(&format!("chunk_size = {}", MAX_CHUNK_SIZE + 1)).is_err());
    }

    #[test]
    fn env_overrides_applied() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("HOARD_SEED_PEERS", "a:1, b:2,,"),
            ("HOARD_CHUNK_SIZE", "1024"),
            ("HOARD_LISTEN_ADDR", "127.0.0.1:0"),
        ]);
        let mut c = NodeConfig::default();
        c.apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(c.seed_peers, vec!["a:1".to_string(), "b:2".to_string()]);
        assert_eq!(c.chunk_size, 1024);
        assert_eq!(c.listen_addr.port(), 0);
    }

    #[test]
    fn bad_env_value_reported() {
        let mut c = NodeConfig::default();
        let err = c
            .apply_overrides(|k| (k == "HOARD_CHUNK_SIZE").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env("HOARD_CHUNK_SIZE", _)));
    }
}
