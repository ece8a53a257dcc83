//! Engine configuration.

use cbc_core::ids::PeerId;
use std::path::PathBuf;
use std::time::Duration;

/// A peer to dial at startup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BootstrapPeer {
    pub peer: PeerId,
    pub address: String,
}

impl BootstrapPeer {
    pub fn new(peer: impl Into<PeerId>, address: impl Into<String>) -> Self {
        Self {
            peer: peer.into(),
            address: address.into(),
        }
    }

    /// Parse `peer@address`.
    pub fn parse(spec: &str) -> Option<Self> {
        let (peer, address) = spec.trim().split_once('@')?;
        if peer.is_empty() || address.is_empty() {
            return None;
        }
        Some(Self::new(PeerId::new(peer), address))
    }
}

/// Configuration for an [`Engine`](crate::Engine).
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Display name announced to the lobby.
    pub display_name: String,
    /// Fixed identity. A fresh one is generated when unset.
    /// Env: `CAUSEWAY_PEER_ID`
    pub peer_id: Option<PeerId>,
    /// Address the TCP link listens on.
    /// Env: `CAUSEWAY_LISTEN`
    pub listen: Option<String>,
    /// Peers dialed and kept connected.
    /// Env: `CAUSEWAY_PEERS` as `id@host:port,id@host:port`
    pub bootstrap: Vec<BootstrapPeer>,
    /// Frames buffered per peer. Further frames are dropped until the peer
    /// catches up.
    pub outbound_queue: usize,
    /// Capacity of the application event channel.
    pub event_capacity: usize,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    /// How often every connected peer is asked for what this node lacks.
    /// `None` disables the periodic round.
    /// Env: `CAUSEWAY_ANTI_ENTROPY_MS`, `0` disables
    pub anti_entropy_interval: Option<Duration>,
    /// Directory for the durable log. In-memory when unset.
    /// Env: `CAUSEWAY_DATA_DIR`
    pub data_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            display_name: "Anonymous".to_string(),
            peer_id: None,
            listen: None,
            bootstrap: Vec::new(),
            outbound_queue: 256,
            event_capacity: 1024,
            reconnect_base: Duration::from_millis(200),
            reconnect_max: Duration::from_secs(10),
            anti_entropy_interval: Some(Duration::from_secs(5)),
            data_dir: None,
        }
    }
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::new()
    }

    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(name) = std::env::var("CAUSEWAY_NAME") {
            config.display_name = name;
        }

        if let Ok(id) = std::env::var("CAUSEWAY_PEER_ID") {
            if !id.trim().is_empty() {
                config.peer_id = Some(PeerId::new(id.trim()));
            }
        }

        if let Ok(addr) = std::env::var("CAUSEWAY_LISTEN") {
            config.listen = Some(addr);
        }

        if let Ok(peers) = std::env::var("CAUSEWAY_PEERS") {
            for spec in peers.split(',').filter(|s| !s.trim().is_empty()) {
                match BootstrapPeer::parse(spec) {
                    Some(peer) => config.bootstrap.push(peer),
                    None => tracing::warn!(value = %spec, "Invalid CAUSEWAY_PEERS entry, skipping"),
                }
            }
        }

        if let Ok(ms) = std::env::var("CAUSEWAY_ANTI_ENTROPY_MS") {
            match ms.trim().parse::<u64>() {
                Ok(0) => config.anti_entropy_interval = None,
                Ok(ms) => config.anti_entropy_interval = Some(Duration::from_millis(ms)),
                Err(_) => tracing::warn!(value = %ms, "Invalid CAUSEWAY_ANTI_ENTROPY_MS, keeping default"),
            }
        }

        if let Ok(dir) = std::env::var("CAUSEWAY_DATA_DIR") {
            config.data_dir = Some(PathBuf::from(dir));
        }

        config
    }

    /// The configured identity, or the one persisted in the data directory,
    /// or a fresh one (persisted when a data directory is set).
    pub fn resolve_peer_id(&mut self) -> std::io::Result<PeerId> {
        if let Some(id) = &self.peer_id {
            return Ok(id.clone());
        }
        let id = match &self.data_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                let path = dir.join(PEER_ID_FILE);
                match std::fs::read_to_string(&path) {
                    Ok(stored) if !stored.trim().is_empty() => PeerId::new(stored.trim()),
                    Ok(_) => write_peer_id(&path)?,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => write_peer_id(&path)?,
                    Err(e) => return Err(e),
                }
            }
            None => PeerId::generate(),
        };
        self.peer_id = Some(id.clone());
        Ok(id)
    }
}

const PEER_ID_FILE: &str = "peer_id";

fn write_peer_id(path: &std::path::Path) -> std::io::Result<PeerId> {
    let id = PeerId::generate();
    std::fs::write(path, id.as_str())?;
    Ok(id)
}

/// Builder for engine configuration.
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
        }
    }

    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.config.display_name = name.into();
        self
    }

    pub fn peer_id(mut self, id: impl Into<PeerId>) -> Self {
        self.config.peer_id = Some(id.into());
        self
    }

    pub fn listen(mut self, addr: impl Into<String>) -> Self {
        self.config.listen = Some(addr.into());
        self
    }

    pub fn bootstrap(mut self, peer: impl Into<PeerId>, address: impl Into<String>) -> Self {
        self.config.bootstrap.push(BootstrapPeer::new(peer, address));
        self
    }

    pub fn outbound_queue(mut self, size: usize) -> Self {
        self.config.outbound_queue = size;
        self
    }

    pub fn event_capacity(mut self, size: usize) -> Self {
        self.config.event_capacity = size;
        self
    }

    pub fn reconnect_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.config.reconnect_base = base;
        self.config.reconnect_max = max;
        self
    }

    pub fn anti_entropy(mut self, interval: Option<Duration>) -> Self {
        self.config.anti_entropy_interval = interval;
        self
    }

    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.data_dir = Some(dir.into());
        self
    }

    pub fn build(self) -> EngineConfig {
        self.config
    }
}

impl Default for EngineConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = EngineConfig::builder()
            .display_name("Ann")
            .peer_id("ann")
            .bootstrap("bob", "127.0.0.1:7001")
            .outbound_queue(8)
            .reconnect_backoff(Duration::from_millis(5), Duration::from_millis(50))
            .anti_entropy(None)
            .build();

        assert_eq!(config.display_name, "Ann");
        assert_eq!(config.peer_id, Some(PeerId::new("ann")));
        assert_eq!(config.bootstrap, vec![BootstrapPeer::new("bob", "127.0.0.1:7001")]);
        assert_eq!(config.outbound_queue, 8);
        assert_eq!(config.reconnect_max, Duration::from_millis(50));
        assert!(config.anti_entropy_interval.is_none());
        assert!(config.data_dir.is_none());
    }

    #[test]
    fn test_peer_id_persisted_in_data_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut first = EngineConfig::builder().data_dir(dir.path()).build();
        let id = first.resolve_peer_id().unwrap();

        let mut second = EngineConfig::builder().data_dir(dir.path()).build();
        assert_eq!(second.resolve_peer_id().unwrap(), id);

        let mut fixed = EngineConfig::builder().peer_id("fixed").data_dir(dir.path()).build();
        assert_eq!(fixed.resolve_peer_id().unwrap(), PeerId::new("fixed"));
    }

    #[test]
    fn test_bootstrap_parse() {
        assert_eq!(
            BootstrapPeer::parse(" bob@10.0.0.2:7000 "),
            Some(BootstrapPeer::new("bob", "10.0.0.2:7000"))
        );
        assert_eq!(BootstrapPeer::parse("no-address"), None);
        assert_eq!(BootstrapPeer::parse("@host:1"), None);
    }
}
