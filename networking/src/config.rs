//! Configuration for the overlay.
//!
//! Plain values handed in at construction; nothing here is global. Defaults
//! match the protocol's documented behavior and every interval has a
//! `Duration` accessor so call sites never multiply milliseconds by hand.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration for one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub gossip: GossipConfig,
    /// Peer table cap; adding beyond it evicts the least recently seen peer.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Verbose logging.
    #[serde(default)]
    pub debug: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            connection: ConnectionConfig::default(),
            gossip: GossipConfig::default(),
            max_connections: default_max_connections(),
            debug: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Per-attempt connect timeout in milliseconds.
    pub timeout_ms: u64,
    /// How many relay endpoints to try during a single connect call.
    pub max_retries: usize,
    pub heartbeat_interval_ms: u64,
    /// Send cover pings at randomized intervals.
    pub enable_obfuscation: bool,
    pub obfuscation_interval_ms: u64,
    /// Listen address for inbound direct connections; `None` disables the
    /// listener (the node is then reachable only through a relay).
    pub direct_listen: Option<SocketAddr>,
    /// Ordered relay endpoints (`host:port`) for the fallback path.
    pub relay_servers: Vec<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            timeout_ms: 30_000,
            max_retries: 3,
            heartbeat_interval_ms: 30_000,
            enable_obfuscation: false,
            obfuscation_interval_ms: 15_000,
            direct_listen: None,
            relay_servers: Vec::new(),
        }
    }
}

impl ConnectionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn obfuscation_interval(&self) -> Duration {
        Duration::from_millis(self.obfuscation_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipConfig {
    /// Default hop cap for broadcasts.
    pub max_hops: u32,
    /// Propagation tick period in milliseconds.
    pub interval_ms: u64,
    /// Default broadcast TTL; also bounds the dedup-table sweep.
    pub message_ttl_ms: u64,
    /// If false, enqueued broadcasts are never propagated.
    pub enable_auto_propagation: bool,
    /// Queue entries drained per tick.
    pub max_concurrent_gossip: usize,
    /// Queue bound; when full the oldest entry is dropped.
    pub max_queue: usize,
}

impl Default for GossipConfig {
    fn default() -> Self {
        GossipConfig {
            max_hops: 10,
            interval_ms: 5_000,
            message_ttl_ms: 300_000,
            enable_auto_propagation: true,
            max_concurrent_gossip: 5,
            max_queue: 1_024,
        }
    }
}

impl GossipConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

fn default_max_connections() -> usize {
    50
}

impl NetworkConfig {
    pub fn with_direct_listen(mut self, addr: SocketAddr) -> Self {
        self.connection.direct_listen = Some(addr);
        self
    }

    pub fn with_relay_servers(mut self, servers: Vec<String>) -> Self {
        self.connection.relay_servers = servers;
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_heartbeat_interval_ms(mut self, interval_ms: u64) -> Self {
        self.connection.heartbeat_interval_ms = interval_ms;
        self
    }

    pub fn with_gossip_interval_ms(mut self, interval_ms: u64) -> Self {
        self.gossip.interval_ms = interval_ms;
        self
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = NetworkConfig::default();
        assert_eq!(config.connection.timeout_ms, 30_000);
        assert_eq!(config.connection.max_retries, 3);
        assert_eq!(config.connection.heartbeat_interval_ms, 30_000);
        assert!(!config.connection.enable_obfuscation);
        assert_eq!(config.gossip.max_hops, 10);
        assert_eq!(config.gossip.interval_ms, 5_000);
        assert_eq!(config.gossip.message_ttl_ms, 300_000);
        assert!(config.gossip.enable_auto_propagation);
        assert_eq!(config.gossip.max_concurrent_gossip, 5);
        assert_eq!(config.max_connections, 50);
    }

    #[test]
    fn builders_compose() {
        let config = NetworkConfig::default()
            .with_max_connections(8)
            .with_relay_servers(vec!["127.0.0.1:9000".to_owned()])
            .with_heartbeat_interval_ms(500);

        assert_eq!(config.max_connections, 8);
        assert_eq!(config.connection.relay_servers.len(), 1);
        assert_eq!(
            config.connection.heartbeat_interval(),
            Duration::from_millis(500)
        );
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: NetworkConfig =
            serde_json::from_str(r#"{"max_connections": 5}"#).unwrap();
        assert_eq!(config.max_connections, 5);
        assert_eq!(config.gossip.max_hops, 10);
    }
}
