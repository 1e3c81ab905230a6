use std::env;
use std::net::SocketAddr;

use crate::error::{Error, Result};
use crate::replication::SyncMode;

/// A single `id:host:port` peer entry from the `peers` configuration option.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerSpec {
    pub node_id: u32,
    pub address: String,
    pub port: u16,
}

/// Every configuration option the daemon accepts, with its valid range and default.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub node_id: u32,
    pub address: String,
    pub port: u16,
    pub cluster_name: String,
    pub cluster_size: usize,
    pub heartbeat_interval_ms: u64,
    pub election_timeout_ms: u64,
    pub worker_interval_ms: u64,
    pub peers: Vec<PeerSpec>,
    pub auto_cluster_formation: bool,
    pub auto_failover_enabled: bool,
    pub sync_mode: SyncMode,
    pub num_sync_standbys: i32,
    pub max_replication_lag_ms: i64,
    pub health_period_ms: u64,
    pub snapshot_interval: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            node_id: 1,
            address: "127.0.0.1".to_string(),
            port: 7000,
            cluster_name: "pgraft_cluster".to_string(),
            cluster_size: 3,
            heartbeat_interval_ms: 1000,
            election_timeout_ms: 5000,
            worker_interval_ms: 1000,
            peers: Vec::new(),
            auto_cluster_formation: true,
            auto_failover_enabled: true,
            sync_mode: SyncMode::Off,
            num_sync_standbys: 0,
            max_replication_lag_ms: 10_000,
            health_period_ms: 5000,
            snapshot_interval: 1000,
        }
    }
}

impl ClusterConfig {
    /// Builds a configuration from environment variables, falling back to defaults for anything
    /// unset. Parsing a configuration *file* is owned by the external CLI/shim; this only
    /// assembles the in-memory struct the core depends on.
    pub fn from_env() -> Result<Self> {
        let mut cfg = ClusterConfig::default();

        if let Ok(v) = env::var("PGRAFT_NODE_ID") {
            cfg.node_id = v
                .parse()
                .map_err(|_| Error::InvalidParameter("PGRAFT_NODE_ID".to_string()))?;
        }
        if let Ok(v) = env::var("PGRAFT_ADDRESS") {
            cfg.address = v;
        }
        if let Ok(v) = env::var("PGRAFT_PORT") {
            cfg.port = v
                .parse()
                .map_err(|_| Error::InvalidParameter("PGRAFT_PORT".to_string()))?;
        }
        if let Ok(v) = env::var("PGRAFT_CLUSTER_NAME") {
            cfg.cluster_name = v;
        }
        if let Ok(v) = env::var("PGRAFT_CLUSTER_SIZE") {
            cfg.cluster_size = v
                .parse()
                .map_err(|_| Error::InvalidParameter("PGRAFT_CLUSTER_SIZE".to_string()))?;
        }
        if let Ok(v) = env::var("PGRAFT_HEARTBEAT_INTERVAL_MS") {
            cfg.heartbeat_interval_ms = v
                .parse()
                .map_err(|_| Error::InvalidParameter("PGRAFT_HEARTBEAT_INTERVAL_MS".to_string()))?;
        }
        if let Ok(v) = env::var("PGRAFT_ELECTION_TIMEOUT_MS") {
            cfg.election_timeout_ms = v
                .parse()
                .map_err(|_| Error::InvalidParameter("PGRAFT_ELECTION_TIMEOUT_MS".to_string()))?;
        }
        if let Ok(v) = env::var("PGRAFT_WORKER_INTERVAL_MS") {
            cfg.worker_interval_ms = v
                .parse()
                .map_err(|_| Error::InvalidParameter("PGRAFT_WORKER_INTERVAL_MS".to_string()))?;
        }
        if let Ok(v) = env::var("PGRAFT_PEERS") {
            cfg.peers = parse_peers(&v)?;
        }
        if let Ok(v) = env::var("PGRAFT_AUTO_CLUSTER_FORMATION") {
            cfg.auto_cluster_formation = parse_bool(&v)?;
        }
        if let Ok(v) = env::var("PGRAFT_AUTO_FAILOVER_ENABLED") {
            cfg.auto_failover_enabled = parse_bool(&v)?;
        }
        if let Ok(v) = env::var("PGRAFT_SYNC_MODE") {
            cfg.sync_mode = v
                .parse()
                .map_err(|_| Error::InvalidParameter("PGRAFT_SYNC_MODE".to_string()))?;
        }
        if let Ok(v) = env::var("PGRAFT_NUM_SYNC_STANDBYS") {
            cfg.num_sync_standbys = v
                .parse()
                .map_err(|_| Error::InvalidParameter("PGRAFT_NUM_SYNC_STANDBYS".to_string()))?;
        }
        if let Ok(v) = env::var("PGRAFT_MAX_REPLICATION_LAG_MS") {
            cfg.max_replication_lag_ms = v
                .parse()
                .map_err(|_| Error::InvalidParameter("PGRAFT_MAX_REPLICATION_LAG_MS".to_string()))?;
        }
        if let Ok(v) = env::var("PGRAFT_HEALTH_PERIOD_MS") {
            cfg.health_period_ms = v
                .parse()
                .map_err(|_| Error::InvalidParameter("PGRAFT_HEALTH_PERIOD_MS".to_string()))?;
        }
        if let Ok(v) = env::var("PGRAFT_SNAPSHOT_INTERVAL") {
            cfg.snapshot_interval = v
                .parse()
                .map_err(|_| Error::InvalidParameter("PGRAFT_SNAPSHOT_INTERVAL".to_string()))?;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id < 1 || self.node_id > 1000 {
            return Err(Error::InvalidParameter("node_id must be in 1..1000".to_string()));
        }
        if self.port < 1 {
            return Err(Error::InvalidParameter("port must be in 1..65535".to_string()));
        }
        if self.cluster_size < 1 || self.cluster_size > 100 {
            return Err(Error::InvalidParameter(
                "cluster_size must be in 1..100".to_string(),
            ));
        }
        if !(100..=60_000).contains(&self.heartbeat_interval_ms) {
            return Err(Error::InvalidParameter(
                "heartbeat_interval_ms must be in 100..60000".to_string(),
            ));
        }
        if !(1_000..=30_000).contains(&self.election_timeout_ms) {
            return Err(Error::InvalidParameter(
                "election_timeout_ms must be in 1000..30000".to_string(),
            ));
        }
        if !(100..=60_000).contains(&self.worker_interval_ms) {
            return Err(Error::InvalidParameter(
                "worker_interval_ms must be in 100..60000".to_string(),
            ));
        }
        if self.num_sync_standbys < 0 {
            return Err(Error::InvalidParameter(
                "num_sync_standbys must be >= 0".to_string(),
            ));
        }
        if !(1_000..=60_000).contains(&self.health_period_ms) {
            return Err(Error::InvalidParameter(
                "health_period_ms must be in 1000..60000".to_string(),
            ));
        }
        if self.snapshot_interval == 0 {
            return Err(Error::InvalidParameter(
                "snapshot_interval must be >= 1".to_string(),
            ));
        }
        for peer in &self.peers {
            if peer.node_id < 1 || peer.node_id > 1000 {
                return Err(Error::InvalidParameter(format!(
                    "peer node_id {} out of range",
                    peer.node_id
                )));
            }
        }
        Ok(())
    }

    pub fn local_socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.address, self.port)
            .parse()
            .map_err(|_| Error::InvalidParameter("address/port".to_string()))
    }
}

fn parse_bool(v: &str) -> Result<bool> {
    match v {
        "1" | "true" | "TRUE" | "yes" => Ok(true),
        "0" | "false" | "FALSE" | "no" => Ok(false),
        _ => Err(Error::InvalidParameter(format!("not a bool: {}", v))),
    }
}

/// Parses the `peers` option: a comma-separated list of `id:host:port` entries.
pub fn parse_peers(raw: &str) -> Result<Vec<PeerSpec>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| {
            let mut parts = entry.splitn(3, ':');
            let node_id: u32 = parts
                .next()
                .ok_or_else(|| Error::InvalidParameter(format!("malformed peer: {}", entry)))?
                .parse()
                .map_err(|_| Error::InvalidParameter(format!("malformed peer id: {}", entry)))?;
            let address = parts
                .next()
                .ok_or_else(|| Error::InvalidParameter(format!("malformed peer: {}", entry)))?
                .to_string();
            let port: u16 = parts
                .next()
                .ok_or_else(|| Error::InvalidParameter(format!("malformed peer: {}", entry)))?
                .parse()
                .map_err(|_| Error::InvalidParameter(format!("malformed peer port: {}", entry)))?;
            Ok(PeerSpec {
                node_id,
                address,
                port,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_peer_list() {
        let peers = parse_peers("1:127.0.0.1:7001,2:127.0.0.1:7002").unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].node_id, 1);
        assert_eq!(peers[1].port, 7002);
    }

    #[test]
    fn rejects_out_of_range_cluster_size() {
        let mut cfg = ClusterConfig::default();
        cfg.cluster_size = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn default_config_validates() {
        assert!(ClusterConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_snapshot_interval() {
        let mut cfg = ClusterConfig::default();
        cfg.snapshot_interval = 0;
        assert!(cfg.validate().is_err());
    }
}
