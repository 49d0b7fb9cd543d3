//! Configuration for the zone master and the partition server.
//!
//! Both configs support environment-variable overrides via `from_env` and are
//! validated before use.
//!
//! # Environment Variables
//!
//! Zone master:
//! - `ZM_ZONE_ID`: zone identifier (default: `zone-1`)
//! - `ZM_NODE_ADDR`: this master's advertised address
//! - `ZM_REPLICA_NUM`: replica cardinality target per partition (default: 1)
//!
//! Partition server:
//! - `PS_CLUSTER_ID`: cluster/zone identifier the node belongs to
//! - `PS_MASTER_ADDR`: zone-master address to register with
//! - `PS_STORE_PATH`: local metadata directory
//! - `PS_HEARTBEAT_INTERVAL_SECS`: master heartbeat interval

use std::path::PathBuf;
use std::time::Duration;

use crate::constants::{
    DEFAULT_PS_HEARTBEAT_INTERVAL, DEFAULT_RECOVER_CONCURRENCY, DEFAULT_REPLICA_NUM,
};
use crate::error::{Error, Result};

/// Ports a partition server exposes, used by the master to derive the
/// [`ReplicaAddrs`](crate::types::ReplicaAddrs) of replicas placed on it.
#[derive(Debug, Clone)]
pub struct PsPorts {
    pub heartbeat: u16,
    pub replicate: u16,
    pub rpc: u16,
    pub admin: u16,
}

impl Default for PsPorts {
    fn default() -> Self {
        PsPorts { heartbeat: 8811, replicate: 8812, rpc: 8813, admin: 8814 }
    }
}

/// Zone-master configuration.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// Zone identifier.
    pub zone_id: String,

    /// This master's advertised address, handed to clients as the leader
    /// hint.
    pub node_addr: String,

    /// Replica cardinality target per partition.
    pub replica_num: usize,

    /// Ports assumed for every partition server in the zone.
    pub ps_ports: PsPorts,

    /// A PS whose last heartbeat is older than this is not considered alive
    /// for replica placement.
    pub ps_alive_timeout: Duration,
}

impl Default for MasterConfig {
    fn default() -> Self {
        MasterConfig {
            zone_id: "zone-1".to_string(),
            node_addr: "127.0.0.1:8817".to_string(),
            replica_num: DEFAULT_REPLICA_NUM,
            ps_ports: PsPorts::default(),
            ps_alive_timeout: Duration::from_secs(60),
        }
    }
}

impl MasterConfig {
    /// Build from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let config = MasterConfig {
            zone_id: std::env::var("ZM_ZONE_ID").unwrap_or(defaults.zone_id),
            node_addr: std::env::var("ZM_NODE_ADDR").unwrap_or(defaults.node_addr),
            replica_num: parse_env("ZM_REPLICA_NUM", defaults.replica_num)?,
            ps_ports: defaults.ps_ports,
            ps_alive_timeout: defaults.ps_alive_timeout,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.zone_id.is_empty() {
            return Err(Error::Config("zone_id must not be empty".into()));
        }
        if self.node_addr.is_empty() {
            return Err(Error::Config("node_addr must not be empty".into()));
        }
        if self.replica_num == 0 {
            return Err(Error::Config("replica_num must be at least 1".into()));
        }
        Ok(())
    }
}

/// Partition-server configuration.
#[derive(Debug, Clone)]
pub struct PsConfig {
    /// Cluster/zone identifier. A node whose persisted identity carries a
    /// different cluster id resets its local metadata on boot.
    pub cluster_id: String,

    /// Zone-master address to register with. Empty disables registration
    /// (standalone mode, used in tests).
    pub master_addr: String,

    /// Address this node advertises to the master.
    pub ip: String,

    /// Local metadata directory.
    pub store_path: PathBuf,

    /// Interval between heartbeats to the master.
    pub heartbeat_interval: Duration,

    /// Bound on concurrent partition recoveries during boot.
    pub recover_concurrency: usize,
}

impl Default for PsConfig {
    fn default() -> Self {
        PsConfig {
            cluster_id: "zone-1".to_string(),
            master_addr: String::new(),
            ip: "127.0.0.1".to_string(),
            store_path: PathBuf::from("/tmp/baudengine-ps"),
            heartbeat_interval: DEFAULT_PS_HEARTBEAT_INTERVAL,
            recover_concurrency: DEFAULT_RECOVER_CONCURRENCY,
        }
    }
}

impl PsConfig {
    /// Build from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let heartbeat_secs = parse_env(
            "PS_HEARTBEAT_INTERVAL_SECS",
            defaults.heartbeat_interval.as_secs(),
        )?;
        let config = PsConfig {
            cluster_id: std::env::var("PS_CLUSTER_ID").unwrap_or(defaults.cluster_id),
            master_addr: std::env::var("PS_MASTER_ADDR").unwrap_or(defaults.master_addr),
            ip: std::env::var("PS_IP").unwrap_or(defaults.ip),
            store_path: std::env::var("PS_STORE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.store_path),
            heartbeat_interval: Duration::from_secs(heartbeat_secs),
            recover_concurrency: defaults.recover_concurrency,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cluster_id.is_empty() {
            return Err(Error::Config("cluster_id must not be empty".into()));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(Error::Config("heartbeat_interval must be positive".into()));
        }
        if self.recover_concurrency == 0 {
            return Err(Error::Config("recover_concurrency must be at least 1".into()));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| Error::Config(format!("invalid value for {name}: {raw}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        MasterConfig::default().validate().unwrap();
        PsConfig::default().validate().unwrap();
    }

    #[test]
    fn master_rejects_zero_replicas() {
        let config = MasterConfig { replica_num: 0, ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn master_rejects_empty_zone() {
        let config = MasterConfig { zone_id: String::new(), ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn ps_rejects_zero_heartbeat() {
        let config = PsConfig { heartbeat_interval: Duration::ZERO, ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn ps_rejects_zero_recover_concurrency() {
        let config = PsConfig { recover_concurrency: 0, ..Default::default() };
        assert!(config.validate().is_err());
    }
}
