//! Configuration for manager, storage, and client processes.
//!
//! There is no configuration file. Each process builds its config from
//! defaults, optionally layered with `RINGSTORE_*` environment variables
//! and `with_*` builder calls.

use crate::error::{Error, Result};
use crate::types::{NodeAddress, DEFAULT_MANAGER_PORT};
use std::time::Duration;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_STORAGE_BASE_PORT: u16 = 6000;

/// Default heartbeat emission / monitor wake period.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);

/// Default window after which a silent node is expired.
pub const DEFAULT_LIVENESS_TIMEOUT: Duration = Duration::from_secs(6);

/// Default per-RPC timeout.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(3);

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_u16(name: &str) -> Option<u16> {
    env_string(name).and_then(|v| v.parse().ok())
}

/// Manager process configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Address the manager listens on.
    pub host: String,

    /// Listen port.
    pub port: u16,

    /// Cluster replication factor K. Must be at least 1.
    pub replication_factor: usize,

    /// How long a node may go without a heartbeat before it is expired.
    pub liveness_timeout: Duration,

    /// Heartbeat monitor wake period.
    pub heartbeat_interval: Duration,

    /// Delay between availability polls during quiescence.
    pub availability_poll_interval: Duration,

    /// Maximum availability polls per node before giving up.
    pub availability_max_attempts: usize,

    /// Timeout applied to every manager-issued RPC.
    pub rpc_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_MANAGER_PORT,
            replication_factor: 1,
            liveness_timeout: DEFAULT_LIVENESS_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            availability_poll_interval: Duration::from_millis(200),
            availability_max_attempts: 30,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
        }
    }
}

impl ManagerConfig {
    /// Build a config from defaults layered with `RINGSTORE_MANAGER_HOST`,
    /// `RINGSTORE_MANAGER_PORT`, and `RINGSTORE_REPLICATION`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(host) = env_string("RINGSTORE_MANAGER_HOST") {
            config.host = host;
        }
        if let Some(port) = env_u16("RINGSTORE_MANAGER_PORT") {
            config.port = port;
        }
        if let Some(factor) = env_string("RINGSTORE_REPLICATION").and_then(|v| v.parse().ok()) {
            config.replication_factor = factor;
        }
        config
    }

    /// Set the listen address.
    pub fn with_listen(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    /// Set the replication factor.
    pub fn with_replication_factor(mut self, factor: usize) -> Self {
        self.replication_factor = factor;
        self
    }

    /// Set the liveness timeout.
    pub fn with_liveness_timeout(mut self, timeout: Duration) -> Self {
        self.liveness_timeout = timeout;
        self
    }

    /// Set the heartbeat monitor wake period.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the per-RPC timeout.
    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    /// The manager's listen address.
    pub fn listen_addr(&self) -> NodeAddress {
        NodeAddress::new(self.host.clone(), self.port)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.replication_factor == 0 {
            return Err(Error::Config("replication factor must be at least 1".into()));
        }
        if self.availability_max_attempts == 0 {
            return Err(Error::Config("availability_max_attempts must be at least 1".into()));
        }
        Ok(())
    }
}

/// Storage process configuration.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Address this storage node listens on and advertises.
    pub host: String,

    /// Listen port.
    pub port: u16,

    /// Physical node label, unique within the cluster.
    pub node_id: String,

    /// Manager host to register with.
    pub manager_host: String,

    /// Manager port.
    pub manager_port: u16,

    /// Heartbeat emission period.
    pub heartbeat_interval: Duration,

    /// Timeout applied to registration and heartbeat RPCs.
    pub rpc_timeout: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_STORAGE_BASE_PORT,
            node_id: format!("node{}", std::process::id()),
            manager_host: DEFAULT_HOST.to_string(),
            manager_port: DEFAULT_MANAGER_PORT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
        }
    }
}

impl StorageConfig {
    /// Build a config from defaults layered with `RINGSTORE_STORAGE_HOST`,
    /// `RINGSTORE_STORAGE_PORT`, `RINGSTORE_NODE_LABEL`,
    /// `RINGSTORE_MANAGER_HOST`, and `RINGSTORE_MANAGER_PORT`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(host) = env_string("RINGSTORE_STORAGE_HOST") {
            config.host = host;
        }
        if let Some(port) = env_u16("RINGSTORE_STORAGE_PORT") {
            config.port = port;
        }
        if let Some(label) = env_string("RINGSTORE_NODE_LABEL") {
            config.node_id = label;
        }
        if let Some(host) = env_string("RINGSTORE_MANAGER_HOST") {
            config.manager_host = host;
        }
        if let Some(port) = env_u16("RINGSTORE_MANAGER_PORT") {
            config.manager_port = port;
        }
        config
    }

    /// Set the listen/advertise address.
    pub fn with_listen(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    /// Set the physical node label.
    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }

    /// Set the manager address.
    pub fn with_manager(mut self, host: impl Into<String>, port: u16) -> Self {
        self.manager_host = host.into();
        self.manager_port = port;
        self
    }

    /// Set the heartbeat emission period.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// The address this node advertises to the manager.
    pub fn advertised_addr(&self) -> NodeAddress {
        NodeAddress::new(self.host.clone(), self.port)
    }

    /// The manager's address.
    pub fn manager_addr(&self) -> NodeAddress {
        NodeAddress::new(self.manager_host.clone(), self.manager_port)
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Manager host.
    pub manager_host: String,

    /// Manager port.
    pub manager_port: u16,

    /// Timeout applied to every client RPC.
    pub rpc_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            manager_host: DEFAULT_HOST.to_string(),
            manager_port: DEFAULT_MANAGER_PORT,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
        }
    }
}

impl ClientConfig {
    /// Build a config from defaults layered with `RINGSTORE_MANAGER_HOST`
    /// and `RINGSTORE_MANAGER_PORT`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(host) = env_string("RINGSTORE_MANAGER_HOST") {
            config.manager_host = host;
        }
        if let Some(port) = env_u16("RINGSTORE_MANAGER_PORT") {
            config.manager_port = port;
        }
        config
    }

    /// Set the manager address.
    pub fn with_manager(mut self, host: impl Into<String>, port: u16) -> Self {
        self.manager_host = host.into();
        self.manager_port = port;
        self
    }

    /// The manager's address.
    pub fn manager_addr(&self) -> NodeAddress {
        NodeAddress::new(self.manager_host.clone(), self.manager_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manager_defaults() {
        let config = ManagerConfig::default();
        assert_eq!(config.port, 5000);
        assert_eq!(config.replication_factor, 1);
        assert_eq!(config.liveness_timeout, Duration::from_secs(6));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_replication_rejected() {
        let config = ManagerConfig::default().with_replication_factor(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn builder_chains() {
        let config = ManagerConfig::default()
            .with_listen("0.0.0.0", 5050)
            .with_replication_factor(3)
            .with_liveness_timeout(Duration::from_secs(1));
        assert_eq!(config.listen_addr().to_string(), "0.0.0.0:5050");
        assert_eq!(config.replication_factor, 3);
        assert_eq!(config.liveness_timeout, Duration::from_secs(1));
    }

    #[test]
    fn storage_addresses() {
        let config = StorageConfig::default()
            .with_listen("127.0.0.1", 6001)
            .with_node_id("node1")
            .with_manager("127.0.0.1", 5001);
        assert_eq!(config.advertised_addr().to_string(), "127.0.0.1:6001");
        assert_eq!(config.manager_addr().to_string(), "127.0.0.1:5001");
        assert_eq!(config.node_id, "node1");
    }
}
