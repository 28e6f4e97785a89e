//! Node configuration and builder.

use std::net::SocketAddr;
use std::time::Duration;

use crate::arm::ArmConfig;
use crate::core::{DEFAULT_UDP_PORT, NodeError};
use crate::crypto::IdentityPublicKey;
use crate::discovery::DiscoveryConfig;
use crate::transport::TcpFallbackConfig;

/// Node configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    /// UDP address to bind to.
    pub bind_addr: SocketAddr,

    /// Encryption settings.
    pub arm: ArmConfig,

    /// Discovery settings.
    pub discovery: DiscoveryConfig,

    /// TCP fallback settings.
    pub tcp_fallback: TcpFallbackConfig,

    /// Accept children and relay for them.
    pub super_peer_mode: bool,
}

impl NodeConfig {
    /// Check the settings for combinations the node cannot run with.
    pub fn validate(&self) -> Result<(), NodeError> {
        let discovery = &self.discovery;
        if discovery.hello_interval.is_zero() {
            return Err(NodeError::Config("hello interval must not be zero".into()));
        }
        if discovery.hello_timeout <= discovery.hello_interval {
            return Err(NodeError::Config(format!(
                "hello timeout ({:?}) must be larger than the hello interval ({:?})",
                discovery.hello_timeout, discovery.hello_interval
            )));
        }
        if self.arm.retry_interval.is_zero() {
            return Err(NodeError::Config("retry interval must not be zero".into()));
        }
        if self.tcp_fallback.enabled && self.tcp_fallback.super_peer_tcp_address.is_none() {
            return Err(NodeError::Config(
                "tcp fallback enabled without a super peer tcp address".into(),
            ));
        }
        if self.tcp_fallback.server_bind_addr.is_some() && !self.super_peer_mode {
            return Err(NodeError::Config(
                "only super peers accept tcp fallback connections".into(),
            ));
        }
        Ok(())
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_UDP_PORT)),
            arm: ArmConfig::default(),
            discovery: DiscoveryConfig::default(),
            tcp_fallback: TcpFallbackConfig::default(),
            super_peer_mode: false,
        }
    }
}

/// Builder for [`NodeConfig`].
#[derive(Debug, Default)]
pub struct NodeConfigBuilder {
    config: NodeConfig,
}

impl NodeConfigBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bind address.
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.config.bind_addr = addr;
        self
    }

    /// Set the overlay network id.
    pub fn network_id(mut self, network_id: i32) -> Self {
        self.config.discovery.network_id = network_id;
        self
    }

    /// Register with the super peer `key` reachable at `addr`.
    pub fn super_peer(mut self, key: IdentityPublicKey, addr: SocketAddr) -> Self {
        self.config.discovery.super_peers.insert(key, addr);
        self
    }

    /// Act as a super peer.
    pub fn super_peer_mode(mut self, enabled: bool) -> Self {
        self.config.super_peer_mode = enabled;
        self
    }

    /// Set the hello interval.
    pub fn hello_interval(mut self, interval: Duration) -> Self {
        self.config.discovery.hello_interval = interval;
        self
    }

    /// Set the hello timeout.
    pub fn hello_timeout(mut self, timeout: Duration) -> Self {
        self.config.discovery.hello_timeout = timeout;
        self
    }

    /// Replace the discovery settings.
    pub fn discovery(mut self, discovery: DiscoveryConfig) -> Self {
        self.config.discovery = discovery;
        self
    }

    /// Replace the encryption settings.
    pub fn arm(mut self, arm: ArmConfig) -> Self {
        self.config.arm = arm;
        self
    }

    /// Enable or disable ephemeral agreements.
    pub fn perfect_forward_secrecy(mut self, enabled: bool) -> Self {
        self.config.arm.enabled = enabled;
        self
    }

    /// Enable the TCP fallback towards `addr`.
    pub fn tcp_fallback(mut self, addr: SocketAddr) -> Self {
        self.config.tcp_fallback.enabled = true;
        self.config.tcp_fallback.super_peer_tcp_address = Some(addr);
        self
    }

    /// Accept TCP fallback connections from children on `addr`. Needs
    /// super peer mode.
    pub fn tcp_fallback_server(mut self, addr: SocketAddr) -> Self {
        self.config.tcp_fallback.server_bind_addr = Some(addr);
        self
    }

    /// Set the TCP fallback timeout.
    pub fn tcp_fallback_timeout(mut self, timeout: Duration) -> Self {
        self.config.tcp_fallback.timeout = timeout;
        self
    }

    /// Validate and build the configuration.
    pub fn build(self) -> Result<NodeConfig, NodeError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
