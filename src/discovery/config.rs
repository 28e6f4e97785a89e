//! Discovery configuration.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use crate::core::{
    DEFAULT_HELLO_INTERVAL, DEFAULT_HELLO_TIMEOUT, DEFAULT_HOP_LIMIT, DEFAULT_MAX_PEERS,
    DEFAULT_MAX_TIME_OFFSET, DEFAULT_NETWORK_ID, DEFAULT_PATH_IDLE_TIME,
    DEFAULT_UNITE_MIN_INTERVAL, millis,
};
use crate::crypto::IdentityPublicKey;

/// Discovery configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryConfig {
    /// Overlay network id. Envelopes of other networks are dropped.
    pub network_id: i32,

    /// Heartbeat interval (hellos and stale peer checks).
    pub hello_interval: Duration,

    /// Peers without contact for this long are stale.
    pub hello_timeout: Duration,

    /// Maximum accepted offset between a message timestamp and our clock.
    pub max_time_offset: Duration,

    /// Direct paths without application traffic for this long are dropped.
    pub path_idle_time: Duration,

    /// Maximum number of traversing peers. Zero means unlimited.
    pub max_peers: usize,

    /// Maximum hop count of relayed messages.
    pub hop_limit: u8,

    /// Minimum gap between two rendezvous for the same pair of children.
    /// Zero disables the throttle.
    pub unite_min_interval: Duration,

    /// Super peers to register with.
    pub super_peers: HashMap<IdentityPublicKey, SocketAddr>,
}

impl DiscoveryConfig {
    /// Add a super peer.
    pub fn with_super_peer(mut self, key: IdentityPublicKey, addr: SocketAddr) -> Self {
        self.super_peers.insert(key, addr);
        self
    }

    pub(crate) fn hello_timeout_ms(&self) -> u64 {
        millis(self.hello_timeout)
    }

    pub(crate) fn max_time_offset_ms(&self) -> u64 {
        millis(self.max_time_offset)
    }

    pub(crate) fn path_idle_time_ms(&self) -> u64 {
        millis(self.path_idle_time)
    }

    /// Whether a message stamped `time` lies within the accepted clock offset.
    pub fn within_time_offset(&self, time: u64, now: u64) -> bool {
        time.abs_diff(now) <= self.max_time_offset_ms()
    }

    /// Whether an acknowledgement echoing `time` is recent enough to count.
    pub fn acknowledgement_fresh(&self, time: u64, now: u64) -> bool {
        time > now.saturating_sub(self.hello_timeout_ms()) && self.within_time_offset(time, now)
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            network_id: DEFAULT_NETWORK_ID,
            hello_interval: DEFAULT_HELLO_INTERVAL,
            hello_timeout: DEFAULT_HELLO_TIMEOUT,
            max_time_offset: DEFAULT_MAX_TIME_OFFSET,
            path_idle_time: DEFAULT_PATH_IDLE_TIME,
            max_peers: DEFAULT_MAX_PEERS,
            hop_limit: DEFAULT_HOP_LIMIT,
            unite_min_interval: DEFAULT_UNITE_MIN_INTERVAL,
            super_peers: HashMap::new(),
        }
    }
}
