//! Arm engine configuration.

use std::time::Duration;

use crate::core::{
    DEFAULT_AGREEMENT_EXPIRE_AFTER, DEFAULT_MAX_AGREEMENTS, DEFAULT_MAX_SESSIONS,
    DEFAULT_RETRY_INTERVAL, DEFAULT_SESSION_EXPIRE_AFTER,
};

/// Arm engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArmConfig {
    /// Negotiate ephemeral agreements. When off, only the long-time key is used.
    pub enabled: bool,

    /// Lifetime of an agreement after its acknowledgement. Zero disables
    /// ephemeral agreements.
    pub expire_after: Duration,

    /// Minimum gap between key exchange (and renewal) messages per peer.
    pub retry_interval: Duration,

    /// Maximum initialized agreements kept per session.
    pub max_agreements: usize,

    /// Maximum number of sessions.
    pub max_sessions: usize,

    /// Idle sessions are dropped after this long.
    pub session_expire_after: Duration,
}

impl ArmConfig {
    /// Whether ephemeral agreements are negotiated.
    pub fn pfs_enabled(&self) -> bool {
        self.enabled && !self.expire_after.is_zero()
    }

    /// How long an initialized agreement stays decryptable after its
    /// acknowledgement. Outlives `expire_after` by one retry interval so
    /// messages sealed just before staleness still open.
    pub fn agreement_retention(&self) -> Duration {
        if self.expire_after.is_zero() {
            return Duration::ZERO;
        }
        self.expire_after.saturating_add(self.retry_interval)
    }
}

impl Default for ArmConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            expire_after: DEFAULT_AGREEMENT_EXPIRE_AFTER,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            max_agreements: DEFAULT_MAX_AGREEMENTS,
            max_sessions: DEFAULT_MAX_SESSIONS,
            session_expire_after: DEFAULT_SESSION_EXPIRE_AFTER,
        }
    }
}
