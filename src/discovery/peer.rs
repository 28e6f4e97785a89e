//! Per-peer discovery records.
//!
//! All times are epoch milliseconds; zero means "never". A record is stale
//! when its most recent contact is older than the configured timeout.

use std::net::SocketAddr;

use super::rtt::RttEstimator;
use crate::core::MAX_TRAVERSING_CANDIDATES;

/// `t` lies more than `timeout` in the past.
fn expired(t: u64, now: u64, timeout: u64) -> bool {
    t < now.saturating_sub(timeout)
}

/// A super peer as seen by one of its children.
#[derive(Debug, Clone)]
pub struct SuperPeer {
    addr: SocketAddr,
    first_hello_at: u64,
    last_ack_at: u64,
    rtt: RttEstimator,
}

impl SuperPeer {
    /// Record for a configured super peer.
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            first_hello_at: 0,
            last_ack_at: 0,
            rtt: RttEstimator::new(),
        }
    }

    /// Address of the super peer.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// A hello was sent. Only the first one counts.
    pub fn hello_sent(&mut self, now: u64) {
        if self.first_hello_at == 0 {
            self.first_hello_at = now;
        }
    }

    /// An acknowledgement arrived with the given latency sample.
    pub fn acknowledgement_received(&mut self, now: u64, latency_ms: u64) {
        self.last_ack_at = now;
        self.rtt.update(latency_ms);
    }

    /// Smoothed latency, `None` before the first acknowledgement.
    pub fn latency_ms(&self) -> Option<u64> {
        self.rtt.latency_ms()
    }

    /// RTT estimate.
    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    /// Time of the last acknowledgement.
    pub fn last_ack_at(&self) -> u64 {
        self.last_ack_at
    }

    /// Stale when neither the first hello nor the last acknowledgement is
    /// within `hello_timeout`.
    pub fn is_stale(&self, now: u64, hello_timeout: u64) -> bool {
        expired(self.first_hello_at.max(self.last_ack_at), now, hello_timeout)
    }
}

/// A child as seen by its super peer.
#[derive(Debug, Clone)]
pub struct ChildrenPeer {
    addr: SocketAddr,
    last_hello_at: u64,
}

impl ChildrenPeer {
    /// Record for a child first heard at `now`.
    pub fn new(addr: SocketAddr, now: u64) -> Self {
        Self {
            addr,
            last_hello_at: now,
        }
    }

    /// Address the child's hellos come from.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// A hello arrived from `addr`. Children behind NATs may change their
    /// public endpoint, so the address follows the latest hello.
    pub fn hello_received(&mut self, addr: SocketAddr, now: u64) {
        self.addr = addr;
        self.last_hello_at = now;
    }

    /// Time of the last hello.
    pub fn last_hello_at(&self) -> u64 {
        self.last_hello_at
    }

    /// Stale when the last hello is older than `hello_timeout`.
    pub fn is_stale(&self, now: u64, hello_timeout: u64) -> bool {
        expired(self.last_hello_at, now, hello_timeout)
    }
}

/// A peer reached directly after a rendezvous.
#[derive(Debug, Clone)]
pub struct TraversingPeer {
    addr: SocketAddr,
    candidates: Vec<SocketAddr>,
    first_hello_at: u64,
    last_ack_at: u64,
    last_application_at: u64,
}

impl TraversingPeer {
    /// Record for a peer announced at `addr`.
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            candidates: vec![addr],
            first_hello_at: 0,
            last_ack_at: 0,
            last_application_at: 0,
        }
    }

    /// Confirmed (or most recently announced) address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Addresses to probe.
    pub fn candidates(&self) -> &[SocketAddr] {
        &self.candidates
    }

    /// Add a candidate address announced by a super peer.
    ///
    /// Keeps the most recent [`MAX_TRAVERSING_CANDIDATES`] addresses, never
    /// dropping the current one.
    pub fn add_candidate(&mut self, addr: SocketAddr) {
        if !self.candidates.contains(&addr) {
            self.candidates.push(addr);
        }
        if self.last_ack_at == 0 {
            self.addr = addr;
        }
        while self.candidates.len() > MAX_TRAVERSING_CANDIDATES {
            let Some(oldest) = self.candidates.iter().position(|c| *c != self.addr) else {
                break;
            };
            self.candidates.remove(oldest);
        }
    }

    /// Switch to `addr`, the address the peer was actually heard from.
    pub fn set_addr(&mut self, addr: SocketAddr) {
        self.add_candidate(addr);
        self.addr = addr;
    }

    /// A hello was sent. Only the first one counts.
    pub fn hello_sent(&mut self, now: u64) {
        if self.first_hello_at == 0 {
            self.first_hello_at = now;
        }
    }

    /// An acknowledgement arrived from `addr`. The confirmed address
    /// replaces all other candidates.
    pub fn acknowledgement_received(&mut self, addr: SocketAddr, now: u64) {
        self.addr = addr;
        self.candidates = vec![addr];
        self.last_ack_at = now;
    }

    /// Application data was sent to or received from the peer.
    pub fn application_seen(&mut self, now: u64) {
        self.last_application_at = now;
    }

    /// Whether the direct path was confirmed by an acknowledgement.
    pub fn is_confirmed(&self) -> bool {
        self.last_ack_at > 0
    }

    /// Stale when idle for longer than `path_idle_time` or when neither the
    /// first hello nor the last acknowledgement is within `hello_timeout`.
    pub fn is_stale(&self, now: u64, hello_timeout: u64, path_idle_time: u64) -> bool {
        expired(self.last_application_at, now, path_idle_time)
            || expired(self.first_hello_at.max(self.last_ack_at), now, hello_timeout)
    }
}
