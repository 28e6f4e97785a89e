//! Discovery as seen by a child: registration with super peers and direct
//! paths to other children.
//!
//! The handler is a state machine without I/O. Callers feed it heartbeats and
//! received messages, then drain the messages it wants to send and the events
//! it emits.

use std::collections::HashMap;
use std::net::SocketAddr;

use tracing::{debug, trace};

use super::config::DiscoveryConfig;
use super::message::{DiscoveryMessage, Outbound};
use super::peer::{SuperPeer, TraversingPeer};
use crate::core::{Clock, NodeEvent, PathKind, SystemClock};
use crate::crypto::IdentityPublicKey;

/// Child side of the discovery protocol.
#[derive(Debug)]
pub struct ChildrenHandler<C: Clock = SystemClock> {
    local: IdentityPublicKey,
    config: DiscoveryConfig,
    clock: C,
    super_peers: HashMap<IdentityPublicKey, SuperPeer>,
    reachable: HashMap<IdentityPublicKey, bool>,
    best_super_peer: Option<IdentityPublicKey>,
    traversing: HashMap<IdentityPublicKey, TraversingPeer>,
    outbox: Vec<Outbound>,
    events: Vec<NodeEvent>,
}

impl<C: Clock> ChildrenHandler<C> {
    /// Create a handler for the super peers in `config`.
    pub fn new(local: IdentityPublicKey, config: DiscoveryConfig, clock: C) -> Self {
        let super_peers: HashMap<_, _> = config
            .super_peers
            .iter()
            .filter(|(key, _)| **key != local)
            .map(|(key, addr)| (*key, SuperPeer::new(*addr)))
            .collect();
        let reachable = super_peers.keys().map(|key| (*key, false)).collect();

        Self {
            local,
            config,
            clock,
            super_peers,
            reachable,
            best_super_peer: None,
            traversing: HashMap::new(),
            outbox: Vec::new(),
            events: Vec::new(),
        }
    }

    /// Discovery configuration.
    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Current default gateway.
    pub fn best_super_peer(&self) -> Option<IdentityPublicKey> {
        self.best_super_peer
    }

    /// Record of a configured super peer.
    pub fn super_peer(&self, key: &IdentityPublicKey) -> Option<&SuperPeer> {
        self.super_peers.get(key)
    }

    /// Whether `key` is one of our super peers.
    pub fn is_super_peer(&self, key: &IdentityPublicKey) -> bool {
        self.super_peers.contains_key(key)
    }

    /// Record of a traversing peer.
    pub fn traversing_peer(&self, key: &IdentityPublicKey) -> Option<&TraversingPeer> {
        self.traversing.get(key)
    }

    /// Number of traversing peers.
    pub fn traversing_count(&self) -> usize {
        self.traversing.len()
    }

    /// Periodic work: pick the best super peer, send children hellos to all
    /// super peers, then drop stale traversing peers and probe the others.
    pub fn do_heartbeat(&mut self) {
        let now = self.clock.now_millis();
        self.determine_best_super_peer(now);

        for (key, peer) in &mut self.super_peers {
            peer.hello_sent(now);
            self.outbox.push(Outbound {
                recipient: *key,
                addr: peer.addr(),
                message: DiscoveryMessage::Hello {
                    time: now,
                    children_time: now,
                },
            });
        }

        let hello_timeout = self.config.hello_timeout_ms();
        let path_idle_time = self.config.path_idle_time_ms();
        let events = &mut self.events;
        let outbox = &mut self.outbox;
        self.traversing.retain(|key, peer| {
            if peer.is_stale(now, hello_timeout, path_idle_time) {
                debug!(peer = %key, "traversing peer is stale, dropping direct path");
                if peer.is_confirmed() {
                    events.push(NodeEvent::PathRemoved {
                        peer: *key,
                        path: PathKind::Traversing,
                    });
                }
                return false;
            }

            peer.hello_sent(now);
            push_probes(outbox, *key, peer, now);
            true
        });
    }

    fn determine_best_super_peer(&mut self, now: u64) {
        let hello_timeout = self.config.hello_timeout_ms();
        let mut best: Option<(u64, IdentityPublicKey)> = None;

        for (key, peer) in &self.super_peers {
            if peer.is_stale(now, hello_timeout) {
                if self.reachable.insert(*key, false) == Some(true) {
                    debug!(peer = %key, "super peer is stale");
                    self.events.push(NodeEvent::PathRemoved {
                        peer: *key,
                        path: PathKind::SuperPeer,
                    });
                }
                continue;
            }

            let candidate = (peer.latency_ms().unwrap_or(u64::MAX), *key);
            if best.is_none_or(|b| candidate < b) {
                best = Some(candidate);
            }
        }

        let best = best.map(|(_, key)| key);
        if best != self.best_super_peer {
            debug!(old = ?self.best_super_peer, new = ?best, "best super peer changed");
            self.best_super_peer = best;
            self.events.push(NodeEvent::SuperPeerChanged { peer: best });
        }
    }

    /// Dispatch a discovery message received from `sender` at `addr`.
    ///
    /// Returns whether the message was accepted.
    pub fn handle_message(
        &mut self,
        sender: &IdentityPublicKey,
        message: &DiscoveryMessage,
        addr: SocketAddr,
    ) -> bool {
        match *message {
            DiscoveryMessage::Acknowledgement { time } if self.is_super_peer(sender) => {
                self.handle_acknowledgement(sender, time, addr)
            }
            DiscoveryMessage::Acknowledgement { time } => {
                self.handle_ack_from_traversing(sender, time, addr)
            }
            DiscoveryMessage::Hello {
                time,
                children_time,
            } => self.handle_hello_from_traversing(sender, time, children_time, addr),
            DiscoveryMessage::Unite {
                address,
                socket_addr,
            } => self.handle_unite(sender, address, socket_addr),
            DiscoveryMessage::Application(_) => false,
        }
    }

    /// Acknowledgement from a super peer, echoing the time of our hello.
    pub fn handle_acknowledgement(
        &mut self,
        sender: &IdentityPublicKey,
        time: u64,
        addr: SocketAddr,
    ) -> bool {
        let now = self.clock.now_millis();
        let Some(peer) = self.super_peers.get_mut(sender) else {
            return false;
        };
        if !self.config.acknowledgement_fresh(time, now) {
            trace!(peer = %sender, time, now, "ignoring outdated acknowledgement");
            return false;
        }

        let latency = now.saturating_sub(time);
        peer.acknowledgement_received(now, latency);
        trace!(peer = %sender, latency, "super peer acknowledged hello");

        if self.reachable.insert(*sender, true) != Some(true) {
            self.events.push(NodeEvent::PathAdded {
                peer: *sender,
                addr,
                path: PathKind::SuperPeer,
            });
        }
        self.determine_best_super_peer(now);
        true
    }

    /// Rendezvous from a super peer: `address` can be reached at `socket_addr`.
    pub fn handle_unite(
        &mut self,
        sender: &IdentityPublicKey,
        address: IdentityPublicKey,
        socket_addr: SocketAddr,
    ) -> bool {
        if !self.is_super_peer(sender) || address == self.local {
            return false;
        }

        let known = self.traversing.contains_key(&address);
        if !known && self.config.max_peers != 0 && self.traversing.len() >= self.config.max_peers {
            debug!(peer = %address, "too many traversing peers, ignoring unite");
            return false;
        }

        let now = self.clock.now_millis();
        let peer = self
            .traversing
            .entry(address)
            .or_insert_with(|| TraversingPeer::new(socket_addr));
        peer.add_candidate(socket_addr);
        peer.application_seen(now);
        peer.hello_sent(now);
        debug!(peer = %address, addr = %socket_addr, "received unite, probing direct path");
        push_probes(&mut self.outbox, address, peer, now);
        true
    }

    /// Hello probe from a traversing peer.
    pub fn handle_hello_from_traversing(
        &mut self,
        sender: &IdentityPublicKey,
        time: u64,
        children_time: u64,
        addr: SocketAddr,
    ) -> bool {
        let now = self.clock.now_millis();
        if children_time != 0 || !self.config.within_time_offset(time, now) {
            return false;
        }
        let Some(peer) = self.traversing.get_mut(sender) else {
            return false;
        };

        peer.set_addr(addr);
        self.outbox.push(Outbound {
            recipient: *sender,
            addr,
            message: DiscoveryMessage::Acknowledgement { time },
        });
        true
    }

    /// Acknowledgement of one of our probes by a traversing peer.
    pub fn handle_ack_from_traversing(
        &mut self,
        sender: &IdentityPublicKey,
        time: u64,
        addr: SocketAddr,
    ) -> bool {
        let now = self.clock.now_millis();
        if !self.config.acknowledgement_fresh(time, now) {
            return false;
        }
        let Some(peer) = self.traversing.get_mut(sender) else {
            return false;
        };

        let first = !peer.is_confirmed();
        let moved = peer.addr() != addr;
        peer.acknowledgement_received(addr, now);
        if first || moved {
            debug!(peer = %sender, addr = %addr, "direct path established");
            self.events.push(NodeEvent::PathAdded {
                peer: *sender,
                addr,
                path: PathKind::Traversing,
            });
        }
        true
    }

    /// Application data from or to `peer` keeps its direct path alive.
    pub fn application_seen(&mut self, peer: &IdentityPublicKey) {
        let now = self.clock.now_millis();
        if let Some(peer) = self.traversing.get_mut(peer) {
            peer.application_seen(now);
        }
    }

    /// Address to send application data for `recipient` to.
    ///
    /// Prefers a confirmed direct path, then the super peer itself, then the
    /// best super peer as default gateway.
    pub fn route(&mut self, recipient: &IdentityPublicKey) -> Option<SocketAddr> {
        let now = self.clock.now_millis();
        let hello_timeout = self.config.hello_timeout_ms();
        let path_idle_time = self.config.path_idle_time_ms();

        if let Some(peer) = self.traversing.get_mut(recipient)
            && peer.is_confirmed()
            && !peer.is_stale(now, hello_timeout, path_idle_time)
        {
            peer.application_seen(now);
            return Some(peer.addr());
        }

        if let Some(peer) = self.super_peers.get(recipient) {
            return Some(peer.addr());
        }

        self.best_super_peer
            .and_then(|key| self.super_peers.get(&key))
            .map(SuperPeer::addr)
    }

    /// Take the messages queued for sending.
    pub fn drain_outbox(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbox)
    }

    /// Take the emitted events.
    pub fn drain_events(&mut self) -> Vec<NodeEvent> {
        std::mem::take(&mut self.events)
    }
}

/// Probe every candidate until one is confirmed, then only the confirmed one.
fn push_probes(outbox: &mut Vec<Outbound>, key: IdentityPublicKey, peer: &TraversingPeer, now: u64) {
    let hello = DiscoveryMessage::Hello {
        time: now,
        children_time: 0,
    };
    if peer.is_confirmed() {
        outbox.push(Outbound {
            recipient: key,
            addr: peer.addr(),
            message: hello,
        });
    } else {
        for addr in peer.candidates() {
            outbox.push(Outbound {
                recipient: key,
                addr: *addr,
                message: hello.clone(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::core::ManualClock;

    const START: u64 = 1_700_000_000_000;

    fn key(byte: u8) -> IdentityPublicKey {
        IdentityPublicKey::from_bytes([byte; 32])
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([198, 51, 100, 1], port))
    }

    fn handler(super_peers: &[(u8, u16)]) -> (ChildrenHandler<ManualClock>, ManualClock) {
        let clock = ManualClock::new(START);
        let mut config = DiscoveryConfig::default();
        for (k, port) in super_peers {
            config = config.with_super_peer(key(*k), addr(*port));
        }
        (ChildrenHandler::new(key(0), config, clock.clone()), clock)
    }

    #[test]
    fn test_heartbeat_sends_children_hellos() {
        let (mut handler, _clock) = handler(&[(1, 1000), (2, 2000)]);
        handler.do_heartbeat();

        let outbox = handler.drain_outbox();
        assert_eq!(outbox.len(), 2);
        for out in outbox {
            assert_eq!(
                out.message,
                DiscoveryMessage::Hello {
                    time: START,
                    children_time: START
                }
            );
        }
    }

    #[test]
    fn test_ack_selects_lowest_latency() {
        let (mut handler, clock) = handler(&[(1, 1000), (2, 2000)]);
        handler.do_heartbeat();
        handler.drain_events();

        clock.advance(Duration::from_millis(80));
        assert!(handler.handle_acknowledgement(&key(1), START, addr(1000)));
        assert_eq!(handler.best_super_peer(), Some(key(1)));

        clock.advance(Duration::from_millis(0));
        handler.handle_acknowledgement(&key(2), START + 60, addr(2000));
        // latency 20 beats 80
        assert_eq!(handler.best_super_peer(), Some(key(2)));

        let events = handler.drain_events();
        assert!(events.contains(&NodeEvent::PathAdded {
            peer: key(1),
            addr: addr(1000),
            path: PathKind::SuperPeer
        }));
        assert!(events.contains(&NodeEvent::SuperPeerChanged { peer: Some(key(2)) }));
    }

    #[test]
    fn test_ack_outside_window_ignored() {
        let (mut handler, clock) = handler(&[(1, 1000)]);
        handler.do_heartbeat();

        clock.advance(Duration::from_secs(31));
        assert!(!handler.handle_acknowledgement(&key(1), START, addr(1000)));
        assert!(!handler.handle_acknowledgement(&key(9), START + 31_000, addr(1000)));
        assert_eq!(handler.super_peer(&key(1)).unwrap().latency_ms(), None);
    }

    #[test]
    fn test_stale_super_peer_removed_once() {
        let (mut handler, clock) = handler(&[(1, 1000)]);
        handler.do_heartbeat();
        handler.handle_acknowledgement(&key(1), START, addr(1000));
        handler.drain_events();

        // hellos keep being sent but no acknowledgement arrives
        clock.advance(Duration::from_secs(31));
        handler.do_heartbeat();
        clock.advance(Duration::from_secs(5));
        handler.do_heartbeat();

        let events = handler.drain_events();
        let removed = events
            .iter()
            .filter(|e| matches!(e, NodeEvent::PathRemoved { path: PathKind::SuperPeer, .. }))
            .count();
        assert_eq!(removed, 1);
        assert!(events.contains(&NodeEvent::SuperPeerChanged { peer: None }));
        assert_eq!(handler.route(&key(7)), None);
    }

    #[test]
    fn test_route_prefers_super_peer_then_gateway() {
        let (mut handler, clock) = handler(&[(1, 1000), (2, 2000)]);
        handler.do_heartbeat();
        clock.advance(Duration::from_millis(10));
        handler.handle_acknowledgement(&key(1), START, addr(1000));

        assert_eq!(handler.route(&key(2)), Some(addr(2000)));
        assert_eq!(handler.route(&key(7)), Some(addr(1000)));
    }

    #[test]
    fn test_unite_probes_and_confirms_direct_path() {
        let (mut handler, clock) = handler(&[(1, 1000)]);
        handler.do_heartbeat();
        handler.handle_acknowledgement(&key(1), START, addr(1000));
        handler.drain_outbox();
        handler.drain_events();

        assert!(handler.handle_unite(&key(1), key(5), addr(5000)));
        let probes = handler.drain_outbox();
        assert_eq!(probes.len(), 1);
        assert_eq!(probes[0].recipient, key(5));
        assert_eq!(probes[0].addr, addr(5000));

        // not confirmed yet, so the gateway is used
        assert_eq!(handler.route(&key(5)), Some(addr(1000)));

        clock.advance(Duration::from_millis(15));
        assert!(handler.handle_ack_from_traversing(&key(5), START, addr(5001)));
        assert_eq!(handler.route(&key(5)), Some(addr(5001)));
        assert!(handler.drain_events().contains(&NodeEvent::PathAdded {
            peer: key(5),
            addr: addr(5001),
            path: PathKind::Traversing
        }));
    }

    #[test]
    fn test_repeated_traversing_ack_adds_path_once() {
        let (mut handler, clock) = handler(&[(1, 1000)]);
        handler.handle_unite(&key(1), key(5), addr(5000));
        handler.drain_events();

        assert!(handler.handle_ack_from_traversing(&key(5), START, addr(5000)));
        assert_eq!(handler.drain_events().len(), 1);

        clock.advance(Duration::from_secs(5));
        assert!(handler.handle_ack_from_traversing(&key(5), clock.now_millis(), addr(5000)));
        assert!(handler.drain_events().is_empty());

        // a new endpoint is reported again
        assert!(handler.handle_ack_from_traversing(&key(5), clock.now_millis(), addr(5009)));
        assert_eq!(
            handler.drain_events(),
            vec![NodeEvent::PathAdded {
                peer: key(5),
                addr: addr(5009),
                path: PathKind::Traversing
            }]
        );
    }

    #[test]
    fn test_unite_from_unknown_sender_ignored() {
        let (mut handler, _clock) = handler(&[(1, 1000)]);
        assert!(!handler.handle_unite(&key(9), key(5), addr(5000)));
        assert!(!handler.handle_unite(&key(1), key(0), addr(5000)));
        assert_eq!(handler.traversing_count(), 0);
    }

    #[test]
    fn test_unite_respects_max_peers() {
        let (mut handler, _clock) = handler(&[(1, 1000)]);
        handler.config.max_peers = 1;

        assert!(handler.handle_unite(&key(1), key(5), addr(5000)));
        assert!(!handler.handle_unite(&key(1), key(6), addr(6000)));
        // refreshing a known peer is still allowed
        assert!(handler.handle_unite(&key(1), key(5), addr(5002)));
        assert_eq!(handler.traversing_peer(&key(5)).unwrap().candidates().len(), 2);
    }

    #[test]
    fn test_hello_from_traversing_peer_is_acknowledged() {
        let (mut handler, _clock) = handler(&[(1, 1000)]);
        handler.handle_unite(&key(1), key(5), addr(5000));
        handler.drain_outbox();

        assert!(handler.handle_hello_from_traversing(&key(5), START - 100, 0, addr(5003)));
        let out = handler.drain_outbox();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].addr, addr(5003));
        assert_eq!(
            out[0].message,
            DiscoveryMessage::Acknowledgement { time: START - 100 }
        );

        // children joins and unknown peers are not ours to answer
        assert!(!handler.handle_hello_from_traversing(&key(5), START, START, addr(5003)));
        assert!(!handler.handle_hello_from_traversing(&key(6), START, 0, addr(6000)));
    }

    #[test]
    fn test_hello_outside_time_offset_ignored() {
        let (mut handler, _clock) = handler(&[(1, 1000)]);
        handler.handle_unite(&key(1), key(5), addr(5000));
        handler.drain_outbox();

        assert!(!handler.handle_hello_from_traversing(&key(5), START - 60_001, 0, addr(5000)));
        assert!(!handler.handle_hello_from_traversing(&key(5), START + 60_001, 0, addr(5000)));
        assert!(handler.drain_outbox().is_empty());
    }

    #[test]
    fn test_idle_traversing_peer_dropped() {
        let (mut handler, clock) = handler(&[(1, 1000)]);
        handler.handle_unite(&key(1), key(5), addr(5000));
        handler.handle_ack_from_traversing(&key(5), START, addr(5000));
        handler.drain_events();

        for _ in 0..13 {
            clock.advance(Duration::from_secs(5));
            handler.handle_ack_from_traversing(&key(5), clock.now_millis(), addr(5000));
            handler.do_heartbeat();
        }

        assert!(handler.traversing_peer(&key(5)).is_none());
        assert!(handler.drain_events().contains(&NodeEvent::PathRemoved {
            peer: key(5),
            path: PathKind::Traversing
        }));
    }
}
