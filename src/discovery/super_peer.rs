//! Discovery as seen by a super peer: children registry, relaying and
//! rendezvous between children.

use std::collections::HashMap;
use std::net::SocketAddr;

use tracing::{debug, trace};

use super::config::DiscoveryConfig;
use super::message::{DiscoveryMessage, Envelope, Outbound};
use super::peer::ChildrenPeer;
use crate::arm::{ExpiringCache, ExpiryPolicy};
use crate::core::{Clock, MAX_UNITE_ATTEMPTS, NodeEvent, PathKind, SystemClock};
use crate::crypto::IdentityPublicKey;

/// What to do with an envelope received by a super peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayDecision {
    /// Addressed to us; disarm and handle locally.
    Local,
    /// Send `envelope` (hop count already incremented) to `addr`.
    Forward {
        /// Address of the recipient child.
        addr: SocketAddr,
        /// Envelope to send.
        envelope: Envelope,
    },
    /// Recipient unknown or hop limit reached.
    Drop,
}

type UnitePair = (IdentityPublicKey, IdentityPublicKey);

/// Super peer side of the discovery protocol.
#[derive(Debug)]
pub struct SuperPeerHandler<C: Clock = SystemClock> {
    local: IdentityPublicKey,
    config: DiscoveryConfig,
    clock: C,
    children: HashMap<IdentityPublicKey, ChildrenPeer>,
    unite_attempts: Option<ExpiringCache<UnitePair, ()>>,
    outbox: Vec<Outbound>,
    events: Vec<NodeEvent>,
}

impl<C: Clock> SuperPeerHandler<C> {
    /// Create a super peer handler.
    pub fn new(local: IdentityPublicKey, config: DiscoveryConfig, clock: C) -> Self {
        let unite_attempts = (!config.unite_min_interval.is_zero()).then(|| {
            ExpiringCache::new(
                ExpiryPolicy::AfterWrite,
                Some(config.unite_min_interval),
                MAX_UNITE_ATTEMPTS,
            )
        });

        Self {
            local,
            config,
            clock,
            children: HashMap::new(),
            unite_attempts,
            outbox: Vec::new(),
            events: Vec::new(),
        }
    }

    /// Discovery configuration.
    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Record of a registered child.
    pub fn child(&self, key: &IdentityPublicKey) -> Option<&ChildrenPeer> {
        self.children.get(key)
    }

    /// Number of registered children.
    pub fn children_count(&self) -> usize {
        self.children.len()
    }

    /// Children hello: register or refresh the child and acknowledge.
    ///
    /// Hellos without `children_time` or outside the accepted clock offset
    /// are ignored.
    pub fn handle_hello(
        &mut self,
        sender: &IdentityPublicKey,
        time: u64,
        children_time: u64,
        addr: SocketAddr,
    ) -> bool {
        let now = self.clock.now_millis();
        if children_time == 0 || *sender == self.local {
            return false;
        }
        if !self.config.within_time_offset(time, now) {
            trace!(peer = %sender, time, now, "ignoring hello outside time offset");
            return false;
        }

        let path_changed = match self.children.get_mut(sender) {
            Some(child) => {
                let moved = child.addr() != addr;
                child.hello_received(addr, now);
                moved
            }
            None => {
                debug!(peer = %sender, addr = %addr, "new child registered");
                self.children.insert(*sender, ChildrenPeer::new(addr, now));
                true
            }
        };
        if path_changed {
            self.events.push(NodeEvent::PathAdded {
                peer: *sender,
                addr,
                path: PathKind::Children,
            });
        }

        self.outbox.push(Outbound {
            recipient: *sender,
            addr,
            message: DiscoveryMessage::Acknowledgement { time },
        });
        true
    }

    /// Remove children whose last hello is older than the hello timeout.
    pub fn do_stale_peer_check(&mut self) -> usize {
        let now = self.clock.now_millis();
        let hello_timeout = self.config.hello_timeout_ms();
        let events = &mut self.events;
        let before = self.children.len();

        self.children.retain(|key, child| {
            let stale = child.is_stale(now, hello_timeout);
            if stale {
                debug!(peer = %key, "child is stale");
                events.push(NodeEvent::PathRemoved {
                    peer: *key,
                    path: PathKind::Children,
                });
            }
            !stale
        });
        if let Some(attempts) = self.unite_attempts.as_mut() {
            attempts.evict_expired(now);
        }
        before - self.children.len()
    }

    /// Decide what to do with an envelope.
    ///
    /// Envelopes for a known child are forwarded with the hop count
    /// incremented while it stays below the hop limit. When both ends are our
    /// children they are introduced to each other with a unite.
    pub fn relay(&mut self, envelope: &Envelope) -> RelayDecision {
        if envelope.recipient == self.local {
            return RelayDecision::Local;
        }

        let Some(child) = self.children.get(&envelope.recipient) else {
            trace!(recipient = %envelope.recipient, "no child for recipient, dropping");
            return RelayDecision::Drop;
        };
        if envelope.hop_count >= self.config.hop_limit {
            trace!(
                recipient = %envelope.recipient,
                hops = envelope.hop_count,
                "hop limit reached, dropping"
            );
            return RelayDecision::Drop;
        }

        let addr = child.addr();
        let mut forwarded = envelope.clone();
        forwarded.hop_count += 1;

        if self.should_unite(&envelope.sender, &envelope.recipient) {
            self.unite(&envelope.sender, &envelope.recipient);
        }

        RelayDecision::Forward {
            addr,
            envelope: forwarded,
        }
    }

    fn should_unite(&mut self, sender: &IdentityPublicKey, recipient: &IdentityPublicKey) -> bool {
        if !self.children.contains_key(sender) || sender == recipient {
            return false;
        }
        let Some(attempts) = self.unite_attempts.as_mut() else {
            return true;
        };

        let now = self.clock.now_millis();
        let pair = if sender < recipient {
            (*sender, *recipient)
        } else {
            (*recipient, *sender)
        };
        if attempts.contains_key(&pair, now) {
            return false;
        }
        attempts.insert(pair, (), now);
        true
    }

    fn unite(&mut self, sender: &IdentityPublicKey, recipient: &IdentityPublicKey) {
        let (Some(a), Some(b)) = (self.children.get(sender), self.children.get(recipient)) else {
            return;
        };
        let (sender_addr, recipient_addr) = (a.addr(), b.addr());
        debug!(a = %sender, b = %recipient, "initiating rendezvous");

        self.outbox.push(Outbound {
            recipient: *sender,
            addr: sender_addr,
            message: DiscoveryMessage::Unite {
                address: *recipient,
                socket_addr: recipient_addr,
            },
        });
        self.outbox.push(Outbound {
            recipient: *recipient,
            addr: recipient_addr,
            message: DiscoveryMessage::Unite {
                address: *sender,
                socket_addr: sender_addr,
            },
        });
    }

    /// Address of `recipient` if it is one of our children.
    pub fn route(&self, recipient: &IdentityPublicKey) -> Option<SocketAddr> {
        self.children.get(recipient).map(ChildrenPeer::addr)
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
