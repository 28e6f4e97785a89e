//! Children and a super peer exchanging discovery messages over an
//! in-memory network, plus one relay run across real UDP sockets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use canopy::arm::{AgreementId, ArmedMessage};
use canopy::core::{AEAD_NONCE_SIZE, AEAD_TAG_SIZE, ManualClock, NodeEvent, PathKind, Transport};
use canopy::crypto::{Identity, IdentityPublicKey};
use canopy::discovery::{
    ChildrenHandler, DiscoveryConfig, DiscoveryMessage, Envelope, Outbound, RelayDecision,
    SuperPeerHandler,
};
use canopy::node::{Node, NodeConfigBuilder};
use canopy::transport::UdpTransport;
use tokio::sync::mpsc;

const START: u64 = 1_700_000_000_000;

fn key(byte: u8) -> IdentityPublicKey {
    IdentityPublicKey::from_bytes([byte; 32])
}

fn addr(last: u8) -> SocketAddr {
    SocketAddr::from(([198, 51, 100, last], 22527))
}

const SP: u8 = 1;
const A: u8 = 10;
const B: u8 = 20;

struct Network {
    clock: ManualClock,
    super_peer: SuperPeerHandler<ManualClock>,
    a: ChildrenHandler<ManualClock>,
    b: ChildrenHandler<ManualClock>,
}

impl Network {
    fn new() -> Self {
        let clock = ManualClock::new(START);
        let config = DiscoveryConfig::default().with_super_peer(key(SP), addr(SP));
        Self {
            super_peer: SuperPeerHandler::new(key(SP), DiscoveryConfig::default(), clock.clone()),
            a: ChildrenHandler::new(key(A), config.clone(), clock.clone()),
            b: ChildrenHandler::new(key(B), config, clock.clone()),
            clock,
        }
    }

    fn heartbeat(&mut self) {
        self.a.do_heartbeat();
        self.b.do_heartbeat();
        self.pump();
    }

    /// Deliver queued messages until every outbox is empty.
    fn pump(&mut self) {
        loop {
            let mut queued: Vec<(u8, Outbound)> = Vec::new();
            queued.extend(self.super_peer.drain_outbox().into_iter().map(|o| (SP, o)));
            queued.extend(self.a.drain_outbox().into_iter().map(|o| (A, o)));
            queued.extend(self.b.drain_outbox().into_iter().map(|o| (B, o)));
            if queued.is_empty() {
                break;
            }
            for (from, outbound) in queued {
                self.deliver(from, outbound);
            }
        }
    }

    fn deliver(&mut self, from: u8, outbound: Outbound) {
        let sender = key(from);
        let source = addr(from);
        if outbound.addr == addr(SP) {
            if let DiscoveryMessage::Hello {
                time,
                children_time,
            } = outbound.message
            {
                self.super_peer.handle_hello(&sender, time, children_time, source);
            }
        } else if outbound.addr == addr(A) {
            self.a.handle_message(&sender, &outbound.message, source);
        } else if outbound.addr == addr(B) {
            self.b.handle_message(&sender, &outbound.message, source);
        }
    }
}

fn envelope(sender: u8, recipient: u8, hop_count: u8) -> Envelope {
    Envelope {
        network_id: 1,
        hop_count,
        sender: key(sender),
        recipient: key(recipient),
        armed: ArmedMessage {
            agreement_id: AgreementId::from_bytes([3; 32]),
            nonce: [0; AEAD_NONCE_SIZE],
            ciphertext: vec![0; AEAD_TAG_SIZE],
        },
    }
}

#[test]
fn test_children_register_with_super_peer() {
    let mut net = Network::new();
    net.heartbeat();

    assert_eq!(net.super_peer.children_count(), 2);
    assert_eq!(net.super_peer.route(&key(A)), Some(addr(A)));
    assert_eq!(net.a.best_super_peer(), Some(key(SP)));

    let events = net.a.drain_events();
    assert!(events.contains(&NodeEvent::SuperPeerChanged {
        peer: Some(key(SP))
    }));
    assert!(events.contains(&NodeEvent::PathAdded {
        peer: key(SP),
        addr: addr(SP),
        path: PathKind::SuperPeer,
    }));

    assert_eq!(net.super_peer.drain_events().len(), 2);

    // Steady state heartbeats add no further path events.
    net.clock.advance(Duration::from_secs(5));
    net.heartbeat();
    assert!(net.a.drain_events().is_empty());
    assert!(net.super_peer.drain_events().is_empty());
}

#[test]
fn test_relay_unites_children() {
    let mut net = Network::new();
    net.heartbeat();
    net.a.drain_events();

    // Until the children know each other, traffic goes through the gateway.
    assert_eq!(net.a.route(&key(B)), Some(addr(SP)));

    match net.super_peer.relay(&envelope(A, B, 0)) {
        RelayDecision::Forward { addr: to, envelope } => {
            assert_eq!(to, addr(B));
            assert_eq!(envelope.hop_count, 1);
        }
        other => panic!("expected forward, got {other:?}"),
    }
    net.pump();

    assert!(net.a.traversing_peer(&key(B)).unwrap().is_confirmed());
    assert!(net.b.traversing_peer(&key(A)).unwrap().is_confirmed());
    assert_eq!(net.a.route(&key(B)), Some(addr(B)));
    assert_eq!(net.b.route(&key(A)), Some(addr(A)));
    assert!(net.a.drain_events().contains(&NodeEvent::PathAdded {
        peer: key(B),
        addr: addr(B),
        path: PathKind::Traversing,
    }));

    // A second envelope inside the unite interval is only forwarded.
    assert!(matches!(
        net.super_peer.relay(&envelope(B, A, 0)),
        RelayDecision::Forward { .. }
    ));
    assert!(net.super_peer.drain_outbox().is_empty());
}

#[test]
fn test_silent_children_go_stale() {
    let mut net = Network::new();
    net.heartbeat();
    net.super_peer.relay(&envelope(A, B, 0));
    net.pump();
    net.a.drain_events();
    net.super_peer.drain_events();

    net.clock.advance(Duration::from_secs(31));
    assert_eq!(net.super_peer.do_stale_peer_check(), 2);
    assert!(net.super_peer.drain_events().contains(&NodeEvent::PathRemoved {
        peer: key(B),
        path: PathKind::Children,
    }));
    assert_eq!(net.super_peer.relay(&envelope(A, B, 0)), RelayDecision::Drop);

    net.a.do_heartbeat();
    let events = net.a.drain_events();
    assert!(events.contains(&NodeEvent::PathRemoved {
        peer: key(SP),
        path: PathKind::SuperPeer,
    }));
    assert!(events.contains(&NodeEvent::PathRemoved {
        peer: key(B),
        path: PathKind::Traversing,
    }));
    assert!(events.contains(&NodeEvent::SuperPeerChanged { peer: None }));
    assert!(net.a.traversing_peer(&key(B)).is_none());
    assert_eq!(net.a.route(&key(B)), None);
}

#[test]
fn test_hop_limit_bounds_relaying() {
    let mut net = Network::new();
    net.heartbeat();
    let limit = DiscoveryConfig::default().hop_limit;

    match net.super_peer.relay(&envelope(A, B, limit - 1)) {
        RelayDecision::Forward { envelope, .. } => assert_eq!(envelope.hop_count, limit),
        other => panic!("expected forward, got {other:?}"),
    }
    assert_eq!(net.super_peer.relay(&envelope(A, B, limit)), RelayDecision::Drop);
    assert_eq!(net.super_peer.relay(&envelope(A, 99, 0)), RelayDecision::Drop);
    assert_eq!(net.super_peer.relay(&envelope(A, SP, 0)), RelayDecision::Local);
}

async fn wait_for(
    events: &mut mpsc::Receiver<NodeEvent>,
    mut pred: impl FnMut(&NodeEvent) -> bool,
) -> NodeEvent {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed");
        if pred(&event) {
            return event;
        }
    }
}

async fn udp() -> Arc<UdpTransport> {
    Arc::new(
        UdpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap(),
    )
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[tokio::test]
async fn test_message_relayed_between_children() {
    init_tracing();
    let super_identity = Identity::generate();
    let super_key = super_identity.public_key();
    let super_transport = udp().await;
    let super_addr = super_transport.local_addr().unwrap();
    let super_config = NodeConfigBuilder::new().super_peer_mode(true).build().unwrap();
    let (super_handle, _super_events) =
        Node::spawn(super_identity, super_config, super_transport).unwrap();

    let child_config = || {
        NodeConfigBuilder::new()
            .super_peer(super_key, super_addr)
            .build()
            .unwrap()
    };
    let a_identity = Identity::generate();
    let a_key = a_identity.public_key();
    let (a, mut a_events) = Node::spawn(a_identity, child_config(), udp().await).unwrap();
    let b_identity = Identity::generate();
    let b_key = b_identity.public_key();
    let (b, mut b_events) = Node::spawn(b_identity, child_config(), udp().await).unwrap();

    let registered = |e: &NodeEvent| {
        matches!(e, NodeEvent::PathAdded { path: PathKind::SuperPeer, .. })
    };
    wait_for(&mut a_events, registered).await;
    wait_for(&mut b_events, registered).await;

    a.send(b_key, b"through the canopy".to_vec()).await.unwrap();
    let event = wait_for(&mut b_events, |e| matches!(e, NodeEvent::MessageReceived { .. })).await;
    assert_eq!(
        event,
        NodeEvent::MessageReceived {
            peer: a_key,
            payload: b"through the canopy".to_vec(),
        }
    );

    a.shutdown().await;
    b.shutdown().await;
    super_handle.shutdown().await;
}
