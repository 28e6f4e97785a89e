//! The node executor.
//!
//! One task owns the arm engine and the discovery handlers. Inbound
//! datagrams, commands from [`NodeHandle`]s and the heartbeat timer are
//! serialized through a single `select!` loop, so none of the state needs a
//! lock. After every step the loop runs the deferred arm work and sends what
//! the engine and the handlers queued.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use super::config::NodeConfig;
use crate::arm::{ArmEngine, ArmedMessage, Disarmed};
use crate::core::{
    Clock, DEFAULT_RECV_BUFFER_SIZE, NodeError, NodeEvent, PathKind, SystemClock, Transport,
    TransportError,
};
use crate::crypto::{Identity, IdentityPublicKey};
use crate::discovery::{
    ChildrenHandler, DiscoveryMessage, Envelope, Outbound, RelayDecision, SuperPeerHandler,
};
use crate::transport::{TcpFallback, TcpFallbackLink, TcpFallbackServer};

/// Capacity of the command, inbound and event channels.
const CHANNEL_SIZE: usize = 256;

/// Upper bound of flush rounds per step.
const MAX_FLUSH_ROUNDS: usize = 16;

enum Command {
    Send {
        peer: IdentityPublicKey,
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<(), NodeError>>,
    },
    Datagram {
        bytes: Vec<u8>,
        from: SocketAddr,
    },
    Shutdown,
}

/// Handle to a running node. Cheap to clone.
#[derive(Debug, Clone)]
pub struct NodeHandle {
    local: IdentityPublicKey,
    local_addr: Option<SocketAddr>,
    tcp_addr: Option<SocketAddr>,
    commands: mpsc::Sender<Command>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Send { peer, payload, .. } => f
                .debug_struct("Send")
                .field("peer", peer)
                .field("len", &payload.len())
                .finish(),
            Self::Datagram { bytes, from } => f
                .debug_struct("Datagram")
                .field("from", from)
                .field("len", &bytes.len())
                .finish(),
            Self::Shutdown => f.write_str("Shutdown"),
        }
    }
}

impl NodeHandle {
    /// Overlay address of the node.
    pub fn public_key(&self) -> IdentityPublicKey {
        self.local
    }

    /// Address the transport is bound to, if it reported one.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Address the TCP fallback server listens on, for super peers running
    /// one.
    pub fn tcp_fallback_addr(&self) -> Option<SocketAddr> {
        self.tcp_addr
    }

    /// Send `payload` to `peer`.
    ///
    /// Resolves once the envelope was handed to the transport. Fails with
    /// [`NodeError::NoRoute`] when no path to `peer` is known.
    pub async fn send(
        &self,
        peer: IdentityPublicKey,
        payload: impl Into<Vec<u8>>,
    ) -> Result<(), NodeError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Send {
                peer,
                payload: payload.into(),
                reply,
            })
            .await
            .map_err(|_| NodeError::Shutdown)?;
        rx.await.map_err(|_| NodeError::Shutdown)?
    }

    /// Feed a datagram received outside the node's own transport.
    pub async fn deliver_datagram(
        &self,
        bytes: impl Into<Vec<u8>>,
        from: SocketAddr,
    ) -> Result<(), NodeError> {
        self.commands
            .send(Command::Datagram {
                bytes: bytes.into(),
                from,
            })
            .await
            .map_err(|_| NodeError::Shutdown)
    }

    /// Stop the node. Timers are cancelled and all agreements are dropped.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }

    /// Whether the node task has stopped.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

/// Overlay node: arm engine, discovery and transport wired together.
pub struct Node<T: Transport, C: Clock + Clone = SystemClock> {
    local: IdentityPublicKey,
    config: NodeConfig,
    clock: C,
    engine: ArmEngine<C, Identity>,
    children: ChildrenHandler<C>,
    super_peer: Option<SuperPeerHandler<C>>,
    transport: Arc<T>,
    fallback: Option<TcpFallback>,
    link: Option<TcpFallbackLink>,
    server: Option<TcpFallbackServer>,
    tcp_tx: mpsc::Sender<(Vec<u8>, SocketAddr)>,
    events: mpsc::Sender<NodeEvent>,
}

impl<T: Transport> Node<T, SystemClock> {
    /// Start a node on the current tokio runtime.
    pub fn spawn(
        identity: Identity,
        config: NodeConfig,
        transport: Arc<T>,
    ) -> Result<(NodeHandle, mpsc::Receiver<NodeEvent>), NodeError> {
        Self::spawn_with_clock(identity, config, transport, SystemClock)
    }
}

impl<T: Transport, C: Clock + Clone + 'static> Node<T, C> {
    /// Start a node driven by `clock`.
    pub fn spawn_with_clock(
        identity: Identity,
        config: NodeConfig,
        transport: Arc<T>,
        clock: C,
    ) -> Result<(NodeHandle, mpsc::Receiver<NodeEvent>), NodeError> {
        config.validate()?;

        let local = identity.public_key();
        let local_addr = transport.local_addr().ok();
        let (command_tx, command_rx) = mpsc::channel(CHANNEL_SIZE);
        let (event_tx, event_rx) = mpsc::channel(CHANNEL_SIZE);
        let (udp_tx, udp_rx) = mpsc::channel(CHANNEL_SIZE);
        let (tcp_tx, tcp_rx) = mpsc::channel(CHANNEL_SIZE);

        let engine = ArmEngine::new(identity, config.arm.clone(), clock.clone());
        let children = ChildrenHandler::new(local, config.discovery.clone(), clock.clone());
        let super_peer = config
            .super_peer_mode
            .then(|| SuperPeerHandler::new(local, config.discovery.clone(), clock.clone()));
        let server = match config.tcp_fallback.server_bind_addr {
            Some(addr) if config.super_peer_mode => {
                Some(TcpFallbackServer::bind(addr, tcp_tx.clone())?)
            }
            _ => None,
        };
        let tcp_addr = server.as_ref().map(TcpFallbackServer::local_addr);
        let fallback = config.tcp_fallback.enabled.then(|| {
            TcpFallback::new(
                &config.tcp_fallback,
                config.discovery.super_peers.values().copied(),
            )
        });

        let node = Self {
            local,
            config,
            clock,
            engine,
            children,
            super_peer,
            transport: Arc::clone(&transport),
            fallback,
            link: None,
            server,
            tcp_tx,
            events: event_tx,
        };

        let receiver = tokio::spawn(receive_loop(transport, udp_tx));
        tokio::spawn(node.run(command_rx, udp_rx, tcp_rx, receiver));
        info!(peer = %local, addr = ?local_addr, tcp = ?tcp_addr, "node started");

        let handle = NodeHandle {
            local,
            local_addr,
            tcp_addr,
            commands: command_tx,
        };
        Ok((handle, event_rx))
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut udp_rx: mpsc::Receiver<(Vec<u8>, SocketAddr)>,
        mut tcp_rx: mpsc::Receiver<(Vec<u8>, SocketAddr)>,
        receiver: JoinHandle<()>,
    ) {
        let mut heartbeat = tokio::time::interval(self.config.discovery.hello_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = heartbeat.tick() => self.on_heartbeat(),
                Some((bytes, from)) = udp_rx.recv() => self.on_datagram(&bytes, from, true).await,
                Some((bytes, from)) = tcp_rx.recv() => self.on_datagram(&bytes, from, false).await,
                command = commands.recv() => match command {
                    Some(Command::Send { peer, payload, reply }) => {
                        let result = self.send_application(peer, payload).await;
                        let _ = reply.send(result);
                    }
                    Some(Command::Datagram { bytes, from }) => {
                        self.on_datagram(&bytes, from, true).await;
                    }
                    Some(Command::Shutdown) | None => break,
                },
            }
            self.flush().await;
        }

        receiver.abort();
        self.link = None;
        self.server = None;
        info!(peer = %self.local, "node stopped");
    }

    fn on_heartbeat(&mut self) {
        trace!("heartbeat");
        self.children.do_heartbeat();
        if let Some(super_peer) = self.super_peer.as_mut() {
            super_peer.do_stale_peer_check();
        }
        let evicted = self.engine.evict_idle_sessions();
        if evicted > 0 {
            debug!(evicted, "evicted idle sessions");
        }
        self.check_link();
    }

    async fn on_datagram(&mut self, bytes: &[u8], from: SocketAddr, via_udp: bool) {
        if via_udp
            && let Some(fallback) = self.fallback.as_mut()
            && fallback.on_inbound_from(&from)
        {
            self.close_link();
        }

        let envelope = match Envelope::decode(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                trace!(%from, error = %e, "dropping undecodable datagram");
                return;
            }
        };
        if envelope.network_id != self.config.discovery.network_id {
            trace!(%from, network_id = envelope.network_id, "dropping envelope of foreign network");
            return;
        }
        if envelope.sender == self.local {
            trace!(%from, "dropping envelope sent by ourselves");
            return;
        }

        if envelope.recipient != self.local {
            self.relay(&envelope).await;
            return;
        }

        let sender = envelope.sender;
        let payload = match self.engine.disarm_inbound(&sender, &envelope.armed) {
            Ok(Disarmed::Application(payload)) => payload,
            Ok(Disarmed::Consumed) => return,
            Err(e) => {
                debug!(peer = %sender, error = %e, "dropping undecryptable envelope");
                return;
            }
        };

        match DiscoveryMessage::decode(&payload) {
            Ok(DiscoveryMessage::Application(payload)) => {
                self.children.application_seen(&sender);
                self.emit(NodeEvent::MessageReceived {
                    peer: sender,
                    payload,
                });
            }
            Ok(DiscoveryMessage::Hello {
                time,
                children_time,
            }) if children_time > 0 => {
                if let Some(super_peer) = self.super_peer.as_mut() {
                    super_peer.handle_hello(&sender, time, children_time, from);
                }
            }
            Ok(message) => {
                self.children.handle_message(&sender, &message, from);
            }
            Err(e) => debug!(peer = %sender, error = %e, "dropping malformed discovery message"),
        }
    }

    async fn relay(&mut self, envelope: &Envelope) {
        let Some(super_peer) = self.super_peer.as_mut() else {
            trace!(recipient = %envelope.recipient, "not a super peer, dropping envelope for other peer");
            return;
        };
        if let RelayDecision::Forward { addr, envelope } = super_peer.relay(envelope)
            && let Err(e) = self.transmit(&envelope.encode(), addr).await
        {
            warn!(recipient = %envelope.recipient, %addr, error = %e, "relay failed");
        }
    }

    async fn send_application(
        &mut self,
        peer: IdentityPublicKey,
        payload: Vec<u8>,
    ) -> Result<(), NodeError> {
        if peer == self.local {
            self.emit(NodeEvent::MessageReceived { peer, payload });
            return Ok(());
        }

        let addr = self
            .route(&peer)
            .ok_or_else(|| NodeError::NoRoute(peer.to_string()))?;
        let armed = self
            .engine
            .arm_outbound(&peer, &DiscoveryMessage::Application(payload).encode())?;
        self.send_envelope(peer, armed, addr).await
    }

    fn route(&mut self, peer: &IdentityPublicKey) -> Option<SocketAddr> {
        self.super_peer
            .as_ref()
            .and_then(|super_peer| super_peer.route(peer))
            .or_else(|| self.children.route(peer))
    }

    async fn send_discovery(&mut self, outbound: Outbound) -> Result<(), NodeError> {
        let armed = self
            .engine
            .arm_outbound(&outbound.recipient, &outbound.message.encode())?;
        self.send_envelope(outbound.recipient, armed, outbound.addr)
            .await
    }

    async fn send_envelope(
        &mut self,
        recipient: IdentityPublicKey,
        armed: ArmedMessage,
        addr: SocketAddr,
    ) -> Result<(), NodeError> {
        let envelope = Envelope {
            network_id: self.config.discovery.network_id,
            hop_count: 0,
            sender: self.local,
            recipient,
            armed,
        };
        self.transmit(&envelope.encode(), addr).await?;
        Ok(())
    }

    async fn transmit(&mut self, bytes: &[u8], addr: SocketAddr) -> Result<(), TransportError> {
        // Children that joined over TCP are only reachable through their connection.
        if let Some(server) = self.server.as_ref()
            && server.has_client(&addr)
        {
            return server.send(&addr, bytes);
        }

        if self.fallback.as_ref().is_some_and(|f| f.is_super_peer_addr(&addr)) {
            self.check_link();
            if let Some(link) = self.link.as_ref() {
                return link.send(bytes);
            }

            let now = self.clock.now_millis();
            if self
                .fallback
                .as_mut()
                .is_some_and(|f| f.on_udp_send_to_super_peer(now))
            {
                self.open_link(addr);
                if let Some(link) = self.link.as_ref() {
                    return link.send(bytes);
                }
            }
        }

        self.transport.send_to(bytes, addr).await
    }

    fn open_link(&mut self, udp_addr: SocketAddr) {
        let Some(tcp_addr) = self.config.tcp_fallback.super_peer_tcp_address else {
            return;
        };
        info!(%tcp_addr, "opening tcp fallback to super peer");
        self.link = Some(TcpFallbackLink::connect(tcp_addr, self.tcp_tx.clone()));
        if let Some(peer) = self.super_peer_at(udp_addr) {
            self.emit(NodeEvent::PathAdded {
                peer,
                addr: tcp_addr,
                path: PathKind::TcpFallback,
            });
        }
    }

    fn check_link(&mut self) {
        if self.link.as_ref().is_some_and(TcpFallbackLink::is_closed) {
            self.close_link();
            if let Some(fallback) = self.fallback.as_mut() {
                fallback.connection_closed();
            }
        }
    }

    fn close_link(&mut self) {
        if self.link.take().is_none() {
            return;
        }
        let peers: Vec<_> = self
            .config
            .discovery
            .super_peers
            .keys()
            .copied()
            .collect();
        for peer in peers {
            self.emit(NodeEvent::PathRemoved {
                peer,
                path: PathKind::TcpFallback,
            });
        }
    }

    fn super_peer_at(&self, addr: SocketAddr) -> Option<IdentityPublicKey> {
        self.config
            .discovery
            .super_peers
            .iter()
            .find(|(_, a)| **a == addr)
            .map(|(key, _)| *key)
    }

    /// Run deferred arm work and send everything queued, until quiet.
    async fn flush(&mut self) {
        for _ in 0..MAX_FLUSH_ROUNDS {
            self.engine.run_deferred();

            let mut discovery = self.children.drain_outbox();
            if let Some(super_peer) = self.super_peer.as_mut() {
                discovery.extend(super_peer.drain_outbox());
            }
            let protocol = self.engine.drain_outbox();

            let mut events = self.engine.drain_events();
            events.extend(self.children.drain_events());
            if let Some(super_peer) = self.super_peer.as_mut() {
                events.extend(super_peer.drain_events());
            }
            for event in events {
                self.emit(event);
            }

            if discovery.is_empty() && protocol.is_empty() {
                if self.engine.deferred_len() == 0 {
                    return;
                }
                continue;
            }

            for outbound in discovery {
                let recipient = outbound.recipient;
                if let Err(e) = self.send_discovery(outbound).await {
                    warn!(peer = %recipient, error = %e, "failed to send discovery message");
                }
            }
            for outgoing in protocol {
                let Some(addr) = self.route(&outgoing.peer) else {
                    debug!(peer = %outgoing.peer, "no route for key exchange message, dropping");
                    continue;
                };
                if let Err(e) = self.send_envelope(outgoing.peer, outgoing.armed, addr).await {
                    warn!(peer = %outgoing.peer, error = %e, "failed to send key exchange message");
                }
            }
        }
    }

    fn emit(&self, event: NodeEvent) {
        if let Err(mpsc::error::TrySendError::Full(event)) = self.events.try_send(event) {
            warn!(?event, "event channel full, dropping event");
        }
    }
}

async fn receive_loop<T: Transport>(
    transport: Arc<T>,
    inbound: mpsc::Sender<(Vec<u8>, SocketAddr)>,
) {
    let mut buf = vec![0u8; DEFAULT_RECV_BUFFER_SIZE];
    loop {
        match transport.recv_from(&mut buf).await {
            Ok((len, from)) => {
                if inbound.send((buf[..len].to_vec(), from)).await.is_err() {
                    return;
                }
            }
            Err(TransportError::Closed) => return,
            Err(e) => warn!(error = %e, "receive failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::node::NodeConfigBuilder;
    use crate::transport::UdpTransport;

    async fn udp() -> Arc<UdpTransport> {
        Arc::new(
            UdpTransport::bind("127.0.0.1:0".parse().unwrap())
                .await
                .unwrap(),
        )
    }

    async fn next_message(events: &mut mpsc::Receiver<NodeEvent>) -> (IdentityPublicKey, Vec<u8>) {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("timed out waiting for event")
                .expect("event channel closed");
            if let NodeEvent::MessageReceived { peer, payload } = event {
                return (peer, payload);
            }
        }
    }

    #[tokio::test]
    async fn test_send_without_route_fails() {
        let config = NodeConfigBuilder::new().build().unwrap();
        let (handle, _events) = Node::spawn(Identity::generate(), config, udp().await).unwrap();

        let result = handle
            .send(IdentityPublicKey::from_bytes([9; 32]), b"hi".to_vec())
            .await;
        assert!(matches!(result, Err(NodeError::NoRoute(_))));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_send_to_self_is_delivered_locally() {
        let identity = Identity::generate();
        let local = identity.public_key();
        let (handle, mut events) =
            Node::spawn(identity, NodeConfig::default(), udp().await).unwrap();

        handle.send(local, b"loop".to_vec()).await.unwrap();
        assert_eq!(next_message(&mut events).await, (local, b"loop".to_vec()));
    }

    #[tokio::test]
    async fn test_child_reaches_super_peer() {
        let super_identity = Identity::generate();
        let super_key = super_identity.public_key();
        let super_transport = udp().await;
        let super_addr = super_transport.local_addr().unwrap();

        let super_config = NodeConfigBuilder::new().super_peer_mode(true).build().unwrap();
        let (super_handle, mut super_events) =
            Node::spawn(super_identity, super_config, super_transport).unwrap();

        let child_identity = Identity::generate();
        let child_key = child_identity.public_key();
        let child_config = NodeConfigBuilder::new()
            .super_peer(super_key, super_addr)
            .build()
            .unwrap();
        let (child, _child_events) =
            Node::spawn(child_identity, child_config, udp().await).unwrap();

        child.send(super_key, b"hello super".to_vec()).await.unwrap();
        assert_eq!(
            next_message(&mut super_events).await,
            (child_key, b"hello super".to_vec())
        );

        child.shutdown().await;
        super_handle.shutdown().await;
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

    #[tokio::test]
    async fn test_child_without_udp_joins_over_tcp() {
        let super_identity = Identity::generate();
        let super_key = super_identity.public_key();
        let super_config = NodeConfigBuilder::new()
            .super_peer_mode(true)
            .tcp_fallback_server("127.0.0.1:0".parse().unwrap())
            .build()
            .unwrap();
        let (super_handle, mut super_events) =
            Node::spawn(super_identity, super_config, udp().await).unwrap();
        let tcp_addr = super_handle.tcp_fallback_addr().unwrap();

        // Nothing answers on this UDP address.
        let silent = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let child_identity = Identity::generate();
        let child_key = child_identity.public_key();
        let child_config = NodeConfigBuilder::new()
            .super_peer(super_key, silent.local_addr().unwrap())
            .hello_interval(Duration::from_millis(100))
            .tcp_fallback(tcp_addr)
            .tcp_fallback_timeout(Duration::from_millis(200))
            .build()
            .unwrap();
        let (child, mut child_events) =
            Node::spawn(child_identity, child_config, udp().await).unwrap();

        wait_for(&mut child_events, |e| {
            matches!(e, NodeEvent::PathAdded { path: PathKind::TcpFallback, .. })
        })
        .await;
        let registered = wait_for(&mut child_events, |e| {
            matches!(e, NodeEvent::PathAdded { path: PathKind::SuperPeer, .. })
        })
        .await;
        assert_eq!(
            registered,
            NodeEvent::PathAdded {
                peer: super_key,
                addr: tcp_addr,
                path: PathKind::SuperPeer,
            }
        );

        child.send(super_key, b"up the pipe".to_vec()).await.unwrap();
        assert_eq!(
            next_message(&mut super_events).await,
            (child_key, b"up the pipe".to_vec())
        );

        super_handle.send(child_key, b"down the pipe".to_vec()).await.unwrap();
        assert_eq!(
            next_message(&mut child_events).await,
            (super_key, b"down the pipe".to_vec())
        );

        child.shutdown().await;
        super_handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_closes_handle() {
        let (handle, _events) =
            Node::spawn(Identity::generate(), NodeConfig::default(), udp().await).unwrap();
        handle.shutdown().await;

        tokio::time::timeout(Duration::from_secs(1), async {
            while !handle.is_closed() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(matches!(
            handle.send(handle.public_key(), b"x".to_vec()).await,
            Err(NodeError::Shutdown)
        ));
    }
}
