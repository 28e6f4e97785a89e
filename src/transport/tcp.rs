//! TCP fallback between children and their super peer.
//!
//! Some networks block UDP entirely. When a child keeps sending to its super
//! peers over UDP without hearing back for [`TcpFallbackConfig::timeout`], it
//! opens a TCP connection to the super peer and tunnels its envelopes through
//! it. As soon as a super peer answers over UDP again the connection is
//! closed.
//!
//! The super peer side is a [`TcpFallbackServer`]. It keeps one writer per
//! connected child, keyed by the child's TCP address, so replies and relayed
//! envelopes for that address go back over the same connection.
//!
//! Frames on the stream are length prefixed:
//!
//! ```text
//! +------------+-------------------+
//! | Length u16 | Envelope (Length) |
//! +------------+-------------------+
//! ```

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::core::{DEFAULT_TCP_FALLBACK_TIMEOUT, MAX_TCP_FRAME_SIZE, TransportError, millis};

/// Outbound frames buffered per fallback connection.
const LINK_QUEUE_SIZE: usize = 256;

/// Pause after a failed accept, e.g. when out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// TCP fallback configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpFallbackConfig {
    /// Whether the fallback may be used.
    pub enabled: bool,
    /// Silence from all super peers after which TCP is tried.
    pub timeout: Duration,
    /// TCP endpoint of the super peer.
    pub super_peer_tcp_address: Option<SocketAddr>,
    /// Where a super peer accepts fallback connections from its children.
    /// Independent of `enabled`, which only governs the child side.
    pub server_bind_addr: Option<SocketAddr>,
}

impl Default for TcpFallbackConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout: DEFAULT_TCP_FALLBACK_TIMEOUT,
            super_peer_tcp_address: None,
            server_bind_addr: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Idle,
    Active,
}

/// Decides when the fallback connection is opened and closed.
#[derive(Debug)]
pub struct TcpFallback {
    timeout: u64,
    super_peer_addrs: HashSet<SocketAddr>,
    no_response_since: u64,
    state: LinkState,
}

impl TcpFallback {
    /// Watch traffic to and from `super_peer_addrs`.
    pub fn new(
        config: &TcpFallbackConfig,
        super_peer_addrs: impl IntoIterator<Item = SocketAddr>,
    ) -> Self {
        Self {
            timeout: millis(config.timeout),
            super_peer_addrs: super_peer_addrs.into_iter().collect(),
            no_response_since: 0,
            state: LinkState::Idle,
        }
    }

    /// Whether `addr` is the UDP address of a super peer.
    pub fn is_super_peer_addr(&self, addr: &SocketAddr) -> bool {
        self.super_peer_addrs.contains(addr)
    }

    /// Whether a fallback connection is open or being opened.
    pub fn is_active(&self) -> bool {
        self.state == LinkState::Active
    }

    /// A datagram is about to be sent to a super peer over UDP.
    ///
    /// Returns `true` when no super peer answered for the timeout and a
    /// fallback connection should be started. The silence counter restarts
    /// then, so attempts happen at most once per timeout.
    pub fn on_udp_send_to_super_peer(&mut self, now: u64) -> bool {
        if self.is_active() {
            return false;
        }
        if self.no_response_since == 0 {
            self.no_response_since = now;
        }
        if self.no_response_since < now.saturating_sub(self.timeout) {
            debug!(
                silent_ms = now - self.no_response_since,
                "super peers unreachable over udp, trying tcp"
            );
            self.no_response_since = now;
            self.state = LinkState::Active;
            return true;
        }
        false
    }

    /// A datagram arrived over UDP from `addr`.
    ///
    /// Returns `true` when it came from a super peer while a fallback
    /// connection is active, meaning the connection should be closed.
    pub fn on_inbound_from(&mut self, addr: &SocketAddr) -> bool {
        if !self.is_super_peer_addr(addr) {
            return false;
        }
        self.no_response_since = 0;
        if self.is_active() {
            debug!(%addr, "super peer reachable over udp again, closing tcp fallback");
            self.state = LinkState::Idle;
            return true;
        }
        false
    }

    /// The fallback connection failed or was closed by the peer.
    pub fn connection_closed(&mut self) {
        self.state = LinkState::Idle;
    }
}

/// Prefix `payload` with its length.
pub fn frame_encode(payload: &[u8]) -> Result<Vec<u8>, TransportError> {
    if payload.len() > MAX_TCP_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge(payload.len()));
    }
    let mut frame = Vec::with_capacity(2 + payload.len());
    frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Reassembles frames from stream chunks.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    /// Empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Next complete frame, if any.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        let header: [u8; 2] = self.buf.get(..2)?.try_into().ok()?;
        let len = u16::from_be_bytes(header) as usize;
        if self.buf.len() < 2 + len {
            return None;
        }
        let frame = self.buf[2..2 + len].to_vec();
        self.buf.drain(..2 + len);
        Some(frame)
    }

    /// Bytes buffered but not yet part of a complete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

/// Open fallback connection, driven by a background task.
///
/// Frames read from the stream are forwarded to the channel passed to
/// [`TcpFallbackLink::connect`] together with the super peer's address.
/// Dropping the link closes the connection.
#[derive(Debug)]
pub struct TcpFallbackLink {
    addr: SocketAddr,
    tx: mpsc::Sender<Vec<u8>>,
    task: JoinHandle<()>,
}

impl TcpFallbackLink {
    /// Connect to `addr` in the background.
    pub fn connect(addr: SocketAddr, inbound: mpsc::Sender<(Vec<u8>, SocketAddr)>) -> Self {
        let (tx, rx) = mpsc::channel(LINK_QUEUE_SIZE);
        let task = tokio::spawn(async move {
            match run_link(addr, rx, inbound).await {
                Ok(()) => debug!(%addr, "tcp fallback closed"),
                Err(e) => warn!(%addr, error = %e, "tcp fallback failed"),
            }
        });
        Self { addr, tx, task }
    }

    /// Address of the super peer.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Queue an envelope for sending.
    pub fn send(&self, payload: &[u8]) -> Result<(), TransportError> {
        let frame = frame_encode(payload)?;
        self.tx.try_send(frame).map_err(|_| TransportError::Closed)
    }

    /// Whether the connection has ended.
    pub fn is_closed(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for TcpFallbackLink {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_link(
    addr: SocketAddr,
    outbound: mpsc::Receiver<Vec<u8>>,
    inbound: mpsc::Sender<(Vec<u8>, SocketAddr)>,
) -> Result<(), TransportError> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    debug!(%addr, "tcp fallback connected");
    pump_frames(&mut stream, addr, outbound, inbound).await
}

/// Forward frames read from `stream` to `inbound` and write frames from
/// `outbound`, until either side ends.
async fn pump_frames(
    stream: &mut TcpStream,
    addr: SocketAddr,
    mut outbound: mpsc::Receiver<Vec<u8>>,
    inbound: mpsc::Sender<(Vec<u8>, SocketAddr)>,
) -> Result<(), TransportError> {
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; 4096];
    loop {
        tokio::select! {
            read = stream.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    return Ok(());
                }
                decoder.extend(&buf[..n]);
                while let Some(frame) = decoder.next_frame() {
                    trace!(%addr, len = frame.len(), "tcp fallback frame received");
                    if inbound.send((frame, addr)).await.is_err() {
                        return Ok(());
                    }
                }
            }
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    return Ok(());
                };
                stream.write_all(&frame).await?;
            }
        }
    }
}

type ClientMap = Arc<Mutex<HashMap<SocketAddr, mpsc::Sender<Vec<u8>>>>>;

/// Accepts fallback connections from children.
///
/// Frames from every child are forwarded to the channel passed to
/// [`TcpFallbackServer::bind`] together with the child's TCP address.
/// Dropping the server stops accepting and closes all connections.
#[derive(Debug)]
pub struct TcpFallbackServer {
    local_addr: SocketAddr,
    clients: ClientMap,
    task: JoinHandle<()>,
}

impl TcpFallbackServer {
    /// Listen on `addr`. Must be called inside a tokio runtime.
    pub fn bind(
        addr: SocketAddr,
        inbound: mpsc::Sender<(Vec<u8>, SocketAddr)>,
    ) -> Result<Self, TransportError> {
        let listener = std::net::TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(listener)?;
        let local_addr = listener.local_addr()?;

        let clients = ClientMap::default();
        let task = tokio::spawn(accept_loop(listener, Arc::clone(&clients), inbound));
        debug!(addr = %local_addr, "tcp fallback server listening");
        Ok(Self {
            local_addr,
            clients,
            task,
        })
    }

    /// Address the server listens on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Whether a child is connected from `addr`.
    pub fn has_client(&self, addr: &SocketAddr) -> bool {
        self.clients
            .lock()
            .is_ok_and(|clients| clients.contains_key(addr))
    }

    /// Number of connected children.
    pub fn client_count(&self) -> usize {
        self.clients.lock().map_or(0, |clients| clients.len())
    }

    /// Queue an envelope for the child connected from `addr`.
    pub fn send(&self, addr: &SocketAddr, payload: &[u8]) -> Result<(), TransportError> {
        let frame = frame_encode(payload)?;
        let clients = self.clients.lock().map_err(|_| TransportError::Closed)?;
        let tx = clients.get(addr).ok_or(TransportError::Closed)?;
        tx.try_send(frame).map_err(|_| TransportError::Closed)
    }
}

impl Drop for TcpFallbackServer {
    fn drop(&mut self) {
        self.task.abort();
        if let Ok(mut clients) = self.clients.lock() {
            clients.clear();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    clients: ClientMap,
    inbound: mpsc::Sender<(Vec<u8>, SocketAddr)>,
) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "tcp fallback accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };
        if inbound.is_closed() {
            return;
        }

        let (tx, rx) = mpsc::channel(LINK_QUEUE_SIZE);
        if let Ok(mut map) = clients.lock() {
            map.insert(addr, tx);
        }
        debug!(%addr, "tcp fallback client connected");
        tokio::spawn(serve_client(stream, addr, rx, Arc::clone(&clients), inbound.clone()));
    }
}

async fn serve_client(
    mut stream: TcpStream,
    addr: SocketAddr,
    outbound: mpsc::Receiver<Vec<u8>>,
    clients: ClientMap,
    inbound: mpsc::Sender<(Vec<u8>, SocketAddr)>,
) {
    let result = match stream.set_nodelay(true) {
        Ok(()) => pump_frames(&mut stream, addr, outbound, inbound).await,
        Err(e) => Err(e.into()),
    };
    if let Ok(mut map) = clients.lock() {
        map.remove(&addr);
    }
    match result {
        Ok(()) => debug!(%addr, "tcp fallback client disconnected"),
        Err(e) => debug!(%addr, error = %e, "tcp fallback client failed"),
    }
}

/// Connect, send one frame and wait for one frame back.
///
/// Used to probe whether a super peer accepts TCP at all.
pub async fn probe(addr: SocketAddr, payload: &[u8]) -> Result<Vec<u8>, TransportError> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(&frame_encode(payload)?).await?;

    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    let mut frame = vec![0u8; u16::from_be_bytes(header) as usize];
    stream.read_exact(&mut frame).await.map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => TransportError::Closed,
        _ => TransportError::Io(e),
    })?;
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_700_000_000_000;

    fn super_peer() -> SocketAddr {
        "192.0.2.10:22527".parse().unwrap()
    }

    fn fallback() -> TcpFallback {
        let config = TcpFallbackConfig {
            enabled: true,
            ..Default::default()
        };
        TcpFallback::new(&config, [super_peer()])
    }

    #[test]
    fn test_fallback_after_silence() {
        let mut fallback = fallback();

        assert!(!fallback.on_udp_send_to_super_peer(NOW));
        assert!(!fallback.on_udp_send_to_super_peer(NOW + 15_000));
        assert!(fallback.on_udp_send_to_super_peer(NOW + 15_001));
        assert!(fallback.is_active());

        // already connected
        assert!(!fallback.on_udp_send_to_super_peer(NOW + 40_000));
    }

    #[test]
    fn test_reply_resets_silence() {
        let mut fallback = fallback();
        fallback.on_udp_send_to_super_peer(NOW);

        assert!(!fallback.on_inbound_from(&super_peer()));
        assert!(!fallback.on_udp_send_to_super_peer(NOW + 20_000));
        assert!(!fallback.on_udp_send_to_super_peer(NOW + 30_000));
    }

    #[test]
    fn test_udp_reply_closes_active_fallback() {
        let mut fallback = fallback();
        fallback.on_udp_send_to_super_peer(NOW);
        assert!(fallback.on_udp_send_to_super_peer(NOW + 20_000));

        assert!(!fallback.on_inbound_from(&"198.51.100.1:1".parse().unwrap()));
        assert!(fallback.on_inbound_from(&super_peer()));
        assert!(!fallback.is_active());
    }

    #[test]
    fn test_retry_after_failed_connection() {
        let mut fallback = fallback();
        fallback.on_udp_send_to_super_peer(NOW);
        assert!(fallback.on_udp_send_to_super_peer(NOW + 20_000));
        fallback.connection_closed();

        // the counter restarted at the attempt
        assert!(!fallback.on_udp_send_to_super_peer(NOW + 30_000));
        assert!(fallback.on_udp_send_to_super_peer(NOW + 35_001));
    }

    #[test]
    fn test_frame_decoder_partial_and_multiple() {
        let mut bytes = frame_encode(b"one").unwrap();
        bytes.extend(frame_encode(b"second").unwrap());

        let mut decoder = FrameDecoder::new();
        decoder.extend(&bytes[..4]);
        assert_eq!(decoder.next_frame(), None);

        decoder.extend(&bytes[4..]);
        assert_eq!(decoder.next_frame().unwrap(), b"one");
        assert_eq!(decoder.next_frame().unwrap(), b"second");
        assert_eq!(decoder.next_frame(), None);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_frame_too_large() {
        let payload = vec![0u8; MAX_TCP_FRAME_SIZE + 1];
        assert!(matches!(
            frame_encode(&payload),
            Err(TransportError::FrameTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn test_link_exchanges_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut header = [0u8; 2];
            socket.read_exact(&mut header).await.unwrap();
            let mut frame = vec![0u8; u16::from_be_bytes(header) as usize];
            socket.read_exact(&mut frame).await.unwrap();
            frame.reverse();
            socket.write_all(&frame_encode(&frame).unwrap()).await.unwrap();
        });

        let (tx, mut rx) = mpsc::channel(8);
        let link = TcpFallbackLink::connect(addr, tx);
        link.send(b"abc").unwrap();

        let (frame, from) = rx.recv().await.unwrap();
        assert_eq!(frame, b"cba");
        assert_eq!(from, addr);
        server.await.unwrap();
    }

    async fn recv(rx: &mut mpsc::Receiver<(Vec<u8>, SocketAddr)>) -> (Vec<u8>, SocketAddr) {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_server_answers_link_on_same_connection() {
        let (server_tx, mut server_rx) = mpsc::channel(8);
        let server = TcpFallbackServer::bind("127.0.0.1:0".parse().unwrap(), server_tx).unwrap();
        let server_addr = server.local_addr();

        let (link_tx, mut link_rx) = mpsc::channel(8);
        let link = TcpFallbackLink::connect(server_addr, link_tx);
        link.send(b"hello from child").unwrap();

        let (frame, child_addr) = recv(&mut server_rx).await;
        assert_eq!(frame, b"hello from child");
        assert!(server.has_client(&child_addr));
        assert_eq!(server.client_count(), 1);

        server.send(&child_addr, b"hello from super peer").unwrap();
        assert_eq!(
            recv(&mut link_rx).await,
            (b"hello from super peer".to_vec(), server_addr)
        );

        drop(link);
        tokio::time::timeout(Duration::from_secs(5), async {
            while server.has_client(&child_addr) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(matches!(
            server.send(&child_addr, b"gone"),
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_server_send_to_unknown_client_fails() {
        let (tx, _rx) = mpsc::channel(8);
        let server = TcpFallbackServer::bind("127.0.0.1:0".parse().unwrap(), tx).unwrap();

        assert!(!server.has_client(&super_peer()));
        assert!(matches!(
            server.send(&super_peer(), b"x"),
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_probe() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 16];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(&buf[..n]).await.unwrap();
        });

        assert_eq!(probe(addr, b"ping").await.unwrap(), b"ping");
    }
}
