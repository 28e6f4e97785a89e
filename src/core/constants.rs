//! Protocol constants and configuration defaults.
//!
//! Sizes are fixed by the wire format and MUST NOT be changed. Durations are
//! only defaults; every one of them can be overridden through
//! [`ArmConfig`](crate::arm::ArmConfig) or
//! [`DiscoveryConfig`](crate::discovery::DiscoveryConfig).

use std::time::Duration;

// =============================================================================
// CRYPTOGRAPHIC CONSTANTS
// =============================================================================

/// X25519 public key size.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// X25519 secret key size.
pub const SECRET_KEY_SIZE: usize = 32;

/// Agreement id size (SHA-256 output).
pub const AGREEMENT_ID_SIZE: usize = 32;

/// Session key size (XChaCha20).
pub const SESSION_KEY_SIZE: usize = 32;

/// XChaCha20 nonce size.
pub const AEAD_NONCE_SIZE: usize = 24;

/// Poly1305 authentication tag size.
pub const AEAD_TAG_SIZE: usize = 16;

/// HKDF info label for session key derivation.
pub const SESSION_KDF_LABEL: &[u8] = b"canopy v1 session";

// =============================================================================
// ARM MESSAGE TYPES
// =============================================================================

/// Application payload (opaque to the arm engine).
pub const ARM_TYPE_APPLICATION: u8 = 0x01;

/// Key exchange carrying an ephemeral key agreement public key.
pub const ARM_TYPE_KEY_EXCHANGE: u8 = 0x02;

/// Key exchange acknowledgement carrying an agreement id.
pub const ARM_TYPE_ACKNOWLEDGEMENT: u8 = 0x03;

// =============================================================================
// DISCOVERY MESSAGE TYPES
// =============================================================================

/// Hello (ping) towards a super peer or traversing peer.
pub const DISCOVERY_TYPE_HELLO: u8 = 0x10;

/// Acknowledgement (pong) for a hello.
pub const DISCOVERY_TYPE_ACKNOWLEDGEMENT: u8 = 0x11;

/// Unite (rendezvous) sent by a super peer.
pub const DISCOVERY_TYPE_UNITE: u8 = 0x12;

/// Application data routed through the overlay.
pub const DISCOVERY_TYPE_APPLICATION: u8 = 0x13;

// =============================================================================
// ENVELOPE
// =============================================================================

/// Magic number prefixing every envelope.
pub const ENVELOPE_MAGIC: u32 = 0x1E2F_C0DE;

/// Envelope header size (magic + network id + hop count + sender + recipient).
pub const ENVELOPE_HEADER_SIZE: usize = 4 + 4 + 1 + PUBLIC_KEY_SIZE + PUBLIC_KEY_SIZE;

/// Armed message header size (agreement id + nonce).
pub const ARMED_HEADER_SIZE: usize = AGREEMENT_ID_SIZE + AEAD_NONCE_SIZE;

/// Maximum TCP fallback frame size (u16 length prefix).
pub const MAX_TCP_FRAME_SIZE: usize = u16::MAX as usize;

// =============================================================================
// ARM DEFAULTS
// =============================================================================

/// Lifetime of a PFS agreement after its acknowledgement.
pub const DEFAULT_AGREEMENT_EXPIRE_AFTER: Duration = Duration::from_secs(300);

/// Minimum gap between two key exchange (or renewal) messages for a peer.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Maximum number of initialized agreements kept per session.
pub const DEFAULT_MAX_AGREEMENTS: usize = 100;

/// Maximum number of sessions kept by the engine.
pub const DEFAULT_MAX_SESSIONS: usize = 100_000;

/// Sessions idle for this long are evicted.
pub const DEFAULT_SESSION_EXPIRE_AFTER: Duration = Duration::from_secs(300);

// =============================================================================
// DISCOVERY DEFAULTS
// =============================================================================

/// Default overlay network id.
pub const DEFAULT_NETWORK_ID: i32 = 1;

/// Hello/heartbeat interval.
pub const DEFAULT_HELLO_INTERVAL: Duration = Duration::from_secs(5);

/// Peers without contact for this long are stale.
pub const DEFAULT_HELLO_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum accepted clock offset of a received message's timestamp.
pub const DEFAULT_MAX_TIME_OFFSET: Duration = Duration::from_secs(60);

/// Direct paths without application traffic for this long are dropped.
pub const DEFAULT_PATH_IDLE_TIME: Duration = Duration::from_secs(60);

/// Maximum number of traversing peers (0 = unlimited).
pub const DEFAULT_MAX_PEERS: usize = 100;

/// Maximum number of relays a message may take.
pub const DEFAULT_HOP_LIMIT: u8 = 8;

/// Minimum gap between two rendezvous attempts for the same pair of children.
pub const DEFAULT_UNITE_MIN_INTERVAL: Duration = Duration::from_secs(20);

/// Maximum number of remembered rendezvous attempts.
pub const MAX_UNITE_ATTEMPTS: usize = 1_000;

/// Maximum candidate addresses remembered per unconfirmed direct path.
pub const MAX_TRAVERSING_CANDIDATES: usize = 8;

// =============================================================================
// TRANSPORT DEFAULTS
// =============================================================================

/// Default UDP bind port.
pub const DEFAULT_UDP_PORT: u16 = 22527;

/// No super peer reply for this long triggers the TCP fallback.
pub const DEFAULT_TCP_FALLBACK_TIMEOUT: Duration = Duration::from_secs(15);

/// Default receive buffer size.
pub const DEFAULT_RECV_BUFFER_SIZE: usize = 65535;
