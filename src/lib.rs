//! # Canopy
//!
//! Embeddable overlay networking core. Nodes exchange application messages
//! addressed by public key, find each other through super peers, punch
//! direct paths through NATs when they can and fall back to relaying or TCP
//! when UDP is blocked.
//!
//! - **Perfect forward secrecy**: every message is sealed with an ephemeral
//!   agreement negotiated per peer, or with the long-time identity key while
//!   none is available
//! - **Discovery**: hello/acknowledgement exchange with super peers, stale
//!   path detection, rendezvous between children
//! - **Single executor**: one task per node owns all protocol state
//!
//! ## Feature Flags
//!
//! - `transport` (default): UDP transport and TCP fallback client
//! - `node` (default): node executor wiring everything together
//!
//! ## Modules
//!
//! - [`core`]: constants, errors, clock, events and collaborator traits
//! - [`crypto`]: X25519 keys, session key derivation, XChaCha20-Poly1305
//! - [`arm`]: agreements, sessions and the arm/disarm engine
//! - [`discovery`]: wire format and path state machines
//! - [`transport`]: socket bindings (requires `transport`)
//! - [`node`]: the node executor (requires `node`)
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use canopy::prelude::*;
//!
//! # async fn run(super_peer: IdentityPublicKey) -> Result<(), NodeError> {
//! let config = NodeConfigBuilder::new()
//!     .super_peer(super_peer, "192.0.2.1:22527".parse().unwrap())
//!     .build()?;
//! let transport = Arc::new(UdpTransport::bind(config.bind_addr).await.map_err(TransportError::from)?);
//!
//! let (node, mut events) = Node::spawn(Identity::generate(), config, transport)?;
//! node.send(super_peer, b"hello".to_vec()).await?;
//!
//! while let Some(event) = events.recv().await {
//!     if let NodeEvent::MessageReceived { peer, payload } = event {
//!         println!("{peer}: {} bytes", payload.len());
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Core module (always included)
pub mod core;

// Cryptographic primitives
pub mod crypto;

// Session-based perfect forward secrecy
pub mod arm;

// Peer discovery and path management
pub mod discovery;

// Socket bindings (feature-gated)
#[cfg(feature = "transport")]
#[cfg_attr(docsrs, doc(cfg(feature = "transport")))]
pub mod transport;

// Node executor (feature-gated)
#[cfg(feature = "node")]
#[cfg_attr(docsrs, doc(cfg(feature = "node")))]
pub mod node;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::arm::{ArmConfig, ArmEngine, Disarmed, EncryptionState};
    pub use crate::core::{
        ArmError, Clock, CodecError, CryptoError, IdentityProvider, ManualClock, NodeError,
        NodeEvent, PathKind, SystemClock, Transport, TransportError,
    };
    pub use crate::crypto::{Identity, IdentityPublicKey};
    pub use crate::discovery::DiscoveryConfig;

    #[cfg(feature = "transport")]
    pub use crate::transport::{TcpFallbackConfig, UdpTransport};

    #[cfg(feature = "node")]
    pub use crate::node::{Node, NodeConfig, NodeConfigBuilder, NodeHandle};
}

// Re-export commonly used items at crate root
pub use core::{NodeError, NodeEvent};
pub use crypto::{Identity, IdentityPublicKey};

#[cfg(feature = "node")]
pub use node::{Node, NodeHandle};
