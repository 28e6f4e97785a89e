//! Upward notifications emitted by the core.

use std::net::SocketAddr;

use crate::crypto::IdentityPublicKey;

/// Kind of path a peer is reachable through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PathKind {
    /// We are a child of this super peer.
    SuperPeer,
    /// This peer is one of our children (we are a super peer).
    Children,
    /// Direct path established by hole punching.
    Traversing,
    /// TCP connection to a super peer.
    TcpFallback,
}

/// Event delivered to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// A peer became reachable.
    PathAdded {
        /// Remote peer.
        peer: IdentityPublicKey,
        /// Address of the path.
        addr: SocketAddr,
        /// Path kind.
        path: PathKind,
    },

    /// A peer is no longer reachable through `path`.
    PathRemoved {
        /// Remote peer.
        peer: IdentityPublicKey,
        /// Path kind.
        path: PathKind,
    },

    /// Traffic with `peer` is protected by the long-time key only.
    LongTimeEncryption {
        /// Remote peer.
        peer: IdentityPublicKey,
    },

    /// Traffic with `peer` is protected by an ephemeral agreement.
    PerfectForwardSecrecyEncryption {
        /// Remote peer.
        peer: IdentityPublicKey,
    },

    /// Application payload received.
    MessageReceived {
        /// Sender.
        peer: IdentityPublicKey,
        /// Decrypted payload.
        payload: Vec<u8>,
    },

    /// The default gateway changed.
    SuperPeerChanged {
        /// New best super peer, `None` if none is reachable.
        peer: Option<IdentityPublicKey>,
    },
}

impl NodeEvent {
    /// Peer the event is about, if any.
    pub fn peer(&self) -> Option<&IdentityPublicKey> {
        match self {
            Self::PathAdded { peer, .. }
            | Self::PathRemoved { peer, .. }
            | Self::LongTimeEncryption { peer }
            | Self::PerfectForwardSecrecyEncryption { peer }
            | Self::MessageReceived { peer, .. } => Some(peer),
            Self::SuperPeerChanged { peer } => peer.as_ref(),
        }
    }
}
