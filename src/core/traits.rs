//! Narrow interfaces to the collaborators of the core.
//!
//! The arm engine and discovery handlers never touch sockets or key storage
//! directly. They talk to a [`Transport`] ("send bytes to address") and an
//! [`IdentityProvider`] (local static key pair, fresh ephemeral key pairs).

use std::future::Future;
use std::net::SocketAddr;

use super::error::TransportError;
use crate::crypto::{Identity, KeyAgreementKeyPair};

/// Datagram transport used by the node.
///
/// # Example
///
/// ```ignore
/// struct Loopback(tokio::sync::mpsc::Sender<(Vec<u8>, SocketAddr)>);
///
/// impl Transport for Loopback {
///     async fn send_to(&self, bytes: &[u8], addr: SocketAddr) -> Result<(), TransportError> {
///         self.0.send((bytes.to_vec(), addr)).await.map_err(|_| TransportError::Closed)
///     }
///
///     async fn recv_from(&self, _buf: &mut [u8]) -> Result<(usize, SocketAddr), TransportError> {
///         std::future::pending().await
///     }
///
///     fn local_addr(&self) -> Result<SocketAddr, TransportError> {
///         Ok("127.0.0.1:0".parse().unwrap())
///     }
/// }
/// ```
pub trait Transport: Send + Sync + 'static {
    /// Send one datagram to `addr`.
    fn send_to(
        &self,
        bytes: &[u8],
        addr: SocketAddr,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Receive one datagram into `buf`.
    ///
    /// Transports fed through `NodeHandle::deliver_datagram` may never
    /// resolve here.
    fn recv_from(
        &self,
        buf: &mut [u8],
    ) -> impl Future<Output = Result<(usize, SocketAddr), TransportError>> + Send;

    /// Address the transport is bound to.
    fn local_addr(&self) -> Result<SocketAddr, TransportError>;
}

/// Source of the local key material.
pub trait IdentityProvider: Send + Sync {
    /// Local static identity. Its public key is the overlay address and the
    /// long-time key agreement key at once.
    fn identity(&self) -> &Identity;

    /// Fresh ephemeral key pair for a new agreement.
    fn generate_key_agreement_pair(&self) -> KeyAgreementKeyPair {
        KeyAgreementKeyPair::generate()
    }
}

impl IdentityProvider for Identity {
    fn identity(&self) -> &Identity {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_provides_itself() {
        let identity = Identity::generate();
        assert_eq!(identity.identity().public_key(), identity.public_key());
    }

    #[test]
    fn test_ephemeral_pairs_are_fresh() {
        let identity = Identity::generate();
        let a = identity.generate_key_agreement_pair();
        let b = identity.generate_key_agreement_pair();

        assert_ne!(a.public_key(), b.public_key());
        assert_ne!(
            a.public_key(),
            identity.key_agreement_key_pair().public_key()
        );
    }
}
