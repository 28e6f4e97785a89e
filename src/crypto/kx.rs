//! Session key derivation from an X25519 key agreement.
//!
//! ```text
//! shared = X25519(own_secret, peer_public)
//! okm    = HKDF-SHA256(salt = none, ikm = shared,
//!                      info = "canopy v1 session" || lower || higher, 64)
//! lower -> higher = okm[..32]
//! higher -> lower = okm[32..]
//! ```
//!
//! `lower`/`higher` are the two public keys in byte-wise order, so both peers
//! compute the same material and simply pick opposite halves.

use std::cmp::Ordering;

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroize;

use super::aead::SessionKey;
use super::keys::{KeyAgreementKeyPair, KeyAgreementPublicKey, ordered};
use crate::core::{CryptoError, SESSION_KDF_LABEL, SESSION_KEY_SIZE};

/// Directional session keys of one agreement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionPair {
    /// Key for messages we receive.
    pub rx: SessionKey,
    /// Key for messages we send.
    pub tx: SessionKey,
}

/// Derive the session pair between `own` and `peer`.
///
/// Fails with [`CryptoError::InvalidKey`] if both keys are identical and with
/// [`CryptoError::KeyDerivationFailed`] if the shared secret is all zero
/// (low-order peer key).
pub fn derive_session_pair(
    own: &KeyAgreementKeyPair,
    peer: &KeyAgreementPublicKey,
) -> Result<SessionPair, CryptoError> {
    let (lower, higher, ordering) = ordered(own.public_key(), peer);
    if ordering == Ordering::Equal {
        return Err(CryptoError::InvalidKey(
            "cannot agree on a key with ourselves".into(),
        ));
    }

    let shared = own.secret_key().to_dalek().diffie_hellman(&peer.to_dalek());
    if !shared.was_contributory() {
        return Err(CryptoError::KeyDerivationFailed);
    }

    let mut info = Vec::with_capacity(SESSION_KDF_LABEL.len() + 64);
    info.extend_from_slice(SESSION_KDF_LABEL);
    info.extend_from_slice(lower.as_bytes());
    info.extend_from_slice(higher.as_bytes());

    let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
    let mut key_material = [0u8; 2 * SESSION_KEY_SIZE];
    hk.expand(&info, &mut key_material)
        .map_err(|_| CryptoError::KeyDerivationFailed)?;

    let mut low_to_high = [0u8; SESSION_KEY_SIZE];
    let mut high_to_low = [0u8; SESSION_KEY_SIZE];
    low_to_high.copy_from_slice(&key_material[..SESSION_KEY_SIZE]);
    high_to_low.copy_from_slice(&key_material[SESSION_KEY_SIZE..]);
    key_material.zeroize();

    let low_to_high = SessionKey::from_bytes(low_to_high);
    let high_to_low = SessionKey::from_bytes(high_to_low);

    // We are `lower` iff our key sorts first.
    let we_are_lower = own.public_key() == lower;
    Ok(if we_are_lower {
        SessionPair {
            rx: high_to_low,
            tx: low_to_high,
        }
    } else {
        SessionPair {
            rx: low_to_high,
            tx: high_to_low,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_pairs_mirror() {
        let alice = KeyAgreementKeyPair::generate();
        let bob = KeyAgreementKeyPair::generate();

        let a = derive_session_pair(&alice, bob.public_key()).unwrap();
        let b = derive_session_pair(&bob, alice.public_key()).unwrap();

        assert_eq!(a.tx, b.rx);
        assert_eq!(a.rx, b.tx);
        assert_ne!(a.tx, a.rx);
    }

    #[test]
    fn test_distinct_agreements_give_distinct_keys() {
        let alice = KeyAgreementKeyPair::generate();
        let bob = KeyAgreementKeyPair::generate();
        let carol = KeyAgreementKeyPair::generate();

        let ab = derive_session_pair(&alice, bob.public_key()).unwrap();
        let ac = derive_session_pair(&alice, carol.public_key()).unwrap();

        assert_ne!(ab.tx, ac.tx);
    }

    #[test]
    fn test_own_key_rejected() {
        let alice = KeyAgreementKeyPair::generate();
        let result = derive_session_pair(&alice, alice.public_key());

        assert!(matches!(result, Err(CryptoError::InvalidKey(_))));
    }

    #[test]
    fn test_low_order_point_rejected() {
        let alice = KeyAgreementKeyPair::generate();
        let zero = KeyAgreementPublicKey::from_bytes([0u8; 32]);

        let result = derive_session_pair(&alice, &zero);
        assert!(matches!(result, Err(CryptoError::KeyDerivationFailed)));
    }
}
