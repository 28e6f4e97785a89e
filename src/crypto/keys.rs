//! X25519 key management.
//!
//! A node identity is an X25519 static key pair: the public half is the node's
//! overlay address and, at the same time, its long-time key agreement key.
//! Ephemeral key pairs are generated per PFS agreement.

use std::cmp::Ordering;
use std::fmt;

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::core::{CryptoError, PUBLIC_KEY_SIZE, SECRET_KEY_SIZE};

/// Write the first four bytes of `bytes` as lowercase hex.
fn fmt_short(bytes: &[u8], f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for b in bytes.iter().take(4) {
        write!(f, "{b:02x}")?;
    }
    Ok(())
}

/// Write all of `bytes` as lowercase hex.
pub(crate) fn fmt_hex(bytes: &[u8], f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for b in bytes {
        write!(f, "{b:02x}")?;
    }
    Ok(())
}

/// Public key used for key agreement (long-time or ephemeral).
///
/// Ordered byte-wise so both peers agree on which key comes first.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyAgreementPublicKey([u8; PUBLIC_KEY_SIZE]);

impl KeyAgreementPublicKey {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create from a slice, checking the length.
    pub fn try_from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let key: [u8; PUBLIC_KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey(format!("expected {PUBLIC_KEY_SIZE} bytes, got {}", bytes.len())))?;
        Ok(Self(key))
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    pub(crate) fn to_dalek(self) -> PublicKey {
        PublicKey::from(self.0)
    }
}

impl fmt::Debug for KeyAgreementPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyAgreementPublicKey(")?;
        fmt_short(&self.0, f)?;
        write!(f, ")")
    }
}

impl fmt::Display for KeyAgreementPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_short(&self.0, f)
    }
}

/// Secret key used for key agreement. Zeroized on drop.
#[derive(Clone)]
pub struct KeyAgreementSecretKey([u8; SECRET_KEY_SIZE]);

impl KeyAgreementSecretKey {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; SECRET_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw key bytes.
    ///
    /// # Security
    /// Handle with care - this exposes sensitive key material.
    pub fn as_bytes(&self) -> &[u8; SECRET_KEY_SIZE] {
        &self.0
    }

    pub(crate) fn to_dalek(&self) -> StaticSecret {
        StaticSecret::from(self.0)
    }
}

impl Drop for KeyAgreementSecretKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for KeyAgreementSecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyAgreementSecretKey(..)")
    }
}

/// An X25519 key pair.
#[derive(Clone, Debug)]
pub struct KeyAgreementKeyPair {
    public: KeyAgreementPublicKey,
    secret: KeyAgreementSecretKey,
}

impl KeyAgreementKeyPair {
    /// Generate a new random key pair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        Self::from_dalek(secret)
    }

    /// Rebuild a key pair from its secret half.
    pub fn from_secret(secret: [u8; SECRET_KEY_SIZE]) -> Self {
        Self::from_dalek(StaticSecret::from(secret))
    }

    fn from_dalek(secret: StaticSecret) -> Self {
        let public = PublicKey::from(&secret);
        Self {
            public: KeyAgreementPublicKey(public.to_bytes()),
            secret: KeyAgreementSecretKey(secret.to_bytes()),
        }
    }

    /// Get the public key.
    pub fn public_key(&self) -> &KeyAgreementPublicKey {
        &self.public
    }

    /// Get the secret key.
    pub fn secret_key(&self) -> &KeyAgreementSecretKey {
        &self.secret
    }
}

/// Overlay address of a node: the public half of its static key pair.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityPublicKey([u8; PUBLIC_KEY_SIZE]);

impl IdentityPublicKey {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create from a slice, checking the length.
    pub fn try_from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        KeyAgreementPublicKey::try_from_slice(bytes).map(|k| Self(k.0))
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    /// The long-time key agreement key belonging to this identity.
    pub fn long_time_key_agreement_key(&self) -> KeyAgreementPublicKey {
        KeyAgreementPublicKey(self.0)
    }
}

impl fmt::Debug for IdentityPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityPublicKey(")?;
        fmt_short(&self.0, f)?;
        write!(f, ")")
    }
}

impl fmt::Display for IdentityPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_short(&self.0, f)
    }
}

/// Local node identity.
#[derive(Clone, Debug)]
pub struct Identity {
    key_agreement: KeyAgreementKeyPair,
}

impl Identity {
    /// Generate a fresh identity.
    pub fn generate() -> Self {
        Self {
            key_agreement: KeyAgreementKeyPair::generate(),
        }
    }

    /// Restore an identity from its secret key.
    pub fn from_secret(secret: [u8; SECRET_KEY_SIZE]) -> Self {
        Self {
            key_agreement: KeyAgreementKeyPair::from_secret(secret),
        }
    }

    /// Overlay address of this identity.
    pub fn public_key(&self) -> IdentityPublicKey {
        IdentityPublicKey(*self.key_agreement.public_key().as_bytes())
    }

    /// Long-time key agreement key pair.
    pub fn key_agreement_key_pair(&self) -> &KeyAgreementKeyPair {
        &self.key_agreement
    }
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        self.public_key() == other.public_key()
    }
}

impl Eq for Identity {}

/// Compare two keys and return them in total order.
pub fn ordered<'a>(
    a: &'a KeyAgreementPublicKey,
    b: &'a KeyAgreementPublicKey,
) -> (&'a KeyAgreementPublicKey, &'a KeyAgreementPublicKey, Ordering) {
    match a.cmp(b) {
        Ordering::Greater => (b, a, Ordering::Greater),
        ord => (a, b, ord),
    }
}
