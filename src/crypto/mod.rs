//! Cryptographic primitives: X25519 keys, session key derivation and
//! XChaCha20-Poly1305 sealing.

mod aead;
mod keys;
mod kx;

pub use aead::{SessionKey, decrypt, encrypt, random_nonce};
pub use keys::{
    Identity, IdentityPublicKey, KeyAgreementKeyPair, KeyAgreementPublicKey,
    KeyAgreementSecretKey, ordered,
};
pub(crate) use keys::fmt_hex;
pub use kx::{SessionPair, derive_session_pair};
