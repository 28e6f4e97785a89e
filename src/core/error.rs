//! Error types for canopy.

use thiserror::Error;

use crate::arm::AgreementId;

/// Errors of the cryptographic primitives.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Key pair generation failed.
    #[error("key generation failed")]
    KeyGeneration,

    /// AEAD encryption failed.
    #[error("AEAD encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (invalid tag or corrupted).
    #[error("AEAD decryption failed (invalid tag or corrupted)")]
    DecryptionFailed,

    /// Key derivation failed.
    #[error("key derivation failed")]
    KeyDerivationFailed,

    /// Key material has the wrong shape.
    #[error("invalid key: {0}")]
    InvalidKey(String),
}

/// Errors while encoding or decoding wire messages.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Not enough bytes.
    #[error("message too short: expected at least {expected} bytes, got {actual}")]
    TooShort {
        /// Expected minimum length.
        expected: usize,
        /// Actual length.
        actual: usize,
    },

    /// Unknown message discriminant.
    #[error("unknown message type: {0:#04x}")]
    UnknownMessageType(u8),

    /// Wrong envelope magic number.
    #[error("bad magic number: {0:#010x}")]
    BadMagic(u32),

    /// Socket address could not be decoded.
    #[error("invalid socket address")]
    InvalidAddress,

    /// Embedded key bytes are malformed.
    #[error("invalid key in message")]
    InvalidKey,

    /// Agreement id could not be parsed.
    #[error("invalid agreement id")]
    InvalidAgreementId,
}

/// Errors of the arm/disarm engine.
#[derive(Debug, Error)]
pub enum ArmError {
    /// A primitive failed; the message is dropped.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The message references an agreement this session does not know.
    #[error("decryption error: unknown agreement id {0}")]
    UnknownAgreementId(AgreementId),

    /// Protocol violation or programmer error.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Plaintext could not be decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// An acknowledgement was requested but nothing is being negotiated.
    #[error("there is currently no inactive agreement")]
    NoInactiveAgreement,
}

/// Errors of the transport bindings.
#[derive(Debug, Error)]
pub enum TransportError {
    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Connection or socket is closed.
    #[error("transport closed")]
    Closed,

    /// Frame exceeds the maximum frame size.
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),
}

/// Top-level canopy errors.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Arm error.
    #[error("arm error: {0}")]
    Arm(#[from] ArmError),

    /// Crypto error.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Codec error.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Transport error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// No path to the recipient is known.
    #[error("no route to peer {0}")]
    NoRoute(String),

    /// Node is shut down.
    #[error("node shut down")]
    Shutdown,
}
