//! Key agreements and their identifiers.

use std::fmt;
use std::str::FromStr;

use sha2::{Digest, Sha256};

use crate::core::{AGREEMENT_ID_SIZE, ArmError};
use crate::crypto::{
    KeyAgreementKeyPair, KeyAgreementPublicKey, SessionPair, derive_session_pair, fmt_hex, ordered,
};

/// Identifier of an agreement, derived from both public keys.
///
/// `SHA-256(lower || higher)` where `lower`/`higher` are the keys in byte-wise
/// order, so both peers derive the same id without exchanging it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AgreementId([u8; AGREEMENT_ID_SIZE]);

impl AgreementId {
    /// Compute the id of the agreement between `a` and `b`.
    ///
    /// Fails with [`ArmError::InvalidArgument`] if both keys are equal.
    pub fn of(a: &KeyAgreementPublicKey, b: &KeyAgreementPublicKey) -> Result<Self, ArmError> {
        let (lower, higher, ordering) = ordered(a, b);
        if ordering.is_eq() {
            return Err(ArmError::InvalidArgument(
                "an agreement requires two distinct keys".into(),
            ));
        }

        let mut hasher = Sha256::new();
        hasher.update(lower.as_bytes());
        hasher.update(higher.as_bytes());
        Ok(Self(hasher.finalize().into()))
    }

    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; AGREEMENT_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; AGREEMENT_ID_SIZE] {
        &self.0
    }
}

impl fmt::Display for AgreementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_hex(&self.0, f)
    }
}

impl fmt::Debug for AgreementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AgreementId({self})")
    }
}

impl FromStr for AgreementId {
    type Err = ArmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ArmError::InvalidArgument(format!("invalid agreement id: {s:?}"));
        if s.len() != AGREEMENT_ID_SIZE * 2 || !s.is_ascii() {
            return Err(invalid());
        }

        let mut bytes = [0u8; AGREEMENT_ID_SIZE];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[2 * i..2 * i + 2], 16).map_err(|_| invalid())?;
        }
        Ok(Self(bytes))
    }
}

/// One key agreement with a peer.
///
/// Starts out holding only our own key pair. Attaching the peer's key derives
/// the id and the session pair; an acknowledgement finally sets `stale_at`.
#[derive(Clone, Debug)]
pub struct Agreement {
    key_pair: KeyAgreementKeyPair,
    recipients_key_agreement_key: Option<KeyAgreementPublicKey>,
    agreement_id: Option<AgreementId>,
    session_pair: Option<SessionPair>,
    stale_at: Option<u64>,
}

impl Agreement {
    /// New agreement holding only our key pair.
    pub fn new(key_pair: KeyAgreementKeyPair) -> Self {
        Self {
            key_pair,
            recipients_key_agreement_key: None,
            agreement_id: None,
            session_pair: None,
            stale_at: None,
        }
    }

    /// The never-expiring agreement between two long-time keys.
    pub fn long_time(
        own: KeyAgreementKeyPair,
        peer: KeyAgreementPublicKey,
    ) -> Result<Self, ArmError> {
        Self::new(own).with_recipient(peer)
    }

    /// Attach the peer's key, deriving id and session pair.
    pub fn with_recipient(mut self, peer: KeyAgreementPublicKey) -> Result<Self, ArmError> {
        self.set_recipient(peer)?;
        Ok(self)
    }

    /// Set the staleness deadline.
    pub fn with_stale_at(mut self, stale_at: u64) -> Self {
        self.stale_at = Some(stale_at);
        self
    }

    /// Attach the peer's key in place. Leaves `self` untouched on error.
    pub fn set_recipient(&mut self, peer: KeyAgreementPublicKey) -> Result<(), ArmError> {
        let agreement_id = AgreementId::of(self.key_pair.public_key(), &peer)?;
        let session_pair = derive_session_pair(&self.key_pair, &peer)?;

        self.recipients_key_agreement_key = Some(peer);
        self.agreement_id = Some(agreement_id);
        self.session_pair = Some(session_pair);
        Ok(())
    }

    /// Our key pair.
    pub fn key_pair(&self) -> &KeyAgreementKeyPair {
        &self.key_pair
    }

    /// Peer's key, once known.
    pub fn recipients_key_agreement_key(&self) -> Option<&KeyAgreementPublicKey> {
        self.recipients_key_agreement_key.as_ref()
    }

    /// Agreement id, once the peer's key is known.
    pub fn agreement_id(&self) -> Option<AgreementId> {
        self.agreement_id
    }

    /// Session keys, once the peer's key is known.
    pub fn session_pair(&self) -> Option<&SessionPair> {
        self.session_pair.as_ref()
    }

    /// Staleness deadline (ms since epoch).
    pub fn stale_at(&self) -> Option<u64> {
        self.stale_at
    }

    /// Both the session pair and the id are present.
    pub fn is_initialized(&self) -> bool {
        self.session_pair.is_some() && self.agreement_id.is_some()
    }

    /// `now >= stale_at`. Never true without a deadline.
    pub fn is_stale(&self, now: u64) -> bool {
        self.stale_at.is_some_and(|stale_at| now >= stale_at)
    }

    /// `now >= stale_at / 2`. Never true without a deadline.
    pub fn is_renewable(&self, now: u64) -> bool {
        self.stale_at.is_some_and(|stale_at| now >= stale_at / 2)
    }
}
