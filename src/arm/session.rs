//! Per-peer agreement state.

use std::time::Duration;

use super::agreement::{Agreement, AgreementId};
use super::cache::{ExpiringCache, ExpiryPolicy};
use crate::core::ArmError;
use crate::crypto::SessionPair;

/// Slot holding at most one agreement.
///
/// Owned by the single executor of a node, so the compute operations need
/// no synchronisation.
#[derive(Debug, Default, Clone)]
pub struct AgreementSlot {
    value: Option<Agreement>,
}

impl AgreementSlot {
    /// Empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current agreement.
    pub fn get(&self) -> Option<&Agreement> {
        self.value.as_ref()
    }

    /// Current agreement, mutably.
    pub fn get_mut(&mut self) -> Option<&mut Agreement> {
        self.value.as_mut()
    }

    /// Whether the slot is empty.
    pub fn is_empty(&self) -> bool {
        self.value.is_none()
    }

    /// Return the agreement, computing it with `f` if the slot is empty.
    pub fn compute_if_absent<F>(&mut self, f: F) -> Result<&mut Agreement, ArmError>
    where
        F: FnOnce() -> Result<Agreement, ArmError>,
    {
        if self.value.is_none() {
            self.value = Some(f()?);
        }
        self.value
            .as_mut()
            .ok_or_else(|| ArmError::InvalidArgument("agreement slot is empty".into()))
    }

    /// If `cond` holds for the current value, replace it with the result of
    /// `f` (`None` clears the slot). Returns the value after the operation.
    pub fn compute_on_condition<C, F>(&mut self, cond: C, f: F) -> Option<&Agreement>
    where
        C: FnOnce(Option<&Agreement>) -> bool,
        F: FnOnce(Option<Agreement>) -> Option<Agreement>,
    {
        if cond(self.value.as_ref()) {
            self.value = f(self.value.take());
        }
        self.value.as_ref()
    }

    /// Remove and return the agreement.
    pub fn take(&mut self) -> Option<Agreement> {
        self.value.take()
    }

    /// Store `agreement`, returning the previous one.
    pub fn replace(&mut self, agreement: Agreement) -> Option<Agreement> {
        self.value.replace(agreement)
    }
}

/// Which key currently protects traffic with a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncryptionState {
    /// Long-time key only.
    #[default]
    LongTime,
    /// An ephemeral agreement is active.
    Pfs,
}

/// Agreement state for one remote peer.
#[derive(Debug)]
pub struct Session {
    pub(crate) long_time_agreement_id: AgreementId,
    pub(crate) long_time_agreement_pair: SessionPair,
    pub(crate) initialized_agreements: ExpiringCache<AgreementId, Agreement>,
    pub(crate) current_active_agreement: AgreementSlot,
    pub(crate) current_inactive_agreement: AgreementSlot,
    pub(crate) last_key_exchange_at: Option<u64>,
    pub(crate) last_renew_attempt_at: Option<u64>,
    pub(crate) state: EncryptionState,
}

impl Session {
    /// Create a session from an initialized long-time agreement.
    ///
    /// `retention` bounds how long initialized agreements are kept after
    /// their insert. Zero keeps them until evicted by size.
    pub fn new(
        long_time: &Agreement,
        max_agreements: usize,
        retention: Duration,
    ) -> Result<Self, ArmError> {
        let (Some(id), Some(pair)) = (long_time.agreement_id(), long_time.session_pair()) else {
            return Err(ArmError::InvalidArgument(
                "long-time agreement is not initialized".into(),
            ));
        };

        let ttl = (!retention.is_zero()).then_some(retention);
        Ok(Self {
            long_time_agreement_id: id,
            long_time_agreement_pair: pair.clone(),
            initialized_agreements: ExpiringCache::new(ExpiryPolicy::AfterWrite, ttl, max_agreements),
            current_active_agreement: AgreementSlot::new(),
            current_inactive_agreement: AgreementSlot::new(),
            last_key_exchange_at: None,
            last_renew_attempt_at: None,
            state: EncryptionState::LongTime,
        })
    }

    /// Id of the long-time agreement.
    pub fn long_time_agreement_id(&self) -> AgreementId {
        self.long_time_agreement_id
    }

    /// Session keys of the long-time agreement.
    pub fn long_time_agreement_pair(&self) -> &SessionPair {
        &self.long_time_agreement_pair
    }

    /// Agreements usable for decryption.
    pub fn initialized_agreements(&self) -> &ExpiringCache<AgreementId, Agreement> {
        &self.initialized_agreements
    }

    /// Agreement used for outbound encryption.
    pub fn current_active_agreement(&self) -> Option<&Agreement> {
        self.current_active_agreement.get()
    }

    /// Agreement being negotiated.
    pub fn current_inactive_agreement(&self) -> Option<&Agreement> {
        self.current_inactive_agreement.get()
    }

    /// Time of the last key exchange message sent.
    pub fn last_key_exchange_at(&self) -> Option<u64> {
        self.last_key_exchange_at
    }

    /// Time of the last renewal attempt (or acknowledgement).
    pub fn last_renew_attempt_at(&self) -> Option<u64> {
        self.last_renew_attempt_at
    }

    /// Current encryption state.
    pub fn state(&self) -> EncryptionState {
        self.state
    }

    /// Verify the slot invariants: the active agreement is initialized and
    /// known to `initialized_agreements`.
    pub fn check_invariants(&self, now: u64) -> Result<(), String> {
        if let Some(active) = self.current_active_agreement.get() {
            let id = active
                .agreement_id()
                .ok_or("active agreement has no id")?;
            if !active.is_initialized() {
                return Err(format!("active agreement {id} is not initialized"));
            }
            if !active.is_stale(now) && !self.initialized_agreements.contains_key(&id, now) {
                return Err(format!("active agreement {id} missing from initialized agreements"));
            }
        }
        if self.state == EncryptionState::Pfs && self.current_active_agreement.is_empty() {
            return Err("state is pfs without active agreement".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyAgreementKeyPair;

    fn long_time() -> Agreement {
        let own = KeyAgreementKeyPair::generate();
        let peer = KeyAgreementKeyPair::generate();
        Agreement::long_time(own, *peer.public_key()).unwrap()
    }

    #[test]
    fn test_new_session_uses_long_time_agreement() {
        let lt = long_time();
        let session = Session::new(&lt, 10, Duration::from_secs(60)).unwrap();

        assert_eq!(session.long_time_agreement_id(), lt.agreement_id().unwrap());
        assert!(session.current_active_agreement().is_none());
        assert!(session.current_inactive_agreement().is_none());
        assert_eq!(session.state(), EncryptionState::LongTime);
        assert!(session.check_invariants(0).is_ok());
    }

    #[test]
    fn test_new_session_requires_initialized_agreement() {
        let empty = Agreement::new(KeyAgreementKeyPair::generate());
        assert!(Session::new(&empty, 10, Duration::from_secs(60)).is_err());
    }

    #[test]
    fn test_compute_if_absent_keeps_existing() {
        let mut slot = AgreementSlot::new();
        let first = slot
            .compute_if_absent(|| Ok(Agreement::new(KeyAgreementKeyPair::generate())))
            .unwrap()
            .key_pair()
            .public_key()
            .to_owned();

        let second = slot
            .compute_if_absent(|| panic!("must not be called"))
            .unwrap()
            .key_pair()
            .public_key()
            .to_owned();

        assert_eq!(first, second);
    }

    #[test]
    fn test_compute_if_absent_propagates_error() {
        let mut slot = AgreementSlot::new();
        let result = slot.compute_if_absent(|| Err(ArmError::NoInactiveAgreement));

        assert!(result.is_err());
        assert!(slot.is_empty());
    }

    #[test]
    fn test_compute_on_condition_clears() {
        let mut slot = AgreementSlot::new();
        slot.replace(Agreement::new(KeyAgreementKeyPair::generate()).with_stale_at(10));

        assert!(slot.compute_on_condition(|a| a.is_some_and(|a| a.is_stale(5)), |_| None).is_some());
        assert!(slot.compute_on_condition(|a| a.is_some_and(|a| a.is_stale(10)), |_| None).is_none());
        assert!(slot.is_empty());
    }

    #[test]
    fn test_invariant_detects_untracked_active() {
        let mut session = Session::new(&long_time(), 10, Duration::from_secs(60)).unwrap();
        session.current_active_agreement.replace(long_time());

        assert!(session.check_invariants(0).is_err());
    }
}
