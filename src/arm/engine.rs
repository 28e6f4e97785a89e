//! The arm/disarm engine.
//!
//! Picks the agreement for every message, seals and opens it, and drives the
//! key exchange. The engine is owned by a single executor; side effects that
//! must not delay the current message (renewal checks, key exchanges) are put
//! on a deferred queue and run by [`ArmEngine::run_deferred`]. Protocol
//! messages it wants to send collect in an outbox, upward notifications in an
//! event list.
//!
//! ```text
//! A                                              B
//! | -- app (long-time) ------------------------> |
//! | -- KeyExchange(a) (long-time) -------------> |  attach a, id = H(a, b)
//! | <------------- KeyExchange(b) (long-time) -- |
//! | <------------- Acknowledgement(id) --------- |
//! | attach b, id = H(a, b); promote on ack       |
//! | -- Acknowledgement(id) --------------------> |  promote
//! | -- app (id) -------------------------------> |
//! ```

use std::collections::VecDeque;

use tracing::{debug, trace, warn};

use super::agreement::{Agreement, AgreementId};
use super::cache::{ExpiringCache, ExpiryPolicy};
use super::config::ArmConfig;
use super::message::{ArmMessage, ArmedMessage};
use super::session::{EncryptionState, Session};
use crate::core::{ArmError, Clock, IdentityProvider, NodeEvent, SystemClock, millis};
use crate::crypto::{
    Identity, IdentityPublicKey, KeyAgreementPublicKey, SessionPair, decrypt, encrypt,
    random_nonce,
};

/// Work scheduled for after the current message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deferred {
    /// Evict a stale active agreement or start a renewal.
    CheckRenewal,
    /// Start (or retry) a key exchange.
    KeyExchange,
}

/// A protocol message the engine wants to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    /// Recipient.
    pub peer: IdentityPublicKey,
    /// Sealed message.
    pub armed: ArmedMessage,
}

/// Result of disarming an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disarmed {
    /// Payload for the layer above.
    Application(Vec<u8>),
    /// Protocol message handled by the engine.
    Consumed,
}

/// Arm/disarm engine for one local identity.
pub struct ArmEngine<C: Clock = SystemClock, P: IdentityProvider = Identity> {
    provider: P,
    local: IdentityPublicKey,
    config: ArmConfig,
    clock: C,
    sessions: ExpiringCache<IdentityPublicKey, Session>,
    deferred: VecDeque<(IdentityPublicKey, Deferred)>,
    outbox: Vec<Outgoing>,
    events: Vec<NodeEvent>,
}

impl<C: Clock, P: IdentityProvider> ArmEngine<C, P> {
    /// Create an engine.
    pub fn new(provider: P, config: ArmConfig, clock: C) -> Self {
        let local = provider.identity().public_key();
        let ttl = (!config.session_expire_after.is_zero()).then_some(config.session_expire_after);
        let sessions = ExpiringCache::new(ExpiryPolicy::AfterAccess, ttl, config.max_sessions);

        Self {
            provider,
            local,
            config,
            clock,
            sessions,
            deferred: VecDeque::new(),
            outbox: Vec::new(),
            events: Vec::new(),
        }
    }

    /// Local identity public key.
    pub fn local_key(&self) -> IdentityPublicKey {
        self.local
    }

    /// Engine configuration.
    pub fn config(&self) -> &ArmConfig {
        &self.config
    }

    /// Clock used by the engine.
    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Session with `peer`, if one exists.
    pub fn session(&self, peer: &IdentityPublicKey) -> Option<&Session> {
        self.sessions.peek(peer, self.clock.now_millis())
    }

    /// Number of sessions, including idle ones not yet evicted.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Drop sessions idle for longer than `session_expire_after`.
    pub fn evict_idle_sessions(&mut self) -> usize {
        let expired = self.sessions.take_expired(self.clock.now_millis());
        for (peer, session) in &expired {
            session_dropped(session, peer, &mut self.events);
        }
        if !expired.is_empty() {
            debug!(evicted = expired.len(), "evicted idle sessions");
        }
        expired.len()
    }

    /// Encrypt `payload` for `peer`.
    ///
    /// Uses the active agreement if it is initialized and fresh, otherwise the
    /// long-time agreement plus a deferred key exchange. Never waits for the
    /// deferred work.
    pub fn arm_outbound(
        &mut self,
        peer: &IdentityPublicKey,
        payload: &[u8],
    ) -> Result<ArmedMessage, ArmError> {
        let now = self.clock.now_millis();
        let pfs = self.config.pfs_enabled();
        let session = resolve(
            &mut self.sessions,
            self.provider.identity(),
            &self.config,
            peer,
            now,
            &mut self.events,
        )?;
        if pfs {
            self.deferred.push_back((*peer, Deferred::CheckRenewal));
        }

        let msg = ArmMessage::Application(payload.to_vec());
        let active = session
            .current_active_agreement
            .get()
            .filter(|a| a.is_initialized() && !a.is_stale(now))
            .and_then(|a| Some((a.agreement_id()?, a.session_pair()?)));

        match active {
            Some((id, pair)) => seal(pair, id, &self.local, peer, &msg),
            None => {
                if pfs {
                    self.deferred.push_back((*peer, Deferred::KeyExchange));
                }
                seal(
                    &session.long_time_agreement_pair,
                    session.long_time_agreement_id,
                    &self.local,
                    peer,
                    &msg,
                )
            }
        }
    }

    /// Decrypt a message from `peer` and handle protocol messages.
    pub fn disarm_inbound(
        &mut self,
        peer: &IdentityPublicKey,
        armed: &ArmedMessage,
    ) -> Result<Disarmed, ArmError> {
        let now = self.clock.now_millis();
        let pfs = self.config.pfs_enabled();
        let expire_after = millis(self.config.expire_after);
        let local = self.local;
        let session = resolve(
            &mut self.sessions,
            self.provider.identity(),
            &self.config,
            peer,
            now,
            &mut self.events,
        )?;
        if pfs {
            self.deferred.push_back((*peer, Deferred::CheckRenewal));
        }

        let id = armed.agreement_id;
        let (message, long_time_used) = if id == session.long_time_agreement_id {
            (open(&session.long_time_agreement_pair, peer, &local, armed)?, true)
        } else if let Some(agreement) = session.initialized_agreements.get(&id, now) {
            let stale = agreement.is_stale(now);
            let pair = agreement
                .session_pair()
                .ok_or(ArmError::UnknownAgreementId(id))?;
            let message = open(pair, peer, &local, armed)?;
            if stale {
                evict_agreement(session, &id, peer, &mut self.events);
            }
            (message, false)
        } else if inactive_id(session) == Some(id) {
            // First PFS message overtook the acknowledgement.
            promote(session, id, now, expire_after, peer, &mut self.events);
            let pair = session
                .initialized_agreements
                .get(&id, now)
                .and_then(Agreement::session_pair)
                .ok_or(ArmError::UnknownAgreementId(id))?;
            (open(pair, peer, &local, armed)?, false)
        } else {
            trace!(peer = %peer, agreement = %id, "unknown agreement id, dropping message");
            if pfs {
                self.deferred.push_back((*peer, Deferred::KeyExchange));
            }
            return Err(ArmError::UnknownAgreementId(id));
        };

        match message {
            ArmMessage::Application(payload) => Ok(Disarmed::Application(payload)),
            ArmMessage::KeyExchange(key) => {
                if long_time_used && pfs {
                    self.received_key_exchange(peer, key)?;
                } else {
                    debug!(peer = %peer, "ignoring key exchange not sealed with the long-time key");
                }
                Ok(Disarmed::Consumed)
            }
            ArmMessage::Acknowledgement(ack_id) => {
                if pfs {
                    self.received_acknowledgement(peer, ack_id)?;
                }
                Ok(Disarmed::Consumed)
            }
        }
    }

    /// Ensure an inactive agreement and send its key, at most once per
    /// retry interval.
    pub fn do_key_exchange(&mut self, peer: &IdentityPublicKey) -> Result<(), ArmError> {
        if !self.config.pfs_enabled() {
            return Ok(());
        }

        let now = self.clock.now_millis();
        let retry = millis(self.config.retry_interval);
        let provider = &self.provider;
        let session = resolve(
            &mut self.sessions,
            provider.identity(),
            &self.config,
            peer,
            now,
            &mut self.events,
        )?;

        let key = ensure_inactive(session, provider)?;
        if !interval_elapsed(session.last_key_exchange_at, now, retry) {
            trace!(peer = %peer, "key exchange throttled");
            return Ok(());
        }

        send_key_exchange(session, key, &self.local, peer, &mut self.outbox)?;
        session.last_key_exchange_at = Some(now);
        Ok(())
    }

    /// Handle the peer's ephemeral key: attach it to the inactive agreement,
    /// answer with our own key and acknowledge.
    pub fn received_key_exchange(
        &mut self,
        peer: &IdentityPublicKey,
        key: KeyAgreementPublicKey,
    ) -> Result<(), ArmError> {
        if key == peer.long_time_key_agreement_key() {
            debug!(
                peer = %peer,
                "received key exchange with long time key, this may be a sign of an MITM attack"
            );
            return Err(ArmError::InvalidArgument(
                "key exchange carries the long-time key".into(),
            ));
        }

        let now = self.clock.now_millis();
        let provider = &self.provider;
        let session = resolve(
            &mut self.sessions,
            provider.identity(),
            &self.config,
            peer,
            now,
            &mut self.events,
        )?;
        ensure_inactive(session, provider)?;
        if let Some(inactive) = session.current_inactive_agreement.get_mut() {
            inactive.set_recipient(key)?;
            trace!(peer = %peer, agreement = ?inactive.agreement_id(), "received key exchange");
        }

        self.do_key_exchange(peer)?;
        self.send_ack(peer)
    }

    /// Acknowledge the inactive agreement.
    pub fn send_ack(&mut self, peer: &IdentityPublicKey) -> Result<(), ArmError> {
        let now = self.clock.now_millis();
        let session = resolve(
            &mut self.sessions,
            self.provider.identity(),
            &self.config,
            peer,
            now,
            &mut self.events,
        )?;
        let id = inactive_id(session).ok_or(ArmError::NoInactiveAgreement)?;

        let armed = seal(
            &session.long_time_agreement_pair,
            session.long_time_agreement_id,
            &self.local,
            peer,
            &ArmMessage::Acknowledgement(id),
        )?;
        self.outbox.push(Outgoing { peer: *peer, armed });
        trace!(peer = %peer, agreement = %id, "send ack message");
        Ok(())
    }

    /// Promote the inactive agreement if `id` matches it. Returns whether it
    /// was promoted; a non-matching id leaves the session untouched.
    pub fn received_acknowledgement(
        &mut self,
        peer: &IdentityPublicKey,
        id: AgreementId,
    ) -> Result<bool, ArmError> {
        let now = self.clock.now_millis();
        let expire_after = millis(self.config.expire_after);
        let session = resolve(
            &mut self.sessions,
            self.provider.identity(),
            &self.config,
            peer,
            now,
            &mut self.events,
        )?;

        let promoted = promote(session, id, now, expire_after, peer, &mut self.events);
        if !promoted {
            trace!(peer = %peer, agreement = %id, "ignoring ack for unknown agreement");
        }
        Ok(promoted)
    }

    /// Evict the active agreement if stale, or start a renewal once it is
    /// renewable and the retry interval has passed since the last attempt.
    pub fn check_for_renew(&mut self, peer: &IdentityPublicKey) -> Result<(), ArmError> {
        if !self.config.pfs_enabled() {
            return Ok(());
        }

        let now = self.clock.now_millis();
        let retry = millis(self.config.retry_interval);
        let provider = &self.provider;
        let Some(session) = self.sessions.get_mut(peer, now) else {
            return Ok(());
        };

        let evict = session.current_active_agreement.get().map(|a| {
            let tracked = a
                .agreement_id()
                .is_some_and(|id| session.initialized_agreements.contains_key(&id, now));
            (a.agreement_id(), a.is_stale(now) || !tracked)
        });
        if let Some((id, true)) = evict {
            session.current_active_agreement.take();
            if let Some(id) = id {
                session.initialized_agreements.remove(&id);
            }
            resume_long_time(session, peer, &mut self.events);
            return Ok(());
        }

        let renewable = session
            .current_active_agreement
            .get()
            .is_some_and(|a| a.is_renewable(now));
        if renewable && interval_elapsed(session.last_renew_attempt_at, now, retry) {
            session.last_renew_attempt_at = Some(now);
            let key = ensure_inactive(session, provider)?;
            debug!(peer = %peer, "renewing agreement");
            send_key_exchange(session, key, &self.local, peer, &mut self.outbox)?;
            session.last_key_exchange_at = Some(now);
        }
        Ok(())
    }

    /// Queue deferred work for `peer`.
    pub fn defer(&mut self, peer: IdentityPublicKey, work: Deferred) {
        self.deferred.push_back((peer, work));
    }

    /// Number of queued deferred jobs.
    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    /// Run all deferred work. Failures are logged and dropped.
    pub fn run_deferred(&mut self) -> usize {
        let mut ran = 0;
        while let Some((peer, work)) = self.deferred.pop_front() {
            let result = match work {
                Deferred::CheckRenewal => self.check_for_renew(&peer),
                Deferred::KeyExchange => self.do_key_exchange(&peer),
            };
            if let Err(e) = result {
                warn!(peer = %peer, ?work, error = %e, "deferred arm work failed");
            }
            ran += 1;
        }
        ran
    }

    /// Take the protocol messages queued for sending.
    pub fn drain_outbox(&mut self) -> Vec<Outgoing> {
        std::mem::take(&mut self.outbox)
    }

    /// Take the upward notifications.
    pub fn drain_events(&mut self) -> Vec<NodeEvent> {
        std::mem::take(&mut self.events)
    }
}

/// Get or create the session with `peer`.
///
/// An expired session still held by the cache is replaced, and so is the
/// least recently used one when the cache is full.
fn resolve<'a>(
    sessions: &'a mut ExpiringCache<IdentityPublicKey, Session>,
    identity: &Identity,
    config: &ArmConfig,
    peer: &IdentityPublicKey,
    now: u64,
    events: &mut Vec<NodeEvent>,
) -> Result<&'a mut Session, ArmError> {
    if !sessions.contains_key(peer, now) {
        if let Some(idle) = sessions.remove(peer) {
            session_dropped(&idle, peer, events);
        }

        let long_time = Agreement::long_time(
            identity.key_agreement_key_pair().clone(),
            peer.long_time_key_agreement_key(),
        )?;
        let session = Session::new(&long_time, config.max_agreements, config.agreement_retention())?;
        trace!(peer = %peer, agreement = %session.long_time_agreement_id, "created session");
        if let Some((evicted_peer, evicted)) = sessions.insert_evicting(*peer, session, now) {
            session_dropped(&evicted, &evicted_peer, events);
        }
    }

    sessions
        .get_mut(peer, now)
        .ok_or_else(|| ArmError::InvalidArgument(format!("no session for {peer}")))
}

/// Report the fall back to long-time encryption for a discarded session.
fn session_dropped(session: &Session, peer: &IdentityPublicKey, events: &mut Vec<NodeEvent>) {
    trace!(peer = %peer, "dropped session");
    if session.state == EncryptionState::Pfs {
        debug!(peer = %peer, "session dropped, back to long-time encryption");
        events.push(NodeEvent::LongTimeEncryption { peer: *peer });
    }
}

fn inactive_id(session: &Session) -> Option<AgreementId> {
    session
        .current_inactive_agreement
        .get()
        .and_then(Agreement::agreement_id)
}

/// Create the inactive agreement if absent and return our key of it.
fn ensure_inactive<P: IdentityProvider>(
    session: &mut Session,
    provider: &P,
) -> Result<KeyAgreementPublicKey, ArmError> {
    let inactive = session
        .current_inactive_agreement
        .compute_if_absent(|| Ok(Agreement::new(provider.generate_key_agreement_pair())))?;
    Ok(*inactive.key_pair().public_key())
}

fn send_key_exchange(
    session: &Session,
    key: KeyAgreementPublicKey,
    local: &IdentityPublicKey,
    peer: &IdentityPublicKey,
    outbox: &mut Vec<Outgoing>,
) -> Result<(), ArmError> {
    let armed = seal(
        &session.long_time_agreement_pair,
        session.long_time_agreement_id,
        local,
        peer,
        &ArmMessage::KeyExchange(key),
    )?;
    outbox.push(Outgoing { peer: *peer, armed });
    trace!(peer = %peer, key = %key, "send key exchange message");
    Ok(())
}

/// Move the inactive agreement with `id` to the initialized set and make it
/// the active one.
fn promote(
    session: &mut Session,
    id: AgreementId,
    now: u64,
    expire_after: u64,
    peer: &IdentityPublicKey,
    events: &mut Vec<NodeEvent>,
) -> bool {
    if inactive_id(session) != Some(id) {
        return false;
    }
    let Some(agreement) = session.current_inactive_agreement.take() else {
        return false;
    };

    let agreement = agreement.with_stale_at(now.saturating_add(expire_after));
    session.initialized_agreements.insert(id, agreement.clone(), now);
    session.current_active_agreement.replace(agreement);
    session.last_renew_attempt_at = Some(now);
    trace!(peer = %peer, agreement = %id, "agreement active");

    if session.state == EncryptionState::LongTime {
        session.state = EncryptionState::Pfs;
        events.push(NodeEvent::PerfectForwardSecrecyEncryption { peer: *peer });
    }
    true
}

/// Drop a stale agreement and clear the active slot if it held it.
fn evict_agreement(
    session: &mut Session,
    id: &AgreementId,
    peer: &IdentityPublicKey,
    events: &mut Vec<NodeEvent>,
) {
    session.initialized_agreements.remove(id);
    let cleared = session
        .current_active_agreement
        .compute_on_condition(|a| a.and_then(Agreement::agreement_id) == Some(*id), |_| None)
        .is_none();
    if cleared {
        resume_long_time(session, peer, events);
    }
}

fn resume_long_time(session: &mut Session, peer: &IdentityPublicKey, events: &mut Vec<NodeEvent>) {
    if session.state == EncryptionState::Pfs && session.current_active_agreement.is_empty() {
        session.state = EncryptionState::LongTime;
        debug!(peer = %peer, "agreement stale, back to long-time encryption");
        events.push(NodeEvent::LongTimeEncryption { peer: *peer });
    }
}

fn interval_elapsed(last: Option<u64>, now: u64, interval: u64) -> bool {
    last.is_none_or(|t| now.saturating_sub(t) > interval)
}

/// Associated data binding the ciphertext to both parties and the agreement.
fn aad(sender: &IdentityPublicKey, recipient: &IdentityPublicKey, id: &AgreementId) -> Vec<u8> {
    let mut aad = Vec::with_capacity(96);
    aad.extend_from_slice(sender.as_bytes());
    aad.extend_from_slice(recipient.as_bytes());
    aad.extend_from_slice(id.as_bytes());
    aad
}

fn seal(
    pair: &SessionPair,
    id: AgreementId,
    sender: &IdentityPublicKey,
    recipient: &IdentityPublicKey,
    msg: &ArmMessage,
) -> Result<ArmedMessage, ArmError> {
    let nonce = random_nonce();
    let ciphertext = encrypt(&pair.tx, &nonce, &aad(sender, recipient, &id), &msg.encode())?;
    Ok(ArmedMessage {
        agreement_id: id,
        nonce,
        ciphertext,
    })
}

fn open(
    pair: &SessionPair,
    sender: &IdentityPublicKey,
    recipient: &IdentityPublicKey,
    armed: &ArmedMessage,
) -> Result<ArmMessage, ArmError> {
    let plaintext = decrypt(
        &pair.rx,
        &armed.nonce,
        &aad(sender, recipient, &armed.agreement_id),
        &armed.ciphertext,
    )?;
    Ok(ArmMessage::decode(&plaintext)?)
}
