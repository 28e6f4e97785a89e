//! Session-based perfect forward secrecy.
//!
//! Every message between two peers is sealed either with their long-time
//! agreement (derived from the identity keys, always available) or with an
//! ephemeral agreement negotiated on the fly. The [`ArmEngine`] decides which
//! one to use, negotiates and renews ephemeral agreements and falls back to
//! the long-time key whenever no ephemeral agreement is usable.

mod agreement;
mod cache;
mod config;
mod engine;
mod message;
mod session;

pub use agreement::{Agreement, AgreementId};
pub use cache::{ExpiringCache, ExpiryPolicy};
pub use config::ArmConfig;
pub use engine::{ArmEngine, Deferred, Disarmed, Outgoing};
pub use message::{ArmMessage, ArmedMessage};
pub use session::{AgreementSlot, EncryptionState, Session};
