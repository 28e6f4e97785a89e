//! Peer discovery and path management.
//!
//! Children register with super peers through periodic hellos. Super peers
//! acknowledge, relay envelopes between their children and introduce
//! children to each other with unite messages so they can punch a direct
//! path. Every discovery message travels armed like application data.

mod children;
mod config;
mod message;
mod peer;
mod rtt;
mod super_peer;

pub use children::ChildrenHandler;
pub use config::DiscoveryConfig;
pub use message::{DiscoveryMessage, Envelope, Outbound};
pub use peer::{ChildrenPeer, SuperPeer, TraversingPeer};
pub use rtt::RttEstimator;
pub use super_peer::{RelayDecision, SuperPeerHandler};
