//! Socket bindings: UDP datagrams and the TCP fallback to super peers.
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        Node (arm + discovery)           │
//! ├─────────────────────────────────────────┤
//! │         Transport Layer                 │  ← This module
//! │   UDP datagrams, TCP fallback frames    │
//! ├─────────────────────────────────────────┤
//! │           UDP / TCP                     │
//! └─────────────────────────────────────────┘
//! ```

mod tcp;
mod udp;

pub use tcp::{
    FrameDecoder, TcpFallback, TcpFallbackConfig, TcpFallbackLink, TcpFallbackServer, frame_encode,
    probe,
};
pub use udp::UdpTransport;
