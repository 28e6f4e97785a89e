//! Single-task node executor wiring the arm engine, discovery and the
//! transport together.

mod config;
#[allow(clippy::module_inception)]
mod node;

pub use config::{NodeConfig, NodeConfigBuilder};
pub use node::{Node, NodeHandle};
