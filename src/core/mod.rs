//! Core types shared by every layer: constants, errors, time, events and the
//! collaborator traits.

mod clock;
mod constants;
mod error;
mod event;
mod traits;

pub use clock::*;
pub use constants::*;
pub use error::*;
pub use event::*;
pub use traits::*;
