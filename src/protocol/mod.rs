//! Message types, payload decoding and topic rules
//!
//! Pure functions and data only; nothing in here touches the network.

pub mod messages;
pub mod topics;

pub use messages::*;
pub use topics::*;
