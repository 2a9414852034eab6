//! Wire models
//!
//! Everything that crosses the bus: the outer envelope, signaling payloads
//! and file relay payloads.

pub mod envelope;
pub mod relay;
pub mod signal;
