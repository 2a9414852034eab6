//! Controlled-device agent for a relay backend.
//!
//! The device keeps one WebSocket to the message bus ([`bus`]). Over it, a
//! remote operator negotiates camera and screen streams ([`signaling`]) and
//! browses, pulls and pushes files ([`relay`]). File bytes go through a
//! separate HTTP data endpoint.

pub mod bus;
pub mod capture;
pub mod config;
pub mod credentials;
pub mod engine;
pub mod error;
pub mod files;
pub mod model;
pub mod relay;
pub mod service;
pub mod signaling;
pub mod util;
