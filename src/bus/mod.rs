//! Message bus
//!
//! The persistent WebSocket channel to the relay backend. [`MessageBusClient`]
//! owns the socket; handlers only see the [`MessageBus`] trait so they can be
//! driven by an in-memory bus in tests.

mod client;
mod listeners;

use std::sync::Arc;

pub use client::{BusOptions, ConnectionState, MessageBusClient};
pub use listeners::{ListenerId, Listeners};

use crate::error::BusError;
use crate::model::envelope::{ReceiveMessage, SendMessage};

/// Normal close: no reconnect, no special handling.
pub const CLOSE_NORMAL: u16 = 3000;
/// Authentication rejected: terminal, stored credentials must be cleared.
pub const CLOSE_AUTH_FAILED: u16 = 3001;

pub type MessageListener = dyn Fn(&ReceiveMessage) + Send + Sync;
pub type OpenListener = dyn Fn() + Send + Sync;
/// Receives the close code and reason.
pub type CloseListener = dyn Fn(u16, &str) + Send + Sync;
pub type FailureListener = dyn Fn(&BusError) + Send + Sync;

/// The part of the bus the protocol handlers depend on.
pub trait MessageBus: Send + Sync + 'static {
    /// Queue one outbound frame. There is no delivery confirmation.
    fn send(&self, message: SendMessage);

    fn on_message(&self, listener: Arc<MessageListener>) -> ListenerId;

    /// Safe to call from inside a message listener. Returns `false` if the
    /// listener was already removed.
    fn remove_on_message(&self, id: ListenerId) -> bool;
}
