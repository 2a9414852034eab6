//! WebSocket client for the relay backend.
//!
//! Every transport event is funnelled through [`Inner`], which applies the
//! connection policy before notifying listeners:
//!
//! * closing with [`CLOSE_AUTH_FAILED`] marks the connection auth-failed and
//!   never reconnects;
//! * closing with [`CLOSE_NORMAL`] is a plain close;
//! * any other close code reconnects immediately with the same URL, and the
//!   closed notification of the dropped socket is suppressed. A socket lost
//!   without a close frame counts as code 1006 and reconnects the same way;
//! * `Open` listeners fire after a short delay, and only if the backend has
//!   not rejected the credentials in the meantime;
//! * heartbeats are answered before message listeners run.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use super::{
    CloseListener, FailureListener, ListenerId, Listeners, MessageBus, MessageListener,
    OpenListener, CLOSE_AUTH_FAILED, CLOSE_NORMAL,
};
use crate::error::BusError;
use crate::model::envelope::{heartbeat_answer, ReceiveMessage, SendMessage};
use crate::util::lock;

/// Close code reported when the socket ends without a close frame.
const CLOSE_ABNORMAL: u16 = 1006;

#[derive(Debug, Clone)]
pub struct BusOptions {
    /// How long to hold back `Open` listeners after the transport opens.
    pub open_delay: Duration,
}

impl Default for BusOptions {
    fn default() -> Self {
        Self {
            open_delay: Duration::from_millis(300),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Reconnecting,
    AuthFailed,
    Closed,
}

#[derive(Debug)]
struct Flags {
    state: ConnectionState,
    auth_success: bool,
    is_reconnecting: bool,
    /// Bumped on every connection attempt; stale sockets check it before
    /// touching shared state.
    generation: u64,
}

struct Inner {
    url: String,
    options: BusOptions,
    flags: Mutex<Flags>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    attempts: AtomicU64,
    open: Listeners<OpenListener>,
    closing: Listeners<CloseListener>,
    closed: Listeners<CloseListener>,
    message: Listeners<MessageListener>,
    failure: Listeners<FailureListener>,
}

/// One logical connection to the bus. Cloning shares the connection.
///
/// Reconnects swap the socket underneath but keep the listener registries,
/// so handlers registered once stay registered.
#[derive(Clone)]
pub struct MessageBusClient {
    inner: Arc<Inner>,
}

impl MessageBusClient {
    /// Create a client for `url`. Nothing happens on the network until
    /// [`connect`](Self::connect) is called, so listeners can be registered
    /// first.
    pub fn new(url: impl Into<String>, options: BusOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                url: url.into(),
                options,
                flags: Mutex::new(Flags {
                    state: ConnectionState::Connecting,
                    auth_success: true,
                    is_reconnecting: false,
                    generation: 0,
                }),
                outbound: Mutex::new(None),
                attempts: AtomicU64::new(0),
                open: Listeners::new(),
                closing: Listeners::new(),
                closed: Listeners::new(),
                message: Listeners::new(),
                failure: Listeners::new(),
            }),
        }
    }

    /// Start the first connection attempt. Errors are reported to the
    /// failure listeners, never returned. Must be called inside a tokio
    /// runtime.
    pub fn connect(&self) {
        lock(&self.inner.flags).state = ConnectionState::Connecting;
        spawn_connection(self.inner.clone());
    }

    /// Close with the normal close code. No reconnect follows.
    pub fn close(&self, reason: &str) {
        let frame = CloseFrame {
            code: CloseCode::from(CLOSE_NORMAL),
            reason: reason.to_string().into(),
        };
        match lock(&self.inner.outbound).as_ref() {
            Some(tx) => {
                let _ = tx.send(Message::Close(Some(frame)));
            }
            None => debug!("close requested with no live socket"),
        }
    }

    pub fn on_open(&self, listener: Arc<OpenListener>) -> ListenerId {
        self.inner.open.add(listener)
    }

    /// Called in the closing phase, after the close-code policy ran.
    pub fn on_closing(&self, listener: Arc<CloseListener>) -> ListenerId {
        self.inner.closing.add(listener)
    }

    /// Called once the socket is closed, unless a reconnect is in progress.
    pub fn on_closed(&self, listener: Arc<CloseListener>) -> ListenerId {
        self.inner.closed.add(listener)
    }

    pub fn on_failure(&self, listener: Arc<FailureListener>) -> ListenerId {
        self.inner.failure.add(listener)
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.inner.flags).state
    }

    pub fn is_reconnecting(&self) -> bool {
        lock(&self.inner.flags).is_reconnecting
    }

    pub fn auth_success(&self) -> bool {
        lock(&self.inner.flags).auth_success
    }

    /// Number of connection attempts made so far, the first one included.
    pub fn connection_attempts(&self) -> u64 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }
}

impl MessageBus for MessageBusClient {
    fn send(&self, message: SendMessage) {
        self.inner.send(message);
    }

    fn on_message(&self, listener: Arc<MessageListener>) -> ListenerId {
        self.inner.message.add(listener)
    }

    fn remove_on_message(&self, id: ListenerId) -> bool {
        self.inner.message.remove(id)
    }
}

fn spawn_connection(inner: Arc<Inner>) {
    let generation = {
        let mut flags = lock(&inner.flags);
        flags.generation += 1;
        flags.generation
    };
    tokio::spawn(run_connection(inner, generation));
}

async fn run_connection(inner: Arc<Inner>, generation: u64) {
    let attempt = inner.attempts.fetch_add(1, Ordering::SeqCst) + 1;
    debug!(url = %inner.url, attempt, "connecting to bus");

    let socket = match tokio_tungstenite::connect_async(inner.url.as_str()).await {
        Ok((socket, _)) => socket,
        Err(e) => {
            inner.handle_failure(BusError::Connection(e));
            return;
        }
    };

    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    *lock(&inner.outbound) = Some(tx.clone());
    inner.handle_open(generation);

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = sink.send(frame).await {
                debug!(error = %e, "bus writer stopped");
                break;
            }
        }
    });

    let mut close: Option<(u16, String)> = None;
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => inner.handle_text(text.as_str()),
            Ok(Message::Close(frame)) => {
                let (code, reason) = frame
                    .map(|f| (u16::from(f.code), f.reason.as_str().to_string()))
                    .unwrap_or((CLOSE_ABNORMAL, String::new()));
                inner.handle_closing(code, &reason);
                close = Some((code, reason));
            }
            Ok(_) => {}
            Err(e) => {
                // Errors after the close handshake are just the socket going
                // away. Before it, the transport was lost: close abnormally,
                // which reconnects.
                if close.is_none() {
                    let reason = BusError::Connection(e).to_string();
                    inner.handle_closing(CLOSE_ABNORMAL, &reason);
                    close = Some((CLOSE_ABNORMAL, reason));
                }
                break;
            }
        }
    }

    writer.abort();
    {
        let mut outbound = lock(&inner.outbound);
        if outbound.as_ref().is_some_and(|current| current.same_channel(&tx)) {
            *outbound = None;
        }
    }

    let (code, reason) = match close {
        Some(close) => close,
        None => {
            inner.handle_closing(CLOSE_ABNORMAL, "");
            (CLOSE_ABNORMAL, String::new())
        }
    };
    inner.handle_closed(code, &reason);
}

impl Inner {
    fn send(&self, message: SendMessage) {
        let frame = match serde_json::to_string(&message) {
            Ok(frame) => frame,
            Err(e) => {
                error!(error = %e, "could not encode outbound frame");
                return;
            }
        };

        let outbound = lock(&self.outbound);
        let delivered = outbound
            .as_ref()
            .is_some_and(|tx| tx.send(Message::Text(frame.into())).is_ok());
        if !delivered {
            warn!(error = %BusError::NotConnected, "dropping outbound frame");
        }
    }

    fn handle_open(self: &Arc<Self>, generation: u64) {
        info!(url = %self.url, "bus socket open");
        let inner = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(inner.options.open_delay).await;

            let fire = {
                let mut flags = lock(&inner.flags);
                let current = flags.generation == generation;
                let closed = matches!(
                    flags.state,
                    ConnectionState::Closed | ConnectionState::AuthFailed
                );
                if current && !closed && flags.auth_success {
                    flags.state = ConnectionState::Open;
                    flags.is_reconnecting = false;
                    true
                } else {
                    false
                }
            };

            if fire {
                info!("bus connection ready");
                for listener in inner.open.snapshot() {
                    listener();
                }
            } else {
                debug!(generation, "open notification suppressed");
            }
        });
    }

    fn handle_closing(self: &Arc<Self>, code: u16, reason: &str) {
        let reconnect = {
            let mut flags = lock(&self.flags);
            match code {
                CLOSE_AUTH_FAILED => {
                    flags.auth_success = false;
                    flags.is_reconnecting = false;
                    flags.state = ConnectionState::AuthFailed;
                    false
                }
                CLOSE_NORMAL => {
                    flags.is_reconnecting = false;
                    false
                }
                _ => {
                    flags.is_reconnecting = true;
                    flags.state = ConnectionState::Reconnecting;
                    true
                }
            }
        };

        match code {
            CLOSE_AUTH_FAILED => {
                let err = BusError::AuthRejected {
                    code,
                    reason: reason.to_string(),
                };
                warn!(error = %err, "connection is over for good");
            }
            CLOSE_NORMAL => info!(code, reason, "bus closing"),
            _ => warn!(code, reason, "bus closed unexpectedly, reconnecting"),
        }

        if reconnect {
            spawn_connection(self.clone());
        }

        for listener in self.closing.snapshot() {
            listener(code, reason);
        }
    }

    fn handle_closed(&self, code: u16, reason: &str) {
        let notify = {
            let mut flags = lock(&self.flags);
            if flags.is_reconnecting {
                false
            } else {
                if flags.state != ConnectionState::AuthFailed {
                    flags.state = ConnectionState::Closed;
                }
                true
            }
        };

        if !notify {
            debug!(code, "socket closed during reconnect, not reported");
            return;
        }

        info!(code, reason, "bus closed");
        for listener in self.closed.snapshot() {
            listener(code, reason);
        }
    }

    fn handle_failure(&self, err: BusError) {
        error!(error = %err, url = %self.url, "bus failure");
        {
            let mut flags = lock(&self.flags);
            flags.is_reconnecting = false;
            if flags.state != ConnectionState::AuthFailed {
                flags.state = ConnectionState::Closed;
            }
        }
        for listener in self.failure.snapshot() {
            listener(&err);
        }
    }

    fn handle_text(&self, text: &str) {
        let message: ReceiveMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %BusError::Protocol(e), frame = %text, "dropping bus frame");
                return;
            }
        };

        if let Err(e) = message.decode_content() {
            warn!(error = %BusError::Protocol(e), sender = %message.sender, "dropping bus frame with malformed content");
            return;
        }

        if let Some(answer) = heartbeat_answer(&message) {
            debug!(sender = %message.sender, "answering heartbeat");
            self.send(answer);
        }

        for listener in self.message.snapshot() {
            if catch_unwind(AssertUnwindSafe(|| listener(&message))).is_err() {
                error!(sender = %message.sender, "message listener panicked");
            }
        }
    }
}
