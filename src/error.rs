//! Error types
//!
//! One enum per concern. Only an auth rejection ([`BusError::AuthRejected`],
//! close code 3001) ends the bus connection for good; everything else is
//! isolated where it happens.

use thiserror::Error;

/// Errors raised by the message bus client.
#[derive(Debug, Error)]
pub enum BusError {
    /// Transport-level failure or unexpected close. Recoverable via reconnect.
    #[error("bus connection error: {0}")]
    Connection(#[from] tokio_tungstenite::tungstenite::Error),
    /// The relay backend closed the connection with the terminal auth code.
    #[error("bus rejected credentials (close code {code}): {reason}")]
    AuthRejected { code: u16, reason: String },
    /// An inbound frame could not be decoded.
    #[error("malformed bus frame: {0}")]
    Protocol(#[from] serde_json::Error),
    /// There is no live socket to write to.
    #[error("bus is not connected")]
    NotConnected,
}

/// Errors raised by the negotiation engine adapter.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to bind peer socket: {0}")]
    Socket(#[from] std::io::Error),
    #[error("peer connection unavailable: {0}")]
    Unavailable(String),
}

/// Errors raised while acquiring capture resources.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("capture device failed: {0}")]
    Device(String),
}

/// Errors raised by the signaling coordinator.
#[derive(Debug, Error)]
pub enum SignalingError {
    /// The engine could not construct a peer connection; the session never starts.
    #[error("peer connection create failed for {peer}/{msg_id}: {source}")]
    PeerUnavailable {
        peer: String,
        msg_id: String,
        #[source]
        source: EngineError,
    },
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error("undecodable signaling payload: {0}")]
    Protocol(#[from] serde_json::Error),
    #[error("no signaling session for {peer}/{msg_id}")]
    UnknownSession { peer: String, msg_id: String },
}

/// Errors raised by the relay handlers. These never cross the bus as
/// exceptions: not-found and unsupported-method become 404 replies, protocol
/// errors drop the message.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("file does not exist or has been deleted: {0}")]
    NotFound(String),
    #[error("remote method {0} does not exist")]
    UnsupportedMethod(String),
    #[error("undecodable relay payload: {0}")]
    Protocol(#[from] serde_json::Error),
}

/// Errors raised by background transfer jobs. Logged only.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("transfer I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("data endpoint request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("data endpoint answered {status} for {url}")]
    Status {
        status: reqwest::StatusCode,
        url: String,
    },
    #[error("invalid data endpoint url: {0}")]
    Url(#[from] url::ParseError),
}

/// Errors raised by the credential store.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("credential store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("credential store is corrupt: {0}")]
    Format(#[from] serde_json::Error),
}

/// Errors raised while starting the remote control service.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("missing credential `{0}`; run `rover-relay credentials set` first")]
    MissingCredential(&'static str),
    #[error("invalid bus url: {0}")]
    Url(#[from] url::ParseError),
    #[error(transparent)]
    Credentials(#[from] CredentialError),
    #[error("invalid data endpoint: {0}")]
    Endpoint(#[from] TransferError),
}
