//! Negotiation engine
//!
//! The signaling layer drives peer connections through [`PeerConnection`]
//! and learns about results through [`PeerEvent`]s, delivered asynchronously
//! on the channel handed over at creation. Results of `create_*` and `set_*`
//! calls arrive as events, never as return values, the same way a native
//! WebRTC stack reports them.

mod rtc;

pub use rtc::{RtcEngine, RtcEngineConfig};

use tokio::sync::mpsc;

use crate::capture::CaptureResource;
use crate::error::EngineError;
use crate::model::signal::{IceCandidate, SessionDescription, SessionKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerConnectionState {
    /// Failed and Closed end the peer connection for good.
    pub fn is_terminal(self) -> bool {
        matches!(self, PeerConnectionState::Failed | PeerConnectionState::Closed)
    }
}

/// Asynchronous notifications from a peer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// `create_offer` or `create_answer` produced a description.
    DescriptionCreated(SessionDescription),
    CreateFailed(String),
    LocalDescriptionSet,
    RemoteDescriptionSet,
    SetFailed(String),
    /// A local candidate to trickle to the remote side.
    IceCandidate(IceCandidate),
    StateChanged(PeerConnectionState),
}

pub type PeerEvents = mpsc::UnboundedSender<PeerEvent>;

/// One peer connection inside the engine.
pub trait PeerConnection: Send {
    /// Attach the capture's tracks as send-only media.
    fn add_tracks(&mut self, capture: &CaptureResource);

    fn create_offer(&mut self);

    /// Valid once a remote offer has been set.
    fn create_answer(&mut self);

    fn set_local_description(&mut self, description: SessionDescription);

    fn set_remote_description(&mut self, description: SessionDescription);

    /// Candidates may arrive in any phase; the engine buffers or drops them.
    fn add_ice_candidate(&mut self, candidate: IceCandidate);

    /// Tear the connection down. A `StateChanged(Closed)` event follows.
    fn close(&mut self);
}

pub trait MediaEngine: Send + Sync {
    /// Construct a peer connection for `key`. Events for it go to `events`.
    fn create_peer_connection(
        &self,
        key: &SessionKey,
        events: PeerEvents,
    ) -> Result<Box<dyn PeerConnection>, EngineError>;
}
