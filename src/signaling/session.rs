use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::Shared;
use crate::bus::{ListenerId, MessageBus};
use crate::capture::CaptureLease;
use crate::engine::{PeerConnection, PeerConnectionState, PeerEvent};
use crate::error::SignalingError;
use crate::model::envelope::{MessageContent, SendMessage};
use crate::model::signal::{
    IceCandidate, SdpKind, SessionDescription, SessionKey, ANSWER, CANDIDATE, CLOSE_CAMERA, OFFER,
};
use crate::util::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    OfferCreated,
    OfferSent,
    AnswerReceived,
    AnswerSent,
    Connected,
    Closed,
}

/// Input queued for a session task, from the bus or from the coordinator.
#[derive(Debug)]
pub(super) enum SessionInput {
    Remote(MessageContent),
    /// Close locally; `notify` also tells the peer.
    Close { notify: bool },
}

/// One negotiation. Runs as a single task that owns the peer handle, so all
/// transitions are serialized.
pub(super) struct Session {
    pub key: SessionKey,
    pub state: Arc<Mutex<SessionState>>,
    pub peer: Box<dyn PeerConnection>,
    pub lease: Option<CaptureLease>,
    pub bus: Arc<dyn MessageBus>,
    pub listener: Option<ListenerId>,
    pub inputs: mpsc::UnboundedReceiver<SessionInput>,
    pub events: mpsc::UnboundedReceiver<PeerEvent>,
    pub shared: Weak<Shared>,
    /// A remote offer is being answered.
    pub answering: bool,
    /// Created locally, waiting for the engine to confirm it is set.
    pub pending_local: Option<SessionDescription>,
}

impl Session {
    pub async fn run(mut self) {
        if let Some(lease) = &self.lease {
            self.peer.add_tracks(lease.resource());
        }
        self.peer.create_offer();

        while self.state() != SessionState::Closed {
            tokio::select! {
                Some(input) = self.inputs.recv() => self.on_input(input),
                Some(event) = self.events.recv() => self.on_event(event),
                else => {
                    debug!(session = %self.key, "session inputs gone");
                    self.close(true);
                }
            }
        }
    }

    fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    fn set_state(&self, state: SessionState) {
        let mut current = lock(&self.state);
        if *current != state {
            debug!(session = %self.key, from = ?*current, to = ?state, "session transition");
            *current = state;
        }
    }

    fn on_input(&mut self, input: SessionInput) {
        match input {
            SessionInput::Close { notify } => {
                if notify {
                    self.send(CLOSE_CAMERA, Value::String(String::new()));
                }
                self.close(true);
            }
            SessionInput::Remote(content) => match content.msg_type.as_str() {
                CLOSE_CAMERA => {
                    info!(session = %self.key, "peer closed the session");
                    self.close(true);
                }
                OFFER => {
                    let Some(sdp) = content.payload.as_str() else {
                        warn!(session = %self.key, "offer payload is not an sdp string");
                        return;
                    };
                    self.answering = true;
                    self.peer
                        .set_remote_description(SessionDescription::offer(sdp));
                }
                ANSWER => {
                    let Some(sdp) = content.payload.as_str() else {
                        warn!(session = %self.key, "answer payload is not an sdp string");
                        return;
                    };
                    self.set_state(SessionState::AnswerReceived);
                    self.peer
                        .set_remote_description(SessionDescription::answer(sdp));
                }
                CANDIDATE => match serde_json::from_value::<IceCandidate>(content.payload) {
                    Ok(candidate) => self.peer.add_ice_candidate(candidate),
                    Err(e) => {
                        let e = SignalingError::Protocol(e);
                        warn!(session = %self.key, error = %e, "dropping candidate");
                    }
                },
                other => debug!(session = %self.key, msg_type = other, "ignored"),
            },
        }
    }

    fn on_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::DescriptionCreated(description) => {
                if description.kind == SdpKind::Offer {
                    self.set_state(SessionState::OfferCreated);
                }
                self.peer.set_local_description(description.clone());
                self.pending_local = Some(description);
            }
            PeerEvent::LocalDescriptionSet => match self.pending_local.take() {
                Some(description) if description.kind == SdpKind::Offer => {
                    self.send(OFFER, Value::String(description.sdp));
                    self.set_state(SessionState::OfferSent);
                }
                Some(description) => {
                    self.send(ANSWER, Value::String(description.sdp));
                    self.answering = false;
                    self.set_state(SessionState::AnswerSent);
                }
                None => debug!(session = %self.key, "local description set twice"),
            },
            PeerEvent::RemoteDescriptionSet => {
                if self.answering {
                    self.peer.create_answer();
                } else if self.state() == SessionState::AnswerReceived {
                    self.set_state(SessionState::Connected);
                }
            }
            PeerEvent::CreateFailed(reason) => {
                warn!(session = %self.key, %reason, "sdp create failed");
                self.answering = false;
            }
            PeerEvent::SetFailed(reason) => {
                warn!(session = %self.key, %reason, "sdp set failed");
                self.answering = false;
            }
            PeerEvent::IceCandidate(candidate) => match serde_json::to_value(&candidate) {
                Ok(payload) => self.send(CANDIDATE, payload),
                Err(e) => warn!(session = %self.key, error = %e, "could not encode candidate"),
            },
            PeerEvent::StateChanged(state) => {
                info!(session = %self.key, ?state, "peer connection state");
                match state {
                    PeerConnectionState::Connected => self.set_state(SessionState::Connected),
                    s if s.is_terminal() => self.close(false),
                    _ => {}
                }
            }
        }
    }

    fn send(&self, msg_type: &str, payload: Value) {
        let content = MessageContent::new(msg_type, self.key.msg_id.clone(), payload);
        match SendMessage::encode_to(&self.key.peer, &content) {
            Ok(message) => self.bus.send(message),
            Err(e) => warn!(session = %self.key, error = %e, "could not encode {msg_type}"),
        }
    }

    /// Enter the terminal state. `close_peer` is false when the engine has
    /// already reported the peer as gone.
    fn close(&mut self, close_peer: bool) {
        if self.state() == SessionState::Closed {
            return;
        }
        self.set_state(SessionState::Closed);

        if let Some(id) = self.listener.take() {
            self.bus.remove_on_message(id);
        }
        if close_peer {
            self.peer.close();
        }
        if let Some(mut lease) = self.lease.take() {
            lease.release();
        }
        if let Some(shared) = self.shared.upgrade() {
            shared.forget(&self.key, &self.state);
        }
        info!(session = %self.key, "session closed");
    }
}
