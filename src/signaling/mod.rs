//! Signaling coordinator
//!
//! `signaling@cameraOffer` and `signaling@screenOffer` requests open a
//! session keyed by `(sender, msgId)`. Each session gets its own scoped bus
//! listener that forwards only messages from that sender carrying that
//! `msgId`, and its own task that owns the peer connection. Capture is
//! leased from a shared pool per kind.

mod session;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub use session::SessionState;
use session::{Session, SessionInput};

use crate::bus::{ListenerId, MessageBus};
use crate::capture::{CaptureKind, CapturePool};
use crate::engine::MediaEngine;
use crate::error::SignalingError;
use crate::model::envelope::ReceiveMessage;
use crate::model::signal::{
    SessionKey, ANSWER, CAMERA_OFFER, CANDIDATE, CLOSE_CAMERA, OFFER, SCREEN_OFFER,
};
use crate::util::lock;

struct SessionHandle {
    inputs: mpsc::UnboundedSender<SessionInput>,
    state: Arc<Mutex<SessionState>>,
}

pub(crate) struct Shared {
    bus: Arc<dyn MessageBus>,
    engine: Arc<dyn MediaEngine>,
    camera: Arc<CapturePool>,
    screen: Arc<CapturePool>,
    sessions: Mutex<HashMap<SessionKey, SessionHandle>>,
    listener: Mutex<Option<ListenerId>>,
}

impl Shared {
    /// Drop the bookkeeping for a closed session, unless the key already
    /// belongs to a newer session.
    fn forget(&self, key: &SessionKey, state: &Arc<Mutex<SessionState>>) {
        let mut sessions = lock(&self.sessions);
        if sessions
            .get(key)
            .is_some_and(|handle| Arc::ptr_eq(&handle.state, state))
        {
            sessions.remove(key);
        }
    }
}

/// Runs one negotiation per `(peer, msgId)`.
#[derive(Clone)]
pub struct SignalingCoordinator {
    shared: Arc<Shared>,
}

impl SignalingCoordinator {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        engine: Arc<dyn MediaEngine>,
        camera: Arc<CapturePool>,
        screen: Arc<CapturePool>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                bus,
                engine,
                camera,
                screen,
                sessions: Mutex::new(HashMap::new()),
                listener: Mutex::new(None),
            }),
        }
    }

    /// Start listening for offer requests. Calling it again is a no-op.
    pub fn register(&self) {
        let mut listener = lock(&self.shared.listener);
        if listener.is_some() {
            return;
        }

        let weak = Arc::downgrade(&self.shared);
        let id = self
            .shared
            .bus
            .on_message(Arc::new(move |message: &ReceiveMessage| {
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                let Ok(content) = message.decode_content() else {
                    return;
                };
                let kind = match content.msg_type.as_str() {
                    CAMERA_OFFER => CaptureKind::Camera,
                    SCREEN_OFFER => CaptureKind::Screen,
                    _ => return,
                };
                let coordinator = SignalingCoordinator { shared };
                if let Err(e) = coordinator.start_session(&message.sender, &content.msg_id, kind) {
                    error!(error = %e, "could not start signaling session");
                }
            }));
        *listener = Some(id);
        info!("signaling handler registered");
    }

    /// Open a session and send the local offer to `peer`.
    ///
    /// Fails if the engine cannot construct a peer connection or the capture
    /// cannot be opened. An offer for a key that is still live is ignored.
    pub fn start_session(
        &self,
        peer: &str,
        msg_id: &str,
        kind: CaptureKind,
    ) -> Result<(), SignalingError> {
        let key = SessionKey::new(peer, msg_id);
        if lock(&self.shared.sessions).contains_key(&key) {
            warn!(session = %key, "duplicate offer request ignored");
            return Ok(());
        }

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let mut connection = self
            .shared
            .engine
            .create_peer_connection(&key, event_tx)
            .map_err(|source| SignalingError::PeerUnavailable {
                peer: key.peer.clone(),
                msg_id: key.msg_id.clone(),
                source,
            })?;

        let pool = match kind {
            CaptureKind::Camera => &self.shared.camera,
            CaptureKind::Screen => &self.shared.screen,
        };
        let lease = match pool.acquire() {
            Ok(lease) => lease,
            Err(e) => {
                connection.close();
                return Err(e.into());
            }
        };

        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let listener = self
            .shared
            .bus
            .on_message(scoped_listener(key.clone(), input_tx.clone()));

        let state = Arc::new(Mutex::new(SessionState::Idle));
        lock(&self.shared.sessions).insert(
            key.clone(),
            SessionHandle {
                inputs: input_tx,
                state: state.clone(),
            },
        );

        info!(session = %key, %kind, "signaling session started");
        let session = Session {
            key,
            state,
            peer: connection,
            lease: Some(lease),
            bus: self.shared.bus.clone(),
            listener: Some(listener),
            inputs: input_rx,
            events: event_rx,
            shared: Arc::downgrade(&self.shared),
            answering: false,
            pending_local: None,
        };
        tokio::spawn(session.run());
        Ok(())
    }

    /// Close a session from this side and tell the peer with
    /// `signaling@closeCamera`.
    pub fn close_session(&self, peer: &str, msg_id: &str) -> Result<(), SignalingError> {
        let key = SessionKey::new(peer, msg_id);
        let sessions = lock(&self.shared.sessions);
        let delivered = sessions
            .get(&key)
            .is_some_and(|handle| handle.inputs.send(SessionInput::Close { notify: true }).is_ok());
        if delivered {
            Ok(())
        } else {
            Err(SignalingError::UnknownSession {
                peer: key.peer,
                msg_id: key.msg_id,
            })
        }
    }

    pub fn session_count(&self) -> usize {
        lock(&self.shared.sessions).len()
    }

    /// `None` once the session is closed and forgotten.
    pub fn session_state(&self, peer: &str, msg_id: &str) -> Option<SessionState> {
        let key = SessionKey::new(peer, msg_id);
        lock(&self.shared.sessions)
            .get(&key)
            .map(|handle| *lock(&handle.state))
    }

    /// Stop accepting offers and close every live session without notifying
    /// peers.
    pub fn shutdown(&self) {
        if let Some(id) = lock(&self.shared.listener).take() {
            self.shared.bus.remove_on_message(id);
        }
        for (key, handle) in lock(&self.shared.sessions).iter() {
            debug!(session = %key, "closing on shutdown");
            let _ = handle.inputs.send(SessionInput::Close { notify: false });
        }
    }
}

/// Forward this session's messages into its queue.
fn scoped_listener(
    key: SessionKey,
    inputs: mpsc::UnboundedSender<SessionInput>,
) -> Arc<crate::bus::MessageListener> {
    Arc::new(move |message: &ReceiveMessage| {
        if message.sender != key.peer {
            return;
        }
        let content = match message.decode_content() {
            Ok(content) => content,
            Err(e) => {
                debug!(session = %key, error = %e, "undecodable content");
                return;
            }
        };
        if content.msg_id != key.msg_id {
            return;
        }
        if matches!(
            content.msg_type.as_str(),
            OFFER | ANSWER | CANDIDATE | CLOSE_CAMERA
        ) {
            let _ = inputs.send(SessionInput::Remote(content));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::testing::MemoryBus;
    use crate::capture::testing::CountingDevice;
    use crate::engine::testing::{Call, ScriptedEngine, SharedEngine};
    use crate::engine::{PeerConnectionState, PeerEvent};
    use crate::model::envelope::MessageContent;
    use crate::model::signal::IceCandidate;
    use serde_json::{json, Value};
    use std::time::Duration;

    struct Fixture {
        bus: Arc<MemoryBus>,
        engine: Arc<ScriptedEngine>,
        device: Arc<CountingDevice>,
        coordinator: SignalingCoordinator,
    }

    fn fixture_with(engine: Arc<ScriptedEngine>) -> Fixture {
        let bus = MemoryBus::new();
        let device = Arc::new(CountingDevice::default());
        let coordinator = SignalingCoordinator::new(
            bus.clone(),
            Arc::new(SharedEngine(engine.clone())),
            CapturePool::new(device.clone(), CaptureKind::Camera),
            CapturePool::new(device.clone(), CaptureKind::Screen),
        );
        coordinator.register();
        Fixture {
            bus,
            engine,
            device,
            coordinator,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(ScriptedEngine::new())
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    fn sent_of_type(bus: &MemoryBus, msg_type: &str) -> Vec<MessageContent> {
        bus.sent_contents()
            .into_iter()
            .filter(|c| c.msg_type == msg_type)
            .collect()
    }

    #[tokio::test]
    async fn camera_offer_answer_connect_close() {
        let f = fixture();
        let key = SessionKey::new("operator", "m1");

        f.bus
            .deliver("operator", &MessageContent::new(CAMERA_OFFER, "m1", Value::Null));
        wait_until(|| f.coordinator.session_state("operator", "m1") == Some(SessionState::OfferSent))
            .await;

        let offers = sent_of_type(&f.bus, OFFER);
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].msg_id, "m1");
        assert_eq!(offers[0].payload, json!("v=0 local-offer"));
        assert_eq!(f.bus.sent()[0].names, vec!["operator".to_string()]);
        assert_eq!(f.bus.listener_count(), 2);

        f.bus
            .deliver("operator", &MessageContent::new(ANSWER, "m1", json!("v=0 remote-answer")));
        wait_until(|| f.coordinator.session_state("operator", "m1") == Some(SessionState::Connected))
            .await;
        assert!(f
            .engine
            .calls(&key)
            .contains(&Call::SetRemote(crate::model::signal::SessionDescription::answer(
                "v=0 remote-answer"
            ))));

        f.bus
            .deliver("operator", &MessageContent::new(CLOSE_CAMERA, "m1", Value::Null));
        wait_until(|| f.coordinator.session_count() == 0).await;

        assert_eq!(f.device.released(), 1);
        assert_eq!(f.bus.listener_count(), 1);
        assert_eq!(f.engine.calls(&key).last(), Some(&Call::Close));
    }

    #[tokio::test]
    async fn scoped_listener_ignores_other_senders_and_ids() {
        let f = fixture();
        let key = SessionKey::new("operator", "m1");
        f.bus
            .deliver("operator", &MessageContent::new(CAMERA_OFFER, "m1", Value::Null));
        wait_until(|| f.coordinator.session_state("operator", "m1") == Some(SessionState::OfferSent))
            .await;

        f.bus
            .deliver("intruder", &MessageContent::new(CLOSE_CAMERA, "m1", Value::Null));
        f.bus
            .deliver("operator", &MessageContent::new(CLOSE_CAMERA, "other", Value::Null));
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(f.coordinator.session_count(), 1);
        assert!(!f.engine.calls(&key).contains(&Call::Close));
    }

    #[tokio::test]
    async fn concurrent_sessions_share_capture_and_release_once() {
        let f = fixture();
        f.bus
            .deliver("op-a", &MessageContent::new(CAMERA_OFFER, "1", Value::Null));
        f.bus
            .deliver("op-b", &MessageContent::new(CAMERA_OFFER, "2", Value::Null));
        wait_until(|| sent_of_type(&f.bus, OFFER).len() == 2).await;
        assert_eq!(f.device.opened(), 1);

        let a = SessionKey::new("op-a", "1");
        let b = SessionKey::new("op-b", "2");
        assert_eq!(f.engine.calls(&a)[0], f.engine.calls(&b)[0]);

        f.bus
            .deliver("op-a", &MessageContent::new(CLOSE_CAMERA, "1", Value::Null));
        wait_until(|| f.coordinator.session_count() == 1).await;
        assert_eq!(f.device.released(), 0);

        f.engine
            .emit(&b, PeerEvent::StateChanged(PeerConnectionState::Failed));
        wait_until(|| f.coordinator.session_count() == 0).await;
        assert_eq!(f.device.released(), 1);
        assert_eq!(f.device.opened(), 1);
    }

    #[tokio::test]
    async fn remote_offer_is_answered() {
        let f = fixture();
        f.bus
            .deliver("operator", &MessageContent::new(CAMERA_OFFER, "m2", Value::Null));
        wait_until(|| f.coordinator.session_state("operator", "m2") == Some(SessionState::OfferSent))
            .await;

        f.bus
            .deliver("operator", &MessageContent::new(OFFER, "m2", json!("v=0 remote-offer")));
        wait_until(|| f.coordinator.session_state("operator", "m2") == Some(SessionState::AnswerSent))
            .await;
        let answers = sent_of_type(&f.bus, ANSWER);
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].payload, json!("v=0 local-answer"));

        f.engine.emit(
            &SessionKey::new("operator", "m2"),
            PeerEvent::StateChanged(PeerConnectionState::Connected),
        );
        wait_until(|| f.coordinator.session_state("operator", "m2") == Some(SessionState::Connected))
            .await;
    }

    #[tokio::test]
    async fn candidates_flow_both_ways() {
        let f = fixture();
        let key = SessionKey::new("operator", "m3");
        f.bus
            .deliver("operator", &MessageContent::new(CAMERA_OFFER, "m3", Value::Null));
        wait_until(|| f.coordinator.session_count() == 1).await;

        let remote = IceCandidate {
            sdp_mid: Some("0".into()),
            sdp_m_line_index: 0,
            candidate: "candidate:1 1 udp 2130706431 10.0.0.9 4000 typ host".into(),
        };
        f.bus.deliver(
            "operator",
            &MessageContent::new(CANDIDATE, "m3", serde_json::to_value(&remote).unwrap()),
        );
        wait_until(|| f.engine.calls(&key).contains(&Call::AddCandidate(remote.clone()))).await;

        let local = IceCandidate {
            candidate: "candidate:2 1 udp 2130706431 10.0.0.2 5000 typ host".into(),
            ..remote.clone()
        };
        f.engine.emit(&key, PeerEvent::IceCandidate(local.clone()));
        wait_until(|| !sent_of_type(&f.bus, CANDIDATE).is_empty()).await;

        let sent = &sent_of_type(&f.bus, CANDIDATE)[0];
        assert_eq!(sent.msg_id, "m3");
        assert_eq!(sent.payload["sdp"], json!(local.candidate));
    }

    #[tokio::test]
    async fn screen_offer_uses_the_screen_pool() {
        let f = fixture();
        f.bus
            .deliver("operator", &MessageContent::new(SCREEN_OFFER, "s1", Value::Null));
        wait_until(|| sent_of_type(&f.bus, OFFER).len() == 1).await;

        let calls = f.engine.calls(&SessionKey::new("operator", "s1"));
        assert_eq!(calls[0], Call::AddTracks("screen-0".into()));
    }

    #[tokio::test]
    async fn unconstructible_peer_starts_nothing() {
        let f = fixture_with(ScriptedEngine::failing());
        let err = f
            .coordinator
            .start_session("operator", "m4", CaptureKind::Camera)
            .unwrap_err();
        assert!(matches!(err, SignalingError::PeerUnavailable { .. }));
        assert_eq!(f.coordinator.session_count(), 0);
        assert_eq!(f.device.opened(), 0);
        assert_eq!(f.bus.listener_count(), 1);
    }

    #[tokio::test]
    async fn failed_answer_keeps_the_session_where_it_was() {
        let f = fixture();
        let key = SessionKey::new("operator", "m6");
        f.bus
            .deliver("operator", &MessageContent::new(CAMERA_OFFER, "m6", Value::Null));
        wait_until(|| f.coordinator.session_state("operator", "m6") == Some(SessionState::OfferSent))
            .await;

        f.bus
            .deliver("operator", &MessageContent::new(ANSWER, "m6", json!("")));
        let empty = Call::SetRemote(crate::model::signal::SessionDescription::answer(""));
        wait_until(|| f.engine.calls(&key).contains(&empty)).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(
            f.coordinator.session_state("operator", "m6"),
            Some(SessionState::AnswerReceived)
        );
        let set_remote = f
            .engine
            .calls(&key)
            .into_iter()
            .filter(|c| matches!(c, Call::SetRemote(_)))
            .count();
        assert_eq!(set_remote, 1);
        assert_eq!(f.device.released(), 0);
    }

    #[tokio::test]
    async fn failed_remote_offer_sends_no_answer() {
        let f = fixture();
        let key = SessionKey::new("operator", "m7");
        f.bus
            .deliver("operator", &MessageContent::new(CAMERA_OFFER, "m7", Value::Null));
        wait_until(|| f.coordinator.session_state("operator", "m7") == Some(SessionState::OfferSent))
            .await;

        f.bus
            .deliver("operator", &MessageContent::new(OFFER, "m7", json!("")));
        let empty = Call::SetRemote(crate::model::signal::SessionDescription::offer(""));
        wait_until(|| f.engine.calls(&key).contains(&empty)).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(sent_of_type(&f.bus, ANSWER).is_empty());
        assert!(!f.engine.calls(&key).contains(&Call::CreateAnswer));
        assert_eq!(
            f.coordinator.session_state("operator", "m7"),
            Some(SessionState::OfferSent)
        );

        // No longer answering: a remote answer now completes our own offer.
        f.bus
            .deliver("operator", &MessageContent::new(ANSWER, "m7", json!("v=0 remote-answer")));
        wait_until(|| f.coordinator.session_state("operator", "m7") == Some(SessionState::Connected))
            .await;
        assert!(!f.engine.calls(&key).contains(&Call::CreateAnswer));
    }

    #[tokio::test]
    async fn capture_failure_closes_the_new_peer() {
        let bus = MemoryBus::new();
        let engine = ScriptedEngine::new();
        let broken = Arc::new(crate::capture::DeclaredCapture::new(
            crate::capture::CaptureSettings {
                width: 0,
                ..Default::default()
            },
        ));
        let coordinator = SignalingCoordinator::new(
            bus.clone(),
            Arc::new(SharedEngine(engine.clone())),
            CapturePool::new(broken.clone(), CaptureKind::Camera),
            CapturePool::new(broken, CaptureKind::Screen),
        );

        let err = coordinator
            .start_session("operator", "m8", CaptureKind::Camera)
            .unwrap_err();
        assert!(matches!(err, SignalingError::Capture(_)));
        assert_eq!(coordinator.session_count(), 0);
        assert_eq!(
            engine.calls(&SessionKey::new("operator", "m8")),
            vec![Call::Close]
        );
        assert_eq!(bus.listener_count(), 0);
    }

    #[tokio::test]
    async fn local_close_notifies_the_peer() {
        let f = fixture();
        f.coordinator
            .start_session("operator", "m5", CaptureKind::Camera)
            .unwrap();
        f.coordinator.close_session("operator", "m5").unwrap();
        wait_until(|| f.coordinator.session_count() == 0).await;

        let closes = sent_of_type(&f.bus, CLOSE_CAMERA);
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[0].msg_id, "m5");
        assert!(matches!(
            f.coordinator.close_session("operator", "m5"),
            Err(SignalingError::UnknownSession { .. })
        ));
    }
}
