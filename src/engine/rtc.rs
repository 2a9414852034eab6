//! [`MediaEngine`] backed by str0m.
//!
//! str0m is sans-IO, so every peer gets one driver task that owns the `Rtc`
//! instance and its UDP socket. The [`PeerConnection`] handle handed to the
//! signaling layer only queues commands for that task; results come back as
//! [`PeerEvent`]s.
//!
//! Host candidates are embedded in the generated SDP, so nothing is
//! trickled from this side. Media frames are written by the platform codec
//! and are outside this driver.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket as StdUdpSocket};
use std::time::Instant;

use str0m::change::{SdpAnswer, SdpOffer, SdpPendingOffer};
use str0m::media::{Direction, MediaKind};
use str0m::net::{Protocol, Receive};
use str0m::{Candidate, Event, IceConnectionState, Input, Output, Rtc};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{MediaEngine, PeerConnection, PeerConnectionState, PeerEvent, PeerEvents};
use crate::capture::{CaptureResource, TrackKind};
use crate::error::EngineError;
use crate::model::signal::{IceCandidate, SdpKind, SessionDescription, SessionKey};
use crate::util::get_candidates;

/// Large enough for any UDP datagram we expect.
const RECV_BUFFER: usize = 2000;

#[derive(Debug, Clone)]
pub struct RtcEngineConfig {
    /// Address each peer socket binds to. Port 0 picks a free port per peer.
    pub bind: SocketAddr,
}

impl Default for RtcEngineConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RtcEngine {
    config: RtcEngineConfig,
}

impl RtcEngine {
    pub fn new(config: RtcEngineConfig) -> Self {
        Self { config }
    }
}

impl MediaEngine for RtcEngine {
    fn create_peer_connection(
        &self,
        key: &SessionKey,
        events: PeerEvents,
    ) -> Result<Box<dyn PeerConnection>, EngineError> {
        let socket = StdUdpSocket::bind(self.config.bind)?;
        socket.set_nonblocking(true)?;
        let local = socket.local_addr()?;
        let socket = UdpSocket::from_std(socket)?;

        let mut rtc = Rtc::new();
        let candidates = get_candidates(local);
        for candidate in &candidates {
            rtc.add_local_candidate(candidate.clone());
        }
        // A wildcard bind cannot be matched against candidates, so inbound
        // datagrams are attributed to the first host candidate.
        let destination = if local.ip().is_unspecified() {
            candidates.first().map(|c| c.addr()).unwrap_or(local)
        } else {
            local
        };
        info!(session = %key, %local, candidates = candidates.len(), "peer socket bound");

        let (tx, rx) = mpsc::unbounded_channel();
        let driver = Driver {
            key: key.clone(),
            rtc,
            socket,
            destination,
            events,
            commands: rx,
            tracks: Vec::new(),
            pending: None,
            remote_offer: None,
            closed_locally: false,
        };
        tokio::spawn(driver.run());

        Ok(Box::new(RtcPeer { commands: tx }))
    }
}

#[derive(Debug)]
enum Command {
    AddTracks(Vec<(MediaKind, String, String)>),
    CreateOffer,
    CreateAnswer,
    SetLocal(SessionDescription),
    SetRemote(SessionDescription),
    AddCandidate(IceCandidate),
    Close,
}

struct RtcPeer {
    commands: mpsc::UnboundedSender<Command>,
}

impl RtcPeer {
    fn queue(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("peer driver already stopped");
        }
    }
}

impl PeerConnection for RtcPeer {
    fn add_tracks(&mut self, capture: &CaptureResource) {
        let tracks = capture
            .tracks()
            .map(|track| {
                let kind = match track.kind {
                    TrackKind::Audio => MediaKind::Audio,
                    TrackKind::Video => MediaKind::Video,
                };
                (kind, capture.stream_id.clone(), track.id.clone())
            })
            .collect();
        self.queue(Command::AddTracks(tracks));
    }

    fn create_offer(&mut self) {
        self.queue(Command::CreateOffer);
    }

    fn create_answer(&mut self) {
        self.queue(Command::CreateAnswer);
    }

    fn set_local_description(&mut self, description: SessionDescription) {
        self.queue(Command::SetLocal(description));
    }

    fn set_remote_description(&mut self, description: SessionDescription) {
        self.queue(Command::SetRemote(description));
    }

    fn add_ice_candidate(&mut self, candidate: IceCandidate) {
        self.queue(Command::AddCandidate(candidate));
    }

    fn close(&mut self) {
        self.queue(Command::Close);
    }
}

struct Driver {
    key: SessionKey,
    rtc: Rtc,
    socket: UdpSocket,
    destination: SocketAddr,
    events: PeerEvents,
    commands: mpsc::UnboundedReceiver<Command>,
    tracks: Vec<(MediaKind, String, String)>,
    pending: Option<SdpPendingOffer>,
    remote_offer: Option<SdpOffer>,
    closed_locally: bool,
}

impl Driver {
    async fn run(mut self) {
        let mut buf = vec![0; RECV_BUFFER];

        loop {
            let Some(deadline) = self.poll_until_timeout().await else {
                break;
            };
            let wait = deadline.saturating_duration_since(Instant::now());

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.apply(command),
                    // Handle dropped without an explicit close.
                    None => {
                        self.closed_locally = true;
                        self.rtc.disconnect();
                    }
                },
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((n, source)) => self.receive(source, &buf[..n]),
                    Err(e) => {
                        warn!(session = %self.key, error = %e, "peer socket failed");
                        self.rtc.disconnect();
                    }
                },
                _ = tokio::time::sleep(wait) => {
                    self.handle_input(Input::Timeout(Instant::now()));
                }
            }
        }

        let state = if self.closed_locally {
            PeerConnectionState::Closed
        } else {
            PeerConnectionState::Failed
        };
        info!(session = %self.key, ?state, "peer driver stopped");
        self.emit(PeerEvent::StateChanged(state));
    }

    /// Drain outputs until str0m asks to be woken at a deadline. `None` once
    /// the connection is dead.
    async fn poll_until_timeout(&mut self) -> Option<Instant> {
        loop {
            if !self.rtc.is_alive() {
                return None;
            }
            match self.rtc.poll_output() {
                Ok(Output::Timeout(deadline)) => return Some(deadline),
                Ok(Output::Transmit(transmit)) => {
                    if let Err(e) = self
                        .socket
                        .send_to(&transmit.contents, transmit.destination)
                        .await
                    {
                        debug!(session = %self.key, error = %e, "dropping datagram");
                    }
                }
                Ok(Output::Event(event)) => self.handle_event(event),
                Err(e) => {
                    warn!(session = %self.key, error = ?e, "poll_output failed");
                    self.rtc.disconnect();
                }
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::IceConnectionStateChange(state) => {
                info!(session = %self.key, ?state, "ice state");
                match state {
                    IceConnectionState::Checking => {
                        self.emit(PeerEvent::StateChanged(PeerConnectionState::Connecting))
                    }
                    IceConnectionState::Disconnected => {
                        self.emit(PeerEvent::StateChanged(PeerConnectionState::Disconnected));
                        // No ICE restart; a lost peer ends the session.
                        self.rtc.disconnect();
                    }
                    _ => {}
                }
            }
            Event::Connected => {
                self.emit(PeerEvent::StateChanged(PeerConnectionState::Connected));
            }
            other => debug!(session = %self.key, event = ?other, "rtc event"),
        }
    }

    fn receive(&mut self, source: SocketAddr, data: &[u8]) {
        let Ok(contents) = data.try_into() else {
            debug!(session = %self.key, %source, "ignoring unparseable datagram");
            return;
        };
        let input = Input::Receive(
            Instant::now(),
            Receive {
                proto: Protocol::Udp,
                source,
                destination: self.destination,
                contents,
            },
        );
        if self.rtc.accepts(&input) {
            self.handle_input(input);
        }
    }

    fn handle_input(&mut self, input: Input) {
        if let Err(e) = self.rtc.handle_input(input) {
            warn!(session = %self.key, error = ?e, "peer disconnected");
            self.rtc.disconnect();
        }
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::AddTracks(tracks) => self.tracks.extend(tracks),
            Command::CreateOffer => self.create_offer(),
            Command::CreateAnswer => self.create_answer(),
            Command::SetLocal(description) => {
                // str0m applies the local side while building it.
                debug!(session = %self.key, kind = ?description.kind, "local description set");
                self.emit(PeerEvent::LocalDescriptionSet);
            }
            Command::SetRemote(description) => self.set_remote(description),
            Command::AddCandidate(candidate) => {
                match Candidate::from_sdp_string(&candidate.candidate) {
                    Ok(candidate) => self.rtc.add_remote_candidate(candidate),
                    Err(e) => warn!(session = %self.key, error = ?e, "bad remote candidate"),
                }
            }
            Command::Close => {
                self.closed_locally = true;
                self.rtc.disconnect();
            }
        }
    }

    fn create_offer(&mut self) {
        let mut change = self.rtc.sdp_api();
        for (kind, stream_id, track_id) in &self.tracks {
            change.add_media(
                *kind,
                Direction::SendOnly,
                Some(stream_id.clone()),
                Some(track_id.clone()),
                None,
            );
        }
        match change.apply() {
            Some((offer, pending)) => {
                self.pending = Some(pending);
                self.emit(PeerEvent::DescriptionCreated(SessionDescription::offer(
                    offer.to_sdp_string(),
                )));
            }
            None => self.emit(PeerEvent::CreateFailed("no media to offer".to_string())),
        }
    }

    fn create_answer(&mut self) {
        let Some(offer) = self.remote_offer.take() else {
            self.emit(PeerEvent::CreateFailed("no remote offer".to_string()));
            return;
        };
        match self.rtc.sdp_api().accept_offer(offer) {
            Ok(answer) => self.emit(PeerEvent::DescriptionCreated(SessionDescription::answer(
                answer.to_sdp_string(),
            ))),
            Err(e) => self.emit(PeerEvent::CreateFailed(e.to_string())),
        }
    }

    fn set_remote(&mut self, description: SessionDescription) {
        match description.kind {
            SdpKind::Offer => match SdpOffer::from_sdp_string(&description.sdp) {
                Ok(offer) => {
                    self.remote_offer = Some(offer);
                    self.emit(PeerEvent::RemoteDescriptionSet);
                }
                Err(e) => self.emit(PeerEvent::SetFailed(e.to_string())),
            },
            SdpKind::Answer => {
                let Some(pending) = self.pending.take() else {
                    self.emit(PeerEvent::SetFailed("no pending offer".to_string()));
                    return;
                };
                let applied = SdpAnswer::from_sdp_string(&description.sdp)
                    .map_err(|e| e.to_string())
                    .and_then(|answer| {
                        self.rtc
                            .sdp_api()
                            .accept_answer(pending, answer)
                            .map_err(|e| e.to_string())
                    });
                match applied {
                    Ok(()) => self.emit(PeerEvent::RemoteDescriptionSet),
                    Err(e) => self.emit(PeerEvent::SetFailed(e)),
                }
            }
        }
    }

    fn emit(&self, event: PeerEvent) {
        if self.events.send(event).is_err() {
            debug!(session = %self.key, "session gone, dropping peer event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn offer_without_media_fails_and_close_reports_closed() {
        let engine = RtcEngine::new(RtcEngineConfig {
            bind: "127.0.0.1:0".parse().unwrap(),
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut peer = engine
            .create_peer_connection(&SessionKey::new("op", "1"), tx)
            .unwrap();

        peer.create_offer();
        assert_eq!(
            rx.recv().await,
            Some(PeerEvent::CreateFailed("no media to offer".to_string()))
        );

        peer.close();
        loop {
            match rx.recv().await {
                Some(PeerEvent::StateChanged(PeerConnectionState::Closed)) => break,
                Some(_) => continue,
                None => panic!("driver stopped without reporting"),
            }
        }
    }

    #[tokio::test]
    async fn answer_without_pending_offer_is_rejected() {
        let engine = RtcEngine::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut peer = engine
            .create_peer_connection(&SessionKey::new("op", "2"), tx)
            .unwrap();

        peer.set_remote_description(SessionDescription::answer("v=0"));
        assert!(matches!(rx.recv().await, Some(PeerEvent::SetFailed(_))));
        peer.create_answer();
        assert!(matches!(rx.recv().await, Some(PeerEvent::CreateFailed(_))));
    }
}
