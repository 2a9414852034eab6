//! Signaling messages exchanged with the remote operator.

use std::fmt;

use serde::{Deserialize, Serialize};

pub const CAMERA_OFFER: &str = "signaling@cameraOffer";
pub const SCREEN_OFFER: &str = "signaling@screenOffer";
pub const OFFER: &str = "signaling@offer";
pub const ANSWER: &str = "signaling@answer";
pub const CANDIDATE: &str = "signaling@candidate";
pub const CLOSE_CAMERA: &str = "signaling@closeCamera";

/// Identifies one negotiation: the remote peer and the `msgId` of the offer
/// request that opened it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub peer: String,
    pub msg_id: String,
}

impl SessionKey {
    pub fn new(peer: impl Into<String>, msg_id: impl Into<String>) -> Self {
        Self {
            peer: peer.into(),
            msg_id: msg_id.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.peer, self.msg_id)
    }
}

/// Which side of an SDP exchange a description belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

/// A session description handed to or produced by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Trickled ICE candidate, as carried in `signaling@candidate` payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_m_line_index: u32,
    #[serde(rename = "sdp")]
    pub candidate: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn candidate_wire_names() {
        let c = IceCandidate {
            sdp_mid: Some("0".into()),
            sdp_m_line_index: 0,
            candidate: "candidate:1 1 udp 2130706431 10.0.0.2 5000 typ host".into(),
        };
        let value = serde_json::to_value(&c).unwrap();
        assert_eq!(value["sdpMid"], json!("0"));
        assert_eq!(value["sdpMLineIndex"], json!(0));
        assert!(value["sdp"].as_str().unwrap().starts_with("candidate:"));

        let back: IceCandidate = serde_json::from_value(value).unwrap();
        assert_eq!(back, c);
    }
}
