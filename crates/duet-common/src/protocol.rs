//! Signaling wire protocol shared by peers and the room server.
//!
//! Peers exchange JSON text frames tagged by `type`:
//!
//! ```text
//! {"type":"candidate","label":0,"id":"data","candidate":"candidate:1 1 udp ..."}
//! {"type":"offer","sdp":"v=0..."}
//! {"type":"answer","sdp":"v=0..."}
//! {"type":"bye"}
//! ```
//!
//! The room server speaks a separate, smaller vocabulary tagged by `room`
//! (see [`RoomNotice`]); it never rewrites peer frames.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Message `type` values a peer may send.
pub const KNOWN_MESSAGE_TYPES: [&str; 4] = ["candidate", "offer", "answer", "bye"];

/// Role of a participant in a two-party room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// First arrival; creates the offer.
    Initiator,
    /// Second arrival; answers the offer.
    Joiner,
}

impl Role {
    pub fn is_initiator(self) -> bool {
        matches!(self, Role::Initiator)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => write!(f, "initiator"),
            Role::Joiner => write!(f, "joiner"),
        }
    }
}

/// Which half of the offer/answer exchange a description is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl SdpKind {
    /// Canonical lower-case form used on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
        }
    }
}

impl fmt::Display for SdpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A session description produced or consumed by the session engine.
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

/// An ICE candidate as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Index of the media line the candidate belongs to.
    #[serde(rename = "label")]
    pub sdp_mline_index: u16,
    /// Media stream identification tag.
    #[serde(rename = "id")]
    pub sdp_mid: String,
    /// The `candidate:` attribute itself.
    pub candidate: String,
}

impl IceCandidate {
    pub fn new(
        sdp_mline_index: u16,
        sdp_mid: impl Into<String>,
        candidate: impl Into<String>,
    ) -> Self {
        Self {
            sdp_mline_index,
            sdp_mid: sdp_mid.into(),
            candidate: candidate.into(),
        }
    }
}

/// A signaling message exchanged between the two participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "WireMessage", into = "WireMessage")]
pub enum SignalingMessage {
    Candidate(IceCandidate),
    SessionDescription(SessionDescription),
    Bye,
}

impl SignalingMessage {
    /// Wire `type` of this message.
    pub fn type_name(&self) -> &'static str {
        match self {
            SignalingMessage::Candidate(_) => "candidate",
            SignalingMessage::SessionDescription(desc) => desc.kind.as_str(),
            SignalingMessage::Bye => "bye",
        }
    }

    /// Serialize to the JSON text frame.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a JSON text frame.
    ///
    /// Frames that are not JSON objects, carry no `type`, carry an unknown
    /// `type`, or miss fields required by their `type` are protocol errors.
    pub fn decode(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| Error::protocol(format!("malformed signaling frame: {e}")))?;

        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::protocol("signaling frame has no `type`"))?;

        if !KNOWN_MESSAGE_TYPES.contains(&kind) {
            return Err(Error::protocol(format!("unknown message type `{kind}`")));
        }

        let kind = kind.to_string();
        serde_json::from_value(value)
            .map_err(|e| Error::protocol(format!("malformed `{kind}` message: {e}")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum WireMessage {
    Candidate(IceCandidate),
    Offer { sdp: String },
    Answer { sdp: String },
    Bye,
}

impl From<WireMessage> for SignalingMessage {
    fn from(wire: WireMessage) -> Self {
        match wire {
            WireMessage::Candidate(candidate) => SignalingMessage::Candidate(candidate),
            WireMessage::Offer { sdp } => {
                SignalingMessage::SessionDescription(SessionDescription::offer(sdp))
            }
            WireMessage::Answer { sdp } => {
                SignalingMessage::SessionDescription(SessionDescription::answer(sdp))
            }
            WireMessage::Bye => SignalingMessage::Bye,
        }
    }
}

impl From<SignalingMessage> for WireMessage {
    fn from(msg: SignalingMessage) -> Self {
        match msg {
            SignalingMessage::Candidate(candidate) => WireMessage::Candidate(candidate),
            SignalingMessage::SessionDescription(SessionDescription {
                kind: SdpKind::Offer,
                sdp,
            }) => WireMessage::Offer { sdp },
            SignalingMessage::SessionDescription(SessionDescription {
                kind: SdpKind::Answer,
                sdp,
            }) => WireMessage::Answer { sdp },
            SignalingMessage::Bye => WireMessage::Bye,
        }
    }
}

/// Room bookkeeping frames sent by the room server.
///
/// Tagged by `room` rather than `type` so they can never be mistaken for a
/// peer's [`SignalingMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "room", rename_all = "snake_case")]
pub enum RoomNotice {
    /// You opened an empty room and will be the initiator.
    Created,
    /// You entered a room someone else created and will be the joiner.
    Joined,
    /// The second participant arrived in the room you created.
    PeerJoined,
    /// The room already holds two participants.
    Full,
}

impl RoomNotice {
    /// Returns the notice if `text` is a room frame, `None` for anything else.
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
