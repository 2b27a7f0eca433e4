//! Control messages exchanged between peers, either through the server
//! relay or over a connection's side channel.
//!
//! Wire shape: `{ "event": "...", "channelId": <conversation>, "payload": ... }`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::ids::ConversationId;
use crate::media::TrackKind;
use crate::session::SessionFlags;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed control message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown control event: {0}")]
    UnknownEvent(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
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

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
}

/// Notice that the sender's track state changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackChange {
    #[serde(rename = "type")]
    pub kind: TrackKind,
    pub state: SessionFlags,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(IceCandidate),
    TrackChange(TrackChange),
    Disconnect,
}

impl ControlEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Offer(_) => "offer",
            Self::Answer(_) => "answer",
            Self::IceCandidate(_) => "ice-candidate",
            Self::TrackChange(_) => "track-change",
            Self::Disconnect => "disconnect",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    pub channel_id: ConversationId,
    pub event: ControlEvent,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawControlMessage {
    event: String,
    channel_id: ConversationId,
    #[serde(default)]
    payload: Value,
}

impl ControlMessage {
    pub fn new(channel_id: ConversationId, event: ControlEvent) -> Self {
        Self { channel_id, event }
    }

    pub fn encode(&self) -> Result<String, WireError> {
        let payload = match &self.event {
            ControlEvent::Offer(desc) | ControlEvent::Answer(desc) => serde_json::to_value(desc)?,
            ControlEvent::IceCandidate(candidate) => serde_json::to_value(candidate)?,
            ControlEvent::TrackChange(change) => serde_json::to_value(change)?,
            ControlEvent::Disconnect => Value::Null,
        };
        let raw = RawControlMessage {
            event: self.event.name().to_string(),
            channel_id: self.channel_id,
            payload,
        };
        Ok(serde_json::to_string(&raw)?)
    }

    pub fn decode(text: &str) -> Result<Self, WireError> {
        let raw: RawControlMessage = serde_json::from_str(text)?;
        let event = match raw.event.as_str() {
            "offer" => ControlEvent::Offer(serde_json::from_value(raw.payload)?),
            "answer" => ControlEvent::Answer(serde_json::from_value(raw.payload)?),
            "ice-candidate" => ControlEvent::IceCandidate(serde_json::from_value(raw.payload)?),
            "track-change" => ControlEvent::TrackChange(serde_json::from_value(raw.payload)?),
            "disconnect" => ControlEvent::Disconnect,
            other => return Err(WireError::UnknownEvent(other.to_string())),
        };
        Ok(Self {
            channel_id: raw.channel_id,
            event,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offer_uses_documented_wire_shape() {
        let msg = ControlMessage::new(
            ConversationId(12),
            ControlEvent::Offer(SessionDescription::offer("v=0")),
        );
        let json: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(json["event"], "offer");
        assert_eq!(json["channelId"], 12);
        assert_eq!(json["payload"]["type"], "offer");
        assert_eq!(json["payload"]["sdp"], "v=0");
    }

    #[test]
    fn decodes_candidate_from_peer() {
        let text = r#"{"event":"ice-candidate","channelId":3,
            "payload":{"candidate":"candidate:1 1 udp 1 10.0.0.1 5000 typ host","sdpMid":"0","sdpMLineIndex":0}}"#;
        let msg = ControlMessage::decode(text).unwrap();
        assert_eq!(msg.channel_id, ConversationId(3));
        match msg.event {
            ControlEvent::IceCandidate(c) => {
                assert_eq!(c.sdp_mid.as_deref(), Some("0"));
                assert_eq!(c.sdp_mline_index, Some(0));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn disconnect_needs_no_payload() {
        let msg = ControlMessage::decode(r#"{"event":"disconnect","channelId":1}"#).unwrap();
        assert_eq!(msg.event, ControlEvent::Disconnect);
    }

    #[test]
    fn track_change_carries_sender_flags() {
        let change = TrackChange {
            kind: TrackKind::Audio,
            state: SessionFlags {
                is_talking: true,
                ..Default::default()
            },
        };
        let msg = ControlMessage::new(ConversationId(1), ControlEvent::TrackChange(change));
        let decoded = ControlMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn rejects_unknown_and_malformed_messages() {
        assert!(matches!(
            ControlMessage::decode(r#"{"event":"hello","channelId":1}"#),
            Err(WireError::UnknownEvent(e)) if e == "hello"
        ));
        assert!(matches!(
            ControlMessage::decode(r#"{"event":"offer","channelId":1,"payload":{}}"#),
            Err(WireError::Json(_))
        ));
    }
}
