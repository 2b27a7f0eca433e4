//! Notifications the call engine publishes for UI consumers.

use serde::Serialize;

use crate::ids::{ConversationId, MemberId, SessionId, TrackId};
use crate::media::{MediaSource, TrackKind};
use crate::negotiation::PeerPhase;
use crate::session::SessionFlags;

#[derive(Debug, Clone, Serialize)]
pub struct CallJoined {
    pub conversation_id: ConversationId,
    pub self_session_id: SessionId,
    pub sessions: Vec<SessionId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CallLeftReason {
    /// We left and told the server.
    Left,
    /// The server removed us or ended the call.
    Ended,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallLeft {
    pub conversation_id: ConversationId,
    pub reason: CallLeftReason,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParticipantJoined {
    pub session_id: SessionId,
    pub member_id: Option<MemberId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParticipantLeft {
    pub session_id: SessionId,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionFlagsChanged {
    pub session_id: SessionId,
    pub flags: SessionFlags,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerPhaseChanged {
    pub session_id: SessionId,
    pub phase: PeerPhase,
}

#[derive(Debug, Clone, Serialize)]
pub struct RemoteTrackAttached {
    pub session_id: SessionId,
    pub track_id: TrackId,
    pub kind: TrackKind,
}

#[derive(Debug, Clone, Serialize)]
pub struct TalkingChanged {
    pub talking: bool,
}

/// User-facing warnings. None of them are fatal outside call initiation.
#[derive(Debug, Clone, Serialize)]
pub enum CallWarning {
    /// Real-time media is unavailable; calls cannot start.
    Unsupported,
    /// A device could not be acquired.
    DeviceUnavailable { source: MediaSource, message: String },
    /// A held device stopped producing (revoked or ended by the OS).
    DeviceLost { source: MediaSource },
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingInvitations {
    pub conversation_id: ConversationId,
    pub members: Vec<MemberId>,
}
