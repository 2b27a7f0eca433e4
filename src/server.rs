//! Client-observable contract with the call server.
//!
//! The server assigns session ids, hands out relay descriptors, answers
//! liveness pings with the authoritative session set, relays control
//! messages between sessions and pushes roster events.

use async_trait::async_trait;
use meshcore::{BroadcastState, ConversationId, IceServer, MemberId, RemoteSession, SessionId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("request timed out")]
    Timeout,
    #[error("server rejected the request: {0}")]
    Rejected(String),
    #[error("server error: {0}")]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub conversation_id: ConversationId,
    /// Sessions we already know about, so the server can reconcile.
    pub known_session_ids: Vec<SessionId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinResponse {
    pub self_session_id: SessionId,
    #[serde(default)]
    pub ice_servers: Vec<IceServer>,
    #[serde(default)]
    pub sessions: Vec<RemoteSession>,
    #[serde(default)]
    pub invited_members: Vec<MemberId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveRequest {
    pub conversation_id: ConversationId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingRequest {
    pub conversation_id: ConversationId,
    pub self_session_id: SessionId,
    pub known_session_ids: Vec<SessionId>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingResponse {
    /// Sessions the server confirms as live.
    #[serde(default)]
    pub active: Vec<RemoteSession>,
    /// Sessions the server wants us to forget.
    #[serde(default)]
    pub dropped: Vec<SessionId>,
}

/// One relayed control message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerNotification {
    pub sender: SessionId,
    pub targets: Vec<SessionId>,
    /// Serialized [`meshcore::ControlMessage`].
    pub message: String,
}

/// A relayed control message as delivered to one of its targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundNotification {
    pub sender: SessionId,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStateUpdate {
    pub conversation_id: ConversationId,
    pub session_id: SessionId,
    pub state: BroadcastState,
}

/// Events the server pushes to us.
#[derive(Debug, Clone)]
pub enum ServerPush {
    ParticipantJoined {
        conversation_id: ConversationId,
        session: RemoteSession,
    },
    ParticipantLeft {
        conversation_id: ConversationId,
        session_id: SessionId,
    },
    /// Insert-or-update for a batch of sessions. Absent sessions are left
    /// alone; removal goes through `ParticipantLeft` or the liveness ping.
    SessionsUpdated {
        conversation_id: ConversationId,
        sessions: Vec<RemoteSession>,
    },
    /// The server ended a session. When it is ours, the call is over.
    SessionTerminated {
        conversation_id: ConversationId,
        session_id: SessionId,
    },
    CallEnded {
        conversation_id: ConversationId,
    },
    PeerNotifications(Vec<InboundNotification>),
}

#[async_trait]
pub trait CallServer: Send + Sync {
    async fn join_call(&self, request: JoinRequest) -> Result<JoinResponse, ServerError>;

    /// Best-effort: callers log failures and carry on tearing down.
    async fn leave_call(&self, request: LeaveRequest) -> Result<(), ServerError>;

    async fn ping(&self, request: PingRequest) -> Result<PingResponse, ServerError>;

    async fn notify_peers(&self, batch: Vec<PeerNotification>) -> Result<(), ServerError>;

    async fn update_session_state(&self, update: SessionStateUpdate) -> Result<(), ServerError>;
}
