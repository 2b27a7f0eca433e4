//! The opaque point-to-point media transport.
//!
//! A [`PeerConnection`] is whatever negotiates and carries media with one
//! remote session (a WebRTC peer connection in practice). The engine only
//! drives it through offer/answer/candidate exchange, sender-track updates
//! and a small side channel; everything the connection observes comes back
//! as [`PeerEvent`]s through a [`PeerEventSink`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use meshcore::{
    IceCandidate, IceConnectionState, IceServer, PeerConnectionState, SessionDescription,
    SessionId, SignalingState, TrackKind,
};
use thiserror::Error;
use tokio::sync::mpsc;

use super::devices::{LocalTrack, RemoteTrack};
use crate::calls::event::EngineEvent;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("real-time media is not supported in this environment")]
    Unsupported,
    #[error("connection is closed")]
    Closed,
    #[error("side channel is not open")]
    SideChannelClosed,
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("transport error: {0}")]
    Other(#[from] anyhow::Error),
}

/// The side channel is pre-negotiated: both ends open it with the same
/// label and stream id, so no extra round trip is needed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SideChannelConfig {
    pub label: String,
    pub id: u16,
}

impl Default for SideChannelConfig {
    fn default() -> Self {
        Self {
            label: "notifications".to_string(),
            id: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub ice_servers: Vec<IceServer>,
    pub side_channel: SideChannelConfig,
}

/// Everything a connection reports back to the engine.
pub enum PeerEvent {
    /// A local candidate was gathered and must reach the remote peer.
    LocalCandidate(IceCandidate),
    /// The negotiation surface changed (a sender track was added or removed).
    NegotiationNeeded,
    IceStateChanged(IceConnectionState),
    ConnectionStateChanged(PeerConnectionState),
    IceCandidateError { code: u16, text: String },
    RemoteTrack(Arc<dyn RemoteTrack>),
    SideChannelOpen,
    SideChannelMessage(String),
}

impl fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(c).finish(),
            Self::NegotiationNeeded => f.write_str("NegotiationNeeded"),
            Self::IceStateChanged(s) => f.debug_tuple("IceStateChanged").field(s).finish(),
            Self::ConnectionStateChanged(s) => {
                f.debug_tuple("ConnectionStateChanged").field(s).finish()
            }
            Self::IceCandidateError { code, text } => f
                .debug_struct("IceCandidateError")
                .field("code", code)
                .field("text", text)
                .finish(),
            Self::RemoteTrack(t) => f.debug_tuple("RemoteTrack").field(&t.id()).finish(),
            Self::SideChannelOpen => f.write_str("SideChannelOpen"),
            Self::SideChannelMessage(m) => f.debug_tuple("SideChannelMessage").field(m).finish(),
        }
    }
}

/// Delivers events from one connection generation into the engine queue.
/// Events emitted after the engine has replaced or closed the connection
/// are discarded by the generation check on the receiving side.
#[derive(Clone)]
pub struct PeerEventSink {
    session_id: SessionId,
    generation: u64,
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl PeerEventSink {
    pub(crate) fn new(
        session_id: SessionId,
        generation: u64,
        tx: mpsc::UnboundedSender<EngineEvent>,
    ) -> Self {
        Self {
            session_id,
            generation,
            tx,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn emit(&self, event: PeerEvent) {
        let _ = self.tx.send(EngineEvent::Peer {
            session_id: self.session_id,
            generation: self.generation,
            event,
        });
    }
}

impl fmt::Debug for PeerEventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerEventSink")
            .field("session_id", &self.session_id)
            .field("generation", &self.generation)
            .finish()
    }
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;

    /// Applying a remote offer while a local offer is pending rolls the
    /// local offer back.
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// Send `track` for `kind`, creating the transceiver on first use.
    /// `None` keeps the transceiver but stops sending.
    async fn set_sender_track(
        &self,
        kind: TrackKind,
        track: Option<Arc<dyn LocalTrack>>,
    ) -> Result<(), TransportError>;

    fn signaling_state(&self) -> SignalingState;

    fn ice_connection_state(&self) -> IceConnectionState;

    fn connection_state(&self) -> PeerConnectionState;

    fn side_channel_open(&self) -> bool;

    fn send_side_channel(&self, text: &str) -> Result<(), TransportError>;

    /// Close the connection and its side channel. Idempotent.
    async fn close(&self);
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    /// False when the environment lacks real-time media support.
    fn is_supported(&self) -> bool {
        true
    }

    async fn create(
        &self,
        config: PeerConfig,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, TransportError>;
}
