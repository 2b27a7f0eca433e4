//! Platform-agnostic core of the mesh call engine.
//!
//! Everything in this crate is synchronous and free of I/O: identifiers,
//! roster bookkeeping, the per-peer negotiation state machine, local media
//! state, voice-activity detection and the control-message wire format.
//! The runtime crate drives these types from its dispatch loop.

pub mod broadcast;
pub mod context;
pub mod events;
pub mod ids;
pub mod media;
pub mod message;
pub mod negotiation;
pub mod session;
pub mod voice;

pub use broadcast::{BroadcastState, BroadcastTracker};
pub use context::{CallContext, CallState, IceServer, RosterDiff, SessionUpsert, StateError};
pub use ids::{ConversationId, MemberId, SessionId, TrackId};
pub use media::{LocalMediaState, MediaChange, MediaSource, TrackKind, VideoSource};
pub use message::{
    ControlEvent, ControlMessage, IceCandidate, SdpKind, SessionDescription, TrackChange,
    WireError,
};
pub use negotiation::{
    AnswerDecision, IceConnectionState, InvalidTransition, Negotiation, NegotiationState,
    OfferDecision, PeerConnectionState, PeerPhase, PeerTransition, SignalingState,
    answer_decision, candidate_accepted, offer_decision,
};
pub use session::{RemoteSession, SessionFlags};
pub use voice::{VoiceActivityDetector, VoiceMode, VoiceSettings};
