//! Inputs of the call engine's dispatch loop.

use meshcore::{ConversationId, MediaSource, SessionId, VoiceSettings};
use tokio::sync::oneshot;

use super::error::CallError;
use super::handle::{CallOptions, CallSnapshot, ToggleOutcome};
use super::media::PeerEvent;
use crate::server::{PingResponse, ServerError, ServerPush};

pub(crate) type Reply<T> = oneshot::Sender<T>;

/// Requests issued through [`super::CallHandle`].
#[derive(Debug)]
pub(crate) enum Command {
    Toggle {
        conversation_id: ConversationId,
        options: CallOptions,
        reply: Reply<Result<ToggleOutcome, CallError>>,
    },
    Join {
        conversation_id: ConversationId,
        options: CallOptions,
        reply: Reply<Result<SessionId, CallError>>,
    },
    Leave {
        reply: Reply<()>,
    },
    End {
        reply: Reply<()>,
    },
    SetMuted {
        muted: bool,
        reply: Reply<()>,
    },
    SetDeaf {
        deaf: bool,
        reply: Reply<()>,
    },
    SetSource {
        source: MediaSource,
        enabled: bool,
        reply: Reply<Result<(), CallError>>,
    },
    PushToTalk {
        pressed: bool,
    },
    SetVoiceSettings {
        settings: VoiceSettings,
        reply: Reply<Result<(), CallError>>,
    },
    Snapshot {
        reply: Reply<Option<CallSnapshot>>,
    },
    Shutdown,
}

/// Everything the dispatch loop reacts to. Timer and worker events carry
/// the epoch, generation or token they were armed for; the loop drops the
/// ones that no longer match.
#[derive(Debug)]
pub(crate) enum EngineEvent {
    Command(Command),
    Push(ServerPush),
    Peer {
        session_id: SessionId,
        generation: u64,
        event: PeerEvent,
    },
    RecoveryDue {
        session_id: SessionId,
        ticket: u64,
    },
    KeepaliveTick {
        epoch: u64,
    },
    PingCompleted {
        epoch: u64,
        result: Result<PingResponse, ServerError>,
    },
    TalkingChanged {
        generation: u64,
        talking: bool,
    },
    PushToTalkReleased {
        generation: u64,
        token: u64,
    },
    TrackEnded {
        source: MediaSource,
        token: u64,
    },
}
