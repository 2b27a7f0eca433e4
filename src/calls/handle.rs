//! Public entry point to the call engine.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use log::debug;
use meshcore::{
    ConversationId, LocalMediaState, MediaSource, PeerPhase, RemoteSession, SessionId,
    VideoSource, VoiceSettings,
};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use super::error::CallError;
use super::event::{Command, EngineEvent, Reply};
use super::manager::CallEngine;
use super::media::{MediaDevices, PeerConnectionFactory};
use crate::config::CallConfig;
use crate::server::{CallServer, ServerPush};
use crate::types::events::EventBus;

/// Options for joining a call.
#[derive(Debug, Clone)]
pub struct CallOptions {
    pub start_with_audio: bool,
    pub start_with_video: bool,
    /// Which video source `start_with_video` turns on.
    pub video_type: VideoSource,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            start_with_audio: true,
            start_with_video: false,
            video_type: VideoSource::Camera,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleOutcome {
    Joined(SessionId),
    Left,
    /// Another toggle was still in progress; nothing was done.
    Busy,
}

/// Point-in-time view of the active call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSnapshot {
    pub conversation_id: ConversationId,
    pub self_session_id: SessionId,
    pub started_at: DateTime<Utc>,
    pub sessions: Vec<RemoteSession>,
    pub peers: BTreeMap<SessionId, PeerPhase>,
    pub outgoing: Vec<SessionId>,
    pub pending_recoveries: Vec<SessionId>,
    pub media: LocalMediaState,
    pub queued_relay_messages: usize,
}

/// Cheap to clone; every clone drives the same engine.
#[derive(Clone)]
pub struct CallHandle {
    tx: mpsc::UnboundedSender<EngineEvent>,
    events: Arc<EventBus>,
    is_toggling: Arc<AtomicBool>,
}

impl CallHandle {
    /// Start the engine on the current tokio runtime.
    pub fn spawn(
        config: CallConfig,
        server: Arc<dyn CallServer>,
        factory: Arc<dyn PeerConnectionFactory>,
        devices: Arc<dyn MediaDevices>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let events = Arc::new(EventBus::new());
        let engine = CallEngine::new(config, server, factory, devices, events.clone(), tx.clone());
        tokio::spawn(engine.run(rx));
        Self {
            tx,
            events,
            is_toggling: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Join `conversation_id`, or leave it if that is the current call.
    /// Switching conversations leaves the current call first. While a
    /// toggle is in progress, further toggles return
    /// [`ToggleOutcome::Busy`].
    pub async fn toggle_call(
        &self,
        conversation_id: ConversationId,
        options: CallOptions,
    ) -> Result<ToggleOutcome, CallError> {
        if self.is_toggling.swap(true, Ordering::SeqCst) {
            debug!(target: "Call/Session", "Toggle already in progress, ignoring");
            return Ok(ToggleOutcome::Busy);
        }

        let _guard = scopeguard::guard((), |_| {
            self.is_toggling.store(false, Ordering::Relaxed);
        });

        self.request(|reply| Command::Toggle {
            conversation_id,
            options,
            reply,
        })
        .await?
    }

    pub async fn join_call(
        &self,
        conversation_id: ConversationId,
        options: CallOptions,
    ) -> Result<SessionId, CallError> {
        self.request(|reply| Command::Join {
            conversation_id,
            options,
            reply,
        })
        .await?
    }

    /// Leave the active call. A no-op outside a call.
    pub async fn leave_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Leave { reply }).await
    }

    /// Tear the call down locally without telling the server.
    pub async fn end_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::End { reply }).await
    }

    /// Feed a server push into the engine.
    pub fn handle_push(&self, push: ServerPush) -> Result<(), CallError> {
        self.tx
            .send(EngineEvent::Push(push))
            .map_err(|_| CallError::EngineClosed)
    }

    pub async fn set_muted(&self, muted: bool) -> Result<(), CallError> {
        self.request(|reply| Command::SetMuted { muted, reply }).await
    }

    pub async fn set_deaf(&self, deaf: bool) -> Result<(), CallError> {
        self.request(|reply| Command::SetDeaf { deaf, reply }).await
    }

    pub async fn set_microphone(&self, enabled: bool) -> Result<(), CallError> {
        self.set_source(MediaSource::Microphone, enabled).await
    }

    /// Turning the camera on turns screen sharing off.
    pub async fn set_camera(&self, enabled: bool) -> Result<(), CallError> {
        self.set_source(MediaSource::Camera, enabled).await
    }

    /// Turning screen sharing on turns the camera off.
    pub async fn set_screen_share(&self, enabled: bool) -> Result<(), CallError> {
        self.set_source(MediaSource::Display, enabled).await
    }

    pub fn set_push_to_talk(&self, pressed: bool) -> Result<(), CallError> {
        self.tx
            .send(EngineEvent::Command(Command::PushToTalk { pressed }))
            .map_err(|_| CallError::EngineClosed)
    }

    pub async fn set_voice_settings(&self, settings: VoiceSettings) -> Result<(), CallError> {
        self.request(|reply| Command::SetVoiceSettings { settings, reply })
            .await?
    }

    /// `None` outside a call.
    pub async fn snapshot(&self) -> Result<Option<CallSnapshot>, CallError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Leave any active call and stop the engine.
    pub fn shutdown(&self) {
        let _ = self.tx.send(EngineEvent::Command(Command::Shutdown));
    }

    async fn set_source(&self, source: MediaSource, enabled: bool) -> Result<(), CallError> {
        self.request(|reply| Command::SetSource {
            source,
            enabled,
            reply,
        })
        .await?
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T, CallError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineEvent::Command(build(reply)))
            .map_err(|_| CallError::EngineClosed)?;
        rx.await.map_err(|_| CallError::EngineClosed)
    }
}
