//! Local track ownership.
//!
//! Holds the acquired tracks next to [`LocalMediaState`] so the two never
//! disagree. Every acquisition stops the previously held track of the same
//! kind before asking for a new one, and activating one video source always
//! releases the other.

use std::sync::Arc;

use log::{debug, info, warn};
use meshcore::{LocalMediaState, MediaChange, MediaSource, TrackKind, VideoSource};
use tokio::sync::mpsc;

use super::devices::{DeviceConstraints, DeviceError, LocalTrack, MediaDevices, TrackEndedSink};
use crate::calls::event::EngineEvent;

struct HeldTrack {
    track: Arc<dyn LocalTrack>,
    token: u64,
}

/// What a track-ended notice changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TrackLoss {
    /// The microphone went away; we are now muted without audio.
    Audio,
    Video(VideoSource),
}

pub(crate) struct MediaTrackManager {
    devices: Arc<dyn MediaDevices>,
    tx: mpsc::UnboundedSender<EngineEvent>,
    state: LocalMediaState,
    audio: Option<HeldTrack>,
    video: Option<HeldTrack>,
    next_token: u64,
}

impl MediaTrackManager {
    pub(crate) fn new(devices: Arc<dyn MediaDevices>, tx: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self {
            devices,
            tx,
            state: LocalMediaState::new(),
            audio: None,
            video: None,
            next_token: 0,
        }
    }

    pub(crate) fn state(&self) -> &LocalMediaState {
        &self.state
    }

    pub(crate) fn devices(&self) -> &Arc<dyn MediaDevices> {
        &self.devices
    }

    pub(crate) fn audio_track(&self) -> Option<Arc<dyn LocalTrack>> {
        self.audio.as_ref().map(|held| held.track.clone())
    }

    pub(crate) fn video_track(&self) -> Option<Arc<dyn LocalTrack>> {
        self.video.as_ref().map(|held| held.track.clone())
    }

    pub(crate) fn track_for(&self, kind: TrackKind) -> Option<Arc<dyn LocalTrack>> {
        match kind {
            TrackKind::Audio => self.audio_track(),
            TrackKind::Video => self.video_track(),
        }
    }

    pub(crate) async fn enable_microphone(&mut self, device_id: Option<String>) -> Result<(), DeviceError> {
        let changes = self.state.clear_audio();
        self.release(changes);
        let track = self
            .acquire(MediaSource::Microphone, DeviceConstraints { device_id })
            .await?;
        let changes = self.state.set_audio(track.track.id());
        self.audio = Some(track);
        self.log_changes(&changes);
        self.apply_audio_gate();
        Ok(())
    }

    pub(crate) fn disable_microphone(&mut self) -> bool {
        let changes = self.state.clear_audio();
        self.release(changes)
    }

    /// Activate `source`, deactivating whichever video source is live.
    /// On failure no video is sent.
    pub(crate) async fn enable_video(&mut self, source: VideoSource) -> Result<(), DeviceError> {
        let changes = self.state.clear_video(None);
        self.release(changes);
        let track = self
            .acquire(source.media_source(), DeviceConstraints::default())
            .await?;
        let changes = self.state.set_video(source, track.track.id());
        self.video = Some(track);
        self.log_changes(&changes);
        Ok(())
    }

    /// Stop video. With `Some(source)`, only if that source is the live one.
    pub(crate) fn disable_video(&mut self, only: Option<VideoSource>) -> bool {
        let changes = self.state.clear_video(only);
        self.release(changes)
    }

    pub(crate) fn set_muted(&mut self, muted: bool) -> bool {
        let changed = self.state.set_self_muted(muted);
        self.apply_audio_gate();
        changed
    }

    pub(crate) fn set_deaf(&mut self, deaf: bool) -> bool {
        self.state.set_deaf(deaf)
    }

    pub(crate) fn set_talking(&mut self, talking: bool) -> bool {
        let changed = self.state.set_talking(talking);
        self.apply_audio_gate();
        changed
    }

    /// A held track ended on its own. Stale notices (for tracks we already
    /// replaced) are ignored.
    pub(crate) fn handle_track_ended(&mut self, source: MediaSource, token: u64) -> Option<TrackLoss> {
        match source.kind() {
            TrackKind::Audio => {
                if self.audio.as_ref().is_none_or(|held| held.token != token) {
                    return None;
                }
                warn!(target: "Call/Media", "Microphone track ended, falling back to muted");
                let changes = self.state.clear_audio();
                self.release(changes);
                self.state.set_self_muted(true);
                Some(TrackLoss::Audio)
            }
            TrackKind::Video => {
                if self.video.as_ref().is_none_or(|held| held.token != token) {
                    return None;
                }
                let video_source = self.state.video_source()?;
                warn!(target: "Call/Media", "{video_source:?} track ended, stopping video");
                let changes = self.state.clear_video(None);
                self.release(changes);
                Some(TrackLoss::Video(video_source))
            }
        }
    }

    /// Release every device and reset all local flags.
    pub(crate) fn stop_all(&mut self) {
        let changes = self.state.reset();
        self.release(changes);
    }

    async fn acquire(
        &mut self,
        source: MediaSource,
        constraints: DeviceConstraints,
    ) -> Result<HeldTrack, DeviceError> {
        self.next_token += 1;
        let token = self.next_token;
        let ended = TrackEndedSink::new(source, token, self.tx.clone());
        let track = self.devices.acquire(source, constraints, ended).await?;
        info!(target: "Call/Media", "Acquired {source:?} track {}", track.id());
        Ok(HeldTrack { track, token })
    }

    /// Stop the tracks `changes` detached. Returns whether anything was.
    fn release(&mut self, changes: Vec<MediaChange>) -> bool {
        let mut released = false;
        for change in changes {
            let held = match change {
                MediaChange::AudioDetached(_) => self.audio.take(),
                MediaChange::VideoDetached { .. } => self.video.take(),
                MediaChange::AudioAttached(_) | MediaChange::VideoAttached { .. } => None,
            };
            if let Some(held) = held {
                debug!(target: "Call/Media", "Stopping track {}", held.track.id());
                held.track.stop();
                released = true;
            }
        }
        released
    }

    fn log_changes(&self, changes: &[MediaChange]) {
        for change in changes {
            debug!(target: "Call/Media", "{change:?}");
        }
    }

    fn apply_audio_gate(&self) {
        if let Some(held) = &self.audio {
            held.track.set_enabled(self.state.audio_enabled());
        }
    }
}
