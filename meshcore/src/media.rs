//! Local media state: which tracks we hold and what we advertise.

use serde::{Deserialize, Serialize};

use crate::broadcast::BroadcastState;
use crate::ids::TrackId;
use crate::session::SessionFlags;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// A capturable local device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaSource {
    Microphone,
    Camera,
    Display,
}

impl MediaSource {
    pub fn kind(&self) -> TrackKind {
        match self {
            Self::Microphone => TrackKind::Audio,
            Self::Camera | Self::Display => TrackKind::Video,
        }
    }
}

/// The two mutually exclusive video sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VideoSource {
    Camera,
    Screen,
}

impl VideoSource {
    pub fn media_source(&self) -> MediaSource {
        match self {
            Self::Camera => MediaSource::Camera,
            Self::Screen => MediaSource::Display,
        }
    }
}

/// Effects of a local media mutation that the runtime must carry out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaChange {
    AudioAttached(TrackId),
    /// The track must be stopped and removed from every sender.
    AudioDetached(TrackId),
    VideoAttached { source: VideoSource, track: TrackId },
    VideoDetached { source: VideoSource, track: TrackId },
}

/// At most one audio track and one video track (camera XOR screen).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalMediaState {
    audio: Option<TrackId>,
    video: Option<(VideoSource, TrackId)>,
    is_self_muted: bool,
    is_deaf: bool,
    is_talking: bool,
}

impl LocalMediaState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn audio_track(&self) -> Option<&TrackId> {
        self.audio.as_ref()
    }

    pub fn video_track(&self) -> Option<&TrackId> {
        self.video.as_ref().map(|(_, track)| track)
    }

    pub fn video_source(&self) -> Option<VideoSource> {
        self.video.as_ref().map(|(source, _)| *source)
    }

    pub fn send_user_video(&self) -> bool {
        self.video_source() == Some(VideoSource::Camera)
    }

    pub fn send_display(&self) -> bool {
        self.video_source() == Some(VideoSource::Screen)
    }

    pub fn is_self_muted(&self) -> bool {
        self.is_self_muted
    }

    pub fn is_deaf(&self) -> bool {
        self.is_deaf
    }

    pub fn is_talking(&self) -> bool {
        self.is_talking
    }

    /// Whether the outgoing audio track should carry sound right now.
    pub fn audio_enabled(&self) -> bool {
        self.audio.is_some() && !self.is_self_muted && self.is_talking
    }

    pub fn set_audio(&mut self, track: TrackId) -> Vec<MediaChange> {
        let mut changes = self.clear_audio();
        changes.push(MediaChange::AudioAttached(track.clone()));
        self.audio = Some(track);
        changes
    }

    pub fn clear_audio(&mut self) -> Vec<MediaChange> {
        self.audio
            .take()
            .map(MediaChange::AudioDetached)
            .into_iter()
            .collect()
    }

    /// Activate a video source. Any previously held video track (the other
    /// source, or an older track of the same source) is detached first.
    pub fn set_video(&mut self, source: VideoSource, track: TrackId) -> Vec<MediaChange> {
        let mut changes = self.clear_video(None);
        changes.push(MediaChange::VideoAttached {
            source,
            track: track.clone(),
        });
        self.video = Some((source, track));
        changes
    }

    /// Deactivate video. With `Some(source)`, only that source is cleared.
    pub fn clear_video(&mut self, only: Option<VideoSource>) -> Vec<MediaChange> {
        let selected =
            matches!(&self.video, Some((source, _)) if only.is_none_or(|o| o == *source));
        if !selected {
            return Vec::new();
        }
        self.video
            .take()
            .map(|(source, track)| MediaChange::VideoDetached { source, track })
            .into_iter()
            .collect()
    }

    /// Clear every track and flag; returns the tracks to stop.
    pub fn reset(&mut self) -> Vec<MediaChange> {
        let mut changes = self.clear_audio();
        changes.extend(self.clear_video(None));
        self.is_self_muted = false;
        self.is_deaf = false;
        self.is_talking = false;
        changes
    }

    pub fn set_self_muted(&mut self, muted: bool) -> bool {
        std::mem::replace(&mut self.is_self_muted, muted) != muted
    }

    pub fn set_deaf(&mut self, deaf: bool) -> bool {
        std::mem::replace(&mut self.is_deaf, deaf) != deaf
    }

    /// Returns false when the value is unchanged, so callers can skip
    /// redundant broadcasts.
    pub fn set_talking(&mut self, talking: bool) -> bool {
        std::mem::replace(&mut self.is_talking, talking) != talking
    }

    pub fn flags(&self) -> SessionFlags {
        SessionFlags {
            is_camera_on: self.send_user_video(),
            is_screen_sharing_on: self.send_display(),
            is_self_muted: self.is_self_muted,
            is_deaf: self.is_deaf,
            is_talking: self.is_talking,
        }
    }

    pub fn broadcast_state(&self) -> BroadcastState {
        BroadcastState {
            is_self_muted: self.is_self_muted,
            is_deaf: self.is_deaf,
            is_camera_on: self.send_user_video(),
            is_screen_sharing_on: self.send_display(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn camera_and_screen_are_mutually_exclusive() {
        let mut media = LocalMediaState::new();
        media.set_video(VideoSource::Screen, TrackId::new("screen-1"));
        assert!(media.send_display());

        let changes = media.set_video(VideoSource::Camera, TrackId::new("cam-1"));
        assert_eq!(
            changes,
            vec![
                MediaChange::VideoDetached {
                    source: VideoSource::Screen,
                    track: TrackId::new("screen-1"),
                },
                MediaChange::VideoAttached {
                    source: VideoSource::Camera,
                    track: TrackId::new("cam-1"),
                },
            ]
        );
        assert!(media.send_user_video());
        assert!(!media.send_display());

        media.set_video(VideoSource::Screen, TrackId::new("screen-2"));
        assert!(media.send_display());
        assert!(!media.send_user_video());
    }

    #[test]
    fn clearing_the_inactive_source_is_a_no_op() {
        let mut media = LocalMediaState::new();
        media.set_video(VideoSource::Camera, TrackId::new("cam-1"));
        assert!(media.clear_video(Some(VideoSource::Screen)).is_empty());
        assert!(media.send_user_video());
        assert_eq!(media.clear_video(Some(VideoSource::Camera)).len(), 1);
        assert!(media.video_track().is_none());
    }

    #[test]
    fn replacing_audio_detaches_the_old_track() {
        let mut media = LocalMediaState::new();
        media.set_audio(TrackId::new("mic-1"));
        let changes = media.set_audio(TrackId::new("mic-2"));
        assert_eq!(changes[0], MediaChange::AudioDetached(TrackId::new("mic-1")));
        assert_eq!(media.audio_track(), Some(&TrackId::new("mic-2")));
    }

    #[test]
    fn audio_only_flows_when_talking_and_unmuted() {
        let mut media = LocalMediaState::new();
        media.set_audio(TrackId::new("mic-1"));
        assert!(!media.audio_enabled());
        assert!(media.set_talking(true));
        assert!(!media.set_talking(true));
        assert!(media.audio_enabled());
        media.set_self_muted(true);
        assert!(!media.audio_enabled());
    }

    #[test]
    fn reset_returns_every_held_track() {
        let mut media = LocalMediaState::new();
        media.set_audio(TrackId::new("mic-1"));
        media.set_video(VideoSource::Camera, TrackId::new("cam-1"));
        media.set_deaf(true);
        assert_eq!(media.reset().len(), 2);
        assert_eq!(media, LocalMediaState::new());
    }
}
