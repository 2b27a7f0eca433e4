//! Local capture devices and the tracks they produce.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use meshcore::{MediaSource, TrackId, TrackKind};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::calls::event::EngineEvent;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("permission denied for {0:?}")]
    PermissionDenied(MediaSource),
    #[error("{0:?} is unavailable")]
    Unavailable(MediaSource),
    #[error("device error: {0}")]
    Other(#[from] anyhow::Error),
}

pub trait LocalTrack: Send + Sync + fmt::Debug {
    fn id(&self) -> TrackId;
    fn kind(&self) -> TrackKind;
    fn set_enabled(&self, enabled: bool);
    fn is_enabled(&self) -> bool;
    /// Release the underlying device. Idempotent.
    fn stop(&self);
}

pub trait RemoteTrack: Send + Sync + fmt::Debug {
    fn id(&self) -> TrackId;
    fn kind(&self) -> TrackKind;
    fn set_enabled(&self, enabled: bool);
}

/// Reads the current input amplitude of a capture, normalised to 0.0..=1.0.
/// Meters tap the raw capture, so they keep reporting while the track
/// itself is disabled.
pub trait AudioLevelMeter: Send {
    fn level(&mut self) -> f32;
}

#[derive(Debug, Clone, Default)]
pub struct DeviceConstraints {
    pub device_id: Option<String>,
}

/// Reports that an acquired track ended outside our control. The token
/// identifies the acquisition so late notices for replaced tracks are
/// dropped.
#[derive(Clone)]
pub struct TrackEndedSink {
    source: MediaSource,
    token: u64,
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl TrackEndedSink {
    pub(crate) fn new(source: MediaSource, token: u64, tx: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self { source, token, tx }
    }

    pub fn notify(&self) {
        let _ = self.tx.send(EngineEvent::TrackEnded {
            source: self.source,
            token: self.token,
        });
    }
}

impl fmt::Debug for TrackEndedSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackEndedSink")
            .field("source", &self.source)
            .field("token", &self.token)
            .finish()
    }
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire(
        &self,
        source: MediaSource,
        constraints: DeviceConstraints,
        ended: TrackEndedSink,
    ) -> Result<Arc<dyn LocalTrack>, DeviceError>;

    fn level_meter(
        &self,
        track: &Arc<dyn LocalTrack>,
    ) -> Result<Box<dyn AudioLevelMeter>, DeviceError>;
}
