//! Local capture, voice activity and the peer-to-peer media transport.
//!
//! - [`MediaDevices`], [`LocalTrack`], [`RemoteTrack`]: capture devices and tracks
//! - [`PeerConnection`], [`PeerConnectionFactory`]: the opaque transport
//! - `MediaTrackManager`: owns the local tracks and [`meshcore::LocalMediaState`]
//! - `VoiceActivityMonitor`: threshold sampling and push-to-talk timing

mod devices;
pub(crate) mod tracks;
mod transport;
pub(crate) mod voice;

pub use devices::{
    AudioLevelMeter, DeviceConstraints, DeviceError, LocalTrack, MediaDevices, RemoteTrack,
    TrackEndedSink,
};
pub use transport::{
    PeerConfig, PeerConnection, PeerConnectionFactory, PeerEvent, PeerEventSink,
    SideChannelConfig, TransportError,
};
