//! Mesh call engine.
//!
//! Every participant of a call holds one direct connection to every other
//! participant. This module keeps that mesh in step with the server's
//! roster, negotiates each connection through the server relay, restarts
//! connections that fail and arbitrates the local capture devices.
//!
//! # Architecture
//!
//! - [`CallHandle`]: public API; every call is a message to the engine task
//! - `CallEngine`: the single dispatch loop owning [`meshcore::CallState`]
//! - `PeerLifecycle`: one [`PeerConnection`] and its negotiation state
//! - `RelayQueue`: batched, single-flight relay of control messages
//! - `RecoverySupervisor`: one recovery timer per remote session
//! - `BroadcastNotifier`: debounced device-state updates to the server
//! - `MediaTrackManager` and `VoiceActivityMonitor`: local media

mod broadcast;
mod error;
mod event;
mod handle;
mod manager;
pub mod media;
mod peer;
mod recovery;
mod signaling;

pub use error::CallError;
pub use handle::{CallHandle, CallOptions, CallSnapshot, ToggleOutcome};
pub use media::{
    AudioLevelMeter, DeviceConstraints, DeviceError, LocalTrack, MediaDevices, PeerConfig,
    PeerConnection, PeerConnectionFactory, PeerEvent, PeerEventSink, RemoteTrack,
    SideChannelConfig, TrackEndedSink, TransportError,
};

pub(crate) use event::EngineEvent;
pub(crate) use manager::CallEngine;
