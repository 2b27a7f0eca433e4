use std::time::Duration;

use crate::calls::media::SideChannelConfig;

/// Timing and tuning knobs for the call engine.
#[derive(Clone, Debug)]
pub struct CallConfig {
    /// Interval between liveness pings while in a call.
    pub ping_interval: Duration,
    /// Window during which relay messages are collected into one batch.
    pub relay_debounce: Duration,
    /// Base delay before a failed relay batch is retried.
    pub relay_retry_delay: Duration,
    /// Window during which device-state changes are coalesced before the
    /// server is told about them.
    pub broadcast_debounce: Duration,
    /// Delay before recovering a connection that failed mid-call.
    pub recovery_delay: Duration,
    /// Delay before recovering a connection whose answer was never
    /// acknowledged.
    pub initial_connect_timeout: Duration,
    /// Grace period after an ICE candidate error.
    pub candidate_error_delay: Duration,
    /// A connection that has not connected within this window is restarted
    /// on the next ping, whichever side initiated it.
    pub max_unconnected: Duration,
    /// Sampling period of the threshold voice-activity monitor.
    pub voice_sample_interval: Duration,
    /// Consecutive quiet samples before a talker counts as silent.
    pub voice_min_silent_samples: u32,
    pub side_channel: SideChannelConfig,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            relay_debounce: Duration::from_millis(10),
            relay_retry_delay: Duration::from_secs(1),
            broadcast_debounce: Duration::from_secs(3),
            recovery_delay: Duration::from_secs(1),
            initial_connect_timeout: Duration::from_secs(15),
            candidate_error_delay: Duration::from_secs(15),
            max_unconnected: Duration::from_secs(60),
            voice_sample_interval: Duration::from_millis(50),
            voice_min_silent_samples: 10,
            side_channel: SideChannelConfig::default(),
        }
    }
}
