//! Device state other clients learn about through the server.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastState {
    pub is_self_muted: bool,
    pub is_deaf: bool,
    pub is_camera_on: bool,
    pub is_screen_sharing_on: bool,
}

/// Remembers the last state the server acknowledged so unchanged states
/// are not re-sent.
#[derive(Debug, Default)]
pub struct BroadcastTracker {
    acknowledged: Option<BroadcastState>,
}

impl BroadcastTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn needs_send(&self, state: &BroadcastState) -> bool {
        self.acknowledged.as_ref() != Some(state)
    }

    pub fn acknowledge(&mut self, state: BroadcastState) {
        self.acknowledged = Some(state);
    }

    pub fn reset(&mut self) {
        self.acknowledged = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_changed_states_need_sending() {
        let mut tracker = BroadcastTracker::new();
        let muted = BroadcastState {
            is_self_muted: true,
            ..Default::default()
        };
        assert!(tracker.needs_send(&muted));
        tracker.acknowledge(muted);
        assert!(!tracker.needs_send(&muted));
        assert!(tracker.needs_send(&BroadcastState::default()));
        tracker.reset();
        assert!(tracker.needs_send(&muted));
    }
}
