//! Voice-activity detection, by amplitude threshold or push-to-talk.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VoiceMode {
    PushToTalk,
    #[default]
    Threshold,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceSettings {
    pub mode: VoiceMode,
    /// Normalised amplitude (0.0..=1.0) above which we count as talking.
    pub threshold: f32,
    /// How long broadcasting continues after the push-to-talk key is released.
    pub push_to_talk_delay: Duration,
    /// Input device to capture from; `None` means the system default.
    pub input_device: Option<String>,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            mode: VoiceMode::Threshold,
            threshold: 0.05,
            push_to_talk_delay: Duration::from_millis(200),
            input_device: None,
        }
    }
}

impl VoiceSettings {
    /// Whether switching from `self` to `other` requires tearing the monitor down.
    pub fn requires_restart(&self, other: &VoiceSettings) -> bool {
        self.mode != other.mode
            || self.threshold != other.threshold
            || self.input_device != other.input_device
    }
}

/// Talking/silent state machine. Inputs that would not change the talking
/// value yield `None`.
#[derive(Debug, Clone)]
pub struct VoiceActivityDetector {
    mode: VoiceMode,
    threshold: f32,
    min_silent_samples: u32,
    silent_run: u32,
    talking: bool,
    key_down: bool,
    release_token: u64,
}

impl VoiceActivityDetector {
    pub fn new(settings: &VoiceSettings, min_silent_samples: u32) -> Self {
        Self {
            mode: settings.mode,
            threshold: settings.threshold,
            min_silent_samples: min_silent_samples.max(1),
            silent_run: 0,
            talking: false,
            key_down: false,
            release_token: 0,
        }
    }

    pub fn mode(&self) -> VoiceMode {
        self.mode
    }

    pub fn is_talking(&self) -> bool {
        self.talking
    }

    /// Feed one amplitude sample (threshold mode only).
    pub fn sample(&mut self, level: f32) -> Option<bool> {
        if self.mode != VoiceMode::Threshold {
            return None;
        }
        if level >= self.threshold {
            self.silent_run = 0;
            return self.set_talking(true);
        }
        self.silent_run = self.silent_run.saturating_add(1);
        if self.silent_run >= self.min_silent_samples {
            return self.set_talking(false);
        }
        None
    }

    /// Push-to-talk key pressed. Cancels any pending release.
    pub fn key_down(&mut self) -> Option<bool> {
        if self.mode != VoiceMode::PushToTalk {
            return None;
        }
        self.key_down = true;
        self.release_token += 1;
        self.set_talking(true)
    }

    /// Push-to-talk key released. Returns the token the caller must hand
    /// back to [`Self::release_elapsed`] once the decay delay has passed.
    pub fn key_up(&mut self) -> Option<u64> {
        if self.mode != VoiceMode::PushToTalk || !self.key_down {
            return None;
        }
        self.key_down = false;
        self.release_token += 1;
        Some(self.release_token)
    }

    pub fn release_elapsed(&mut self, token: u64) -> Option<bool> {
        if token != self.release_token || self.key_down {
            return None;
        }
        self.set_talking(false)
    }

    fn set_talking(&mut self, talking: bool) -> Option<bool> {
        if self.talking == talking {
            return None;
        }
        self.talking = talking;
        Some(talking)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn threshold_detector() -> VoiceActivityDetector {
        VoiceActivityDetector::new(
            &VoiceSettings {
                threshold: 0.5,
                ..Default::default()
            },
            3,
        )
    }

    fn ptt_detector() -> VoiceActivityDetector {
        VoiceActivityDetector::new(
            &VoiceSettings {
                mode: VoiceMode::PushToTalk,
                ..Default::default()
            },
            1,
        )
    }

    #[test]
    fn threshold_mode_needs_a_silent_run_to_stop() {
        let mut vad = threshold_detector();
        assert_eq!(vad.sample(0.1), None);
        assert_eq!(vad.sample(0.7), Some(true));
        assert_eq!(vad.sample(0.9), None);
        assert_eq!(vad.sample(0.1), None);
        assert_eq!(vad.sample(0.1), None);
        assert_eq!(vad.sample(0.1), Some(false));
        assert_eq!(vad.sample(0.1), None);
    }

    #[test]
    fn loud_sample_resets_the_silent_run() {
        let mut vad = threshold_detector();
        vad.sample(0.9);
        vad.sample(0.1);
        vad.sample(0.1);
        vad.sample(0.9);
        vad.sample(0.1);
        vad.sample(0.1);
        assert!(vad.is_talking());
    }

    #[test]
    fn push_to_talk_release_waits_for_its_own_token() {
        let mut vad = ptt_detector();
        assert_eq!(vad.key_down(), Some(true));
        let stale = vad.key_up().unwrap();
        assert_eq!(vad.key_down(), None);
        let fresh = vad.key_up().unwrap();

        assert_eq!(vad.release_elapsed(stale), None);
        assert!(vad.is_talking());
        assert_eq!(vad.release_elapsed(fresh), Some(false));
    }

    #[test]
    fn modes_ignore_each_others_inputs() {
        let mut ptt = ptt_detector();
        assert_eq!(ptt.sample(1.0), None);
        let mut vad = threshold_detector();
        assert_eq!(vad.key_down(), None);
        assert_eq!(vad.key_up(), None);
    }

    #[test]
    fn restart_needed_only_for_monitor_inputs() {
        let base = VoiceSettings::default();
        let slower = VoiceSettings {
            push_to_talk_delay: Duration::from_secs(1),
            ..base.clone()
        };
        assert!(!base.requires_restart(&slower));
        let other_device = VoiceSettings {
            input_device: Some("usb-mic".into()),
            ..base.clone()
        };
        assert!(base.requires_restart(&other_device));
    }
}
