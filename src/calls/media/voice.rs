//! Drives a [`VoiceActivityDetector`] from real inputs.
//!
//! Threshold mode runs a sampling task over the microphone's level meter.
//! Push-to-talk keeps the detector here and arms a release timer on key-up.
//! Both report through the engine queue tagged with a generation that
//! changes on every restart, so results from a torn-down monitor are
//! ignored.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use meshcore::{VoiceActivityDetector, VoiceMode, VoiceSettings};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::devices::{AudioLevelMeter, DeviceError, LocalTrack, MediaDevices};
use crate::calls::event::EngineEvent;

pub(crate) struct VoiceActivityMonitor {
    tx: mpsc::UnboundedSender<EngineEvent>,
    sample_interval: Duration,
    min_silent_samples: u32,
    generation: u64,
    running: bool,
    sampler: Option<JoinHandle<()>>,
    push_to_talk: Option<VoiceActivityDetector>,
    release_delay: Duration,
    release_timer: Option<JoinHandle<()>>,
}

impl VoiceActivityMonitor {
    pub(crate) fn new(
        tx: mpsc::UnboundedSender<EngineEvent>,
        sample_interval: Duration,
        min_silent_samples: u32,
    ) -> Self {
        Self {
            tx,
            sample_interval,
            min_silent_samples,
            generation: 0,
            running: false,
            sampler: None,
            push_to_talk: None,
            release_delay: Duration::ZERO,
            release_timer: None,
        }
    }

    /// (Re)start monitoring `track`. Any previous monitor is torn down first.
    pub(crate) fn start(
        &mut self,
        settings: &VoiceSettings,
        track: &Arc<dyn LocalTrack>,
        devices: &dyn MediaDevices,
    ) -> Result<(), DeviceError> {
        self.stop();
        let generation = self.generation;

        match settings.mode {
            VoiceMode::Threshold => {
                let meter = devices.level_meter(track)?;
                let detector = VoiceActivityDetector::new(settings, self.min_silent_samples);
                self.sampler = Some(tokio::spawn(Self::sample_loop(
                    meter,
                    detector,
                    self.sample_interval,
                    generation,
                    self.tx.clone(),
                )));
            }
            VoiceMode::PushToTalk => {
                self.push_to_talk = Some(VoiceActivityDetector::new(settings, self.min_silent_samples));
                self.release_delay = settings.push_to_talk_delay;
            }
        }
        self.running = true;
        info!(target: "Call/Voice", "Voice activity monitor started ({:?}, generation {generation})", settings.mode);
        Ok(())
    }

    pub(crate) fn stop(&mut self) {
        if let Some(sampler) = self.sampler.take() {
            sampler.abort();
        }
        if let Some(timer) = self.release_timer.take() {
            timer.abort();
        }
        self.push_to_talk = None;
        if self.running {
            debug!(target: "Call/Voice", "Voice activity monitor stopped (generation {})", self.generation);
        }
        self.running = false;
        self.generation += 1;
    }

    pub(crate) fn set_release_delay(&mut self, delay: Duration) {
        self.release_delay = delay;
    }

    pub(crate) fn accepts(&self, generation: u64) -> bool {
        self.running && generation == self.generation
    }

    /// Returns the new talking value, if it changed.
    pub(crate) fn key_down(&mut self) -> Option<bool> {
        if let Some(timer) = self.release_timer.take() {
            timer.abort();
        }
        self.push_to_talk.as_mut()?.key_down()
    }

    /// Schedules the decayed release; talking stays on until it elapses.
    pub(crate) fn key_up(&mut self) {
        let Some(token) = self.push_to_talk.as_mut().and_then(|d| d.key_up()) else {
            return;
        };
        let generation = self.generation;
        let delay = self.release_delay;
        let tx = self.tx.clone();
        if let Some(timer) = self.release_timer.replace(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(EngineEvent::PushToTalkReleased { generation, token });
        })) {
            timer.abort();
        }
    }

    pub(crate) fn release_elapsed(&mut self, generation: u64, token: u64) -> Option<bool> {
        if !self.accepts(generation) {
            return None;
        }
        self.release_timer = None;
        self.push_to_talk.as_mut()?.release_elapsed(token)
    }

    async fn sample_loop(
        mut meter: Box<dyn AudioLevelMeter>,
        mut detector: VoiceActivityDetector,
        period: Duration,
        generation: u64,
        tx: mpsc::UnboundedSender<EngineEvent>,
    ) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Some(talking) = detector.sample(meter.level())
                && tx
                    .send(EngineEvent::TalkingChanged {
                        generation,
                        talking,
                    })
                    .is_err()
            {
                return;
            }
        }
    }
}

impl Drop for VoiceActivityMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
