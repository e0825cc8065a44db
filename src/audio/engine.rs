//! Adaptive audio engine: coherence in, sound out.
//!
//! The engine is the only thing that talks to the [`AudioSink`]. Each tick
//! it decides whether the incoming score can be trusted (the gate) and, if
//! so, eases its crossfade toward it. When the gate is closed the engine
//! holds every parameter exactly where it was, so a stalled headset does
//! not yank the mix around.

use std::time::Duration;

use log::{debug, info};
use serde::Serialize;

use crate::detector::Sensitivity;
use crate::error::AudioInitError;
use crate::ppg::PpgMetrics;
use crate::scorer::ExpressiveScores;

use super::output::AudioSink;
use super::synth::{BinauralPreset, MovementCue, SynthCommand};

#[derive(Debug, Clone)]
pub struct AudioEngineConfig {
    /// Data older than this closes the gate.
    pub stale_after: Duration,
    /// Contact quality below this closes the gate.
    pub contact_floor: f64,
    /// Crossfade time constant.
    pub crossfade_tau: Duration,
    /// Continuous in-coherence time before the reward layer fades in.
    pub reward_after: Duration,
    /// Heart rate modulates the swell only above this confidence.
    pub ppg_confidence_floor: f64,
    /// Swell rate without a usable heart rate.
    pub idle_swell_hz: f64,
    pub volume: f64,
}

impl Default for AudioEngineConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(2),
            contact_floor: 0.25,
            crossfade_tau: Duration::from_millis(1500),
            reward_after: Duration::from_secs(5),
            ppg_confidence_floor: 0.6,
            idle_swell_hz: 0.1,
            volume: 0.6,
        }
    }
}

/// Trust inputs for the gate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalQuality {
    pub is_connected: bool,
    /// Mean electrode contact, 0 … 1.
    pub contact_quality: f64,
    pub time_since_last_update: Duration,
}

/// Everything the engine consumes per tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoherenceUpdate {
    pub score: f64,
    pub signal_quality: SignalQuality,
    pub expressive: ExpressiveScores,
    pub ppg: PpgMetrics,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct AudioSessionMetrics {
    /// Time the engine itself judged as in coherence.
    pub total_coherence_audio_time_ms: f64,
    /// Time spent with the gate closed.
    pub held_time_ms: f64,
    pub rewards: u32,
    pub movement_cues: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineState {
    Locked,
    Ready,
    Running,
}

pub struct AdaptiveAudioEngine<S: AudioSink = Box<dyn AudioSink>> {
    sink: S,
    config: AudioEngineConfig,
    state: EngineState,
    sample_rate: Option<u32>,
    crossfade: f64,
    sensitivity: Sensitivity,
    entrainment: bool,
    preset: BinauralPreset,
    volume: f64,
    in_coherence_for: Duration,
    reward_on: bool,
    cue_index: usize,
    metrics: AudioSessionMetrics,
}

impl<S: AudioSink> AdaptiveAudioEngine<S> {
    pub fn new(sink: S, config: AudioEngineConfig) -> Self {
        let volume = config.volume.clamp(0.0, 1.0);
        Self {
            sink,
            config,
            state: EngineState::Locked,
            sample_rate: None,
            crossfade: 0.0,
            sensitivity: Sensitivity::default(),
            entrainment: false,
            preset: BinauralPreset::default(),
            volume,
            in_coherence_for: Duration::ZERO,
            reward_on: false,
            cue_index: 0,
            metrics: AudioSessionMetrics::default(),
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// Unlock the output. Safe to retry after `GestureRequired`.
    pub fn init(&mut self) -> Result<u32, AudioInitError> {
        if let Some(rate) = self.sample_rate {
            return Ok(rate);
        }
        let rate = self.sink.unlock()?;
        info!("audio engine ready at {rate} Hz");
        self.sample_rate = Some(rate);
        self.state = EngineState::Ready;
        self.push_settings();
        Ok(rate)
    }

    pub fn is_initialized(&self) -> bool {
        self.state != EngineState::Locked
    }

    pub fn is_running(&self) -> bool {
        self.state == EngineState::Running
    }

    pub fn start_session(&mut self) -> Result<(), AudioInitError> {
        match self.state {
            EngineState::Locked => return Err(AudioInitError::NotInitialized),
            EngineState::Running => return Ok(()),
            EngineState::Ready => {}
        }
        self.metrics = AudioSessionMetrics::default();
        self.crossfade = 0.0;
        self.in_coherence_for = Duration::ZERO;
        self.reward_on = false;
        self.sink.submit(SynthCommand::SetMix(0.0));
        self.sink.submit(SynthCommand::SetReward(0.0));
        self.sink.submit(SynthCommand::Start);
        self.state = EngineState::Running;
        info!("audio session started");
        Ok(())
    }

    /// Fades the mix out and returns the final metrics.
    pub fn stop_session(&mut self) -> AudioSessionMetrics {
        if self.state == EngineState::Running {
            self.sink.submit(SynthCommand::Stop);
            self.sink.submit(SynthCommand::SetReward(0.0));
            self.state = EngineState::Ready;
            self.reward_on = false;
            info!(
                "audio session stopped: {:.1} s in coherence",
                self.metrics.total_coherence_audio_time_ms / 1000.0
            );
        }
        self.metrics
    }

    /// One scoring tick. Returns `true` when the gate was open.
    pub fn update_coherence(&mut self, update: &CoherenceUpdate, dt: Duration) -> bool {
        if self.state != EngineState::Running {
            return false;
        }
        let dt_ms = dt.as_nanos() as f64 / 1_000_000.0;
        if !self.gate_open(update) {
            self.metrics.held_time_ms += dt_ms;
            return false;
        }

        let target = update.score.clamp(0.0, 1.0);
        let tau = self.config.crossfade_tau.as_secs_f64().max(1e-6);
        let step = 1.0 - (-dt.as_secs_f64() / tau).exp();
        self.crossfade += step * (target - self.crossfade);
        self.sink.submit(SynthCommand::SetMix(self.crossfade as f32));

        let ExpressiveScores { calm, creative_flow } = update.expressive;
        self.sink.submit(SynthCommand::SetColour {
            brightness: (0.3 + 0.7 * calm) as f32,
            density: creative_flow as f32,
        });
        self.sink.submit(SynthCommand::SetSwell(self.swell_rate(&update.ppg) as f32));

        if self.crossfade >= self.coherence_threshold() {
            self.metrics.total_coherence_audio_time_ms += dt_ms;
            self.in_coherence_for += dt;
        } else {
            self.in_coherence_for = Duration::ZERO;
        }

        let reward = self.in_coherence_for >= self.config.reward_after;
        if reward != self.reward_on {
            self.reward_on = reward;
            self.sink.submit(SynthCommand::SetReward(if reward { 1.0 } else { 0.0 }));
            if reward {
                self.metrics.rewards += 1;
                debug!("reward layer on");
            }
        }
        true
    }

    fn gate_open(&self, update: &CoherenceUpdate) -> bool {
        let q = &update.signal_quality;
        q.is_connected
            && q.time_since_last_update <= self.config.stale_after
            && q.contact_quality >= self.config.contact_floor
            && update.score.is_finite()
    }

    fn swell_rate(&self, ppg: &PpgMetrics) -> f64 {
        match ppg.bpm {
            Some(bpm) if ppg.confidence >= self.config.ppg_confidence_floor => bpm / 60.0 / 4.0,
            _ => self.config.idle_swell_hz,
        }
    }

    /// Crossfade position at or above which the engine counts time as
    /// coherent. Easier presets lower it.
    pub fn coherence_threshold(&self) -> f64 {
        0.7 - 0.15 * self.sensitivity.value()
    }

    /// Plays the next cue in rotation and returns it.
    pub fn play_movement_cue(&mut self) -> MovementCue {
        let cue = MovementCue::ROTATION[self.cue_index % MovementCue::ROTATION.len()];
        self.cue_index = self.cue_index.wrapping_add(1);
        if self.is_initialized() {
            self.sink.submit(SynthCommand::TriggerCue(cue));
        }
        if self.is_running() {
            self.metrics.movement_cues += 1;
        }
        cue
    }

    pub fn set_difficulty_preset(&mut self, sensitivity: Sensitivity) {
        self.sensitivity = sensitivity;
    }

    pub fn set_entrainment_enabled(&mut self, enabled: bool) {
        self.entrainment = enabled;
        self.push_entrainment();
    }

    pub fn set_binaural_preset(&mut self, preset: BinauralPreset) {
        self.preset = preset;
        self.push_entrainment();
    }

    pub fn set_volume(&mut self, volume: f64) {
        self.volume = if volume.is_finite() { volume.clamp(0.0, 1.0) } else { 0.0 };
        self.sink.submit(SynthCommand::SetVolume(self.volume as f32));
    }

    pub fn volume(&self) -> f64 {
        self.volume
    }

    pub fn crossfade_position(&self) -> f64 {
        self.crossfade
    }

    /// Running metrics without ending the session.
    pub fn coherence_metrics(&self) -> AudioSessionMetrics {
        self.metrics
    }

    fn push_entrainment(&mut self) {
        self.sink.submit(SynthCommand::SetEntrainment {
            enabled: self.entrainment,
            preset: self.preset,
        });
    }

    fn push_settings(&mut self) {
        self.sink.submit(SynthCommand::SetVolume(self.volume as f32));
        self.push_entrainment();
    }

    pub fn shutdown(&mut self) {
        self.stop_session();
        self.sink.shutdown();
        self.sample_rate = None;
        self.state = EngineState::Locked;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::output::OfflineSink;

    const TICK: Duration = Duration::from_millis(250);

    fn engine() -> AdaptiveAudioEngine<OfflineSink> {
        let mut e = AdaptiveAudioEngine::new(
            OfflineSink::new(8000).recording(),
            AudioEngineConfig::default(),
        );
        e.init().unwrap();
        e.start_session().unwrap();
        e
    }

    fn update(score: f64) -> CoherenceUpdate {
        CoherenceUpdate {
            score,
            signal_quality: SignalQuality {
                is_connected: true,
                contact_quality: 1.0,
                time_since_last_update: Duration::from_millis(100),
            },
            expressive: ExpressiveScores::default(),
            ppg: PpgMetrics::default(),
        }
    }

    #[test]
    fn start_requires_init() {
        let mut e = AdaptiveAudioEngine::new(
            OfflineSink::new(8000).recording().requiring_gesture(),
            AudioEngineConfig::default(),
        );
        assert_eq!(e.start_session(), Err(AudioInitError::NotInitialized));
        assert_eq!(e.init(), Err(AudioInitError::GestureRequired));
        e.sink_mut().grant_gesture();
        assert_eq!(e.init(), Ok(8000));
        assert!(e.start_session().is_ok());
    }

    #[test]
    fn crossfade_eases_toward_score() {
        let mut e = engine();
        assert!(e.update_coherence(&update(1.0), TICK));
        let first = e.crossfade_position();
        assert!(first > 0.0 && first < 0.5);
        for _ in 0..40 {
            e.update_coherence(&update(1.0), TICK);
        }
        assert!(e.crossfade_position() > 0.99);
    }

    #[test]
    fn disconnected_update_holds_crossfade() {
        let mut e = engine();
        for _ in 0..8 {
            e.update_coherence(&update(0.9), TICK);
        }
        let held = e.crossfade_position();
        e.sink_mut().clear_history();

        let mut off = update(0.0);
        off.signal_quality.is_connected = false;
        assert!(!e.update_coherence(&off, TICK));
        assert_eq!(e.crossfade_position(), held);
        assert!(e.sink().history().is_empty());

        let mut stale = update(0.0);
        stale.signal_quality.time_since_last_update = Duration::from_secs(3);
        assert!(!e.update_coherence(&stale, TICK));
        let mut loose = update(0.0);
        loose.signal_quality.contact_quality = 0.1;
        assert!(!e.update_coherence(&loose, TICK));
        assert_eq!(e.crossfade_position(), held);
        assert_eq!(e.coherence_metrics().held_time_ms, 750.0);
    }

    #[test]
    fn coherence_time_and_reward() {
        let mut e = engine();
        // Warm the crossfade above the 0.625 default threshold.
        while e.crossfade_position() < e.coherence_threshold() {
            e.update_coherence(&update(1.0), TICK);
        }
        let before = e.coherence_metrics().total_coherence_audio_time_ms;
        assert_eq!(before, 250.0);
        for _ in 0..19 {
            e.update_coherence(&update(1.0), TICK);
        }
        assert_eq!(e.coherence_metrics().total_coherence_audio_time_ms, 5000.0);
        assert_eq!(e.coherence_metrics().rewards, 1);
        assert!(e.sink().history().contains(&SynthCommand::SetReward(1.0)));

        let metrics = e.stop_session();
        assert_eq!(metrics.total_coherence_audio_time_ms, 5000.0);
        assert!(!e.update_coherence(&update(1.0), TICK));
    }

    #[test]
    fn metrics_reset_on_new_session() {
        let mut e = engine();
        for _ in 0..30 {
            e.update_coherence(&update(1.0), TICK);
        }
        e.stop_session();
        e.start_session().unwrap();
        assert_eq!(e.coherence_metrics(), AudioSessionMetrics::default());
        assert_eq!(e.crossfade_position(), 0.0);
    }

    #[test]
    fn heart_rate_sets_swell_only_when_confident() {
        let mut e = engine();
        let mut u = update(0.5);
        u.ppg = PpgMetrics { bpm: Some(72.0), confidence: 0.9, last_beat_ms: None };
        e.update_coherence(&u, TICK);
        assert!(e.sink().history().contains(&SynthCommand::SetSwell(0.3)));

        e.sink_mut().clear_history();
        u.ppg.confidence = 0.55;
        e.update_coherence(&u, TICK);
        assert!(e.sink().history().contains(&SynthCommand::SetSwell(0.1)));
    }

    #[test]
    fn cues_rotate() {
        let mut e = engine();
        let cues: Vec<_> = (0..4).map(|_| e.play_movement_cue()).collect();
        assert_eq!(
            cues,
            vec![MovementCue::Chime, MovementCue::Bell, MovementCue::Breath, MovementCue::Chime]
        );
        assert_eq!(e.coherence_metrics().movement_cues, 4);
    }

    #[test]
    fn setters() {
        let mut e = engine();
        e.set_volume(3.0);
        assert_eq!(e.volume(), 1.0);
        e.set_difficulty_preset(Sensitivity::clamped(1.0));
        assert!((e.coherence_threshold() - 0.55).abs() < 1e-12);
        e.set_binaural_preset(BinauralPreset::Theta);
        e.set_entrainment_enabled(true);
        assert_eq!(
            e.sink().history().last(),
            Some(&SynthCommand::SetEntrainment { enabled: true, preset: BinauralPreset::Theta })
        );
    }
}
