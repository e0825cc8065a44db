//! Coherence tick: snapshot in, detector verdict, score and audio update out.
//!
//! The binary polls at frame rate; [`CoherencePipeline::poll`] only runs a
//! tick once `tick_interval` has passed since the previous one. Within a tick
//! the order is fixed: detector, then scorer, then the [`CoherenceUpdate`]
//! that the audio engine consumes in the same loop iteration.

use std::time::{Duration, Instant};

use log::debug;
use serde::Serialize;

use crate::audio::{CoherenceUpdate, SignalQuality};
use crate::detector::{CoherenceDetector, CoherenceDetectorConfig, CoherenceStatus, Sensitivity};
use crate::health::ConnectionHealthState;
use crate::scorer::{calculate_coherence, coherence_zone, expressive_scores, CoherenceZone};
use crate::telemetry::TelemetrySnapshot;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub tick_interval: Duration,
    pub sensitivity: Sensitivity,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(250),
            sensitivity: Sensitivity::default(),
        }
    }
}

/// Result of one tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TickOutput {
    pub status: CoherenceStatus,
    pub score: f64,
    pub zone: CoherenceZone,
    pub health: ConnectionHealthState,
    pub contact_quality: f64,
    #[serde(skip)]
    pub audio: CoherenceUpdate,
    #[serde(skip)]
    pub dt: Duration,
}

pub struct CoherencePipeline {
    config: PipelineConfig,
    detector: CoherenceDetector,
    session: Option<u64>,
    last_tick: Option<Instant>,
}

impl CoherencePipeline {
    pub fn new(config: PipelineConfig) -> Self {
        let detector = CoherenceDetector::new(CoherenceDetectorConfig::from_sensitivity(config.sensitivity));
        Self {
            config,
            detector,
            session: None,
            last_tick: None,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn detector(&self) -> &CoherenceDetector {
        &self.detector
    }

    /// Takes effect on the next tick.
    pub fn set_sensitivity(&mut self, sensitivity: Sensitivity) {
        self.config.sensitivity = sensitivity;
        self.detector
            .set_config(CoherenceDetectorConfig::from_sensitivity(sensitivity));
    }

    /// Runs a tick if one is due at `now`.
    pub fn poll(&mut self, snapshot: &TelemetrySnapshot, now: Instant) -> Option<TickOutput> {
        if self.session != Some(snapshot.session) {
            if self.session.is_some() {
                debug!("session {} → {}: detector reset", self.session.unwrap_or(0), snapshot.session);
            }
            self.session = Some(snapshot.session);
            self.detector.reset();
            self.last_tick = None;
        }

        let dt = match self.last_tick {
            None => self.config.tick_interval,
            Some(prev) => {
                let elapsed = now.saturating_duration_since(prev);
                if elapsed < self.config.tick_interval {
                    return None;
                }
                elapsed
            }
        };
        self.last_tick = Some(now);
        Some(self.step(snapshot, now, dt))
    }

    /// One tick regardless of timing.
    pub fn step(&mut self, snapshot: &TelemetrySnapshot, now: Instant, dt: Duration) -> TickOutput {
        let health = snapshot.health_at(now);
        let bands = snapshot.bands.smoothed;
        let contact_quality = snapshot.contact_quality();

        // A frozen snapshot is not evidence of coherence.
        let detector_quality = if health == ConnectionHealthState::Healthy {
            contact_quality
        } else {
            0.0
        };
        let status = self
            .detector
            .update(&bands, snapshot.motion_level, detector_quality, dt);
        let score = calculate_coherence(&bands, status.signal_variance, contact_quality);

        let audio = CoherenceUpdate {
            score,
            signal_quality: SignalQuality {
                is_connected: health.is_connected(),
                contact_quality,
                time_since_last_update: snapshot.since_last_packet(now).unwrap_or(Duration::MAX),
            },
            expressive: expressive_scores(&bands),
            ppg: snapshot.ppg,
        };

        TickOutput {
            status,
            score,
            zone: coherence_zone(score),
            health,
            contact_quality,
            audio,
            dt,
        }
    }
}

impl Default for CoherencePipeline {
    fn default() -> Self {
        Self::new(PipelineConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spectral::BrainwaveBands;
    use crate::types::CONTACT_OFF;

    fn live_snapshot(now: Instant, session: u64) -> TelemetrySnapshot {
        let mut s = TelemetrySnapshot {
            session,
            electrodes: [1; 4],
            ..Default::default()
        };
        s.bands.smoothed = BrainwaveBands {
            delta: 2.0,
            theta: 2.0,
            alpha: 10.0,
            beta: 3.0,
            gamma: 0.5,
        };
        s.health.on_connected(now);
        s.health.on_packet(now);
        s
    }

    #[test]
    fn ticks_are_rate_limited() {
        let t0 = Instant::now();
        let snap = live_snapshot(t0, 1);
        let mut p = CoherencePipeline::default();
        assert!(p.poll(&snap, t0).is_some());
        assert!(p.poll(&snap, t0 + Duration::from_millis(100)).is_none());
        let out = p.poll(&snap, t0 + Duration::from_millis(260)).unwrap();
        assert_eq!(out.dt, Duration::from_millis(260));
    }

    #[test]
    fn steady_calm_signal_goes_active() {
        let t0 = Instant::now();
        let mut p = CoherencePipeline::new(PipelineConfig {
            sensitivity: Sensitivity::clamped(1.0),
            ..Default::default()
        });
        let mut last = None;
        for i in 0..13u64 {
            let now = t0 + Duration::from_millis(250 * i);
            let mut snap = live_snapshot(t0, 1);
            snap.health.on_packet(now);
            last = p.poll(&snap, now);
        }
        let out = last.unwrap();
        assert_eq!(out.status.sustained_ms, 3250.0);
        assert!(out.status.is_active);
        assert_eq!(out.zone, CoherenceZone::Flow);
        assert!(out.audio.signal_quality.is_connected);
    }

    #[test]
    fn session_change_resets_detector() {
        let t0 = Instant::now();
        let mut p = CoherencePipeline::default();
        for i in 0..4u64 {
            p.poll(&live_snapshot(t0, 1), t0 + Duration::from_millis(250 * i));
        }
        assert!(p.detector().status().sustained_ms > 0.0);

        let neutral = TelemetrySnapshot {
            session: 2,
            ..Default::default()
        };
        let out = p.poll(&neutral, t0 + Duration::from_secs(1)).unwrap();
        assert_eq!(out.status.sustained_ms, 0.0);
        assert_eq!(out.score, 0.0);
        assert_eq!(out.health, ConnectionHealthState::Disconnected);
        assert!(!out.audio.signal_quality.is_connected);
        assert_eq!(out.audio.signal_quality.time_since_last_update, Duration::MAX);
    }

    #[test]
    fn stalled_snapshot_never_goes_active() {
        let t0 = Instant::now();
        let snap = live_snapshot(t0, 1);
        let mut p = CoherencePipeline::new(PipelineConfig {
            sensitivity: Sensitivity::clamped(1.0),
            ..Default::default()
        });
        let mut stalled_ticks = 0;
        for i in 0..40u64 {
            let now = t0 + Duration::from_millis(250 * i);
            let out = p.poll(&snap, now).unwrap();
            if out.health == ConnectionHealthState::Stalled {
                stalled_ticks += 1;
                assert_eq!(out.status.sustained_ms, 0.0);
            }
            assert!(!out.status.is_active, "tick {i}: {:?}", out.status);
        }
        assert!(stalled_ticks > 20);
    }

    #[test]
    fn no_contact_scores_zero() {
        let t0 = Instant::now();
        let mut snap = live_snapshot(t0, 1);
        snap.electrodes = [CONTACT_OFF; 4];
        let out = CoherencePipeline::default().step(&snap, t0, Duration::from_millis(250));
        assert_eq!(out.score, 0.0);
        assert_eq!(out.zone, CoherenceZone::Noise);
        assert!(!out.status.is_active);
    }
}
