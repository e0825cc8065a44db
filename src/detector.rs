//! Sustained-coherence detector with asymmetric hysteresis.
//!
//! Each tick checks four conditions against the current snapshot:
//!
//! | Check | Passes when |
//! |---|---|
//! | band ratio | `beta / alpha ≤ threshold` |
//! | stability | variance of relative alpha over the last 20 ticks `< 0.05` |
//! | contact | electrode confidence `≥ 0.5` |
//! | stillness | motion level `< 0.3` |
//!
//! While all four hold, `sustained_ms` grows by the tick duration and the
//! verdict turns active once it reaches the configured hold time. A single
//! failing tick drops the verdict and the accumulated time at once.

use std::collections::VecDeque;
use std::time::Duration;

use log::warn;
use serde::Serialize;

use crate::error::ConfigError;
use crate::spectral::BrainwaveBands;

/// Reported ratio when alpha is too small to divide by. Never passes.
pub const RATIO_SENTINEL: f64 = 1.0e6;
const ALPHA_EPSILON: f64 = 1e-9;

const VARIANCE_WINDOW: usize = 20;
const VARIANCE_CEILING: f64 = 0.05;
const QUALITY_FLOOR: f64 = 0.5;
const MOTION_CEILING: f64 = 0.3;

/// Good-contact ticks needed before the personal baseline is trusted.
const BASELINE_MIN_TICKS: u32 = 20;
const BASELINE_EMA: f64 = 0.05;
const BASELINE_MARGIN: f64 = 1.1;

// ── Sensitivity / config ─────────────────────────────────────────────────────

/// User-facing difficulty scalar: 0 = strict, 1 = easy.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize)]
pub struct Sensitivity(f64);

impl Sensitivity {
    pub fn new(value: f64) -> Result<Self, ConfigError> {
        if (0.0..=1.0).contains(&value) {
            Ok(Self(value))
        } else {
            Err(ConfigError::SensitivityOutOfRange(value))
        }
    }

    /// Out-of-range input is clamped (NaN becomes the default) and logged.
    pub fn clamped(value: f64) -> Self {
        Self::new(value).unwrap_or_else(|e| {
            let fixed = if value.is_nan() {
                Self::default()
            } else {
                Self(value.clamp(0.0, 1.0))
            };
            warn!("{e}; using {}", fixed.0);
            fixed
        })
    }

    pub fn value(self) -> f64 {
        self.0
    }
}

impl Default for Sensitivity {
    fn default() -> Self {
        Self(0.5)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CoherenceDetectorConfig {
    /// Hold time before the verdict turns active.
    pub sustained_ms: f64,
    /// Absolute `beta / alpha` cutoff.
    pub beta_alpha_ratio_threshold: f64,
    /// Raise the cutoff to the user's own baseline once one exists.
    pub use_relative_mode: bool,
}

impl CoherenceDetectorConfig {
    /// | s | hold | cutoff | relative |
    /// |---|---|---|---|
    /// | 0.0 | 8 s | 0.50 | no |
    /// | 0.5 | 5.5 s | 0.75 | no |
    /// | 1.0 | 3 s | 1.00 | yes (from 0.75) |
    pub fn from_sensitivity(s: Sensitivity) -> Self {
        let s = s.value();
        Self {
            sustained_ms: 8000.0 - 5000.0 * s,
            beta_alpha_ratio_threshold: 0.5 + 0.5 * s,
            use_relative_mode: s >= 0.75,
        }
    }
}

impl Default for CoherenceDetectorConfig {
    fn default() -> Self {
        Self::from_sensitivity(Sensitivity::default())
    }
}

// ── Status ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CoherenceStatus {
    pub is_active: bool,
    pub sustained_ms: f64,
    pub beta_alpha_ratio: f64,
    pub signal_variance: f64,
    /// 0 (clean) … 1 (motion and poor contact).
    pub noise_level: f64,
}

// ── Detector ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CoherenceDetector {
    config: CoherenceDetectorConfig,
    status: CoherenceStatus,
    history: VecDeque<f64>,
    baseline: Option<f64>,
    baseline_ticks: u32,
}

impl CoherenceDetector {
    pub fn new(config: CoherenceDetectorConfig) -> Self {
        Self {
            config,
            status: CoherenceStatus::default(),
            history: VecDeque::with_capacity(VARIANCE_WINDOW + 1),
            baseline: None,
            baseline_ticks: 0,
        }
    }

    pub fn config(&self) -> CoherenceDetectorConfig {
        self.config
    }

    /// Applies from the next `update`; accumulated hold time is kept.
    pub fn set_config(&mut self, config: CoherenceDetectorConfig) {
        self.config = config;
    }

    pub fn status(&self) -> CoherenceStatus {
        self.status
    }

    pub fn reset(&mut self) {
        self.status = CoherenceStatus::default();
        self.history.clear();
        self.baseline = None;
        self.baseline_ticks = 0;
    }

    /// Cutoff in force for the next tick.
    pub fn effective_threshold(&self) -> f64 {
        let absolute = self.config.beta_alpha_ratio_threshold;
        match self.baseline {
            Some(b) if self.config.use_relative_mode && self.baseline_ticks >= BASELINE_MIN_TICKS => {
                absolute.max(b * BASELINE_MARGIN)
            }
            _ => absolute,
        }
    }

    /// One tick. `motion_level` and `electrode_quality` are in `[0, 1]`;
    /// non-finite values count as worst case.
    pub fn update(
        &mut self,
        bands: &BrainwaveBands,
        motion_level: f64,
        electrode_quality: f64,
        dt: Duration,
    ) -> CoherenceStatus {
        let motion = if motion_level.is_finite() { motion_level.clamp(0.0, 1.0) } else { 1.0 };
        let quality = if electrode_quality.is_finite() {
            electrode_quality.clamp(0.0, 1.0)
        } else {
            0.0
        };

        let ratio = beta_alpha_ratio(bands);
        let threshold = self.effective_threshold();

        self.history.push_back(bands.relative_alpha());
        if self.history.len() > VARIANCE_WINDOW {
            self.history.pop_front();
        }
        let variance = variance(&self.history);

        let condition_met = ratio <= threshold
            && variance < VARIANCE_CEILING
            && quality >= QUALITY_FLOOR
            && motion < MOTION_CEILING;

        // Baseline is learned from good-contact ticks only.
        if ratio < RATIO_SENTINEL && quality >= QUALITY_FLOOR {
            self.baseline = Some(match self.baseline {
                Some(b) => b + BASELINE_EMA * (ratio - b),
                None => ratio,
            });
            self.baseline_ticks = self.baseline_ticks.saturating_add(1);
        }

        let (sustained_ms, is_active) = if condition_met {
            let sustained = self.status.sustained_ms + dt.as_nanos() as f64 / 1_000_000.0;
            (sustained, sustained >= self.config.sustained_ms)
        } else {
            (0.0, false)
        };

        self.status = CoherenceStatus {
            is_active,
            sustained_ms,
            beta_alpha_ratio: ratio,
            signal_variance: variance,
            noise_level: (0.6 * motion + 0.4 * (1.0 - quality)).clamp(0.0, 1.0),
        };
        self.status
    }
}

impl Default for CoherenceDetector {
    fn default() -> Self {
        Self::new(CoherenceDetectorConfig::default())
    }
}

/// `beta / alpha`, or [`RATIO_SENTINEL`] when alpha is ~0 or either is
/// non-finite.
pub fn beta_alpha_ratio(bands: &BrainwaveBands) -> f64 {
    if bands.alpha.is_finite() && bands.beta.is_finite() && bands.alpha > ALPHA_EPSILON {
        (bands.beta / bands.alpha).min(RATIO_SENTINEL)
    } else {
        RATIO_SENTINEL
    }
}

fn variance(values: &VecDeque<f64>) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / n as f64;
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    const TICK: Duration = Duration::from_millis(250);

    fn calm() -> BrainwaveBands {
        BrainwaveBands {
            alpha: 10.0,
            beta: 3.0,
            ..Default::default()
        }
    }

    fn busy() -> BrainwaveBands {
        BrainwaveBands {
            alpha: 2.0,
            beta: 8.0,
            ..Default::default()
        }
    }

    fn strict() -> CoherenceDetectorConfig {
        CoherenceDetectorConfig {
            sustained_ms: 5000.0,
            beta_alpha_ratio_threshold: 0.5,
            use_relative_mode: false,
        }
    }

    #[test]
    fn calm_bands_activate_after_exactly_hold_time() {
        let mut d = CoherenceDetector::new(strict());
        for _ in 0..19 {
            let s = d.update(&calm(), 0.0, 1.0, TICK);
            assert!(!s.is_active);
        }
        let s = d.update(&calm(), 0.0, 1.0, TICK);
        assert_eq!(s.sustained_ms, 5000.0);
        assert!(s.is_active);
        assert!((s.beta_alpha_ratio - 0.3).abs() < 1e-12);
        assert_eq!(s.signal_variance, 0.0);
    }

    #[test]
    fn one_ms_short_then_broken_never_activates() {
        let mut d = CoherenceDetector::new(strict());
        for _ in 0..19 {
            d.update(&calm(), 0.0, 1.0, TICK);
        }
        let s = d.update(&calm(), 0.0, 1.0, Duration::from_millis(249));
        assert_eq!(s.sustained_ms, 4999.0);
        assert!(!s.is_active);
        let s = d.update(&busy(), 0.0, 1.0, TICK);
        assert!(!s.is_active);
        assert_eq!(s.sustained_ms, 0.0);
    }

    #[test]
    fn one_ms_over_activates_and_holds() {
        let mut d = CoherenceDetector::new(strict());
        for _ in 0..20 {
            d.update(&calm(), 0.0, 1.0, TICK);
        }
        let s = d.update(&calm(), 0.0, 1.0, Duration::from_millis(1));
        assert!(s.is_active);
        for _ in 0..10 {
            assert!(d.update(&calm(), 0.0, 1.0, TICK).is_active);
        }
    }

    #[test]
    fn single_failing_tick_deactivates_immediately() {
        let mut d = CoherenceDetector::new(strict());
        for _ in 0..24 {
            d.update(&calm(), 0.0, 1.0, TICK);
        }
        assert!(d.status().is_active);
        // Motion alone breaks it.
        let s = d.update(&calm(), 0.5, 1.0, TICK);
        assert!(!s.is_active);
        assert_eq!(s.sustained_ms, 0.0);
        assert!((s.noise_level - 0.3).abs() < 1e-12);
    }

    #[test]
    fn poor_contact_fails_condition() {
        let mut d = CoherenceDetector::new(strict());
        let s = d.update(&calm(), 0.0, 0.33, TICK);
        assert_eq!(s.sustained_ms, 0.0);
    }

    #[test]
    fn zero_alpha_uses_sentinel() {
        let mut d = CoherenceDetector::default();
        let s = d.update(&BrainwaveBands::default(), 0.0, 1.0, TICK);
        assert_eq!(s.beta_alpha_ratio, RATIO_SENTINEL);
        assert!(!s.is_active);
        let nan = BrainwaveBands {
            alpha: f64::NAN,
            ..calm()
        };
        assert_eq!(beta_alpha_ratio(&nan), RATIO_SENTINEL);
    }

    #[test]
    fn jittery_relative_alpha_fails_stability() {
        let mut d = CoherenceDetector::new(CoherenceDetectorConfig {
            beta_alpha_ratio_threshold: 10.0,
            ..strict()
        });
        let mut last = CoherenceStatus::default();
        for i in 0..10 {
            let bands = if i % 2 == 0 {
                BrainwaveBands { alpha: 10.0, beta: 0.1, ..Default::default() }
            } else {
                BrainwaveBands { alpha: 1.0, beta: 9.0, ..Default::default() }
            };
            last = d.update(&bands, 0.0, 1.0, TICK);
        }
        assert!(last.signal_variance > VARIANCE_CEILING);
        assert_eq!(last.sustained_ms, 0.0);
    }

    #[test]
    fn config_swap_keeps_hold_time() {
        let mut d = CoherenceDetector::new(strict());
        for _ in 0..8 {
            d.update(&calm(), 0.0, 1.0, TICK);
        }
        d.set_config(CoherenceDetectorConfig::from_sensitivity(Sensitivity::clamped(1.0)));
        let s = d.update(&calm(), 0.0, 1.0, TICK);
        // 9 ticks, short of the new 3 s hold.
        assert_eq!(s.sustained_ms, 2250.0);
        assert!(!s.is_active);
        for _ in 0..3 {
            d.update(&calm(), 0.0, 1.0, TICK);
        }
        assert!(d.status().is_active);
    }

    #[test]
    fn relative_mode_uses_baseline_once_established() {
        let config = CoherenceDetectorConfig {
            sustained_ms: 1000.0,
            beta_alpha_ratio_threshold: 0.5,
            use_relative_mode: true,
        };
        let mut d = CoherenceDetector::new(config);
        // Ratio 0.8 is above the absolute cutoff.
        let bands = BrainwaveBands { alpha: 10.0, beta: 8.0, ..Default::default() };
        for _ in 0..19 {
            assert_eq!(d.update(&bands, 0.0, 1.0, TICK).sustained_ms, 0.0);
        }
        d.update(&bands, 0.0, 1.0, TICK);
        assert!((d.effective_threshold() - 0.88).abs() < 1e-9);
        let s = d.update(&bands, 0.0, 1.0, TICK);
        assert_eq!(s.sustained_ms, 250.0);
    }

    #[test]
    fn reset_clears_everything() {
        let mut d = CoherenceDetector::new(strict());
        for _ in 0..30 {
            d.update(&calm(), 0.0, 1.0, TICK);
        }
        d.reset();
        assert_eq!(d.status(), CoherenceStatus::default());
        assert_eq!(d.effective_threshold(), 0.5);
    }

    #[test]
    fn sensitivity_mapping_and_validation() {
        let easy = CoherenceDetectorConfig::from_sensitivity(Sensitivity::new(1.0).unwrap());
        assert_eq!(easy.sustained_ms, 3000.0);
        assert_eq!(easy.beta_alpha_ratio_threshold, 1.0);
        assert!(easy.use_relative_mode);
        let hard = CoherenceDetectorConfig::from_sensitivity(Sensitivity::new(0.0).unwrap());
        assert_eq!(hard.sustained_ms, 8000.0);
        assert!(!hard.use_relative_mode);

        assert_eq!(Sensitivity::new(1.5), Err(ConfigError::SensitivityOutOfRange(1.5)));
        assert!(Sensitivity::new(f64::NAN).is_err());
        assert_eq!(Sensitivity::clamped(-3.0).value(), 0.0);
        assert_eq!(Sensitivity::clamped(f64::NAN), Sensitivity::default());
    }
}
