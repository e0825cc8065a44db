//! Continuous coherence score and zone classification. Pure functions.
//!
//! ```text
//! ratio_score    = 1 / (1 + (beta/alpha ÷ 0.6)²)
//! variance_score = 1 / (1 + variance ÷ 0.02)
//! score          = (0.7·ratio_score + 0.3·variance_score) · electrode_quality
//! ```
//!
//! Electrode quality multiplies everything, so a headset with no contact
//! scores 0 whatever the bands say.

use serde::Serialize;

use crate::detector::beta_alpha_ratio;
use crate::spectral::BrainwaveBands;
use crate::types::ElectrodeQuality;

/// Lower bound of [`CoherenceZone::Flow`]. Shared with presentation.
pub const FLOW_THRESHOLD: f64 = 0.70;
/// Lower bound of [`CoherenceZone::Stabilizing`]. Shared with presentation.
pub const STABILIZING_THRESHOLD: f64 = 0.40;

/// Ratio at which `ratio_score` is one half.
const RATIO_KNEE: f64 = 0.6;
/// Variance at which `variance_score` is one half.
const VARIANCE_KNEE: f64 = 0.02;
const RATIO_WEIGHT: f64 = 0.7;
const VARIANCE_WEIGHT: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CoherenceZone {
    Flow,
    Stabilizing,
    Noise,
}

/// Score in `[0, 1]`. Any non-finite input scores 0.
pub fn calculate_coherence(bands: &BrainwaveBands, signal_variance: f64, electrode_quality: f64) -> f64 {
    if !signal_variance.is_finite() || !electrode_quality.is_finite() {
        return 0.0;
    }
    let quality = electrode_quality.clamp(0.0, 1.0);
    if quality == 0.0 {
        return 0.0;
    }
    let ratio = beta_alpha_ratio(bands);
    let ratio_score = 1.0 / (1.0 + (ratio / RATIO_KNEE).powi(2));
    let variance_score = 1.0 / (1.0 + signal_variance.max(0.0) / VARIANCE_KNEE);
    let score = (RATIO_WEIGHT * ratio_score + VARIANCE_WEIGHT * variance_score) * quality;
    if score.is_finite() {
        score.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

pub fn coherence_zone(score: f64) -> CoherenceZone {
    if score >= FLOW_THRESHOLD {
        CoherenceZone::Flow
    } else if score >= STABILIZING_THRESHOLD {
        CoherenceZone::Stabilizing
    } else {
        CoherenceZone::Noise
    }
}

/// Mean contact weight over the four sites.
pub fn electrode_confidence(qualities: &[ElectrodeQuality; 4]) -> f64 {
    qualities.iter().map(|q| q.weight()).sum::<f64>() / qualities.len() as f64
}

/// Secondary descriptors used to colour the audio, not to gate it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ExpressiveScores {
    /// `alpha / (alpha + beta)`.
    pub calm: f64,
    /// `theta / (theta + beta)`.
    pub creative_flow: f64,
}

pub fn expressive_scores(bands: &BrainwaveBands) -> ExpressiveScores {
    let share = |part: f64, other: f64| {
        let sum = part + other;
        if sum.is_finite() && sum > 0.0 {
            (part / sum).clamp(0.0, 1.0)
        } else {
            0.0
        }
    };
    ExpressiveScores {
        calm: share(bands.alpha, bands.beta),
        creative_flow: share(bands.theta, bands.beta),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bands(alpha: f64, beta: f64) -> BrainwaveBands {
        BrainwaveBands {
            delta: 4.0,
            theta: 2.0,
            alpha,
            beta,
            gamma: 0.5,
        }
    }

    #[test]
    fn zone_boundaries_are_exact() {
        assert_eq!(coherence_zone(0.70), CoherenceZone::Flow);
        assert_eq!(coherence_zone(0.6999), CoherenceZone::Stabilizing);
        assert_eq!(coherence_zone(0.40), CoherenceZone::Stabilizing);
        assert_eq!(coherence_zone(0.3999), CoherenceZone::Noise);
        assert_eq!(coherence_zone(1.0), CoherenceZone::Flow);
        assert_eq!(coherence_zone(0.0), CoherenceZone::Noise);
    }

    #[test]
    fn score_stays_in_unit_range() {
        let values = [0.0, 1e-12, 0.3, 1.0, 7.5, 1e9, f64::INFINITY, f64::NAN, -1.0];
        for &a in &values {
            for &b in &values {
                for &v in &values {
                    for &q in &values {
                        let s = calculate_coherence(&bands(a, b), v, q);
                        assert!((0.0..=1.0).contains(&s), "a={a} b={b} v={v} q={q} → {s}");
                    }
                }
            }
        }
    }

    #[test]
    fn all_electrodes_off_forces_zero() {
        let q = electrode_confidence(&[ElectrodeQuality::Off; 4]);
        assert_eq!(q, 0.0);
        assert_eq!(calculate_coherence(&bands(100.0, 0.1), 0.0, q), 0.0);
    }

    #[test]
    fn calm_steady_signal_reaches_flow() {
        let s = calculate_coherence(&bands(10.0, 3.0), 0.01, 1.0);
        assert_eq!(coherence_zone(s), CoherenceZone::Flow);
        let busy = calculate_coherence(&bands(2.0, 8.0), 0.01, 1.0);
        assert_eq!(coherence_zone(busy), CoherenceZone::Noise);
    }

    #[test]
    fn contact_scales_score() {
        let full = calculate_coherence(&bands(10.0, 3.0), 0.0, 1.0);
        let half = calculate_coherence(&bands(10.0, 3.0), 0.0, 0.5);
        assert!((half - full / 2.0).abs() < 1e-12);
    }

    #[test]
    fn confidence_weights() {
        use ElectrodeQuality::*;
        let q = electrode_confidence(&[Good, Medium, Poor, Off]);
        assert!((q - (1.0 + 0.66 + 0.33) / 4.0).abs() < 1e-12);
    }

    #[test]
    fn expressive_shares() {
        let e = expressive_scores(&bands(3.0, 1.0));
        assert_eq!(e.calm, 0.75);
        assert!((e.creative_flow - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(expressive_scores(&BrainwaveBands::default()), ExpressiveScores::default());
    }
}
