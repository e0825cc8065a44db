//! Windowed band-power decomposition and EMA smoothing.
//!
//! Each EEG channel keeps a sliding window of `fft_size` samples. Every `hop`
//! new samples the window is Hann-tapered and transformed; bin power is summed
//! into the five classic bands. The lead channel (TP9) closes a frame: the
//! latest per-channel powers are averaged and folded into an exponential
//! moving average whose factor is derived from the hop period and the
//! requested settling time constant.

use std::collections::VecDeque;
use std::f64::consts::PI;
use std::sync::Arc;
use std::time::Duration;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use serde::Serialize;

use crate::protocol::ELECTRODE_COUNT;

/// Band edges in Hz, half-open `[low, high)`.
pub const DELTA_HZ: (f64, f64) = (1.0, 4.0);
pub const THETA_HZ: (f64, f64) = (4.0, 8.0);
pub const ALPHA_HZ: (f64, f64) = (8.0, 13.0);
pub const BETA_HZ: (f64, f64) = (13.0, 30.0);
pub const GAMMA_HZ: (f64, f64) = (30.0, 44.0);

/// Floor applied before taking logs so silent bands map to a finite dB.
const POWER_FLOOR: f64 = 1e-12;

/// Power in each EEG band. Linear form is never negative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct BrainwaveBands {
    pub delta: f64,
    pub theta: f64,
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
}

impl BrainwaveBands {
    pub fn total(&self) -> f64 {
        self.delta + self.theta + self.alpha + self.beta + self.gamma
    }

    /// `alpha / total`, or 0 when there is no power at all.
    pub fn relative_alpha(&self) -> f64 {
        let total = self.total();
        if total > POWER_FLOOR {
            self.alpha / total
        } else {
            0.0
        }
    }

    /// 10·log10 of each band.
    pub fn to_db(&self) -> Self {
        self.map(|p| 10.0 * p.max(POWER_FLOOR).log10())
    }

    pub fn map(&self, f: impl Fn(f64) -> f64) -> Self {
        Self {
            delta: f(self.delta),
            theta: f(self.theta),
            alpha: f(self.alpha),
            beta: f(self.beta),
            gamma: f(self.gamma),
        }
    }

    fn zip(&self, other: &Self, f: impl Fn(f64, f64) -> f64) -> Self {
        Self {
            delta: f(self.delta, other.delta),
            theta: f(self.theta, other.theta),
            alpha: f(self.alpha, other.alpha),
            beta: f(self.beta, other.beta),
            gamma: f(self.gamma, other.gamma),
        }
    }
}

/// The four parallel forms of the band estimate published by the adapter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct BandSet {
    pub raw: BrainwaveBands,
    pub smoothed: BrainwaveBands,
    pub raw_db: BrainwaveBands,
    pub smoothed_db: BrainwaveBands,
}

// ── SpectralAnalyzer ─────────────────────────────────────────────────────────

/// Hann-windowed FFT producing one-sided power.
pub struct SpectralAnalyzer {
    fft_size: usize,
    sample_rate: f64,
    fft: Arc<dyn Fft<f64>>,
    window: Vec<f64>,
    buffer: Vec<Complex<f64>>,
    scratch: Vec<Complex<f64>>,
}

impl SpectralAnalyzer {
    pub fn new(fft_size: usize, sample_rate: f64) -> Self {
        let fft = FftPlanner::new().plan_fft_forward(fft_size);
        let scratch = vec![Complex::default(); fft.get_inplace_scratch_len()];
        Self {
            fft_size,
            sample_rate,
            fft,
            window: hann_window(fft_size),
            buffer: vec![Complex::default(); fft_size],
            scratch,
        }
    }

    /// Hz per bin.
    pub fn resolution(&self) -> f64 {
        self.sample_rate / self.fft_size as f64
    }

    /// Power per bin for the first `fft_size` samples; the mean is removed
    /// first so electrode DC offset doesn't leak into delta.
    ///
    /// Returns `None` if fewer than `fft_size` samples are supplied.
    pub fn power_spectrum<'a>(&mut self, samples: impl IntoIterator<Item = &'a f64>) -> Option<Vec<f64>> {
        let mut n = 0;
        for (slot, &s) in self.buffer.iter_mut().zip(samples) {
            *slot = Complex::new(s, 0.0);
            n += 1;
        }
        if n < self.fft_size {
            return None;
        }
        let mean = self.buffer.iter().map(|c| c.re).sum::<f64>() / n as f64;
        for (slot, &w) in self.buffer.iter_mut().zip(&self.window) {
            slot.re = (slot.re - mean) * w;
        }

        self.fft.process_with_scratch(&mut self.buffer, &mut self.scratch);

        let norm = 1.0 / (self.fft_size as f64).powi(2);
        Some(
            self.buffer[..self.fft_size / 2 + 1]
                .iter()
                .map(|c| c.norm_sqr() * norm)
                .collect(),
        )
    }

    /// Sum of bins whose centre frequency lies in `[low, high)`.
    pub fn band_power(&self, psd: &[f64], (low, high): (f64, f64)) -> f64 {
        let res = self.resolution();
        psd.iter()
            .enumerate()
            .filter(|(i, _)| {
                let f = *i as f64 * res;
                f >= low && f < high
            })
            .map(|(_, p)| p)
            .sum()
    }

    pub fn bands(&self, psd: &[f64]) -> BrainwaveBands {
        BrainwaveBands {
            delta: self.band_power(psd, DELTA_HZ),
            theta: self.band_power(psd, THETA_HZ),
            alpha: self.band_power(psd, ALPHA_HZ),
            beta: self.band_power(psd, BETA_HZ),
            gamma: self.band_power(psd, GAMMA_HZ),
        }
    }
}

fn hann_window(size: usize) -> Vec<f64> {
    if size < 2 {
        return vec![1.0; size];
    }
    (0..size)
        .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f64 / (size - 1) as f64).cos()))
        .collect()
}

// ── BandTracker ──────────────────────────────────────────────────────────────

/// Windowing and smoothing parameters.
#[derive(Debug, Clone)]
pub struct BandConfig {
    pub sample_rate: f64,
    /// Window length in samples (power of two). 256 = 1 s at 256 Hz.
    pub fft_size: usize,
    /// New samples between transforms.
    pub hop: usize,
    /// EMA time constant; ~1–2 s settling.
    pub smoothing: Duration,
}

impl Default for BandConfig {
    fn default() -> Self {
        Self {
            sample_rate: crate::protocol::EEG_FREQUENCY,
            fft_size: 256,
            hop: 32,
            smoothing: Duration::from_millis(1500),
        }
    }
}

impl BandConfig {
    /// EMA factor per frame: `1 − e^(−hop_period / τ)`.
    pub fn ema_alpha(&self) -> f64 {
        let hop_secs = self.hop as f64 / self.sample_rate;
        let tau = self.smoothing.as_secs_f64().max(1e-6);
        1.0 - (-hop_secs / tau).exp()
    }
}

struct ChannelWindow {
    samples: VecDeque<f64>,
    since_last: usize,
    latest: Option<BrainwaveBands>,
}

impl ChannelWindow {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity + 16),
            since_last: 0,
            latest: None,
        }
    }

    /// Population standard deviation of the current window in µV.
    fn spread(&self) -> Option<f64> {
        let n = self.samples.len();
        if n < 2 {
            return None;
        }
        let mean = self.samples.iter().sum::<f64>() / n as f64;
        let var = self.samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n as f64;
        Some(var.sqrt())
    }
}

/// Per-channel windows feeding one averaged, smoothed band estimate.
pub struct BandTracker {
    config: BandConfig,
    analyzer: SpectralAnalyzer,
    channels: Vec<ChannelWindow>,
    alpha: f64,
    current: Option<BandSet>,
}

impl BandTracker {
    pub fn new(config: BandConfig) -> Self {
        let analyzer = SpectralAnalyzer::new(config.fft_size, config.sample_rate);
        let channels = (0..ELECTRODE_COUNT)
            .map(|_| ChannelWindow::new(config.fft_size))
            .collect();
        let alpha = config.ema_alpha();
        Self {
            config,
            analyzer,
            channels,
            alpha,
            current: None,
        }
    }

    /// Append samples for `electrode`. Returns `true` when a new smoothed
    /// frame was produced.
    pub fn push(&mut self, electrode: usize, samples: &[f64]) -> bool {
        let fft_size = self.config.fft_size;
        let hop = self.config.hop.max(1);
        let Some(ch) = self.channels.get_mut(electrode) else {
            return false;
        };
        let mut recomputed = false;
        for &s in samples.iter().filter(|s| s.is_finite()) {
            ch.samples.push_back(s);
            if ch.samples.len() > fft_size {
                ch.samples.pop_front();
            }
            ch.since_last += 1;
            if ch.samples.len() == fft_size && ch.since_last >= hop {
                ch.since_last = 0;
                if let Some(psd) = self.analyzer.power_spectrum(ch.samples.iter()) {
                    ch.latest = Some(self.analyzer.bands(&psd));
                    recomputed = true;
                }
            }
        }
        recomputed && electrode == 0 && self.close_frame()
    }

    fn close_frame(&mut self) -> bool {
        let estimates: Vec<&BrainwaveBands> =
            self.channels.iter().filter_map(|c| c.latest.as_ref()).collect();
        if estimates.is_empty() {
            return false;
        }
        let n = estimates.len() as f64;
        let raw = estimates
            .iter()
            .fold(BrainwaveBands::default(), |acc, b| acc.zip(b, |x, y| x + y))
            .map(|v| (v / n).max(0.0));

        let smoothed = match &self.current {
            Some(prev) => prev.smoothed.zip(&raw, |s, r| s + self.alpha * (r - s)),
            None => raw,
        };
        self.current = Some(BandSet {
            raw,
            smoothed,
            raw_db: raw.to_db(),
            smoothed_db: smoothed.to_db(),
        });
        true
    }

    /// Latest frame, or all-zero bands before the first window fills.
    pub fn bands(&self) -> BandSet {
        self.current.unwrap_or_default()
    }

    /// Rolling amplitude spread per electrode, `None` until samples arrive.
    pub fn spreads(&self) -> [Option<f64>; ELECTRODE_COUNT] {
        std::array::from_fn(|i| self.channels.get(i).and_then(ChannelWindow::spread))
    }

    pub fn reset(&mut self) {
        for ch in &mut self.channels {
            *ch = ChannelWindow::new(self.config.fft_size);
        }
        self.current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f64, amp: f64, n: usize, offset: usize) -> Vec<f64> {
        (0..n)
            .map(|i| amp * (2.0 * PI * freq * (i + offset) as f64 / 256.0).sin())
            .collect()
    }

    #[test]
    fn ten_hertz_lands_in_alpha() {
        let mut analyzer = SpectralAnalyzer::new(256, 256.0);
        let samples = sine(10.0, 20.0, 256, 0);
        let psd = analyzer.power_spectrum(samples.iter()).unwrap();
        let bands = analyzer.bands(&psd);
        assert!(bands.alpha > 0.9 * bands.total());
    }

    #[test]
    fn short_input_yields_nothing() {
        let mut analyzer = SpectralAnalyzer::new(256, 256.0);
        assert!(analyzer.power_spectrum([0.0; 100].iter()).is_none());
    }

    #[test]
    fn db_of_silence_is_finite() {
        let db = BrainwaveBands::default().to_db();
        assert!(db.alpha.is_finite());
        assert!((db.alpha + 120.0).abs() < 1e-9);
    }

    #[test]
    fn tracker_needs_full_window_then_emits_per_hop() {
        let mut tracker = BandTracker::new(BandConfig::default());
        assert!(!tracker.push(0, &sine(10.0, 20.0, 255, 0)));
        assert_eq!(tracker.bands(), BandSet::default());
        assert!(tracker.push(0, &sine(10.0, 20.0, 1, 255)));
        assert!(!tracker.push(0, &sine(10.0, 20.0, 31, 256)));
        assert!(tracker.push(0, &sine(10.0, 20.0, 1, 287)));
    }

    #[test]
    fn smoothed_lags_raw_after_a_step() {
        let mut tracker = BandTracker::new(BandConfig::default());
        tracker.push(0, &sine(10.0, 5.0, 256, 0));
        let quiet = tracker.bands().smoothed.alpha;
        tracker.push(0, &sine(10.0, 50.0, 256, 256));
        let set = tracker.bands();
        assert!(set.smoothed.alpha > quiet);
        assert!(set.smoothed.alpha < set.raw.alpha);
        assert!(set.smoothed.alpha >= 0.0);
    }

    #[test]
    fn ema_factor_matches_time_constant() {
        let cfg = BandConfig::default();
        let a = cfg.ema_alpha();
        // hop = 125 ms, tau = 1.5 s
        assert!((a - (1.0 - (-0.125f64 / 1.5).exp())).abs() < 1e-12);
    }

    #[test]
    fn flat_channel_has_zero_spread() {
        let mut tracker = BandTracker::new(BandConfig::default());
        tracker.push(2, &[3.0; 64]);
        assert_eq!(tracker.spreads()[2], Some(0.0));
        assert_eq!(tracker.spreads()[0], None);
    }
}
