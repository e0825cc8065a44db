//! Heart rate from the optical (PPG) channel.
//!
//! Beats are found by peak picking on a detrended rolling window. The
//! reported bpm comes from the median inter-beat interval; confidence blends
//! interval regularity, beat count and the share of physiologically plausible
//! intervals. Below the confidence floor the bpm is withheld rather than
//! guessed.

use std::collections::VecDeque;
use std::time::Duration;

use serde::Serialize;

/// Pulse metrics for one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PpgMetrics {
    /// `None` whenever `confidence` is below the floor.
    pub bpm: Option<f64>,
    /// 0–1.
    pub confidence: f64,
    /// Stream time of the most recent beat, in ms since the analyser started.
    pub last_beat_ms: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct PpgConfig {
    pub sample_rate: f64,
    /// Rolling analysis window.
    pub window: Duration,
    /// Minimum spacing between beats (0.33 s caps detection at ~180 bpm).
    pub refractory: Duration,
    /// Below this the bpm is reported as unknown.
    pub confidence_floor: f64,
}

impl Default for PpgConfig {
    fn default() -> Self {
        Self {
            sample_rate: crate::protocol::PPG_FREQUENCY,
            window: Duration::from_secs(8),
            refractory: Duration::from_millis(330),
            confidence_floor: 0.5,
        }
    }
}

const MIN_IBI_MS: f64 = 333.0; // 180 bpm
const MAX_IBI_MS: f64 = 1500.0; // 40 bpm
/// Intervals needed for full coverage credit.
const FULL_COVERAGE_IBIS: f64 = 6.0;

pub struct PpgAnalyzer {
    config: PpgConfig,
    samples: VecDeque<f64>,
    capacity: usize,
    /// Total samples ever pushed; the stream clock.
    consumed: u64,
    metrics: PpgMetrics,
}

impl PpgAnalyzer {
    pub fn new(config: PpgConfig) -> Self {
        let capacity = (config.window.as_secs_f64() * config.sample_rate).round() as usize;
        Self {
            samples: VecDeque::with_capacity(capacity + 8),
            capacity: capacity.max(8),
            consumed: 0,
            metrics: PpgMetrics::default(),
            config,
        }
    }

    pub fn push(&mut self, samples: &[f64]) {
        for &s in samples.iter().filter(|s| s.is_finite()) {
            self.samples.push_back(s);
            if self.samples.len() > self.capacity {
                self.samples.pop_front();
            }
            self.consumed += 1;
        }
        self.metrics = self.analyse();
    }

    pub fn metrics(&self) -> PpgMetrics {
        self.metrics
    }

    pub fn reset(&mut self) {
        self.samples.clear();
        self.consumed = 0;
        self.metrics = PpgMetrics::default();
    }

    fn analyse(&self) -> PpgMetrics {
        let fs = self.config.sample_rate;
        // Half a window of data before anything is attempted.
        if self.samples.len() < self.capacity / 2 {
            return PpgMetrics::default();
        }

        let data: Vec<f64> = self.samples.iter().copied().collect();
        let detrended = detrend(&data, fs.round() as usize);
        let n = detrended.len() as f64;
        let mean = detrended.iter().sum::<f64>() / n;
        let std = (detrended.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
        if std < 1e-9 {
            return PpgMetrics::default();
        }

        let peaks = find_peaks(&detrended, 0.5 * std, self.refractory_samples());
        let ms_per_sample = 1000.0 / fs;
        let window_start = self.consumed - self.samples.len() as u64;
        let last_beat_ms = peaks
            .last()
            .map(|&p| (window_start + p as u64) as f64 * ms_per_sample);

        let ibis: Vec<f64> = peaks
            .windows(2)
            .map(|w| (w[1] - w[0]) as f64 * ms_per_sample)
            .collect();
        if ibis.len() < 2 {
            return PpgMetrics {
                bpm: None,
                confidence: 0.0,
                last_beat_ms,
            };
        }

        let plausible: Vec<f64> = ibis
            .iter()
            .copied()
            .filter(|ibi| (MIN_IBI_MS..=MAX_IBI_MS).contains(ibi))
            .collect();
        if plausible.len() < 2 {
            return PpgMetrics {
                bpm: None,
                confidence: 0.0,
                last_beat_ms,
            };
        }

        let ibi_mean = plausible.iter().sum::<f64>() / plausible.len() as f64;
        let ibi_std = (plausible.iter().map(|v| (v - ibi_mean).powi(2)).sum::<f64>()
            / plausible.len() as f64)
            .sqrt();
        let regularity = (1.0 - 2.0 * ibi_std / ibi_mean).clamp(0.0, 1.0);
        let coverage = (plausible.len() as f64 / FULL_COVERAGE_IBIS).min(1.0);
        let plausible_share = plausible.len() as f64 / ibis.len() as f64;
        let confidence = (regularity * coverage * plausible_share).clamp(0.0, 1.0);

        let bpm = (confidence >= self.config.confidence_floor).then(|| 60_000.0 / median(plausible));

        PpgMetrics {
            bpm,
            confidence,
            last_beat_ms,
        }
    }

    fn refractory_samples(&self) -> usize {
        (self.config.refractory.as_secs_f64() * self.config.sample_rate).round() as usize
    }
}

/// Subtract a centred moving average of `width` samples.
fn detrend(data: &[f64], width: usize) -> Vec<f64> {
    let half = (width / 2).max(1);
    let mut prefix = Vec::with_capacity(data.len() + 1);
    prefix.push(0.0);
    for v in data {
        prefix.push(prefix.last().copied().unwrap_or(0.0) + v);
    }
    (0..data.len())
        .map(|i| {
            let lo = i.saturating_sub(half);
            let hi = (i + half + 1).min(data.len());
            data[i] - (prefix[hi] - prefix[lo]) / (hi - lo) as f64
        })
        .collect()
}

/// Local maxima above `threshold`, at least `refractory` samples apart; a
/// taller peak inside the refractory span replaces the previous one.
fn find_peaks(data: &[f64], threshold: f64, refractory: usize) -> Vec<usize> {
    let mut peaks: Vec<usize> = Vec::new();
    for i in 1..data.len().saturating_sub(1) {
        let v = data[i];
        if v <= threshold || v < data[i - 1] || v <= data[i + 1] {
            continue;
        }
        match peaks.last_mut() {
            Some(last) if i - *last < refractory => {
                if v > data[*last] {
                    *last = i;
                }
            }
            _ => peaks.push(i),
        }
    }
    peaks
}

fn median(mut values: Vec<f64>) -> f64 {
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}
