//! # muse-coherence
//!
//! Real-time coherence detection and adaptive audio feedback for
//! [Interaxon Muse](https://choosemuse.com/) EEG headbands.
//!
//! ```text
//! BLE / OSC / simulator ─► TelemetryAdapter ─► CoherencePipeline ─► AdaptiveAudioEngine
//!                               │                (detector, scorer)
//!                               └─ accelerometer ─► MovementWatcher ─► movement cues
//! ```
//!
//! ## Transports
//!
//! | Transport | Entry point | Notes |
//! |---|---|---|
//! | BLE | [`telemetry::TelemetryAdapter::connect_primary`] | Muse 2 / Muse S classic firmware, PPG on |
//! | OSC bridge | [`telemetry::TelemetryAdapter::connect_bridge`] | `/muse/eeg`, `/muse/acc`, `/muse/ppg`, … over UDP |
//! | Simulator | [`telemetry::TelemetryAdapter::connect_simulated`] | no hardware; calm level and jolts are scriptable |
//!
//! ## Quick start
//!
//! ```no_run
//! use std::time::Instant;
//! use muse_coherence::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut adapter = TelemetryAdapter::default();
//!     adapter.connect_simulated().await?;
//!
//!     let mut pipeline = CoherencePipeline::default();
//!     let mut ticker = tokio::time::interval(std::time::Duration::from_millis(250));
//!     loop {
//!         ticker.tick().await;
//!         if let Some(tick) = pipeline.poll(&adapter.get_state(), Instant::now()) {
//!             println!("{:.2} {:?} active={}", tick.score, tick.zone, tick.status.is_active);
//!         }
//!     }
//! }
//! ```
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`prelude`] | One-line glob import of the most commonly needed types |
//! | [`telemetry`] | Transport lifecycle, band smoothing, contact, motion, the published snapshot |
//! | [`muse_client`] | BLE scanning, connecting, reconnecting, and the [`muse_client::MuseHandle`] command API |
//! | [`bridge`] | OSC/UDP relay transport |
//! | [`simulator`] | Synthetic headset |
//! | [`spectral`] | FFT band powers, EMA smoothing, dB conversion |
//! | [`ppg`] | Heart rate from the optical channel |
//! | [`health`] | Connection-health state machine |
//! | [`detector`] | Sustained-coherence detector with asymmetric hysteresis |
//! | [`scorer`] | Continuous coherence score and zones |
//! | [`movement`] | Head-movement events from the accelerometer |
//! | [`pipeline`] | Rate-limited tick tying detector, scorer and audio together |
//! | [`audio`] | Adaptive audio engine, synthesis and output sinks |
//! | [`types`] | Readings and transport events |
//! | [`protocol`] | GATT UUIDs, sampling constants, and BLE wire-format helpers |
//! | [`parse`] | Low-level byte-to-sample decoders for EEG, IMU and PPG packets |
//! | [`error`] | Error types |

pub mod audio;
pub mod bridge;
pub mod detector;
pub mod error;
pub mod health;
pub mod movement;
pub mod muse_client;
pub mod parse;
pub mod pipeline;
pub mod ppg;
pub mod protocol;
pub mod scorer;
pub mod simulator;
pub mod spectral;
pub mod telemetry;
pub mod types;

// ── Prelude ───────────────────────────────────────────────────────────────────

/// Convenience re-exports for downstream crates.
pub mod prelude {
    // ── Acquisition ───────────────────────────────────────────────────────────
    pub use crate::health::ConnectionHealthState;
    pub use crate::ppg::PpgMetrics;
    pub use crate::spectral::{BandSet, BrainwaveBands};
    pub use crate::telemetry::{AdapterConfig, TelemetryAdapter, TelemetrySnapshot};
    pub use crate::types::{AccelSample, ElectrodeQuality, XyzSample};

    // ── Coherence ─────────────────────────────────────────────────────────────
    pub use crate::detector::{CoherenceDetector, CoherenceDetectorConfig, CoherenceStatus, Sensitivity};
    pub use crate::pipeline::{CoherencePipeline, PipelineConfig, TickOutput};
    pub use crate::scorer::{calculate_coherence, coherence_zone, CoherenceZone};

    // ── Movement and audio ────────────────────────────────────────────────────
    pub use crate::audio::{
        AdaptiveAudioEngine, AudioEngineConfig, AudioSessionMetrics, AudioSink, BinauralPreset,
        CoherenceUpdate, MovementCue, OfflineSink,
    };
    pub use crate::movement::{MovementConfig, MovementDetector, MovementEvent, MovementWatcher};

    // ── Errors ────────────────────────────────────────────────────────────────
    pub use crate::error::{AudioInitError, ConfigError, ConnectionError};
}
