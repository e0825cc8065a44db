//! Adaptive audio feedback.
//!
//! | Module | Purpose |
//! |---|---|
//! | [`engine`] | Quality gate, crossfade, reward timing, session metrics |
//! | [`synth`] | Sample-level synthesis driven by [`SynthCommand`]s |
//! | [`output`] | [`AudioSink`] trait, cpal device sink and offline sink |

pub mod engine;
pub mod output;
pub mod synth;

pub use engine::{
    AdaptiveAudioEngine, AudioEngineConfig, AudioSessionMetrics, CoherenceUpdate, SignalQuality,
};
#[cfg(feature = "audio")]
pub use output::CpalSink;
pub use output::{AudioSink, OfflineSink};
pub use synth::{BinauralPreset, MovementCue, SynthCommand};
