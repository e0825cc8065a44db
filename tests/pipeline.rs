//! Simulated headset → telemetry processing → coherence pipeline → audio
//! engine, on a synthetic clock.

use std::time::{Duration, Instant};

use muse_coherence::prelude::*;
use muse_coherence::simulator::{SignalGenerator, SimulatorConfig};
use muse_coherence::telemetry::SignalProcessor;
use muse_coherence::types::{TransportEvent, TransportKind};

struct Rig {
    generator: SignalGenerator,
    processor: SignalProcessor,
    pipeline: CoherencePipeline,
    engine: AdaptiveAudioEngine<OfflineSink>,
    movement: MovementDetector,
    movements: Vec<MovementEvent>,
    ticks: Vec<TickOutput>,
    now: Instant,
}

impl Rig {
    fn new(calm: f64) -> Self {
        let now = Instant::now();
        let mut processor = SignalProcessor::new(&AdapterConfig::default(), 1, TransportKind::Simulated);
        processor.ingest(TransportEvent::Connected("Muse-SIM".into()), now);
        let mut engine =
            AdaptiveAudioEngine::new(OfflineSink::new(8_000).recording(), AudioEngineConfig::default());
        engine.init().unwrap();
        engine.start_session().unwrap();
        Self {
            generator: SignalGenerator::new(SimulatorConfig {
                calm,
                ..Default::default()
            }),
            processor,
            pipeline: CoherencePipeline::default(),
            engine,
            movement: MovementDetector::new(MovementConfig::default()),
            movements: Vec::new(),
            ticks: Vec::new(),
            now,
        }
    }

    /// One iteration of the polling loop per simulated packet.
    fn run(&mut self, secs: f64) {
        let step = SignalGenerator::packet_interval();
        for _ in 0..(secs / step.as_secs_f64()).round() as usize {
            for event in self.generator.next_packet() {
                for sample in self.processor.ingest(event, self.now) {
                    if let Some(m) = self.movement.process(sample) {
                        self.engine.play_movement_cue();
                        self.movements.push(m);
                    }
                }
            }
            if let Some(tick) = self.pipeline.poll(&self.processor.snapshot(), self.now) {
                self.engine.update_coherence(&tick.audio, tick.dt);
                self.ticks.push(tick);
            }
            self.now += step;
        }
    }

    fn last(&self) -> &TickOutput {
        self.ticks.last().expect("at least one tick")
    }
}

#[test]
fn calm_session_reaches_flow_and_rewards() {
    let mut rig = Rig::new(0.95);
    rig.run(20.0);

    let last = rig.last();
    assert!(last.status.is_active, "{:?}", last.status);
    assert_eq!(last.zone, CoherenceZone::Flow);
    assert_eq!(last.health, ConnectionHealthState::Healthy);

    let metrics = rig.engine.coherence_metrics();
    assert!(metrics.total_coherence_audio_time_ms > 5_000.0, "{metrics:?}");
    assert!(metrics.rewards >= 1);
    assert_eq!(metrics.held_time_ms, 0.0);
    assert!(rig.engine.crossfade_position() > rig.engine.coherence_threshold());

    let audio = rig.engine.sink_mut().render(2_000);
    assert!(audio.iter().all(|s| s.is_finite() && s.abs() <= 0.98));
    assert!(audio.iter().any(|s| s.abs() > 1e-4));
}

#[test]
fn busy_mind_never_activates() {
    let mut rig = Rig::new(0.0);
    rig.run(15.0);

    assert!(rig.ticks.iter().all(|t| !t.status.is_active));
    assert_ne!(rig.last().zone, CoherenceZone::Flow);
    assert_eq!(rig.engine.coherence_metrics().total_coherence_audio_time_ms, 0.0);
    assert_eq!(rig.engine.coherence_metrics().rewards, 0);
}

#[test]
fn stalled_stream_holds_audio() {
    let mut rig = Rig::new(0.95);
    rig.run(12.0);
    rig.generator.stall(100);

    rig.run(2.5);
    assert_eq!(rig.last().health, ConnectionHealthState::Stalled);
    let held_at = rig.engine.crossfade_position();
    let held_ms = rig.engine.coherence_metrics().held_time_ms;
    assert!(held_ms > 0.0);

    rig.run(2.0);
    assert_eq!(rig.engine.crossfade_position(), held_at);
    assert!(rig.engine.coherence_metrics().held_time_ms > held_ms);
}

#[test]
fn head_jolt_plays_one_cue() {
    let mut rig = Rig::new(0.8);
    rig.run(3.0);
    assert!(rig.movements.is_empty());

    rig.generator.jolt();
    rig.run(0.5);
    assert_eq!(rig.movements.len(), 1);
    assert!(rig.movements[0].delta > 0.3);
    assert_eq!(rig.engine.coherence_metrics().movement_cues, 1);
    assert!(rig
        .engine
        .sink()
        .history()
        .contains(&muse_coherence::audio::SynthCommand::TriggerCue(MovementCue::Chime)));
}

#[test]
fn new_session_resets_and_gates() {
    let mut rig = Rig::new(0.95);
    rig.run(10.0);
    assert!(rig.last().status.sustained_ms > 0.0);
    let crossfade = rig.engine.crossfade_position();

    // What the adapter publishes right after `disconnect`.
    let neutral = TelemetrySnapshot {
        session: 2,
        ..Default::default()
    };
    let tick = rig
        .pipeline
        .poll(&neutral, rig.now + Duration::from_millis(300))
        .expect("new session ticks at once");
    assert_eq!(tick.status.sustained_ms, 0.0);
    assert!(!tick.status.is_active);
    assert_eq!(tick.score, 0.0);
    assert!(!rig.engine.update_coherence(&tick.audio, tick.dt));
    assert_eq!(rig.engine.crossfade_position(), crossfade);
}
