//! Headless coherence session.
//!
//! ```text
//! muse-coherence                      # scan for a Muse over BLE
//! muse-coherence --simulate           # built-in signal generator
//! muse-coherence --bridge 0.0.0.0:5000  # OSC relay (e.g. Mind Monitor)
//!
//! --sensitivity X   0 = strict … 1 = easy (default 0.5)
//! --json            one JSON object per tick on stdout
//! --no-audio        keep the engine running against the offline sink
//! ```

use std::io::{self, BufRead};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use log::{info, warn};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use muse_coherence::audio::{
    AdaptiveAudioEngine, AudioEngineConfig, AudioSessionMetrics, AudioSink, BinauralPreset,
    OfflineSink,
};
use muse_coherence::detector::Sensitivity;
use muse_coherence::health::{ConnectionHealthState, LinkStatus};
use muse_coherence::movement::{MovementConfig, MovementWatcher};
use muse_coherence::pipeline::{CoherencePipeline, PipelineConfig, TickOutput};
use muse_coherence::telemetry::{TelemetryAdapter, TransportHandle};

const FRAME: Duration = Duration::from_millis(16);
const OFFLINE_SAMPLE_RATE: u32 = 48_000;

enum Source {
    Ble,
    Bridge(String),
    Simulated,
}

struct Args {
    source: Source,
    sensitivity: Sensitivity,
    json: bool,
    no_audio: bool,
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        source: Source::Ble,
        sensitivity: Sensitivity::default(),
        json: false,
        no_audio: false,
    };
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--simulate" => args.source = Source::Simulated,
            "--bridge" => {
                let addr = it.next().context("--bridge needs an address, e.g. 0.0.0.0:5000")?;
                args.source = Source::Bridge(addr);
            }
            "--sensitivity" => {
                let raw = it.next().context("--sensitivity needs a value in [0, 1]")?;
                args.sensitivity = parse_sensitivity(&raw)?;
            }
            "--json" => args.json = true,
            "--no-audio" => args.no_audio = true,
            other => bail!("unknown argument '{other}'"),
        }
    }
    Ok(args)
}

fn parse_sensitivity(raw: &str) -> Result<Sensitivity> {
    let value: f64 = raw.parse().with_context(|| format!("bad sensitivity '{raw}'"))?;
    Ok(Sensitivity::new(value)?)
}

#[cfg(feature = "audio")]
fn open_sink(no_audio: bool) -> Box<dyn AudioSink> {
    if no_audio {
        Box::new(OfflineSink::new(OFFLINE_SAMPLE_RATE))
    } else {
        Box::new(muse_coherence::audio::CpalSink::new())
    }
}

#[cfg(not(feature = "audio"))]
fn open_sink(_no_audio: bool) -> Box<dyn AudioSink> {
    Box::new(OfflineSink::new(OFFLINE_SAMPLE_RATE))
}

fn parse_preset(name: &str) -> Option<BinauralPreset> {
    match name {
        "delta" => Some(BinauralPreset::Delta),
        "theta" => Some(BinauralPreset::Theta),
        "alpha" => Some(BinauralPreset::Alpha),
        "beta" => Some(BinauralPreset::Beta),
        _ => None,
    }
}

#[derive(Serialize)]
struct Summary {
    audio: AudioSessionMetrics,
    packets_received: u64,
    packets_dropped: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ───────────────────────────────────────────────────────────────
    // RUST_LOG=muse_coherence=debug for per-packet detail.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = parse_args()?;

    // ── Audio ─────────────────────────────────────────────────────────────────
    let mut engine = AdaptiveAudioEngine::new(open_sink(args.no_audio), AudioEngineConfig::default());
    if let Err(e) = engine.init() {
        warn!("audio unavailable ({e}); continuing silent");
        let silent: Box<dyn AudioSink> = Box::new(OfflineSink::new(OFFLINE_SAMPLE_RATE));
        engine = AdaptiveAudioEngine::new(silent, AudioEngineConfig::default());
        engine.init()?;
    }
    engine.set_difficulty_preset(args.sensitivity);

    // ── Connect ───────────────────────────────────────────────────────────────
    let mut adapter = TelemetryAdapter::default();
    match &args.source {
        Source::Simulated => adapter.connect_simulated().await?,
        Source::Bridge(addr) => {
            info!("Waiting for OSC on {addr} …");
            adapter.connect_bridge(addr).await?
        }
        Source::Ble => {
            info!("Connecting to Muse headset …");
            adapter.connect_primary().await?
        }
    }

    let mut pipeline = CoherencePipeline::new(PipelineConfig {
        sensitivity: args.sensitivity,
        ..Default::default()
    });

    // Cues must be played from this task; the watcher only forwards.
    let (cue_tx, mut cue_rx) = mpsc::unbounded_channel();
    let watcher = MovementWatcher::start(
        adapter.subscribe_accelerometer(),
        MovementConfig::default(),
        move |event| {
            let _ = cue_tx.send(event);
        },
    );

    engine.start_session()?;
    info!("Session started. Ctrl-C or 'q' + Enter to quit.");
    info!("Commands: s <0..1> sensitivity · e entrainment · b <preset> · v <0..1> volume");
    info!("          p / r pause / resume (BLE) · calm <0..1> · jolt (simulator)");

    // ── Stdin command relay ───────────────────────────────────────────────────
    // A dedicated OS thread owns the blocking stdin lock.
    let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
    std::thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if line_tx.send(line.trim().to_owned()).is_err() {
                break;
            }
        }
    });

    // ── Main loop ─────────────────────────────────────────────────────────────
    let mut frame = tokio::time::interval(FRAME);
    frame.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut entrainment = false;
    let mut last_health: Option<ConnectionHealthState> = None;

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupted.");
                break;
            }
            Some(event) = cue_rx.recv() => {
                let cue = engine.play_movement_cue();
                info!("movement {:.2} g on {:?} → {:?}", event.delta, event.axis, cue);
            }
            Some(line) = line_rx.recv() => {
                let mut words = line.split_whitespace();
                match (words.next(), words.next()) {
                    (None, _) => {}
                    (Some("q"), _) => break,
                    (Some("s"), Some(v)) => match parse_sensitivity(v) {
                        Ok(s) => {
                            pipeline.set_sensitivity(s);
                            engine.set_difficulty_preset(s);
                            info!("sensitivity {:.2}", s.value());
                        }
                        Err(e) => warn!("{e}"),
                    },
                    (Some("e"), _) => {
                        entrainment = !entrainment;
                        engine.set_entrainment_enabled(entrainment);
                        info!("entrainment {}", if entrainment { "on" } else { "off" });
                    }
                    (Some("b"), Some(name)) => match parse_preset(name) {
                        Some(p) => engine.set_binaural_preset(p),
                        None => warn!("presets: delta, theta, alpha, beta"),
                    },
                    (Some("v"), Some(v)) => match v.parse::<f64>() {
                        Ok(x) => engine.set_volume(x),
                        Err(e) => warn!("volume: {e}"),
                    },
                    (Some(cmd @ ("p" | "r")), _) => match adapter.transport() {
                        Some(TransportHandle::Ble(h)) => {
                            let res = if cmd == "p" { h.pause().await } else { h.resume().await };
                            if let Err(e) = res {
                                warn!("{e}");
                            }
                        }
                        _ => warn!("pause / resume needs a BLE headset"),
                    },
                    (Some("calm"), Some(v)) => match (adapter.simulator(), v.parse::<f64>()) {
                        (Some(sim), Ok(x)) => sim.set_calm(x),
                        _ => warn!("usage: calm <0..1> (simulator only)"),
                    },
                    (Some("jolt"), _) => match adapter.simulator() {
                        Some(sim) => sim.jolt(),
                        None => warn!("jolt needs the simulator"),
                    },
                    (Some(other), _) => warn!("unknown command '{other}'"),
                }
            }
            _ = frame.tick() => {
                let snapshot = adapter.get_state();
                let now = Instant::now();
                let health = snapshot.health_at(now);
                if last_health != Some(health) {
                    info!("connection: {}", health.label());
                    last_health = Some(health);
                }
                if snapshot.health.link() == LinkStatus::Closed {
                    warn!("transport closed: {}", snapshot.last_error.as_deref().unwrap_or("retries exhausted"));
                    break;
                }
                if let Some(tick) = pipeline.poll(&snapshot, now) {
                    engine.update_coherence(&tick.audio, tick.dt);
                    report(&tick, args.json)?;
                }
            }
        }
    }

    // ── Teardown ──────────────────────────────────────────────────────────────
    watcher.stop();
    let state = adapter.get_state();
    let summary = Summary {
        audio: engine.stop_session(),
        packets_received: state.packets_received,
        packets_dropped: state.packets_dropped,
    };
    engine.shutdown();
    adapter.disconnect().await;

    if args.json {
        println!("{}", serde_json::to_string(&summary)?);
    } else {
        info!(
            "Session: {:.1} s in coherence, {} rewards, {} movement cues, {} packets ({} dropped)",
            summary.audio.total_coherence_audio_time_ms / 1000.0,
            summary.audio.rewards,
            summary.audio.movement_cues,
            summary.packets_received,
            summary.packets_dropped,
        );
    }
    Ok(())
}

fn report(tick: &TickOutput, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(tick)?);
    } else {
        println!(
            "[{:<12}] score={:.2} {:<11} active={:<5} held={:>6.0} ms  ratio={:.2}  contact={:.2}",
            tick.health.label(),
            tick.score,
            format!("{:?}", tick.zone),
            tick.status.is_active,
            tick.status.sustained_ms,
            tick.status.beta_alpha_ratio,
            tick.contact_quality,
        );
    }
    Ok(())
}
