//! In-process headset simulator.
//!
//! [`SignalGenerator`] produces the same [`TransportEvent`] stream a real
//! headset would, one packet period at a time:
//!
//! * EEG: 12 samples per channel every `12 / 256 Hz ≈ 46.9 ms`, a mix of
//!   alpha (10 Hz), beta (22 Hz) and theta (6 Hz) sinusoids plus hash noise.
//!   The **calm** control shifts power from beta to alpha, so the coherence
//!   detector can be driven end to end without hardware.
//! * Accelerometer: 3 samples per EEG packet, gravity on −z plus slow sway.
//!   [`SignalGenerator::jolt`] adds a one-packet spike on x.
//! * PPG: 6 samples every second EEG packet (64 Hz) on the infrared channel,
//!   a Gaussian pulse train at the configured heart rate.
//! * Horseshoe + battery: every 21 EEG packets (≈ 1 s).
//!
//! Outages can be scripted with [`SignalGenerator::stall`] (silence, no
//! lifecycle events) and [`SignalGenerator::drop_link`] (lost → retry →
//! back).

use std::f64::consts::PI;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::info;
use tokio::sync::{mpsc, watch};

use crate::protocol::{EEG_FREQUENCY, EEG_SAMPLES_PER_READING, ELECTRODE_COUNT, PPG_FREQUENCY, PPG_PULSE_CHANNEL};
use crate::types::{
    EegReading, ImuData, PpgReading, TelemetryData, TransportEvent, XyzSample,
};

/// Packets between horseshoe / battery reports.
const HOUSEKEEPING_EVERY: u64 = 21;

#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    pub name: String,
    /// 0 = busy mind (beta dominant) … 1 = deeply settled (alpha dominant).
    pub calm: f64,
    pub pulse_bpm: f64,
    pub battery: f32,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            name: "Muse-SIM".into(),
            calm: 0.8,
            pulse_bpm: 66.0,
            battery: 85.0,
        }
    }
}

/// One EEG sample in µV for channel `ch` at time `t`.
///
/// At `calm = 1` the alpha term dominates (±25 µV against ±3 µV beta); at
/// `calm = 0` the ratio flips (±5 µV alpha against ±14 µV beta).
pub fn sim_sample(t: f64, ch: usize, calm: f64) -> f64 {
    let calm = calm.clamp(0.0, 1.0);
    let phi = ch as f64 * PI / 2.5;
    let alpha = (5.0 + 20.0 * calm) * (2.0 * PI * 10.0 * t + phi).sin();
    let beta = (14.0 - 11.0 * calm) * (2.0 * PI * 22.0 * t + phi * 1.7).sin();
    let theta = 10.0 * (2.0 * PI * 6.0 * t + phi * 0.9).sin();
    let nx = t * 1000.7 + ch as f64 * 137.508;
    let noise = ((nx.sin() * 9973.1).fract() - 0.5) * 8.0;
    alpha + beta + theta + noise
}

/// Raw optical value at time `t`: a narrow pulse per beat on a slow
/// baseline wander.
pub fn sim_pulse(t: f64, bpm: f64) -> f64 {
    let phase = (t * bpm / 60.0).fract();
    40_000.0 + 600.0 * (-((phase - 0.2) / 0.08).powi(2)).exp() + 50.0 * (2.0 * PI * 0.25 * t).sin()
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Outage {
    None,
    /// Emit nothing for this many more packets.
    Stall(u32),
    /// Announce the loss on the next packet, then stay silent.
    Dropping(u32),
    Down(u32),
}

/// Deterministic packet source. The async wrapper in [`spawn`] just calls
/// [`SignalGenerator::next_packet`] on a timer.
#[derive(Debug, Clone)]
pub struct SignalGenerator {
    config: SimulatorConfig,
    t: f64,
    packet: u64,
    contact: [u8; ELECTRODE_COUNT],
    jolt_pending: bool,
    outage: Outage,
}

impl SignalGenerator {
    pub fn new(config: SimulatorConfig) -> Self {
        Self {
            config,
            t: 0.0,
            packet: 0,
            contact: [1; ELECTRODE_COUNT],
            jolt_pending: false,
            outage: Outage::None,
        }
    }

    /// Wall-clock spacing of [`SignalGenerator::next_packet`] calls.
    pub fn packet_interval() -> Duration {
        Duration::from_secs_f64(EEG_SAMPLES_PER_READING as f64 / EEG_FREQUENCY)
    }

    pub fn set_calm(&mut self, calm: f64) {
        self.config.calm = calm.clamp(0.0, 1.0);
    }

    pub fn calm(&self) -> f64 {
        self.config.calm
    }

    /// Horseshoe codes reported from the next housekeeping packet on.
    pub fn set_contact(&mut self, codes: [u8; ELECTRODE_COUNT]) {
        self.contact = codes;
    }

    /// Head movement on the next accelerometer packet.
    pub fn jolt(&mut self) {
        self.jolt_pending = true;
    }

    /// Go silent for `packets` periods without telling anyone.
    pub fn stall(&mut self, packets: u32) {
        self.outage = Outage::Stall(packets);
    }

    /// Report a link loss, stay down for `packets` periods, then come back.
    pub fn drop_link(&mut self, packets: u32) {
        self.outage = Outage::Dropping(packets);
    }

    /// Events for the next packet period. Simulated time always advances,
    /// so the waveform resumes at the right phase after an outage.
    pub fn next_packet(&mut self) -> Vec<TransportEvent> {
        let mut out = Vec::new();
        match self.outage {
            Outage::None => self.emit(&mut out),
            Outage::Stall(0) => {
                self.outage = Outage::None;
                self.emit(&mut out);
            }
            Outage::Stall(n) => self.outage = Outage::Stall(n - 1),
            Outage::Dropping(n) => {
                out.push(TransportEvent::LinkLost);
                out.push(TransportEvent::Reconnecting(1));
                self.outage = Outage::Down(n);
            }
            Outage::Down(0) => {
                self.outage = Outage::None;
                out.push(TransportEvent::Reconnected);
                self.emit(&mut out);
            }
            Outage::Down(n) => self.outage = Outage::Down(n - 1),
        }
        self.t += EEG_SAMPLES_PER_READING as f64 / EEG_FREQUENCY;
        self.packet += 1;
        out
    }

    fn emit(&mut self, out: &mut Vec<TransportEvent>) {
        let dt = 1.0 / EEG_FREQUENCY;
        let index = (self.packet & 0xFFFF) as u16;
        let calm = self.config.calm;

        for electrode in 0..ELECTRODE_COUNT {
            let samples = (0..EEG_SAMPLES_PER_READING)
                .map(|i| sim_sample(self.t + i as f64 * dt, electrode, calm))
                .collect();
            out.push(TransportEvent::Eeg(EegReading {
                index,
                electrode,
                samples,
            }));
        }

        let t = self.t;
        let sway = |k: f64| XyzSample::new(
            (0.01 * (2.0 * PI * 0.3 * (t + k)).sin()) as f32,
            (0.02 * (2.0 * PI * 0.5 * (t + k)).cos()) as f32,
            (-1.0 + 0.005 * (2.0 * PI * 0.1 * (t + k)).sin()) as f32,
        );
        let mut samples: Vec<XyzSample> = (0..3).map(|k| sway(k as f64 * 0.019)).collect();
        if std::mem::take(&mut self.jolt_pending) {
            for s in &mut samples {
                s.x += 0.6;
            }
        }
        out.push(TransportEvent::Accelerometer(ImuData {
            sequence_id: index,
            samples,
        }));

        if self.packet % 2 == 0 {
            let pdt = 1.0 / PPG_FREQUENCY;
            out.push(TransportEvent::Ppg(PpgReading {
                index,
                ppg_channel: PPG_PULSE_CHANNEL,
                samples: (0..6)
                    .map(|i| sim_pulse(self.t + i as f64 * pdt, self.config.pulse_bpm))
                    .collect(),
            }));
        }

        if self.packet % HOUSEKEEPING_EVERY == 0 {
            out.push(TransportEvent::Horseshoe(self.contact));
            out.push(TransportEvent::Telemetry(TelemetryData {
                sequence_id: index,
                battery_level: (self.config.battery - self.t as f32 / 300.0).clamp(0.0, 100.0),
                fuel_gauge_voltage: 0.0,
                temperature: 0,
            }));
        }
    }
}

// ── Async wrapper ────────────────────────────────────────────────────────────

/// Control handle for a running simulator.
pub struct SimulatorHandle {
    generator: Arc<Mutex<SignalGenerator>>,
    shutdown: watch::Sender<bool>,
    name: String,
}

impl SimulatorHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `f` against the live generator.
    pub fn control<R>(&self, f: impl FnOnce(&mut SignalGenerator) -> R) -> Option<R> {
        self.generator.lock().ok().map(|mut g| f(&mut g))
    }

    pub fn set_calm(&self, calm: f64) {
        self.control(|g| g.set_calm(calm));
    }

    pub fn jolt(&self) {
        self.control(SignalGenerator::jolt);
    }

    pub fn disconnect(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Start the generator on a timer and return its event stream.
pub fn spawn(config: SimulatorConfig) -> (mpsc::Receiver<TransportEvent>, SimulatorHandle) {
    let name = config.name.clone();
    let generator = Arc::new(Mutex::new(SignalGenerator::new(config)));
    let (tx, rx) = mpsc::channel::<TransportEvent>(256);
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let task_gen = Arc::clone(&generator);
    let task_name = name.clone();
    tokio::spawn(async move {
        info!("simulator {task_name}: streaming");
        if tx.send(TransportEvent::Connected(task_name.clone())).await.is_err() {
            return;
        }
        let mut ticker = tokio::time::interval(SignalGenerator::packet_interval());
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = ticker.tick() => {
                    let events = match task_gen.lock() {
                        Ok(mut g) => g.next_packet(),
                        Err(_) => break,
                    };
                    for event in events {
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
        let _ = tx.send(TransportEvent::Disconnected).await;
        info!("simulator {task_name}: stopped");
    });

    (
        rx,
        SimulatorHandle {
            generator,
            shutdown: shutdown_tx,
            name,
        },
    )
}
