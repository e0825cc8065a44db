//! Telemetry adapter: one live transport in, one atomic snapshot out.
//!
//! ```text
//!  transport task ──TransportEvent──► intake task ──► SignalProcessor
//!                                                        │
//!                        watch::Sender<TelemetrySnapshot>◄┘──► broadcast<AccelSample>
//! ```
//!
//! The intake task is the only writer of the snapshot. Every publish is
//! guarded by a session id, so once [`TelemetryAdapter::disconnect`] has
//! installed the neutral snapshot a late event from the old session cannot
//! overwrite it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::bridge::{self, BridgeConfig, BridgeHandle};
use crate::error::ConnectionError;
use crate::health::{ConnectionHealthState, HealthMonitor, LinkStatus};
use crate::muse_client::{MuseClient, MuseClientConfig, MuseHandle};
use crate::ppg::{PpgAnalyzer, PpgConfig, PpgMetrics};
use crate::protocol::{ELECTRODE_COUNT, PPG_PULSE_CHANNEL};
use crate::scorer::electrode_confidence;
use crate::simulator::{self, SimulatorConfig, SimulatorHandle};
use crate::spectral::{BandConfig, BandSet, BandTracker};
use crate::types::{
    electrode_qualities, AccelSample, ElectrodeQuality, TransportEvent, TransportKind, XyzSample,
    CONTACT_OFF,
};

/// Sample-to-sample accelerometer change that reads as full motion, in g.
const MOTION_FULL_SCALE_G: f64 = 0.25;
/// Release factor per accelerometer sample (~0.4 s at 52 Hz).
const MOTION_RELEASE: f64 = 0.05;

// ── Config ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AdapterConfig {
    pub bands: BandConfig,
    pub ppg: PpgConfig,
    pub staleness_window: Duration,
    pub ble: MuseClientConfig,
    /// `bind_address` is replaced by the argument of `connect_bridge`.
    pub bridge: BridgeConfig,
    pub simulator: SimulatorConfig,
    /// Accelerometer fan-out buffer; slow subscribers lag rather than block.
    pub accel_capacity: usize,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            bands: BandConfig::default(),
            ppg: PpgConfig::default(),
            staleness_window: crate::health::DEFAULT_STALENESS_WINDOW,
            ble: MuseClientConfig::default(),
            bridge: BridgeConfig::default(),
            simulator: SimulatorConfig::default(),
            accel_capacity: 256,
        }
    }
}

// ── Snapshot ─────────────────────────────────────────────────────────────────

/// Everything the adapter knows, published whole.
#[derive(Debug, Clone)]
pub struct TelemetrySnapshot {
    /// Changes on every connect and disconnect.
    pub session: u64,
    pub transport: Option<TransportKind>,
    pub device_name: Option<String>,
    pub bands: BandSet,
    /// Raw horseshoe codes, TP9, AF7, AF8, TP10.
    pub electrodes: [u8; ELECTRODE_COUNT],
    pub battery: Option<f32>,
    /// Smoothed head motion, 0 (still) … 1.
    pub motion_level: f64,
    pub accel: Option<XyzSample>,
    pub ppg: PpgMetrics,
    pub health: HealthMonitor,
    pub packets_received: u64,
    pub packets_dropped: u64,
    pub last_error: Option<String>,
}

impl Default for TelemetrySnapshot {
    fn default() -> Self {
        Self {
            session: 0,
            transport: None,
            device_name: None,
            bands: BandSet::default(),
            electrodes: [CONTACT_OFF; ELECTRODE_COUNT],
            battery: None,
            motion_level: 0.0,
            accel: None,
            ppg: PpgMetrics::default(),
            health: HealthMonitor::default(),
            packets_received: 0,
            packets_dropped: 0,
            last_error: None,
        }
    }
}

impl TelemetrySnapshot {
    pub fn health_at(&self, now: Instant) -> ConnectionHealthState {
        self.health.state_at(now)
    }

    pub fn electrode_quality(&self) -> [ElectrodeQuality; ELECTRODE_COUNT] {
        electrode_qualities(&self.electrodes)
    }

    /// Mean contact weight, 0 … 1.
    pub fn contact_quality(&self) -> f64 {
        electrode_confidence(&self.electrode_quality())
    }

    pub fn since_last_packet(&self, now: Instant) -> Option<Duration> {
        self.health.since_last_packet(now)
    }
}

/// Connection status for a status line or diagnostics view.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionDetail {
    pub health: ConnectionHealthState,
    pub transport: Option<TransportKind>,
    pub device_name: Option<String>,
    pub reconnect_attempt: Option<u32>,
    pub packets_received: u64,
    pub packets_dropped: u64,
    pub since_last_packet: Option<Duration>,
    pub battery: Option<f32>,
    pub last_error: Option<String>,
}

// ── SignalProcessor ──────────────────────────────────────────────────────────

/// Map a channel's rolling amplitude spread (µV std) to a contact code.
///
/// A flat channel is not touching skin; a huge one is swinging on a loose
/// electrode.
pub fn contact_code_from_spread(spread: Option<f64>) -> u8 {
    match spread {
        Some(s) if !s.is_finite() || s < 1.0 => CONTACT_OFF,
        Some(s) if s <= 40.0 => 1,
        Some(s) if s <= 80.0 => 2,
        Some(s) if s <= 150.0 => 3,
        _ => CONTACT_OFF,
    }
}

/// Synchronous per-event processing behind the intake task.
pub struct SignalProcessor {
    session: u64,
    transport: TransportKind,
    device_name: Option<String>,
    bands: BandTracker,
    ppg: PpgAnalyzer,
    health: HealthMonitor,
    electrodes: [u8; ELECTRODE_COUNT],
    /// Once the transport reports contact itself, spreads are ignored.
    horseshoe_seen: bool,
    battery: Option<f32>,
    motion_level: f64,
    last_accel: Option<XyzSample>,
    packets_received: u64,
    packets_dropped: u64,
}

impl SignalProcessor {
    pub fn new(config: &AdapterConfig, session: u64, transport: TransportKind) -> Self {
        Self {
            session,
            transport,
            device_name: None,
            bands: BandTracker::new(config.bands.clone()),
            ppg: PpgAnalyzer::new(config.ppg.clone()),
            health: HealthMonitor::new(config.staleness_window),
            electrodes: [CONTACT_OFF; ELECTRODE_COUNT],
            horseshoe_seen: false,
            battery: None,
            motion_level: 0.0,
            last_accel: None,
            packets_received: 0,
            packets_dropped: 0,
        }
    }

    /// Fold one event into the state. Returns the accelerometer samples to
    /// fan out, stamped `now`.
    pub fn ingest(&mut self, event: TransportEvent, now: Instant) -> Vec<AccelSample> {
        let mut fanout = Vec::new();
        if event.is_packet() {
            self.health.on_packet(now);
            self.packets_received += 1;
        }
        match event {
            TransportEvent::Connected(name) => {
                info!("{name}: connected ({:?})", self.transport);
                self.device_name = Some(name);
                self.health.on_connected(now);
            }
            TransportEvent::Eeg(reading) => {
                self.bands.push(reading.electrode, &reading.samples);
                if !self.horseshoe_seen {
                    let spreads = self.bands.spreads();
                    self.electrodes = spreads.map(contact_code_from_spread);
                }
            }
            TransportEvent::Ppg(reading) => {
                if reading.ppg_channel == PPG_PULSE_CHANNEL {
                    self.ppg.push(&reading.samples);
                }
            }
            TransportEvent::Accelerometer(imu) => {
                for xyz in imu.samples {
                    self.track_motion(xyz);
                    fanout.push(AccelSample { at: now, xyz });
                }
            }
            TransportEvent::Telemetry(t) => self.battery = Some(t.battery_level),
            TransportEvent::Horseshoe(codes) => {
                self.horseshoe_seen = true;
                self.electrodes = codes;
            }
            TransportEvent::Malformed(e) => {
                self.packets_dropped += 1;
                if self.packets_dropped <= 5 || self.packets_dropped % 500 == 0 {
                    debug!("dropped packet #{}: {e}", self.packets_dropped);
                }
            }
            TransportEvent::LinkLost => {
                info!("link lost, transport is retrying");
                self.health.on_link_lost();
            }
            TransportEvent::Reconnecting(attempt) => {
                info!("reconnect attempt {attempt}");
                self.health.on_reconnect_attempt(attempt);
            }
            TransportEvent::Reconnected => {
                info!("link re-established");
                self.health.on_reconnected(now);
                // Windows spanning the gap would transform a discontinuity.
                self.bands.reset();
                self.ppg.reset();
                self.last_accel = None;
                self.motion_level = 0.0;
            }
            TransportEvent::Disconnected => {
                info!("transport closed");
                self.health.on_closed();
            }
        }
        fanout
    }

    /// Envelope follower over sample-to-sample change: instant attack,
    /// exponential release.
    fn track_motion(&mut self, xyz: XyzSample) {
        if let Some(prev) = self.last_accel {
            let change = (xyz.distance(&prev) as f64 / MOTION_FULL_SCALE_G).min(1.0);
            if change > self.motion_level {
                self.motion_level = change;
            } else if change.is_finite() {
                self.motion_level += MOTION_RELEASE * (change - self.motion_level);
            }
        }
        self.last_accel = Some(xyz);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            session: self.session,
            transport: Some(self.transport),
            device_name: self.device_name.clone(),
            bands: self.bands.bands(),
            electrodes: self.electrodes,
            battery: self.battery,
            motion_level: self.motion_level.clamp(0.0, 1.0),
            accel: self.last_accel,
            ppg: self.ppg.metrics(),
            health: self.health,
            packets_received: self.packets_received,
            packets_dropped: self.packets_dropped,
            last_error: None,
        }
    }
}

// ── Transport handles ────────────────────────────────────────────────────────

/// Whichever transport is live.
pub enum TransportHandle {
    Ble(MuseHandle),
    Bridge(BridgeHandle),
    Simulated(SimulatorHandle),
}

impl TransportHandle {
    pub fn name(&self) -> &str {
        match self {
            Self::Ble(h) => h.name(),
            Self::Bridge(h) => h.name(),
            Self::Simulated(h) => h.name(),
        }
    }

    pub async fn close(&self) {
        match self {
            Self::Ble(h) => {
                if let Err(e) = h.disconnect().await {
                    warn!("BLE disconnect: {e}");
                }
            }
            Self::Bridge(h) => h.disconnect(),
            Self::Simulated(h) => h.disconnect(),
        }
    }
}

struct LiveSession {
    transport: TransportHandle,
    intake: JoinHandle<()>,
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        self.intake.abort();
    }
}

// ── TelemetryAdapter ─────────────────────────────────────────────────────────

pub struct TelemetryAdapter {
    config: AdapterConfig,
    state: Arc<watch::Sender<TelemetrySnapshot>>,
    accel_tx: broadcast::Sender<AccelSample>,
    session: Arc<AtomicU64>,
    live: Option<LiveSession>,
}

impl TelemetryAdapter {
    pub fn new(config: AdapterConfig) -> Self {
        let (state, _) = watch::channel(TelemetrySnapshot::default());
        let (accel_tx, _) = broadcast::channel(config.accel_capacity.max(1));
        Self {
            config,
            state: Arc::new(state),
            accel_tx,
            session: Arc::new(AtomicU64::new(0)),
            live: None,
        }
    }

    /// Direct BLE link to the first matching headset.
    pub async fn connect_primary(&mut self) -> Result<(), ConnectionError> {
        self.disconnect().await;
        let client = MuseClient::new(self.config.ble.clone());
        let (rx, handle) = client.connect().await.map_err(|e| self.note_failure(e))?;
        self.start(rx, TransportHandle::Ble(handle), TransportKind::Ble);
        Ok(())
    }

    /// OSC relay listening on `address`.
    pub async fn connect_bridge(&mut self, address: &str) -> Result<(), ConnectionError> {
        self.disconnect().await;
        let config = BridgeConfig {
            bind_address: address.to_owned(),
            ..self.config.bridge.clone()
        };
        let (rx, handle) = bridge::connect(config).await.map_err(|e| self.note_failure(e))?;
        self.start(rx, TransportHandle::Bridge(handle), TransportKind::Bridge);
        Ok(())
    }

    /// In-process simulator. Never fails; the `Result` keeps the connect
    /// calls interchangeable.
    pub async fn connect_simulated(&mut self) -> Result<(), ConnectionError> {
        self.disconnect().await;
        let (rx, handle) = simulator::spawn(self.config.simulator.clone());
        self.start(rx, TransportHandle::Simulated(handle), TransportKind::Simulated);
        Ok(())
    }

    fn note_failure(&self, e: ConnectionError) -> ConnectionError {
        warn!("connect failed: {e}");
        let text = e.to_string();
        self.state.send_modify(|s| s.last_error = Some(text));
        e
    }

    fn start(&mut self, rx: mpsc::Receiver<TransportEvent>, transport: TransportHandle, kind: TransportKind) {
        let session = self.session.fetch_add(1, Ordering::AcqRel) + 1;
        let processor = SignalProcessor::new(&self.config, session, kind);
        self.state.send_replace(processor.snapshot());
        let intake = tokio::spawn(intake(
            rx,
            processor,
            Arc::clone(&self.session),
            Arc::clone(&self.state),
            self.accel_tx.clone(),
        ));
        self.live = Some(LiveSession { transport, intake });
    }

    /// Neutral state is visible before this first yields; the transport is
    /// torn down afterwards.
    pub async fn disconnect(&mut self) {
        let session = self.session.fetch_add(1, Ordering::AcqRel) + 1;
        self.state.send_replace(TelemetrySnapshot {
            session,
            ..Default::default()
        });
        if let Some(live) = self.live.take() {
            live.intake.abort();
            info!("disconnecting {}", live.transport.name());
            live.transport.close().await;
        }
    }

    pub fn is_live(&self) -> bool {
        self.live.is_some()
    }

    pub fn transport(&self) -> Option<&TransportHandle> {
        self.live.as_ref().map(|l| &l.transport)
    }

    /// The running simulator, when `connect_simulated` is live.
    pub fn simulator(&self) -> Option<&SimulatorHandle> {
        match self.transport() {
            Some(TransportHandle::Simulated(h)) => Some(h),
            _ => None,
        }
    }

    pub fn get_state(&self) -> TelemetrySnapshot {
        self.state.borrow().clone()
    }

    /// Receiver that sees every published snapshot.
    pub fn watch_state(&self) -> watch::Receiver<TelemetrySnapshot> {
        self.state.subscribe()
    }

    pub fn get_electrode_quality(&self) -> [u8; ELECTRODE_COUNT] {
        self.state.borrow().electrodes
    }

    pub fn get_health_state(&self) -> ConnectionHealthState {
        self.state.borrow().health_at(Instant::now())
    }

    pub fn get_ppg(&self) -> PpgMetrics {
        self.state.borrow().ppg
    }

    pub fn get_connection_state_detail(&self) -> ConnectionDetail {
        let now = Instant::now();
        let s = self.state.borrow();
        ConnectionDetail {
            health: s.health_at(now),
            transport: s.transport,
            device_name: s.device_name.clone(),
            reconnect_attempt: match s.health.link() {
                LinkStatus::Retrying { attempt } => Some(attempt),
                _ => None,
            },
            packets_received: s.packets_received,
            packets_dropped: s.packets_dropped,
            since_last_packet: s.since_last_packet(now),
            battery: s.battery,
            last_error: s.last_error.clone(),
        }
    }

    pub fn subscribe_accelerometer(&self) -> broadcast::Receiver<AccelSample> {
        self.accel_tx.subscribe()
    }
}

impl Default for TelemetryAdapter {
    fn default() -> Self {
        Self::new(AdapterConfig::default())
    }
}

async fn intake(
    mut rx: mpsc::Receiver<TransportEvent>,
    mut processor: SignalProcessor,
    current: Arc<AtomicU64>,
    state: Arc<watch::Sender<TelemetrySnapshot>>,
    accel_tx: broadcast::Sender<AccelSample>,
) {
    let session = processor.session;
    let publish = |processor: &SignalProcessor| {
        let snapshot = processor.snapshot();
        state.send_if_modified(|s| {
            if current.load(Ordering::Acquire) != session {
                return false;
            }
            *s = snapshot;
            true
        })
    };

    let mut closed = false;
    while let Some(event) = rx.recv().await {
        let terminal = matches!(event, TransportEvent::Disconnected);
        let samples = processor.ingest(event, Instant::now());
        if !publish(&processor) {
            debug!("session {session} superseded, intake stopping");
            return;
        }
        for sample in samples {
            // No subscribers is fine.
            let _ = accel_tx.send(sample);
        }
        if terminal {
            closed = true;
            break;
        }
    }
    if !closed {
        processor.ingest(TransportEvent::Disconnected, Instant::now());
        publish(&processor);
    }
}
