//! OSC relay transport.
//!
//! Phone apps and desktop tools that pair with the headset can relay its
//! data as OSC over UDP. This transport binds a local UDP port, waits for
//! the relay to start talking, and maps the messages it understands onto
//! [`TransportEvent`]s:
//!
//! | Address | Arguments | Event |
//! |---|---|---|
//! | `/muse/eeg` | ≥ 4 numbers, µV (TP9, AF7, AF8, TP10) | one [`EegReading`] per channel |
//! | `/muse/acc` | 3 numbers, g | [`ImuData`] with one sample |
//! | `/muse/ppg` | 3 numbers (ambient, IR, red) | [`PpgReading`] on the IR channel |
//! | `/muse/batt` | charge (% or % × 100) … | [`TelemetryData`] |
//! | `/muse/elements/horseshoe` | 4 numbers, 1 good … 4 off | `Horseshoe` codes |
//!
//! Other `/muse/…` addresses are ignored. Anything outside that namespace
//! counts as a malformed packet.
//!
//! UDP has no link, so "link lost" means "silent for `idle_timeout`". Each
//! further silent window is one re-establishment attempt; a packet during
//! any of them brings the link back.

use std::net::SocketAddr;
use std::time::Duration;

use log::{debug, info, warn};
use rosc::{decoder, OscMessage, OscPacket, OscType};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};

use crate::error::{ConnectionError, PacketDecodeError};
use crate::protocol::{
    ELECTRODE_COUNT, OSC_ACCELEROMETER, OSC_BATTERY, OSC_EEG, OSC_HORSESHOE, OSC_PPG,
    PPG_PULSE_CHANNEL,
};
use crate::types::{
    EegReading, ImuData, PpgReading, TelemetryData, TransportEvent, XyzSample, CONTACT_OFF,
};

const MAX_DATAGRAM: usize = 4096;

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Local address the relay sends to, e.g. `"0.0.0.0:5000"`.
    pub bind_address: String,
    /// How long `connect` waits for the relay's first packet.
    pub first_packet_timeout: Duration,
    /// Silence after which the link is considered lost.
    pub idle_timeout: Duration,
    /// Silent windows tolerated after a loss before giving up.
    pub max_reconnect_attempts: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:5000".into(),
            first_packet_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(5),
            max_reconnect_attempts: 3,
        }
    }
}

// ── Decoding ─────────────────────────────────────────────────────────────────

fn number(addr: &str, arg: &OscType) -> Result<f64, PacketDecodeError> {
    match *arg {
        OscType::Float(v) => Ok(v as f64),
        OscType::Double(v) => Ok(v),
        OscType::Int(v) => Ok(v as f64),
        OscType::Long(v) => Ok(v as f64),
        _ => Err(PacketDecodeError::BadArgument(addr.to_owned())),
    }
}

fn numbers(msg: &OscMessage, kind: &'static str, need: usize) -> Result<Vec<f64>, PacketDecodeError> {
    if msg.args.len() < need {
        return Err(PacketDecodeError::WrongArity {
            kind,
            got: msg.args.len(),
            need,
        });
    }
    msg.args.iter().take(need).map(|a| number(&msg.addr, a)).collect()
}

/// Map a horseshoe value (1 good, 2 medium, 3 poor, 4 off) to a contact
/// code. Anything outside 1..=4 counts as off.
fn contact_code(v: f64) -> u8 {
    if !v.is_finite() {
        return CONTACT_OFF;
    }
    match v.round() as i64 {
        c @ 1..=4 => c as u8,
        _ => CONTACT_OFF,
    }
}

/// Decode one OSC message. `Ok(vec![])` for addresses we deliberately skip.
pub fn decode_message(msg: &OscMessage) -> Result<Vec<TransportEvent>, PacketDecodeError> {
    let addr = msg.addr.as_str();
    let events = match addr {
        OSC_EEG => numbers(msg, "EEG", ELECTRODE_COUNT)?
            .into_iter()
            .enumerate()
            .map(|(electrode, uv)| {
                TransportEvent::Eeg(EegReading {
                    index: 0,
                    electrode,
                    samples: vec![uv],
                })
            })
            .collect(),
        OSC_ACCELEROMETER => {
            let v = numbers(msg, "accelerometer", 3)?;
            vec![TransportEvent::Accelerometer(ImuData {
                sequence_id: 0,
                samples: vec![XyzSample::new(v[0] as f32, v[1] as f32, v[2] as f32)],
            })]
        }
        OSC_PPG => {
            let v = numbers(msg, "PPG", 3)?;
            vec![TransportEvent::Ppg(PpgReading {
                index: 0,
                ppg_channel: PPG_PULSE_CHANNEL,
                samples: vec![v[PPG_PULSE_CHANNEL]],
            })]
        }
        OSC_BATTERY => {
            let v = numbers(msg, "battery", 1)?;
            // Some relays send hundredths of a percent.
            let pct = if v[0] > 100.0 { v[0] / 100.0 } else { v[0] };
            vec![TransportEvent::Telemetry(TelemetryData {
                sequence_id: 0,
                battery_level: (pct as f32).clamp(0.0, 100.0),
                fuel_gauge_voltage: 0.0,
                temperature: 0,
            })]
        }
        OSC_HORSESHOE => {
            let v = numbers(msg, "horseshoe", ELECTRODE_COUNT)?;
            vec![TransportEvent::Horseshoe([
                contact_code(v[0]),
                contact_code(v[1]),
                contact_code(v[2]),
                contact_code(v[3]),
            ])]
        }
        other if other.starts_with("/muse/") => vec![],
        other => return Err(PacketDecodeError::UnknownAddress(other.to_owned())),
    };
    Ok(events)
}

fn flatten(packet: OscPacket, out: &mut Vec<TransportEvent>) {
    match packet {
        OscPacket::Message(msg) => match decode_message(&msg) {
            Ok(events) => out.extend(events),
            Err(e) => out.push(TransportEvent::Malformed(e)),
        },
        OscPacket::Bundle(bundle) => {
            for content in bundle.content {
                flatten(content, out);
            }
        }
    }
}

/// Decode a whole datagram, bundles included. Undecodable input becomes a
/// single `Malformed` event.
pub fn decode_datagram(bytes: &[u8]) -> Vec<TransportEvent> {
    let mut out = Vec::new();
    match decoder::decode_udp(bytes) {
        Ok((_, packet)) => flatten(packet, &mut out),
        Err(e) => out.push(TransportEvent::Malformed(PacketDecodeError::Osc(format!("{e:?}")))),
    }
    out
}

// ── Listener / session ───────────────────────────────────────────────────────

/// A bound but not yet started relay socket.
pub struct BridgeListener {
    socket: UdpSocket,
    config: BridgeConfig,
}

impl BridgeListener {
    pub async fn bind(config: BridgeConfig) -> Result<Self, ConnectionError> {
        let socket = UdpSocket::bind(&config.bind_address)
            .await
            .map_err(|e| ConnectionError::BridgeUnreachable {
                address: config.bind_address.clone(),
                reason: e.to_string(),
            })?;
        Ok(Self { socket, config })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }

    /// Wait for the relay's first packet, then stream in the background.
    pub async fn start(self) -> Result<(mpsc::Receiver<TransportEvent>, BridgeHandle), ConnectionError> {
        let address = self
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|| self.config.bind_address.clone());
        info!("bridge: waiting for relay on {address} …");

        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (len, peer) = tokio::time::timeout(
            self.config.first_packet_timeout,
            self.socket.recv_from(&mut buf),
        )
        .await
        .map_err(|_| ConnectionError::BridgeUnreachable {
            address: address.clone(),
            reason: format!(
                "no packets within {:.1} s",
                self.config.first_packet_timeout.as_secs_f64()
            ),
        })?
        .map_err(|e| ConnectionError::BridgeUnreachable {
            address: address.clone(),
            reason: e.to_string(),
        })?;

        let name = format!("OSC bridge {peer}");
        info!("bridge: relay {peer} is talking");

        let (tx, rx) = mpsc::channel::<TransportEvent>(1024);
        let _ = tx.send(TransportEvent::Connected(name.clone())).await;
        for event in decode_datagram(&buf[..len]) {
            let _ = tx.send(event).await;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(run_session(self.socket, self.config, tx, shutdown_rx, buf));

        Ok((
            rx,
            BridgeHandle {
                shutdown: shutdown_tx,
                name,
            },
        ))
    }
}

/// Bind and start in one step.
pub async fn connect(config: BridgeConfig) -> Result<(mpsc::Receiver<TransportEvent>, BridgeHandle), ConnectionError> {
    BridgeListener::bind(config).await?.start().await
}

async fn run_session(
    socket: UdpSocket,
    config: BridgeConfig,
    tx: mpsc::Sender<TransportEvent>,
    mut shutdown: watch::Receiver<bool>,
    mut buf: Vec<u8>,
) {
    let mut retrying: Option<u32> = None;
    let mut datagrams: u64 = 0;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            received = tokio::time::timeout(config.idle_timeout, socket.recv_from(&mut buf)) => {
                match received {
                    Ok(Ok((len, _))) => {
                        datagrams += 1;
                        if datagrams <= 5 || datagrams % 500 == 0 {
                            debug!("bridge: datagram #{datagrams} len={len}");
                        }
                        if let Some(attempt) = retrying.take() {
                            info!("bridge: relay back after {attempt} silent window(s)");
                            if tx.send(TransportEvent::Reconnected).await.is_err() {
                                return;
                            }
                        }
                        for event in decode_datagram(&buf[..len]) {
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                    Ok(Err(e)) => warn!("bridge: recv error: {e}"),
                    Err(_) => {
                        let next = match retrying {
                            None => {
                                info!("bridge: relay silent, link considered lost");
                                let _ = tx.send(TransportEvent::LinkLost).await;
                                1
                            }
                            Some(n) if n < config.max_reconnect_attempts => n + 1,
                            Some(n) => {
                                warn!("bridge: relay silent for {n} more window(s), giving up");
                                break;
                            }
                        };
                        if next > config.max_reconnect_attempts {
                            break;
                        }
                        retrying = Some(next);
                        let _ = tx.send(TransportEvent::Reconnecting(next)).await;
                    }
                }
            }
        }
    }
    let _ = tx.send(TransportEvent::Disconnected).await;
    info!("bridge session ended");
}

/// Control handle for a running relay session.
pub struct BridgeHandle {
    shutdown: watch::Sender<bool>,
    name: String,
}

impl BridgeHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn disconnect(&self) {
        let _ = self.shutdown.send(true);
    }
}
