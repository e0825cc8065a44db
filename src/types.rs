//! Transport-level readings and the events every transport emits.
//!
//! BLE ([`crate::muse_client`]), the OSC relay ([`crate::bridge`]) and the
//! in-process [`crate::simulator`] all produce the same [`TransportEvent`]
//! stream, so the telemetry adapter never needs to know which one is live.

use std::time::Instant;

use serde::Serialize;

use crate::error::PacketDecodeError;

/// One EEG notification from a single electrode.
///
/// BLE carries 12 samples per notification; the OSC relay sends one sample
/// per message for all channels, which becomes one `EegReading` per channel.
#[derive(Debug, Clone)]
pub struct EegReading {
    /// Sequential packet index from the headset (wraps at 0xFFFF). `0` for
    /// the bridge.
    pub index: u16,
    /// 0 = TP9, 1 = AF7, 2 = AF8, 3 = TP10.
    pub electrode: usize,
    /// Voltage samples in µV.
    pub samples: Vec<f64>,
}

/// One optical notification from a single PPG channel.
#[derive(Debug, Clone)]
pub struct PpgReading {
    pub index: u16,
    /// 0 = ambient, 1 = infrared, 2 = red.
    pub ppg_channel: usize,
    /// Raw ADC values; only their shape matters for pulse detection.
    pub samples: Vec<f64>,
}

/// Battery and housekeeping packet.
#[derive(Debug, Clone)]
pub struct TelemetryData {
    pub sequence_id: u16,
    /// State of charge, 0–100 %.
    pub battery_level: f32,
    /// Fuel-gauge voltage in mV; `0.0` when the transport doesn't carry it.
    pub fuel_gauge_voltage: f32,
    pub temperature: u16,
}

/// A single 3-axis accelerometer value in g.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct XyzSample {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl XyzSample {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    /// Euclidean distance to `other`.
    pub fn distance(&self, other: &XyzSample) -> f32 {
        let (dx, dy, dz) = (self.x - other.x, self.y - other.y, self.z - other.z);
        (dx * dx + dy * dy + dz * dz).sqrt()
    }
}

/// Accelerometer batch from one notification. Index 0 is the oldest.
#[derive(Debug, Clone)]
pub struct ImuData {
    pub sequence_id: u16,
    pub samples: Vec<XyzSample>,
}

/// An accelerometer sample stamped on arrival, as fanned out to the
/// movement detector.
#[derive(Debug, Clone, Copy)]
pub struct AccelSample {
    pub at: Instant,
    pub xyz: XyzSample,
}

/// Which kind of link produced the data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Direct BLE link to the headset.
    Ble,
    /// OSC relay over UDP.
    Bridge,
    /// In-process signal generator.
    Simulated,
}

/// Everything a transport can report.
///
/// Packet variants carry decoded data; the lifecycle variants (`LinkLost`,
/// `Reconnecting`, `Reconnected`, `Disconnected`) drive the connection-health
/// state machine in [`crate::health`].
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Link is up. Carries the device or bridge name.
    Connected(String),
    Eeg(EegReading),
    Ppg(PpgReading),
    Accelerometer(ImuData),
    Telemetry(TelemetryData),
    /// Contact codes reported directly by the relay (1 good … 4 off).
    Horseshoe([u8; 4]),
    /// A packet that failed to decode. The adapter counts it and moves on.
    Malformed(PacketDecodeError),
    /// The transport noticed the link is gone and will try to re-establish it.
    LinkLost,
    /// Re-establishment attempt `n` (1-based) is under way.
    Reconnecting(u32),
    /// A re-establishment attempt succeeded.
    Reconnected,
    /// Terminal: retries exhausted or the link was closed. No events follow.
    Disconnected,
}

impl TransportEvent {
    /// `true` for variants that carry sensor data.
    pub fn is_packet(&self) -> bool {
        matches!(
            self,
            Self::Eeg(_) | Self::Ppg(_) | Self::Accelerometer(_) | Self::Telemetry(_) | Self::Horseshoe(_)
        )
    }
}

// ── Electrode contact ────────────────────────────────────────────────────────

/// Contact quality of one electrode, derived from its horseshoe code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ElectrodeQuality {
    Good,
    Medium,
    Poor,
    Off,
}

impl ElectrodeQuality {
    /// `1 → Good`, `2 → Medium`, `3 → Poor`, anything else `→ Off`.
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => Self::Good,
            2 => Self::Medium,
            3 => Self::Poor,
            _ => Self::Off,
        }
    }

    /// Confidence weight used by the scorer.
    pub fn weight(self) -> f64 {
        match self {
            Self::Good => 1.0,
            Self::Medium => 0.66,
            Self::Poor => 0.33,
            Self::Off => 0.0,
        }
    }
}

/// Map all four raw codes independently.
pub fn electrode_qualities(codes: &[u8; 4]) -> [ElectrodeQuality; 4] {
    codes.map(ElectrodeQuality::from_code)
}

/// Horseshoe code meaning "no contact".
pub const CONTACT_OFF: u8 = 4;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn horseshoe_code_table() {
        assert_eq!(ElectrodeQuality::from_code(1), ElectrodeQuality::Good);
        assert_eq!(ElectrodeQuality::from_code(2), ElectrodeQuality::Medium);
        assert_eq!(ElectrodeQuality::from_code(3), ElectrodeQuality::Poor);
        assert_eq!(ElectrodeQuality::from_code(4), ElectrodeQuality::Off);
        for other in [0u8, 5, 9, 255] {
            assert_eq!(ElectrodeQuality::from_code(other), ElectrodeQuality::Off);
        }
    }

    #[test]
    fn each_site_is_mapped_independently() {
        let mapped = electrode_qualities(&[4, 1, 3, 2]);
        assert_eq!(
            mapped,
            [
                ElectrodeQuality::Off,
                ElectrodeQuality::Good,
                ElectrodeQuality::Poor,
                ElectrodeQuality::Medium
            ]
        );
    }

    #[test]
    fn only_packets_count_as_packets() {
        assert!(TransportEvent::Horseshoe([1; 4]).is_packet());
        assert!(!TransportEvent::LinkLost.is_packet());
        assert!(!TransportEvent::Reconnecting(1).is_packet());
    }
}
