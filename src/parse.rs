//! Byte-level decoders for classic Muse BLE notifications.
//!
//! Every decoder is pure and returns [`PacketDecodeError`] on short input so
//! the intake loop can count the drop instead of crashing:
//!
//! | Function | Sensor | Format |
//! |---|---|---|
//! | [`parse_eeg`] | EEG | u16 BE index + 12-bit BE packed, 0.48828125 µV/LSB |
//! | [`parse_ppg`] | Optical | u16 BE index + 24-bit BE unsigned |
//! | [`parse_telemetry`] | Battery | 5 × u16 BE |
//! | [`parse_accelerometer`] | Accel | u16 BE seq + 3 × i16 BE XYZ, 0.0000610352 g/LSB |

use crate::error::PacketDecodeError;
use crate::types::{EegReading, ImuData, PpgReading, TelemetryData, XyzSample};

/// µV per LSB for the 12-bit EEG ADC (1000 µV / 2048 steps).
const EEG_SCALE: f64 = 0.48828125;
/// Mid-scale of the 12-bit ADC.
const EEG_OFFSET: f64 = 2048.0;
/// g per LSB, ±2 g over 16 bits.
const ACCEL_SCALE: f32 = 0.0000610352;

fn require(kind: &'static str, data: &[u8], need: usize) -> Result<(), PacketDecodeError> {
    if data.len() < need {
        return Err(PacketDecodeError::Truncated {
            kind,
            len: data.len(),
            need,
        });
    }
    Ok(())
}

// ── EEG ──────────────────────────────────────────────────────────────────────

/// Unpack 12-bit big-endian values, two per three bytes:
///
/// ```text
/// [AA BB CC] → (AA << 4) | (BB >> 4),  ((BB & 0x0F) << 8) | CC
/// ```
///
/// A trailing partial group yields whatever whole values it contains.
pub fn decode_unsigned_12bit(data: &[u8]) -> Vec<u16> {
    let mut out = Vec::with_capacity(data.len() * 2 / 3);
    for group in data.chunks(3) {
        match *group {
            [a, b, c] => {
                out.push(((a as u16) << 4) | ((b as u16) >> 4));
                out.push((((b as u16) & 0x0F) << 8) | c as u16);
            }
            [a, b] => out.push(((a as u16) << 4) | ((b as u16) >> 4)),
            _ => {}
        }
    }
    out
}

/// Convert packed EEG payload bytes to µV: `(raw − 2048) × 0.48828125`.
pub fn decode_eeg_samples(data: &[u8]) -> Vec<f64> {
    decode_unsigned_12bit(data)
        .into_iter()
        .map(|n| EEG_SCALE * (n as f64 - EEG_OFFSET))
        .collect()
}

/// Decode a full EEG notification for `electrode`.
///
/// Needs the 2-byte index plus at least one 3-byte sample group.
pub fn parse_eeg(data: &[u8], electrode: usize) -> Result<EegReading, PacketDecodeError> {
    require("EEG", data, 5)?;
    Ok(EegReading {
        index: u16::from_be_bytes([data[0], data[1]]),
        electrode,
        samples: decode_eeg_samples(&data[2..]),
    })
}

// ── PPG ──────────────────────────────────────────────────────────────────────

/// 24-bit big-endian unsigned values; a partial trailing group is ignored.
pub fn decode_unsigned_24bit(data: &[u8]) -> Vec<u32> {
    data.chunks_exact(3)
        .map(|c| ((c[0] as u32) << 16) | ((c[1] as u32) << 8) | c[2] as u32)
        .collect()
}

/// Decode a full optical notification for `ppg_channel`.
pub fn parse_ppg(data: &[u8], ppg_channel: usize) -> Result<PpgReading, PacketDecodeError> {
    require("PPG", data, 5)?;
    Ok(PpgReading {
        index: u16::from_be_bytes([data[0], data[1]]),
        ppg_channel,
        samples: decode_unsigned_24bit(&data[2..])
            .into_iter()
            .map(f64::from)
            .collect(),
    })
}

// ── Telemetry ────────────────────────────────────────────────────────────────

/// | Bytes | Field | Conversion |
/// |---|---|---|
/// | 0–1 | sequence_id | raw |
/// | 2–3 | battery | ÷ 512 → % |
/// | 4–5 | fuel gauge | × 2.2 → mV |
/// | 8–9 | temperature | raw ADC |
pub fn parse_telemetry(data: &[u8]) -> Result<TelemetryData, PacketDecodeError> {
    require("telemetry", data, 10)?;
    let be = |i: usize| u16::from_be_bytes([data[i], data[i + 1]]);
    Ok(TelemetryData {
        sequence_id: be(0),
        battery_level: (be(2) as f32 / 512.0).clamp(0.0, 100.0),
        fuel_gauge_voltage: be(4) as f32 * 2.2,
        temperature: be(8),
    })
}

// ── Accelerometer ────────────────────────────────────────────────────────────

/// Three XYZ samples at byte offsets 2, 8 and 14.
pub fn parse_accelerometer(data: &[u8]) -> Result<ImuData, PacketDecodeError> {
    require("accelerometer", data, 20)?;
    let axis = |off: usize| ACCEL_SCALE * i16::from_be_bytes([data[off], data[off + 1]]) as f32;
    let sample = |off: usize| XyzSample::new(axis(off), axis(off + 2), axis(off + 4));
    Ok(ImuData {
        sequence_id: u16::from_be_bytes([data[0], data[1]]),
        samples: vec![sample(2), sample(8), sample(14)],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn twelve_bit_unpacking() {
        assert_eq!(decode_unsigned_12bit(&[0xAB, 0xCD, 0xEF]), vec![0xABC, 0xDEF]);
        assert_eq!(decode_unsigned_12bit(&[0x80, 0x08]), vec![0x800]);
    }

    #[test]
    fn mid_scale_decodes_to_zero_microvolts() {
        // 0x800, 0x800
        let uv = decode_eeg_samples(&[0x80, 0x08, 0x00]);
        assert_eq!(uv, vec![0.0, 0.0]);
    }

    #[test]
    fn full_eeg_notification() {
        let mut pkt = vec![0x01, 0x02];
        pkt.extend(std::iter::repeat([0x80, 0x08, 0x00]).take(6).flatten());
        let reading = parse_eeg(&pkt, 2).unwrap();
        assert_eq!(reading.index, 0x0102);
        assert_eq!(reading.electrode, 2);
        assert_eq!(reading.samples.len(), 12);
    }

    #[test]
    fn truncated_packets_are_errors() {
        assert!(matches!(
            parse_eeg(&[0x00, 0x01], 0),
            Err(PacketDecodeError::Truncated { kind: "EEG", .. })
        ));
        assert!(parse_telemetry(&[0; 9]).is_err());
        assert!(parse_accelerometer(&[0; 19]).is_err());
        assert!(parse_ppg(&[0; 4], 1).is_err());
    }

    #[test]
    fn telemetry_fields() {
        let data = [0x00, 0x07, 0xC8, 0x00, 0x00, 0x0A, 0, 0, 0x01, 0x00];
        let t = parse_telemetry(&data).unwrap();
        assert_eq!(t.sequence_id, 7);
        assert!((t.battery_level - 100.0).abs() < 1e-3);
        assert!((t.fuel_gauge_voltage - 22.0).abs() < 1e-3);
        assert_eq!(t.temperature, 256);
    }

    #[test]
    fn accelerometer_scaling() {
        let mut data = [0u8; 20];
        // first sample z = 16384 LSB ≈ 1 g
        data[6] = 0x40;
        let imu = parse_accelerometer(&data).unwrap();
        assert!((imu.samples[0].z - 1.0).abs() < 1e-3);
        assert_eq!(imu.samples[1], XyzSample::default());
    }

    #[test]
    fn ppg_values() {
        let r = parse_ppg(&[0, 5, 0x01, 0x00, 0x00, 0x00, 0x00, 0xFF], 1).unwrap();
        assert_eq!(r.index, 5);
        assert_eq!(r.samples, vec![65536.0, 255.0]);
    }
}
