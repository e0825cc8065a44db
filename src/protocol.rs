//! Wire-level constants for both transports.
//!
//! * BLE: GATT UUIDs in the Muse vendor namespace
//!   `273eXXXX-4c4d-454d-96be-f03bac821358`, plus the control-channel framing.
//! * Bridge: OSC address patterns sent by relay apps (Mind Monitor, muse-io).

use uuid::Uuid;

// ── BLE service and characteristics ──────────────────────────────────────────

/// Primary GATT service advertised by Muse headsets.
pub const MUSE_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000fe8d_0000_1000_8000_00805f9b34fb);

/// Control channel: length-prefixed ASCII commands out, JSON fragments back.
pub const CONTROL_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x273e0001_4c4d_454d_96be_f03bac821358);

/// Battery / housekeeping, roughly once per second.
pub const TELEMETRY_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x273e000b_4c4d_454d_96be_f03bac821358);

/// Accelerometer, 3 × XYZ per notification at ~52 Hz.
pub const ACCELEROMETER_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x273e000a_4c4d_454d_96be_f03bac821358);

/// EEG characteristics in electrode order TP9, AF7, AF8, TP10.
pub const EEG_CHARACTERISTICS: [Uuid; 4] = [
    Uuid::from_u128(0x273e0003_4c4d_454d_96be_f03bac821358), // TP9
    Uuid::from_u128(0x273e0004_4c4d_454d_96be_f03bac821358), // AF7
    Uuid::from_u128(0x273e0005_4c4d_454d_96be_f03bac821358), // AF8
    Uuid::from_u128(0x273e0006_4c4d_454d_96be_f03bac821358), // TP10
];

/// Optical characteristics: ambient, infrared, red.
pub const PPG_CHARACTERISTICS: [Uuid; 3] = [
    Uuid::from_u128(0x273e000f_4c4d_454d_96be_f03bac821358),
    Uuid::from_u128(0x273e0010_4c4d_454d_96be_f03bac821358),
    Uuid::from_u128(0x273e0011_4c4d_454d_96be_f03bac821358),
];

// ── Sampling ─────────────────────────────────────────────────────────────────

/// EEG sample rate per channel (Hz).
pub const EEG_FREQUENCY: f64 = 256.0;

/// Samples per classic EEG notification (≈ 46.9 ms at 256 Hz).
pub const EEG_SAMPLES_PER_READING: usize = 12;

/// Optical sample rate per channel (Hz).
pub const PPG_FREQUENCY: f64 = 64.0;

/// Samples per optical notification.
pub const PPG_SAMPLES_PER_READING: usize = 6;

/// Number of scalp electrodes scored for contact quality.
pub const ELECTRODE_COUNT: usize = 4;

/// Electrode names in [`EEG_CHARACTERISTICS`] order.
pub const EEG_CHANNEL_NAMES: [&str; ELECTRODE_COUNT] = ["TP9", "AF7", "AF8", "TP10"];

/// Optical channel names in [`PPG_CHARACTERISTICS`] order.
pub const PPG_CHANNEL_NAMES: [&str; 3] = ["ambient", "infrared", "red"];

/// Optical channel used for pulse detection.
pub const PPG_PULSE_CHANNEL: usize = 1;

// ── Control commands ─────────────────────────────────────────────────────────

/// Startup preset streaming EEG + PPG without AUX.
pub const PRESET_EEG_PPG: &str = "p50";

/// Frame a control command: `[len, ascii…, '\n']` with `len` counting the
/// command and the terminator.
///
/// ```
/// # use muse_coherence::protocol::encode_command;
/// assert_eq!(encode_command("d"), &[0x02, b'd', b'\n']);
/// ```
pub fn encode_command(cmd: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(cmd.len() + 2);
    bytes.push((cmd.len() + 1) as u8);
    bytes.extend_from_slice(cmd.as_bytes());
    bytes.push(b'\n');
    bytes
}

/// Strip the length prefix from a control notification. Lossy UTF-8.
pub fn decode_response(bytes: &[u8]) -> String {
    let Some((&len, body)) = bytes.split_first() else {
        return String::new();
    };
    let end = (len as usize).min(body.len());
    String::from_utf8_lossy(&body[..end]).into_owned()
}

// ── OSC bridge addresses ─────────────────────────────────────────────────────

/// Raw EEG, one sample per channel: TP9, AF7, AF8, TP10 [, AUX].
pub const OSC_EEG: &str = "/muse/eeg";
/// Accelerometer x, y, z in g.
pub const OSC_ACCELEROMETER: &str = "/muse/acc";
/// Optical ambient, infrared, red.
pub const OSC_PPG: &str = "/muse/ppg";
/// Battery; first argument is charge in hundredths of a percent.
pub const OSC_BATTERY: &str = "/muse/batt";
/// Horseshoe contact codes (1 good … 4 off), one per electrode.
pub const OSC_HORSESHOE: &str = "/muse/elements/horseshoe";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_command_prefixes_length_and_newline() {
        assert_eq!(encode_command("p50"), vec![4, b'p', b'5', b'0', b'\n']);
    }

    #[test]
    fn decode_response_respects_length_prefix() {
        assert_eq!(decode_response(&[3, b'{', b'"', b'a', b'x']), "{\"a");
        assert_eq!(decode_response(&[9, b'o', b'k']), "ok");
        assert_eq!(decode_response(&[]), "");
    }
}
