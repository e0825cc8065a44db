//! Error taxonomy for the pipeline.
//!
//! Only user-initiated actions that fail outright produce an observable error:
//!
//! | Type | Raised by | Caller's move |
//! |---|---|---|
//! | [`ConnectionError`] | `connect_*` on the adapter | show the message, let the user retry |
//! | [`AudioInitError`] | [`crate::audio::AdaptiveAudioEngine::init`] | retry on the next user gesture |
//! | [`PacketDecodeError`] | packet decoders in [`crate::parse`] / [`crate::bridge`] | never surfaced; dropped and counted |
//! | [`ConfigError`] | [`crate::detector::Sensitivity::new`] | usually clamped instead |
//!
//! Everything that can heal by itself (stalls, malformed packets, brief radio
//! drops) is absorbed into [`crate::health::ConnectionHealthState`].

use std::time::Duration;

use thiserror::Error;

/// Connect-time failure with a human-readable cause.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The OS refused Bluetooth access (missing permission / plist entry).
    #[error("Bluetooth permission denied")]
    PermissionDenied,

    /// No Bluetooth adapter is present or powered on.
    #[error("no Bluetooth adapter available")]
    AdapterUnavailable,

    /// Scan finished without a matching headset.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// The relay bridge could not be bound or never sent a packet.
    #[error("bridge unreachable at {address}: {reason}")]
    BridgeUnreachable { address: String, reason: String },

    /// A connect step did not finish in time.
    #[error("{step} timed out after {after:?}")]
    Timeout { step: &'static str, after: Duration },

    /// A required GATT characteristic is missing on the peripheral.
    #[error("characteristic {0} not found")]
    MissingCharacteristic(uuid::Uuid),

    /// Any other transport-level failure.
    #[error("transport error: {0}")]
    Transport(String),
}

impl From<btleplug::Error> for ConnectionError {
    fn from(e: btleplug::Error) -> Self {
        match e {
            btleplug::Error::PermissionDenied => Self::PermissionDenied,
            btleplug::Error::DeviceNotFound => Self::DeviceNotFound("peripheral vanished".into()),
            btleplug::Error::TimedOut(after) => Self::Timeout { step: "BLE operation", after },
            other => Self::Transport(other.to_string()),
        }
    }
}

/// Audio subsystem could not be unlocked. Not fatal.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AudioInitError {
    /// The platform only starts audio from inside a user interaction.
    #[error("audio can only be started from a user gesture")]
    GestureRequired,

    #[error("no audio output device")]
    NoOutputDevice,

    #[error("audio stream error: {0}")]
    Stream(String),

    /// `start_session` was called before a successful `init`.
    #[error("audio engine is not initialised")]
    NotInitialized,
}

/// A packet that could not be decoded. Counted, never thrown to the user.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketDecodeError {
    #[error("{kind} packet truncated: {len} bytes, need {need}")]
    Truncated {
        kind: &'static str,
        len: usize,
        need: usize,
    },

    #[error("{kind} packet has {got} values, expected at least {need}")]
    WrongArity {
        kind: &'static str,
        got: usize,
        need: usize,
    },

    #[error("non-numeric OSC argument in {0}")]
    BadArgument(String),

    #[error("OSC decode failed: {0}")]
    Osc(String),

    #[error("unknown OSC address {0}")]
    UnknownAddress(String),
}

/// Invalid configuration input.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("sensitivity {0} is outside [0, 1]")]
    SensitivityOutOfRange(f64),
}
