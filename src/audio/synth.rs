//! Real-time voice graph. Runs inside the device callback, so nothing here
//! allocates or locks after construction.
//!
//! | Layer | Sound | Driven by |
//! |---|---|---|
//! | low bed | brown-noise wash over a 55 Hz drone | `1 − mix` (equal power) |
//! | high bed | A-major pad, slow swell | `mix`, brightness, density, swell rate |
//! | reward | two high partials | reward level |
//! | entrainment | carrier L, carrier + beat R | preset, on/off |
//! | cues | three decaying one-shots | movement |
//!
//! Every continuous parameter moves through a one-pole smoother and the
//! master bus ends in a tanh soft clip.

use std::f32::consts::{FRAC_PI_2, TAU};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

/// Short sound played on head movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementCue {
    Chime,
    Bell,
    Breath,
}

impl MovementCue {
    pub const ROTATION: [MovementCue; 3] = [Self::Chime, Self::Bell, Self::Breath];

    fn slot(self) -> usize {
        match self {
            Self::Chime => 0,
            Self::Bell => 1,
            Self::Breath => 2,
        }
    }
}

/// Entrainment target state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BinauralPreset {
    Delta,
    Theta,
    #[default]
    Alpha,
    Beta,
}

impl BinauralPreset {
    /// `(carrier_hz, beat_hz)`.
    pub fn frequencies(self) -> (f32, f32) {
        match self {
            Self::Delta => (200.0, 2.5),
            Self::Theta => (200.0, 6.0),
            Self::Alpha => (200.0, 10.0),
            Self::Beta => (220.0, 18.0),
        }
    }
}

/// Messages from the control side to the render side.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SynthCommand {
    Start,
    Stop,
    /// 0 = all low bed, 1 = all high bed.
    SetMix(f32),
    SetColour { brightness: f32, density: f32 },
    /// Pad swell LFO rate in Hz.
    SetSwell(f32),
    SetReward(f32),
    SetEntrainment { enabled: bool, preset: BinauralPreset },
    SetVolume(f32),
    TriggerCue(MovementCue),
}

// ── Building blocks ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct Smoothed {
    value: f32,
    target: f32,
    coeff: f32,
}

impl Smoothed {
    fn new(value: f32, time_constant_s: f32, sample_rate: f32) -> Self {
        Self {
            value,
            target: value,
            coeff: 1.0 - (-1.0 / (time_constant_s * sample_rate)).exp(),
        }
    }

    #[inline]
    fn next(&mut self) -> f32 {
        self.value += self.coeff * (self.target - self.value);
        self.value
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Osc {
    phase: f32,
}

impl Osc {
    #[inline]
    fn sine(&mut self, freq: f32, sample_rate: f32) -> f32 {
        let out = (self.phase * TAU).sin();
        self.phase = (self.phase + freq / sample_rate).fract();
        out
    }
}

#[derive(Debug, Clone, Copy)]
struct CueVoice {
    osc: [Osc; 2],
    env: f32,
    decay: f32,
    /// One-pole state for the breath noise.
    lp: f32,
}

impl CueVoice {
    fn new(decay_s: f32, sample_rate: f32) -> Self {
        Self {
            osc: [Osc::default(); 2],
            env: 0.0,
            decay: (-1.0 / (decay_s * sample_rate)).exp(),
            lp: 0.0,
        }
    }
}

/// `tanh(x · drive) · ceiling`.
#[derive(Debug, Clone, Copy)]
pub struct SoftClip {
    pub ceiling: f32,
    pub drive: f32,
}

impl Default for SoftClip {
    fn default() -> Self {
        Self {
            ceiling: 0.98,
            drive: 1.0,
        }
    }
}

impl SoftClip {
    #[inline]
    pub fn apply(&self, x: f32) -> f32 {
        (x * self.drive).tanh() * self.ceiling
    }
}

// ── Synth ────────────────────────────────────────────────────────────────────

const PAD_HZ: [f32; 4] = [220.0, 277.18, 329.63, 440.0];
const REWARD_HZ: [f32; 2] = [880.0, 1318.51];
const DRONE_HZ: f32 = 55.0;

pub struct Synth {
    sample_rate: f32,
    clip: SoftClip,
    rng: SmallRng,
    brown: f32,

    run: Smoothed,
    volume: Smoothed,
    mix: Smoothed,
    brightness: Smoothed,
    density: Smoothed,
    reward: Smoothed,
    entrain: Smoothed,
    swell_hz: f32,
    carrier_hz: f32,
    beat_hz: f32,

    drone: Osc,
    pad: [Osc; 4],
    pad_upper: [Osc; 4],
    swell: Osc,
    reward_osc: [Osc; 2],
    carrier: [Osc; 2],
    cues: [CueVoice; 3],
}

impl Synth {
    pub fn new(sample_rate: f32) -> Self {
        let sr = sample_rate.max(1.0);
        let (carrier_hz, beat_hz) = BinauralPreset::default().frequencies();
        Self {
            sample_rate: sr,
            clip: SoftClip::default(),
            rng: SmallRng::seed_from_u64(0x6d75_7365),
            brown: 0.0,
            run: Smoothed::new(0.0, 0.8, sr),
            volume: Smoothed::new(0.6, 0.05, sr),
            mix: Smoothed::new(0.0, 0.05, sr),
            brightness: Smoothed::new(0.5, 0.5, sr),
            density: Smoothed::new(0.5, 0.5, sr),
            reward: Smoothed::new(0.0, 1.5, sr),
            entrain: Smoothed::new(0.0, 0.5, sr),
            swell_hz: 0.1,
            carrier_hz,
            beat_hz,
            drone: Osc::default(),
            pad: [Osc::default(); 4],
            pad_upper: [Osc::default(); 4],
            swell: Osc::default(),
            reward_osc: [Osc::default(); 2],
            carrier: [Osc::default(); 2],
            cues: [
                CueVoice::new(0.8, sr),
                CueVoice::new(1.5, sr),
                CueVoice::new(1.2, sr),
            ],
        }
    }

    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    pub fn apply(&mut self, command: SynthCommand) {
        let unit = |v: f32| if v.is_finite() { v.clamp(0.0, 1.0) } else { 0.0 };
        match command {
            SynthCommand::Start => self.run.target = 1.0,
            SynthCommand::Stop => self.run.target = 0.0,
            SynthCommand::SetMix(m) => self.mix.target = unit(m),
            SynthCommand::SetColour { brightness, density } => {
                self.brightness.target = unit(brightness);
                self.density.target = unit(density);
            }
            SynthCommand::SetSwell(hz) => {
                if hz.is_finite() && hz > 0.0 {
                    self.swell_hz = hz.min(5.0);
                }
            }
            SynthCommand::SetReward(level) => self.reward.target = unit(level),
            SynthCommand::SetEntrainment { enabled, preset } => {
                self.entrain.target = if enabled { 1.0 } else { 0.0 };
                (self.carrier_hz, self.beat_hz) = preset.frequencies();
            }
            SynthCommand::SetVolume(v) => self.volume.target = unit(v),
            SynthCommand::TriggerCue(cue) => {
                let voice = &mut self.cues[cue.slot()];
                voice.env = 1.0;
            }
        }
    }

    /// Fill interleaved stereo frames.
    pub fn render(&mut self, out: &mut [f32]) {
        let sr = self.sample_rate;
        for frame in out.chunks_exact_mut(2) {
            let run = self.run.next();
            let master = run * self.volume.next();
            let mix = self.mix.next();
            let brightness = self.brightness.next();
            let density = self.density.next();
            let reward = self.reward.next();
            let entrain = self.entrain.next();

            // Equal-power crossfade.
            let low_gain = (mix * FRAC_PI_2).cos();
            let high_gain = (mix * FRAC_PI_2).sin();

            let white: f32 = self.rng.gen_range(-1.0..1.0);
            self.brown = (self.brown + 0.02 * white) / 1.02;
            let low = 0.5 * (3.5 * self.brown) + 0.25 * self.drone.sine(DRONE_HZ, sr);

            let swell = 0.85 + 0.15 * self.swell.sine(self.swell_hz, sr);
            let mut pad = 0.0;
            for (i, &hz) in PAD_HZ.iter().enumerate() {
                let weight = if i == PAD_HZ.len() - 1 { density } else { 1.0 };
                pad += weight * self.pad[i].sine(hz, sr);
                pad += weight * brightness * 0.35 * self.pad_upper[i].sine(hz * 2.0, sr);
            }
            let high = 0.12 * swell * pad;

            let sparkle = reward
                * 0.06
                * (self.reward_osc[0].sine(REWARD_HZ[0], sr) + self.reward_osc[1].sine(REWARD_HZ[1], sr));

            let mut cue = 0.0;
            for (slot, voice) in self.cues.iter_mut().enumerate() {
                if voice.env < 1e-4 {
                    continue;
                }
                let tone = match slot {
                    0 => voice.osc[0].sine(1046.5, sr),
                    1 => 0.7 * voice.osc[0].sine(659.25, sr) + 0.3 * voice.osc[1].sine(659.25 * 2.76, sr),
                    _ => {
                        let n: f32 = self.rng.gen_range(-1.0..1.0);
                        voice.lp += 0.05 * (n - voice.lp);
                        3.0 * voice.lp
                    }
                };
                cue += 0.25 * voice.env * tone;
                voice.env *= voice.decay;
            }

            let bed = low_gain * low + high_gain * high + sparkle + cue;
            let ent = 0.08 * entrain;
            let left = bed + ent * self.carrier[0].sine(self.carrier_hz, sr);
            let right = bed + ent * self.carrier[1].sine(self.carrier_hz + self.beat_hz, sr);

            frame[0] = self.clip.apply(master * left);
            frame[1] = self.clip.apply(master * right);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: f32 = 48_000.0;

    fn rms(buf: &[f32]) -> f32 {
        (buf.iter().map(|s| s * s).sum::<f32>() / buf.len() as f32).sqrt()
    }

    #[test]
    fn silent_until_started() {
        let mut synth = Synth::new(SR);
        let mut buf = vec![1.0; 2 * 4800];
        synth.render(&mut buf);
        assert!(buf.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn started_output_is_audible_and_bounded() {
        let mut synth = Synth::new(SR);
        synth.apply(SynthCommand::Start);
        synth.apply(SynthCommand::SetVolume(1.0));
        synth.apply(SynthCommand::TriggerCue(MovementCue::Bell));
        let mut buf = vec![0.0; 2 * 48_000];
        synth.render(&mut buf);
        assert!(rms(&buf[48_000..]) > 0.01);
        assert!(buf.iter().all(|s| s.abs() <= 0.98));
    }

    #[test]
    fn entrainment_splits_the_ears() {
        let mut synth = Synth::new(SR);
        synth.apply(SynthCommand::Start);
        synth.apply(SynthCommand::SetEntrainment {
            enabled: true,
            preset: BinauralPreset::Theta,
        });
        let mut buf = vec![0.0; 2 * 48_000];
        synth.render(&mut buf);
        let differs = buf.chunks_exact(2).skip(24_000).any(|f| (f[0] - f[1]).abs() > 1e-3);
        assert!(differs);
    }

    #[test]
    fn mono_without_entrainment() {
        let mut synth = Synth::new(SR);
        synth.apply(SynthCommand::Start);
        let mut buf = vec![0.0; 2 * 4800];
        synth.render(&mut buf);
        assert!(buf.chunks_exact(2).all(|f| f[0] == f[1]));
    }

    #[test]
    fn garbage_parameters_are_sanitised() {
        let mut synth = Synth::new(SR);
        synth.apply(SynthCommand::Start);
        synth.apply(SynthCommand::SetMix(f32::NAN));
        synth.apply(SynthCommand::SetVolume(7.0));
        synth.apply(SynthCommand::SetSwell(-1.0));
        let mut buf = vec![0.0; 2 * 4800];
        synth.render(&mut buf);
        assert!(buf.iter().all(|s| s.is_finite() && s.abs() <= 0.98));
    }

    #[test]
    fn preset_table() {
        assert_eq!(BinauralPreset::Delta.frequencies(), (200.0, 2.5));
        assert_eq!(BinauralPreset::Beta.frequencies(), (220.0, 18.0));
    }
}
