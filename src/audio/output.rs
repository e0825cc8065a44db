//! Audio sinks: where [`SynthCommand`]s go.
//!
//! * [`CpalSink`] (feature `audio`) opens the default output device. The
//!   [`Synth`] lives inside the device callback and drains a lock-free
//!   command ring before each buffer.
//! * [`OfflineSink`] keeps the synth in-process and renders on demand, for
//!   headless runs and tests. It can be told to insist on a user gesture
//!   before unlocking, like a browser or mobile audio session would.

use log::{debug, info};

use crate::error::AudioInitError;

use super::synth::{Synth, SynthCommand};

pub trait AudioSink {
    /// Bring the output up. Returns the sample rate. Calling it again after
    /// success is a no-op.
    fn unlock(&mut self) -> Result<u32, AudioInitError>;

    /// Queue a command. Dropped silently before `unlock` succeeds.
    fn submit(&mut self, command: SynthCommand);

    fn shutdown(&mut self);
}

impl<S: AudioSink + ?Sized> AudioSink for Box<S> {
    fn unlock(&mut self) -> Result<u32, AudioInitError> {
        (**self).unlock()
    }

    fn submit(&mut self, command: SynthCommand) {
        (**self).submit(command)
    }

    fn shutdown(&mut self) {
        (**self).shutdown()
    }
}

// ── OfflineSink ──────────────────────────────────────────────────────────────

pub struct OfflineSink {
    sample_rate: u32,
    require_gesture: bool,
    gesture: bool,
    synth: Option<Synth>,
    record: bool,
    history: Vec<SynthCommand>,
}

impl OfflineSink {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            require_gesture: false,
            gesture: false,
            synth: None,
            record: false,
            history: Vec::new(),
        }
    }

    /// Keep every submitted command for [`OfflineSink::history`]. Off by
    /// default so long headless sessions do not grow without bound.
    pub fn recording(mut self) -> Self {
        self.record = true;
        self
    }

    /// `unlock` fails with [`AudioInitError::GestureRequired`] until
    /// [`OfflineSink::grant_gesture`] is called.
    pub fn requiring_gesture(mut self) -> Self {
        self.require_gesture = true;
        self
    }

    pub fn grant_gesture(&mut self) {
        self.gesture = true;
    }

    pub fn is_unlocked(&self) -> bool {
        self.synth.is_some()
    }

    /// Everything submitted since unlock, oldest first. Empty unless
    /// [`OfflineSink::recording`] was set.
    pub fn history(&self) -> &[SynthCommand] {
        &self.history
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    /// Render `frames` stereo frames; empty before unlock.
    pub fn render(&mut self, frames: usize) -> Vec<f32> {
        match &mut self.synth {
            Some(synth) => {
                let mut buf = vec![0.0; frames * 2];
                synth.render(&mut buf);
                buf
            }
            None => Vec::new(),
        }
    }
}

impl AudioSink for OfflineSink {
    fn unlock(&mut self) -> Result<u32, AudioInitError> {
        if self.synth.is_none() {
            if self.require_gesture && !self.gesture {
                return Err(AudioInitError::GestureRequired);
            }
            self.synth = Some(Synth::new(self.sample_rate as f32));
            debug!("offline audio sink unlocked at {} Hz", self.sample_rate);
        }
        Ok(self.sample_rate)
    }

    fn submit(&mut self, command: SynthCommand) {
        if let Some(synth) = &mut self.synth {
            synth.apply(command);
            if self.record {
                self.history.push(command);
            }
        }
    }

    fn shutdown(&mut self) {
        if self.synth.take().is_some() {
            info!("offline audio sink closed");
        }
    }
}

/// Frames rendered per pass; larger device buffers are filled in chunks.
#[cfg(any(feature = "audio", test))]
const MAX_BLOCK_FRAMES: usize = 4096;

/// Fill an interleaved device buffer of `channels` channels from the stereo
/// synth, using `scratch` (at least `MAX_BLOCK_FRAMES * 2` long) as the only
/// working memory. Channels past the second repeat the right channel.
#[cfg(any(feature = "audio", test))]
fn render_interleaved(synth: &mut Synth, scratch: &mut [f32], data: &mut [f32], channels: usize) {
    let block_frames = (scratch.len() / 2).min(MAX_BLOCK_FRAMES).max(1);
    for block in data.chunks_mut(block_frames * channels) {
        let frames = block.len() / channels;
        let buf = &mut scratch[..frames * 2];
        synth.render(buf);
        for (frame, out) in block.chunks_exact_mut(channels).enumerate() {
            for (ch, sample) in out.iter_mut().enumerate() {
                *sample = buf[frame * 2 + ch.min(1)];
            }
        }
    }
}

// ── CpalSink ─────────────────────────────────────────────────────────────────

#[cfg(feature = "audio")]
pub use device::CpalSink;

#[cfg(feature = "audio")]
mod device {
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use log::{info, warn};
    use ringbuf::traits::{Consumer, Producer, Split};
    use ringbuf::{HeapProd, HeapRb};

    use super::{render_interleaved, AudioSink, MAX_BLOCK_FRAMES};
    use crate::audio::synth::{Synth, SynthCommand};
    use crate::error::AudioInitError;

    /// Commands that fit between two device callbacks.
    const COMMAND_QUEUE: usize = 256;

    /// Default output device via cpal.
    #[derive(Default)]
    pub struct CpalSink {
        stream: Option<cpal::Stream>,
        commands: Option<HeapProd<SynthCommand>>,
        sample_rate: u32,
        overflowed: u64,
    }

    impl CpalSink {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl AudioSink for CpalSink {
        fn unlock(&mut self) -> Result<u32, AudioInitError> {
            if self.stream.is_some() {
                return Ok(self.sample_rate);
            }
            let host = cpal::default_host();
            let device = host
                .default_output_device()
                .ok_or(AudioInitError::NoOutputDevice)?;
            let supported = device
                .default_output_config()
                .map_err(|e| AudioInitError::Stream(e.to_string()))?;
            if supported.sample_format() != cpal::SampleFormat::F32 {
                return Err(AudioInitError::Stream(format!(
                    "unsupported sample format {:?}",
                    supported.sample_format()
                )));
            }
            let sample_rate = supported.sample_rate().0;
            let channels = supported.channels().max(1) as usize;
            let config: cpal::StreamConfig = supported.into();

            let (prod, mut cons) = HeapRb::<SynthCommand>::new(COMMAND_QUEUE).split();
            let mut synth = Synth::new(sample_rate as f32);
            let mut stereo = vec![0.0f32; MAX_BLOCK_FRAMES * 2];

            let stream = device
                .build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        while let Some(command) = cons.try_pop() {
                            synth.apply(command);
                        }
                        render_interleaved(&mut synth, &mut stereo, data, channels);
                    },
                    |err| warn!("audio stream error: {err}"),
                    None,
                )
                .map_err(|e| AudioInitError::Stream(e.to_string()))?;
            stream
                .play()
                .map_err(|e| AudioInitError::Stream(e.to_string()))?;

            info!("audio output: {sample_rate} Hz, {channels} ch");
            self.stream = Some(stream);
            self.commands = Some(prod);
            self.sample_rate = sample_rate;
            Ok(sample_rate)
        }

        fn submit(&mut self, command: SynthCommand) {
            if let Some(prod) = &mut self.commands {
                if prod.try_push(command).is_err() {
                    self.overflowed += 1;
                    if self.overflowed <= 5 || self.overflowed % 500 == 0 {
                        warn!("audio command queue full ({} dropped)", self.overflowed);
                    }
                }
            }
        }

        fn shutdown(&mut self) {
            self.commands = None;
            if self.stream.take().is_some() {
                info!("audio output closed");
            }
        }
    }

    impl Drop for CpalSink {
        fn drop(&mut self) {
            self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gesture_gate() {
        let mut sink = OfflineSink::new(8000).recording().requiring_gesture();
        assert_eq!(sink.unlock(), Err(AudioInitError::GestureRequired));
        sink.submit(SynthCommand::Start);
        assert!(sink.history().is_empty());
        sink.grant_gesture();
        assert_eq!(sink.unlock(), Ok(8000));
        assert_eq!(sink.unlock(), Ok(8000));
        sink.submit(SynthCommand::Start);
        assert_eq!(sink.history(), &[SynthCommand::Start]);
        assert_eq!(sink.render(10).len(), 20);
    }

    #[test]
    fn history_is_opt_in() {
        let mut sink = OfflineSink::new(8000);
        sink.unlock().unwrap();
        for _ in 0..1000 {
            sink.submit(SynthCommand::SetMix(0.5));
        }
        assert!(sink.history().is_empty());
        assert_eq!(sink.render(4).len(), 8);
    }

    #[test]
    fn oversized_device_buffer_renders_in_blocks() {
        let mut synth = Synth::new(8000.0);
        synth.apply(SynthCommand::Start);
        let mut scratch = vec![0.0f32; MAX_BLOCK_FRAMES * 2];
        let channels = 3;
        let mut data = vec![f32::NAN; (MAX_BLOCK_FRAMES * 2 + 17) * channels];
        render_interleaved(&mut synth, &mut scratch, &mut data, channels);
        assert_eq!(scratch.len(), MAX_BLOCK_FRAMES * 2);
        assert!(data.iter().all(|s| s.is_finite()));
        for frame in data.chunks_exact(channels) {
            assert_eq!(frame[2], frame[1]);
        }
    }

    #[test]
    fn shutdown_stops_rendering() {
        let mut sink = OfflineSink::new(8000);
        sink.unlock().unwrap();
        sink.shutdown();
        assert!(!sink.is_unlocked());
        assert!(sink.render(10).is_empty());
    }
}
