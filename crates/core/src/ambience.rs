//! Looping background ambience, mixed under the agent's speech.

use crate::{
    audio_utils::{self, StreamResampler},
    error::CallError,
};
use std::path::Path;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

/// Default gain applied to the ambience loop.
pub const DEFAULT_AMBIENCE_VOLUME: f32 = 0.4;

/// A decoded ambience loop (mono f32).
#[derive(Debug, Clone)]
pub struct AmbienceTrack {
    samples: Arc<[f32]>,
}

impl AmbienceTrack {
    /// Builds a track from raw little-endian PCM16 bytes.
    pub fn from_pcm16_le(bytes: &[u8]) -> Result<Self, CallError> {
        let samples = audio_utils::decode_pcm16_le(bytes);
        if samples.is_empty() {
            return Err(CallError::Ambience("ambience track is empty".into()));
        }
        Ok(Self {
            samples: samples.into(),
        })
    }

    /// Reads a raw PCM16LE mono file.
    pub fn load(path: &Path) -> Result<Self, CallError> {
        let bytes = std::fs::read(path)
            .map_err(|e| CallError::Ambience(format!("{}: {}", path.display(), e)))?;
        Self::from_pcm16_le(&bytes)
    }

    /// Converts the loop from `from_rate` to `to_rate`. A trailing partial
    /// resampler block is dropped.
    pub fn resampled(self, from_rate: u32, to_rate: u32) -> Result<Self, CallError> {
        if from_rate == to_rate {
            return Ok(self);
        }
        let mut resampler = StreamResampler::new(from_rate, to_rate)
            .map_err(|e| CallError::Ambience(e.to_string()))?;
        let samples = resampler.process(&self.samples);
        if samples.is_empty() {
            return Err(CallError::Ambience(
                "ambience track is too short to resample".into(),
            ));
        }
        Ok(Self {
            samples: samples.into(),
        })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[derive(Debug, Default)]
struct AmbienceFlags {
    playing: AtomicBool,
    rewind: AtomicBool,
}

/// Control-side switch for the ambience loop. Cloning shares the same flags.
#[derive(Debug, Clone, Default)]
pub struct AmbienceControl {
    flags: Arc<AmbienceFlags>,
}

impl AmbienceControl {
    pub fn start(&self) {
        self.flags.playing.store(true, Ordering::Release);
    }

    /// Stops the loop and rewinds it to the beginning.
    pub fn stop(&self) {
        self.flags.playing.store(false, Ordering::Release);
        self.flags.rewind.store(true, Ordering::Release);
    }

    pub fn is_playing(&self) -> bool {
        self.flags.playing.load(Ordering::Acquire)
    }

    fn take_rewind(&self) -> bool {
        self.flags.rewind.swap(false, Ordering::AcqRel)
    }
}

/// Audio-thread side of the ambience loop.
#[derive(Debug)]
pub struct AmbienceMixer {
    track: AmbienceTrack,
    position: usize,
    gain: f32,
    control: AmbienceControl,
}

impl AmbienceMixer {
    pub fn new(track: AmbienceTrack, gain: f32, control: AmbienceControl) -> Self {
        Self {
            track,
            position: 0,
            gain: gain.clamp(0.0, 1.0),
            control,
        }
    }

    /// Adds the loop onto `out` in place, clamping the sum to [-1, 1].
    pub fn mix_into(&mut self, out: &mut [f32]) {
        if self.control.take_rewind() {
            self.position = 0;
        }
        if !self.control.is_playing() || self.track.is_empty() {
            return;
        }
        let samples = &self.track.samples;
        for sample in out.iter_mut() {
            *sample = (*sample + samples[self.position] * self.gain).clamp(-1.0, 1.0);
            self.position += 1;
            if self.position == samples.len() {
                self.position = 0;
            }
        }
    }
}
