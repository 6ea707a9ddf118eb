//! Playback ring buffer and its control channel.
//!
//! The audio callback owns a [`PlaybackProcessor`]. The control side holds the
//! matching [`PlaybackHandle`] and talks to the processor only through one-way,
//! non-blocking messages:
//!
//! - `append`: PCM16 is decoded (and resampled to the device rate) on the
//!   control side, then the f32 chunk moves through a lock-free SPSC queue.
//! - `flush`: an epoch bump on a shared atomic. The processor checks the epoch
//!   at the start of every quantum, so stale audio stops within one quantum and
//!   a flush can never be lost to a full queue. Chunks carry the epoch they
//!   were sent in; older ones are discarded, a newer one starts a fresh buffer.
//!
//! The render path never touches the allocator. Buffer growth is decided on
//! the control side, which sends the larger storage ahead of the chunk that
//! needs it, and every spent vector goes back over a return queue to be freed
//! by the control side.

use crate::{
    ambience::AmbienceMixer,
    audio_utils::{self, StreamResampler},
    error::CallError,
};
use ringbuf::{
    HeapCons, HeapProd, HeapRb,
    traits::{Consumer, Producer, Split},
};
use std::sync::{
    Arc,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};
use tracing::debug;

/// Number of commands that may be in flight between the control side and the audio thread.
pub const DEFAULT_COMMAND_CAPACITY: usize = 1024;

/// Initial sample capacity of the playback buffer (5 s at 48 kHz).
pub const DEFAULT_BUFFER_CAPACITY: usize = 240_000;

/// A circular sample queue with a read cursor that grows only on overflow.
///
/// Consumed samples are dropped as soon as they are read, so memory tracks
/// the unread backlog, not the length of the utterance.
#[derive(Debug)]
pub struct PlaybackBuffer {
    samples: Vec<f32>,
    head: usize,
    len: usize,
}

impl PlaybackBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: vec![0.0; capacity.max(1)],
            head: 0,
            len: 0,
        }
    }

    /// Unread samples.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.samples.len()
    }

    /// Appends samples after the unread tail, growing if they do not fit.
    pub fn append(&mut self, chunk: &[f32]) {
        self.reserve(chunk.len());
        for &sample in chunk {
            self.push(sample);
        }
    }

    /// Fills `out` with unread samples and pads the rest with silence.
    ///
    /// Returns how many real samples were written. Never blocks, never fails.
    pub fn pull(&mut self, out: &mut [f32]) -> usize {
        let n = out.len().min(self.len);
        let capacity = self.samples.len();
        let first = n.min(capacity - self.head);
        out[..first].copy_from_slice(&self.samples[self.head..self.head + first]);
        out[first..n].copy_from_slice(&self.samples[..n - first]);
        out[n..].fill(0.0);

        self.head = (self.head + n) % capacity;
        self.len -= n;
        if self.len == 0 {
            self.head = 0;
        }
        n
    }

    /// Discards every buffered sample and resets the read cursor.
    pub fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
    }

    /// Moves the unread samples into `storage` and returns the old backing store.
    ///
    /// `storage` is used as is, without allocating. If it is too small to hold
    /// the unread samples it is handed straight back and nothing changes.
    pub fn replace_storage(&mut self, mut storage: Vec<f32>) -> Vec<f32> {
        if storage.is_empty() || storage.len() < self.len {
            return storage;
        }
        self.unroll_into(&mut storage);
        self.head = 0;
        std::mem::replace(&mut self.samples, storage)
    }

    fn push(&mut self, sample: f32) {
        let capacity = self.samples.len();
        let tail = (self.head + self.len) % capacity;
        self.samples[tail] = sample;
        self.len += 1;
    }

    /// Copies the unread samples, in order, to the front of `target`.
    fn unroll_into(&self, target: &mut [f32]) {
        let capacity = self.samples.len();
        let first = self.len.min(capacity - self.head);
        target[..first].copy_from_slice(&self.samples[self.head..self.head + first]);
        target[first..self.len].copy_from_slice(&self.samples[..self.len - first]);
    }

    /// Grows (doubling) so that `additional` more samples fit, unrolling the
    /// wrapped region so unread samples stay in order.
    fn reserve(&mut self, additional: usize) {
        let required = self.len + additional;
        let capacity = self.samples.len();
        if required <= capacity {
            return;
        }
        let grown = vec![0.0; grown_capacity(capacity, required)];
        self.replace_storage(grown);
    }
}

fn grown_capacity(capacity: usize, required: usize) -> usize {
    let mut new_capacity = capacity.max(1);
    while new_capacity < required {
        new_capacity *= 2;
    }
    new_capacity
}

/// A message in flight to the audio thread.
#[derive(Debug)]
enum PlaybackCommand {
    /// Decoded samples, tagged with the flush epoch they were sent in.
    Append { epoch: u64, samples: Vec<f32> },
    /// Larger backing storage, allocated on the control side.
    Grow(Vec<f32>),
    /// The background loop to mix under the speech output.
    Ambience(AmbienceMixer),
}

/// State shared by both ends of the channel.
#[derive(Debug, Default)]
struct Shared {
    epoch: AtomicU64,
    /// Samples the processor has taken off the queue, played or discarded.
    applied: AtomicU64,
    /// Unread samples in the processor's buffer. Stored before `applied`.
    buffered: AtomicUsize,
}

/// Control-side end of the playback channel.
pub struct PlaybackHandle {
    commands: HeapProd<PlaybackCommand>,
    spent: HeapCons<Vec<f32>>,
    shared: Arc<Shared>,
    /// Buffer capacity the processor has, or will have once queued growth lands.
    capacity: usize,
    /// Samples sent in `Append` commands.
    sent: u64,
    resampler: Option<StreamResampler>,
}

impl PlaybackHandle {
    /// Decodes PCM16LE bytes at the wire rate and queues them for playback.
    pub fn append_pcm16_le(&mut self, bytes: &[u8]) -> Result<(), CallError> {
        let samples = audio_utils::decode_pcm16_le(bytes);
        let samples = match self.resampler.as_mut() {
            Some(resampler) => resampler.process(&samples),
            None => samples,
        };
        self.append(samples)
    }

    /// Queues samples that are already at the device rate.
    pub fn append(&mut self, samples: Vec<f32>) -> Result<(), CallError> {
        self.reclaim();
        if samples.is_empty() {
            return Ok(());
        }

        // An upper bound on what the buffer will hold once this chunk lands.
        // `applied` is read first so a concurrent update can only overestimate.
        let applied = self.shared.applied.load(Ordering::Acquire);
        let buffered = self.shared.buffered.load(Ordering::Acquire);
        let in_flight = self.sent.saturating_sub(applied) as usize;
        let required = buffered + in_flight + samples.len();
        if required > self.capacity {
            let new_capacity = grown_capacity(self.capacity, required);
            self.commands
                .try_push(PlaybackCommand::Grow(vec![0.0; new_capacity]))
                .map_err(|_| queue_full())?;
            debug!(
                from = self.capacity,
                to = new_capacity,
                "Growing playback buffer"
            );
            self.capacity = new_capacity;
        }

        let len = samples.len() as u64;
        let epoch = self.shared.epoch.load(Ordering::Acquire);
        self.commands
            .try_push(PlaybackCommand::Append { epoch, samples })
            .map_err(|_| queue_full())?;
        self.sent += len;
        Ok(())
    }

    /// Drops everything buffered or in flight; silence from the next quantum.
    pub fn flush(&mut self) {
        self.shared.epoch.fetch_add(1, Ordering::AcqRel);
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
        }
        self.reclaim();
    }

    /// Converts appended PCM16 from `wire_rate` to `device_rate`. Equal rates
    /// turn conversion off.
    pub fn resample(&mut self, wire_rate: u32, device_rate: u32) -> anyhow::Result<()> {
        self.resampler = if wire_rate == device_rate {
            None
        } else {
            Some(StreamResampler::new(wire_rate, device_rate)?)
        };
        Ok(())
    }

    /// Hands the processor a background loop to mix under the speech output.
    pub fn set_ambience(&mut self, mixer: AmbienceMixer) -> Result<(), CallError> {
        self.reclaim();
        self.commands
            .try_push(PlaybackCommand::Ambience(mixer))
            .map_err(|_| queue_full())
    }

    /// Frees vectors the processor has finished with.
    fn reclaim(&mut self) {
        while self.spent.try_pop().is_some() {}
    }
}

fn queue_full() -> CallError {
    CallError::Playback("playback queue is full".into())
}

/// Audio-thread end of the playback channel.
pub struct PlaybackProcessor {
    commands: HeapCons<PlaybackCommand>,
    spent: HeapProd<Vec<f32>>,
    shared: Arc<Shared>,
    seen_epoch: u64,
    buffer: PlaybackBuffer,
    ambience: Option<AmbienceMixer>,
}

/// Creates a connected handle/processor pair.
pub fn playback_channel(
    command_capacity: usize,
    buffer_capacity: usize,
) -> (PlaybackHandle, PlaybackProcessor) {
    let (commands_tx, commands_rx) = HeapRb::<PlaybackCommand>::new(command_capacity).split();
    // Every command returns at most one vector and the control side drains
    // before each push, so this never fills.
    let (spent_tx, spent_rx) = HeapRb::<Vec<f32>>::new(2 * command_capacity + 1).split();
    let shared = Arc::new(Shared::default());
    let buffer = PlaybackBuffer::with_capacity(buffer_capacity);
    (
        PlaybackHandle {
            commands: commands_tx,
            spent: spent_rx,
            shared: shared.clone(),
            capacity: buffer.capacity(),
            sent: 0,
            resampler: None,
        },
        PlaybackProcessor {
            commands: commands_rx,
            spent: spent_tx,
            shared,
            seen_epoch: 0,
            buffer,
            ambience: None,
        },
    )
}

impl PlaybackProcessor {
    /// Produces one quantum of mono output.
    pub fn render(&mut self, out: &mut [f32]) {
        self.observe_flush();
        self.drain_commands();
        self.buffer.pull(out);
        self.shared
            .buffered
            .store(self.buffer.len(), Ordering::Release);
        if let Some(ambience) = self.ambience.as_mut() {
            ambience.mix_into(out);
        }
    }

    /// Produces one quantum of interleaved output, duplicating mono to every channel.
    pub fn render_interleaved(&mut self, out: &mut [f32], channels: usize) {
        if channels <= 1 {
            self.render(out);
            return;
        }
        let frames = out.len() / channels;
        self.render(&mut out[..frames]);
        // Expand back to front so no frame is overwritten before it is read.
        for frame in (0..frames).rev() {
            let sample = out[frame];
            out[frame * channels..(frame + 1) * channels].fill(sample);
        }
        out[frames * channels..].fill(0.0);
    }

    /// Unread samples currently held by the buffer.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn observe_flush(&mut self) {
        let epoch = self.shared.epoch.load(Ordering::Acquire);
        if epoch > self.seen_epoch {
            self.start_epoch(epoch);
        }
    }

    fn start_epoch(&mut self, epoch: u64) {
        self.buffer.clear();
        self.seen_epoch = epoch;
    }

    fn drain_commands(&mut self) {
        let mut applied = 0u64;
        while let Some(command) = self.commands.try_pop() {
            match command {
                PlaybackCommand::Append { epoch, samples } => {
                    // A flush may land between `observe_flush` and this pop.
                    if epoch > self.seen_epoch {
                        self.start_epoch(epoch);
                    }
                    if epoch == self.seen_epoch {
                        // Capacity was grown ahead of this chunk.
                        self.buffer.append(&samples);
                    }
                    applied += samples.len() as u64;
                    self.recycle(samples);
                }
                PlaybackCommand::Grow(storage) => {
                    let old = self.buffer.replace_storage(storage);
                    self.recycle(old);
                }
                PlaybackCommand::Ambience(mixer) => {
                    // Installed at most once per channel.
                    if self.ambience.is_none() {
                        self.ambience = Some(mixer);
                    }
                }
            }
        }
        if applied > 0 {
            self.shared
                .buffered
                .store(self.buffer.len(), Ordering::Release);
            self.shared.applied.fetch_add(applied, Ordering::Release);
        }
    }

    fn recycle(&mut self, spent: Vec<f32>) {
        // The return queue is sized so this push always succeeds.
        let _ = self.spent.try_push(spent);
    }
}
