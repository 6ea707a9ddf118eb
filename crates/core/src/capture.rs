//! Capture encoder: turns microphone samples into upload messages.
//!
//! The device callback pushes mono f32 samples into a lock-free ring. On every
//! capture tick the encoder drains whatever arrived, resamples it to the
//! agent's rate, and wraps it as a base64 PCM16 `user_audio` message. Chunk
//! length therefore follows device timing, not a fixed sample count.

use crate::{
    audio_utils::{self, StreamResampler},
    protocol::ClientMessage,
};
use ringbuf::{
    HeapCons, HeapProd, HeapRb,
    traits::{Consumer, Split},
};
use tracing::{debug, info};

/// Producer half, written by the input device callback.
pub type CaptureProducer = HeapProd<f32>;

/// Consumer half, drained by the encoder.
pub type CaptureConsumer = HeapCons<f32>;

/// Creates the ring that carries captured samples off the device thread.
pub fn capture_ring(capacity: usize) -> (CaptureProducer, CaptureConsumer) {
    HeapRb::<f32>::new(capacity).split()
}

#[derive(Debug, Clone, PartialEq)]
enum Greeting {
    Pending(String),
    Done,
}

pub struct CaptureEncoder {
    samples: CaptureConsumer,
    resampler: Option<StreamResampler>,
    greeting: Greeting,
    scratch: Vec<f32>,
}

impl CaptureEncoder {
    /// `source_rate` is the device rate; `target_rate` the rate the agent expects.
    pub fn new(
        samples: CaptureConsumer,
        source_rate: u32,
        target_rate: u32,
        greeting: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let resampler = if source_rate == target_rate {
            None
        } else {
            Some(StreamResampler::new(source_rate, target_rate)?)
        };
        Ok(Self {
            samples,
            resampler,
            greeting: Greeting::Pending(greeting.into()),
            scratch: Vec::new(),
        })
    }

    /// Drains everything captured since the last call, at the target rate.
    pub fn take_chunk(&mut self) -> Vec<f32> {
        self.scratch.clear();
        self.scratch.extend(self.samples.pop_iter());
        match self.resampler.as_mut() {
            Some(resampler) => resampler.process(&self.scratch),
            None => self.scratch.clone(),
        }
    }

    /// Runs one capture tick and returns the messages to send, in order.
    ///
    /// The greeting decision is made once, on the first non-empty chunk: it is
    /// sent ahead of that chunk if the connection is open, otherwise never.
    /// Audio captured while the connection is not open is dropped.
    pub fn poll(&mut self, connection_open: bool) -> Vec<ClientMessage> {
        let chunk = self.take_chunk();
        if chunk.is_empty() {
            return vec![];
        }

        let mut messages = Vec::with_capacity(2);
        if let Greeting::Pending(text) = std::mem::replace(&mut self.greeting, Greeting::Done) {
            if connection_open && !text.is_empty() {
                info!("Sending greeting context ahead of user audio");
                messages.push(ClientMessage::GreetingMessage(text));
            } else {
                debug!(connection_open, "Greeting not sent");
            }
        }

        if !connection_open {
            debug!(samples = chunk.len(), "Connection not open, dropping captured audio");
            return messages;
        }
        messages.push(ClientMessage::UserAudio(
            audio_utils::encode_f32_to_base64_pcm16(&chunk),
        ));
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;
    use ringbuf::traits::Producer;

    fn decode_user_audio(data: &str) -> Vec<f32> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(data)
            .unwrap();
        audio_utils::decode_pcm16_le(&bytes)
    }

    fn encoder(source_rate: u32, target_rate: u32) -> (CaptureProducer, CaptureEncoder) {
        let (producer, consumer) = capture_ring(100_000);
        let encoder = CaptureEncoder::new(consumer, source_rate, target_rate, "Hello!").unwrap();
        (producer, encoder)
    }

    #[test]
    fn test_nothing_sent_without_samples() {
        let (_producer, mut encoder) = encoder(16_000, 16_000);
        assert!(encoder.poll(true).is_empty());
    }

    #[test]
    fn test_greeting_precedes_first_chunk_only() {
        let (mut producer, mut encoder) = encoder(16_000, 16_000);
        producer.push_slice(&[0.5; 10]);
        let first = encoder.poll(true);
        assert_eq!(first.len(), 2);
        assert_eq!(first[0], ClientMessage::GreetingMessage("Hello!".into()));
        match &first[1] {
            ClientMessage::UserAudio(data) => {
                assert_eq!(decode_user_audio(data), vec![0.5; 10]);
            }
            other => panic!("unexpected message {other:?}"),
        }

        producer.push_slice(&[0.25; 3]);
        let second = encoder.poll(true);
        assert_eq!(second.len(), 1);
        assert!(matches!(second[0], ClientMessage::UserAudio(_)));
    }

    #[test]
    fn test_variable_chunk_lengths() {
        let (mut producer, mut encoder) = encoder(16_000, 16_000);
        producer.push_slice(&[0.1; 3998]);
        let a = encoder.take_chunk();
        producer.push_slice(&[0.1; 4003]);
        let b = encoder.take_chunk();
        assert_eq!(a.len(), 3998);
        assert_eq!(b.len(), 4003);
    }

    #[test]
    fn test_closed_connection_drops_audio_and_skips_greeting() {
        let (mut producer, mut encoder) = encoder(16_000, 16_000);
        producer.push_slice(&[0.5; 10]);
        assert!(encoder.poll(false).is_empty());

        producer.push_slice(&[0.5; 10]);
        let later = encoder.poll(true);
        assert_eq!(later.len(), 1);
        assert!(matches!(later[0], ClientMessage::UserAudio(_)));
    }

    #[test]
    fn test_resamples_to_target_rate() {
        let (mut producer, mut encoder) = encoder(48_000, 16_000);
        producer.push_slice(&vec![0.0; 48_000]);
        let chunk = encoder.take_chunk();
        assert!(chunk.len() > 15_000 && chunk.len() <= 16_000, "{}", chunk.len());
    }

    #[test]
    fn test_empty_greeting_is_never_sent() {
        let (mut producer, consumer) = capture_ring(64);
        let mut encoder = CaptureEncoder::new(consumer, 16_000, 16_000, "").unwrap();
        producer.push_slice(&[0.5; 4]);
        let messages = encoder.poll(true);
        assert_eq!(messages.len(), 1);
        assert!(matches!(messages[0], ClientMessage::UserAudio(_)));
    }
}
