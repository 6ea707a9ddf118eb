//! Audio device access: the output stream that renders playback and the
//! input stream that feeds the capture ring.
//!
//! `cpal::Stream` is `!Send` on some platforms, so every stream lives on its
//! own OS thread for its whole life. The caller gets a `Send` [`DeviceStream`]
//! guard; dropping it tells the thread to drop the stream and exit.

use async_trait::async_trait;
use cpal::{
    BufferSize, SampleFormat, StreamConfig,
    traits::{DeviceTrait, HostTrait, StreamTrait},
};
use ringbuf::traits::Producer;
use std::{sync::mpsc as std_mpsc, thread};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};
use voice_call_core::{
    audio_utils::PCM16_SCALE, capture::CaptureProducer, error::CallError,
    playback::PlaybackProcessor,
};

/// Which side of the audio pipeline a fault came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Input,
    Output,
}

/// An error raised by a running stream, reported from the device thread.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceFault {
    pub kind: DeviceKind,
    pub message: String,
}

impl DeviceFault {
    /// The call error this fault maps to. Both kinds are fatal.
    pub fn into_call_error(self) -> CallError {
        match self.kind {
            DeviceKind::Input => CallError::Microphone(self.message),
            DeviceKind::Output => CallError::Playback(self.message),
        }
    }
}

pub type FaultSender = mpsc::UnboundedSender<DeviceFault>;

/// A running device stream. Dropping it stops the stream.
pub struct DeviceStream {
    pub sample_rate: u32,
    pub channels: u16,
    stop: Option<Box<dyn FnOnce() + Send>>,
}

impl DeviceStream {
    pub fn new(sample_rate: u32, channels: u16, stop: impl FnOnce() + Send + 'static) -> Self {
        Self {
            sample_rate,
            channels,
            stop: Some(Box::new(stop)),
        }
    }
}

impl Drop for DeviceStream {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop();
        }
    }
}

impl std::fmt::Debug for DeviceStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceStream")
            .field("sample_rate", &self.sample_rate)
            .field("channels", &self.channels)
            .finish()
    }
}

/// Opens the platform's audio streams.
#[async_trait]
pub trait AudioBackend: Send + Sync {
    /// Opens the default output at its native rate; `processor` is driven
    /// from the device callback. The returned stream reports that rate.
    async fn open_output(
        &self,
        processor: PlaybackProcessor,
        faults: FaultSender,
    ) -> Result<DeviceStream, CallError>;

    /// Opens the default microphone and pushes mono samples into `samples`
    /// at the stream's native rate.
    async fn open_input(
        &self,
        samples: CaptureProducer,
        faults: FaultSender,
    ) -> Result<DeviceStream, CallError>;
}

/// [`AudioBackend`] on the default cpal host.
#[derive(Debug, Clone, Default)]
pub struct CpalBackend;

#[async_trait]
impl AudioBackend for CpalBackend {
    async fn open_output(
        &self,
        processor: PlaybackProcessor,
        faults: FaultSender,
    ) -> Result<DeviceStream, CallError> {
        spawn_stream_thread("call-playback", CallError::Playback, move || {
            build_output(processor, faults)
        })
        .await
    }

    async fn open_input(
        &self,
        samples: CaptureProducer,
        faults: FaultSender,
    ) -> Result<DeviceStream, CallError> {
        spawn_stream_thread("call-capture", CallError::Microphone, move || {
            build_input(samples, faults)
        })
        .await
    }
}

/// Builds a stream on a dedicated thread and keeps it there until the
/// returned guard is dropped.
async fn spawn_stream_thread<F>(
    name: &str,
    to_error: fn(String) -> CallError,
    build: F,
) -> Result<DeviceStream, CallError>
where
    F: FnOnce() -> Result<(cpal::Stream, u32, u16), CallError> + Send + 'static,
{
    let (init_tx, init_rx) = oneshot::channel();
    let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
    let thread_name = name.to_string();

    thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || match build() {
            Ok((stream, sample_rate, channels)) => {
                if init_tx.send(Ok((sample_rate, channels))).is_err() {
                    return;
                }
                // Blocks until the guard is dropped (stop sent or sender gone).
                let _ = stop_rx.recv();
                drop(stream);
                debug!(thread = %thread_name, "Audio stream stopped");
            }
            Err(e) => {
                let _ = init_tx.send(Err(e));
            }
        })
        .map_err(|e| to_error(format!("failed to spawn audio thread: {}", e)))?;

    let (sample_rate, channels) = init_rx
        .await
        .map_err(|_| to_error("audio thread exited during setup".to_string()))??;
    Ok(DeviceStream::new(sample_rate, channels, move || {
        let _ = stop_tx.send(());
    }))
}

/// Largest callback quantum the i16 path converts without allocating.
const OUTPUT_SCRATCH_SAMPLES: usize = 16_384;

fn build_output(
    mut processor: PlaybackProcessor,
    faults: FaultSender,
) -> Result<(cpal::Stream, u32, u16), CallError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| CallError::Playback("no output device available".into()))?;
    let default = device
        .default_output_config()
        .map_err(|e| CallError::Playback(e.to_string()))?;
    let sample_rate = default.sample_rate().0;
    let channels = default.channels();
    let config = StreamConfig {
        channels,
        sample_rate: default.sample_rate(),
        buffer_size: BufferSize::Default,
    };
    info!(
        device = %device.name().unwrap_or_default(),
        sample_rate,
        channels,
        format = ?default.sample_format(),
        "Opening output stream"
    );

    let err_fn = move |err: cpal::StreamError| {
        error!(%err, "Audio output stream error");
        let _ = faults.send(DeviceFault {
            kind: DeviceKind::Output,
            message: err.to_string(),
        });
    };

    let stream = match default.sample_format() {
        SampleFormat::F32 => device.build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                processor.render_interleaved(data, channels as usize);
            },
            err_fn,
            None,
        ),
        SampleFormat::I16 => {
            let mut scratch = vec![0.0f32; OUTPUT_SCRATCH_SAMPLES];
            // Whole frames only, so pieces never split a frame across channels.
            let frame_len = channels.max(1) as usize;
            let piece_len = OUTPUT_SCRATCH_SAMPLES / frame_len * frame_len;
            device.build_output_stream(
                &config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    // Oversized quanta are rendered in scratch-sized pieces.
                    for piece in data.chunks_mut(piece_len) {
                        let block = &mut scratch[..piece.len()];
                        processor.render_interleaved(block, channels as usize);
                        for (out, &sample) in piece.iter_mut().zip(block.iter()) {
                            *out = (sample * (PCM16_SCALE - 1.0)) as i16;
                        }
                    }
                },
                err_fn,
                None,
            )
        }
        format => {
            return Err(CallError::Playback(format!(
                "unsupported output sample format {:?}",
                format
            )));
        }
    }
    .map_err(|e| CallError::Playback(e.to_string()))?;

    stream.play().map_err(|e| CallError::Playback(e.to_string()))?;
    Ok((stream, sample_rate, channels))
}

fn build_input(
    mut samples: CaptureProducer,
    faults: FaultSender,
) -> Result<(cpal::Stream, u32, u16), CallError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| CallError::Microphone("no input device available".into()))?;
    let supported = device.default_input_config().map_err(|e| CallError::Microphone(e.to_string()))?;
    let sample_rate = supported.sample_rate().0;
    let channels = supported.channels();
    let config: StreamConfig = supported.clone().into();
    info!(
        device = %device.name().unwrap_or_default(),
        sample_rate,
        channels,
        format = ?supported.sample_format(),
        "Opening input stream"
    );

    let err_fn = move |err: cpal::StreamError| {
        error!(%err, "Audio input stream error");
        let _ = faults.send(DeviceFault {
            kind: DeviceKind::Input,
            message: err.to_string(),
        });
    };
    let frame_len = channels.max(1) as usize;

    let stream = match supported.sample_format() {
        SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                for frame in data.chunks(frame_len) {
                    let mono = frame.iter().sum::<f32>() / frame.len() as f32;
                    // A full ring drops samples rather than blocking the device.
                    let _ = samples.try_push(mono);
                }
            },
            err_fn,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                for frame in data.chunks(frame_len) {
                    let sum: f32 = frame.iter().map(|&s| f32::from(s) / PCM16_SCALE).sum();
                    let _ = samples.try_push(sum / frame.len() as f32);
                }
            },
            err_fn,
            None,
        ),
        format => {
            return Err(CallError::Microphone(format!(
                "unsupported input sample format {:?}",
                format
            )));
        }
    }
    .map_err(|e| CallError::Microphone(e.to_string()))?;

    stream.play().map_err(|e| CallError::Microphone(e.to_string()))?;
    Ok((stream, sample_rate, channels))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    #[test]
    fn test_dropping_stream_runs_stop_once() {
        let stops = Arc::new(AtomicUsize::new(0));
        let counter = stops.clone();
        let stream = DeviceStream::new(24_000, 2, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(stream.sample_rate, 24_000);
        drop(stream);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fault_maps_to_fatal_error() {
        let input = DeviceFault {
            kind: DeviceKind::Input,
            message: "device unplugged".into(),
        };
        let err = input.into_call_error();
        assert_eq!(err, CallError::Microphone("device unplugged".into()));
        assert!(err.is_fatal());

        let output = DeviceFault {
            kind: DeviceKind::Output,
            message: "underrun".into(),
        };
        assert!(matches!(output.into_call_error(), CallError::Playback(_)));
    }

    #[tokio::test]
    async fn test_stream_thread_build_error_is_returned() {
        let result = spawn_stream_thread("test-audio", CallError::Playback, || {
            Err(CallError::Playback("no output device available".into()))
        })
        .await;
        assert_eq!(
            result.unwrap_err(),
            CallError::Playback("no output device available".into())
        );
    }
}
