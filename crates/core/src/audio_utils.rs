use base64::Engine;
use rubato::{FastFixedIn, PolynomialDegree, Resampler};

// Standard sample rates for the agent's wire audio
pub const DEFAULT_PLAYBACK_SAMPLE_RATE: u32 = 24_000;
pub const DEFAULT_CAPTURE_SAMPLE_RATE: u32 = 16_000;

/// Divisor that maps a signed 16-bit sample onto [-1, 1).
pub const PCM16_SCALE: f32 = 32768.0;

/// Input frames consumed per resampler pass.
const RESAMPLER_CHUNK_FRAMES: usize = 512;

/// Creates a resampler to convert between audio sample rates.
pub fn create_resampler(
    in_sampling_rate: f64,
    out_sampling_rate: f64,
    chunk_size: usize,
) -> anyhow::Result<FastFixedIn<f32>> {
    let resampler = FastFixedIn::<f32>::new(
        out_sampling_rate / in_sampling_rate,
        1.0,                     // No cutoff frequency, pass all frequencies
        PolynomialDegree::Cubic, // Cubic interpolation for quality
        chunk_size,
        1, // 1 channel (mono)
    )?;
    Ok(resampler)
}

/// Iterates the samples of a little-endian PCM16 byte slice as normalized f32.
///
/// A trailing odd byte is ignored.
pub fn pcm16_le_samples(bytes: &[u8]) -> impl Iterator<Item = f32> + '_ {
    bytes
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]) as f32 / PCM16_SCALE)
}

/// Decodes little-endian PCM16 bytes into f32 samples in [-1, 1).
pub fn decode_pcm16_le(bytes: &[u8]) -> Vec<f32> {
    pcm16_le_samples(bytes).collect()
}

/// Encodes f32 samples as little-endian PCM16 bytes, clamping out-of-range input.
pub fn encode_pcm16_le(pcm32: &[f32]) -> Vec<u8> {
    pcm32
        .iter()
        .flat_map(|&sample| {
            let v = (sample * PCM16_SCALE).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
            v.to_le_bytes()
        })
        .collect()
}

/// Encodes a slice of f32 samples into a base64 string (converting to PCM16 first).
pub fn encode_f32_to_base64_pcm16(pcm32: &[f32]) -> String {
    base64::engine::general_purpose::STANDARD.encode(encode_pcm16_le(pcm32))
}

/// Resamples a mono stream delivered in arbitrarily sized pieces.
///
/// `FastFixedIn` needs fixed-size input blocks, so input is staged until a
/// full block is available. Leftover frames carry over to the next call.
pub struct StreamResampler {
    inner: FastFixedIn<f32>,
    pending: Vec<f32>,
}

impl StreamResampler {
    pub fn new(in_rate: u32, out_rate: u32) -> anyhow::Result<Self> {
        Ok(Self {
            inner: create_resampler(in_rate as f64, out_rate as f64, RESAMPLER_CHUNK_FRAMES)?,
            pending: Vec::with_capacity(RESAMPLER_CHUNK_FRAMES * 2),
        })
    }

    /// Feeds `input` and returns every output frame that is ready.
    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        self.pending.extend_from_slice(input);
        let mut output = Vec::new();
        loop {
            let needed = self.inner.input_frames_next();
            if needed == 0 || self.pending.len() < needed {
                break;
            }
            match self.inner.process(&[&self.pending[..needed]], None) {
                Ok(res) => output.extend_from_slice(&res[0]),
                Err(e) => tracing::error!(error = %e, "Resampling failed, dropping block"),
            }
            self.pending.drain(..needed);
        }
        output
    }

    /// Discards staged input and the interpolation history, so the next
    /// call starts a fresh stream.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.inner.reset();
    }

    /// Number of input frames waiting for a full block.
    pub fn pending_frames(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_create_resampler() {
        assert!(create_resampler(16000.0, 24000.0, 1024).is_ok());
        assert!(create_resampler(24000.0, 24000.0, 1024).is_ok());
        assert!(create_resampler(48000.0, 16000.0, 1024).is_ok());
    }

    #[test]
    fn test_decode_pcm16_le_known_values() {
        // 16384 = 0x4000 -> [0x00, 0x40]; -32768 = 0x8000 -> [0x00, 0x80]
        let result = decode_pcm16_le(&[0x00, 0x40, 0x00, 0x80]);
        assert_eq!(result.len(), 2);
        assert_abs_diff_eq!(result[0], 0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(result[1], -1.0, epsilon = 1e-6);

        // A trailing odd byte cannot form a sample
        assert_eq!(decode_pcm16_le(&[0x00, 0x40, 0x7f]).len(), 1);
        assert!(decode_pcm16_le(&[]).is_empty());
    }

    #[test]
    fn test_decode_is_exact_division() {
        for v in [i16::MIN, -1, 0, 1, 12345, i16::MAX] {
            let decoded = decode_pcm16_le(&v.to_le_bytes());
            assert_eq!(decoded[0], v as f32 / 32768.0);
        }
    }

    #[test]
    fn test_pcm16_round_trip_within_quantization() {
        let original = [0.0f32, 0.1, -0.7, 0.99, -1.0, 0.123_456, -0.000_01];
        let decoded = decode_pcm16_le(&encode_pcm16_le(&original));
        assert_eq!(decoded.len(), original.len());
        for (o, d) in original.iter().zip(decoded.iter()) {
            assert!((o - d).abs() <= 1.0 / 32768.0, "{o} vs {d}");
        }
    }

    #[test]
    fn test_encode_clamps_out_of_range() {
        let decoded = decode_pcm16_le(&encode_pcm16_le(&[2.0, -2.0, 1.0]));
        assert_abs_diff_eq!(decoded[0], i16::MAX as f32 / 32768.0, epsilon = 1e-6);
        assert_abs_diff_eq!(decoded[1], -1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(decoded[2], i16::MAX as f32 / 32768.0, epsilon = 1e-6);
    }

    #[test]
    fn test_base64_encoding_is_pcm16_le() {
        let encoded = encode_f32_to_base64_pcm16(&[0.5, -0.25, 0.0]);
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(&encoded)
            .unwrap();
        assert_eq!(bytes, vec![0x00, 0x40, 0x00, 0xe0, 0x00, 0x00]);

        assert!(encode_f32_to_base64_pcm16(&[]).is_empty());
    }

    #[test]
    fn test_edge_cases() {
        let extreme = [f32::MAX, f32::MIN, f32::INFINITY, f32::NEG_INFINITY, f32::NAN];
        for value in decode_pcm16_le(&encode_pcm16_le(&extreme)) {
            assert!((-1.0..=1.0).contains(&value));
        }
    }

    #[test]
    fn test_stream_resampler_accepts_variable_chunks() {
        let mut resampler = StreamResampler::new(48_000, 16_000).unwrap();
        let mut produced = 0;
        // Ragged input lengths, 48000 frames in total
        for len in [100usize, 4000, 7, 2893, 41_000] {
            produced += resampler.process(&vec![0.25f32; len]).len();
        }
        let consumed = 48_000 - resampler.pending_frames();
        // Output tracks the 1/3 ratio of what was consumed
        let expected = consumed / 3;
        assert!(produced.abs_diff(expected) <= RESAMPLER_CHUNK_FRAMES, "{produced} vs {expected}");
        assert!(resampler.pending_frames() < 2 * RESAMPLER_CHUNK_FRAMES);
    }

    #[test]
    fn test_stream_resampler_reset_drops_staged_input() {
        let mut resampler = StreamResampler::new(24_000, 48_000).unwrap();
        assert!(resampler.process(&[0.5f32; 300]).is_empty());
        assert_eq!(resampler.pending_frames(), 300);

        resampler.reset();
        assert_eq!(resampler.pending_frames(), 0);
        // A full block after the reset is converted without the stale frames
        let output = resampler.process(&[0.5f32; RESAMPLER_CHUNK_FRAMES]);
        assert!(output.len().abs_diff(2 * RESAMPLER_CHUNK_FRAMES) <= 8, "{}", output.len());
        assert_eq!(resampler.pending_frames(), 0);
    }

    #[test]
    fn test_sample_rate_constants() {
        assert_eq!(DEFAULT_PLAYBACK_SAMPLE_RATE, 24_000);
        assert_eq!(DEFAULT_CAPTURE_SAMPLE_RATE, 16_000);
        assert!(StreamResampler::new(DEFAULT_CAPTURE_SAMPLE_RATE, DEFAULT_PLAYBACK_SAMPLE_RATE).is_ok());
    }
}
