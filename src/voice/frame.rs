//! Fixed-duration PCM frames

use std::time::Instant;

/// Sample rate for audio capture (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

/// Capture frame duration in milliseconds
pub const FRAME_MS: u32 = 20;

/// Number of samples in one capture frame at [`SAMPLE_RATE`]
pub const FRAME_SAMPLES: usize = (SAMPLE_RATE / (1000 / FRAME_MS)) as usize;

/// A chunk of mono 16-bit PCM captured from the microphone
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Signed 16-bit samples
    pub samples: Vec<i16>,
    /// Monotonic capture timestamp
    pub captured_at: Instant,
}

impl AudioFrame {
    /// Create a frame stamped with the current instant
    #[must_use]
    pub fn new(samples: Vec<i16>) -> Self {
        Self {
            samples,
            captured_at: Instant::now(),
        }
    }

    /// Create a frame with an explicit timestamp
    #[must_use]
    pub const fn at(samples: Vec<i16>, captured_at: Instant) -> Self {
        Self {
            samples,
            captured_at,
        }
    }

    /// Root-mean-square amplitude of the frame
    #[must_use]
    pub fn rms(&self) -> u32 {
        rms(&self.samples)
    }

    /// Append the samples as little-endian bytes
    pub fn write_le_bytes(&self, out: &mut Vec<u8>) {
        out.reserve(self.samples.len() * 2);
        for sample in &self.samples {
            out.extend_from_slice(&sample.to_le_bytes());
        }
    }
}

/// Calculate RMS amplitude of 16-bit samples (0..=32768)
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
#[must_use]
pub fn rms(samples: &[i16]) -> u32 {
    if samples.is_empty() {
        return 0;
    }

    let sum_squares: i64 = samples
        .iter()
        .map(|&s| {
            let s = i64::from(s);
            s * s
        })
        .sum();

    (sum_squares as f64 / samples.len() as f64).sqrt() as u32
}
