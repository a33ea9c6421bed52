//! Voice activity segmentation
//!
//! Folds a stream of capture frames into bounded speech segments using RMS
//! thresholding with a silence hangover. Brief sub-threshold frames inside an
//! utterance are kept so mid-sentence pauses are not clipped.

use std::time::{Duration, Instant};

use crate::config::SegmenterConfig;
use crate::voice::AudioFrame;

/// Accumulated speech ready for transcription
#[derive(Debug, Clone)]
pub struct SpeechSegment {
    /// Little-endian 16-bit PCM, including trailing hangover frames
    pub pcm: Vec<u8>,
    /// Sample rate of `pcm`
    pub sample_rate: u32,
    /// Timestamp of the first voiced frame
    pub started_at: Instant,
    /// End of the last voiced frame
    pub ended_at: Instant,
}

impl SpeechSegment {
    /// Voiced span of the segment
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.ended_at.saturating_duration_since(self.started_at)
    }
}

/// Something the segmenter noticed while folding a frame
#[derive(Debug, Clone)]
pub enum SegmenterEvent {
    /// First voiced frame of a new utterance
    SpeechStarted {
        /// RMS of the triggering frame
        rms: u32,
    },
    /// Utterance finished and is long enough to transcribe
    Segment(SpeechSegment),
    /// Utterance finished but was too short
    Discarded {
        /// Voiced span that was dropped
        duration: Duration,
    },
}

/// Energy-based voice activity segmenter
pub struct Segmenter {
    config: SegmenterConfig,
    in_speech: bool,
    speech_start: Option<Instant>,
    last_speech_end: Option<Instant>,
    buffer: Vec<u8>,
}

impl Segmenter {
    /// Create a segmenter with the given tunables
    #[must_use]
    pub fn new(config: SegmenterConfig) -> Self {
        tracing::debug!(
            threshold = config.speech_rms_threshold,
            silence_ms = config.silence_after_speech.as_millis(),
            min_speech_ms = config.min_speech.as_millis(),
            "segmenter initialized"
        );

        Self {
            config,
            in_speech: false,
            speech_start: None,
            last_speech_end: None,
            buffer: Vec::new(),
        }
    }

    /// Fold one frame into the segmenter state
    pub fn process(&mut self, frame: &AudioFrame) -> Option<SegmenterEvent> {
        let rms = frame.rms();
        let now = frame.captured_at;

        if rms > self.config.speech_rms_threshold {
            let mut event = None;
            if !self.in_speech {
                self.in_speech = true;
                self.speech_start = Some(now);
                self.buffer.clear();
                tracing::debug!(rms, "speech start");
                event = Some(SegmenterEvent::SpeechStarted { rms });
            }
            self.last_speech_end = Some(now + self.frame_duration(frame));
            frame.write_le_bytes(&mut self.buffer);
            return event;
        }

        if !self.in_speech {
            return None;
        }

        // Keep short gaps so pauses inside a sentence survive
        frame.write_le_bytes(&mut self.buffer);

        let last_speech_end = self.last_speech_end.unwrap_or(now);
        let silence = now.saturating_duration_since(last_speech_end);
        if silence < self.config.silence_after_speech {
            return None;
        }

        Some(self.finalize(last_speech_end))
    }

    /// Drop any partially accumulated utterance
    pub fn reset(&mut self) {
        self.in_speech = false;
        self.speech_start = None;
        self.last_speech_end = None;
        self.buffer.clear();
    }

    /// Whether an utterance is currently being accumulated
    #[must_use]
    pub const fn in_speech(&self) -> bool {
        self.in_speech
    }

    /// Tunables in use
    #[must_use]
    pub const fn config(&self) -> &SegmenterConfig {
        &self.config
    }

    fn finalize(&mut self, ended_at: Instant) -> SegmenterEvent {
        let started_at = self.speech_start.unwrap_or(ended_at);
        let pcm = std::mem::take(&mut self.buffer);
        self.reset();

        let segment = SpeechSegment {
            pcm,
            sample_rate: self.config.sample_rate,
            started_at,
            ended_at,
        };
        let duration = segment.duration();

        if duration >= self.config.min_speech {
            tracing::debug!(
                duration_ms = duration.as_millis(),
                pcm_bytes = segment.pcm.len(),
                "speech end"
            );
            SegmenterEvent::Segment(segment)
        } else {
            tracing::trace!(duration_ms = duration.as_millis(), "speech too short, discarded");
            SegmenterEvent::Discarded { duration }
        }
    }

    fn frame_duration(&self, frame: &AudioFrame) -> Duration {
        let samples = u64::try_from(frame.samples.len()).unwrap_or(u64::MAX);
        Duration::from_micros(samples * 1_000_000 / u64::from(self.config.sample_rate.max(1)))
    }
}

/// Detects the user talking over assistant playback
///
/// Uses a higher bar than the segmenter so the assistant's own voice leaking
/// into the microphone does not trigger an interruption.
#[derive(Debug, Clone, Copy)]
pub struct BargeInDetector {
    threshold: u32,
}

impl BargeInDetector {
    /// Create a detector from segmenter tunables
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    #[must_use]
    pub fn new(config: &SegmenterConfig) -> Self {
        let threshold =
            (f64::from(config.speech_rms_threshold) * f64::from(config.barge_in_multiplier)) as u32;
        Self { threshold }
    }

    /// Returns the frame RMS when it is loud enough to count as barge-in
    #[must_use]
    pub fn check(&self, frame: &AudioFrame) -> Option<u32> {
        let rms = frame.rms();
        (rms > self.threshold).then_some(rms)
    }

    /// Effective RMS threshold
    #[must_use]
    pub const fn threshold(&self) -> u32 {
        self.threshold
    }
}
