//! Audio capture from microphone
//!
//! cpal streams are not `Send`, so each capture stream lives on its own
//! thread and hands samples to the async side over a channel.

use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SampleRate, SizedSample, StreamConfig};
use tokio::sync::mpsc;

use crate::config::SegmenterConfig;
use crate::voice::{AudioFrame, AudioInput, AudioSource};
use crate::{Error, Result};

/// Default input device, captured mono at the segmenter's rate and cadence
#[derive(Debug, Clone, Copy)]
pub struct MicrophoneInput {
    sample_rate: u32,
    frame_samples: usize,
}

impl MicrophoneInput {
    /// Create a microphone input handle framed for `config`
    #[must_use]
    pub fn new(config: &SegmenterConfig) -> Self {
        Self {
            sample_rate: config.sample_rate,
            frame_samples: config.frame_samples(),
        }
    }

    /// Capture sample rate
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl Default for MicrophoneInput {
    fn default() -> Self {
        Self::new(&SegmenterConfig::default())
    }
}

impl AudioInput for MicrophoneInput {
    fn has_permission(&self) -> bool {
        cpal::default_host().default_input_device().is_some()
    }

    fn open(&self) -> Result<Box<dyn AudioSource>> {
        Ok(Box::new(MicrophoneSource::start(
            self.sample_rate,
            self.frame_samples,
        )?))
    }
}

/// Regroups device callbacks of arbitrary size into fixed-size frames
#[derive(Debug)]
struct FrameAssembler {
    pending: Vec<i16>,
    frame_samples: usize,
}

impl FrameAssembler {
    fn new(frame_samples: usize) -> Self {
        let frame_samples = frame_samples.max(1);
        Self {
            pending: Vec::with_capacity(frame_samples * 4),
            frame_samples,
        }
    }

    fn push(&mut self, chunk: &[i16]) {
        self.pending.extend_from_slice(chunk);
    }

    /// Next complete frame, if enough samples are buffered
    fn pop(&mut self) -> Option<Vec<i16>> {
        (self.pending.len() >= self.frame_samples)
            .then(|| self.pending.drain(..self.frame_samples).collect())
    }

    fn clear(&mut self) {
        self.pending.clear();
    }
}

/// Running capture stream
pub struct MicrophoneSource {
    samples: mpsc::UnboundedReceiver<Vec<i16>>,
    frames: FrameAssembler,
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl MicrophoneSource {
    /// Open the default input device and start capturing
    ///
    /// # Errors
    ///
    /// Returns error if no input device or suitable config is available
    pub fn start(sample_rate: u32, frame_samples: usize) -> Result<Self> {
        let (sample_tx, sample_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<()>>();

        let thread = std::thread::Builder::new()
            .name("talk-capture".to_string())
            .spawn(move || {
                let stream = match build_input_stream(sample_rate, sample_tx) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // Hold the stream until asked to stop or the source is dropped
                let _ = stop_rx.recv();
                drop(stream);
                tracing::debug!("audio capture stopped");
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(Error::DeviceUnavailable(
                    "capture thread exited during startup".to_string(),
                ));
            }
        }

        tracing::debug!("audio capture started");
        Ok(Self {
            samples: sample_rx,
            frames: FrameAssembler::new(frame_samples),
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        })
    }
}

#[async_trait]
impl AudioSource for MicrophoneSource {
    async fn next_frame(&mut self) -> Result<Option<AudioFrame>> {
        loop {
            if let Some(frame) = self.frames.pop() {
                return Ok(Some(AudioFrame::new(frame)));
            }
            match self.samples.recv().await {
                Some(chunk) => self.frames.push(&chunk),
                None => return Ok(None),
            }
        }
    }

    fn close(&mut self) {
        if let Some(stop) = self.stop_tx.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        self.samples.close();
        self.frames.clear();
    }
}

impl Drop for MicrophoneSource {
    fn drop(&mut self) {
        self.close();
    }
}

fn build_input_stream(
    sample_rate: u32,
    tx: mpsc::UnboundedSender<Vec<i16>>,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();

    let device = host
        .default_input_device()
        .ok_or_else(|| Error::DeviceUnavailable("no input device available".to_string()))?;

    let supported_config = device
        .supported_input_configs()
        .map_err(|e| Error::DeviceUnavailable(e.to_string()))?
        .find(|c| {
            c.channels() == 1
                && c.min_sample_rate() <= SampleRate(sample_rate)
                && c.max_sample_rate() >= SampleRate(sample_rate)
        })
        .ok_or_else(|| Error::DeviceUnavailable("no suitable audio config found".to_string()))?;

    let sample_format = supported_config.sample_format();
    let config: StreamConfig = supported_config
        .with_sample_rate(SampleRate(sample_rate))
        .config();

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate,
        channels = config.channels,
        ?sample_format,
        "audio capture initialized"
    );

    let stream = match sample_format {
        SampleFormat::I16 => open_stream::<i16>(&device, &config, tx),
        SampleFormat::U16 => open_stream::<u16>(&device, &config, tx),
        SampleFormat::I32 => open_stream::<i32>(&device, &config, tx),
        SampleFormat::F32 => open_stream::<f32>(&device, &config, tx),
        other => {
            return Err(Error::DeviceUnavailable(format!(
                "unsupported sample format: {other:?}"
            )));
        }
    }
    .map_err(|e| match e {
        cpal::BuildStreamError::DeviceNotAvailable => {
            Error::PermissionDenied("input device not available".to_string())
        }
        other => Error::DeviceUnavailable(other.to_string()),
    })?;

    stream
        .play()
        .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;

    Ok(stream)
}

/// Build an input stream that converts `T` samples to i16
fn open_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    tx: mpsc::UnboundedSender<Vec<i16>>,
) -> std::result::Result<cpal::Stream, cpal::BuildStreamError>
where
    T: SizedSample,
    i16: FromSample<T>,
{
    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            let _ = tx.send(to_i16(data));
        },
        |err: cpal::StreamError| tracing::error!(error = %err, "audio capture error"),
        None,
    )
}

fn to_i16<T>(data: &[T]) -> Vec<i16>
where
    T: Sample,
    i16: FromSample<T>,
{
    data.iter().map(|&s| s.to_sample::<i16>()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assembler_regroups_callbacks() {
        let mut frames = FrameAssembler::new(4);
        frames.push(&[1, 2, 3]);
        assert_eq!(frames.pop(), None);

        frames.push(&[4, 5, 6, 7, 8, 9]);
        assert_eq!(frames.pop(), Some(vec![1, 2, 3, 4]));
        assert_eq!(frames.pop(), Some(vec![5, 6, 7, 8]));
        assert_eq!(frames.pop(), None);

        frames.clear();
        frames.push(&[10, 11, 12]);
        assert_eq!(frames.pop(), None);
    }

    #[test]
    fn test_microphone_frames_follow_segmenter_config() {
        let config = SegmenterConfig {
            sample_rate: 24_000,
            frame: std::time::Duration::from_millis(10),
            ..SegmenterConfig::default()
        };
        let input = MicrophoneInput::new(&config);
        assert_eq!(input.sample_rate(), 24_000);
        assert_eq!(input.frame_samples, 240);
    }

    #[test]
    fn test_sample_formats_convert_to_i16() {
        assert_eq!(to_i16(&[0_i16, -5, 7]), vec![0, -5, 7]);
        assert_eq!(to_i16(&[32768_u16, 0, 65535]), vec![0, i16::MIN, i16::MAX]);
        assert_eq!(to_i16(&[0_i32, i32::MIN, i32::MAX]), vec![0, i16::MIN, i16::MAX]);
        assert_eq!(to_i16(&[0.0_f32, -1.0]), vec![0, i16::MIN]);
    }
}
