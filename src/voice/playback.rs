//! Audio playback to speakers
//!
//! Like capture, every cpal output stream is owned by a dedicated thread.
//! Writers push samples into a shared queue that the device callback drains.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use tokio_util::sync::CancellationToken;

use crate::voice::{AudioOutput, AudioSink, CompressedAudioPlayer, StreamReader};
use crate::{Error, Result};

/// How much audio may be queued ahead of the device, in milliseconds
const MAX_QUEUED_MS: usize = 500;

/// Poll interval while waiting on the device queue
const QUEUE_POLL: Duration = Duration::from_millis(10);

/// Default output device
#[derive(Debug, Default, Clone, Copy)]
pub struct SpeakerOutput;

impl SpeakerOutput {
    /// Create a speaker output handle
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl AudioOutput for SpeakerOutput {
    fn open_pcm(&self, sample_rate: u32) -> Result<Box<dyn AudioSink>> {
        Ok(Box::new(SpeakerSink {
            stream: OutputStream::open(sample_rate)?,
            leftover: None,
        }))
    }
}

/// Streaming PCM sink on the default output device
pub struct SpeakerSink {
    stream: OutputStream,
    leftover: Option<u8>,
}

#[async_trait]
impl AudioSink for SpeakerSink {
    async fn write(&mut self, pcm: &[u8]) -> Result<usize> {
        if self.stream.has_failed() {
            return Err(Error::Audio("output stream failed".to_string()));
        }

        while self.stream.queued() > self.stream.max_queued() {
            tokio::time::sleep(QUEUE_POLL).await;
        }

        let mut bytes = pcm;
        let mut samples = Vec::with_capacity(pcm.len() / 2 + 1);
        if let (Some(low), Some((&high, rest))) = (self.leftover.take(), bytes.split_first()) {
            samples.push(i16::from_le_bytes([low, high]));
            bytes = rest;
        }
        let mut chunks = bytes.chunks_exact(2);
        samples.extend(chunks.by_ref().map(|c| i16::from_le_bytes([c[0], c[1]])));
        if let [odd] = chunks.remainder() {
            self.leftover = Some(*odd);
        }

        self.stream.push(&samples);
        Ok(pcm.len())
    }

    async fn drain(&mut self) -> Result<()> {
        while self.stream.queued() > 0 {
            if self.stream.has_failed() {
                return Err(Error::Audio("output stream failed".to_string()));
            }
            tokio::time::sleep(QUEUE_POLL).await;
        }
        // Let the device play out its own buffer
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(())
    }

    fn stop(&mut self) {
        self.stream.clear();
        self.stream.close();
    }
}

/// Streaming MP3 decoder + player on the default output device
#[derive(Debug, Default, Clone, Copy)]
pub struct Mp3Player;

impl Mp3Player {
    /// Create an MP3 player
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CompressedAudioPlayer for Mp3Player {
    async fn play(&self, source: StreamReader, cancel: CancellationToken) -> Result<()> {
        tokio::task::spawn_blocking(move || decode_and_play(source, &cancel))
            .await
            .map_err(|e| Error::Audio(format!("mp3 player task failed: {e}")))?
    }
}

/// Decode MP3 frames as they arrive and play them
fn decode_and_play(mut source: StreamReader, cancel: &CancellationToken) -> Result<()> {
    let mut stream: Option<OutputStream> = None;
    let result = {
        let mut decoder = minimp3::Decoder::new(&mut source);
        loop {
            if cancel.is_cancelled() {
                break Ok(());
            }

            match decoder.next_frame() {
                Ok(frame) => {
                    if stream.is_none() {
                        let rate = u32::try_from(frame.sample_rate).map_err(|_| {
                            Error::Audio(format!("bad sample rate {}", frame.sample_rate))
                        })?;
                        tracing::debug!(sample_rate = rate, "mp3 play start");
                        stream = Some(OutputStream::open(rate)?);
                    }
                    let Some(output) = stream.as_ref() else {
                        continue;
                    };

                    while output.queued() > output.max_queued() && !cancel.is_cancelled() {
                        std::thread::sleep(QUEUE_POLL);
                    }
                    output.push(&downmix(&frame.data, frame.channels));
                }
                Err(minimp3::Error::Eof | minimp3::Error::InsufficientData) => break Ok(()),
                Err(minimp3::Error::SkippedData) => {}
                Err(e) => break Err(Error::Audio(format!("MP3 decode error: {e}"))),
            }
        }
    };
    source.close();

    if let Some(mut output) = stream {
        if result.is_ok() {
            while output.queued() > 0 && !cancel.is_cancelled() && !output.has_failed() {
                std::thread::sleep(QUEUE_POLL);
            }
        }
        output.clear();
        output.close();
    }

    tracing::debug!(cancelled = cancel.is_cancelled(), "mp3 play done");
    result
}

/// Average interleaved channels down to mono
fn downmix(data: &[i16], channels: usize) -> Vec<i16> {
    if channels <= 1 {
        return data.to_vec();
    }

    data.chunks(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().copied().map(i32::from).sum();
            let len = i32::try_from(frame.len()).unwrap_or(1);
            i16::try_from(sum / len).unwrap_or_default()
        })
        .collect()
}

/// cpal output stream owned by a dedicated thread
struct OutputStream {
    queue: Arc<Mutex<VecDeque<f32>>>,
    failed: Arc<AtomicBool>,
    sample_rate: u32,
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl OutputStream {
    fn open(sample_rate: u32) -> Result<Self> {
        let queue = Arc::new(Mutex::new(VecDeque::new()));
        let failed = Arc::new(AtomicBool::new(false));
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<()>>();

        let thread_queue = Arc::clone(&queue);
        let thread_failed = Arc::clone(&failed);
        let thread = std::thread::Builder::new()
            .name("talk-playback".to_string())
            .spawn(move || {
                let stream = match build_output_stream(sample_rate, thread_queue, thread_failed) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                let _ = stop_rx.recv();
                drop(stream);
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
                    "playback thread exited during startup".to_string(),
                ));
            }
        }

        Ok(Self {
            queue,
            failed,
            sample_rate,
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        })
    }

    fn push(&self, samples: &[i16]) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.extend(samples.iter().map(|&s| f32::from(s) / 32768.0));
        }
    }

    fn queued(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or_default()
    }

    fn max_queued(&self) -> usize {
        self.sample_rate as usize * MAX_QUEUED_MS / 1000
    }

    fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    fn clear(&self) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.clear();
        }
    }

    fn close(&mut self) {
        if let Some(stop) = self.stop_tx.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
            tracing::debug!(sample_rate = self.sample_rate, "audio playback released");
        }
    }
}

impl Drop for OutputStream {
    fn drop(&mut self) {
        self.close();
    }
}

fn build_output_stream(
    sample_rate: u32,
    queue: Arc<Mutex<VecDeque<f32>>>,
    failed: Arc<AtomicBool>,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();

    let device = host
        .default_output_device()
        .ok_or_else(|| Error::DeviceUnavailable("no output device available".to_string()))?;

    let supported_config = device
        .supported_output_configs()
        .map_err(|e| Error::DeviceUnavailable(e.to_string()))?
        .find(|c| {
            c.channels() == 1
                && c.min_sample_rate() <= SampleRate(sample_rate)
                && c.max_sample_rate() >= SampleRate(sample_rate)
        })
        .or_else(|| {
            // Fallback: try stereo
            device.supported_output_configs().ok()?.find(|c| {
                c.channels() == 2
                    && c.min_sample_rate() <= SampleRate(sample_rate)
                    && c.max_sample_rate() >= SampleRate(sample_rate)
            })
        })
        .ok_or_else(|| Error::DeviceUnavailable("no suitable output config found".to_string()))?;

    let config: StreamConfig = supported_config
        .with_sample_rate(SampleRate(sample_rate))
        .config();
    let channels = config.channels as usize;

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate,
        channels,
        "audio playback initialized"
    );

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let Ok(mut queue) = queue.lock() else {
                    data.fill(0.0);
                    return;
                };
                for frame in data.chunks_mut(channels) {
                    let sample = queue.pop_front().unwrap_or(0.0);
                    frame.fill(sample);
                }
            },
            move |err| {
                failed.store(true, Ordering::SeqCst);
                tracing::error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;

    stream
        .play()
        .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;

    Ok(stream)
}
