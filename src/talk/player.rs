//! Speech synthesis player
//!
//! Owns the single playback session. Starting a session always tears the
//! previous one down first; [`SpeechPlayer::stop`] cancels whatever is
//! playing and reports how far it got.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::error::SynthesisError;
use crate::talk::{SynthesisRequest, TtsClient};
use crate::voice::{AudioFocus, AudioOutput, CompressedAudioPlayer, LocalSynthesizer, stream_buffer};

/// Format requested when PCM playback fails and the compressed path takes over
pub const COMPRESSED_FALLBACK_FORMAT: &str = "mp3_44100_128";

type SynthesisResult<T> = std::result::Result<T, SynthesisError>;

/// How an utterance ended up being played
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackPath {
    /// Raw PCM streamed to the output device
    Pcm,
    /// Compressed stream through the decoder
    Compressed,
    /// On-device synthesizer
    Local,
}

struct ActiveSession {
    id: u64,
    cancel: CancellationToken,
    started_at: Instant,
}

/// Live resources of one utterance; dropping it tears the session down
struct Session<'a> {
    player: &'a SpeechPlayer,
    id: u64,
    cancel: CancellationToken,
    _device: tokio::sync::MutexGuard<'a, ()>,
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Ok(mut active) = self.player.active.lock()
            && active.as_ref().is_some_and(|a| a.id == self.id)
        {
            *active = None;
        }
        self.player.focus.abandon();
    }
}

/// Plays synthesized speech through the audio capabilities
pub struct SpeechPlayer {
    tts: TtsClient,
    output: Arc<dyn AudioOutput>,
    compressed: Arc<dyn CompressedAudioPlayer>,
    local: Arc<dyn LocalSynthesizer>,
    focus: Arc<dyn AudioFocus>,
    local_timeout: Duration,
    device: tokio::sync::Mutex<()>,
    active: Mutex<Option<ActiveSession>>,
    next_id: AtomicU64,
}

impl SpeechPlayer {
    /// Create a player
    #[must_use]
    pub fn new(
        tts: TtsClient,
        output: Arc<dyn AudioOutput>,
        compressed: Arc<dyn CompressedAudioPlayer>,
        local: Arc<dyn LocalSynthesizer>,
        focus: Arc<dyn AudioFocus>,
        local_timeout: Duration,
    ) -> Self {
        Self {
            tts,
            output,
            compressed,
            local,
            focus,
            local_timeout,
            device: tokio::sync::Mutex::new(()),
            active: Mutex::new(None),
            next_id: AtomicU64::new(0),
        }
    }

    /// Synthesis client, for voice listing
    #[must_use]
    pub const fn tts(&self) -> &TtsClient {
        &self.tts
    }

    /// Whether a playback session is live
    #[must_use]
    pub fn is_speaking(&self) -> bool {
        self.active.lock().is_ok_and(|a| a.is_some())
    }

    /// Cancel the live session, returning how long it had been playing
    pub fn stop(&self) -> Option<Duration> {
        let session = self.active.lock().ok()?.take()?;
        session.cancel.cancel();
        let elapsed = session.started_at.elapsed();
        tracing::debug!(elapsed_ms = elapsed.as_millis(), "playback stopped");
        Some(elapsed)
    }

    /// Speak through the remote synthesis endpoint
    ///
    /// PCM formats stream straight to the output device; if that fails for
    /// any reason other than cancellation the same text is retried through
    /// the compressed path.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if stopped, otherwise the failure of the last path
    /// tried
    pub async fn speak_remote(
        &self,
        voice_id: &str,
        api_key: &str,
        request: &SynthesisRequest,
    ) -> SynthesisResult<PlaybackPath> {
        let session = self.begin().await;
        let cancel = session.cancel.clone();

        if let Some(sample_rate) = request.pcm_sample_rate() {
            match self
                .play_pcm(&cancel, voice_id, api_key, request, sample_rate)
                .await
            {
                Ok(()) => return Ok(PlaybackPath::Pcm),
                Err(_) if cancel.is_cancelled() => return Err(SynthesisError::Cancelled),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    tracing::warn!(error = %e, "pcm playback failed; falling back to mp3");
                }
            }

            let fallback = SynthesisRequest {
                output_format: Some(COMPRESSED_FALLBACK_FORMAT.to_string()),
                ..request.clone()
            };
            self.play_compressed(&cancel, voice_id, api_key, &fallback)
                .await?;
        } else {
            self.play_compressed(&cancel, voice_id, api_key, request)
                .await?;
        }

        drop(session);
        Ok(PlaybackPath::Compressed)
    }

    /// Speak with the on-device synthesizer
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if stopped, `Timeout` past the ceiling, or the
    /// synthesizer's own failure
    pub async fn speak_local(&self, text: &str) -> SynthesisResult<PlaybackPath> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(PlaybackPath::Local);
        }

        let session = self.begin().await;
        let cancel = session.cancel.clone();
        let outcome = tokio::time::timeout(self.local_timeout, self.local.speak(text, cancel)).await;

        match outcome {
            Ok(Ok(())) => Ok(PlaybackPath::Local),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                tracing::warn!(
                    timeout_secs = self.local_timeout.as_secs(),
                    "system voice timed out"
                );
                Err(SynthesisError::Timeout)
            }
        }
    }

    async fn begin(&self) -> Session<'_> {
        self.stop();
        let device = self.device.lock().await;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        if let Ok(mut active) = self.active.lock() {
            *active = Some(ActiveSession {
                id,
                cancel: cancel.clone(),
                started_at: Instant::now(),
            });
        }
        self.focus.request();

        Session {
            player: self,
            id,
            cancel,
            _device: device,
        }
    }

    async fn play_pcm(
        &self,
        cancel: &CancellationToken,
        voice_id: &str,
        api_key: &str,
        request: &SynthesisRequest,
        sample_rate: u32,
    ) -> SynthesisResult<()> {
        let response = tokio::select! {
            response = self.tts.stream(voice_id, api_key, request) => response?,
            () = cancel.cancelled() => return Err(SynthesisError::Cancelled),
        };

        let mut sink = self.output.open_pcm(sample_rate)?;
        tracing::debug!(sample_rate, "pcm play start");

        let outcome: SynthesisResult<()> = async {
            let mut body = response.bytes_stream();
            loop {
                let chunk = tokio::select! {
                    chunk = body.next() => chunk,
                    () = cancel.cancelled() => return Err(SynthesisError::Cancelled),
                };
                let Some(chunk) = chunk else {
                    break;
                };
                let chunk = chunk?;

                let mut offset = 0;
                while offset < chunk.len() {
                    let wrote = tokio::select! {
                        wrote = sink.write(&chunk[offset..]) => wrote,
                        () = cancel.cancelled() => return Err(SynthesisError::Cancelled),
                    };
                    match wrote {
                        Ok(0) => {
                            return Err(SynthesisError::Device("write accepted no data".to_string()));
                        }
                        Ok(n) => offset += n,
                        Err(_) if cancel.is_cancelled() => return Err(SynthesisError::Cancelled),
                        Err(e) => return Err(e.into()),
                    }
                }
            }

            tokio::select! {
                drained = sink.drain() => drained.map_err(SynthesisError::from),
                () = cancel.cancelled() => Err(SynthesisError::Cancelled),
            }
        }
        .await;

        sink.stop();
        tracing::debug!(ok = outcome.is_ok(), "pcm play done");
        outcome
    }

    async fn play_compressed(
        &self,
        cancel: &CancellationToken,
        voice_id: &str,
        api_key: &str,
        request: &SynthesisRequest,
    ) -> SynthesisResult<()> {
        let response = tokio::select! {
            response = self.tts.stream(voice_id, api_key, request) => response?,
            () = cancel.cancelled() => return Err(SynthesisError::Cancelled),
        };

        let (writer, reader) = stream_buffer();
        let fetch_cancel = cancel.clone();
        let fetch = tokio::spawn(async move {
            let mut body = response.bytes_stream();
            let outcome = loop {
                tokio::select! {
                    chunk = body.next() => match chunk {
                        Some(Ok(bytes)) => {
                            if !writer.append(bytes) {
                                break Ok(());
                            }
                        }
                        Some(Err(e)) => break Err(e),
                        None => break Ok(()),
                    },
                    () = fetch_cancel.cancelled() => break Ok(()),
                }
            };
            match &outcome {
                Ok(()) if fetch_cancel.is_cancelled() => writer.fail("cancelled"),
                Ok(()) => writer.finish(),
                Err(e) => writer.fail(e.to_string()),
            }
            outcome
        });

        tracing::debug!("play start");
        let played = self.compressed.play(reader, cancel.clone()).await;

        fetch.abort();
        let fetched = fetch.await.unwrap_or(Ok(()));
        tracing::debug!(ok = played.is_ok(), "play done");

        if cancel.is_cancelled() {
            return Err(SynthesisError::Cancelled);
        }
        fetched?;
        played.map_err(|e| SynthesisError::Decode(e.to_string()))
    }
}
