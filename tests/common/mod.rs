//! Shared test utilities
//!
//! In-memory stand-ins for the audio devices and the agent transport so the
//! talk loop can run without hardware or a gateway.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use beacon_talk::config::{ConfigSource, RemoteConfig};
use beacon_talk::talk::{
    AgentTransport, ChatSendRequest, HistoryMessage, SpeechPlayer, TalkStatus, TtsClient,
};
use beacon_talk::voice::{
    AudioFocus, AudioFrame, AudioInput, AudioOutput, AudioSink, AudioSource,
    CompressedAudioPlayer, ExclusiveFocus, FRAME_MS, FRAME_SAMPLES, LocalSynthesizer,
    StreamReader,
};
use beacon_talk::{Config, Error, Result, SynthesisError};

/// Amplitude comfortably above the speech threshold but below barge-in
pub const SPEECH_AMPLITUDE: i16 = 1000;

/// Amplitude above the barge-in threshold
pub const LOUD_AMPLITUDE: i16 = 3000;

/// Default voice in [`test_config`]
pub const VOICE_ID: &str = "21m00Tcm4TlvDq8ikWAM";

/// Configuration pointed at a mock HTTP server
#[must_use]
pub fn test_config(server_uri: &str) -> Config {
    let mut config = Config::default();
    config.stt.api_key = Some("stt-key".to_string());
    config.stt.base_url = server_uri.to_string();
    config.talk.base_url = server_uri.to_string();
    config.talk.api_key = Some("tts-key".to_string());
    config.talk.voice_id = Some(VOICE_ID.to_string());
    config.timeouts.cooldown = Duration::from_millis(10);
    config.timeouts.poll_interval = Duration::from_millis(20);
    config.timeouts.history = Duration::from_secs(2);
    config.timeouts.history_extended = Duration::from_secs(2);
    config
}

/// Produces frames with synthetic, evenly spaced timestamps
pub struct FrameClock {
    next: Instant,
}

impl FrameClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next: Instant::now(),
        }
    }

    /// One square-wave frame whose RMS equals `amplitude`
    pub fn frame(&mut self, amplitude: i16) -> AudioFrame {
        let samples = (0..FRAME_SAMPLES)
            .map(|n| if n % 2 == 0 { amplitude } else { -amplitude })
            .collect();
        let frame = AudioFrame::at(samples, self.next);
        self.next += Duration::from_millis(u64::from(FRAME_MS));
        frame
    }

    /// 400ms of speech followed by 800ms of silence
    pub fn utterance(&mut self) -> Vec<AudioFrame> {
        let mut frames: Vec<AudioFrame> = (0..20).map(|_| self.frame(SPEECH_AMPLITUDE)).collect();
        frames.extend((0..40).map(|_| self.frame(0)));
        frames
    }
}

/// Microphone fed from a channel
pub struct FakeInput {
    frames: Mutex<Option<mpsc::UnboundedReceiver<AudioFrame>>>,
    permitted: bool,
}

impl FakeInput {
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedSender<AudioFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let input = Self {
            frames: Mutex::new(Some(rx)),
            permitted: true,
        };
        (input, tx)
    }

    #[must_use]
    pub fn denied() -> Self {
        Self {
            frames: Mutex::new(None),
            permitted: false,
        }
    }
}

impl AudioInput for FakeInput {
    fn has_permission(&self) -> bool {
        self.permitted
    }

    fn open(&self) -> Result<Box<dyn AudioSource>> {
        let rx = self
            .frames
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| Error::DeviceUnavailable("already opened".to_string()))?;
        Ok(Box::new(ChannelSource { rx }))
    }
}

struct ChannelSource {
    rx: mpsc::UnboundedReceiver<AudioFrame>,
}

#[async_trait]
impl AudioSource for ChannelSource {
    async fn next_frame(&mut self) -> Result<Option<AudioFrame>> {
        Ok(self.rx.recv().await)
    }

    fn close(&mut self) {
        self.rx.close();
    }
}

/// What the recording output has seen
#[derive(Default)]
pub struct OutputLog {
    pub written: Mutex<Vec<u8>>,
    pub sample_rates: Mutex<Vec<u32>>,
    pub released: AtomicUsize,
}

impl OutputLog {
    #[must_use]
    pub fn written_len(&self) -> usize {
        self.written.lock().unwrap().len()
    }

    #[must_use]
    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

/// PCM output that records writes and takes `drain_delay` to play out
pub struct RecordingOutput {
    pub log: Arc<OutputLog>,
    drain_delay: Duration,
}

impl RecordingOutput {
    #[must_use]
    pub fn new(drain_delay: Duration) -> Self {
        Self {
            log: Arc::new(OutputLog::default()),
            drain_delay,
        }
    }
}

impl AudioOutput for RecordingOutput {
    fn open_pcm(&self, sample_rate: u32) -> Result<Box<dyn AudioSink>> {
        self.log.sample_rates.lock().unwrap().push(sample_rate);
        Ok(Box::new(RecordingSink {
            log: Arc::clone(&self.log),
            drain_delay: self.drain_delay,
            released: false,
        }))
    }
}

struct RecordingSink {
    log: Arc<OutputLog>,
    drain_delay: Duration,
    released: bool,
}

impl RecordingSink {
    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.log.released.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl AudioSink for RecordingSink {
    async fn write(&mut self, pcm: &[u8]) -> Result<usize> {
        self.log.written.lock().unwrap().extend_from_slice(pcm);
        Ok(pcm.len())
    }

    async fn drain(&mut self) -> Result<()> {
        tokio::time::sleep(self.drain_delay).await;
        Ok(())
    }

    fn stop(&mut self) {
        self.release();
    }
}

impl Drop for RecordingSink {
    fn drop(&mut self) {
        self.release();
    }
}

/// Compressed player that discards the stream
#[derive(Default)]
pub struct NullCompressedPlayer {
    pub plays: AtomicUsize,
}

#[async_trait]
impl CompressedAudioPlayer for NullCompressedPlayer {
    async fn play(&self, mut source: StreamReader, _cancel: CancellationToken) -> Result<()> {
        self.plays.fetch_add(1, Ordering::SeqCst);
        source.close();
        Ok(())
    }
}

/// Local synthesizer that records what it was asked to say
#[derive(Default)]
pub struct RecordingSynthesizer {
    pub spoken: Mutex<Vec<String>>,
    delay: Duration,
}

impl RecordingSynthesizer {
    /// Synthesizer that takes `delay` to finish each utterance
    #[must_use]
    pub fn slow(delay: Duration) -> Self {
        Self {
            spoken: Mutex::new(Vec::new()),
            delay,
        }
    }
}

#[async_trait]
impl LocalSynthesizer for RecordingSynthesizer {
    async fn speak(
        &self,
        text: &str,
        cancel: CancellationToken,
    ) -> std::result::Result<(), SynthesisError> {
        self.spoken.lock().unwrap().push(text.to_string());
        tokio::select! {
            () = tokio::time::sleep(self.delay) => Ok(()),
            () = cancel.cancelled() => Err(SynthesisError::Cancelled),
        }
    }
}

/// Gateway config source serving a fixed `talk.config` payload
pub struct FakeConfigSource {
    payload: serde_json::Value,
    pub calls: AtomicUsize,
}

impl FakeConfigSource {
    #[must_use]
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            payload,
            calls: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConfigSource for FakeConfigSource {
    async fn talk_config(&self) -> Result<RemoteConfig> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Transport that answers every message with a fixed reply
pub struct FakeTransport {
    pub sent: Mutex<Vec<ChatSendRequest>>,
    pub subscribed: Mutex<Vec<String>>,
    reply: String,
    events: bool,
    connected: AtomicBool,
}

impl FakeTransport {
    #[must_use]
    pub fn new(reply: &str) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            subscribed: Mutex::new(Vec::new()),
            reply: reply.to_string(),
            events: false,
            connected: AtomicBool::new(true),
        }
    }

    /// Report chat event support
    #[must_use]
    pub fn with_events(mut self) -> Self {
        self.events = true;
        self
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    #[must_use]
    pub fn sent(&self) -> Vec<ChatSendRequest> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentTransport for FakeTransport {
    async fn send_chat(&self, request: &ChatSendRequest) -> Result<Option<String>> {
        self.sent.lock().unwrap().push(request.clone());
        Ok(Some(request.idempotency_key.clone()))
    }

    #[allow(clippy::cast_precision_loss)]
    async fn chat_history(&self, _session_key: &str) -> Result<Vec<HistoryMessage>> {
        let sent = self.sent.lock().unwrap().clone();
        let Some(last) = sent.last() else {
            return Ok(Vec::new());
        };
        let now_ms = chrono::Utc::now().timestamp_millis() as f64;
        Ok(vec![
            HistoryMessage {
                role: Some("user".to_string()),
                content: json!([{ "type": "text", "text": last.message }]),
                timestamp: Some(now_ms),
            },
            HistoryMessage {
                role: Some("assistant".to_string()),
                content: json!([{ "type": "text", "text": self.reply }]),
                timestamp: Some(now_ms),
            },
        ])
    }

    async fn subscribe_chat(&self, session_key: &str) -> Result<()> {
        self.subscribed.lock().unwrap().push(session_key.to_string());
        Ok(())
    }

    fn supports_chat_events(&self) -> bool {
        self.events
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Fakes wired into a speech player
pub struct PlayerRig {
    pub player: Arc<SpeechPlayer>,
    pub output: Arc<OutputLog>,
    pub compressed: Arc<NullCompressedPlayer>,
    pub local: Arc<RecordingSynthesizer>,
    pub focus: Arc<ExclusiveFocus>,
}

impl PlayerRig {
    #[must_use]
    pub fn new(config: &Config, drain_delay: Duration) -> Self {
        Self::with_system_voice(config, drain_delay, RecordingSynthesizer::default())
    }

    /// Rig whose on-device synthesizer is `local`
    #[must_use]
    pub fn with_system_voice(
        config: &Config,
        drain_delay: Duration,
        local: RecordingSynthesizer,
    ) -> Self {
        let output = RecordingOutput::new(drain_delay);
        let log = Arc::clone(&output.log);
        let compressed = Arc::new(NullCompressedPlayer::default());
        let local = Arc::new(local);
        let focus = Arc::new(ExclusiveFocus::new());
        let tts = TtsClient::new(config.talk.base_url.clone(), &config.timeouts).unwrap();

        let player = SpeechPlayer::new(
            tts,
            Arc::new(output),
            compressed.clone(),
            local.clone(),
            focus.clone() as Arc<dyn AudioFocus>,
            config.timeouts.local_tts,
        );

        Self {
            player: Arc::new(player),
            output: log,
            compressed,
            local,
            focus,
        }
    }
}

/// Wait until the status satisfies `predicate`, or panic after `secs`
pub async fn wait_for_status<F>(
    status: &mut watch::Receiver<TalkStatus>,
    secs: u64,
    predicate: F,
) -> TalkStatus
where
    F: Fn(&TalkStatus) -> bool,
{
    let wait = async {
        loop {
            {
                let current = status.borrow_and_update();
                if predicate(&current) {
                    return current.clone();
                }
            }
            status.changed().await.expect("status channel closed");
        }
    };
    let outcome = tokio::time::timeout(Duration::from_secs(secs), wait).await;
    match outcome {
        Ok(reached) => reached,
        Err(_) => panic!("status not reached; last: {:?}", *status.borrow()),
    }
}

/// Wait until the mock server has seen `count` requests to `path`
pub async fn wait_for_requests(server: &wiremock::MockServer, path: &str, count: usize) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let seen = server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|r| r.url.path() == path)
            .count();
        if seen >= count {
            return;
        }
        assert!(Instant::now() < deadline, "expected {count} requests to {path}, saw {seen}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// JSON bodies of the requests the mock server saw at `path`
pub async fn request_bodies(server: &wiremock::MockServer, path: &str) -> Vec<serde_json::Value> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.url.path() == path)
        .map(|r| serde_json::from_slice(&r.body).unwrap())
        .collect()
}

/// Poll `condition` every 10ms until true, or panic after `secs`
pub async fn wait_until<F>(secs: u64, condition: F)
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(secs);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
