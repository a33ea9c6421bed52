//! Dialogue orchestrator
//!
//! A single controller task owns the dialogue state. It reads capture frames,
//! feeds the segmenter while listening and the barge-in detector while
//! speaking. Each turn (transcribe, ask the agent, speak) runs in its own task
//! and reports back to the controller over a channel; reports from a turn
//! that has since been interrupted are dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{
    Config, ConfigSource, EnvFallbacks, SttConfig, TalkSettings, normalize_main_key,
};
use crate::error::SynthesisError;
use crate::talk::{
    AgentTransport, ChatEvent, ChatSendRequest, PlaybackPath, SessionVoiceState, SpeechPlayer,
    SynthesisRequest, TranscriptionClient, build_prompt, latest_assistant_text, parse_reply,
};
use crate::voice::{
    AudioInput, AudioSource, BargeInDetector, Segmenter, SegmenterEvent, SpeechSegment,
};
use crate::{Error, Result};

/// Reasoning effort requested for spoken turns
const CHAT_THINKING: &str = "low";

/// Server-side timeout sent with each dispatch
const CHAT_TIMEOUT_MS: u64 = 30_000;

/// Chat events buffered for a waiting turn
const EVENT_BUFFER: usize = 64;

/// Where the dialogue is
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DialogueState {
    /// Not running
    #[default]
    Idle,
    /// Waiting for the user to speak
    Listening,
    /// Converting a speech segment to text
    Transcribing,
    /// Waiting for the agent's reply
    AwaitingAgentReply,
    /// Playing the reply
    Speaking,
}

/// Observable talk mode status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TalkStatus {
    /// Dialogue state
    pub state: DialogueState,
    /// Short human-readable status line
    pub status_text: String,
    /// Last reply text that was spoken
    pub last_assistant_text: Option<String>,
    /// Whether the on-device voice is in use
    pub using_fallback_tts: bool,
}

impl Default for TalkStatus {
    fn default() -> Self {
        Self {
            state: DialogueState::Idle,
            status_text: "Off".to_string(),
            last_assistant_text: None,
            using_fallback_tts: false,
        }
    }
}

/// Collaborators the orchestrator drives
pub struct TalkParts {
    /// Microphone
    pub input: Arc<dyn AudioInput>,
    /// Conversational backend
    pub transport: Arc<dyn AgentTransport>,
    /// Gateway talk configuration, reloaded before every dispatch
    pub config_source: Option<Arc<dyn ConfigSource>>,
    /// Speech output
    pub player: Arc<SpeechPlayer>,
}

/// Progress reported while speaking a reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpeakProgress {
    /// Cleaned text about to be spoken
    Text(String),
    /// Playback started
    Speaking {
        /// Using the on-device voice
        fallback: bool,
    },
    /// Every path failed
    Failed(String),
}

/// How speaking a reply ended
#[derive(Debug)]
pub enum SpeakOutcome {
    /// Nothing left to say after removing the directive
    Empty,
    /// Played to completion
    Spoken(PlaybackPath),
    /// Stopped on purpose
    Interrupted,
    /// Remote and local synthesis both failed
    Failed(SynthesisError),
}

/// Hands-free talk mode
pub struct TalkMode {
    inner: Arc<Inner>,
    running: Mutex<Option<Running>>,
}

struct Running {
    cancel: CancellationToken,
    done: CancellationToken,
    controller: JoinHandle<()>,
}

impl Running {
    fn is_live(&self) -> bool {
        !self.done.is_cancelled()
    }
}

struct SessionInfo {
    key: String,
    explicit: bool,
    subscribed: Option<String>,
}

struct Inner {
    config: Config,
    env: EnvFallbacks,
    input: Arc<dyn AudioInput>,
    transport: Arc<dyn AgentTransport>,
    config_source: Option<Arc<dyn ConfigSource>>,
    player: Arc<SpeechPlayer>,
    transcriber: TranscriptionClient,
    status: watch::Sender<TalkStatus>,
    events: broadcast::Sender<ChatEvent>,
    voice: tokio::sync::Mutex<SessionVoiceState>,
    session: Mutex<SessionInfo>,
    stt: Mutex<SttConfig>,
    interrupt_on_speech: AtomicBool,
    interrupted_at: Mutex<Option<Duration>>,
}

impl TalkMode {
    /// Create talk mode in the `Idle` state
    ///
    /// # Errors
    ///
    /// Returns error if the transcription client cannot be built
    pub fn new(config: Config, parts: TalkParts) -> Result<Self> {
        let transcriber = TranscriptionClient::new(&config.stt)?;
        let env = EnvFallbacks::from_env(&config.talk);
        let voice = SessionVoiceState::new(&TalkSettings::from_local(&config.talk, &env));
        let (status, _) = watch::channel(TalkStatus::default());
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let session = SessionInfo {
            key: normalize_main_key(config.session_key.as_deref()),
            explicit: config.session_key.is_some(),
            subscribed: None,
        };

        let inner = Inner {
            env,
            input: parts.input,
            transport: parts.transport,
            config_source: parts.config_source,
            player: parts.player,
            transcriber,
            status,
            events,
            voice: tokio::sync::Mutex::new(voice),
            session: Mutex::new(session),
            stt: Mutex::new(config.stt.clone()),
            interrupt_on_speech: AtomicBool::new(config.talk.interrupt_on_speech),
            interrupted_at: Mutex::new(None),
            config,
        };

        Ok(Self {
            inner: Arc::new(inner),
            running: Mutex::new(None),
        })
    }

    /// Subscribe to status changes
    #[must_use]
    pub fn status(&self) -> watch::Receiver<TalkStatus> {
        self.inner.status.subscribe()
    }

    /// Snapshot of the current status
    #[must_use]
    pub fn current_status(&self) -> TalkStatus {
        self.inner.status.borrow().clone()
    }

    /// Speech player driven by this talk mode
    #[must_use]
    pub fn player(&self) -> &Arc<SpeechPlayer> {
        &self.inner.player
    }

    /// Whether the capture loop is running
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.running
            .lock()
            .is_ok_and(|r| r.as_ref().is_some_and(Running::is_live))
    }

    /// Pin the session key; gateway config no longer changes it
    pub fn set_session_key(&self, key: &str) {
        let key = key.trim();
        if key.is_empty() {
            return;
        }
        if let Ok(mut session) = self.inner.session.lock() {
            session.key = key.to_string();
            session.explicit = true;
        }
    }

    /// Enable or disable talk mode
    ///
    /// # Errors
    ///
    /// Returns error if enabling failed; see [`TalkMode::enable`]
    pub async fn set_enabled(&self, enabled: bool) -> Result<()> {
        if enabled {
            self.enable()
        } else {
            self.disable().await;
            Ok(())
        }
    }

    /// Start listening
    ///
    /// # Errors
    ///
    /// Returns `PermissionDenied` or `DeviceUnavailable` if the microphone
    /// cannot be opened; the status line says so as well
    pub fn enable(&self) -> Result<()> {
        let Ok(mut running) = self.running.lock() else {
            return Err(Error::Audio("talk mode state poisoned".to_string()));
        };
        if running.as_ref().is_some_and(Running::is_live) {
            return Ok(());
        }

        tracing::debug!("talk mode enabled");
        if !self.inner.input.has_permission() {
            let err = Error::PermissionDenied("microphone access refused".to_string());
            tracing::warn!("microphone permission required");
            self.inner.publish(DialogueState::Idle, err.user_message());
            return Err(err);
        }

        let source = match self.inner.input.open() {
            Ok(source) => source,
            Err(e) => {
                tracing::warn!(error = %e, "talk start failed");
                self.inner.publish(DialogueState::Idle, e.user_message());
                return Err(e);
            }
        };

        self.inner.publish(DialogueState::Listening, "Listening");
        let cancel = CancellationToken::new();
        let done = CancellationToken::new();
        let controller = Controller::new(Arc::clone(&self.inner), cancel.clone());
        let finished = done.clone().drop_guard();
        *running = Some(Running {
            cancel,
            done,
            controller: tokio::spawn(async move {
                let _finished = finished;
                controller.run(source).await;
            }),
        });
        Ok(())
    }

    /// Resolves once the capture loop has stopped
    ///
    /// Covers both [`TalkMode::disable`] and the microphone going away.
    /// Resolves immediately when talk mode is not running.
    pub fn stopped(&self) -> impl Future<Output = ()> + Send + 'static {
        let done = self
            .running
            .lock()
            .ok()
            .and_then(|r| r.as_ref().map(|r| r.done.clone()));
        async move {
            if let Some(done) = done {
                done.cancelled().await;
            }
        }
    }

    /// Stop everything and go idle
    pub async fn disable(&self) {
        let running = self.running.lock().ok().and_then(|mut r| r.take());
        if let Some(running) = running {
            tracing::debug!("talk mode disabled");
            running.cancel.cancel();
            let _ = running.controller.await;
        }

        self.inner.player.stop();
        if let Ok(mut session) = self.inner.session.lock() {
            session.subscribed = None;
        }
        self.inner.status.send_modify(|s| {
            s.state = DialogueState::Idle;
            s.status_text = "Off".to_string();
            s.using_fallback_tts = false;
        });
    }

    /// Feed a chat event from the agent transport
    ///
    /// Only a `final` event for the run currently awaited has any effect.
    pub fn handle_agent_event(&self, event: ChatEvent) {
        tracing::trace!(run_id = %event.run_id, state = %event.state, "chat event");
        let _ = self.inner.events.send(event);
    }
}

impl Drop for TalkMode {
    fn drop(&mut self) {
        if let Ok(mut running) = self.running.lock()
            && let Some(running) = running.take()
        {
            running.cancel.cancel();
        }
    }
}

impl Inner {
    fn publish(&self, state: DialogueState, text: impl Into<String>) {
        let text = text.into();
        self.status.send_modify(|s| {
            s.state = state;
            s.status_text = text;
        });
    }

    fn session_key(&self) -> String {
        self.session
            .lock()
            .map_or_else(|_| normalize_main_key(None), |s| s.key.clone())
    }

    fn stt_config(&self) -> SttConfig {
        self.stt
            .lock()
            .map_or_else(|_| self.config.stt.clone(), |s| s.clone())
    }

    fn take_interruption(&self) -> Option<Duration> {
        self.interrupted_at.lock().ok().and_then(|mut i| i.take())
    }

    async fn reload_config(&self) {
        let settings = match &self.config_source {
            Some(source) => {
                let remote = match source.talk_config().await {
                    Ok(remote) => Some(remote),
                    Err(e) => {
                        tracing::debug!(error = %e, "talk.config failed; using fallbacks");
                        None
                    }
                };
                TalkSettings::resolve(remote.as_ref(), &self.config.talk, &self.env)
            }
            None => TalkSettings::from_local(&self.config.talk, &self.env),
        };

        self.voice.lock().await.apply_settings(&settings);

        if let Some(interrupt) = settings.interrupt_on_speech {
            self.interrupt_on_speech.store(interrupt, Ordering::SeqCst);
        }
        if let Some(main_key) = settings.main_session_key
            && let Ok(mut session) = self.session.lock()
            && !session.explicit
        {
            session.key = main_key;
        }
        if let Ok(mut stt) = self.stt.lock() {
            if let Some(key) = settings.stt_api_key {
                stt.api_key = Some(key);
            }
            if let Some(base_url) = settings.stt_base_url {
                stt.base_url = base_url;
            }
            if let Some(model) = settings.stt_model {
                stt.model = model;
            }
        }
    }

    async fn subscribe_if_needed(&self, session_key: &str) {
        let key = session_key.trim();
        if key.is_empty() {
            return;
        }
        let already = self
            .session
            .lock()
            .is_ok_and(|s| s.subscribed.as_deref() == Some(key));
        if already {
            return;
        }

        match self.transport.subscribe_chat(key).await {
            Ok(()) => {
                if let Ok(mut session) = self.session.lock() {
                    session.subscribed = Some(key.to_string());
                }
                tracing::debug!(session_key = key, "chat.subscribe ok");
            }
            Err(e) => {
                tracing::warn!(session_key = key, error = %e, "chat.subscribe failed");
            }
        }
    }

    /// Dispatch a prompt and wait for the assistant's reply text
    async fn await_reply(&self, prompt: &str) -> Result<Option<String>> {
        let session_key = self.session_key();
        let events_supported = self.transport.supports_chat_events();
        if events_supported {
            self.subscribe_if_needed(&session_key).await;
        }

        // Subscribe before sending so an early final event is not missed
        let mut events = self.events.subscribe();
        let started_at = epoch_seconds();
        let idempotency_key = Uuid::new_v4().to_string();
        let request = ChatSendRequest {
            session_key: session_key.clone(),
            message: prompt.to_string(),
            thinking: CHAT_THINKING.to_string(),
            timeout_ms: CHAT_TIMEOUT_MS,
            idempotency_key: idempotency_key.clone(),
        };

        tracing::debug!(session_key = %session_key, chars = prompt.len(), "chat.send start");
        let run_id = self
            .transport
            .send_chat(&request)
            .await?
            .filter(|id| !id.trim().is_empty())
            .unwrap_or(idempotency_key);
        tracing::debug!(run_id = %run_id, "chat.send ok");

        let final_seen = events_supported
            && wait_for_final(&mut events, &run_id, self.config.timeouts.chat_final).await;
        if events_supported && !final_seen {
            tracing::warn!(run_id = %run_id, "chat final timeout; attempting history fallback");
        }

        let window = if final_seen {
            self.config.timeouts.history
        } else {
            self.config.timeouts.history_extended
        };
        let text = self
            .wait_for_assistant_text(&session_key, started_at, window)
            .await?;
        if text.is_none() {
            tracing::warn!(run_id = %run_id, "assistant text timeout");
        }
        Ok(text)
    }

    async fn wait_for_assistant_text(
        &self,
        session_key: &str,
        since_seconds: f64,
        window: Duration,
    ) -> Result<Option<String>> {
        let deadline = Instant::now() + window;
        while Instant::now() < deadline {
            let messages = self.transport.chat_history(session_key).await?;
            if let Some(text) = latest_assistant_text(&messages, Some(since_seconds)) {
                return Ok(Some(text));
            }
            tokio::time::sleep(self.config.timeouts.poll_interval).await;
        }
        Ok(None)
    }
}

async fn wait_for_final(
    events: &mut broadcast::Receiver<ChatEvent>,
    run_id: &str,
    timeout: Duration,
) -> bool {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(event) if event.run_id == run_id && event.is_final() => return true,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return false,
            }
        }
    };
    tokio::time::timeout(timeout, wait).await.unwrap_or(false)
}

#[allow(clippy::cast_precision_loss)]
fn epoch_seconds() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Speak an assistant reply, falling back to the on-device voice
///
/// Parses and strips any directive, applies it to `voice`, resolves a voice
/// id (asking the remote voice list if nothing else is known) and plays the
/// text remotely. Any remote failure other than a deliberate stop retries the
/// text with the local synthesizer.
pub async fn speak_reply<F>(
    player: &SpeechPlayer,
    voice: &tokio::sync::Mutex<SessionVoiceState>,
    reply: &str,
    progress: F,
) -> SpeakOutcome
where
    F: Fn(SpeakProgress) + Send + Sync,
{
    let parsed = parse_reply(reply);
    if !parsed.unknown_keys.is_empty() {
        tracing::warn!(keys = ?parsed.unknown_keys, "unknown talk directive keys");
    }
    let cleaned = parsed.stripped.trim();
    if cleaned.is_empty() {
        return SpeakOutcome::Empty;
    }
    progress(SpeakProgress::Text(cleaned.to_string()));

    let (choice, api_key, output_format) = {
        let mut state = voice.lock().await;
        let choice = state.apply_directive(parsed.directive.as_ref());
        let api_key = state.api_key.clone().filter(|k| !k.trim().is_empty());
        (choice, api_key, state.default_output_format.clone())
    };

    let voice_id = match &api_key {
        Some(key) => resolve_voice_id(player, voice, choice.preferred_voice.as_deref(), key).await,
        None => None,
    };

    let remote = match (voice_id, api_key) {
        (Some(voice_id), Some(api_key)) => {
            progress(SpeakProgress::Speaking { fallback: false });
            let request = SynthesisRequest::build(
                cleaned,
                parsed.directive.as_ref(),
                Some(choice.model_id),
                &output_format,
            );
            let started = Instant::now();
            let result = player.speak_remote(&voice_id, &api_key, &request).await;
            if result.is_ok() {
                tracing::debug!(
                    duration_ms = started.elapsed().as_millis(),
                    "tts stream ok"
                );
            }
            result
        }
        (voice_id, api_key) => {
            if voice_id.is_none() {
                tracing::warn!("missing voice id; falling back to system voice");
            }
            if api_key.is_none() {
                tracing::warn!("missing ELEVENLABS_API_KEY; falling back to system voice");
            }
            Err(SynthesisError::Unavailable(
                "no voice id or API key".to_string(),
            ))
        }
    };

    match remote {
        Ok(path) => SpeakOutcome::Spoken(path),
        Err(e) if e.is_cancelled() => SpeakOutcome::Interrupted,
        Err(e) => {
            if !matches!(e, SynthesisError::Unavailable(_)) {
                tracing::warn!(error = %e, "speak failed; falling back to system voice");
            }
            progress(SpeakProgress::Speaking { fallback: true });
            match player.speak_local(cleaned).await {
                Ok(path) => SpeakOutcome::Spoken(path),
                Err(e) if e.is_cancelled() => SpeakOutcome::Interrupted,
                Err(e) => {
                    tracing::warn!(error = %e, "system voice failed");
                    progress(SpeakProgress::Failed(format!("Speak failed: {e}")));
                    SpeakOutcome::Failed(e)
                }
            }
        }
    }
}

async fn resolve_voice_id(
    player: &SpeechPlayer,
    voice: &tokio::sync::Mutex<SessionVoiceState>,
    preferred: Option<&str>,
    api_key: &str,
) -> Option<String> {
    let known = voice.lock().await.known_voice(preferred);
    if known.is_some() {
        return known;
    }

    match player.tts().list_voices(api_key).await {
        Ok(voices) => {
            let first = voices.into_iter().next()?;
            voice.lock().await.adopt_fallback_voice(&first.voice_id);
            tracing::debug!(
                name = first.name.as_deref().unwrap_or("unknown"),
                voice_id = %first.voice_id,
                "default voice selected"
            );
            Some(first.voice_id)
        }
        Err(e) => {
            tracing::warn!(error = %e, "list voices failed");
            None
        }
    }
}

struct Turn {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct TurnUpdate {
    generation: u64,
    kind: TurnUpdateKind,
}

enum TurnUpdateKind {
    Phase(DialogueState, String),
    Status(String),
    Fallback(bool),
    AssistantText(String),
    Finished(Option<String>),
}

/// Handle a turn task uses to report back to the controller
struct TurnContext {
    inner: Arc<Inner>,
    generation: u64,
    updates: mpsc::UnboundedSender<TurnUpdate>,
}

impl TurnContext {
    fn send(&self, kind: TurnUpdateKind) {
        let _ = self.updates.send(TurnUpdate {
            generation: self.generation,
            kind,
        });
    }

    fn progress(&self, progress: SpeakProgress) {
        match progress {
            SpeakProgress::Text(text) => self.send(TurnUpdateKind::AssistantText(text)),
            SpeakProgress::Speaking { fallback } => {
                self.send(TurnUpdateKind::Fallback(fallback));
                let text = if fallback { "Speaking (System)…" } else { "Speaking…" };
                self.send(TurnUpdateKind::Phase(DialogueState::Speaking, text.to_string()));
            }
            SpeakProgress::Failed(text) => self.send(TurnUpdateKind::Status(text)),
        }
    }

    async fn run(self, segment: SpeechSegment, cancel: CancellationToken) {
        tokio::select! {
            () = cancel.cancelled() => {}
            status = self.turn(segment) => self.send(TurnUpdateKind::Finished(status)),
        }
    }

    /// One spoken exchange; returns the status to show when back to listening
    async fn turn(&self, segment: SpeechSegment) -> Option<String> {
        let stt = self.inner.stt_config();
        let transcript = self.inner.transcriber.transcribe(&stt, &segment).await?;
        tracing::debug!(chars = transcript.len(), "transcript ready");

        self.send(TurnUpdateKind::Phase(
            DialogueState::AwaitingAgentReply,
            "Thinking…".to_string(),
        ));
        self.inner.reload_config().await;

        if !self.inner.transport.is_connected() {
            tracing::warn!("gateway not connected");
            return Some("Gateway not connected".to_string());
        }

        let prompt = build_prompt(&transcript, self.inner.take_interruption());
        let reply = match self.inner.await_reply(&prompt).await {
            Ok(Some(reply)) => reply,
            Ok(None) => return Some("No reply".to_string()),
            Err(e) => {
                tracing::warn!(error = %e, "talk turn failed");
                return Some(format!("Talk failed: {e}"));
            }
        };
        tracing::debug!(chars = reply.len(), "assistant text ok");

        let outcome = speak_reply(&self.inner.player, &self.inner.voice, &reply, |p| {
            self.progress(p);
        })
        .await;
        tracing::debug!(?outcome, "reply finished");

        tokio::time::sleep(self.inner.config.timeouts.cooldown).await;
        None
    }
}

/// Owner of the dialogue state
struct Controller {
    inner: Arc<Inner>,
    cancel: CancellationToken,
    segmenter: Segmenter,
    barge_in: BargeInDetector,
    state: DialogueState,
    generation: u64,
    turn: Option<Turn>,
    updates_tx: mpsc::UnboundedSender<TurnUpdate>,
    updates_rx: mpsc::UnboundedReceiver<TurnUpdate>,
}

impl Controller {
    fn new(inner: Arc<Inner>, cancel: CancellationToken) -> Self {
        let segmenter = Segmenter::new(inner.config.segmenter.clone());
        let barge_in = BargeInDetector::new(&inner.config.segmenter);
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        Self {
            inner,
            cancel,
            segmenter,
            barge_in,
            state: DialogueState::Listening,
            generation: 0,
            turn: None,
            updates_tx,
            updates_rx,
        }
    }

    async fn run(mut self, mut source: Box<dyn AudioSource>) {
        tracing::debug!(
            threshold = self.inner.config.segmenter.speech_rms_threshold,
            barge_in_threshold = self.barge_in.threshold(),
            "capture loop started"
        );

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                Some(update) = self.updates_rx.recv() => self.apply(update),
                frame = source.next_frame() => match frame {
                    Ok(Some(frame)) => self.on_frame(&frame),
                    Ok(None) => {
                        tracing::warn!("capture stream ended");
                        self.set_state(DialogueState::Idle, "Audio recording unavailable");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "capture failed");
                        self.set_state(DialogueState::Idle, e.user_message());
                        break;
                    }
                },
            }
        }

        if let Some(turn) = self.turn.take() {
            turn.cancel.cancel();
            let _ = turn.handle.await;
        }
        self.inner.player.stop();
        source.close();
        tracing::debug!("capture loop stopped");
    }

    fn set_state(&mut self, state: DialogueState, text: impl Into<String>) {
        self.state = state;
        self.inner.publish(state, text);
    }

    fn on_frame(&mut self, frame: &crate::voice::AudioFrame) {
        match self.state {
            DialogueState::Listening => match self.segmenter.process(frame) {
                Some(SegmenterEvent::SpeechStarted { rms }) => {
                    tracing::debug!(rms, "speech start");
                    self.set_state(DialogueState::Listening, "Hearing you…");
                }
                Some(SegmenterEvent::Discarded { duration }) => {
                    tracing::debug!(duration_ms = duration.as_millis(), "speech too short");
                    self.set_state(DialogueState::Listening, "Listening");
                }
                Some(SegmenterEvent::Segment(segment)) => self.start_turn(segment),
                None => {}
            },
            DialogueState::Speaking => {
                if !self.inner.interrupt_on_speech.load(Ordering::SeqCst)
                    || !self.inner.player.is_speaking()
                {
                    return;
                }
                if let Some(rms) = self.barge_in.check(frame) {
                    self.interrupt(rms);
                }
            }
            DialogueState::Idle
            | DialogueState::Transcribing
            | DialogueState::AwaitingAgentReply => {}
        }
    }

    fn start_turn(&mut self, segment: SpeechSegment) {
        if let Some(previous) = self.turn.take() {
            previous.cancel.cancel();
        }
        self.generation += 1;
        tracing::debug!(
            duration_ms = segment.duration().as_millis(),
            pcm_bytes = segment.pcm.len(),
            "speech end"
        );
        self.set_state(DialogueState::Transcribing, "Transcribing…");

        let cancel = self.cancel.child_token();
        let context = TurnContext {
            inner: Arc::clone(&self.inner),
            generation: self.generation,
            updates: self.updates_tx.clone(),
        };
        let handle = tokio::spawn(context.run(segment, cancel.clone()));
        self.turn = Some(Turn { cancel, handle });
    }

    fn interrupt(&mut self, rms: u32) {
        tracing::debug!(rms, "interrupt detected");
        if let Some(offset) = self.inner.player.stop()
            && let Ok(mut interrupted) = self.inner.interrupted_at.lock()
        {
            *interrupted = Some(offset);
        }
        if let Some(turn) = self.turn.take() {
            turn.cancel.cancel();
        }
        self.generation += 1;
        self.segmenter.reset();
        self.set_state(DialogueState::Listening, "Listening");
    }

    fn apply(&mut self, update: TurnUpdate) {
        if update.generation != self.generation || self.turn.is_none() {
            return;
        }

        match update.kind {
            TurnUpdateKind::Phase(state, text) => self.set_state(state, text),
            TurnUpdateKind::Status(text) => {
                self.inner.status.send_modify(|s| s.status_text = text);
            }
            TurnUpdateKind::Fallback(fallback) => {
                self.inner
                    .status
                    .send_modify(|s| s.using_fallback_tts = fallback);
            }
            TurnUpdateKind::AssistantText(text) => {
                self.inner
                    .status
                    .send_modify(|s| s.last_assistant_text = Some(text));
            }
            TurnUpdateKind::Finished(status) => {
                self.turn = None;
                self.segmenter.reset();
                self.set_state(
                    DialogueState::Listening,
                    status.unwrap_or_else(|| "Listening".to_string()),
                );
            }
        }
    }
}
