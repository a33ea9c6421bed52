//! Configuration management for Beacon talk mode
//!
//! Local settings come from the environment, then `talk.toml`, then defaults.
//! Before every agent turn the orchestrator also pulls the gateway's talk
//! configuration and merges it on top (see [`TalkSettings::resolve`]).

pub mod file;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::Result;

/// Synthesis model used when nothing else is configured
pub const DEFAULT_MODEL_ID: &str = "eleven_v3";

/// Output format used when nothing else is configured
pub const DEFAULT_OUTPUT_FORMAT: &str = "pcm_24000";

/// Default transcription base URL
pub const DEFAULT_STT_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// Default transcription model
pub const DEFAULT_STT_MODEL: &str = "google/gemini-2.5-flash";

/// Default synthesis base URL
pub const DEFAULT_TTS_BASE_URL: &str = "https://api.elevenlabs.io/v1";

/// Default gateway URL
pub const DEFAULT_GATEWAY_URL: &str = "http://127.0.0.1:18790";

/// Session key used when none is configured
pub const DEFAULT_SESSION_KEY: &str = "main";

/// Beacon talk configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Gateway base URL
    pub gateway_url: String,

    /// Gateway bearer token
    pub gateway_token: Option<String>,

    /// Explicit session key (wins over the gateway's `session.mainKey`)
    pub session_key: Option<String>,

    /// Speech synthesis defaults
    pub talk: TalkConfig,

    /// Transcription endpoint
    pub stt: SttConfig,

    /// Voice activity tunables
    pub segmenter: SegmenterConfig,

    /// Bounded waits
    pub timeouts: TalkTimeouts,
}

/// Speech synthesis defaults known locally
#[derive(Debug, Clone)]
pub struct TalkConfig {
    /// Default voice id
    pub voice_id: Option<String>,

    /// Friendly names for voice ids
    pub voice_aliases: HashMap<String, String>,

    /// Synthesis model
    pub model_id: Option<String>,

    /// Output format tag
    pub output_format: Option<String>,

    /// Synthesis API key
    pub api_key: Option<String>,

    /// Synthesis API base URL
    pub base_url: String,

    /// Stop playback when the user talks over it
    pub interrupt_on_speech: bool,
}

impl Default for TalkConfig {
    fn default() -> Self {
        Self {
            voice_id: None,
            voice_aliases: HashMap::new(),
            model_id: None,
            output_format: None,
            api_key: None,
            base_url: DEFAULT_TTS_BASE_URL.to_string(),
            interrupt_on_speech: true,
        }
    }
}

/// Transcription endpoint settings
#[derive(Debug, Clone)]
pub struct SttConfig {
    /// API key
    pub api_key: Option<String>,

    /// Chat-completions base URL
    pub base_url: String,

    /// Audio-capable model
    pub model: String,

    /// Connect timeout
    pub connect_timeout: Duration,

    /// Read timeout
    pub read_timeout: Duration,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_STT_BASE_URL.to_string(),
            model: DEFAULT_STT_MODEL.to_string(),
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(60),
        }
    }
}

/// Voice activity tunables
#[derive(Debug, Clone, PartialEq)]
pub struct SegmenterConfig {
    /// Capture sample rate
    pub sample_rate: u32,

    /// Capture frame duration
    pub frame: Duration,

    /// RMS (0..32768) above which a frame counts as speech
    pub speech_rms_threshold: u32,

    /// Silence after speech that ends an utterance
    pub silence_after_speech: Duration,

    /// Shortest utterance worth transcribing
    pub min_speech: Duration,

    /// Multiple of the speech threshold that counts as barge-in
    pub barge_in_multiplier: f32,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            sample_rate: crate::voice::SAMPLE_RATE,
            frame: Duration::from_millis(u64::from(crate::voice::FRAME_MS)),
            speech_rms_threshold: 600,
            silence_after_speech: Duration::from_millis(700),
            min_speech: Duration::from_millis(300),
            barge_in_multiplier: 2.0,
        }
    }
}

impl SegmenterConfig {
    /// Samples in one capture frame
    #[allow(clippy::cast_possible_truncation)]
    #[must_use]
    pub fn frame_samples(&self) -> usize {
        let samples = u128::from(self.sample_rate) * self.frame.as_micros() / 1_000_000;
        (samples as usize).max(1)
    }
}

/// Ceilings for every long wait in a turn
#[derive(Debug, Clone)]
pub struct TalkTimeouts {
    /// Wait for the agent's "final" event
    pub chat_final: Duration,

    /// History polling after a final event arrived
    pub history: Duration,

    /// History polling after the final event timed out
    pub history_extended: Duration,

    /// Delay between history polls
    pub poll_interval: Duration,

    /// Local synthesizer ceiling
    pub local_tts: Duration,

    /// Pause before listening again after a turn
    pub cooldown: Duration,

    /// Synthesis connect/read timeout
    pub tts: Duration,

    /// Voice list request timeout
    pub voices: Duration,
}

impl Default for TalkTimeouts {
    fn default() -> Self {
        Self {
            chat_final: Duration::from_secs(120),
            history: Duration::from_secs(12),
            history_extended: Duration::from_secs(25),
            poll_interval: Duration::from_millis(300),
            local_tts: Duration::from_secs(180),
            cooldown: Duration::from_millis(500),
            tts: Duration::from_secs(30),
            voices: Duration::from_secs(15),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gateway_url: DEFAULT_GATEWAY_URL.to_string(),
            gateway_token: None,
            session_key: None,
            talk: TalkConfig::default(),
            stt: SttConfig::default(),
            segmenter: SegmenterConfig::default(),
            timeouts: TalkTimeouts::default(),
        }
    }
}

impl Config {
    /// Load configuration (env > toml > default)
    #[must_use]
    pub fn load() -> Self {
        Self::from_file(file::load_config_file())
    }

    /// Build configuration from a parsed file plus the environment
    #[must_use]
    pub fn from_file(fc: file::TalkConfigFile) -> Self {
        let defaults = Self::default();
        let env = |key: &str| non_blank(std::env::var(key).ok());

        let talk = TalkConfig {
            voice_id: env("ELEVENLABS_VOICE_ID").or(non_blank(fc.talk.voice_id)),
            voice_aliases: normalize_aliases(fc.talk.voice_aliases),
            model_id: non_blank(fc.talk.model_id),
            output_format: non_blank(fc.talk.output_format),
            api_key: env("ELEVENLABS_API_KEY").or(non_blank(fc.talk.api_key)),
            base_url: non_blank(fc.talk.base_url).unwrap_or(defaults.talk.base_url),
            interrupt_on_speech: fc.talk.interrupt_on_speech.unwrap_or(true),
        };

        let stt = SttConfig {
            api_key: env("OPENROUTER_API_KEY").or(non_blank(fc.stt.api_key)),
            base_url: env("BEACON_STT_BASE_URL")
                .or(non_blank(fc.stt.base_url))
                .unwrap_or(defaults.stt.base_url),
            model: env("BEACON_STT_MODEL")
                .or(non_blank(fc.stt.model))
                .unwrap_or(defaults.stt.model),
            ..defaults.stt
        };

        let segmenter = SegmenterConfig {
            sample_rate: fc
                .vad
                .sample_rate
                .filter(|rate| *rate > 0)
                .unwrap_or(defaults.segmenter.sample_rate),
            frame: fc
                .vad
                .frame_ms
                .filter(|ms| *ms > 0)
                .map_or(defaults.segmenter.frame, Duration::from_millis),
            speech_rms_threshold: fc
                .vad
                .speech_rms_threshold
                .unwrap_or(defaults.segmenter.speech_rms_threshold),
            silence_after_speech: fc
                .vad
                .silence_after_speech_ms
                .map_or(defaults.segmenter.silence_after_speech, Duration::from_millis),
            min_speech: fc
                .vad
                .min_speech_ms
                .map_or(defaults.segmenter.min_speech, Duration::from_millis),
            barge_in_multiplier: fc
                .vad
                .barge_in_multiplier
                .unwrap_or(defaults.segmenter.barge_in_multiplier),
            ..defaults.segmenter
        };

        Self {
            gateway_url: env("BEACON_GATEWAY_URL")
                .or(non_blank(fc.gateway.url))
                .unwrap_or(defaults.gateway_url),
            gateway_token: env("BEACON_GATEWAY_TOKEN").or(non_blank(fc.gateway.token)),
            session_key: env("BEACON_SESSION_KEY").or(non_blank(fc.gateway.session_key)),
            talk,
            stt,
            segmenter,
            timeouts: defaults.timeouts,
        }
    }
}

/// Source of the gateway's talk configuration
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Fetch the current talk configuration (secrets included)
    ///
    /// # Errors
    ///
    /// Returns error if the gateway cannot be reached or answers garbage
    async fn talk_config(&self) -> Result<RemoteConfig>;
}

/// Response of the gateway's `talk.config` request
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemoteConfig {
    /// Configuration payload
    #[serde(default)]
    pub config: RemoteConfigBody,
}

/// Sections of the gateway configuration the pipeline reads
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemoteConfigBody {
    /// Synthesis section
    #[serde(default)]
    pub talk: RemoteTalk,

    /// Session section
    #[serde(default)]
    pub session: RemoteSession,

    /// Transcription section
    #[serde(default)]
    pub stt: RemoteStt,
}

/// `config.talk`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteTalk {
    /// Default voice id
    pub voice_id: Option<String>,

    /// Alias table; non-string values are ignored
    #[serde(default)]
    pub voice_aliases: HashMap<String, serde_json::Value>,

    /// Synthesis model
    pub model_id: Option<String>,

    /// Output format tag
    pub output_format: Option<String>,

    /// Synthesis API key
    pub api_key: Option<String>,

    /// Barge-in toggle (accepts booleans and "yes"/"no"/"1"/"0")
    pub interrupt_on_speech: Option<serde_json::Value>,
}

/// `config.session`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSession {
    /// Main session key
    pub main_key: Option<String>,
}

/// `config.stt`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteStt {
    /// API key
    pub api_key: Option<String>,

    /// Base URL
    pub base_url: Option<String>,

    /// Model
    pub model: Option<String>,
}

/// Environment-variable fallbacks used when the gateway has no value
#[derive(Debug, Clone, Default)]
pub struct EnvFallbacks {
    /// `ELEVENLABS_VOICE_ID` (or the local file)
    pub voice_id: Option<String>,

    /// `SAG_VOICE_ID`
    pub sag_voice_id: Option<String>,

    /// `ELEVENLABS_API_KEY` (or the local file)
    pub api_key: Option<String>,
}

impl EnvFallbacks {
    /// Collect fallbacks from the environment and the local configuration
    #[must_use]
    pub fn from_env(local: &TalkConfig) -> Self {
        Self {
            voice_id: local.voice_id.clone(),
            sag_voice_id: non_blank(std::env::var("SAG_VOICE_ID").ok()),
            api_key: local.api_key.clone(),
        }
    }

    fn voice(&self) -> Option<String> {
        self.voice_id.clone().or_else(|| self.sag_voice_id.clone())
    }
}

/// Effective talk settings after merging the gateway config over local fallbacks
#[derive(Debug, Clone, PartialEq)]
pub struct TalkSettings {
    /// Default voice id
    pub default_voice_id: Option<String>,

    /// Normalized alias table
    pub voice_aliases: HashMap<String, String>,

    /// Default synthesis model
    pub default_model_id: String,

    /// Default output format
    pub default_output_format: String,

    /// Synthesis API key
    pub api_key: Option<String>,

    /// Barge-in toggle, when the gateway set one
    pub interrupt_on_speech: Option<bool>,

    /// Normalized main session key, when the gateway set one
    pub main_session_key: Option<String>,

    /// Transcription API key override
    pub stt_api_key: Option<String>,

    /// Transcription base URL override
    pub stt_base_url: Option<String>,

    /// Transcription model override
    pub stt_model: Option<String>,
}

impl TalkSettings {
    /// Settings from local configuration alone, for runs without a gateway
    #[must_use]
    pub fn from_local(local: &TalkConfig, env: &EnvFallbacks) -> Self {
        Self {
            default_voice_id: env.voice(),
            voice_aliases: local.voice_aliases.clone(),
            default_model_id: local
                .model_id
                .clone()
                .unwrap_or_else(|| DEFAULT_MODEL_ID.to_string()),
            default_output_format: local
                .output_format
                .clone()
                .unwrap_or_else(|| DEFAULT_OUTPUT_FORMAT.to_string()),
            api_key: env.api_key.clone(),
            interrupt_on_speech: None,
            main_session_key: None,
            stt_api_key: None,
            stt_base_url: None,
            stt_model: None,
        }
    }

    /// Merge a fetched gateway config (or the failure to fetch one) with fallbacks
    #[must_use]
    pub fn resolve(remote: Option<&RemoteConfig>, local: &TalkConfig, env: &EnvFallbacks) -> Self {
        let Some(remote) = remote else {
            return Self {
                default_voice_id: env.voice(),
                voice_aliases: HashMap::new(),
                default_model_id: DEFAULT_MODEL_ID.to_string(),
                default_output_format: DEFAULT_OUTPUT_FORMAT.to_string(),
                api_key: env.api_key.clone(),
                interrupt_on_speech: None,
                main_session_key: None,
                stt_api_key: None,
                stt_base_url: None,
                stt_model: None,
            };
        };

        let talk = &remote.config.talk;
        let stt = &remote.config.stt;

        let mut voice_aliases: HashMap<String, String> = local.voice_aliases.clone();
        voice_aliases.extend(talk.voice_aliases.iter().filter_map(|(key, value)| {
            let id = non_blank(value.as_str().map(ToString::to_string))?;
            let key = normalize_alias_key(key);
            (!key.is_empty()).then_some((key, id))
        }));

        Self {
            default_voice_id: non_blank(talk.voice_id.clone()).or_else(|| env.voice()),
            voice_aliases,
            default_model_id: non_blank(talk.model_id.clone())
                .or_else(|| local.model_id.clone())
                .unwrap_or_else(|| DEFAULT_MODEL_ID.to_string()),
            default_output_format: non_blank(talk.output_format.clone())
                .or_else(|| local.output_format.clone())
                .unwrap_or_else(|| DEFAULT_OUTPUT_FORMAT.to_string()),
            api_key: non_blank(talk.api_key.clone()).or_else(|| env.api_key.clone()),
            interrupt_on_speech: talk.interrupt_on_speech.as_ref().and_then(value_as_bool),
            main_session_key: Some(normalize_main_key(remote.config.session.main_key.as_deref())),
            stt_api_key: non_blank(stt.api_key.clone()),
            stt_base_url: non_blank(stt.base_url.clone()),
            stt_model: non_blank(stt.model.clone()),
        }
    }
}

/// Trimmed, lower-cased alias key
#[must_use]
pub fn normalize_alias_key(value: &str) -> String {
    value.trim().to_lowercase()
}

/// Trimmed session key, `"main"` when blank
#[must_use]
pub fn normalize_main_key(value: Option<&str>) -> String {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(DEFAULT_SESSION_KEY)
        .to_string()
}

fn normalize_aliases(aliases: HashMap<String, String>) -> HashMap<String, String> {
    aliases
        .into_iter()
        .filter_map(|(key, value)| {
            let key = normalize_alias_key(&key);
            let value = non_blank(Some(value))?;
            (!key.is_empty()).then_some((key, value))
        })
        .collect()
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn value_as_bool(value: &serde_json::Value) -> Option<bool> {
    match value {
        serde_json::Value::Bool(b) => Some(*b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(1) => Some(true),
            Some(0) => Some(false),
            _ => None,
        },
        serde_json::Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" | "1" => Some(true),
            "false" | "no" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn remote(value: serde_json::Value) -> RemoteConfig {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_resolve_prefers_gateway_values() {
        let remote = remote(json!({
            "config": {
                "talk": {
                    "voiceId": " gateway-voice-id ",
                    "voiceAliases": {" Rachel ": "21m00Tcm4TlvDq8ikWAM", "bad": 3, "blank": " "},
                    "modelId": "eleven_turbo_v2_5",
                    "apiKey": "gw-key",
                    "interruptOnSpeech": "no"
                },
                "session": {"mainKey": "  "},
                "stt": {"baseUrl": "https://stt.example/v1"}
            }
        }));
        let env = EnvFallbacks {
            voice_id: Some("env-voice".to_string()),
            sag_voice_id: None,
            api_key: Some("env-key".to_string()),
        };

        let settings = TalkSettings::resolve(Some(&remote), &TalkConfig::default(), &env);

        assert_eq!(settings.default_voice_id.as_deref(), Some("gateway-voice-id"));
        assert_eq!(settings.voice_aliases.len(), 1);
        assert_eq!(
            settings.voice_aliases.get("rachel").map(String::as_str),
            Some("21m00Tcm4TlvDq8ikWAM")
        );
        assert_eq!(settings.default_model_id, "eleven_turbo_v2_5");
        assert_eq!(settings.default_output_format, DEFAULT_OUTPUT_FORMAT);
        assert_eq!(settings.api_key.as_deref(), Some("gw-key"));
        assert_eq!(settings.interrupt_on_speech, Some(false));
        assert_eq!(settings.main_session_key.as_deref(), Some("main"));
        assert_eq!(settings.stt_base_url.as_deref(), Some("https://stt.example/v1"));
        assert!(settings.stt_model.is_none());
    }

    #[test]
    fn test_resolve_without_gateway_uses_env() {
        let env = EnvFallbacks {
            voice_id: None,
            sag_voice_id: Some("sag-voice".to_string()),
            api_key: Some("env-key".to_string()),
        };

        let settings = TalkSettings::resolve(None, &TalkConfig::default(), &env);

        assert_eq!(settings.default_voice_id.as_deref(), Some("sag-voice"));
        assert!(settings.voice_aliases.is_empty());
        assert_eq!(settings.default_model_id, DEFAULT_MODEL_ID);
        assert_eq!(settings.api_key.as_deref(), Some("env-key"));
        assert!(settings.interrupt_on_speech.is_none());
    }

    #[test]
    fn test_from_local_keeps_file_settings() {
        let local = TalkConfig {
            voice_aliases: HashMap::from([("bob".to_string(), "bobVoiceId123".to_string())]),
            output_format: Some("mp3_44100_128".to_string()),
            ..TalkConfig::default()
        };
        let env = EnvFallbacks {
            voice_id: Some("local-voice".to_string()),
            sag_voice_id: None,
            api_key: None,
        };

        let settings = TalkSettings::from_local(&local, &env);

        assert_eq!(settings.default_voice_id.as_deref(), Some("local-voice"));
        assert_eq!(settings.voice_aliases.len(), 1);
        assert_eq!(settings.default_model_id, DEFAULT_MODEL_ID);
        assert_eq!(settings.default_output_format, "mp3_44100_128");
    }

    #[test]
    fn test_normalize_main_key() {
        assert_eq!(normalize_main_key(None), "main");
        assert_eq!(normalize_main_key(Some(" agent:ops ")), "agent:ops");
    }

    #[test]
    fn test_value_as_bool() {
        assert_eq!(value_as_bool(&json!(true)), Some(true));
        assert_eq!(value_as_bool(&json!("YES")), Some(true));
        assert_eq!(value_as_bool(&json!(0)), Some(false));
        assert_eq!(value_as_bool(&json!("maybe")), None);
    }

    #[test]
    fn test_segmenter_defaults() {
        let config = SegmenterConfig::default();
        assert_eq!(config.speech_rms_threshold, 600);
        assert_eq!(config.silence_after_speech, Duration::from_millis(700));
        assert_eq!(config.min_speech, Duration::from_millis(300));
        assert_eq!(config.frame_samples(), 320);
    }

    #[test]
    fn test_frame_samples_follow_rate_and_cadence() {
        let config = SegmenterConfig {
            sample_rate: 24_000,
            frame: Duration::from_millis(30),
            ..SegmenterConfig::default()
        };
        assert_eq!(config.frame_samples(), 720);
    }
}
