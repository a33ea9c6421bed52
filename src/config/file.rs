//! TOML configuration file loading
//!
//! Supports `~/.config/omni/beacon/talk.toml` as a persistent config source.
//! All fields are optional — the file is a partial overlay on top of defaults.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct TalkConfigFile {
    /// Gateway connection
    #[serde(default)]
    pub gateway: GatewayFileConfig,

    /// Speech synthesis defaults
    #[serde(default)]
    pub talk: TalkFileConfig,

    /// Transcription endpoint
    #[serde(default)]
    pub stt: SttFileConfig,

    /// Voice activity tunables
    #[serde(default)]
    pub vad: VadFileConfig,
}

/// Gateway connection settings
#[derive(Debug, Default, Deserialize)]
pub struct GatewayFileConfig {
    /// Gateway base URL (e.g. `http://127.0.0.1:18790`)
    pub url: Option<String>,

    /// Bearer token for the gateway
    pub token: Option<String>,

    /// Session key to talk to (defaults to "main")
    pub session_key: Option<String>,
}

/// Speech synthesis defaults
#[derive(Debug, Default, Deserialize)]
pub struct TalkFileConfig {
    /// Default voice id
    pub voice_id: Option<String>,

    /// Friendly names for voice ids
    #[serde(default)]
    pub voice_aliases: HashMap<String, String>,

    /// Synthesis model (e.g. "eleven_v3")
    pub model_id: Option<String>,

    /// Output format tag (e.g. "pcm_24000", "mp3_44100_128")
    pub output_format: Option<String>,

    /// Synthesis API key
    pub api_key: Option<String>,

    /// Synthesis API base URL
    pub base_url: Option<String>,

    /// Stop playback when the user talks over it
    pub interrupt_on_speech: Option<bool>,
}

/// Transcription endpoint settings
#[derive(Debug, Default, Deserialize)]
pub struct SttFileConfig {
    /// API key
    pub api_key: Option<String>,

    /// Chat-completions base URL
    pub base_url: Option<String>,

    /// Audio-capable model
    pub model: Option<String>,
}

/// Voice activity tunables
#[derive(Debug, Default, Deserialize)]
pub struct VadFileConfig {
    /// Capture sample rate in Hz
    pub sample_rate: Option<u32>,

    /// Capture frame duration
    pub frame_ms: Option<u64>,

    /// RMS above which a frame counts as speech
    pub speech_rms_threshold: Option<u32>,

    /// Silence after speech that ends an utterance
    pub silence_after_speech_ms: Option<u64>,

    /// Shortest utterance worth transcribing
    pub min_speech_ms: Option<u64>,

    /// Multiple of the speech threshold that counts as barge-in
    pub barge_in_multiplier: Option<f32>,
}

/// Load the TOML config file from the standard path
///
/// Returns `TalkConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> TalkConfigFile {
    let Some(path) = config_file_path() else {
        return TalkConfigFile::default();
    };

    if !path.exists() {
        return TalkConfigFile::default();
    }

    match std::fs::read_to_string(&path) {
        Ok(content) => parse_config(&content).unwrap_or_else(|e| {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to parse config file, using defaults"
            );
            TalkConfigFile::default()
        }),
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            TalkConfigFile::default()
        }
    }
}

/// Parse config file contents
///
/// # Errors
///
/// Returns error if the content is not valid TOML for this schema
pub fn parse_config(content: &str) -> crate::Result<TalkConfigFile> {
    let config = toml::from_str(content)?;
    tracing::info!("loaded config file");
    Ok(config)
}

/// Return the config file path: `~/.config/omni/beacon/talk.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| {
        d.config_dir()
            .join("omni")
            .join("beacon")
            .join("talk.toml")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_partial_file() {
        let file = parse_config(
            r#"
            [talk]
            voice_id = "abc123456789"
            output_format = "mp3_44100_128"

            [talk.voice_aliases]
            Rachel = "21m00Tcm4TlvDq8ikWAM"

            [vad]
            speech_rms_threshold = 800
            frame_ms = 30
            "#,
        )
        .unwrap();

        assert_eq!(file.talk.voice_id.as_deref(), Some("abc123456789"));
        assert_eq!(file.talk.voice_aliases.len(), 1);
        assert_eq!(file.vad.speech_rms_threshold, Some(800));
        assert_eq!(file.vad.frame_ms, Some(30));
        assert!(file.vad.sample_rate.is_none());
        assert!(file.gateway.url.is_none());
    }

    #[test]
    fn test_parse_rejects_wrong_types() {
        assert!(parse_config("[vad]\nspeech_rms_threshold = \"loud\"").is_err());
    }
}
