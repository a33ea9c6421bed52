//! Remote text-to-speech (ElevenLabs-compatible streaming API)

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::TalkTimeouts;
use crate::error::SynthesisError;
use crate::talk::SynthesisRequest;
use crate::{Error, Result};

/// A voice offered by the synthesis service
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Voice {
    /// Voice id
    pub voice_id: String,
    /// Display name
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Deserialize)]
struct VoicesResponse {
    #[serde(default)]
    voices: Vec<Voice>,
}

#[derive(Debug, Serialize)]
struct TtsBody<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    model_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    output_format: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    apply_text_normalization: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    language_code: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    voice_settings: Option<VoiceSettings>,
}

#[derive(Debug, Default, Serialize)]
struct VoiceSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    speed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stability: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    similarity_boost: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    style: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    use_speaker_boost: Option<bool>,
}

impl VoiceSettings {
    const fn is_empty(&self) -> bool {
        self.speed.is_none()
            && self.stability.is_none()
            && self.similarity_boost.is_none()
            && self.style.is_none()
            && self.use_speaker_boost.is_none()
    }
}

impl<'a> TtsBody<'a> {
    fn new(request: &'a SynthesisRequest) -> Self {
        let settings = VoiceSettings {
            speed: request.speed,
            stability: request.stability,
            similarity_boost: request.similarity,
            style: request.style,
            use_speaker_boost: request.speaker_boost,
        };

        Self {
            text: &request.text,
            model_id: request.model_id.as_deref().filter(|m| !m.is_empty()),
            output_format: request.output_format.as_deref().filter(|f| !f.is_empty()),
            seed: request.seed,
            apply_text_normalization: request.normalize.as_deref(),
            language_code: request.language.as_deref(),
            voice_settings: (!settings.is_empty()).then_some(settings),
        }
    }
}

/// Client for the streaming synthesis and voice list endpoints
#[derive(Clone)]
pub struct TtsClient {
    client: reqwest::Client,
    base_url: String,
    voices_timeout: Duration,
}

impl TtsClient {
    /// Create a client against `base_url` (e.g. `https://api.elevenlabs.io/v1`)
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn new(base_url: impl Into<String>, timeouts: &TalkTimeouts) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeouts.tts)
            .read_timeout(timeouts.tts)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            voices_timeout: timeouts.voices,
        })
    }

    /// Start a streaming synthesis request
    ///
    /// The returned response has a success status; its body is the audio.
    ///
    /// # Errors
    ///
    /// Returns `Http` for an error status and `Transport` if the request fails
    pub async fn stream(
        &self,
        voice_id: &str,
        api_key: &str,
        request: &SynthesisRequest,
    ) -> std::result::Result<reqwest::Response, SynthesisError> {
        let url = self.stream_url(voice_id, request.latency_tier);
        tracing::debug!(
            voice_id,
            format = ?request.output_format,
            chars = request.text.len(),
            "tts stream start"
        );

        let response = self
            .client
            .post(&url)
            .header("xi-api-key", api_key)
            .header(reqwest::header::ACCEPT, request.accept_header())
            .json(&TtsBody::new(request))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SynthesisError::Http {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response)
    }

    /// List available voices
    ///
    /// # Errors
    ///
    /// Returns error if the request fails or the service answers an error
    pub async fn list_voices(&self, api_key: &str) -> Result<Vec<Voice>> {
        let response = self
            .client
            .get(format!("{}/voices", self.base_url))
            .header("xi-api-key", api_key)
            .timeout(self.voices_timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Tts(format!("voices failed: {status} {body}")));
        }

        let body: VoicesResponse = response.json().await?;
        Ok(body.voices)
    }

    fn stream_url(&self, voice_id: &str, latency_tier: Option<u8>) -> String {
        let base = format!(
            "{}/text-to-speech/{}/stream",
            self.base_url,
            urlencoding::encode(voice_id)
        );
        match latency_tier {
            Some(tier) => format!("{base}?optimize_streaming_latency={tier}"),
            None => base,
        }
    }
}
