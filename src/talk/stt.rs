//! Speech-to-text via a chat-completions endpoint with audio input

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::config::SttConfig;
use crate::voice::{SpeechSegment, pcm_to_wav};
use crate::{Error, Result};

/// Instruction sent alongside the audio
const TRANSCRIBE_INSTRUCTION: &str = "Transcribe this audio exactly. Return only the spoken words, \
     nothing else. If the audio is silent or unintelligible, return an empty string.";

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: [UserMessage<'a>; 1],
}

#[derive(Serialize)]
struct UserMessage<'a> {
    role: &'static str,
    content: [ContentPart<'a>; 2],
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart<'a> {
    Text { text: &'a str },
    InputAudio { input_audio: InputAudio<'a> },
}

#[derive(Serialize)]
struct InputAudio<'a> {
    data: &'a str,
    format: &'static str,
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

/// Transcribes speech segments
pub struct TranscriptionClient {
    client: reqwest::Client,
}

impl TranscriptionClient {
    /// Create a client with the configured connect/read timeouts
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn new(config: &SttConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .build()?;
        Ok(Self { client })
    }

    /// Transcribe a segment
    ///
    /// Returns `None` on any failure or when the result is blank; errors are
    /// logged, never returned.
    pub async fn transcribe(&self, config: &SttConfig, segment: &SpeechSegment) -> Option<String> {
        let Some(api_key) = config.api_key.as_deref().filter(|k| !k.trim().is_empty()) else {
            tracing::warn!("no STT API key; cannot transcribe");
            return None;
        };

        match self.request(config, api_key, segment).await {
            Ok(text) => {
                let text = text.trim();
                if text.is_empty() {
                    tracing::debug!("transcription returned empty");
                    None
                } else {
                    tracing::debug!(chars = text.len(), "transcription complete");
                    Some(text.to_string())
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "stt failed");
                None
            }
        }
    }

    async fn request(
        &self,
        config: &SttConfig,
        api_key: &str,
        segment: &SpeechSegment,
    ) -> Result<String> {
        let wav = pcm_to_wav(&segment.pcm, segment.sample_rate, 1)?;
        let audio = base64::engine::general_purpose::STANDARD.encode(&wav);

        tracing::debug!(
            audio_bytes = wav.len(),
            model = %config.model,
            "starting transcription"
        );

        let request = CompletionRequest {
            model: &config.model,
            messages: [UserMessage {
                role: "user",
                content: [
                    ContentPart::Text {
                        text: TRANSCRIBE_INSTRUCTION,
                    },
                    ContentPart::InputAudio {
                        input_audio: InputAudio {
                            data: &audio,
                            format: "wav",
                        },
                    },
                ],
            }],
        };

        let url = format!("{}/chat/completions", config.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Stt(format!("{status}: {body}")));
        }

        let body: CompletionResponse = response.json().await?;
        body.choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .and_then(|m| m.content)
            .ok_or_else(|| Error::Stt("response has no message content".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_shape() {
        let request = CompletionRequest {
            model: "google/gemini-2.5-flash",
            messages: [UserMessage {
                role: "user",
                content: [
                    ContentPart::Text { text: "hi" },
                    ContentPart::InputAudio {
                        input_audio: InputAudio {
                            data: "UklGRg==",
                            format: "wav",
                        },
                    },
                ],
            }],
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["model"], "google/gemini-2.5-flash");
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(json["messages"][0]["content"][0]["type"], "text");
        assert_eq!(json["messages"][0]["content"][1]["type"], "input_audio");
        assert_eq!(
            json["messages"][0]["content"][1]["input_audio"]["format"],
            "wav"
        );
    }
}
