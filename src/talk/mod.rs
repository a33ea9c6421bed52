//! Talk mode
//!
//! Service-facing half of the pipeline: transcription, the agent transport,
//! reply directives, synthesis requests and the dialogue orchestrator that
//! ties them to the devices in [`crate::voice`].

mod agent;
mod directive;
mod orchestrator;
mod player;
mod prompt;
mod stt;
mod tts;
mod validate;
mod voice_state;

pub use agent::{
    AgentTransport, ChatEvent, ChatSendRequest, GatewayClient, HistoryMessage,
    is_message_timestamp_after, latest_assistant_text,
};
pub use directive::{Directive, ParsedReply, parse_reply};
pub use orchestrator::{
    DialogueState, SpeakOutcome, SpeakProgress, TalkMode, TalkParts, TalkStatus, speak_reply,
};
pub use player::{COMPRESSED_FALLBACK_FORMAT, PlaybackPath, SpeechPlayer};
pub use prompt::build_prompt;
pub use stt::TranscriptionClient;
pub use tts::{TtsClient, Voice};
pub use validate::{
    STABILITY_STEPPED_MODEL, SynthesisRequest, parse_pcm_sample_rate, resolve_speed,
    validated_language, validated_latency_tier, validated_normalize, validated_output_format,
    validated_seed, validated_stability, validated_unit,
};
pub use voice_state::{SessionVoiceState, VoiceChoice, is_likely_voice_id};
