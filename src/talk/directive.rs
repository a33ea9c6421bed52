//! Inline voice directives
//!
//! An assistant reply may open with a single-line JSON object that overrides
//! synthesis parameters, e.g. `{"voice":"Rachel","once":true}`. The rest of
//! the reply is the text to speak.

use serde_json::{Map, Value};

/// Per-reply synthesis overrides
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Directive {
    /// Voice id or alias
    pub voice_id: Option<String>,
    /// Synthesis model
    pub model_id: Option<String>,
    /// Output format tag (`mp3_*` / `pcm_*`)
    pub output_format: Option<String>,
    /// Playback speed multiplier
    pub speed: Option<f64>,
    /// Speaking rate in words per minute
    pub rate_wpm: Option<i64>,
    /// Voice stability
    pub stability: Option<f64>,
    /// Similarity boost
    pub similarity: Option<f64>,
    /// Style exaggeration
    pub style: Option<f64>,
    /// Speaker boost toggle
    pub speaker_boost: Option<bool>,
    /// Sampling seed
    pub seed: Option<i64>,
    /// Text normalization mode
    pub normalize: Option<String>,
    /// ISO 639-1 language code
    pub language: Option<String>,
    /// Streaming latency optimization tier
    pub latency_tier: Option<i64>,
    /// Apply to this reply only
    pub once: bool,
}

/// Reply text split into directive and speakable text
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedReply {
    /// Directive from the first line, if there was one
    pub directive: Option<Directive>,
    /// Text with the directive line removed
    pub stripped: String,
    /// Keys present in the directive that were not understood
    pub unknown_keys: Vec<String>,
}

/// Split a directive line off the front of `text`
///
/// Only the first line is inspected. Anything that is not a JSON object is
/// left in place and the text is returned verbatim.
#[must_use]
pub fn parse_reply(text: &str) -> ParsedReply {
    let verbatim = || ParsedReply {
        directive: None,
        stripped: text.to_string(),
        unknown_keys: Vec::new(),
    };

    let body = text.trim_start();
    let (first, rest) = body.split_once('\n').unwrap_or((body, ""));
    let first = first.trim();
    if !first.starts_with('{') {
        return verbatim();
    }

    let Ok(Value::Object(map)) = serde_json::from_str::<Value>(first) else {
        return verbatim();
    };

    let (directive, mut unknown_keys) = directive_from_map(&map);
    unknown_keys.sort();

    ParsedReply {
        directive: Some(directive),
        stripped: rest.to_string(),
        unknown_keys,
    }
}

fn directive_from_map(map: &Map<String, Value>) -> (Directive, Vec<String>) {
    let mut directive = Directive::default();
    let mut unknown = Vec::new();

    for (key, value) in map {
        match key.as_str() {
            "voice" | "voice_id" | "voiceId" => directive.voice_id = as_string(value),
            "model" | "model_id" | "modelId" => directive.model_id = as_string(value),
            "output_format" | "outputFormat" | "format" => {
                directive.output_format = as_string(value);
            }
            "speed" => directive.speed = as_f64(value),
            "rate" | "wpm" | "rateWpm" => directive.rate_wpm = as_i64(value),
            "stability" => directive.stability = as_f64(value),
            "similarity" | "similarity_boost" | "similarityBoost" => {
                directive.similarity = as_f64(value);
            }
            "style" => directive.style = as_f64(value),
            "speaker_boost" | "speakerBoost" => directive.speaker_boost = as_bool(value),
            "seed" => directive.seed = as_i64(value),
            "normalize" | "apply_text_normalization" => directive.normalize = as_string(value),
            "lang" | "language" | "language_code" => directive.language = as_string(value),
            "latency" | "latency_tier" | "latencyTier" => directive.latency_tier = as_i64(value),
            "once" => directive.once = as_bool(value).unwrap_or(false),
            _ => unknown.push(key.clone()),
        }
    }

    (directive, unknown)
}

fn as_string(value: &Value) -> Option<String> {
    let s = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!s.is_empty()).then_some(s)
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[allow(clippy::cast_possible_truncation)]
fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Some(true),
            "false" | "no" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}
