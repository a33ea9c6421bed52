//! Synthesis parameter validation
//!
//! Every validator returns `None` for a rejected value. Rejections are never
//! fatal; the parameter is simply left out of the request.

use crate::talk::Directive;

/// Model that only accepts the coarse stability steps
pub const STABILITY_STEPPED_MODEL: &str = "eleven_v3";

/// Words per minute that map to a speed of 1.0
const BASE_RATE_WPM: f64 = 175.0;

/// PCM sample rates the synthesis endpoint can stream
const PCM_SAMPLE_RATES: &[u32] = &[16000, 22050, 24000, 44100];

/// Largest accepted seed
const MAX_SEED: i64 = 4_294_967_295;

/// Largest streaming latency tier
const MAX_LATENCY_TIER: i64 = 4;

/// Fully resolved parameters for one utterance
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SynthesisRequest {
    /// Text to speak
    pub text: String,
    /// Synthesis model
    pub model_id: Option<String>,
    /// Output format tag
    pub output_format: Option<String>,
    /// Playback speed multiplier
    pub speed: Option<f64>,
    /// Voice stability
    pub stability: Option<f64>,
    /// Similarity boost
    pub similarity: Option<f64>,
    /// Style exaggeration
    pub style: Option<f64>,
    /// Speaker boost toggle
    pub speaker_boost: Option<bool>,
    /// Sampling seed
    pub seed: Option<u32>,
    /// Text normalization mode
    pub normalize: Option<String>,
    /// Lower-case ISO 639-1 language code
    pub language: Option<String>,
    /// Streaming latency optimization tier
    pub latency_tier: Option<u8>,
}

impl SynthesisRequest {
    /// Build a validated request from reply text and an optional directive
    ///
    /// `model_id` is the already-resolved model (directive, then session,
    /// then default); `default_output_format` applies when the directive has
    /// none.
    #[must_use]
    pub fn build(
        text: impl Into<String>,
        directive: Option<&Directive>,
        model_id: Option<String>,
        default_output_format: &str,
    ) -> Self {
        let d = directive.cloned().unwrap_or_default();
        let model_id = model_id.map(|m| m.trim().to_string()).filter(|m| !m.is_empty());

        Self {
            text: text.into(),
            stability: d
                .stability
                .and_then(|v| validated_stability(v, model_id.as_deref())),
            output_format: validated_output_format(
                d.output_format.as_deref().unwrap_or(default_output_format),
            ),
            speed: resolve_speed(d.speed, d.rate_wpm),
            similarity: d.similarity.and_then(validated_unit),
            style: d.style.and_then(validated_unit),
            speaker_boost: d.speaker_boost,
            seed: d.seed.and_then(validated_seed),
            normalize: d.normalize.as_deref().and_then(validated_normalize),
            language: d.language.as_deref().and_then(validated_language),
            latency_tier: d.latency_tier.and_then(validated_latency_tier),
            model_id,
        }
    }

    /// Re-apply every validator; a valid request comes back unchanged
    #[must_use]
    pub fn validated(self) -> Self {
        let stability = self
            .stability
            .and_then(|v| validated_stability(v, self.model_id.as_deref()));

        Self {
            speed: resolve_speed(self.speed, None),
            stability,
            similarity: self.similarity.and_then(validated_unit),
            style: self.style.and_then(validated_unit),
            output_format: self.output_format.as_deref().and_then(validated_output_format),
            normalize: self.normalize.as_deref().and_then(validated_normalize),
            language: self.language.as_deref().and_then(validated_language),
            latency_tier: self
                .latency_tier
                .and_then(|t| validated_latency_tier(i64::from(t))),
            ..self
        }
    }

    /// Sample rate when the output format is a streamable PCM tag
    #[must_use]
    pub fn pcm_sample_rate(&self) -> Option<u32> {
        self.output_format.as_deref().and_then(parse_pcm_sample_rate)
    }

    /// `Accept` header matching the output format
    #[must_use]
    pub fn accept_header(&self) -> &'static str {
        let is_pcm = self
            .output_format
            .as_deref()
            .is_some_and(|f| f.trim().to_ascii_lowercase().starts_with("pcm_"));
        if is_pcm { "audio/pcm" } else { "audio/mpeg" }
    }
}

/// Resolve speed from an explicit multiplier or a words-per-minute rate
///
/// A positive rate wins over `speed`. The result must lie strictly between
/// 0.5 and 2.0.
#[must_use]
pub fn resolve_speed(speed: Option<f64>, rate_wpm: Option<i64>) -> Option<f64> {
    #[allow(clippy::cast_precision_loss)]
    let candidate = match rate_wpm.filter(|r| *r > 0) {
        Some(rate) => rate as f64 / BASE_RATE_WPM,
        None => speed?,
    };

    if candidate <= 0.5 || candidate >= 2.0 || candidate.is_nan() {
        tracing::debug!(speed = candidate, "speed rejected");
        return None;
    }
    Some(candidate)
}

/// Accept values in [0, 1]
#[must_use]
pub fn validated_unit(value: f64) -> Option<f64> {
    if (0.0..=1.0).contains(&value) {
        Some(value)
    } else {
        tracing::debug!(value, "unit value rejected");
        None
    }
}

/// Stability check; the stepped model only takes 0, 0.5 or 1
#[must_use]
#[allow(clippy::float_cmp)]
pub fn validated_stability(value: f64, model_id: Option<&str>) -> Option<f64> {
    let stepped = model_id
        .is_some_and(|m| m.trim().eq_ignore_ascii_case(STABILITY_STEPPED_MODEL));
    if stepped {
        if value == 0.0 || value == 0.5 || value == 1.0 {
            return Some(value);
        }
        tracing::debug!(value, model = ?model_id, "stability rejected for stepped model");
        return None;
    }
    validated_unit(value)
}

/// Seed in [0, 2^32 - 1]
#[must_use]
pub fn validated_seed(value: i64) -> Option<u32> {
    if (0..=MAX_SEED).contains(&value) {
        u32::try_from(value).ok()
    } else {
        tracing::debug!(value, "seed rejected");
        None
    }
}

/// One of `auto`, `on`, `off` (case-insensitive), lower-cased
#[must_use]
pub fn validated_normalize(value: &str) -> Option<String> {
    let normalized = value.trim().to_ascii_lowercase();
    if matches!(normalized.as_str(), "auto" | "on" | "off") {
        Some(normalized)
    } else {
        tracing::debug!(value, "normalize rejected");
        None
    }
}

/// Two ASCII letters, lower-cased
#[must_use]
pub fn validated_language(value: &str) -> Option<String> {
    let normalized = value.trim().to_ascii_lowercase();
    if normalized.len() == 2 && normalized.bytes().all(|b| b.is_ascii_lowercase()) {
        Some(normalized)
    } else {
        tracing::debug!(value, "language rejected");
        None
    }
}

/// `mp3_*`, or `pcm_*` at a supported sample rate; lower-cased
#[must_use]
pub fn validated_output_format(value: &str) -> Option<String> {
    let normalized = value.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        return None;
    }
    if normalized.starts_with("mp3_") || parse_pcm_sample_rate(&normalized).is_some() {
        return Some(normalized);
    }
    tracing::debug!(value, "output format rejected");
    None
}

/// Latency tier in [0, 4]
#[must_use]
pub fn validated_latency_tier(value: i64) -> Option<u8> {
    if (0..=MAX_LATENCY_TIER).contains(&value) {
        u8::try_from(value).ok()
    } else {
        tracing::debug!(value, "latency tier rejected");
        None
    }
}

/// Sample rate encoded in a `pcm_<rate>` tag, if it is a supported one
#[must_use]
pub fn parse_pcm_sample_rate(value: &str) -> Option<u32> {
    let normalized = value.trim().to_ascii_lowercase();
    let suffix = normalized.strip_prefix("pcm_")?;
    let digits: String = suffix.chars().take_while(char::is_ascii_digit).collect();
    let rate: u32 = digits.parse().ok()?;
    PCM_SAMPLE_RATES.contains(&rate).then_some(rate)
}
