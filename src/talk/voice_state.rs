//! Per-session voice and model selection

use std::collections::HashMap;

use crate::config::{TalkSettings, normalize_alias_key};
use crate::talk::Directive;

/// Minimum length of something that can pass as a raw voice id
const MIN_VOICE_ID_LEN: usize = 10;

/// Voice/model selection for one talk session
///
/// Defaults come from configuration; persistent directives override the
/// current voice or model until configuration is reloaded with the override
/// still active.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionVoiceState {
    /// Configured default voice
    pub default_voice_id: Option<String>,
    /// Voice in use for the next reply
    pub current_voice_id: Option<String>,
    /// Configured default model
    pub default_model_id: String,
    /// Model in use for the next reply
    pub current_model_id: Option<String>,
    /// Configured default output format
    pub default_output_format: String,
    /// A directive pinned the voice
    pub voice_override_active: bool,
    /// A directive pinned the model
    pub model_override_active: bool,
    /// First voice from the remote voice list, cached
    pub fallback_voice_id: Option<String>,
    /// Normalized alias table
    pub voice_aliases: HashMap<String, String>,
    /// Synthesis API key
    pub api_key: Option<String>,
}

/// Voice and model chosen for one reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceChoice {
    /// Preferred voice before remote fallback lookup
    pub preferred_voice: Option<String>,
    /// Model to synthesize with
    pub model_id: String,
}

impl SessionVoiceState {
    /// Initial state from resolved settings
    #[must_use]
    pub fn new(settings: &TalkSettings) -> Self {
        let mut state = Self::default();
        state.apply_settings(settings);
        state
    }

    /// Take new defaults, keeping any active override
    pub fn apply_settings(&mut self, settings: &TalkSettings) {
        self.default_voice_id.clone_from(&settings.default_voice_id);
        self.voice_aliases.clone_from(&settings.voice_aliases);
        self.default_model_id.clone_from(&settings.default_model_id);
        self.default_output_format
            .clone_from(&settings.default_output_format);
        self.api_key.clone_from(&settings.api_key);

        if !self.voice_override_active {
            self.current_voice_id.clone_from(&self.default_voice_id);
        }
        if !self.model_override_active {
            self.current_model_id = Some(self.default_model_id.clone());
        }
    }

    /// Resolve a voice name or id
    ///
    /// Tries the alias table, then values that are already alias targets, then
    /// anything shaped like a raw voice id.
    #[must_use]
    pub fn resolve_alias(&self, value: &str) -> Option<String> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return None;
        }

        if let Some(id) = self.voice_aliases.get(&normalize_alias_key(trimmed)) {
            return Some(id.clone());
        }
        if self
            .voice_aliases
            .values()
            .any(|id| id.eq_ignore_ascii_case(trimmed))
        {
            return Some(trimmed.to_string());
        }
        is_likely_voice_id(trimmed).then(|| trimmed.to_string())
    }

    /// Apply a reply's directive and pick the voice and model for it
    ///
    /// Overrides without `once` become the session's current voice/model.
    pub fn apply_directive(&mut self, directive: Option<&Directive>) -> VoiceChoice {
        let requested = directive
            .and_then(|d| d.voice_id.as_deref())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        let resolved = requested.and_then(|v| self.resolve_alias(v));
        if let (Some(requested), None) = (requested, &resolved) {
            tracing::warn!(voice = requested, "unknown voice alias");
        }

        if let Some(d) = directive
            && !d.once
        {
            if d.voice_id.is_some() {
                self.current_voice_id.clone_from(&resolved);
                self.voice_override_active = true;
            }
            if let Some(model) = &d.model_id {
                self.current_model_id = Some(model.clone());
                self.model_override_active = true;
            }
        }

        let model_id = directive
            .and_then(|d| d.model_id.clone())
            .or_else(|| self.current_model_id.clone())
            .unwrap_or_else(|| self.default_model_id.clone());

        VoiceChoice {
            preferred_voice: resolved
                .or_else(|| self.current_voice_id.clone())
                .or_else(|| self.default_voice_id.clone()),
            model_id,
        }
    }

    /// Voice to use without asking the remote voice list, if any
    #[must_use]
    pub fn known_voice(&self, preferred: Option<&str>) -> Option<String> {
        if let Some(preferred) = preferred.map(str::trim).filter(|p| !p.is_empty()) {
            if let Some(id) = self.resolve_alias(preferred) {
                return Some(id);
            }
            tracing::warn!(voice = preferred, "unknown voice alias");
        }
        self.fallback_voice_id.clone()
    }

    /// Remember a voice picked from the remote list
    pub fn adopt_fallback_voice(&mut self, voice_id: &str) {
        self.fallback_voice_id = Some(voice_id.to_string());
        if self.default_voice_id.as_deref().is_none_or(|v| v.trim().is_empty()) {
            self.default_voice_id = Some(voice_id.to_string());
        }
        if !self.voice_override_active {
            self.current_voice_id = Some(voice_id.to_string());
        }
    }
}

/// Whether `value` looks like a raw voice id rather than a name
#[must_use]
pub fn is_likely_voice_id(value: &str) -> bool {
    value.len() >= MIN_VOICE_ID_LEN
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
