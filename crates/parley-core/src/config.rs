//! Configuration loading and validation.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ParleyError, Result};

/// Top-level Parley configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub responder: ResponderConfig,

    #[serde(default)]
    pub avatar: AvatarConfig,

    #[serde(default)]
    pub speech: SpeechConfig,

    #[serde(default)]
    pub transcription: TranscriptionConfig,

    #[serde(default)]
    pub vision: VisionConfig,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

/// Chat + vision completion service (OpenAI-compatible).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponderConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default = "default_responder_key_env")]
    pub api_key_env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default = "default_chat_model")]
    pub model: String,
    #[serde(default = "default_vision_model")]
    pub vision_model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Persona prepended to text requests.
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

fn default_responder_key_env() -> Option<String> {
    Some("XAI_API_KEY".into())
}

fn default_chat_model() -> String {
    "grok-2-latest".into()
}

fn default_vision_model() -> String {
    "grok-2-vision".into()
}

fn default_temperature() -> f64 {
    0.7
}

fn default_max_tokens() -> u32 {
    2000
}

fn default_system_prompt() -> String {
    "You are iSolveUrProblems, a helpful AI assistant. Respond naturally and maintain context \
     from the entire conversation. If the user has attached files, acknowledge them and provide \
     relevant assistance."
        .into()
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_key_env: default_responder_key_env(),
            base_url: None,
            model: default_chat_model(),
            vision_model: default_vision_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            system_prompt: default_system_prompt(),
        }
    }
}

impl ResponderConfig {
    /// Resolve the API key: check `api_key` field first, then `api_key_env` environment variable.
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

/// Talking-avatar renderer (HeyGen streaming).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvatarConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default = "default_avatar_key_env")]
    pub api_key_env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_id: Option<String>,
    #[serde(default = "default_avatar_id_env")]
    pub avatar_id_env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice_id: Option<String>,
    #[serde(default = "default_voice_id_env")]
    pub voice_id_env: Option<String>,
    #[serde(default = "default_avatar_quality")]
    pub quality: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

fn default_avatar_key_env() -> Option<String> {
    Some("HEYGEN_API_KEY".into())
}

fn default_avatar_id_env() -> Option<String> {
    Some("HEYGEN_AVATAR_ID".into())
}

fn default_voice_id_env() -> Option<String> {
    Some("HEYGEN_VOICE_ID".into())
}

fn default_avatar_quality() -> String {
    "high".into()
}

impl Default for AvatarConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_key_env: default_avatar_key_env(),
            avatar_id: None,
            avatar_id_env: default_avatar_id_env(),
            voice_id: None,
            voice_id_env: default_voice_id_env(),
            quality: default_avatar_quality(),
            base_url: None,
        }
    }
}

impl AvatarConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }

    pub fn resolve_avatar_id(&self) -> Option<String> {
        resolve_secret_field(&self.avatar_id, &self.avatar_id_env)
    }

    pub fn resolve_voice_id(&self) -> Option<String> {
        resolve_secret_field(&self.voice_id, &self.voice_id_env)
    }
}

/// Speech capture and turn-taking timings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechConfig {
    #[serde(default = "default_language")]
    pub language: String,
    /// Debounce before restarting a finished recognition attempt.
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
    /// Delay after a restart attempt failed to start.
    #[serde(default = "default_restart_backoff_ms")]
    pub restart_backoff_ms: u64,
    /// An attempt with no speech for this long ends as "no-speech".
    #[serde(default = "default_no_speech_timeout_ms")]
    pub no_speech_timeout_ms: u64,
    #[serde(default = "default_max_utterance_ms")]
    pub max_utterance_ms: u64,
    /// Wait after the avatar stops talking before listening again.
    #[serde(default = "default_auto_resume_delay_ms")]
    pub auto_resume_delay_ms: u64,
    /// RMS energy above which a 20ms frame counts as speech.
    #[serde(default = "default_vad_threshold")]
    pub vad_threshold: f64,
}

fn default_language() -> String {
    "en-US".into()
}

fn default_restart_delay_ms() -> u64 {
    100
}

fn default_restart_backoff_ms() -> u64 {
    1000
}

fn default_no_speech_timeout_ms() -> u64 {
    8000
}

fn default_max_utterance_ms() -> u64 {
    30_000
}

fn default_auto_resume_delay_ms() -> u64 {
    2000
}

fn default_vad_threshold() -> f64 {
    300.0
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            language: default_language(),
            restart_delay_ms: default_restart_delay_ms(),
            restart_backoff_ms: default_restart_backoff_ms(),
            no_speech_timeout_ms: default_no_speech_timeout_ms(),
            max_utterance_ms: default_max_utterance_ms(),
            auto_resume_delay_ms: default_auto_resume_delay_ms(),
            vad_threshold: default_vad_threshold(),
        }
    }
}

/// Speech-to-text backend used by the transcribing recognizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    #[serde(default = "default_transcription_provider")]
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default = "default_transcription_key_env")]
    pub api_key_env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Overrides the provider's endpoint (used by tests and self-hosted servers).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

fn default_transcription_provider() -> String {
    "groq".into()
}

fn default_transcription_key_env() -> Option<String> {
    Some("GROQ_API_KEY".into())
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            provider: default_transcription_provider(),
            api_key: None,
            api_key_env: default_transcription_key_env(),
            model: None,
            base_url: None,
        }
    }
}

impl TranscriptionConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

/// Camera frame sampling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisionConfig {
    #[serde(default = "default_vision_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

fn default_vision_interval_ms() -> u64 {
    3000
}

fn default_jpeg_quality() -> u8 {
    80
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_vision_interval_ms(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "parley_media=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

static ENV_REF: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"\$\{([^}]+)\}").expect("static pattern"));

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    ENV_REF
        .replace_all(input, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    ///
    /// A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        let substituted = substitute_env_vars(&raw);

        json5::from_str(&substituted).map_err(|e| ParleyError::Config(e.to_string()))
    }

    /// Default config file location.
    pub fn default_path() -> PathBuf {
        data_dir().join("config.json")
    }

    /// Get a config value by dotted path (e.g. "speech.restart_delay_ms").
    pub fn get_path(&self, path: &str) -> Option<serde_json::Value> {
        let json = serde_json::to_value(self).ok()?;
        let mut current = &json;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(current.clone())
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if self.responder.resolve_api_key().is_none() {
            errors.push("Responder has no API key configured".to_string());
        }
        if self.avatar.resolve_avatar_id().is_none() {
            errors.push("Avatar id is not configured".to_string());
        }
        if self.avatar.resolve_voice_id().is_none() {
            errors.push("Avatar voice id is not configured".to_string());
        }
        if self.avatar.resolve_api_key().is_none() {
            warnings.push("Avatar renderer has no API key configured".to_string());
        }
        if self.transcription.resolve_api_key().is_none() {
            warnings.push(format!(
                "Transcription provider '{}' has no API key configured; voice input is disabled",
                self.transcription.provider
            ));
        }
        if self.vision.interval_ms == 0 {
            errors.push("Vision interval cannot be 0".to_string());
        }
        if !(1..=100).contains(&self.vision.jpeg_quality) {
            errors.push(format!(
                "JPEG quality must be between 1 and 100, got {}",
                self.vision.jpeg_quality
            ));
        }
        if self.speech.restart_delay_ms == 0 {
            warnings.push("speech.restart_delay_ms is 0; failing recognizers will spin".to_string());
        }

        (warnings, errors)
    }

    /// Fail fast when configuration the session cannot run without is missing.
    pub fn startup_check(&self) -> Result<()> {
        let (_, errors) = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ParleyError::Config(errors.join("; ")))
        }
    }

    /// Save config to a file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Base directory for Parley data: `~/.parley/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".parley")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configured() -> Config {
        let mut config = Config::default();
        config.responder.api_key = Some("xai-key".into());
        config.avatar.api_key = Some("heygen-key".into());
        config.avatar.avatar_id = Some("avatar-1".into());
        config.avatar.voice_id = Some("voice-1".into());
        config.transcription.api_key = Some("groq-key".into());
        config
    }

    #[test]
    fn test_env_var_substitution() {
        // SAFETY: test-only, variable name unique to this test
        unsafe { std::env::set_var("TEST_PARLEY_KEY", "sk-test-123") };
        let input = r#"{"key": "${TEST_PARLEY_KEY}", "other": "plain"}"#;
        let result = substitute_env_vars(input);
        assert!(result.contains("sk-test-123"));
        assert!(result.contains("plain"));
        unsafe { std::env::remove_var("TEST_PARLEY_KEY") };
    }

    #[test]
    fn test_env_var_missing() {
        let input = r#"{"key": "${NONEXISTENT_VAR_PARLEY_TEST}"}"#;
        let result = substitute_env_vars(input);
        assert!(result.contains(r#""""#));
    }

    #[test]
    fn test_default_timings() {
        let config = Config::default();
        assert_eq!(config.speech.restart_delay_ms, 100);
        assert_eq!(config.speech.restart_backoff_ms, 1000);
        assert_eq!(config.speech.auto_resume_delay_ms, 2000);
        assert_eq!(config.vision.interval_ms, 3000);
        assert_eq!(config.vision.jpeg_quality, 80);
        assert_eq!(config.speech.language, "en-US");
    }

    #[test]
    fn test_partial_section_keeps_defaults() {
        let config: Config = json5::from_str(
            r#"{
                // only override one timing
                speech: { auto_resume_delay_ms: 1500 },
                responder: { model: "grok-3" },
            }"#,
        )
        .unwrap();
        assert_eq!(config.speech.auto_resume_delay_ms, 1500);
        assert_eq!(config.speech.restart_delay_ms, 100);
        assert_eq!(config.responder.model, "grok-3");
        assert_eq!(config.responder.vision_model, "grok-2-vision");
        assert_eq!(config.responder.api_key_env.as_deref(), Some("XAI_API_KEY"));
    }

    #[test]
    fn test_resolve_api_key_prefers_direct_value() {
        // SAFETY: test-only, variable name unique to this test
        unsafe { std::env::set_var("TEST_PARLEY_RESPONDER_KEY", "from-env") };
        let mut responder = ResponderConfig {
            api_key_env: Some("TEST_PARLEY_RESPONDER_KEY".into()),
            ..ResponderConfig::default()
        };
        assert_eq!(responder.resolve_api_key(), Some("from-env".into()));

        responder.api_key = Some("direct-key".into());
        assert_eq!(responder.resolve_api_key(), Some("direct-key".into()));
        unsafe { std::env::remove_var("TEST_PARLEY_RESPONDER_KEY") };
    }

    #[test]
    fn test_startup_check_reports_missing_identity() {
        let mut config = configured();
        config.avatar.avatar_id = None;
        config.avatar.avatar_id_env = None;

        let err = config.startup_check().unwrap_err();
        assert!(matches!(err, ParleyError::Config(ref msg) if msg.contains("Avatar id")));
    }

    #[test]
    fn test_startup_check_passes_when_configured() {
        assert!(configured().startup_check().is_ok());
    }

    #[test]
    fn test_validate_bad_vision_settings() {
        let mut config = configured();
        config.vision.interval_ms = 0;
        config.vision.jpeg_quality = 0;
        let (_warnings, errors) = config.validate();
        assert_eq!(errors.len(), 2, "got: {errors:?}");
    }

    #[test]
    fn test_logging_config_defaults() {
        let config: Config = json5::from_str(r#"{ "logging": {} }"#).unwrap();
        let logging = config.logging.expect("logging should be present");
        assert_eq!(logging.format, "plain");
        assert!(logging.level.is_none());
        assert_eq!(logging.output, "stderr");
        assert!(logging.filters.is_empty());
    }

    #[test]
    fn test_load_and_save_roundtrip_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let config = configured();
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.avatar.avatar_id.as_deref(), Some("avatar-1"));
        assert_eq!(
            loaded.get_path("vision.interval_ms"),
            Some(serde_json::json!(3000))
        );
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let config = Config::load(Path::new("/nonexistent/parley/config.json")).unwrap();
        assert_eq!(config.responder.model, "grok-2-latest");
    }
}
