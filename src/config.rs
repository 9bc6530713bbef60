use secrecy::{ExposeSecret, SecretBox};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::Path;
use strum::{Display, EnumString};
use thiserror::Error;

use crate::wakeword::WakeWordConfig;

pub const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";
pub const DEFAULT_MODEL: &str = "models/gemini-2.5-flash-native-audio-preview-09-2025";
pub const DEFAULT_VOICE: &str = "Kore";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid API key format for {service}: {reason}")]
    InvalidKeyFormat { service: String, reason: String },
    #[error("Environment error: {0}")]
    EnvError(#[from] env::VarError),
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Credentials for the remote inference service
#[derive(Debug)]
pub struct ApiConfig {
    pub gemini_key: SecretBox<String>,
}

impl ApiConfig {
    /// Load API configuration from environment variables
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if it exists (for development)
        dotenvy::dotenv().ok();

        let gemini_key = Self::load_api_key("GEMINI_API_KEY", "Gemini")?;
        Ok(Self { gemini_key })
    }

    fn load_api_key(env_var: &str, service_name: &str) -> Result<SecretBox<String>, ConfigError> {
        let key = env::var(env_var).map_err(|_| ConfigError::MissingEnvVar(env_var.to_string()))?;

        if key.trim().is_empty() {
            return Err(ConfigError::InvalidKeyFormat {
                service: service_name.to_string(),
                reason: "API key cannot be empty".to_string(),
            });
        }

        Self::validate_key_format(&key, service_name)?;

        Ok(SecretBox::new(Box::new(key)))
    }

    fn validate_key_format(key: &str, service: &str) -> Result<(), ConfigError> {
        if service == "Gemini" && !key.starts_with("AIza") {
            return Err(ConfigError::InvalidKeyFormat {
                service: service.to_string(),
                reason: "Gemini keys should start with 'AIza'".to_string(),
            });
        }
        Ok(())
    }

    /// Get the Gemini API key (use only when opening a session)
    pub fn gemini_key(&self) -> &str {
        self.gemini_key.expose_secret()
    }
}

/// Load configuration with helpful error messages for development
pub fn load_config() -> Result<ApiConfig, ConfigError> {
    match ApiConfig::load() {
        Ok(config) => {
            log::info!("Successfully loaded API configuration");
            Ok(config)
        }
        Err(ConfigError::MissingEnvVar(var)) => {
            log::error!("Missing required environment variable: {}", var);
            log::error!("Create a .env file in the project root with:");
            log::error!("{}=your_api_key_here", var);
            Err(ConfigError::MissingEnvVar(var))
        }
        Err(e) => {
            log::error!("Configuration error: {}", e);
            Err(e)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ResponseModality {
    Audio,
    Text,
}

/// A named persona with system instructions keyed by language code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Persona {
    pub name: String,
    pub instructions: HashMap<String, String>,
}

impl Persona {
    /// Instruction for `language`, falling back to English, then any entry.
    pub fn instruction(&self, language: &str) -> Option<&str> {
        self.instructions
            .get(language)
            .or_else(|| self.instructions.get("en"))
            .or_else(|| self.instructions.values().next())
            .map(String::as_str)
    }
}

/// A function the remote service may ask the host to invoke mid-turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub parameters: Option<serde_json::Value>,
}

/// Everything the remote service needs at connect time, plus local
/// channel tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub endpoint: String,
    pub model: String,
    pub voice: String,
    pub language: String,
    pub persona: Option<Persona>,
    /// Overrides the persona instruction when set
    pub system_instruction: Option<String>,
    pub modality: ResponseModality,
    pub tools: Vec<ToolDeclaration>,
    pub input_transcription: bool,
    pub output_transcription: bool,
    /// Text turn sent once the session opens so the agent speaks first
    pub greeting: Option<String>,
    /// Outbound audio frames buffered between capture and socket
    pub outbound_capacity: usize,
    /// Frames captured before Open that are replayed on Open. 0 drops them.
    pub preroll_frames: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            voice: DEFAULT_VOICE.to_string(),
            language: "en".to_string(),
            persona: None,
            system_instruction: None,
            modality: ResponseModality::Audio,
            tools: Vec::new(),
            input_transcription: true,
            output_transcription: true,
            greeting: None,
            outbound_capacity: 32,
            preroll_frames: 0,
        }
    }
}

impl SessionConfig {
    /// The system instruction sent in the setup message, if any.
    pub fn resolved_system_instruction(&self) -> Option<String> {
        if let Some(text) = &self.system_instruction {
            return Some(text.clone());
        }
        self.persona
            .as_ref()
            .and_then(|p| p.instruction(&self.language))
            .map(str::to_string)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.outbound_capacity == 0 {
            return Err(ConfigError::Invalid(
                "outbound_capacity must be at least 1".to_string(),
            ));
        }
        if !(self.endpoint.starts_with("ws://") || self.endpoint.starts_with("wss://")) {
            return Err(ConfigError::Invalid(format!(
                "endpoint must be a ws:// or wss:// URL, got '{}'",
                self.endpoint
            )));
        }
        Ok(())
    }
}

/// Top-level engine configuration as loaded from a JSON file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub session: SessionConfig,
    /// Present for the always-listening variant
    pub wake_word: Option<WakeWordConfig>,
    /// Only stream microphone audio after an explicit talk press
    pub push_to_talk: bool,
}

impl EngineConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: EngineConfig = serde_json::from_str(&text)?;
        config.session.validate()?;
        log::info!("Loaded engine configuration from {}", path.as_ref().display());
        Ok(config)
    }
}
