//! Configuration management for murmur.
//!
//! This module provides core configuration that doesn't depend on
//! platform-specific UI libraries.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use dirs::{config_dir, data_dir};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::APP_NAME;

/// Core configuration structure for the application.
///
/// This contains settings that are platform-agnostic. Platform-specific
/// settings like the hotkey are stored as strings and parsed by the app.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// OpenAI API key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub openai_key: Option<String>,

    /// Preferred language for transcription (ISO 639-1 code)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,

    /// Model to use for transcriptions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcription_model: Option<String>,

    /// Model to use for response generation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_model: Option<String>,

    /// Hotkey configuration (stored as string, parsed by app)
    /// Format: "modifier+modifier+key" e.g., "meta+shift+space"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hotkey: Option<String>,

    /// Normalized loudness below which a level sample counts as silence
    #[serde(
        default = "default_silence_threshold",
        skip_serializing_if = "is_default_silence_threshold"
    )]
    pub silence_threshold: f32,

    /// Seconds of continuous silence that auto-stop a recording
    #[serde(
        default = "default_max_silence",
        skip_serializing_if = "is_default_max_silence"
    )]
    pub max_silence_secs: f32,

    /// Per-stage timeout for transcription/completion requests (in seconds)
    #[serde(
        default = "default_stage_timeout",
        skip_serializing_if = "is_default_stage_timeout"
    )]
    pub stage_timeout_secs: u64,

    /// Directory recordings are written to (defaults under the user data dir)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recordings_dir: Option<PathBuf>,
}

fn default_silence_threshold() -> f32 {
    0.02
}

fn is_default_silence_threshold(v: &f32) -> bool {
    (*v - 0.02).abs() < f32::EPSILON
}

fn default_max_silence() -> f32 {
    5.0
}

fn is_default_max_silence(v: &f32) -> bool {
    (*v - 5.0).abs() < f32::EPSILON
}

fn default_stage_timeout() -> u64 {
    30
}

fn is_default_stage_timeout(v: &u64) -> bool {
    *v == 30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            openai_key: None,
            language: None,
            transcription_model: None,
            completion_model: None,
            hotkey: None,
            silence_threshold: default_silence_threshold(),
            max_silence_secs: default_max_silence(),
            stage_timeout_secs: default_stage_timeout(),
            recordings_dir: None,
        }
    }
}

impl Config {
    /// Get the OpenAI API key
    pub fn key_openai(&self) -> Option<&str> {
        self.openai_key.as_deref()
    }

    /// Get the preferred language
    pub fn language(&self) -> Option<&str> {
        self.language.as_deref()
    }

    /// Get the transcription model name
    pub fn transcription_model(&self) -> Option<&str> {
        self.transcription_model.as_deref()
    }

    /// Get the completion model name
    pub fn completion_model(&self) -> Option<&str> {
        self.completion_model.as_deref()
    }

    /// Get the silence threshold as a normalized level
    pub fn silence_threshold(&self) -> f32 {
        self.silence_threshold
    }

    /// Get the max-silence duration
    pub fn max_silence(&self) -> Duration {
        Duration::from_secs_f32(self.max_silence_secs)
    }

    /// Get the per-stage timeout
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }

    /// Directory recordings are written to. Falls back to
    /// `<data dir>/murmur/recordings` when not configured.
    pub fn recordings_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.recordings_dir {
            return Ok(dir.clone());
        }
        let data_dir = data_dir().context("Failed to retrieve data directory")?;
        Ok(data_dir.join(APP_NAME).join("recordings"))
    }
}

/// Manages loading and saving configuration files.
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Creates a new ConfigManager with the default configuration directory.
    pub fn new() -> Result<Self> {
        let config_path = Self::default_config_path()?;
        Ok(Self { config_path })
    }

    /// Creates a new ConfigManager with a specified configuration directory.
    pub fn with_config_dir<P: AsRef<Path>>(dir: P) -> Self {
        let config_path = dir.as_ref().join(format!("{}.toml", APP_NAME));
        Self { config_path }
    }

    /// Returns the default path to the configuration file.
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = config_dir().context("Failed to retrieve configuration directory")?;
        Ok(config_dir.join(APP_NAME).join(format!("{}.toml", APP_NAME)))
    }

    /// Loads the configuration from the config file or returns default.
    pub fn load(&self) -> Result<Config> {
        if !self.config_path.exists() {
            return Ok(Config::default());
        }

        let config_content = fs::read_to_string(&self.config_path)
            .with_context(|| format!("Failed to read config file at {:?}", self.config_path))?;

        let config: Config = toml::from_str(&config_content)
            .with_context(|| format!("Failed to parse config file at {:?}", self.config_path))?;

        if config.key_openai().is_none() {
            warn!(
                "OpenAI API key is not set. Transcription and response generation \
                 will not work without it. Edit the config file to set the key."
            );
        }

        Ok(config)
    }

    /// Saves the configuration to the config file.
    pub fn save(&self, config: &Config) -> Result<()> {
        let config_dir = self
            .config_path
            .parent()
            .with_context(|| format!("Failed to get parent directory of {:?}", self.config_path))?;

        fs::create_dir_all(config_dir)
            .with_context(|| format!("Failed to create config directory at {:?}", config_dir))?;

        let serialized =
            toml::to_string_pretty(&config).context("Failed to serialize configuration")?;

        fs::write(&self.config_path, serialized)
            .with_context(|| format!("Failed to write config file at {:?}", self.config_path))?;

        Ok(())
    }

    /// Returns the path to the configuration file.
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }
}
