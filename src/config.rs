//! Configuration management
//!
//! TOML config file with serde defaults for every field, so a missing or
//! partial file always yields a working configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Model assignments for different roles
    #[serde(default)]
    pub models: ModelsConfig,
    /// Confidence thresholds for the improvement pipeline
    #[serde(default)]
    pub thresholds: ThresholdsConfig,
    /// Improvement pipeline limits
    #[serde(default)]
    pub improvement: ImprovementConfig,
}

/// Model assignments for different roles
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    /// Default chat model
    #[serde(default = "default_chat_model")]
    pub chat: String,
    /// Model for the feedback classification fallback
    #[serde(default = "default_feedback_model")]
    pub feedback: String,
    /// Model for the analyzer agent
    #[serde(default = "default_analyzer_model")]
    pub analyzer: String,
    /// Model for the versioner agent
    #[serde(default = "default_versioner_model")]
    pub versioner: String,
}

fn default_chat_model() -> String {
    "z-ai/glm-5".to_string()
}

fn default_feedback_model() -> String {
    "openai/gpt-oss-120b:free".to_string()
}

fn default_analyzer_model() -> String {
    "z-ai/glm-5".to_string()
}

fn default_versioner_model() -> String {
    "z-ai/glm-5".to_string()
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            chat: default_chat_model(),
            feedback: default_feedback_model(),
            analyzer: default_analyzer_model(),
            versioner: default_versioner_model(),
        }
    }
}

/// Confidence thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdsConfig {
    /// Minimum confidence for negative feedback to trigger improvement
    #[serde(default = "default_feedback_confidence")]
    pub feedback_confidence: f64,
    /// Minimum analyzer confidence to apply a prompt change
    #[serde(default = "default_improvement_confidence")]
    pub improvement_confidence: f64,
}

fn default_feedback_confidence() -> f64 {
    0.8
}

fn default_improvement_confidence() -> f64 {
    0.6
}

impl Default for ThresholdsConfig {
    fn default() -> Self {
        Self {
            feedback_confidence: default_feedback_confidence(),
            improvement_confidence: default_improvement_confidence(),
        }
    }
}

/// Improvement pipeline limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImprovementConfig {
    /// Turn cap for analyzer and versioner tool loops
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
    /// Maximum prompt length in characters
    #[serde(default = "default_max_prompt_length")]
    pub max_prompt_length: usize,
    /// How many recent log entries feed the analyzer
    #[serde(default = "default_recent_logs_limit")]
    pub recent_logs_limit: usize,
}

fn default_max_turns() -> usize {
    crate::agent::tool_loop::DEFAULT_MAX_TURNS
}

fn default_max_prompt_length() -> usize {
    crate::improve::versioner::MAX_PROMPT_LENGTH
}

fn default_recent_logs_limit() -> usize {
    50
}

impl Default for ImprovementConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            max_prompt_length: default_max_prompt_length(),
            recent_logs_limit: default_recent_logs_limit(),
        }
    }
}

impl Config {
    /// Load configuration from file, creating defaults if it doesn't exist
    pub fn load() -> Result<Self> {
        let config_path = config_path()?;

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)
                .context("Failed to read config file")?;
            let config: Config = toml::from_str(&contents)
                .context("Failed to parse config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = config_path()?;
        let parent = config_path.parent()
            .context("Config path has no parent")?;

        std::fs::create_dir_all(parent)
            .context("Failed to create config directory")?;

        let contents = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;

        std::fs::write(&config_path, contents)
            .context("Failed to write config file")?;

        Ok(())
    }
}

/// Get the configuration file path
pub fn config_path() -> Result<PathBuf> {
    let base = directories::ProjectDirs::from("com", "reprompt", "reprompt")
        .context("Failed to get project directories")?;
    Ok(base.config_dir().join("config.toml"))
}

/// Get the data directory path (prompt store and logs)
pub fn data_dir() -> Result<PathBuf> {
    let base = directories::ProjectDirs::from("com", "reprompt", "reprompt")
        .context("Failed to get project directories")?;
    Ok(base.data_dir().to_path_buf())
}
