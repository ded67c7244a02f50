//! TOML configuration file loading
//!
//! Supports `~/.config/tempo/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::PathBuf;

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct TempoConfigFile {
    /// Where the planner database lives
    #[serde(default)]
    pub data_dir: Option<String>,

    /// Voice pipeline configuration
    #[serde(default)]
    pub voice: VoiceFileConfig,

    /// Remote assistant configuration
    #[serde(default)]
    pub assistant: AssistantFileConfig,

    /// API keys for external services
    #[serde(default)]
    pub api_keys: ApiKeysFileConfig,
}

/// Voice pipeline configuration
#[derive(Debug, Default, Deserialize)]
pub struct VoiceFileConfig {
    /// Phrase that opens a session (e.g. "hey tempo")
    pub wake_phrase: Option<String>,

    /// Samples per captured frame
    pub frame_size: Option<usize>,

    /// RMS level above which a frame counts as voiced
    pub voiced_threshold: Option<f32>,

    /// Seconds without a voiced frame before the session closes
    pub silence_timeout_secs: Option<u64>,

    /// Silence supervisor interval in milliseconds
    pub supervisor_tick_ms: Option<u64>,

    /// Time left for the assistant to finish speaking after `endSession`
    pub end_session_grace_ms: Option<u64>,

    /// STT model for wake phrase recognition (e.g. "whisper-1")
    pub stt_model: Option<String>,

    /// OpenAI-compatible transcription endpoint
    pub stt_url: Option<String>,
}

/// Remote assistant configuration
#[derive(Debug, Default, Deserialize)]
pub struct AssistantFileConfig {
    /// WebSocket URL of the realtime assistant
    pub url: Option<String>,

    /// Model identifier
    pub model: Option<String>,

    /// Voice identifier for synthesized replies
    pub voice: Option<String>,
}

/// API keys configuration
#[derive(Debug, Default, Deserialize)]
pub struct ApiKeysFileConfig {
    pub openai: Option<String>,
    pub assistant: Option<String>,
}

/// Load the TOML config file from the standard path
///
/// Returns `TempoConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> TempoConfigFile {
    let Some(path) = config_file_path() else {
        return TempoConfigFile::default();
    };

    if !path.exists() {
        return TempoConfigFile::default();
    }

    match std::fs::read_to_string(&path) {
        Ok(content) => parse_config(&content).unwrap_or_else(|e| {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to parse config file, using defaults"
            );
            TempoConfigFile::default()
        }),
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            TempoConfigFile::default()
        }
    }
}

/// Parse config file contents
///
/// # Errors
///
/// Returns error if the TOML is malformed
pub fn parse_config(content: &str) -> crate::Result<TempoConfigFile> {
    let config = toml::from_str(content)?;
    tracing::info!("loaded config file");
    Ok(config)
}

/// Return the config file path: `~/.config/tempo/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("tempo").join("config.toml"))
}
