//! Configuration management for Tempo
//!
//! Precedence is env > TOML file > defaults.

pub mod file;

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::voice::{CAPTURE_SAMPLE_RATE, PLAYBACK_SAMPLE_RATE};
use crate::{Error, Result};

use file::TempoConfigFile;

/// Tempo configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to data directory (database)
    pub data_dir: PathBuf,

    /// Voice pipeline configuration
    pub voice: VoiceConfig,

    /// Remote assistant configuration
    pub assistant: AssistantConfig,
}

/// Voice pipeline configuration
#[derive(Debug, Clone)]
pub struct VoiceConfig {
    /// Phrase that promotes WAITING to ACTIVE, lower-cased
    pub wake_phrase: String,

    /// Samples per captured frame
    pub frame_size: usize,

    /// RMS level above which a frame counts as voiced
    pub voiced_threshold: f32,

    /// How long a session may go without a voiced frame
    pub silence_timeout: Duration,

    /// How often the silence supervisor checks
    pub supervisor_tick: Duration,

    /// Time left for trailing speech after an `endSession` call
    pub end_session_grace: Duration,

    /// STT model used for wake phrase recognition
    pub stt_model: String,

    /// OpenAI-compatible transcription endpoint
    pub stt_url: String,

    /// API key for the transcription endpoint
    pub stt_api_key: Option<SecretString>,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            wake_phrase: "hey tempo".to_string(),
            frame_size: 4096,
            voiced_threshold: 0.01,
            silence_timeout: Duration::from_secs(10),
            supervisor_tick: Duration::from_secs(1),
            end_session_grace: Duration::from_secs(1),
            stt_model: "whisper-1".to_string(),
            stt_url: "https://api.openai.com/v1/audio/transcriptions".to_string(),
            stt_api_key: None,
        }
    }
}

/// Remote assistant configuration
#[derive(Debug, Clone)]
pub struct AssistantConfig {
    /// WebSocket URL of the realtime assistant
    pub url: String,

    /// Model identifier
    pub model: String,

    /// Voice identifier for synthesized replies
    pub voice: String,

    /// Bearer token for the assistant endpoint
    pub api_key: Option<SecretString>,

    /// Outbound (microphone) sample rate
    pub input_sample_rate: u32,

    /// Inbound (speaker) sample rate
    pub output_sample_rate: u32,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8765/v1/realtime".to_string(),
            model: "realtime-voice".to_string(),
            voice: "alloy".to_string(),
            api_key: None,
            input_sample_rate: CAPTURE_SAMPLE_RATE,
            output_sample_rate: PLAYBACK_SAMPLE_RATE,
        }
    }
}

/// Default data directory: `~/.local/share/tempo` on Linux
fn default_data_dir() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || PathBuf::from(".local/share/tempo"),
        |d| d.data_dir().join("tempo"),
    )
}

impl Config {
    /// Load configuration from the config file and environment
    ///
    /// # Errors
    ///
    /// Returns error if the resulting configuration is invalid
    pub fn load(data_dir: Option<PathBuf>) -> Result<Self> {
        let fc = file::load_config_file();
        let mut config = Self::resolve(fc, |key| std::env::var(key).ok())?;

        if let Some(dir) = data_dir {
            config.data_dir = dir;
        }

        if let Err(e) = std::fs::create_dir_all(&config.data_dir) {
            tracing::warn!(
                path = %config.data_dir.display(),
                error = %e,
                "failed to create data directory"
            );
        }

        Ok(config)
    }

    /// Merge a parsed config file with environment lookups over defaults
    ///
    /// # Errors
    ///
    /// Returns error if the resulting configuration is invalid
    pub fn resolve<F>(fc: TempoConfigFile, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let voice_defaults = VoiceConfig::default();
        let assistant_defaults = AssistantConfig::default();

        let openai_key = env("OPENAI_API_KEY").or(fc.api_keys.openai);

        let voice = VoiceConfig {
            wake_phrase: env("TEMPO_WAKE_PHRASE")
                .or(fc.voice.wake_phrase)
                .map_or(voice_defaults.wake_phrase, |p| p.trim().to_lowercase()),
            frame_size: fc.voice.frame_size.unwrap_or(voice_defaults.frame_size),
            voiced_threshold: fc
                .voice
                .voiced_threshold
                .unwrap_or(voice_defaults.voiced_threshold),
            silence_timeout: env("TEMPO_SILENCE_TIMEOUT_SECS")
                .and_then(|s| s.parse().ok())
                .or(fc.voice.silence_timeout_secs)
                .map_or(voice_defaults.silence_timeout, Duration::from_secs),
            supervisor_tick: fc
                .voice
                .supervisor_tick_ms
                .map_or(voice_defaults.supervisor_tick, Duration::from_millis),
            end_session_grace: fc
                .voice
                .end_session_grace_ms
                .map_or(voice_defaults.end_session_grace, Duration::from_millis),
            stt_model: env("TEMPO_STT_MODEL")
                .or(fc.voice.stt_model)
                .unwrap_or(voice_defaults.stt_model),
            stt_url: fc.voice.stt_url.unwrap_or(voice_defaults.stt_url),
            stt_api_key: openai_key.clone().map(SecretString::from),
        };

        let assistant = AssistantConfig {
            url: env("TEMPO_ASSISTANT_URL")
                .or(fc.assistant.url)
                .unwrap_or(assistant_defaults.url),
            model: env("TEMPO_ASSISTANT_MODEL")
                .or(fc.assistant.model)
                .unwrap_or(assistant_defaults.model),
            voice: env("TEMPO_ASSISTANT_VOICE")
                .or(fc.assistant.voice)
                .unwrap_or(assistant_defaults.voice),
            api_key: env("TEMPO_ASSISTANT_API_KEY")
                .or(fc.api_keys.assistant)
                .or(openai_key)
                .map(SecretString::from),
            ..assistant_defaults
        };

        let data_dir = env("TEMPO_DATA_DIR")
            .or(fc.data_dir)
            .map_or_else(default_data_dir, PathBuf::from);

        let config = Self {
            data_dir,
            voice,
            assistant,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the voice pipeline cannot run with
    ///
    /// # Errors
    ///
    /// Returns error describing the first invalid setting
    pub fn validate(&self) -> Result<()> {
        if self.voice.wake_phrase.is_empty() {
            return Err(Error::Config("wake phrase must not be empty".to_string()));
        }
        if self.voice.frame_size == 0 {
            return Err(Error::Config("frame size must be positive".to_string()));
        }
        if self.voice.supervisor_tick.is_zero() {
            return Err(Error::Config("supervisor tick must be positive".to_string()));
        }
        if self.voice.supervisor_tick > self.voice.silence_timeout {
            return Err(Error::Config(
                "supervisor tick must not exceed the silence timeout".to_string(),
            ));
        }
        Ok(())
    }

    /// Path to the planner database
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("tempo.db")
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_file_or_env() {
        let config = Config::resolve(TempoConfigFile::default(), env_of(&[])).unwrap();
        assert_eq!(config.voice.wake_phrase, "hey tempo");
        assert_eq!(config.voice.frame_size, 4096);
        assert_eq!(config.voice.silence_timeout, Duration::from_secs(10));
        assert_eq!(config.assistant.input_sample_rate, 16_000);
        assert_eq!(config.assistant.output_sample_rate, 24_000);
        assert!(config.assistant.api_key.is_none());
    }

    #[test]
    fn env_overrides_file() {
        let fc = file::parse_config(
            r#"
            [voice]
            wake_phrase = "ok planner"
            silence_timeout_secs = 30
            "#,
        )
        .unwrap();
        let config = Config::resolve(
            fc,
            env_of(&[("TEMPO_WAKE_PHRASE", "  Hello Tempo "), ("OPENAI_API_KEY", "sk-1")]),
        )
        .unwrap();

        assert_eq!(config.voice.wake_phrase, "hello tempo");
        assert_eq!(config.voice.silence_timeout, Duration::from_secs(30));
        let key = config.assistant.api_key.unwrap();
        assert_eq!(key.expose_secret(), "sk-1");
    }

    #[test]
    fn zero_frame_size_is_rejected() {
        let fc = file::parse_config("[voice]\nframe_size = 0\n").unwrap();
        assert!(Config::resolve(fc, env_of(&[])).is_err());
    }

    #[test]
    fn tick_longer_than_timeout_is_rejected() {
        let fc = file::parse_config(
            "[voice]\nsilence_timeout_secs = 1\nsupervisor_tick_ms = 5000\n",
        )
        .unwrap();
        assert!(Config::resolve(fc, env_of(&[])).is_err());
    }
}
