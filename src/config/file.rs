//! TOML configuration file loading
//!
//! Supports `~/.config/petcar/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::Result;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct PetcarConfigFile {
    /// Server (session host) configuration
    #[serde(default)]
    pub server: ServerFileConfig,

    /// Terminal connection configuration
    #[serde(default)]
    pub terminal: TerminalFileConfig,

    /// Conversation pipeline tuning
    #[serde(default)]
    pub pipeline: PipelineFileConfig,

    /// Engine backend selection
    #[serde(default)]
    pub engines: EnginesFileConfig,
}

/// Server configuration
#[derive(Debug, Default, Deserialize)]
pub struct ServerFileConfig {
    /// Bind address (e.g. "0.0.0.0")
    pub host: Option<String>,

    /// Listen port
    pub port: Option<u16>,

    /// Seconds of terminal silence before a session is dropped
    pub idle_timeout_secs: Option<u64>,
}

/// Terminal configuration
#[derive(Debug, Default, Deserialize)]
pub struct TerminalFileConfig {
    /// WebSocket URL of the server (e.g. `ws://192.168.1.100:8765/ws`)
    pub server_url: Option<String>,

    /// Heartbeat period in milliseconds
    pub heartbeat_interval_ms: Option<u64>,

    /// Drop the connection after this long without inbound frames
    pub watchdog_timeout_ms: Option<u64>,

    /// First reconnect delay in milliseconds
    pub reconnect_base_delay_ms: Option<u64>,

    /// Reconnect delay cap in milliseconds
    pub reconnect_max_delay_ms: Option<u64>,

    /// Give up after this many consecutive failed attempts
    pub max_reconnect_attempts: Option<u32>,

    /// Microphone chunk size in bytes
    pub chunk_bytes: Option<usize>,
}

/// Pipeline configuration
#[derive(Debug, Default, Deserialize)]
pub struct PipelineFileConfig {
    /// Wake phrases (e.g. ["小车小车"])
    pub wake_words: Option<Vec<String>>,

    /// Longest utterance after the wake phrase, in milliseconds
    pub max_utterance_ms: Option<u64>,

    /// Outbound audio stall timeout in milliseconds
    pub stall_timeout_ms: Option<u64>,

    /// Wait for the first generated token, in milliseconds
    pub generation_timeout_ms: Option<u64>,

    /// Exchanges kept in the rolling history
    pub history_turns: Option<usize>,

    /// Inbound audio queue capacity (chunks)
    pub inbound_capacity: Option<usize>,

    /// Text queue capacity (chunks)
    pub text_capacity: Option<usize>,

    /// Outbound audio queue capacity (chunks)
    pub outbound_capacity: Option<usize>,

    /// Action marker prefix (e.g. "[ACTION:")
    pub action_prefix: Option<String>,

    /// Longest partial action marker held back
    pub max_action_len: Option<usize>,

    /// Longest text segment sent to synthesis
    pub sentence_max_chars: Option<usize>,
}

/// Engine configuration
#[derive(Debug, Default, Deserialize)]
pub struct EnginesFileConfig {
    /// "scripted" or "http"
    pub kind: Option<String>,

    /// Base URL of an OpenAI-compatible API (e.g. `http://localhost:8000/v1`)
    pub base_url: Option<String>,

    /// API key for the engine endpoints
    pub api_key: Option<String>,

    /// Chat completion model
    pub chat_model: Option<String>,

    /// Transcription model
    pub stt_model: Option<String>,

    /// Speech model
    pub tts_model: Option<String>,

    /// Speech voice
    pub voice: Option<String>,

    /// Language hint for transcription (e.g. "zh")
    pub language: Option<String>,

    /// System prompt override
    pub system_prompt: Option<String>,

    /// Replies for the scripted generator
    pub scripted_replies: Option<Vec<String>>,
}

/// Load the TOML config file from the standard path
///
/// Returns `PetcarConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> PetcarConfigFile {
    let Some(path) = config_file_path() else {
        return PetcarConfigFile::default();
    };

    if !path.exists() {
        return PetcarConfigFile::default();
    }

    match read_config_file(&path) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to load config file, using defaults"
            );
            PetcarConfigFile::default()
        }
    }
}

/// Read and parse an explicit config file
///
/// # Errors
///
/// Returns error if the file cannot be read or is not valid TOML
pub fn read_config_file(path: &Path) -> Result<PetcarConfigFile> {
    let content = std::fs::read_to_string(path)?;
    let config = toml::from_str(&content)?;
    tracing::info!(path = %path.display(), "loaded config file");
    Ok(config)
}

/// Return the config file path: `~/.config/petcar/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("petcar").join("config.toml"))
}
