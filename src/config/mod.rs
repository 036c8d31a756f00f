//! Configuration management for the PetCar link
//!
//! Resolution order: built-in defaults, then the TOML overlay file, then
//! `PETCAR_*` environment variables. CLI flags are applied last by the binary.

pub mod file;

use std::path::Path;
use std::time::Duration;

use serde::Serialize;

use crate::{Error, Result};

/// Default system prompt for the pet-car assistant
pub const DEFAULT_SYSTEM_PROMPT: &str = "你是一个智能宠物小车 AI 助手，名叫 PetCar。\
你的任务是和用户进行语音交互，并执行简单的物理动作。你的回答应该简短、友好且直接。\
如果需要执行动作，请在回复中包含一个结构化指令，例如：`[ACTION:forward(5)]`。\
可用动作为：forward(steps), backward(steps), turn_left(degrees), turn_right(degrees), stop().";

/// PetCar link configuration
#[derive(Debug, Clone, Default, Serialize)]
pub struct Config {
    /// Session host configuration
    pub server: ServerConfig,

    /// Terminal connection configuration
    pub terminal: TerminalConfig,

    /// Conversation pipeline tuning
    pub pipeline: PipelineConfig,

    /// Engine backends
    pub engines: EngineConfig,
}

/// Session host configuration
#[derive(Debug, Clone, Serialize)]
pub struct ServerConfig {
    /// Bind address
    pub host: String,

    /// Listen port
    pub port: u16,

    /// Drop a session whose terminal sent nothing for this long
    pub idle_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8765,
            idle_timeout: Duration::from_secs(30),
        }
    }
}

/// Terminal connection configuration
#[derive(Debug, Clone, Serialize)]
pub struct TerminalConfig {
    /// WebSocket URL of the server
    pub server_url: String,

    /// Period between `ping` commands
    pub heartbeat_interval: Duration,

    /// Drop the connection when nothing arrives for this long
    pub watchdog_timeout: Duration,

    /// First reconnect delay (doubles per attempt)
    pub reconnect_base_delay: Duration,

    /// Reconnect delay cap
    pub reconnect_max_delay: Duration,

    /// Give up after this many consecutive failures; `None` retries forever
    pub max_reconnect_attempts: Option<u32>,

    /// Microphone chunk size in bytes
    pub chunk_bytes: usize,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:8765/ws".to_string(),
            heartbeat_interval: Duration::from_secs(5),
            watchdog_timeout: Duration::from_secs(15),
            reconnect_base_delay: Duration::from_millis(500),
            reconnect_max_delay: Duration::from_secs(30),
            max_reconnect_attempts: None,
            chunk_bytes: 1024,
        }
    }
}

/// Conversation pipeline tuning
#[derive(Debug, Clone, Serialize)]
pub struct PipelineConfig {
    /// Wake phrases
    pub wake_words: Vec<String>,

    /// Longest utterance after the wake phrase
    pub max_utterance: Duration,

    /// Outbound audio not drained for this long tears down the session
    pub stall_timeout: Duration,

    /// Longest wait for the first generated token
    pub generation_timeout: Duration,

    /// Exchanges kept in the rolling history
    pub history_turns: usize,

    /// Inbound audio queue capacity
    pub inbound_capacity: usize,

    /// Text queue capacity
    pub text_capacity: usize,

    /// Outbound audio queue capacity
    pub outbound_capacity: usize,

    /// Action marker prefix
    pub action_prefix: String,

    /// Longest partial action marker held back
    pub max_action_len: usize,

    /// Longest text segment sent to synthesis
    pub sentence_max_chars: usize,

    /// Terminal microphone sample rate
    pub input_sample_rate: u32,

    /// Synthesized audio sample rate
    pub output_sample_rate: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            wake_words: vec!["小车小车".to_string()],
            max_utterance: Duration::from_secs(5),
            stall_timeout: Duration::from_secs(10),
            generation_timeout: Duration::from_secs(30),
            history_turns: 8,
            inbound_capacity: 64,
            text_capacity: 32,
            outbound_capacity: 32,
            action_prefix: crate::action::DEFAULT_ACTION_PREFIX.to_string(),
            max_action_len: crate::action::DEFAULT_MAX_PENDING,
            sentence_max_chars: 120,
            input_sample_rate: crate::voice::INPUT_SAMPLE_RATE,
            output_sample_rate: crate::voice::OUTPUT_SAMPLE_RATE,
        }
    }
}

/// Which engine backends to use
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// In-process scripted engines (demo mode, tests)
    #[default]
    Scripted,
    /// OpenAI-compatible HTTP endpoints
    Http,
}

impl std::str::FromStr for EngineKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "scripted" => Ok(Self::Scripted),
            "http" => Ok(Self::Http),
            other => Err(Error::Config(format!("unknown engine kind: {other}"))),
        }
    }
}

/// Engine backend configuration
#[derive(Debug, Clone, Serialize)]
pub struct EngineConfig {
    /// Backend kind
    pub kind: EngineKind,

    /// Base URL of the OpenAI-compatible API
    pub base_url: String,

    /// API key (never printed)
    #[serde(skip_serializing)]
    pub api_key: Option<String>,

    /// Chat completion model
    pub chat_model: String,

    /// Transcription model
    pub stt_model: String,

    /// Speech model
    pub tts_model: String,

    /// Speech voice
    pub voice: String,

    /// Transcription language hint
    pub language: Option<String>,

    /// System prompt for generation
    pub system_prompt: String,

    /// Replies served by the scripted generator, in order
    pub scripted_replies: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kind: EngineKind::Scripted,
            base_url: "http://127.0.0.1:8000/v1".to_string(),
            api_key: None,
            chat_model: "qwen3-1.7b".to_string(),
            stt_model: "sensevoice-small".to_string(),
            tts_model: "cosyvoice-300m".to_string(),
            voice: "petcar_default_role".to_string(),
            language: Some("zh".to_string()),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            scripted_replies: vec!["好的，我这就向前走五步。[ACTION:forward(5)]".to_string()],
        }
    }
}

impl Config {
    /// Load configuration from the standard file and the process environment
    ///
    /// # Errors
    ///
    /// Returns error if a value is invalid
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration, reading `path` instead of the standard file
    ///
    /// # Errors
    ///
    /// Returns error if an explicit file cannot be read or a value is invalid
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let fc = match path {
            Some(path) => file::read_config_file(path)?,
            None => file::load_config_file(),
        };

        let mut config = Self::from_file(fc)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay a parsed config file on the defaults
    ///
    /// # Errors
    ///
    /// Returns error if the engine kind is unknown
    pub fn from_file(fc: file::PetcarConfigFile) -> Result<Self> {
        let mut config = Self::default();

        let s = fc.server;
        if let Some(host) = s.host {
            config.server.host = host;
        }
        if let Some(port) = s.port {
            config.server.port = port;
        }
        if let Some(secs) = s.idle_timeout_secs {
            config.server.idle_timeout = Duration::from_secs(secs);
        }

        let t = fc.terminal;
        let term = &mut config.terminal;
        if let Some(url) = t.server_url {
            term.server_url = url;
        }
        set_millis(&mut term.heartbeat_interval, t.heartbeat_interval_ms);
        set_millis(&mut term.watchdog_timeout, t.watchdog_timeout_ms);
        set_millis(&mut term.reconnect_base_delay, t.reconnect_base_delay_ms);
        set_millis(&mut term.reconnect_max_delay, t.reconnect_max_delay_ms);
        if t.max_reconnect_attempts.is_some() {
            term.max_reconnect_attempts = t.max_reconnect_attempts;
        }
        if let Some(n) = t.chunk_bytes {
            term.chunk_bytes = n;
        }

        let p = fc.pipeline;
        let pipe = &mut config.pipeline;
        if let Some(words) = p.wake_words {
            pipe.wake_words = words;
        }
        set_millis(&mut pipe.max_utterance, p.max_utterance_ms);
        set_millis(&mut pipe.stall_timeout, p.stall_timeout_ms);
        set_millis(&mut pipe.generation_timeout, p.generation_timeout_ms);
        if let Some(n) = p.history_turns {
            pipe.history_turns = n;
        }
        if let Some(n) = p.inbound_capacity {
            pipe.inbound_capacity = n;
        }
        if let Some(n) = p.text_capacity {
            pipe.text_capacity = n;
        }
        if let Some(n) = p.outbound_capacity {
            pipe.outbound_capacity = n;
        }
        if let Some(prefix) = p.action_prefix {
            pipe.action_prefix = prefix;
        }
        if let Some(n) = p.max_action_len {
            pipe.max_action_len = n;
        }
        if let Some(n) = p.sentence_max_chars {
            pipe.sentence_max_chars = n;
        }

        let e = fc.engines;
        let eng = &mut config.engines;
        if let Some(kind) = e.kind {
            eng.kind = kind.parse()?;
        }
        if let Some(url) = e.base_url {
            eng.base_url = url;
        }
        if e.api_key.is_some() {
            eng.api_key = e.api_key;
        }
        if let Some(model) = e.chat_model {
            eng.chat_model = model;
        }
        if let Some(model) = e.stt_model {
            eng.stt_model = model;
        }
        if let Some(model) = e.tts_model {
            eng.tts_model = model;
        }
        if let Some(voice) = e.voice {
            eng.voice = voice;
        }
        if e.language.is_some() {
            eng.language = e.language;
        }
        if let Some(prompt) = e.system_prompt {
            eng.system_prompt = prompt;
        }
        if let Some(replies) = e.scripted_replies {
            eng.scripted_replies = replies;
        }

        Ok(config)
    }

    /// Apply `PETCAR_*` overrides using `lookup` to read variables
    ///
    /// # Errors
    ///
    /// Returns error if a variable holds an unparseable value
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("PETCAR_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("PETCAR_PORT") {
            self.server.port = parse_env("PETCAR_PORT", &port)?;
        }
        if let Some(url) = lookup("PETCAR_SERVER_URL") {
            self.terminal.server_url = url;
        }
        if let Some(words) = lookup("PETCAR_WAKE_WORDS") {
            self.pipeline.wake_words = words.split(',').map(str::to_string).collect();
        }
        if let Some(ms) = lookup("PETCAR_MAX_UTTERANCE_MS") {
            self.pipeline.max_utterance =
                Duration::from_millis(parse_env("PETCAR_MAX_UTTERANCE_MS", &ms)?);
        }
        if let Some(kind) = lookup("PETCAR_ENGINE") {
            self.engines.kind = kind.parse()?;
        }
        if let Some(url) = lookup("PETCAR_ENGINE_URL") {
            self.engines.base_url = url;
        }
        if let Some(key) = lookup("PETCAR_API_KEY").or_else(|| lookup("OPENAI_API_KEY")) {
            self.engines.api_key = Some(key);
        }
        if let Some(model) = lookup("PETCAR_CHAT_MODEL") {
            self.engines.chat_model = model;
        }
        if let Some(model) = lookup("PETCAR_STT_MODEL") {
            self.engines.stt_model = model;
        }
        if let Some(model) = lookup("PETCAR_TTS_MODEL") {
            self.engines.tts_model = model;
        }
        if let Some(voice) = lookup("PETCAR_VOICE") {
            self.engines.voice = voice;
        }
        Ok(())
    }

    /// Check for values the pipeline cannot run with
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` describing the first invalid value
    pub fn validate(&self) -> Result<()> {
        let p = &self.pipeline;
        if p.wake_words.iter().all(|w| w.trim().is_empty()) {
            return Err(Error::Config("wake_words must contain a phrase".to_string()));
        }

        let capacities = [
            ("inbound_capacity", p.inbound_capacity),
            ("text_capacity", p.text_capacity),
            ("outbound_capacity", p.outbound_capacity),
            ("history_turns", p.history_turns),
            ("sentence_max_chars", p.sentence_max_chars),
            ("chunk_bytes", self.terminal.chunk_bytes),
        ];
        if let Some((name, _)) = capacities.iter().find(|(_, n)| *n == 0) {
            return Err(Error::Config(format!("{name} must be greater than zero")));
        }

        let durations = [
            ("max_utterance", p.max_utterance),
            ("stall_timeout", p.stall_timeout),
            ("generation_timeout", p.generation_timeout),
            ("idle_timeout", self.server.idle_timeout),
            ("heartbeat_interval", self.terminal.heartbeat_interval),
            ("watchdog_timeout", self.terminal.watchdog_timeout),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, d)| d.is_zero()) {
            return Err(Error::Config(format!("{name} must be greater than zero")));
        }

        if self.terminal.watchdog_timeout <= self.terminal.heartbeat_interval {
            return Err(Error::Config(
                "watchdog_timeout must exceed heartbeat_interval".to_string(),
            ));
        }

        if p.action_prefix.is_empty() {
            return Err(Error::Config("action_prefix must not be empty".to_string()));
        }

        if self.engines.kind == EngineKind::Http && self.engines.base_url.is_empty() {
            return Err(Error::Config(
                "engines.base_url is required for http engines".to_string(),
            ));
        }

        Ok(())
    }
}

fn set_millis(target: &mut Duration, value: Option<u64>) {
    if let Some(ms) = value {
        *target = Duration::from_millis(ms);
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("invalid value for {key}: {value}")))
}
