//! Streaming engine adapters
//!
//! Recognition, generation and synthesis are black-box stream transformers.
//! The conversation controller only sees these traits; backends are either
//! scripted (demo mode, tests) or OpenAI-compatible HTTP endpoints.

mod http;
mod scripted;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use http::{
    ChatEvent, HttpGenerator, HttpRecognizer, HttpSynthesizer, chat_tokens, parse_chat_event,
};
pub use scripted::{EchoSynthesizer, ScriptedGenerator, TextRecognizer};

use crate::config::{EngineConfig, EngineKind};
use crate::Result;

/// Lazy token sequence from a generator
pub type TokenStream = BoxStream<'static, std::result::Result<String, EngineError>>;

/// Lazy PCM sequence from a synthesizer
pub type PcmStream = BoxStream<'static, std::result::Result<Vec<u8>, EngineError>>;

/// Engine failure; aborts the current turn only
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("recognition failed: {0}")]
    Recognition(String),

    #[error("generation failed: {0}")]
    Generation(String),

    #[error("synthesis failed: {0}")]
    Synthesis(String),

    /// No output within the allowed time
    #[error("{stage} timed out")]
    Timeout { stage: &'static str },
}

impl EngineError {
    /// Short code sent in control-channel error notices
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Recognition(_) => "recognition_failed",
            Self::Generation(_) => "generation_failed",
            Self::Synthesis(_) => "synthesis_failed",
            Self::Timeout { .. } => "engine_timeout",
        }
    }
}

/// Incremental recognition output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recognition {
    /// Text recognized since the previous result
    pub text: String,
    /// End of utterance
    pub is_final: bool,
}

impl Recognition {
    #[must_use]
    pub fn partial(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: false,
        }
    }

    #[must_use]
    pub fn final_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: true,
        }
    }
}

/// One completed user/assistant exchange in the rolling history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exchange {
    pub user: String,
    pub assistant: String,
}

/// Speech recognition backend
#[async_trait]
pub trait Recognizer: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &'static str;

    /// Open a recognition stream for one session
    ///
    /// # Errors
    ///
    /// Returns error if the backend cannot start a stream
    async fn open(&self) -> std::result::Result<Box<dyn RecognitionStream>, EngineError>;
}

/// Per-session recognition state
#[async_trait]
pub trait RecognitionStream: Send {
    /// Feed one PCM chunk; returns text when the backend produced any
    ///
    /// # Errors
    ///
    /// Returns error if recognition fails
    async fn feed(&mut self, pcm: &[u8]) -> std::result::Result<Option<Recognition>, EngineError>;
}

/// Conversational language backend
#[async_trait]
pub trait Generator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Start generating a reply to `prompt`, seeded with `history`
    ///
    /// The returned stream is finite. Dropping it stops generation.
    ///
    /// # Errors
    ///
    /// Returns error if the request cannot be started
    async fn generate(
        &self,
        history: &[Exchange],
        prompt: &str,
    ) -> std::result::Result<TokenStream, EngineError>;
}

/// Speech synthesis backend
#[async_trait]
pub trait Synthesizer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Synthesize one text segment into a finite PCM stream
    ///
    /// # Errors
    ///
    /// Returns error if the request cannot be started
    async fn synthesize(&self, text: &str) -> std::result::Result<PcmStream, EngineError>;
}

/// The three engines a session runs against
#[derive(Clone)]
pub struct Engines {
    pub recognizer: Arc<dyn Recognizer>,
    pub generator: Arc<dyn Generator>,
    pub synthesizer: Arc<dyn Synthesizer>,
}

impl Engines {
    #[must_use]
    pub fn new(
        recognizer: Arc<dyn Recognizer>,
        generator: Arc<dyn Generator>,
        synthesizer: Arc<dyn Synthesizer>,
    ) -> Self {
        Self {
            recognizer,
            generator,
            synthesizer,
        }
    }

    /// Build the configured backends
    ///
    /// # Errors
    ///
    /// Returns error if an HTTP client cannot be constructed
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let engines = match config.kind {
            EngineKind::Scripted => Self::new(
                Arc::new(TextRecognizer::new()),
                Arc::new(ScriptedGenerator::new(config.scripted_replies.clone())),
                Arc::new(EchoSynthesizer::new()),
            ),
            EngineKind::Http => {
                let client = reqwest::Client::builder().build()?;
                Self::new(
                    Arc::new(HttpRecognizer::new(client.clone(), config)),
                    Arc::new(HttpGenerator::new(client.clone(), config)),
                    Arc::new(HttpSynthesizer::new(client, config)),
                )
            }
        };

        tracing::info!(
            recognizer = engines.recognizer.name(),
            generator = engines.generator.name(),
            synthesizer = engines.synthesizer.name(),
            "engines ready"
        );

        Ok(engines)
    }
}

impl std::fmt::Debug for Engines {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engines")
            .field("recognizer", &self.recognizer.name())
            .field("generator", &self.generator.name())
            .field("synthesizer", &self.synthesizer.name())
            .finish()
    }
}
