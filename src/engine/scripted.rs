//! Scripted engines for demo mode and tests
//!
//! - [`TextRecognizer`] treats inbound "audio" as UTF-8 text; a trailing
//!   newline marks the end of an utterance
//! - [`ScriptedGenerator`] streams queued replies one character at a time
//! - [`EchoSynthesizer`] turns each text segment into its UTF-8 bytes

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;

use super::{
    EngineError, Exchange, Generator, PcmStream, Recognition, RecognitionStream, Recognizer,
    Synthesizer, TokenStream,
};

/// Recognizer that reads text straight out of the PCM payload
#[derive(Debug, Default)]
pub struct TextRecognizer;

impl TextRecognizer {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Recognizer for TextRecognizer {
    fn name(&self) -> &'static str {
        "text"
    }

    async fn open(&self) -> Result<Box<dyn RecognitionStream>, EngineError> {
        Ok(Box::new(TextRecognitionStream))
    }
}

struct TextRecognitionStream;

#[async_trait]
impl RecognitionStream for TextRecognitionStream {
    async fn feed(&mut self, pcm: &[u8]) -> Result<Option<Recognition>, EngineError> {
        let text = String::from_utf8_lossy(pcm);
        let (text, is_final) = match text.strip_suffix('\n') {
            Some(body) => (body.trim_end_matches('\r'), true),
            None => (text.as_ref(), false),
        };

        if text.is_empty() && !is_final {
            return Ok(None);
        }

        Ok(Some(Recognition {
            text: text.to_string(),
            is_final,
        }))
    }
}

enum Script {
    Reply(String),
    Fail(String),
}

#[derive(Default)]
struct GeneratorState {
    script: VecDeque<Script>,
    replies: Vec<String>,
    next_reply: usize,
    prompts: Vec<String>,
    history_lens: Vec<usize>,
}

/// Generator that replays configured replies
///
/// Queued scripts are consumed first; afterwards the configured replies are
/// served round-robin.
pub struct ScriptedGenerator {
    state: Mutex<GeneratorState>,
    char_delay: Duration,
}

impl ScriptedGenerator {
    #[must_use]
    pub fn new(replies: Vec<String>) -> Self {
        Self {
            state: Mutex::new(GeneratorState {
                replies,
                ..GeneratorState::default()
            }),
            char_delay: Duration::ZERO,
        }
    }

    /// Pause between streamed characters
    #[must_use]
    pub const fn with_char_delay(mut self, delay: Duration) -> Self {
        self.char_delay = delay;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GeneratorState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Serve `reply` on the next call, ahead of the configured replies
    pub fn push_reply(&self, reply: impl Into<String>) {
        self.lock().script.push_back(Script::Reply(reply.into()));
    }

    /// Fail the next call with `message`
    pub fn push_failure(&self, message: impl Into<String>) {
        self.lock().script.push_back(Script::Fail(message.into()));
    }

    /// Prompts received so far
    #[must_use]
    pub fn prompts(&self) -> Vec<String> {
        self.lock().prompts.clone()
    }

    /// History length seen by each call
    #[must_use]
    pub fn history_lens(&self) -> Vec<usize> {
        self.lock().history_lens.clone()
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn generate(&self, history: &[Exchange], prompt: &str) -> Result<TokenStream, EngineError> {
        let script = {
            let mut state = self.lock();
            state.prompts.push(prompt.to_string());
            state.history_lens.push(history.len());

            match state.script.pop_front() {
                Some(script) => script,
                None if state.replies.is_empty() => Script::Reply(String::new()),
                None => {
                    let i = state.next_reply % state.replies.len();
                    state.next_reply += 1;
                    Script::Reply(state.replies[i].clone())
                }
            }
        };

        let reply = match script {
            Script::Reply(reply) => reply,
            Script::Fail(message) => return Err(EngineError::Generation(message)),
        };

        tracing::debug!(prompt, reply = %reply, "scripted reply");

        let delay = self.char_delay;
        let chars: Vec<String> = reply.chars().map(String::from).collect();
        let stream = futures::stream::iter(chars).then(move |c| async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Ok(c)
        });

        Ok(stream.boxed())
    }
}

/// Synthesizer that emits the text's UTF-8 bytes as "PCM"
pub struct EchoSynthesizer {
    received: Mutex<Vec<String>>,
    chunk_bytes: usize,
    chunk_delay: Duration,
}

impl Default for EchoSynthesizer {
    fn default() -> Self {
        Self::new()
    }
}

impl EchoSynthesizer {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            received: Mutex::new(Vec::new()),
            chunk_bytes: usize::MAX,
            chunk_delay: Duration::ZERO,
        }
    }

    /// Split output into chunks of at most `bytes`, pausing `delay` before each
    #[must_use]
    pub const fn with_chunking(mut self, bytes: usize, delay: Duration) -> Self {
        self.chunk_bytes = if bytes == 0 { 1 } else { bytes };
        self.chunk_delay = delay;
        self
    }

    /// Text segments received so far
    #[must_use]
    pub fn received(&self) -> Vec<String> {
        self.received
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Synthesizer for EchoSynthesizer {
    fn name(&self) -> &'static str {
        "echo"
    }

    async fn synthesize(&self, text: &str) -> Result<PcmStream, EngineError> {
        self.received
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(text.to_string());

        let delay = self.chunk_delay;
        let chunks: Vec<Vec<u8>> = text
            .as_bytes()
            .chunks(self.chunk_bytes)
            .map(<[u8]>::to_vec)
            .collect();

        let stream = futures::stream::iter(chunks).then(move |chunk| async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Ok(chunk)
        });

        Ok(stream.boxed())
    }
}
