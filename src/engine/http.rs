//! OpenAI-compatible HTTP engine adapters
//!
//! - generation: `POST {base}/chat/completions` with `stream: true` (SSE)
//! - synthesis: `POST {base}/audio/speech` with `response_format: "pcm"`
//! - recognition: `POST {base}/audio/transcriptions`, fed one utterance at a
//!   time by an energy-based segmenter

use std::fmt::Display;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt, future};
use serde::{Deserialize, Serialize};

use super::{
    EngineError, Exchange, Generator, PcmStream, Recognition, RecognitionStream, Recognizer,
    Synthesizer, TokenStream,
};
use crate::config::EngineConfig;
use crate::voice::{INPUT_SAMPLE_RATE, SpeechSegmenter, pcm_to_samples, samples_to_wav};

fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}/{path}", base_url.trim_end_matches('/'))
}

fn authorize(request: reqwest::RequestBuilder, api_key: Option<&str>) -> reqwest::RequestBuilder {
    match api_key {
        Some(key) => request.bearer_auth(key),
        None => request,
    }
}

/// Payload of one server-sent event from a streaming chat completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    /// Content delta
    Delta(String),
    /// `[DONE]`
    Done,
    /// Event without content, e.g. the role-only first chunk
    Skip,
}

#[derive(Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    #[serde(default)]
    delta: ChatDelta,
}

#[derive(Default, Deserialize)]
struct ChatDelta {
    content: Option<String>,
}

/// Decode the `data` of one chat completion event
///
/// # Errors
///
/// Returns error if the data is neither `[DONE]` nor a valid chunk
pub fn parse_chat_event(data: &str) -> Result<ChatEvent, EngineError> {
    let data = data.trim();
    if data.is_empty() {
        return Ok(ChatEvent::Skip);
    }
    if data == "[DONE]" {
        return Ok(ChatEvent::Done);
    }

    let chunk: ChatChunk = serde_json::from_str(data)
        .map_err(|e| EngineError::Generation(format!("bad stream chunk: {e}")))?;

    let content: String = chunk
        .choices
        .into_iter()
        .filter_map(|c| c.delta.content)
        .collect();

    if content.is_empty() {
        Ok(ChatEvent::Skip)
    } else {
        Ok(ChatEvent::Delta(content))
    }
}

/// Content deltas of an SSE body; ends at `[DONE]` or after the first error
#[must_use]
pub fn chat_tokens<S, B, E>(body: S) -> TokenStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    body.eventsource()
        .scan(false, |finished, event| {
            if *finished {
                return future::ready(None);
            }
            let item = match event {
                Ok(event) => parse_chat_event(&event.data),
                Err(e) => Err(EngineError::Generation(e.to_string())),
            };
            *finished = !matches!(item, Ok(ChatEvent::Delta(_) | ChatEvent::Skip));
            future::ready(match item {
                Ok(ChatEvent::Done) => None,
                other => Some(other),
            })
        })
        .filter_map(|item| {
            future::ready(match item {
                Ok(ChatEvent::Delta(text)) => Some(Ok(text)),
                Ok(ChatEvent::Done | ChatEvent::Skip) => None,
                Err(e) => Some(Err(e)),
            })
        })
        .boxed()
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
}

/// Streaming chat completions
pub struct HttpGenerator {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    model: String,
    system_prompt: String,
}

impl HttpGenerator {
    #[must_use]
    pub fn new(client: reqwest::Client, config: &EngineConfig) -> Self {
        Self {
            client,
            url: endpoint(&config.base_url, "chat/completions"),
            api_key: config.api_key.clone(),
            model: config.chat_model.clone(),
            system_prompt: config.system_prompt.clone(),
        }
    }
}

#[async_trait]
impl Generator for HttpGenerator {
    fn name(&self) -> &'static str {
        "http-chat"
    }

    async fn generate(&self, history: &[Exchange], prompt: &str) -> Result<TokenStream, EngineError> {
        let mut messages = Vec::with_capacity(history.len() * 2 + 2);
        messages.push(ChatMessage {
            role: "system",
            content: &self.system_prompt,
        });
        for exchange in history {
            messages.push(ChatMessage {
                role: "user",
                content: &exchange.user,
            });
            messages.push(ChatMessage {
                role: "assistant",
                content: &exchange.assistant,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: prompt,
        });

        let request = ChatRequest {
            model: &self.model,
            messages,
            stream: true,
        };

        tracing::debug!(model = %self.model, history = history.len(), "starting chat stream");

        let response = authorize(self.client.post(&self.url), self.api_key.as_deref())
            .json(&request)
            .send()
            .await
            .map_err(|e| EngineError::Generation(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "chat API error");
            return Err(EngineError::Generation(format!("chat API error {status}: {body}")));
        }

        Ok(chat_tokens(response.bytes_stream()))
    }
}

#[derive(Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'static str,
}

/// Streaming PCM speech synthesis
pub struct HttpSynthesizer {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    model: String,
    voice: String,
}

impl HttpSynthesizer {
    #[must_use]
    pub fn new(client: reqwest::Client, config: &EngineConfig) -> Self {
        Self {
            client,
            url: endpoint(&config.base_url, "audio/speech"),
            api_key: config.api_key.clone(),
            model: config.tts_model.clone(),
            voice: config.voice.clone(),
        }
    }
}

#[async_trait]
impl Synthesizer for HttpSynthesizer {
    fn name(&self) -> &'static str {
        "http-speech"
    }

    async fn synthesize(&self, text: &str) -> Result<PcmStream, EngineError> {
        let request = SpeechRequest {
            model: &self.model,
            input: text,
            voice: &self.voice,
            response_format: "pcm",
        };

        let response = authorize(self.client.post(&self.url), self.api_key.as_deref())
            .json(&request)
            .send()
            .await
            .map_err(|e| EngineError::Synthesis(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "speech API error");
            return Err(EngineError::Synthesis(format!("speech API error {status}: {body}")));
        }

        // Keep chunks sample-aligned; an odd trailing byte waits for the next chunk
        let stream = response
            .bytes_stream()
            .scan(None::<u8>, |carry, chunk| {
                let item = chunk
                    .map(|bytes| {
                        let mut pcm = Vec::with_capacity(bytes.len() + 1);
                        pcm.extend(carry.take());
                        pcm.extend_from_slice(&bytes);
                        if pcm.len() % 2 == 1 {
                            *carry = pcm.pop();
                        }
                        pcm
                    })
                    .map_err(|e| EngineError::Synthesis(e.to_string()));
                futures::future::ready(Some(item))
            })
            .filter(|item| futures::future::ready(!matches!(item, Ok(pcm) if pcm.is_empty())));

        Ok(stream.boxed())
    }
}

#[derive(Deserialize)]
struct TranscriptionResponse {
    text: String,
}

/// Batch transcription behind an utterance segmenter
pub struct HttpRecognizer {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    model: String,
    language: Option<String>,
}

impl HttpRecognizer {
    #[must_use]
    pub fn new(client: reqwest::Client, config: &EngineConfig) -> Self {
        Self {
            client,
            url: endpoint(&config.base_url, "audio/transcriptions"),
            api_key: config.api_key.clone(),
            model: config.stt_model.clone(),
            language: config.language.clone(),
        }
    }
}

#[async_trait]
impl Recognizer for HttpRecognizer {
    fn name(&self) -> &'static str {
        "http-transcription"
    }

    async fn open(&self) -> Result<Box<dyn RecognitionStream>, EngineError> {
        Ok(Box::new(HttpRecognitionStream {
            client: self.client.clone(),
            url: self.url.clone(),
            api_key: self.api_key.clone(),
            model: self.model.clone(),
            language: self.language.clone(),
            segmenter: SpeechSegmenter::default(),
            carry: None,
        }))
    }
}

struct HttpRecognitionStream {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    model: String,
    language: Option<String>,
    segmenter: SpeechSegmenter,
    carry: Option<u8>,
}

impl HttpRecognitionStream {
    async fn transcribe(&self, samples: &[i16]) -> Result<String, EngineError> {
        let wav = samples_to_wav(samples, INPUT_SAMPLE_RATE)
            .map_err(|e| EngineError::Recognition(e.to_string()))?;

        tracing::debug!(audio_bytes = wav.len(), "starting transcription");

        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("utterance.wav")
            .mime_str("audio/wav")
            .map_err(|e| EngineError::Recognition(e.to_string()))?;
        let mut form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone());
        if let Some(language) = &self.language {
            form = form.text("language", language.clone());
        }

        let response = authorize(self.client.post(&self.url), self.api_key.as_deref())
            .multipart(form)
            .send()
            .await
            .map_err(|e| EngineError::Recognition(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "transcription API error");
            return Err(EngineError::Recognition(format!(
                "transcription API error {status}: {body}"
            )));
        }

        let result: TranscriptionResponse = response
            .json()
            .await
            .map_err(|e| EngineError::Recognition(e.to_string()))?;

        tracing::info!(transcript = %result.text, "transcription complete");
        Ok(result.text)
    }
}

#[async_trait]
impl RecognitionStream for HttpRecognitionStream {
    async fn feed(&mut self, pcm: &[u8]) -> Result<Option<Recognition>, EngineError> {
        let mut bytes = Vec::with_capacity(pcm.len() + 1);
        bytes.extend(self.carry.take());
        bytes.extend_from_slice(pcm);
        if bytes.len() % 2 == 1 {
            self.carry = bytes.pop();
        }

        let Some(segment) = self.segmenter.push(&pcm_to_samples(&bytes)) else {
            return Ok(None);
        };

        let text = self.transcribe(&segment).await?;
        Ok(Some(Recognition::final_text(text.trim())))
    }
}
