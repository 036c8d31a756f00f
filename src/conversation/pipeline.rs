//! Streaming stages of a session
//!
//! Recognition runs for the whole session. Generation and synthesis run once
//! per turn and race their whole body against the turn's cancellation token,
//! so cancelling drops every in-flight engine stream and queue wait at once.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::segment::SentenceSplitter;
use super::turn::TurnId;
use super::SessionConfig;
use crate::action::{ActionCommand, ActionExtractor};
use crate::engine::{EngineError, Exchange, Generator, Recognition, RecognitionStream, Recognizer, Synthesizer};
use crate::protocol::DecodeError;
use crate::queue::{BoundedQueue, OverflowPolicy, QueueError};
use crate::{Error, Result};

/// Clean reply text on its way to synthesis
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextItem {
    Chunk { turn: TurnId, text: String },
    /// Generation finished; flush the remaining segment
    End { turn: TurnId },
}

/// Synthesized PCM waiting for the frame writer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundAudio {
    pub turn: TurnId,
    pub pcm: Vec<u8>,
}

/// The three bounded queues owned by one session
#[derive(Debug)]
pub struct SessionQueues {
    /// Terminal microphone audio; drops the oldest chunk on overflow
    pub inbound: BoundedQueue<Vec<u8>>,
    /// Clean reply text; blocks the generator on overflow
    pub text: BoundedQueue<TextItem>,
    /// Synthesized audio; blocks synthesis up to the stall timeout
    pub outbound: BoundedQueue<OutboundAudio>,
}

impl SessionQueues {
    #[must_use]
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            inbound: BoundedQueue::new(config.inbound_capacity, OverflowPolicy::DropOldest),
            text: BoundedQueue::new(config.text_capacity, OverflowPolicy::Block),
            outbound: BoundedQueue::new(
                config.outbound_capacity,
                OverflowPolicy::BlockFor(config.stall_timeout),
            ),
        }
    }

    /// Close every queue, waking all blocked producers and consumers
    pub fn close_all(&self) {
        self.inbound.close();
        self.text.close();
        self.outbound.close();
    }
}

/// Everything the controller reacts to
#[derive(Debug)]
pub enum Event {
    /// First inbound audio was consumed
    AudioActive,
    Recognized(Recognition),
    RecognitionFailed(EngineError),
    /// First synthesized audio of the turn is queued
    Speaking(TurnId),
    /// Generation finished with the clean reply and its actions
    Generated {
        turn: TurnId,
        reply: String,
        actions: Vec<ActionCommand>,
    },
    /// Synthesis finished every segment of the turn
    Synthesized(TurnId),
    TurnFailed { turn: TurnId, error: EngineError },
    /// Outbound audio was not drained within the stall timeout
    Stalled { turn: TurnId, after: Duration },
    /// Terminal asked to close the session
    StopRequested,
    /// Transport closed, failed or went idle
    Disconnected(String),
    /// Fatal frame from the terminal
    ProtocolViolation(DecodeError),
}

pub type EventSender = mpsc::UnboundedSender<Event>;

/// Feed inbound audio to the recognizer until the queue closes
pub async fn run_recognition(
    session_id: Uuid,
    recognizer: Arc<dyn Recognizer>,
    queues: Arc<SessionQueues>,
    events: EventSender,
    shutdown: CancellationToken,
) {
    tokio::select! {
        () = shutdown.cancelled() => {}
        () = recognize(session_id, recognizer.as_ref(), &queues, &events) => {}
    }
    tracing::debug!(session_id = %session_id, "recognition stopped");
}

async fn recognize(
    session_id: Uuid,
    recognizer: &dyn Recognizer,
    queues: &SessionQueues,
    events: &EventSender,
) {
    let mut stream: Option<Box<dyn RecognitionStream>> = None;
    let mut active = false;

    while let Ok(chunk) = queues.inbound.pop().await {
        if !active {
            active = true;
            if events.send(Event::AudioActive).is_err() {
                return;
            }
        }

        if stream.is_none() {
            match recognizer.open().await {
                Ok(opened) => stream = Some(opened),
                Err(e) => {
                    tracing::warn!(session_id = %session_id, error = %e, "failed to open recognition stream");
                    if events.send(Event::RecognitionFailed(e)).is_err() {
                        return;
                    }
                    continue;
                }
            }
        }

        let Some(active_stream) = stream.as_mut() else {
            continue;
        };

        let event = match active_stream.feed(&chunk).await {
            Ok(Some(recognition)) => Event::Recognized(recognition),
            Ok(None) => continue,
            Err(e) => Event::RecognitionFailed(e),
        };

        if events.send(event).is_err() {
            return;
        }
    }
}

/// Stream one reply from the generator into the text queue
pub struct GenerationJob {
    pub session_id: Uuid,
    pub turn: TurnId,
    pub token: CancellationToken,
    pub generator: Arc<dyn Generator>,
    pub history: Vec<Exchange>,
    pub prompt: String,
    pub extractor: ActionExtractor,
    pub first_token_timeout: Duration,
    pub queues: Arc<SessionQueues>,
    pub events: EventSender,
}

impl GenerationJob {
    #[must_use]
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let token = self.token.clone();
        let result = tokio::select! {
            () = token.cancelled() => {
                tracing::debug!(session_id = %self.session_id, turn_id = %self.turn, "generation cancelled");
                return;
            }
            result = self.stream_reply() => result,
        };

        let event = match result {
            Ok((reply, actions)) => Event::Generated {
                turn: self.turn,
                reply,
                actions,
            },
            Err(e) => match stage_failure(self.turn, e) {
                Some(event) => event,
                None => return,
            },
        };
        let _ = self.events.send(event);
    }

    async fn stream_reply(&mut self) -> Result<(String, Vec<ActionCommand>)> {
        let mut tokens = self.generator.generate(&self.history, &self.prompt).await?;

        let mut reply = String::new();
        let mut actions = Vec::new();
        let mut first = true;

        loop {
            let next = if first {
                first = false;
                tokio::time::timeout(self.first_token_timeout, tokens.next())
                    .await
                    .map_err(|_| EngineError::Timeout {
                        stage: "generation",
                    })?
            } else {
                tokens.next().await
            };

            let Some(token) = next else {
                break;
            };

            let extracted = self.extractor.feed(&token?);
            for action in &extracted.actions {
                tracing::info!(session_id = %self.session_id, turn_id = %self.turn, action = %action, "action extracted");
            }
            actions.extend(extracted.actions);
            self.emit(&mut reply, extracted.clean).await?;
        }

        let rest = self.extractor.finish();
        self.emit(&mut reply, rest).await?;
        self.queues.text.push(TextItem::End { turn: self.turn }).await?;

        tracing::debug!(session_id = %self.session_id, turn_id = %self.turn, chars = reply.chars().count(), "generation finished");
        Ok((reply, actions))
    }

    async fn emit(&self, reply: &mut String, clean: String) -> Result<()> {
        if clean.is_empty() {
            return Ok(());
        }
        reply.push_str(&clean);
        self.queues
            .text
            .push(TextItem::Chunk {
                turn: self.turn,
                text: clean,
            })
            .await?;
        Ok(())
    }
}

/// Turn queued reply text into outbound audio, segment by segment
pub struct SynthesisJob {
    pub session_id: Uuid,
    pub turn: TurnId,
    pub token: CancellationToken,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub splitter: SentenceSplitter,
    pub queues: Arc<SessionQueues>,
    pub events: EventSender,
}

impl SynthesisJob {
    #[must_use]
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let token = self.token.clone();
        let result = tokio::select! {
            () = token.cancelled() => {
                tracing::debug!(session_id = %self.session_id, turn_id = %self.turn, "synthesis cancelled");
                return;
            }
            result = self.speak() => result,
        };

        let event = match result {
            Ok(()) => Event::Synthesized(self.turn),
            Err(e) => match stage_failure(self.turn, e) {
                Some(event) => event,
                None => return,
            },
        };
        let _ = self.events.send(event);
    }

    async fn speak(&mut self) -> Result<()> {
        let mut speaking = false;

        loop {
            match self.queues.text.pop().await? {
                TextItem::Chunk { turn, text } if turn == self.turn => {
                    for segment in self.splitter.push(&text) {
                        self.synthesize(&segment, &mut speaking).await?;
                    }
                }
                TextItem::End { turn } if turn == self.turn => {
                    if let Some(segment) = self.splitter.flush() {
                        self.synthesize(&segment, &mut speaking).await?;
                    }
                    return self.flushed().await;
                }
                stale => {
                    tracing::trace!(turn_id = %self.turn, item = ?stale, "skipping text from another turn");
                }
            }
        }
    }

    /// Wait for the frame writer to take the turn's last audio
    async fn flushed(&self) -> Result<()> {
        let outbound = &self.queues.outbound;
        match outbound.policy() {
            OverflowPolicy::BlockFor(limit) => tokio::time::timeout(limit, outbound.wait_empty())
                .await
                .map_err(|_| QueueError::Stalled(limit).into()),
            OverflowPolicy::Block | OverflowPolicy::DropOldest => {
                outbound.wait_empty().await;
                Ok(())
            }
        }
    }

    async fn synthesize(&self, segment: &str, speaking: &mut bool) -> Result<()> {
        tracing::debug!(session_id = %self.session_id, turn_id = %self.turn, segment, "synthesizing");
        let mut pcm = self.synthesizer.synthesize(segment).await?;

        while let Some(chunk) = pcm.next().await {
            let chunk = chunk?;
            if chunk.is_empty() {
                continue;
            }

            self.queues
                .outbound
                .push(OutboundAudio {
                    turn: self.turn,
                    pcm: chunk,
                })
                .await?;

            if !*speaking {
                *speaking = true;
                let _ = self.events.send(Event::Speaking(self.turn));
            }
        }

        Ok(())
    }
}

/// Map a stage error to the controller event it raises, if any
fn stage_failure(turn: TurnId, error: Error) -> Option<Event> {
    match error {
        Error::Engine(error) => Some(Event::TurnFailed { turn, error }),
        Error::Queue(QueueError::Stalled(after)) => Some(Event::Stalled { turn, after }),
        other => {
            tracing::debug!(turn_id = %turn, error = %other, "stage stopped");
            None
        }
    }
}
