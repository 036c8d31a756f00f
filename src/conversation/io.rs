//! Frame reader and frame writer of a session
//!
//! The reader is the only consumer of the transport's receiving half and
//! the writer is the only transmitter, so it owns the outbound sequence
//! counters.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::pipeline::{Event, EventSender, SessionQueues};
use super::turn::TurnId;
use crate::action::{ActionCommand, ActionExecutor, ExecutionError, ExecutionResult};
use crate::connection::{FrameSink, FrameSource};
use crate::protocol::{
    Channel, ControlCmd, Frame, MAX_PAYLOAD, SeqCheck, SeqCounter, SeqTracker, control, decode,
    encode,
};
use crate::Result;

/// Decodes inbound frames and routes them
pub struct FrameReader {
    pub session_id: Uuid,
    pub source: Box<dyn FrameSource>,
    pub queues: Arc<SessionQueues>,
    pub control_tx: mpsc::Sender<Frame>,
    pub events: EventSender,
    pub idle_timeout: Duration,
    pub shutdown: CancellationToken,
}

impl FrameReader {
    pub async fn run(mut self) {
        let shutdown = self.shutdown.clone();
        let mut tracker = SeqTracker::new();

        tokio::select! {
            () = shutdown.cancelled() => {}
            () = self.read_loop(&mut tracker) => {}
        }

        tracing::debug!(
            session_id = %self.session_id,
            audio_gaps = tracker.gaps(Channel::AudioIn),
            audio_rejected = tracker.rejected(Channel::AudioIn),
            control_gaps = tracker.gaps(Channel::Control),
            control_rejected = tracker.rejected(Channel::Control),
            "frame reader stopped"
        );
    }

    async fn read_loop(&mut self, tracker: &mut SeqTracker) {
        loop {
            let bytes = match tokio::time::timeout(self.idle_timeout, self.source.recv()).await {
                Ok(Some(Ok(bytes))) => bytes,
                Ok(Some(Err(e))) => {
                    tracing::warn!(session_id = %self.session_id, error = %e, "receive failed");
                    let _ = self.events.send(Event::Disconnected(e.to_string()));
                    return;
                }
                Ok(None) => {
                    tracing::info!(session_id = %self.session_id, "terminal closed the connection");
                    let _ = self.events.send(Event::Disconnected("closed by terminal".to_string()));
                    return;
                }
                Err(_) => {
                    tracing::warn!(session_id = %self.session_id, timeout = ?self.idle_timeout, "terminal idle, dropping session");
                    let _ = self.events.send(Event::Disconnected("idle timeout".to_string()));
                    return;
                }
            };

            let frame = match decode(&bytes) {
                Ok(frame) => frame,
                Err(e) if e.is_fatal() => {
                    tracing::warn!(session_id = %self.session_id, error = %e, "fatal protocol error");
                    let _ = self.events.send(Event::ProtocolViolation(e));
                    return;
                }
                Err(e) => {
                    tracing::warn!(session_id = %self.session_id, error = %e, "dropping malformed frame");
                    continue;
                }
            };

            let channel = frame.channel();
            match tracker.check(channel, frame.seq()) {
                SeqCheck::Accepted => {}
                SeqCheck::Gap { expected, got } => {
                    tracing::debug!(session_id = %self.session_id, %channel, expected, got, "sequence gap");
                }
                SeqCheck::Rejected { last } => {
                    tracing::debug!(session_id = %self.session_id, %channel, seq = frame.seq(), last, "dropping stale frame");
                    continue;
                }
            }

            if !self.route(frame).await {
                return;
            }
        }
    }

    /// Returns false once the session should stop reading
    async fn route(&mut self, frame: Frame) -> bool {
        match frame {
            Frame::Audio(audio) if audio.channel == Channel::AudioIn => {
                match self.queues.inbound.push(audio.pcm).await {
                    Ok(true) => true,
                    Ok(false) => {
                        tracing::trace!(session_id = %self.session_id, seq = audio.seq, "inbound audio overflow, dropped oldest");
                        true
                    }
                    Err(_) => false,
                }
            }
            Frame::Audio(audio) => {
                tracing::debug!(session_id = %self.session_id, channel = %audio.channel, "ignoring audio on server-bound channel");
                true
            }
            Frame::Control(cmd) if cmd.is(control::PING) => {
                let _ = self.control_tx.send(Frame::Control(ControlCmd::pong())).await;
                true
            }
            Frame::Control(cmd) if cmd.is(control::STOP) => {
                tracing::info!(session_id = %self.session_id, "terminal requested stop");
                let _ = self.events.send(Event::StopRequested);
                false
            }
            Frame::Control(cmd) => {
                tracing::debug!(session_id = %self.session_id, kind = %cmd.kind, "ignoring control command");
                true
            }
            Frame::Text(text) => {
                tracing::debug!(session_id = %self.session_id, seq = text.seq, "ignoring text frame");
                true
            }
        }
    }
}

/// Sole transmitter for a session
pub struct FrameWriter {
    pub session_id: Uuid,
    pub sink: Box<dyn FrameSink>,
    pub control_rx: mpsc::Receiver<Frame>,
    pub queues: Arc<SessionQueues>,
    pub active_turn: watch::Receiver<Option<TurnId>>,
    pub events: EventSender,
}

impl FrameWriter {
    /// Runs until every control sender is gone, then closes the sink
    pub async fn run(mut self) {
        let mut seq = SeqCounter::new();
        let mut audio_open = true;

        loop {
            let frame = tokio::select! {
                biased;
                msg = self.control_rx.recv() => match msg {
                    Some(frame) => frame,
                    None => break,
                },
                item = self.queues.outbound.pop(), if audio_open => match item {
                    Ok(audio) => {
                        if *self.active_turn.borrow() != Some(audio.turn) {
                            tracing::trace!(session_id = %self.session_id, turn_id = %audio.turn, "discarding audio of a cancelled turn");
                            continue;
                        }
                        if let Err(e) = self.send_audio(&mut seq, audio.pcm).await {
                            self.fail(&e);
                            break;
                        }
                        continue;
                    }
                    Err(_) => {
                        audio_open = false;
                        continue;
                    }
                },
            };

            if let Err(e) = self.send(&mut seq, frame).await {
                self.fail(&e);
                break;
            }
        }

        if let Err(e) = self.sink.close().await {
            tracing::debug!(session_id = %self.session_id, error = %e, "close failed");
        }
        tracing::debug!(
            session_id = %self.session_id,
            audio_frames = seq.issued(Channel::AudioOut),
            control_frames = seq.issued(Channel::Control),
            "frame writer stopped"
        );
    }

    async fn send_audio(&mut self, seq: &mut SeqCounter, pcm: Vec<u8>) -> Result<()> {
        if pcm.len() <= MAX_PAYLOAD {
            return self.send(seq, Frame::audio(Channel::AudioOut, pcm)).await;
        }
        for chunk in pcm.chunks(MAX_PAYLOAD) {
            self.send(seq, Frame::audio(Channel::AudioOut, chunk.to_vec())).await?;
        }
        Ok(())
    }

    async fn send(&mut self, seq: &mut SeqCounter, mut frame: Frame) -> Result<()> {
        let channel = frame.channel();
        let next = seq.next(channel).ok_or(crate::Error::SequenceExhausted(channel))?;
        frame.set_seq(next);
        self.sink.send(encode(&frame)).await
    }

    fn fail(&self, error: &crate::Error) {
        tracing::warn!(session_id = %self.session_id, error = %error, "send failed");
        let _ = self.events.send(Event::Disconnected(error.to_string()));
    }
}

/// Forwards actions to the terminal as `action` control commands
#[derive(Debug, Clone)]
pub struct ControlChannelExecutor {
    control_tx: mpsc::Sender<Frame>,
}

impl ControlChannelExecutor {
    #[must_use]
    pub const fn new(control_tx: mpsc::Sender<Frame>) -> Self {
        Self { control_tx }
    }
}

#[async_trait]
impl ActionExecutor for ControlChannelExecutor {
    async fn execute(
        &self,
        command: &ActionCommand,
    ) -> std::result::Result<ExecutionResult, ExecutionError> {
        self.control_tx
            .send(Frame::Control(ControlCmd::action(command)))
            .await
            .map_err(|_| ExecutionError::Unavailable("session closed".to_string()))?;

        Ok(ExecutionResult::new(
            format!("forwarded {command} to terminal"),
            Duration::ZERO,
        ))
    }
}
