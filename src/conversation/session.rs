//! Session controller
//!
//! The controller task is the only place session state changes. It reacts to
//! [`Event`]s from the stage tasks and to the utterance deadline, starts and
//! cancels turns, and announces every state change to the terminal.
//!
//! Cancelling a turn sets its token, waits for its generation and synthesis
//! tasks to exit, then discards whatever they left in the text and outbound
//! queues. Only after that can a new turn start.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use super::io::{ControlChannelExecutor, FrameReader, FrameWriter};
use super::pipeline::{
    Event, EventSender, GenerationJob, SessionQueues, SynthesisJob, run_recognition,
};
use super::segment::{SentenceSplitter, clean_command};
use super::state::SessionState;
use super::turn::{History, Turn, TurnId, TurnStatus};
use super::SessionConfig;
use crate::action::{ActionCommand, ActionExecutor, ActionExtractor, dispatch_actions};
use crate::connection::{FrameSink, FrameSource};
use crate::engine::{EngineError, Engines, Exchange, Recognition};
use crate::protocol::{ControlCmd, Frame, control};
use crate::{Error, Result};

/// Control frames buffered ahead of the writer
const CONTROL_CAPACITY: usize = 64;

/// Heard text kept while no turn is active
const HEARD_LIMIT: usize = 256;

/// Tail of the heard text kept when trimming, long enough to hold a split wake phrase
const HEARD_KEEP: usize = 32;

/// How long teardown waits for the writer and action dispatch to finish
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Why a session ended without error
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Transport closed, failed or went idle
    Disconnected(String),
    /// Terminal sent `stop`
    Stopped,
    /// Server closed the session
    Shutdown,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected(reason) => write!(f, "disconnected: {reason}"),
            Self::Stopped => f.write_str("stopped by terminal"),
            Self::Shutdown => f.write_str("server shutdown"),
        }
    }
}

/// Turn counters of one session
#[derive(Debug, Default)]
pub struct SessionStats {
    completed: AtomicU64,
    cancelled: AtomicU64,
    failed: AtomicU64,
}

impl SessionStats {
    #[must_use]
    pub fn completed_turns(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn cancelled_turns(&self) -> u64 {
        self.cancelled.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failed_turns(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Final accounting of a session
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: Uuid,
    pub reason: CloseReason,
    pub completed_turns: u64,
    pub cancelled_turns: u64,
    pub failed_turns: u64,
}

/// Observer/controller handle kept by the session registry
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: Uuid,
    connected_at: DateTime<Utc>,
    state: watch::Receiver<SessionState>,
    stats: Arc<SessionStats>,
    shutdown: CancellationToken,
}

impl SessionHandle {
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub const fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Current controller state
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch state changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    #[must_use]
    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Ask the session to close
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    #[must_use]
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// One conversation with one connected terminal
pub struct Session {
    id: Uuid,
    connected_at: DateTime<Utc>,
    config: Arc<SessionConfig>,
    engines: Engines,
    executor: Option<Arc<dyn ActionExecutor>>,
    state_tx: watch::Sender<SessionState>,
    stats: Arc<SessionStats>,
    shutdown: CancellationToken,
}

impl Session {
    #[must_use]
    pub fn new(config: Arc<SessionConfig>, engines: Engines) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        Self {
            id: Uuid::new_v4(),
            connected_at: Utc::now(),
            config,
            engines,
            executor: None,
            state_tx,
            stats: Arc::new(SessionStats::default()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Execute actions locally instead of forwarding them to the terminal
    #[must_use]
    pub fn with_executor(mut self, executor: Arc<dyn ActionExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            id: self.id,
            connected_at: self.connected_at,
            state: self.state_tx.subscribe(),
            stats: Arc::clone(&self.stats),
            shutdown: self.shutdown.clone(),
        }
    }

    /// Drive the session until the terminal leaves or a fatal error occurs
    ///
    /// # Errors
    ///
    /// Returns [`Error::StallTimeout`] when the terminal stops draining
    /// outbound audio and [`Error::Protocol`] on an unsupported protocol
    /// version. The session is torn down in both cases.
    pub async fn run(
        self,
        source: Box<dyn FrameSource>,
        sink: Box<dyn FrameSink>,
    ) -> Result<SessionSummary> {
        let session_id = self.id;
        let queues = Arc::new(SessionQueues::new(&self.config));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CAPACITY);
        let (active_turn_tx, active_turn_rx) = watch::channel(None);
        let (actions_tx, actions_rx) = mpsc::unbounded_channel();

        let executor = self.executor.clone().unwrap_or_else(|| {
            Arc::new(ControlChannelExecutor::new(control_tx.clone())) as Arc<dyn ActionExecutor>
        });

        let reader = tokio::spawn(
            FrameReader {
                session_id,
                source,
                queues: Arc::clone(&queues),
                control_tx: control_tx.clone(),
                events: events_tx.clone(),
                idle_timeout: self.config.idle_timeout,
                shutdown: self.shutdown.clone(),
            }
            .run(),
        );
        let mut writer = tokio::spawn(
            FrameWriter {
                session_id,
                sink,
                control_rx,
                queues: Arc::clone(&queues),
                active_turn: active_turn_rx,
                events: events_tx.clone(),
            }
            .run(),
        );
        let recognition = tokio::spawn(run_recognition(
            session_id,
            Arc::clone(&self.engines.recognizer),
            Arc::clone(&queues),
            events_tx.clone(),
            self.shutdown.clone(),
        ));
        let mut dispatcher = tokio::spawn(
            dispatch_actions(executor, actions_rx)
                .instrument(tracing::info_span!("actions", session_id = %session_id)),
        );

        tracing::info!(session_id = %session_id, "session started");

        let mut controller = Controller {
            session_id,
            config: Arc::clone(&self.config),
            engines: self.engines.clone(),
            queues: Arc::clone(&queues),
            control_tx,
            actions_tx,
            events_tx,
            state: SessionState::Idle,
            state_tx: self.state_tx.clone(),
            active_turn_tx,
            stats: Arc::clone(&self.stats),
            heard: String::new(),
            turn: None,
            history: History::new(self.config.history_turns),
            next_turn: 0,
            shutdown: self.shutdown.clone(),
        };

        controller.announce().await;
        let outcome = controller.run(events_rx).await;
        controller.close().await;
        drop(controller);

        for task in [reader, recognition] {
            if let Err(e) = task.await {
                tracing::warn!(session_id = %session_id, error = %e, "session task ended abnormally");
            }
        }
        if tokio::time::timeout(DRAIN_TIMEOUT, &mut dispatcher).await.is_err() {
            tracing::warn!(session_id = %session_id, "action dispatch did not finish, aborting");
            dispatcher.abort();
        }
        if tokio::time::timeout(DRAIN_TIMEOUT, &mut writer).await.is_err() {
            tracing::warn!(session_id = %session_id, "frame writer did not finish, aborting");
            writer.abort();
        }

        let summary = SessionSummary {
            id: session_id,
            reason: match &outcome {
                Ok(reason) => reason.clone(),
                Err(e) => CloseReason::Disconnected(e.to_string()),
            },
            completed_turns: self.stats.completed_turns(),
            cancelled_turns: self.stats.cancelled_turns(),
            failed_turns: self.stats.failed_turns(),
        };

        match outcome {
            Ok(reason) => {
                tracing::info!(
                    session_id = %session_id,
                    reason = %reason,
                    completed_turns = summary.completed_turns,
                    "session closed"
                );
                Ok(summary)
            }
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "session torn down");
                Err(e)
            }
        }
    }
}

/// The active turn and its tasks
struct ActiveTurn {
    turn: Turn,
    token: CancellationToken,
    /// Set while `Triggered`
    deadline: Option<Instant>,
    generation: Option<JoinHandle<()>>,
    synthesis: Option<JoinHandle<()>>,
    generated: bool,
    synthesized: bool,
}

struct Controller {
    session_id: Uuid,
    config: Arc<SessionConfig>,
    engines: Engines,
    queues: Arc<SessionQueues>,
    control_tx: mpsc::Sender<Frame>,
    actions_tx: mpsc::UnboundedSender<ActionCommand>,
    events_tx: EventSender,
    state: SessionState,
    state_tx: watch::Sender<SessionState>,
    active_turn_tx: watch::Sender<Option<TurnId>>,
    stats: Arc<SessionStats>,
    /// Recognized text of the current utterance; after a wake phrase, the command so far
    heard: String,
    turn: Option<ActiveTurn>,
    history: History,
    next_turn: u64,
    shutdown: CancellationToken,
}

impl Controller {
    async fn run(&mut self, mut events: mpsc::UnboundedReceiver<Event>) -> Result<CloseReason> {
        loop {
            let deadline = self.turn.as_ref().and_then(|t| t.deadline);

            let event = tokio::select! {
                () = self.shutdown.cancelled() => return Ok(CloseReason::Shutdown),
                () = sleep_until(deadline) => {
                    self.on_utterance_deadline().await;
                    continue;
                }
                event = events.recv() => match event {
                    Some(event) => event,
                    None => return Ok(CloseReason::Disconnected("session tasks ended".to_string())),
                },
            };

            if let Some(reason) = self.handle(event).await? {
                return Ok(reason);
            }
        }
    }

    async fn handle(&mut self, event: Event) -> Result<Option<CloseReason>> {
        match event {
            Event::AudioActive => {
                if self.state == SessionState::Idle {
                    self.transition(SessionState::Listening).await;
                }
            }
            Event::Recognized(recognition) => self.on_recognition(recognition).await,
            Event::RecognitionFailed(error) => self.fail_turn(error).await,
            Event::Speaking(turn) => {
                if self.is_current(turn) && self.state == SessionState::Generating {
                    self.transition(SessionState::Speaking).await;
                }
            }
            Event::Generated {
                turn,
                reply,
                actions,
            } => {
                if let Some(active) = self.current_mut(turn) {
                    active.turn.reply = reply;
                    active.turn.actions = actions;
                    active.generated = true;
                    self.maybe_complete().await;
                }
            }
            Event::Synthesized(turn) => {
                if let Some(active) = self.current_mut(turn) {
                    active.synthesized = true;
                    self.maybe_complete().await;
                }
            }
            Event::TurnFailed { turn, error } => {
                if self.is_current(turn) {
                    self.fail_turn(error).await;
                }
            }
            Event::Stalled { turn, after } => {
                if self.is_current(turn) {
                    return Err(Error::StallTimeout(after));
                }
            }
            Event::StopRequested => return Ok(Some(CloseReason::Stopped)),
            Event::Disconnected(reason) => return Ok(Some(CloseReason::Disconnected(reason))),
            Event::ProtocolViolation(e) => return Err(Error::Protocol(e)),
        }

        Ok(None)
    }

    async fn on_recognition(&mut self, recognition: Recognition) {
        if self.state == SessionState::Idle {
            self.transition(SessionState::Listening).await;
        }

        self.heard.push_str(&recognition.text);
        tracing::trace!(session_id = %self.session_id, heard = %self.heard, is_final = recognition.is_final, "recognized");

        // Wake is handled before the end-of-utterance flag of the same result
        if let Some(tail) = self.config.wake.find(&self.heard).map(str::to_string) {
            if self.turn.is_some() {
                tracing::info!(session_id = %self.session_id, state = %self.state, "barge-in");
                self.cancel_turn(TurnStatus::Cancelled).await;
            }
            self.heard = tail;
            self.start_turn().await;
        }

        if recognition.is_final {
            if self.state == SessionState::Triggered {
                self.end_utterance().await;
            } else {
                self.heard.clear();
            }
        } else if self.state != SessionState::Triggered {
            self.trim_heard();
        }
    }

    fn trim_heard(&mut self) {
        let len = self.heard.chars().count();
        if len > HEARD_LIMIT {
            self.heard = self.heard.chars().skip(len - HEARD_KEEP).collect();
        }
    }

    async fn start_turn(&mut self) {
        self.next_turn += 1;
        let id = TurnId(self.next_turn);
        self.active_turn_tx.send_replace(Some(id));
        self.turn = Some(ActiveTurn {
            turn: Turn::new(id),
            token: self.shutdown.child_token(),
            deadline: Some(Instant::now() + self.config.max_utterance),
            generation: None,
            synthesis: None,
            generated: false,
            synthesized: false,
        });

        tracing::info!(session_id = %self.session_id, turn_id = %id, "wake phrase detected, turn started");
        self.transition(SessionState::Triggered).await;
    }

    async fn end_utterance(&mut self) {
        let command = clean_command(&self.heard).to_string();
        self.heard.clear();

        if command.is_empty() {
            tracing::debug!(session_id = %self.session_id, "wake phrase without command, still waiting");
            return;
        }
        self.begin_generation(command).await;
    }

    async fn on_utterance_deadline(&mut self) {
        let command = clean_command(&self.heard).to_string();
        self.heard.clear();

        if !command.is_empty() {
            self.begin_generation(command).await;
            return;
        }

        if let Some(mut active) = self.turn.take() {
            active.turn.status = TurnStatus::Abandoned;
            tracing::info!(session_id = %self.session_id, turn_id = %active.turn.id, "no command before deadline, turn abandoned");
        }
        self.transition(SessionState::Listening).await;
    }

    async fn begin_generation(&mut self, command: String) {
        let Some(id) = self.turn.as_ref().map(|t| t.turn.id) else {
            return;
        };

        tracing::info!(session_id = %self.session_id, turn_id = %id, transcript = %command, "command recognized");
        self.send(Frame::text(command.clone(), true)).await;

        let Some(active) = self.turn.as_mut() else {
            return;
        };
        active.deadline = None;
        active.turn.transcript.clone_from(&command);

        let generation = GenerationJob {
            session_id: self.session_id,
            turn: id,
            token: active.token.clone(),
            generator: Arc::clone(&self.engines.generator),
            history: self.history.snapshot(),
            prompt: command,
            extractor: ActionExtractor::new(&self.config.action_prefix, self.config.max_action_len),
            first_token_timeout: self.config.generation_timeout,
            queues: Arc::clone(&self.queues),
            events: self.events_tx.clone(),
        }
        .spawn();

        let synthesis = SynthesisJob {
            session_id: self.session_id,
            turn: id,
            token: active.token.clone(),
            synthesizer: Arc::clone(&self.engines.synthesizer),
            splitter: SentenceSplitter::new(self.config.sentence_max_chars),
            queues: Arc::clone(&self.queues),
            events: self.events_tx.clone(),
        }
        .spawn();

        active.generation = Some(generation);
        active.synthesis = Some(synthesis);
        self.transition(SessionState::Generating).await;
    }

    async fn maybe_complete(&mut self) {
        if !self
            .turn
            .as_ref()
            .is_some_and(|t| t.generated && t.synthesized)
        {
            return;
        }
        let Some(mut active) = self.turn.take() else {
            return;
        };

        reap(self.session_id, &mut active).await;
        active.turn.status = TurnStatus::Completed;
        let turn = active.turn;

        if !turn.reply.is_empty() {
            self.send(Frame::text(turn.reply.clone(), true)).await;
        }
        self.history.push(Exchange {
            user: turn.transcript.clone(),
            assistant: turn.reply.clone(),
        });
        for action in turn.actions {
            if self.actions_tx.send(action).is_err() {
                tracing::warn!(session_id = %self.session_id, "action dispatcher gone");
                break;
            }
        }

        self.stats.completed.fetch_add(1, Ordering::Relaxed);
        tracing::info!(session_id = %self.session_id, turn_id = %turn.id, "turn completed");
        self.transition(SessionState::Listening).await;
    }

    /// Stop the active turn and discard its queued data
    async fn cancel_turn(&mut self, status: TurnStatus) -> Option<Turn> {
        let mut active = self.turn.take()?;

        active.token.cancel();
        self.active_turn_tx.send_replace(None);
        reap(self.session_id, &mut active).await;

        let text = self.queues.text.drain().len();
        let audio = self.queues.outbound.drain().len();

        if status == TurnStatus::Cancelled {
            self.stats.cancelled.fetch_add(1, Ordering::Relaxed);
        }
        tracing::info!(
            session_id = %self.session_id,
            turn_id = %active.turn.id,
            discarded_text = text,
            discarded_audio = audio,
            "turn stopped"
        );

        active.turn.status = status;
        Some(active.turn)
    }

    async fn fail_turn(&mut self, error: EngineError) {
        tracing::warn!(session_id = %self.session_id, error = %error, "engine failure");

        if self.cancel_turn(TurnStatus::Failed(error.to_string())).await.is_some() {
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.send(Frame::Control(ControlCmd::error(error.code(), &error.to_string())))
            .await;

        if self.state != SessionState::Listening {
            self.transition(SessionState::Listening).await;
        }
    }

    async fn close(&mut self) {
        self.transition(SessionState::Closing).await;
        self.cancel_turn(TurnStatus::Cancelled).await;
        self.queues.close_all();
        self.shutdown.cancel();
    }

    async fn transition(&mut self, next: SessionState) {
        if !self.state.can_transition_to(next) {
            tracing::debug!(session_id = %self.session_id, from = %self.state, to = %next, "ignoring state transition");
            return;
        }

        tracing::debug!(session_id = %self.session_id, from = %self.state, to = %next, "state transition");
        self.state = next;
        self.state_tx.send_replace(next);
        self.announce().await;
    }

    async fn announce(&self) {
        let cmd = ControlCmd::new(control::STATE, serde_json::json!(self.state.as_str()));
        self.send(Frame::Control(cmd)).await;
    }

    async fn send(&self, frame: Frame) {
        if self.control_tx.send(frame).await.is_err() {
            tracing::debug!(session_id = %self.session_id, "frame writer gone");
        }
    }

    fn is_current(&self, turn: TurnId) -> bool {
        self.turn.as_ref().is_some_and(|t| t.turn.id == turn)
    }

    fn current_mut(&mut self, turn: TurnId) -> Option<&mut ActiveTurn> {
        self.turn.as_mut().filter(|t| t.turn.id == turn)
    }
}

/// Wait for a turn's tasks to exit
async fn reap(session_id: Uuid, active: &mut ActiveTurn) {
    for handle in [active.generation.take(), active.synthesis.take()]
        .into_iter()
        .flatten()
    {
        if let Err(e) = handle.await {
            tracing::warn!(session_id = %session_id, error = %e, "turn task ended abnormally");
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
