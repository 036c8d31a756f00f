//! Shared test utilities
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use petcar_link::action::{ActionCommand, ActionExecutor, ExecutionError, ExecutionResult};
use petcar_link::config::Config;
use petcar_link::connection::{Connector, FramePair, FrameSink, FrameSource, MemorySink, MemorySource, memory_pair};
use petcar_link::engine::{EchoSynthesizer, Engines, ScriptedGenerator, TextRecognizer};
use petcar_link::protocol::{Channel, ControlCmd, Frame, SeqCounter, control, decode, encode};
use petcar_link::terminal::AudioSink;
use petcar_link::{Session, SessionConfig, SessionHandle};

/// How long a test waits for any single frame
pub const FRAME_TIMEOUT: Duration = Duration::from_secs(20);

/// Session settings from the default configuration
#[must_use]
pub fn session_config() -> Arc<SessionConfig> {
    Arc::new(SessionConfig::from_config(&Config::default()).expect("default config is valid"))
}

/// Text recognizer plus the given generator and synthesizer
#[must_use]
pub fn engines(generator: Arc<ScriptedGenerator>, synthesizer: Arc<EchoSynthesizer>) -> Engines {
    Engines::new(Arc::new(TextRecognizer::new()), generator, synthesizer)
}

/// The terminal's end of an in-memory connection
pub struct TestTerminal {
    rx: MemorySource,
    tx: MemorySink,
    seq: SeqCounter,
}

impl TestTerminal {
    #[must_use]
    pub fn new(rx: MemorySource, tx: MemorySink) -> Self {
        Self {
            rx,
            tx,
            seq: SeqCounter::new(),
        }
    }

    /// Send `text` as one chunk for the text recognizer
    pub async fn say(&mut self, text: &str) {
        self.send(Frame::audio(Channel::AudioIn, text.as_bytes().to_vec()))
            .await;
    }

    pub async fn send(&mut self, mut frame: Frame) {
        frame.set_seq(self.seq.next(frame.channel()).expect("sequence available"));
        self.send_raw(encode(&frame)).await;
    }

    pub async fn send_raw(&mut self, bytes: Vec<u8>) {
        self.tx.send(bytes).await.expect("session is reading");
    }

    pub async fn stop(&mut self) {
        self.send(Frame::Control(ControlCmd::stop())).await;
    }

    pub async fn hang_up(&mut self) {
        self.tx.close().await.expect("close memory sink");
    }

    /// Next frame, or `None` once the session closed the connection
    pub async fn next_frame(&mut self) -> Option<Frame> {
        let bytes = tokio::time::timeout(FRAME_TIMEOUT, self.rx.recv())
            .await
            .expect("timed out waiting for a frame")?
            .expect("memory transport does not fail");
        Some(decode(&bytes).expect("session sent a valid frame"))
    }

    /// Collect frames up to and including the state announcement `state`
    pub async fn until_state(&mut self, state: &str) -> Vec<Frame> {
        let mut frames = Vec::new();
        loop {
            let frame = self
                .next_frame()
                .await
                .unwrap_or_else(|| panic!("connection closed before state {state}"));
            let reached = state_of(&frame).is_some_and(|s| s == state);
            frames.push(frame);
            if reached {
                return frames;
            }
        }
    }

    /// Skip ahead to the next control command of `kind`
    pub async fn until_control(&mut self, kind: &str) -> ControlCmd {
        loop {
            match self.next_frame().await {
                Some(Frame::Control(cmd)) if cmd.is(kind) => return cmd,
                Some(_) => {}
                None => panic!("connection closed before a {kind} command"),
            }
        }
    }
}

/// State name carried by a `state` announcement
#[must_use]
pub fn state_of(frame: &Frame) -> Option<&str> {
    match frame {
        Frame::Control(cmd) if cmd.is(control::STATE) => cmd.value.as_str(),
        _ => None,
    }
}

/// State names announced in `frames`, in order
#[must_use]
pub fn states(frames: &[Frame]) -> Vec<String> {
    frames.iter().filter_map(state_of).map(str::to_string).collect()
}

/// Concatenated `audio/out` payloads in `frames`
#[must_use]
pub fn audio(frames: &[Frame]) -> Vec<u8> {
    frames
        .iter()
        .filter_map(|f| match f {
            Frame::Audio(a) if a.channel == Channel::AudioOut => Some(a.pcm.as_slice()),
            _ => None,
        })
        .flatten()
        .copied()
        .collect()
}

/// Final text frames in `frames`
#[must_use]
pub fn texts(frames: &[Frame]) -> Vec<String> {
    frames
        .iter()
        .filter_map(|f| match f {
            Frame::Text(t) if t.is_final => Some(t.text.clone()),
            _ => None,
        })
        .collect()
}

/// Start a session on an in-memory connection
pub fn start_session(
    config: Arc<SessionConfig>,
    engines: Engines,
) -> (
    TestTerminal,
    SessionHandle,
    tokio::task::JoinHandle<petcar_link::Result<petcar_link::SessionSummary>>,
) {
    let ((server_rx, server_tx), (term_rx, term_tx)) = memory_pair(256);
    let session = Session::new(config, engines);
    let handle = session.handle();
    let task = tokio::spawn(session.run(Box::new(server_rx), Box::new(server_tx)));
    (TestTerminal::new(term_rx, term_tx), handle, task)
}

/// Connector that starts a fresh in-process session for every connection
pub struct SessionConnector {
    config: Arc<SessionConfig>,
    engines: Engines,
    handles: mpsc::UnboundedSender<SessionHandle>,
}

impl SessionConnector {
    #[must_use]
    pub fn new(
        config: Arc<SessionConfig>,
        engines: Engines,
    ) -> (Self, mpsc::UnboundedReceiver<SessionHandle>) {
        let (handles, rx) = mpsc::unbounded_channel();
        (
            Self {
                config,
                engines,
                handles,
            },
            rx,
        )
    }
}

#[async_trait]
impl Connector for SessionConnector {
    async fn connect(&self) -> petcar_link::Result<FramePair> {
        let ((server_rx, server_tx), (term_rx, term_tx)) = memory_pair(256);
        let session = Session::new(Arc::clone(&self.config), self.engines.clone());
        let _ = self.handles.send(session.handle());
        tokio::spawn(session.run(Box::new(server_rx), Box::new(server_tx)));

        let source: Box<dyn FrameSource> = Box::new(term_rx);
        let sink: Box<dyn FrameSink> = Box::new(term_tx);
        Ok((source, sink))
    }
}

/// Executor that records every command
#[derive(Default)]
pub struct CollectingExecutor(Mutex<Vec<ActionCommand>>);

impl CollectingExecutor {
    #[must_use]
    pub fn commands(&self) -> Vec<ActionCommand> {
        self.0.lock().unwrap().clone()
    }
}

#[async_trait]
impl ActionExecutor for CollectingExecutor {
    async fn execute(&self, command: &ActionCommand) -> Result<ExecutionResult, ExecutionError> {
        self.0.lock().unwrap().push(command.clone());
        Ok(ExecutionResult::new(command.to_string(), Duration::ZERO))
    }
}

/// Sink that keeps playback per connection: a reset starts a new segment
#[derive(Clone, Default)]
pub struct SegmentedSink(Arc<Mutex<Vec<Vec<u8>>>>);

impl SegmentedSink {
    #[must_use]
    pub fn segments(&self) -> Vec<Vec<u8>> {
        self.0.lock().unwrap().clone()
    }
}

impl AudioSink for SegmentedSink {
    fn play(&mut self, pcm: &[u8]) {
        let mut segments = self.0.lock().unwrap();
        if segments.is_empty() {
            segments.push(Vec::new());
        }
        if let Some(current) = segments.last_mut() {
            current.extend_from_slice(pcm);
        }
    }

    fn reset(&mut self) {
        let mut segments = self.0.lock().unwrap();
        if segments.is_empty() {
            segments.push(Vec::new());
        }
        segments.push(Vec::new());
    }
}
