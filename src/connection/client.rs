//! Terminal connection manager
//!
//! Keeps one logical connection to the server alive: reconnects with
//! backoff, sends heartbeats, drops connections the watchdog deems dead, and
//! resets local playback whenever a connection ends.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::backoff::ReconnectPolicy;
use super::transport::{FrameSink, FrameSource, split_tungstenite};
use crate::action::{ActionCommand, ActionExecutor, dispatch_actions};
use crate::config::TerminalConfig;
use crate::conversation::SessionState;
use crate::protocol::{
    Channel, ControlCmd, DecodeError, Frame, SeqCheck, SeqCounter, SeqTracker, control, decode,
    encode,
};
use crate::terminal::{AudioSink, AudioSource};
use crate::{Error, Result};

/// Quiet period after the source is exhausted before the terminal hangs up
const DRAIN_QUIET: Duration = Duration::from_millis(1500);

/// Both halves of one connection
pub type FramePair = (Box<dyn FrameSource>, Box<dyn FrameSink>);

/// Opens connections to the server
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open one connection
    ///
    /// # Errors
    ///
    /// Returns error if the server is unreachable
    async fn connect(&self) -> Result<FramePair>;
}

/// Connects over WebSocket
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
    timeout: Duration,
}

impl WsConnector {
    #[must_use]
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<FramePair> {
        let (socket, _) = tokio::time::timeout(
            self.timeout,
            tokio_tungstenite::connect_async(self.url.as_str()),
        )
        .await
        .map_err(|_| Error::Transport(format!("connect to {} timed out", self.url)))??;

        let (source, sink) = split_tungstenite(socket);
        Ok((Box::new(source), Box::new(sink)))
    }
}

/// Why a connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEnd {
    /// Audio source exhausted and the server went quiet
    SourceFinished,
    /// Local shutdown requested
    Shutdown,
    /// Connection dropped; the terminal reconnects
    Lost(String),
    /// Peer speaks a protocol this build cannot read; reconnecting will not help
    Protocol(DecodeError),
}

/// Terminal side of the link
pub struct Terminal {
    config: TerminalConfig,
    policy: ReconnectPolicy,
    source: Box<dyn AudioSource>,
    sink: Box<dyn AudioSink>,
    executor: Arc<dyn ActionExecutor>,
    exit_when_done: bool,
    remote_state: SessionState,
    connections: u32,
}

impl Terminal {
    #[must_use]
    pub fn new(
        config: TerminalConfig,
        source: Box<dyn AudioSource>,
        sink: Box<dyn AudioSink>,
        executor: Arc<dyn ActionExecutor>,
    ) -> Self {
        Self {
            policy: ReconnectPolicy::from_config(&config),
            config,
            source,
            sink,
            executor,
            exit_when_done: true,
            remote_state: SessionState::Idle,
            connections: 0,
        }
    }

    /// Keep the connection open after the source is exhausted
    #[must_use]
    pub const fn keep_open(mut self) -> Self {
        self.exit_when_done = false;
        self
    }

    #[must_use]
    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Connections established so far
    #[must_use]
    pub const fn connections(&self) -> u32 {
        self.connections
    }

    /// Run until the source is done, shutdown, or reconnects are exhausted
    ///
    /// # Errors
    ///
    /// Returns error once the reconnect policy gives up, or at once when the
    /// server sends a frame of an unknown protocol version
    pub async fn run(&mut self, connector: &dyn Connector, shutdown: &CancellationToken) -> Result<()> {
        let (actions_tx, actions_rx) = mpsc::unbounded_channel();
        let dispatcher = tokio::spawn(dispatch_actions(Arc::clone(&self.executor), actions_rx));

        let mut failures = 0u32;
        let result = loop {
            if shutdown.is_cancelled() {
                break Ok(());
            }

            match connector.connect().await {
                Ok((source, sink)) => {
                    self.connections += 1;
                    failures = 0;
                    tracing::info!(connection = self.connections, "connected to server");

                    let end = self.run_connection(source, sink, &actions_tx, shutdown).await;

                    self.sink.reset();
                    self.remote_state = SessionState::Idle;

                    match end {
                        ConnectionEnd::SourceFinished | ConnectionEnd::Shutdown => {
                            tracing::info!(reason = ?end, "connection closed");
                            break Ok(());
                        }
                        ConnectionEnd::Lost(reason) => {
                            tracing::warn!(reason = %reason, "connection lost");
                        }
                        ConnectionEnd::Protocol(e) => {
                            tracing::error!(error = %e, "server protocol mismatch");
                            break Err(Error::Protocol(e));
                        }
                    }
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!(error = %e, failures, "connect failed");
                }
            }

            if !self.policy.allows(failures) {
                break Err(Error::Transport(format!(
                    "giving up after {failures} failed connection attempts"
                )));
            }

            let delay = self.policy.delay_for_attempt(failures.saturating_sub(1));
            tracing::info!(delay = ?delay, "reconnecting");
            tokio::select! {
                () = shutdown.cancelled() => break Ok(()),
                () = tokio::time::sleep(delay) => {}
            }
        };

        drop(actions_tx);
        let _ = dispatcher.await;
        result
    }

    async fn run_connection(
        &mut self,
        mut source: Box<dyn FrameSource>,
        mut sink: Box<dyn FrameSink>,
        actions: &mpsc::UnboundedSender<ActionCommand>,
        shutdown: &CancellationToken,
    ) -> ConnectionEnd {
        let mut seq = SeqCounter::new();
        let mut tracker = SeqTracker::new();
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;

        let mut last_rx = Instant::now();
        let mut last_activity = Instant::now();
        let mut source_done = false;

        let end = loop {
            let watchdog = last_rx + self.config.watchdog_timeout;
            let drained = source_done && self.exit_when_done && !self.remote_state.has_turn();

            tokio::select! {
                () = shutdown.cancelled() => {
                    let _ = send_frame(sink.as_mut(), &mut seq, Frame::Control(ControlCmd::stop())).await;
                    break ConnectionEnd::Shutdown;
                }
                () = tokio::time::sleep_until(watchdog) => {
                    break ConnectionEnd::Lost(format!(
                        "nothing received for {:?}",
                        self.config.watchdog_timeout
                    ));
                }
                () = tokio::time::sleep_until(last_activity + DRAIN_QUIET), if drained => {
                    let _ = send_frame(sink.as_mut(), &mut seq, Frame::Control(ControlCmd::stop())).await;
                    break ConnectionEnd::SourceFinished;
                }
                _ = heartbeat.tick() => {
                    if let Err(e) = send_frame(sink.as_mut(), &mut seq, Frame::Control(ControlCmd::ping())).await {
                        break ConnectionEnd::Lost(e.to_string());
                    }
                }
                chunk = self.source.next_chunk(), if !source_done => match chunk {
                    Some(pcm) => {
                        if let Err(e) = send_frame(sink.as_mut(), &mut seq, Frame::audio(Channel::AudioIn, pcm)).await {
                            break ConnectionEnd::Lost(e.to_string());
                        }
                    }
                    None => {
                        tracing::info!("audio source finished");
                        source_done = true;
                        last_activity = Instant::now();
                    }
                },
                msg = source.recv() => match msg {
                    Some(Ok(bytes)) => {
                        last_rx = Instant::now();
                        match self.handle_frame(&bytes, &mut tracker, actions) {
                            Ok(true) => last_activity = last_rx,
                            Ok(false) => {}
                            Err(e) => break ConnectionEnd::Protocol(e),
                        }
                    }
                    Some(Err(e)) => break ConnectionEnd::Lost(e.to_string()),
                    None => break ConnectionEnd::Lost("closed by server".to_string()),
                },
            }
        };

        if let Err(e) = sink.close().await {
            tracing::debug!(error = %e, "close failed");
        }
        tracing::debug!(
            audio_sent = seq.issued(Channel::AudioIn),
            audio_gaps = tracker.gaps(Channel::AudioOut),
            control_gaps = tracker.gaps(Channel::Control),
            "connection finished"
        );
        end
    }

    /// Route one inbound frame; `Ok(true)` for anything but heartbeats
    fn handle_frame(
        &mut self,
        bytes: &[u8],
        tracker: &mut SeqTracker,
        actions: &mpsc::UnboundedSender<ActionCommand>,
    ) -> std::result::Result<bool, DecodeError> {
        let frame = match decode(bytes) {
            Ok(frame) => frame,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed frame");
                return Ok(false);
            }
        };

        if let SeqCheck::Rejected { last } = tracker.check(frame.channel(), frame.seq()) {
            tracing::debug!(channel = %frame.channel(), seq = frame.seq(), last, "dropping stale frame");
            return Ok(false);
        }

        match frame {
            Frame::Audio(audio) if audio.channel == Channel::AudioOut => {
                self.sink.play(&audio.pcm);
            }
            Frame::Audio(audio) => {
                tracing::debug!(channel = %audio.channel, "ignoring audio on terminal-bound channel");
            }
            Frame::Text(text) => {
                tracing::info!(text = %text.text, is_final = text.is_final, "server text");
            }
            Frame::Control(cmd) if cmd.is(control::PONG) => {
                tracing::trace!("pong");
                return Ok(false);
            }
            Frame::Control(cmd) if cmd.is(control::ACTION) => {
                match ActionCommand::from_value(cmd.value) {
                    Ok(command) => {
                        tracing::info!(action = %command, "action received");
                        let _ = actions.send(command);
                    }
                    Err(e) => tracing::warn!(error = %e, "malformed action command"),
                }
            }
            Frame::Control(cmd) if cmd.is(control::STATE) => {
                match cmd.value.as_str().and_then(SessionState::from_wire) {
                    Some(state) => {
                        tracing::debug!(%state, "server state");
                        self.remote_state = state;
                    }
                    None => tracing::warn!(value = %cmd.value, "unknown server state"),
                }
            }
            Frame::Control(cmd) if cmd.is(control::ERROR) => {
                tracing::warn!(error = %cmd.value, "server reported a turn failure");
            }
            Frame::Control(cmd) => {
                tracing::debug!(kind = %cmd.kind, "ignoring control command");
            }
        }

        Ok(true)
    }
}

async fn send_frame(sink: &mut dyn FrameSink, seq: &mut SeqCounter, mut frame: Frame) -> Result<()> {
    let channel = frame.channel();
    frame.set_seq(seq.next(channel).ok_or(Error::SequenceExhausted(channel))?);
    sink.send(encode(&frame)).await
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;
    use crate::action::{ExecutionError, ExecutionResult};
    use crate::connection::transport::{MemoryEnd, MemorySink, MemorySource, memory_pair};
    use crate::terminal::{RecordingSink, ScriptSource};

    /// Hands out prepared connections, failing once they run out
    struct PreparedConnector(Mutex<VecDeque<MemoryEnd>>);

    #[async_trait]
    impl Connector for PreparedConnector {
        async fn connect(&self) -> Result<FramePair> {
            let next = self
                .0
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| Error::Transport("refused".to_string()))?;
            Ok((Box::new(next.0), Box::new(next.1)))
        }
    }

    #[derive(Default)]
    struct Collecting(Mutex<Vec<String>>);

    #[async_trait]
    impl ActionExecutor for Collecting {
        async fn execute(
            &self,
            command: &ActionCommand,
        ) -> std::result::Result<ExecutionResult, ExecutionError> {
            self.0.lock().unwrap().push(command.to_string());
            Ok(ExecutionResult::new("ok", Duration::ZERO))
        }
    }

    fn config() -> TerminalConfig {
        TerminalConfig {
            heartbeat_interval: Duration::from_secs(1),
            watchdog_timeout: Duration::from_secs(3),
            reconnect_base_delay: Duration::from_millis(100),
            reconnect_max_delay: Duration::from_secs(1),
            max_reconnect_attempts: Some(2),
            ..TerminalConfig::default()
        }
    }

    async fn send(sink: &mut MemorySink, seq: &mut SeqCounter, frame: Frame) {
        send_frame(sink, seq, frame).await.unwrap();
    }

    async fn next_frame(source: &mut MemorySource) -> Option<Frame> {
        let bytes = source.recv().await?.unwrap();
        Some(decode(&bytes).unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_policy_attempts() {
        let connector = PreparedConnector(Mutex::new(VecDeque::new()));
        let mut terminal = Terminal::new(
            config(),
            Box::new(ScriptSource::new(["hi"], Duration::ZERO)),
            Box::new(RecordingSink::new()),
            Arc::new(Collecting::default()),
        )
        .with_policy(ReconnectPolicy {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(10),
            max_attempts: Some(3),
        });

        let started = Instant::now();
        let err = terminal
            .run(&connector, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert_eq!(terminal.connections(), 0);
        // Two pauses between three attempts
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test(start_paused = true)]
    async fn plays_audio_dispatches_actions_and_hangs_up() {
        let (client, (mut server_rx, mut server_tx)) = memory_pair(64);
        let connector = PreparedConnector(Mutex::new(VecDeque::from([client])));
        let executor = Arc::new(Collecting::default());
        let sink = RecordingSink::new();

        let mut terminal = Terminal::new(
            config(),
            Box::new(ScriptSource::new(["go"], Duration::ZERO)),
            Box::new(sink.clone()),
            executor.clone(),
        );

        let server = tokio::spawn(async move {
            let mut seq = SeqCounter::new();
            let Some(Frame::Audio(audio)) = next_frame(&mut server_rx).await else {
                panic!("expected audio");
            };
            assert_eq!(audio.pcm, b"go\n");

            send(&mut server_tx, &mut seq, Frame::audio(Channel::AudioOut, vec![7; 4])).await;
            send(
                &mut server_tx,
                &mut seq,
                Frame::Control(ControlCmd::new(control::ACTION, serde_json::json!({"name": "forward", "args": [2]}))),
            )
            .await;
            send(
                &mut server_tx,
                &mut seq,
                Frame::Control(ControlCmd::new(control::STATE, serde_json::json!("listening"))),
            )
            .await;

            loop {
                match next_frame(&mut server_rx).await {
                    Some(Frame::Control(cmd)) if cmd.is(control::STOP) => break,
                    Some(_) => {}
                    None => panic!("terminal hung up without stop"),
                }
            }
        });

        terminal.run(&connector, &CancellationToken::new()).await.unwrap();
        server.await.unwrap();

        assert_eq!(terminal.connections(), 1);
        assert_eq!(sink.chunks(), 1);
        assert_eq!(sink.resets(), 1);
        assert_eq!(*executor.0.lock().unwrap(), vec!["forward(2)".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_drops_silent_connection_and_reconnects() {
        let (first, _first_server) = memory_pair(64);
        let (second, (mut server_rx, mut server_tx)) = memory_pair(64);
        let connector = PreparedConnector(Mutex::new(VecDeque::from([first, second])));
        let sink = RecordingSink::new();
        let shutdown = CancellationToken::new();

        let mut terminal = Terminal::new(
            config(),
            Box::new(ScriptSource::new(Vec::<String>::new(), Duration::ZERO)),
            Box::new(sink.clone()),
            Arc::new(Collecting::default()),
        )
        .keep_open();

        let token = shutdown.clone();
        let server = tokio::spawn(async move {
            let mut seq = SeqCounter::new();
            send(
                &mut server_tx,
                &mut seq,
                Frame::Control(ControlCmd::new(control::STATE, serde_json::json!("listening"))),
            )
            .await;
            let Some(Frame::Control(cmd)) = next_frame(&mut server_rx).await else {
                panic!("expected control frame");
            };
            assert!(cmd.is(control::PING));
            token.cancel();
            server_tx
        });

        terminal.run(&connector, &shutdown).await.unwrap();
        drop(server.await.unwrap());

        assert_eq!(terminal.connections(), 2);
        assert_eq!(sink.resets(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_protocol_version_stops_without_reconnecting() {
        let (client, (_server_rx, mut server_tx)) = memory_pair(64);
        let (spare, _spare_server) = memory_pair(64);
        let connector = PreparedConnector(Mutex::new(VecDeque::from([client, spare])));

        let mut terminal = Terminal::new(
            config(),
            Box::new(ScriptSource::new(Vec::<String>::new(), Duration::ZERO)),
            Box::new(RecordingSink::new()),
            Arc::new(Collecting::default()),
        )
        .keep_open()
        .with_policy(ReconnectPolicy {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(10),
            max_attempts: None,
        });

        let mut bytes = encode(&Frame::Control(ControlCmd::ping()));
        bytes[0] = crate::protocol::PROTOCOL_VERSION + 1;
        server_tx.send(bytes).await.unwrap();

        let err = terminal
            .run(&connector, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(DecodeError::UnknownVersion(v)) if v == crate::protocol::PROTOCOL_VERSION + 1
        ));
        assert_eq!(terminal.connections(), 1);
    }

    #[tokio::test]
    async fn exhausted_counter_refuses_to_send() {
        let ((mut rx, _), (_, mut tx)) = memory_pair(8);
        let mut seq = SeqCounter::starting_at(u32::MAX);

        send(&mut tx, &mut seq, Frame::Control(ControlCmd::ping())).await;
        let err = send_frame(&mut tx, &mut seq, Frame::Control(ControlCmd::ping()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SequenceExhausted(Channel::Control)));

        drop(tx);
        assert_eq!(next_frame(&mut rx).await.map(|f| f.seq()), Some(u32::MAX));
        assert!(next_frame(&mut rx).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_pings_while_idle() {
        let (client, (mut server_rx, _server_tx)) = memory_pair(64);
        let connector = PreparedConnector(Mutex::new(VecDeque::from([client])));
        let shutdown = CancellationToken::new();

        let mut terminal = Terminal::new(
            config(),
            Box::new(ScriptSource::new(Vec::<String>::new(), Duration::ZERO)),
            Box::new(RecordingSink::new()),
            Arc::new(Collecting::default()),
        )
        .keep_open();

        let token = shutdown.clone();
        let server = tokio::spawn(async move {
            let Some(Frame::Control(cmd)) = next_frame(&mut server_rx).await else {
                panic!("expected control frame");
            };
            assert!(cmd.is(control::PING));
            token.cancel();
        });

        terminal.run(&connector, &shutdown).await.unwrap();
        server.await.unwrap();
    }
}
