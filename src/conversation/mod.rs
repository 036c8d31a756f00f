//! Conversation sessions
//!
//! One [`Session`] per connected terminal. The session controller owns the
//! state machine and the active turn; recognition, generation, synthesis and
//! the frame reader/writer run as separate tasks linked by bounded queues,
//! channels and cancellation tokens.

mod io;
mod pipeline;
mod segment;
mod session;
mod state;
mod turn;

use std::time::Duration;

pub use io::ControlChannelExecutor;
pub use pipeline::{OutboundAudio, SessionQueues, TextItem};
pub use segment::{SentenceSplitter, clean_command};
pub use session::{CloseReason, Session, SessionHandle, SessionStats, SessionSummary};
pub use state::SessionState;
pub use turn::{History, Turn, TurnId, TurnStatus};

use crate::config::Config;
use crate::voice::WakeDetector;
use crate::Result;

/// Per-session settings resolved from [`Config`]
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub wake: WakeDetector,
    pub max_utterance: Duration,
    pub stall_timeout: Duration,
    pub generation_timeout: Duration,
    pub idle_timeout: Duration,
    pub history_turns: usize,
    pub inbound_capacity: usize,
    pub text_capacity: usize,
    pub outbound_capacity: usize,
    pub action_prefix: String,
    pub max_action_len: usize,
    pub sentence_max_chars: usize,
}

impl SessionConfig {
    /// Build session settings from the resolved configuration
    ///
    /// # Errors
    ///
    /// Returns error if no usable wake phrase is configured
    pub fn from_config(config: &Config) -> Result<Self> {
        let pipeline = &config.pipeline;

        Ok(Self {
            wake: WakeDetector::new(pipeline.wake_words.clone())?,
            max_utterance: pipeline.max_utterance,
            stall_timeout: pipeline.stall_timeout,
            generation_timeout: pipeline.generation_timeout,
            idle_timeout: config.server.idle_timeout,
            history_turns: pipeline.history_turns,
            inbound_capacity: pipeline.inbound_capacity,
            text_capacity: pipeline.text_capacity,
            outbound_capacity: pipeline.outbound_capacity,
            action_prefix: pipeline.action_prefix.clone(),
            max_action_len: pipeline.max_action_len,
            sentence_max_chars: pipeline.sentence_max_chars,
        })
    }
}
