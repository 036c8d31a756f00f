//! Wire frame types

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::action::ActionCommand;

/// Current wire protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Fixed header size: version, channel, seq, kind, length
pub const HEADER_LEN: usize = 11;

/// Largest payload a peer will accept
pub const MAX_PAYLOAD: usize = 1024 * 1024;

/// Control command types understood by both ends
pub mod control {
    /// Server → terminal: dispatch an action command
    pub const ACTION: &str = "action";
    /// Server → terminal: session state changed
    pub const STATE: &str = "state";
    /// Server → terminal: turn-local failure notice
    pub const ERROR: &str = "error";
    /// Terminal → server heartbeat
    pub const PING: &str = "ping";
    /// Server → terminal heartbeat reply
    pub const PONG: &str = "pong";
    /// Terminal → server: close the session
    pub const STOP: &str = "stop";
}

/// Logical channel multiplexed on one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Terminal microphone PCM
    AudioIn,
    /// Synthesized PCM for the terminal speaker
    AudioOut,
    /// Actions, state, heartbeats, text mirrors
    Control,
}

impl Channel {
    /// All channels, in id order
    pub const ALL: [Self; 3] = [Self::AudioIn, Self::AudioOut, Self::Control];

    /// Wire id
    #[must_use]
    pub const fn id(self) -> u8 {
        match self {
            Self::AudioIn => 0,
            Self::AudioOut => 1,
            Self::Control => 2,
        }
    }

    /// Parse a wire id
    #[must_use]
    pub const fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(Self::AudioIn),
            1 => Some(Self::AudioOut),
            2 => Some(Self::Control),
            _ => None,
        }
    }

    /// Index into per-channel arrays
    #[must_use]
    pub const fn index(self) -> usize {
        self.id() as usize
    }

    /// Path-style name used in logs
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AudioIn => "audio/in",
            Self::AudioOut => "audio/out",
            Self::Control => "control",
        }
    }

    /// Whether this channel carries PCM
    #[must_use]
    pub const fn is_audio(self) -> bool {
        matches!(self, Self::AudioIn | Self::AudioOut)
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload kind carried in the header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Audio,
    Text,
    Control,
}

impl FrameKind {
    /// Wire id
    #[must_use]
    pub const fn id(self) -> u8 {
        match self {
            Self::Audio => 0,
            Self::Text => 1,
            Self::Control => 2,
        }
    }

    /// Parse a wire id
    #[must_use]
    pub const fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(Self::Audio),
            1 => Some(Self::Text),
            2 => Some(Self::Control),
            _ => None,
        }
    }

    /// Whether this kind may travel on `channel`
    #[must_use]
    pub const fn allowed_on(self, channel: Channel) -> bool {
        match self {
            Self::Audio => channel.is_audio(),
            Self::Text | Self::Control => matches!(channel, Channel::Control),
        }
    }
}

/// Raw PCM chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub seq: u32,
    pub channel: Channel,
    pub pcm: Vec<u8>,
}

/// Transcript or reply text mirrored to the terminal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextFrame {
    pub seq: u32,
    pub text: String,
    pub is_final: bool,
}

/// Control command; `kind` is the wire `type` field
#[derive(Debug, Clone, PartialEq)]
pub struct ControlCmd {
    pub seq: u32,
    pub kind: String,
    pub value: Value,
}

impl ControlCmd {
    /// Build a command with seq 0; the frame writer assigns the real seq
    #[must_use]
    pub fn new(kind: &str, value: Value) -> Self {
        Self {
            seq: 0,
            kind: kind.to_string(),
            value,
        }
    }

    /// Action dispatch for the terminal
    #[must_use]
    pub fn action(command: &ActionCommand) -> Self {
        Self::new(control::ACTION, command.to_value())
    }

    /// Turn failure notice
    #[must_use]
    pub fn error(code: &str, message: &str) -> Self {
        Self::new(
            control::ERROR,
            serde_json::json!({ "code": code, "message": message }),
        )
    }

    #[must_use]
    pub fn ping() -> Self {
        Self::new(control::PING, Value::Null)
    }

    #[must_use]
    pub fn pong() -> Self {
        Self::new(control::PONG, Value::Null)
    }

    #[must_use]
    pub fn stop() -> Self {
        Self::new(control::STOP, Value::Null)
    }

    /// Whether the command has the given wire type
    #[must_use]
    pub fn is(&self, kind: &str) -> bool {
        self.kind == kind
    }
}

/// Unit of wire transfer
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Audio(AudioFrame),
    Text(TextFrame),
    Control(ControlCmd),
}

impl Frame {
    /// Outbound audio with seq 0
    #[must_use]
    pub fn audio(channel: Channel, pcm: Vec<u8>) -> Self {
        Self::Audio(AudioFrame {
            seq: 0,
            channel,
            pcm,
        })
    }

    /// Text mirror with seq 0
    #[must_use]
    pub fn text(text: String, is_final: bool) -> Self {
        Self::Text(TextFrame {
            seq: 0,
            text,
            is_final,
        })
    }

    /// Channel this frame travels on
    #[must_use]
    pub const fn channel(&self) -> Channel {
        match self {
            Self::Audio(a) => a.channel,
            Self::Text(_) | Self::Control(_) => Channel::Control,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> FrameKind {
        match self {
            Self::Audio(_) => FrameKind::Audio,
            Self::Text(_) => FrameKind::Text,
            Self::Control(_) => FrameKind::Control,
        }
    }

    #[must_use]
    pub const fn seq(&self) -> u32 {
        match self {
            Self::Audio(a) => a.seq,
            Self::Text(t) => t.seq,
            Self::Control(c) => c.seq,
        }
    }

    /// Overwrite the sequence number
    pub const fn set_seq(&mut self, seq: u32) {
        match self {
            Self::Audio(a) => a.seq = seq,
            Self::Text(t) => t.seq = seq,
            Self::Control(c) => c.seq = seq,
        }
    }
}
