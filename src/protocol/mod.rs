//! Wire protocol between terminal and server
//!
//! Three logical channels (`audio/in`, `audio/out`, `control`) share one
//! WebSocket connection. Every binary message carries exactly one frame.

mod codec;
mod frame;
mod sequence;

pub use codec::{DecodeError, decode, encode};
pub use frame::{
    AudioFrame, Channel, ControlCmd, Frame, FrameKind, HEADER_LEN, MAX_PAYLOAD, PROTOCOL_VERSION,
    TextFrame, control,
};
pub use sequence::{SeqCheck, SeqCounter, SeqTracker};
