//! Length-prefixed binary frame codec
//!
//! Layout (big-endian):
//!
//! ```text
//! ┌─────────┬─────────┬──────────┬──────┬────────────┬─────────────┐
//! │ version │ channel │   seq    │ kind │   length   │   payload   │
//! │   u8    │   u8    │   u32    │  u8  │    u32     │ length bytes│
//! └─────────┴─────────┴──────────┴──────┴────────────┴─────────────┘
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::frame::{
    AudioFrame, Channel, ControlCmd, Frame, FrameKind, HEADER_LEN, MAX_PAYLOAD, PROTOCOL_VERSION,
    TextFrame,
};

/// Why a frame could not be decoded
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Truncated, oversized or otherwise unparseable frame
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// Peer speaks a different protocol version
    #[error("unsupported protocol version {0}")]
    UnknownVersion(u8),

    /// Channel id outside the known set
    #[error("unknown channel id {0}")]
    UnknownChannel(u8),
}

impl DecodeError {
    /// Version mismatch is unrecoverable; everything else drops one frame
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::UnknownVersion(_))
    }
}

/// JSON body of a control payload
#[derive(Serialize, Deserialize)]
struct ControlBody {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    value: Value,
}

/// Encode a frame into its wire form
#[must_use]
pub fn encode(frame: &Frame) -> Vec<u8> {
    let payload = match frame {
        Frame::Audio(a) => a.pcm.clone(),
        Frame::Text(t) => {
            let mut p = Vec::with_capacity(1 + t.text.len());
            p.push(u8::from(t.is_final));
            p.extend_from_slice(t.text.as_bytes());
            p
        }
        Frame::Control(c) => serde_json::json!({ "type": c.kind, "value": c.value })
            .to_string()
            .into_bytes(),
    };

    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(PROTOCOL_VERSION);
    out.push(frame.channel().id());
    out.extend_from_slice(&frame.seq().to_be_bytes());
    out.push(frame.kind().id());
    #[allow(clippy::cast_possible_truncation)]
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&payload);
    out
}

/// Decode one wire frame
///
/// # Errors
///
/// Returns [`DecodeError`] for any frame that does not match the layout
pub fn decode(bytes: &[u8]) -> Result<Frame, DecodeError> {
    if bytes.len() < HEADER_LEN {
        return Err(DecodeError::Malformed(format!(
            "header truncated: {} of {HEADER_LEN} bytes",
            bytes.len()
        )));
    }

    let version = bytes[0];
    if version != PROTOCOL_VERSION {
        return Err(DecodeError::UnknownVersion(version));
    }

    let channel = Channel::from_id(bytes[1]).ok_or(DecodeError::UnknownChannel(bytes[1]))?;
    let seq = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
    let kind = FrameKind::from_id(bytes[6])
        .ok_or_else(|| DecodeError::Malformed(format!("unknown kind id {}", bytes[6])))?;
    let length = u32::from_be_bytes([bytes[7], bytes[8], bytes[9], bytes[10]]) as usize;

    if length > MAX_PAYLOAD {
        return Err(DecodeError::Malformed(format!(
            "payload of {length} bytes exceeds {MAX_PAYLOAD}"
        )));
    }

    let payload = &bytes[HEADER_LEN..];
    if payload.len() != length {
        return Err(DecodeError::Malformed(format!(
            "declared {length} payload bytes, got {}",
            payload.len()
        )));
    }

    if !kind.allowed_on(channel) {
        return Err(DecodeError::Malformed(format!(
            "{kind:?} payload not allowed on {channel}"
        )));
    }

    match kind {
        FrameKind::Audio => Ok(Frame::Audio(AudioFrame {
            seq,
            channel,
            pcm: payload.to_vec(),
        })),
        FrameKind::Text => {
            let (flag, text) = payload
                .split_first()
                .ok_or_else(|| DecodeError::Malformed("empty text payload".to_string()))?;
            let text = std::str::from_utf8(text)
                .map_err(|e| DecodeError::Malformed(format!("text is not utf-8: {e}")))?;
            Ok(Frame::Text(TextFrame {
                seq,
                text: text.to_string(),
                is_final: *flag != 0,
            }))
        }
        FrameKind::Control => {
            let body: ControlBody = serde_json::from_slice(payload)
                .map_err(|e| DecodeError::Malformed(format!("control body: {e}")))?;
            Ok(Frame::Control(ControlCmd {
                seq,
                kind: body.kind,
                value: body.value,
            }))
        }
    }
}
