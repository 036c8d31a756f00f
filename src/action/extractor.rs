//! Incremental action marker scanner

use super::ActionCommand;

/// Marker opening recognised by default
pub const DEFAULT_ACTION_PREFIX: &str = "[ACTION:";

/// Longest partial marker held back before it is released as plain text
pub const DEFAULT_MAX_PENDING: usize = 128;

/// Output of one [`ActionExtractor::feed`] call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extracted {
    /// Text with complete markers removed
    pub clean: String,
    /// Commands completed by this chunk, in order of appearance
    pub actions: Vec<ActionCommand>,
}

/// Streaming scanner that removes `[ACTION:name(args)]` markers from text
///
/// A marker split across chunks is held back until its closing bracket
/// arrives. Anything that fails to parse is released verbatim.
#[derive(Debug)]
pub struct ActionExtractor {
    prefix: String,
    max_pending: usize,
    pending: String,
}

impl Default for ActionExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_ACTION_PREFIX, DEFAULT_MAX_PENDING)
    }
}

impl ActionExtractor {
    /// Create an extractor; an empty prefix falls back to the default
    #[must_use]
    pub fn new(prefix: &str, max_pending: usize) -> Self {
        let prefix = if prefix.is_empty() {
            DEFAULT_ACTION_PREFIX
        } else {
            prefix
        };
        Self {
            prefix: prefix.to_string(),
            max_pending: max_pending.max(prefix.chars().count()),
            pending: String::new(),
        }
    }

    /// Scan the next chunk of generated text
    pub fn feed(&mut self, chunk: &str) -> Extracted {
        let mut text = std::mem::take(&mut self.pending);
        text.push_str(chunk);

        let mut out = Extracted::default();
        let mut rest = text.as_str();
        let Some(opener) = self.prefix.chars().next() else {
            out.clean = text;
            return out;
        };

        while let Some(start) = rest.find(opener) {
            out.clean.push_str(&rest[..start]);
            rest = &rest[start..];

            if !rest.starts_with(self.prefix.as_str()) {
                if self.prefix.starts_with(rest) {
                    // Possible marker cut at the chunk boundary
                    self.pending = rest.to_string();
                    return out;
                }
                out.clean.push(opener);
                rest = &rest[opener.len_utf8()..];
                continue;
            }

            let body = &rest[self.prefix.len()..];
            match body.find([']', opener]) {
                Some(end) if body[end..].starts_with(']') => {
                    let marker = &rest[..self.prefix.len() + end + 1];
                    if let Some(command) = ActionCommand::parse(&body[..end]) {
                        tracing::debug!(action = %command, "action extracted");
                        out.actions.push(command);
                    } else {
                        tracing::warn!(marker, "malformed action marker kept as text");
                        out.clean.push_str(marker);
                    }
                    rest = &rest[marker.len()..];
                }
                Some(end) => {
                    // A new opener interrupts this marker
                    let abandoned = &rest[..self.prefix.len() + end];
                    tracing::warn!(marker = abandoned, "unterminated action marker kept as text");
                    out.clean.push_str(abandoned);
                    rest = &rest[abandoned.len()..];
                }
                None => {
                    if rest.chars().count() > self.max_pending {
                        tracing::warn!(
                            len = rest.chars().count(),
                            "action marker exceeded buffer, flushed as text"
                        );
                        out.clean.push_str(rest);
                    } else {
                        self.pending = rest.to_string();
                    }
                    return out;
                }
            }
        }

        out.clean.push_str(rest);
        out
    }

    /// Release any held-back partial marker at end of stream
    pub fn finish(&mut self) -> String {
        let pending = std::mem::take(&mut self.pending);
        if !pending.is_empty() {
            tracing::debug!(pending = %pending, "flushing partial action marker");
        }
        pending
    }

    /// Whether a partial marker is currently held back
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}
