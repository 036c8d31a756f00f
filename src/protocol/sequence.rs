//! Per-channel sequence numbering
//!
//! The sender numbers frames independently per channel starting at 0. The
//! receiver accepts a frame only when its seq is greater than the last seq
//! it accepted on that channel; gaps are counted but still accepted.

use super::frame::Channel;

/// Outbound sequence counters, owned by the single frame writer
///
/// Each channel can number `u32::MAX + 1` frames. After that `next` returns
/// `None` and the connection has to be replaced.
#[derive(Debug, Default)]
pub struct SeqCounter {
    issued: [u64; 3],
}

impl SeqCounter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter whose next number on every channel is `seq`
    #[must_use]
    pub fn starting_at(seq: u32) -> Self {
        Self {
            issued: [u64::from(seq); 3],
        }
    }

    /// Take the next sequence number for `channel`, `None` once exhausted
    pub fn next(&mut self, channel: Channel) -> Option<u32> {
        let slot = &mut self.issued[channel.index()];
        let seq = u32::try_from(*slot).ok()?;
        *slot += 1;
        Some(seq)
    }

    /// Frames numbered so far on `channel`
    #[must_use]
    pub const fn issued(&self, channel: Channel) -> u64 {
        self.issued[channel.index()]
    }
}

/// Outcome of checking an inbound seq
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqCheck {
    /// In order
    Accepted,
    /// Accepted, but frames between `expected` and `got` never arrived
    Gap { expected: u32, got: u32 },
    /// Duplicate or reordered; the frame must be dropped
    Rejected { last: u32 },
}

impl SeqCheck {
    #[must_use]
    pub const fn is_accepted(self) -> bool {
        !matches!(self, Self::Rejected { .. })
    }
}

/// Inbound sequence validation with running statistics
#[derive(Debug, Default)]
pub struct SeqTracker {
    last: [Option<u32>; 3],
    gaps: [u64; 3],
    rejected: [u64; 3],
}

impl SeqTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate `seq` on `channel`, recording it when accepted
    pub fn check(&mut self, channel: Channel, seq: u32) -> SeqCheck {
        let i = channel.index();
        let result = match self.last[i] {
            Some(last) if seq <= last => SeqCheck::Rejected { last },
            Some(last) if seq > last.saturating_add(1) => SeqCheck::Gap {
                expected: last + 1,
                got: seq,
            },
            None if seq > 0 => SeqCheck::Gap {
                expected: 0,
                got: seq,
            },
            _ => SeqCheck::Accepted,
        };

        match result {
            SeqCheck::Rejected { .. } => self.rejected[i] += 1,
            SeqCheck::Gap { .. } => {
                self.gaps[i] += 1;
                self.last[i] = Some(seq);
            }
            SeqCheck::Accepted => self.last[i] = Some(seq),
        }

        result
    }

    /// Last accepted seq on `channel`
    #[must_use]
    pub const fn last(&self, channel: Channel) -> Option<u32> {
        self.last[channel.index()]
    }

    /// Number of gaps seen on `channel`
    #[must_use]
    pub const fn gaps(&self, channel: Channel) -> u64 {
        self.gaps[channel.index()]
    }

    /// Number of duplicate or reordered frames dropped on `channel`
    #[must_use]
    pub const fn rejected(&self, channel: Channel) -> u64 {
        self.rejected[channel.index()]
    }
}
