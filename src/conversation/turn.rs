//! Turns and the rolling exchange history

use std::collections::VecDeque;

use serde::Serialize;

use crate::action::ActionCommand;
use crate::engine::Exchange;

/// Session-local turn identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TurnId(pub u64);

impl std::fmt::Display for TurnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "turn-{}", self.0)
    }
}

/// How a turn ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Active,
    Completed,
    /// Replaced by barge-in or torn down with the session
    Cancelled,
    /// No command followed the wake phrase before the deadline
    Abandoned,
    /// An engine failed
    Failed(String),
}

/// One wake-to-reply cycle
#[derive(Debug, Clone, Serialize)]
pub struct Turn {
    pub id: TurnId,
    pub transcript: String,
    pub reply: String,
    pub actions: Vec<ActionCommand>,
    pub status: TurnStatus,
}

impl Turn {
    #[must_use]
    pub const fn new(id: TurnId) -> Self {
        Self {
            id,
            transcript: String::new(),
            reply: String::new(),
            actions: Vec::new(),
            status: TurnStatus::Active,
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == TurnStatus::Active
    }
}

/// Bounded window of completed exchanges; the oldest drops first
#[derive(Debug, Clone)]
pub struct History {
    exchanges: VecDeque<Exchange>,
    limit: usize,
}

impl History {
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            exchanges: VecDeque::with_capacity(limit),
            limit,
        }
    }

    /// Append a completed exchange
    pub fn push(&mut self, exchange: Exchange) {
        if self.limit == 0 {
            return;
        }
        while self.exchanges.len() >= self.limit {
            self.exchanges.pop_front();
        }
        self.exchanges.push_back(exchange);
    }

    /// Snapshot for a generation request, oldest first
    #[must_use]
    pub fn snapshot(&self) -> Vec<Exchange> {
        self.exchanges.iter().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.exchanges.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty()
    }
}
