//! Session state machine

use serde::Serialize;

/// Conversation state of one session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Connected, no audio consumed yet
    #[default]
    Idle,
    /// Hearing audio, waiting for the wake phrase
    Listening,
    /// Wake phrase heard, accumulating the command
    Triggered,
    /// Reply being generated
    Generating,
    /// Reply audio being produced
    Speaking,
    /// Session is shutting down
    Closing,
}

impl SessionState {
    /// Wire name used in `state` control commands
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Triggered => "triggered",
            Self::Generating => "generating",
            Self::Speaking => "speaking",
            Self::Closing => "closing",
        }
    }

    /// Parse a wire name
    #[must_use]
    pub fn from_wire(name: &str) -> Option<Self> {
        [
            Self::Idle,
            Self::Listening,
            Self::Triggered,
            Self::Generating,
            Self::Speaking,
            Self::Closing,
        ]
        .into_iter()
        .find(|s| s.as_str() == name)
    }

    /// Whether a turn exists in this state
    #[must_use]
    pub const fn has_turn(self) -> bool {
        matches!(self, Self::Triggered | Self::Generating | Self::Speaking)
    }

    /// Whether the controller may move from `self` to `next`
    ///
    /// `Closing` is reachable from anywhere and left for nothing. A wake
    /// phrase re-enters `Triggered` from any turn state (barge-in). Turn
    /// failures and abandoned turns fall back to `Listening`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use SessionState::{Closing, Generating, Idle, Listening, Speaking, Triggered};

        match (self, next) {
            (Closing, _) => false,
            (_, Closing)
            | (Idle, Listening | Triggered)
            | (Listening | Triggered | Generating | Speaking, Triggered)
            | (Triggered, Generating | Listening)
            | (Generating, Speaking | Listening)
            | (Speaking, Listening) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_is_allowed() {
        let path = [
            SessionState::Idle,
            SessionState::Listening,
            SessionState::Triggered,
            SessionState::Generating,
            SessionState::Speaking,
            SessionState::Listening,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn barge_in_and_closing() {
        assert!(SessionState::Speaking.can_transition_to(SessionState::Triggered));
        assert!(SessionState::Generating.can_transition_to(SessionState::Triggered));
        assert!(SessionState::Idle.can_transition_to(SessionState::Closing));
        assert!(!SessionState::Closing.can_transition_to(SessionState::Listening));
    }

    #[test]
    fn skipping_stages_is_rejected() {
        assert!(!SessionState::Listening.can_transition_to(SessionState::Speaking));
        assert!(!SessionState::Idle.can_transition_to(SessionState::Generating));
        assert!(!SessionState::Speaking.can_transition_to(SessionState::Idle));
    }

    #[test]
    fn wire_names() {
        assert_eq!(SessionState::Generating.as_str(), "generating");
        assert_eq!(SessionState::from_wire("speaking"), Some(SessionState::Speaking));
        assert_eq!(SessionState::from_wire("dancing"), None);
        assert_eq!(
            serde_json::to_value(SessionState::Speaking).unwrap(),
            serde_json::json!("speaking")
        );
        assert!(SessionState::Triggered.has_turn());
        assert!(!SessionState::Listening.has_turn());
    }
}
