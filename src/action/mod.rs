//! Action commands embedded in generated replies
//!
//! The language engine asks for motion with inline markers such as
//! `[ACTION:forward(5)]`. The extractor strips them from the spoken text and
//! the executor carries them out once the turn completes.

mod extractor;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

pub use extractor::{ActionExtractor, DEFAULT_ACTION_PREFIX, DEFAULT_MAX_PENDING, Extracted};

/// A literal argument, validated when the marker is parsed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    Int(i64),
    Decimal(f64),
    Word(String),
}

impl ArgValue {
    /// Parse one argument literal; `None` if it is not a number or bare word
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }

        if let Ok(n) = raw.parse::<i64>() {
            return Some(Self::Int(n));
        }

        let numeric = raw
            .chars()
            .all(|c| c.is_ascii_digit() || c == '.' || c == '-' || c == '+');
        if numeric {
            // An integer literal that failed the i64 parse is out of range
            if !raw.contains('.') {
                return None;
            }
            return raw
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .map(Self::Decimal);
        }

        if raw.chars().all(|c| c.is_alphanumeric() || c == '_') {
            return Some(Self::Word(raw.to_string()));
        }

        None
    }

    /// Integer view; decimals are truncated toward zero
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            Self::Decimal(f) => Some(f.trunc() as i64),
            Self::Word(_) => None,
        }
    }

    /// Floating point view
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(n) => Some(*n as f64),
            Self::Decimal(f) => Some(*f),
            Self::Word(_) => None,
        }
    }
}

impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(n) => write!(f, "{n}"),
            Self::Decimal(d) => write!(f, "{d}"),
            Self::Word(w) => f.write_str(w),
        }
    }
}

/// A structured command extracted from generated text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionCommand {
    pub name: String,
    #[serde(default)]
    pub args: Vec<ArgValue>,
}

impl ActionCommand {
    #[must_use]
    pub fn new(name: impl Into<String>, args: Vec<ArgValue>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    /// Parse the inside of a marker, e.g. `forward(5)` or `stop()`
    #[must_use]
    pub fn parse(body: &str) -> Option<Self> {
        let body = body.trim();
        let open = body.find('(')?;
        let inner = body[open + 1..].strip_suffix(')')?;

        let name = body[..open].trim();
        let valid_name = !name.is_empty()
            && name.chars().all(|c| c.is_ascii_alphabetic() || c == '_');
        if !valid_name {
            return None;
        }

        let args = if inner.trim().is_empty() {
            Vec::new()
        } else {
            inner
                .split(',')
                .map(ArgValue::parse)
                .collect::<Option<Vec<_>>>()?
        };

        Some(Self::new(name, args))
    }

    /// JSON form sent on the control channel: `{"name": .., "args": [..]}`
    #[must_use]
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({ "name": self.name, "args": self.args })
    }

    /// Parse the control channel JSON form
    ///
    /// # Errors
    ///
    /// Returns error if the value does not describe a command
    pub fn from_value(value: serde_json::Value) -> serde_json::Result<Self> {
        serde_json::from_value(value)
    }

    /// Argument at `index` as an integer
    #[must_use]
    pub fn int_arg(&self, index: usize) -> Option<i64> {
        self.args.get(index).and_then(ArgValue::as_i64)
    }
}

impl fmt::Display for ActionCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{arg}")?;
        }
        f.write_str(")")
    }
}

/// Outcome of a successful execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    /// Human readable summary for logs
    pub summary: String,
    /// How long the action keeps the actuators busy
    pub duration: Duration,
}

impl ExecutionResult {
    #[must_use]
    pub fn new(summary: impl Into<String>, duration: Duration) -> Self {
        Self {
            summary: summary.into(),
            duration,
        }
    }
}

/// Action execution failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    /// No handler for this command name
    #[error("unsupported action: {0}")]
    Unsupported(String),

    /// Arguments of the wrong type or range
    #[error("invalid arguments for {action}: {reason}")]
    InvalidArgs { action: String, reason: String },

    /// The executor is gone (session closed, driver offline)
    #[error("executor unavailable: {0}")]
    Unavailable(String),

    /// The driver reported a failure
    #[error("action failed: {0}")]
    Failed(String),
}

/// Carries out action commands
///
/// Dispatch is fire-and-forget from the conversation's point of view: the
/// outcome is logged, never awaited by the turn.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    /// Execute one command
    ///
    /// # Errors
    ///
    /// Returns [`ExecutionError`] if the command cannot be carried out
    async fn execute(&self, command: &ActionCommand) -> Result<ExecutionResult, ExecutionError>;
}

/// Run actions in arrival order, logging each outcome
///
/// Ends when every sender is dropped. Callers attach session context with
/// a tracing span.
pub async fn dispatch_actions(
    executor: Arc<dyn ActionExecutor>,
    mut actions: mpsc::UnboundedReceiver<ActionCommand>,
) {
    while let Some(command) = actions.recv().await {
        match executor.execute(&command).await {
            Ok(result) => {
                tracing::info!(action = %command, summary = %result.summary, "action executed");
            }
            Err(e) => {
                tracing::warn!(action = %command, error = %e, "action failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_integer_args() {
        let cmd = ActionCommand::parse("forward(5)").unwrap();
        assert_eq!(cmd.name, "forward");
        assert_eq!(cmd.args, vec![ArgValue::Int(5)]);
    }

    #[test]
    fn parses_mixed_args_and_empty_list() {
        let cmd = ActionCommand::parse("spin(1.5, left, -2)").unwrap();
        assert_eq!(
            cmd.args,
            vec![
                ArgValue::Decimal(1.5),
                ArgValue::Word("left".to_string()),
                ArgValue::Int(-2)
            ]
        );

        let stop = ActionCommand::parse("stop()").unwrap();
        assert!(stop.args.is_empty());
    }

    #[test]
    fn rejects_malformed_bodies() {
        assert!(ActionCommand::parse("forward 5").is_none());
        assert!(ActionCommand::parse("forward(5").is_none());
        assert!(ActionCommand::parse("(5)").is_none());
        assert!(ActionCommand::parse("go(a b)").is_none());
        assert!(ActionCommand::parse("go(1,,2)").is_none());
        assert!(ActionCommand::parse("go2(1)").is_none());
    }

    #[test]
    fn out_of_range_integers_are_rejected() {
        assert_eq!(ArgValue::parse("99999999999999999999"), None);
        assert_eq!(ArgValue::parse("-99999999999999999999"), None);
        assert_eq!(ArgValue::parse("9223372036854775807"), Some(ArgValue::Int(i64::MAX)));
        assert_eq!(ArgValue::parse("2.5"), Some(ArgValue::Decimal(2.5)));
        assert!(ActionCommand::parse("forward(99999999999999999999)").is_none());
    }

    #[test]
    fn json_form_matches_control_payload() {
        let cmd = ActionCommand::new("forward", vec![ArgValue::Int(5)]);
        assert_eq!(
            cmd.to_value(),
            serde_json::json!({ "name": "forward", "args": [5] })
        );
        assert_eq!(ActionCommand::from_value(cmd.to_value()).unwrap(), cmd);
    }

    #[test]
    fn display_round_trips_marker_body() {
        let cmd = ActionCommand::parse("turn_left(90)").unwrap();
        assert_eq!(cmd.to_string(), "turn_left(90)");
    }
}
