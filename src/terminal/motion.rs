//! Motion executor for the car's motors
//!
//! Turns action commands into timed motor commands: half a second per step
//! and 0.8 s per 90 degrees of turn.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::action::{ActionCommand, ActionExecutor, ExecutionError, ExecutionResult};

/// Drive time per step
pub const STEP_DURATION: Duration = Duration::from_millis(500);

/// Turn time per 90 degrees
pub const QUARTER_TURN_DURATION: Duration = Duration::from_millis(800);

const DEFAULT_STEPS: f64 = 1.0;
const DEFAULT_DEGREES: f64 = 90.0;
const QUARTER_TURN_DEGREES: f64 = 90.0;

/// Motor movement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Motion {
    Forward,
    Backward,
    TurnLeft,
    TurnRight,
    Stop,
}

impl Motion {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Forward => "forward",
            Self::Backward => "backward",
            Self::TurnLeft => "turn_left",
            Self::TurnRight => "turn_right",
            Self::Stop => "stop",
        }
    }
}

impl std::fmt::Display for Motion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One timed movement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotorCommand {
    pub motion: Motion,
    pub duration: Duration,
}

impl MotorCommand {
    /// Build the motor command for an action
    ///
    /// # Errors
    ///
    /// Returns [`ExecutionError::Unsupported`] for unknown names and
    /// [`ExecutionError::InvalidArgs`] for non-numeric, non-positive or
    /// unrepresentably large amounts
    pub fn from_action(command: &ActionCommand) -> Result<Self, ExecutionError> {
        // (motion, time per unit, amount per unit, default amount)
        let (motion, per_unit, unit, default) = match command.name.as_str() {
            "forward" => (Motion::Forward, STEP_DURATION, 1.0, DEFAULT_STEPS),
            "backward" => (Motion::Backward, STEP_DURATION, 1.0, DEFAULT_STEPS),
            "turn_left" => (Motion::TurnLeft, QUARTER_TURN_DURATION, QUARTER_TURN_DEGREES, DEFAULT_DEGREES),
            "turn_right" => (Motion::TurnRight, QUARTER_TURN_DURATION, QUARTER_TURN_DEGREES, DEFAULT_DEGREES),
            "stop" => {
                return Ok(Self {
                    motion: Motion::Stop,
                    duration: Duration::ZERO,
                });
            }
            other => return Err(ExecutionError::Unsupported(other.to_string())),
        };

        let amount = match command.args.first() {
            None => default,
            Some(arg) => arg
                .as_f64()
                .ok_or_else(|| invalid(command, "expected a number"))?,
        };
        if amount <= 0.0 {
            return Err(invalid(command, "amount must be positive"));
        }

        let duration = Duration::try_from_secs_f64(per_unit.as_secs_f64() * amount / unit)
            .map_err(|_| invalid(command, "amount too large"))?;
        Ok(Self { motion, duration })
    }
}

fn invalid(command: &ActionCommand, reason: &str) -> ExecutionError {
    ExecutionError::InvalidArgs {
        action: command.name.clone(),
        reason: reason.to_string(),
    }
}

/// Motor hardware
#[async_trait]
pub trait MotorDriver: Send + Sync {
    /// Run one command to completion
    ///
    /// # Errors
    ///
    /// Returns error if the motors reject the command
    async fn drive(&self, command: MotorCommand) -> Result<(), ExecutionError>;
}

/// Executes actions on a [`MotorDriver`]
pub struct MotionExecutor<D> {
    driver: D,
}

impl<D: MotorDriver> MotionExecutor<D> {
    #[must_use]
    pub const fn new(driver: D) -> Self {
        Self { driver }
    }

    #[must_use]
    pub const fn driver(&self) -> &D {
        &self.driver
    }
}

#[async_trait]
impl<D: MotorDriver> ActionExecutor for MotionExecutor<D> {
    async fn execute(&self, command: &ActionCommand) -> Result<ExecutionResult, ExecutionError> {
        let motor = MotorCommand::from_action(command)?;
        self.driver.drive(motor).await?;

        Ok(ExecutionResult::new(
            format!("{} for {:?}", motor.motion, motor.duration),
            motor.duration,
        ))
    }
}

/// Driver that logs movements and waits out their duration
#[derive(Debug, Default)]
pub struct LoggingDriver {
    history: Mutex<Vec<MotorCommand>>,
}

impl LoggingDriver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands driven so far
    #[must_use]
    pub fn history(&self) -> Vec<MotorCommand> {
        self.history
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl MotorDriver for LoggingDriver {
    async fn drive(&self, command: MotorCommand) -> Result<(), ExecutionError> {
        tracing::info!(motion = %command.motion, duration = ?command.duration, "motors on");
        self.history
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(command);

        tokio::time::sleep(command.duration).await;
        tracing::debug!(motion = %command.motion, "motors off");
        Ok(())
    }
}
