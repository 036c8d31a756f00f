//! Terminal side of the link
//!
//! Audio I/O stand-ins for the car's microphone and speaker, and the motion
//! executor that turns actions into motor commands.

mod audio;
mod motion;

pub use audio::{AudioSink, AudioSource, RecordingSink, ScriptSource, WavFileSource};
pub use motion::{
    LoggingDriver, Motion, MotionExecutor, MotorCommand, MotorDriver, QUARTER_TURN_DURATION,
    STEP_DURATION,
};
