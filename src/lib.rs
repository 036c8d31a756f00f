//! PetCar Link - streaming voice conversation between a pet car and its server
//!
//! The terminal streams microphone audio over one WebSocket; the server runs
//! a conversation session per terminal that recognizes speech, waits for the
//! wake phrase, generates a reply, synthesizes it, and streams the audio back
//! while dispatching embedded action commands to the car's motors.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                      Terminal                         │
//! │   Audio source  │  Audio sink  │  Motion executor     │
//! └────────────────────────┬─────────────────────────────┘
//!                          │  audio/in · audio/out · control
//! ┌────────────────────────▼─────────────────────────────┐
//! │                   Session host                        │
//! │  Frame reader → recognition → wake gate → generation  │
//! │  → synthesis / action extraction → frame writer       │
//! └────────────────────────┬─────────────────────────────┘
//!                          │
//! ┌────────────────────────▼─────────────────────────────┐
//! │        Engines (scripted or OpenAI-compatible)        │
//! │          Recognition  │  Generation  │  Synthesis      │
//! └──────────────────────────────────────────────────────┘
//! ```

pub mod action;
pub mod config;
pub mod connection;
pub mod conversation;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod queue;
pub mod terminal;
pub mod voice;

pub use action::{ActionCommand, ActionExecutor, ActionExtractor, ArgValue, ExecutionError};
pub use config::Config;
pub use connection::{ServerState, Terminal, router, run_server, serve};
pub use conversation::{
    CloseReason, Session, SessionConfig, SessionHandle, SessionState, SessionSummary,
};
pub use engine::{EngineError, Engines};
pub use error::{Error, Result};
pub use protocol::{Channel, ControlCmd, Frame, decode, encode};
pub use queue::{BoundedQueue, OverflowPolicy, QueueError};
