//! Connection management
//!
//! Server side: one session per accepted WebSocket plus a registry of live
//! sessions. Terminal side: a single logical connection with heartbeat,
//! watchdog and reconnect-with-backoff.

mod backoff;
mod client;
mod registry;
mod server;
mod transport;

pub use backoff::ReconnectPolicy;
pub use client::{ConnectionEnd, Connector, FramePair, Terminal, WsConnector};
pub use registry::{SessionInfo, SessionRegistry, SharedRegistry};
pub use server::{HealthResponse, ServerState, router, run_server, serve};
pub use transport::{
    AxumSink, AxumSource, FrameSink, FrameSource, MemoryEnd, MemorySink, MemorySource,
    TungsteniteSink, TungsteniteSource, memory_pair, split_axum, split_tungstenite,
};
