//! podbridge
//!
//! Bridges a thin client (a browser WebSocket, or an in-process pipe) to a
//! live command-execution stream inside a remote container. The crate owns
//! the session abstraction, the control-message framing protocol, keepalive
//! discipline, and the exactly-once lifecycle teardown that keeps the
//! bridge from deadlocking or leaking tasks when either side fails.
//!
//! The remote transports themselves are external capabilities: the
//! embedding platform supplies them through the [`exec::RemoteExec`] and
//! [`exec::LogStreamer`] traits, together with a [`exec::PodInspector`]
//! for target validation.

pub mod copy;
pub mod exec;
pub mod server;
pub mod terminal;
