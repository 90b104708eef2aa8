//! Terminal session module
//!
//! The session abstraction that carries stdin/stdout/stderr and terminal
//! resize events between a client transport and a remote command-execution
//! channel, the control-message codec the WebSocket transport speaks, and
//! the write-only log sink for streaming container logs.

mod handler;
mod logs;
mod pipe;
mod protocol;
mod websocket;

pub use handler::{PtyHandler, SizeQueue, TerminalSize};
pub use logs::{LogSink, WsLogSession};
pub use pipe::{IoStreams, PipeReader, PipeSession, PipeWriter};
pub use protocol::{
    ControlMessage, Operation, ProtocolError, END_OF_TRANSMISSION, MAX_MESSAGE_SIZE, PING_PERIOD,
    PONG_WAIT, WRITE_WAIT,
};
pub use websocket::{KeepaliveConfig, WsSession};
