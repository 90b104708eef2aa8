//! Log streaming session
//!
//! A write-only WebSocket session for container log output. Unlike the
//! terminal session there is no control-message framing: each chunk of log
//! bytes becomes one raw text frame. Nothing is read from the peer; a
//! client that goes away is detected by the next failed write.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;
use uuid::Uuid;

use super::protocol::WRITE_WAIT;

/// Where streamed log output goes. `write` delivers one chunk; `close` ends
/// the stream and is idempotent.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn write(&self, data: &[u8]) -> io::Result<usize>;
    async fn close(&self);
}

/// A log sink over one WebSocket connection.
pub struct WsLogSession<S> {
    id: Uuid,
    ws: Mutex<WebSocketStream<S>>,
    closed: AtomicBool,
    write_wait: Duration,
}

impl<S> WsLogSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Create a session over an already-upgraded connection.
    pub fn new(ws: WebSocketStream<S>) -> Self {
        Self {
            id: Uuid::new_v4(),
            ws: Mutex::new(ws),
            closed: AtomicBool::new(false),
            write_wait: WRITE_WAIT,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }
}

#[async_trait]
impl<S> LogSink for WsLogSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn write(&self, data: &[u8]) -> io::Result<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "log session closed",
            ));
        }
        // a chunk may split a multi-byte character; replace, never reject
        let text = String::from_utf8_lossy(data).into_owned();
        let mut ws = self.ws.lock().await;
        match timeout(self.write_wait, ws.send(Message::Text(text))).await {
            Ok(Ok(())) => Ok(data.len()),
            Ok(Err(e)) => {
                debug!("log session {}: write failed: {}", self.id, e);
                Err(io::Error::new(io::ErrorKind::BrokenPipe, e))
            }
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "write deadline exceeded",
            )),
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("log session {}: closed", self.id);
        let mut ws = self.ws.lock().await;
        if let Ok(Err(e)) = timeout(self.write_wait, ws.close(None)).await {
            debug!("log session {}: close failed: {}", self.id, e);
        }
    }
}
