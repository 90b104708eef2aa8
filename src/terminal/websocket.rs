//! WebSocket session
//!
//! Implements `PtyHandler` over a WebSocket connection: inbound control
//! frames become stdin bytes or resize events, remote output goes back out
//! as `stdout` control frames, and a keepalive task pings the peer on a
//! fixed period. A peer that stops answering is reclaimed by the read
//! deadline, not by ping failures.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::handler::{PtyHandler, SizeQueue, TerminalSize};
use super::protocol::{
    ControlMessage, Operation, END_OF_TRANSMISSION, PING_PERIOD, PONG_WAIT, WRITE_WAIT,
};

/// Keepalive and deadline configuration. The defaults are the protocol
/// constants; tests shrink them to milliseconds.
#[derive(Debug, Clone, Copy)]
pub struct KeepaliveConfig {
    /// Deadline for a single outbound frame.
    pub write_wait: Duration,
    /// How long the read path waits for any inbound frame before declaring
    /// the peer dead. Pongs count, so a live-but-quiet peer stays open.
    pub pong_wait: Duration,
    /// Ping interval. Must be less than `pong_wait`.
    pub ping_period: Duration,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            write_wait: WRITE_WAIT,
            pong_wait: PONG_WAIT,
            ping_period: PING_PERIOD,
        }
    }
}

type WsSink<S> = SplitSink<WebSocketStream<S>, Message>;

struct ReadHalf<S> {
    source: SplitStream<WebSocketStream<S>>,
    /// Error stashed by a failed read; surfaced on the call after the
    /// end-of-transmission byte has been delivered.
    pending: Option<io::Error>,
}

/// A terminal session over one WebSocket connection.
///
/// Generic over the underlying byte stream so tests can drive it over
/// in-memory pipes. The sink half lives behind a mutex: stdout, stderr and
/// the keepalive ping all write through it one at a time, so frames are
/// never interleaved on the wire.
pub struct WsSession<S> {
    id: Uuid,
    read_half: Mutex<ReadHalf<S>>,
    sink: Arc<Mutex<WsSink<S>>>,
    size_queue: SizeQueue,
    cancel: CancellationToken,
    closed: AtomicBool,
    tty: bool,
    timing: KeepaliveConfig,
}

impl<S> WsSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Create a session over an already-upgraded connection and start its
    /// keepalive task. Must be called from within a tokio runtime.
    pub fn new(ws: WebSocketStream<S>, tty: bool) -> Self {
        Self::with_keepalive(ws, tty, KeepaliveConfig::default())
    }

    pub fn with_keepalive(ws: WebSocketStream<S>, tty: bool, timing: KeepaliveConfig) -> Self {
        let (sink, source) = ws.split();
        let sink = Arc::new(Mutex::new(sink));
        let cancel = CancellationToken::new();
        let id = Uuid::new_v4();

        spawn_keepalive(id, Arc::clone(&sink), cancel.clone(), timing);

        Self {
            id,
            read_half: Mutex::new(ReadHalf {
                source,
                pending: None,
            }),
            sink,
            size_queue: SizeQueue::new(),
            cancel,
            closed: AtomicBool::new(false),
            tty,
            timing,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Deliver the end-of-transmission byte and stash `err` for the next
    /// read call. The remote process observes EOF-like termination; the
    /// caller observes the failure immediately after.
    fn fail_read(&self, half: &mut ReadHalf<S>, buf: &mut [u8], err: io::Error) -> usize {
        warn!("session {}: read failed: {}", self.id, err);
        let eot = END_OF_TRANSMISSION.as_bytes();
        let n = eot.len().min(buf.len());
        buf[..n].copy_from_slice(&eot[..n]);
        half.pending = Some(err);
        n
    }

    async fn send_frame(&self, data: &[u8]) -> io::Result<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "session closed"));
        }
        let text = ControlMessage::stdout(String::from_utf8_lossy(data).into_owned())
            .to_json()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let mut sink = self.sink.lock().await;
        match timeout(self.timing.write_wait, sink.send(Message::Text(text))).await {
            Ok(Ok(())) => Ok(data.len()),
            Ok(Err(e)) => {
                warn!("session {}: write failed: {}", self.id, e);
                Err(io::Error::new(io::ErrorKind::BrokenPipe, e))
            }
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "write deadline exceeded",
            )),
        }
    }
}

#[async_trait]
impl<S> PtyHandler for WsSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn stdin_attached(&self) -> bool {
        true
    }

    fn stdout_attached(&self) -> bool {
        true
    }

    fn stderr_attached(&self) -> bool {
        true
    }

    fn tty(&self) -> bool {
        self.tty
    }

    async fn read_stdin(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut half = self.read_half.lock().await;
        if let Some(err) = half.pending.take() {
            return Err(err);
        }

        loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(io::Error::new(io::ErrorKind::BrokenPipe, "session closed"));
                }
                res = timeout(self.timing.pong_wait, half.source.next()) => res,
            };

            let msg = match frame {
                // No frame within pong_wait: the peer vanished without a
                // close frame. This, not ping failure, reclaims the session.
                Err(_) => {
                    let err = io::Error::new(io::ErrorKind::TimedOut, "read deadline exceeded");
                    return Ok(self.fail_read(&mut half, buf, err));
                }
                Ok(None) => {
                    let err =
                        io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by peer");
                    return Ok(self.fail_read(&mut half, buf, err));
                }
                Ok(Some(Err(e))) => {
                    let err = io::Error::new(io::ErrorKind::Other, e);
                    return Ok(self.fail_read(&mut half, buf, err));
                }
                Ok(Some(Ok(msg))) => msg,
            };

            let text = match msg {
                Message::Text(text) => text,
                Message::Binary(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(e) => {
                        let err = io::Error::new(io::ErrorKind::InvalidData, e);
                        return Ok(self.fail_read(&mut half, buf, err));
                    }
                },
                // Transport-level keepalive traffic; any frame re-arms the
                // read deadline on the next loop iteration.
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
                Message::Close(_) => {
                    let err =
                        io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed connection");
                    return Ok(self.fail_read(&mut half, buf, err));
                }
            };

            let control = match ControlMessage::from_json(&text) {
                Ok(control) => control,
                Err(e) => {
                    let err = io::Error::new(io::ErrorKind::InvalidData, e);
                    return Ok(self.fail_read(&mut half, buf, err));
                }
            };

            match control.operation {
                Operation::Stdin => {
                    let data = control.data.as_bytes();
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    return Ok(n);
                }
                Operation::Resize => {
                    // Handed off before this read returns, so the size is
                    // visible to the consumer ahead of any later stdin.
                    self.size_queue
                        .push(TerminalSize::new(control.cols, control.rows))
                        .await;
                    return Ok(0);
                }
                // Client-level keepalive, not input.
                Operation::Ping => return Ok(0),
                Operation::Stdout => {
                    let err = io::Error::new(
                        io::ErrorKind::InvalidData,
                        "unexpected stdout operation from peer",
                    );
                    return Ok(self.fail_read(&mut half, buf, err));
                }
            }
        }
    }

    async fn write_stdout(&self, data: &[u8]) -> io::Result<usize> {
        self.send_frame(data).await
    }

    // The wire protocol has no stderr operation; with a TTY the remote side
    // folds stderr into stdout anyway.
    async fn write_stderr(&self, data: &[u8]) -> io::Result<usize> {
        self.send_frame(data).await
    }

    async fn next_size(&self) -> Option<TerminalSize> {
        self.size_queue.next().await
    }

    async fn done(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("session {}: done", self.id);
        self.size_queue.close();
        self.cancel.cancel();

        let mut sink = self.sink.lock().await;
        if let Ok(Err(e)) = timeout(self.timing.write_wait, sink.send(Message::Close(None))).await {
            debug!("session {}: close frame failed: {}", self.id, e);
        }
        let _ = timeout(self.timing.write_wait, sink.close()).await;
    }
}

/// Ping the peer on a fixed period until the session is cancelled. A failed
/// ping is logged, not fatal; the read deadline is what ends a dead session.
fn spawn_keepalive<S>(
    id: Uuid,
    sink: Arc<Mutex<WsSink<S>>>,
    cancel: CancellationToken,
    timing: KeepaliveConfig,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(timing.ping_period);
        // the first tick fires immediately; skip it
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("session {}: keepalive stopped", id);
                    return;
                }
                _ = ticker.tick() => {
                    let mut sink = sink.lock().await;
                    match timeout(timing.write_wait, sink.send(Message::Ping(Vec::new()))).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!("session {}: ping failed: {}", id, e),
                        Err(_) => warn!("session {}: ping timed out", id),
                    }
                }
            }
        }
    });
}
