//! Session abstraction
//!
//! `PtyHandler` is the capability set the remote command channel expects
//! from a session: which streams to attach, whether to allocate a TTY, and
//! a single-slot queue of terminal resize events. The WebSocket and pipe
//! sessions both implement it; the session driver and the executor code
//! against the trait only.

use std::io;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// Terminal geometry reported by the client and consumed by the remote
/// command channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TerminalSize {
    pub width: u16,
    pub height: u16,
}

impl TerminalSize {
    pub fn new(width: u16, height: u16) -> Self {
        Self { width, height }
    }
}

/// What the remote command channel expects from a session.
///
/// The `*_attached` methods decide whether the corresponding stream is
/// attached to the remote process at all; absence is a valid configuration.
/// `done` is the session's single terminal transition: implementations
/// guarantee that exactly one call performs the teardown even when it is
/// triggered concurrently from several failure paths, and that once it has
/// fired, blocked reads fail and `next_size` returns `None`.
#[async_trait]
pub trait PtyHandler: Send + Sync {
    fn stdin_attached(&self) -> bool;
    fn stdout_attached(&self) -> bool;
    fn stderr_attached(&self) -> bool;

    /// Whether the remote process should allocate a pseudo-terminal.
    fn tty(&self) -> bool;

    /// Read the next chunk of client input. `Ok(0)` means "nothing this
    /// time, call again"; it is not end-of-stream. On a terminal transport
    /// or protocol failure the session delivers the end-of-transmission
    /// byte as ordinary data and the following call returns the error.
    async fn read_stdin(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Forward remote process output to the client.
    async fn write_stdout(&self, data: &[u8]) -> io::Result<usize>;

    /// Forward remote process stderr to the client.
    async fn write_stderr(&self, data: &[u8]) -> io::Result<usize>;

    /// Next terminal size, or `None` once no further resizes will come.
    /// Called in a loop by the remote command channel while it supports
    /// TTY resize; `None` is its signal to stop polling.
    async fn next_size(&self) -> Option<TerminalSize>;

    /// Terminate the session. Idempotent.
    async fn done(&self);
}

/// Single-slot hand-off of terminal sizes from the transport decode path to
/// the remote command channel.
///
/// `push` and `next` form a bounded FIFO of capacity one, so a resize is
/// never reordered against later input and the queue cannot grow without a
/// consumer. `close` is idempotent; after it, `next` returns `None` forever
/// and unblocks any waiter.
pub struct SizeQueue {
    tx: mpsc::Sender<TerminalSize>,
    rx: Mutex<mpsc::Receiver<TerminalSize>>,
    closed: CancellationToken,
}

impl SizeQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            tx,
            rx: Mutex::new(rx),
            closed: CancellationToken::new(),
        }
    }

    /// Hand a size to the consumer. Blocks while the slot is full; returns
    /// `false` if the queue closed before the size could be delivered.
    pub async fn push(&self, size: TerminalSize) -> bool {
        if self.closed.is_cancelled() {
            return false;
        }
        tokio::select! {
            res = self.tx.send(size) => res.is_ok(),
            _ = self.closed.cancelled() => false,
        }
    }

    /// Next queued size, or `None` once the queue is closed.
    pub async fn next(&self) -> Option<TerminalSize> {
        if self.closed.is_cancelled() {
            return None;
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            size = rx.recv() => size,
            _ = self.closed.cancelled() => None,
        }
    }

    /// Close the queue, unblocking producers and consumers. Idempotent.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl Default for SizeQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_push_then_next() {
        let queue = SizeQueue::new();
        assert!(queue.push(TerminalSize::new(80, 24)).await);
        assert_eq!(queue.next().await, Some(TerminalSize::new(80, 24)));
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = Arc::new(SizeQueue::new());
        let producer = Arc::clone(&queue);
        let handle = tokio::spawn(async move {
            for width in [80u16, 100, 120] {
                assert!(producer.push(TerminalSize::new(width, 24)).await);
            }
        });

        assert_eq!(queue.next().await.unwrap().width, 80);
        assert_eq!(queue.next().await.unwrap().width, 100);
        assert_eq!(queue.next().await.unwrap().width, 120);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_next_returns_none_after_close() {
        let queue = SizeQueue::new();
        queue.close();
        assert_eq!(queue.next().await, None);
        // and keeps returning None, never blocking
        assert_eq!(queue.next().await, None);
    }

    #[tokio::test]
    async fn test_close_unblocks_waiting_consumer() {
        let queue = Arc::new(SizeQueue::new());
        let consumer = Arc::clone(&queue);
        let handle = tokio::spawn(async move { consumer.next().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();

        let result = timeout(Duration::from_secs(1), handle)
            .await
            .expect("consumer should unblock after close")
            .unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn test_close_unblocks_waiting_producer() {
        let queue = Arc::new(SizeQueue::new());
        // fill the single slot
        assert!(queue.push(TerminalSize::new(80, 24)).await);

        let producer = Arc::clone(&queue);
        let handle = tokio::spawn(async move { producer.push(TerminalSize::new(100, 30)).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();

        let delivered = timeout(Duration::from_secs(1), handle)
            .await
            .expect("producer should unblock after close")
            .unwrap();
        assert!(!delivered);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let queue = SizeQueue::new();
        queue.close();
        queue.close();
        assert!(queue.is_closed());
    }

    #[tokio::test]
    async fn test_push_after_close_reports_failure() {
        let queue = SizeQueue::new();
        queue.close();
        assert!(!queue.push(TerminalSize::new(80, 24)).await);
    }
}
