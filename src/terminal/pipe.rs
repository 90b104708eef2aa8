//! Pipe session
//!
//! The non-interactive specialization of `PtyHandler`: wraps a plain
//! reader/writer pair so a programmatic consumer (for example a tar stream
//! being pulled out of a container) can sit where a human terminal would.
//! No TTY, no resizes; the caller owns the stream lifetimes.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::debug;

use super::handler::{PtyHandler, SizeQueue, TerminalSize};

pub type PipeReader = Box<dyn AsyncRead + Send + Unpin>;
pub type PipeWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The standard stream names for a pipe session. A `None` stream is simply
/// not attached to the remote process.
#[derive(Default)]
pub struct IoStreams {
    pub stdin: Option<PipeReader>,
    pub stdout: Option<PipeWriter>,
    pub stderr: Option<PipeWriter>,
}

/// A session over an in-process reader/writer pair.
pub struct PipeSession {
    stdin: Option<Mutex<PipeReader>>,
    stdout: Option<Mutex<PipeWriter>>,
    stderr: Option<Mutex<PipeWriter>>,
    size_queue: SizeQueue,
    closed: AtomicBool,
}

impl PipeSession {
    pub fn new(streams: IoStreams) -> Self {
        Self {
            stdin: streams.stdin.map(Mutex::new),
            stdout: streams.stdout.map(Mutex::new),
            stderr: streams.stderr.map(Mutex::new),
            size_queue: SizeQueue::new(),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl PtyHandler for PipeSession {
    fn stdin_attached(&self) -> bool {
        self.stdin.is_some()
    }

    fn stdout_attached(&self) -> bool {
        self.stdout.is_some()
    }

    fn stderr_attached(&self) -> bool {
        self.stderr.is_some()
    }

    fn tty(&self) -> bool {
        false
    }

    async fn read_stdin(&self, buf: &mut [u8]) -> io::Result<usize> {
        match &self.stdin {
            Some(reader) => reader.lock().await.read(buf).await,
            None => Ok(0),
        }
    }

    async fn write_stdout(&self, data: &[u8]) -> io::Result<usize> {
        match &self.stdout {
            Some(writer) => {
                let mut writer = writer.lock().await;
                writer.write_all(data).await?;
                writer.flush().await?;
                Ok(data.len())
            }
            None => Ok(data.len()),
        }
    }

    async fn write_stderr(&self, data: &[u8]) -> io::Result<usize> {
        match &self.stderr {
            Some(writer) => {
                let mut writer = writer.lock().await;
                writer.write_all(data).await?;
                writer.flush().await?;
                Ok(data.len())
            }
            None => Ok(data.len()),
        }
    }

    // No terminal, no geometry: the size consumer stops polling right away.
    async fn next_size(&self) -> Option<TerminalSize> {
        None
    }

    // Closes the size queue only; the reader and writer belong to the
    // caller and are released when the session is dropped.
    async fn done(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("pipe session done");
        self.size_queue.close();
    }
}
