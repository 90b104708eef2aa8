//! Remote command channel boundary
//!
//! The streaming execution transport is an opaque platform capability; this
//! module fixes the contract the bridge depends on. `RemoteExec` streams
//! bytes between a session and a remote process until the process exits or
//! the channel errors; `PodInspector` supplies the target-validation inputs
//! from the platform's resource layer.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::terminal::{LogSink, PtyHandler};

/// Coordinates of the container a session attaches to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodTarget {
    pub namespace: String,
    pub pod: String,
    pub container: String,
}

impl PodTarget {
    pub fn new(
        namespace: impl Into<String>,
        pod: impl Into<String>,
        container: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            pod: pod.into(),
            container: container.into(),
        }
    }
}

/// Lifecycle phase of the target pod, as reported by the resource layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    /// A terminal phase cannot accept an interactive session.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PodPhase::Succeeded | PodPhase::Failed)
    }
}

impl fmt::Display for PodPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self {
            PodPhase::Pending => "Pending",
            PodPhase::Running => "Running",
            PodPhase::Succeeded => "Succeeded",
            PodPhase::Failed => "Failed",
            PodPhase::Unknown => "Unknown",
        };
        f.write_str(phase)
    }
}

/// Validation inputs for one pod: its phase and declared container names.
#[derive(Debug, Clone)]
pub struct PodStatus {
    pub phase: PodPhase,
    pub containers: Vec<String>,
}

impl PodStatus {
    pub fn new(phase: PodPhase, containers: Vec<String>) -> Self {
        Self { phase, containers }
    }
}

/// A remote command invocation, built from the session's own capability
/// reporting: a stream the session does not expose is not attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    pub target: PodTarget,
    pub command: Vec<String>,
    pub stdin: bool,
    pub stdout: bool,
    pub stderr: bool,
    pub tty: bool,
}

/// The remote command channel. Implementations stream bytes between the
/// handler and the remote process until it exits or the channel fails; they
/// poll `next_size` for geometry changes while `tty` is set.
#[async_trait]
pub trait RemoteExec: Send + Sync {
    async fn stream(
        &self,
        request: ExecRequest,
        handler: Arc<dyn PtyHandler>,
    ) -> anyhow::Result<()>;
}

/// Supplies pod lifecycle phase and container names for target validation.
#[async_trait]
pub trait PodInspector: Send + Sync {
    async fn pod_status(&self, namespace: &str, pod: &str) -> anyhow::Result<PodStatus>;
}

/// Options for a log stream, taken from the client's request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LogOptions {
    /// Keep the stream open and deliver new lines as they appear.
    pub follow: bool,
    /// Start from the last N lines; zero means from the beginning.
    pub tail_lines: i64,
}

/// Streams container log output into a sink. With `follow` set the call
/// runs until the sink fails or the platform ends the stream.
#[async_trait]
pub trait LogStreamer: Send + Sync {
    async fn stream_logs(
        &self,
        target: &PodTarget,
        options: LogOptions,
        sink: Arc<dyn LogSink>,
    ) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_phases() {
        assert!(PodPhase::Succeeded.is_terminal());
        assert!(PodPhase::Failed.is_terminal());
        assert!(!PodPhase::Running.is_terminal());
        assert!(!PodPhase::Pending.is_terminal());
        assert!(!PodPhase::Unknown.is_terminal());
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(PodPhase::Succeeded.to_string(), "Succeeded");
        assert_eq!(PodPhase::Running.to_string(), "Running");
    }
}
