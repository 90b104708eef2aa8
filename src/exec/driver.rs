//! Session driver
//!
//! Starts a remote command invocation against a session and guarantees the
//! session's terminal `done()` transition runs exactly once, however the
//! invocation ends: normal completion, validation failure, channel error,
//! or a panic inside the executor. Failures are reported to the user with a
//! single stdout write before the session is torn down.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use thiserror::Error;
use tracing::{debug, warn};

use crate::terminal::PtyHandler;

use super::remote::{ExecRequest, PodStatus, PodTarget, RemoteExec};

/// Errors that can end a session before or during the remote invocation
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("cannot exec into a container in a completed pod; current phase is {0}")]
    CompletedPod(super::remote::PodPhase),

    #[error("pod has no container '{0}'")]
    NoSuchContainer(String),

    #[error("remote execution failed: {0}")]
    Remote(#[source] anyhow::Error),

    #[error("remote execution panicked")]
    Panicked,
}

/// Result type for driver operations
pub type ExecResult<T> = Result<T, ExecError>;

/// Check that the target pod can host an interactive session: it must not
/// be in a terminal lifecycle phase, and the requested container must be in
/// its declared container set.
pub fn validate_target(status: &PodStatus, container: &str) -> ExecResult<()> {
    if status.phase.is_terminal() {
        return Err(ExecError::CompletedPod(status.phase));
    }
    if !status.containers.iter().any(|c| c == container) {
        return Err(ExecError::NoSuchContainer(container.to_string()));
    }
    Ok(())
}

/// Run `command` in the target container, bridged to `handler`.
///
/// The handler's `done()` is invoked exactly once when this function
/// returns, on every path. Validation and invocation failures surface to
/// the user stream before teardown; the returned error is for the caller's
/// logs, not for the peer.
pub async fn start_process(
    executor: Arc<dyn RemoteExec>,
    handler: Arc<dyn PtyHandler>,
    command: Vec<String>,
    target: PodTarget,
    status: PodStatus,
) -> ExecResult<()> {
    let driven = drive(executor, Arc::clone(&handler), command, target, status);
    let result = AssertUnwindSafe(driven).catch_unwind().await;
    handler.done().await;
    match result {
        Ok(outcome) => outcome,
        Err(_) => Err(ExecError::Panicked),
    }
}

async fn drive(
    executor: Arc<dyn RemoteExec>,
    handler: Arc<dyn PtyHandler>,
    command: Vec<String>,
    target: PodTarget,
    status: PodStatus,
) -> ExecResult<()> {
    if let Err(err) = validate_target(&status, &target.container) {
        warn!(
            "validation failed for {}/{} container {}: {}",
            target.namespace, target.pod, target.container, err
        );
        report(&handler, &format!("Validate pod error! err: {}", err)).await;
        return Err(err);
    }

    debug!(
        "exec pod: {}, container: {}, namespace: {}, command: {:?}",
        target.pod, target.container, target.namespace, command
    );
    let request = ExecRequest {
        stdin: handler.stdin_attached(),
        stdout: handler.stdout_attached(),
        stderr: handler.stderr_attached(),
        tty: handler.tty(),
        command,
        target,
    };

    if let Err(err) = executor.stream(request, Arc::clone(&handler)).await {
        let err = ExecError::Remote(err);
        warn!("remote invocation failed: {}", err);
        report(&handler, &format!("Exec to pod error! err: {}", err)).await;
        return Err(err);
    }
    Ok(())
}

/// One explanatory message on the user stream. If the session is already
/// dead the write error is logged and swallowed; the session is ending
/// either way.
async fn report(handler: &Arc<dyn PtyHandler>, message: &str) {
    if let Err(e) = handler.write_stdout(message.as_bytes()).await {
        debug!("failed to report session error to peer: {}", e);
    }
}
