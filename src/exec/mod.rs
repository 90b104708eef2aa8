//! Remote execution module
//!
//! Connects a terminal session to a command running in a remote container:
//! the channel and inspection traits the platform implements, target
//! validation, and the driver that runs one invocation to completion.

mod driver;
mod remote;

pub use driver::{start_process, validate_target, ExecError, ExecResult};
pub use remote::{
    ExecRequest, LogOptions, LogStreamer, PodInspector, PodPhase, PodStatus, PodTarget, RemoteExec,
};
