use crate::error::Result;
use crate::policy::CapabilityPolicy;
use crate::types::ExecResult;

/// A booted, isolated interpreter instance.
///
/// `run` is blocking: the guest executes on the calling thread. Async callers
/// move the sandbox onto a blocking thread for the duration of the call.
pub trait Sandbox: Send {
    // -- identity --
    fn id(&self) -> &str;
    fn policy(&self) -> &CapabilityPolicy;

    // -- operations --
    /// Execute one submission in a fresh top-level namespace.
    ///
    /// Guest failures (uncaught exceptions, rejected capabilities, explicit
    /// exit) are reported through [`ExecResult::termination`]. An `Err` means
    /// the host side of the sandbox is broken.
    fn run(&mut self, code: &str) -> Result<ExecResult>;
}
