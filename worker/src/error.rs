use thiserror::Error;

use crate::arena::ArenaError;
use crate::executor::OpError;
use crate::sandbox::SandboxViolation;
use crate::transport::TransportError;

/// Worker-level failures by domain. Of these, only arena errors are
/// allowed to terminate the process: the memory layout cannot be trusted
/// after one. Executor and malformed-message failures are converted to
/// structured job results and the loop continues.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("arena error: {0}")]
    Arena(#[from] ArenaError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("operation error: {0}")]
    Op(#[from] OpError),
    #[error("sandbox violation: {0}")]
    Sandbox(#[from] SandboxViolation),
}
