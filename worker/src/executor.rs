use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

use shared::tensor::{Params, TensorHandle};

use crate::arena::{Arena, ArenaError};
use crate::sandbox::SandboxViolation;

#[derive(Debug, Error)]
pub enum OpError {
    #[error("unknown operation type: {0}")]
    UnknownOperation(String),
    #[error("missing parameter '{0}'")]
    MissingParam(String),
    #[error("invalid parameter '{name}': {reason}")]
    InvalidParam { name: String, reason: String },
    #[error("missing input '{0}'")]
    MissingInput(String),
    #[error("{0}")]
    Failed(String),
    #[error("executor panicked: {0}")]
    Panicked(String),
    #[error(transparent)]
    Sandbox(#[from] SandboxViolation),
    #[error(transparent)]
    Arena(#[from] ArenaError),
}

impl OpError {
    /// Stable error code reported in a failed job result.
    pub fn code(&self) -> &'static str {
        match self {
            OpError::UnknownOperation(_) => "UNKNOWN_OP",
            OpError::MissingParam(_) | OpError::InvalidParam { .. } => "BAD_PARAMS",
            OpError::MissingInput(_) => "BAD_INPUTS",
            OpError::Failed(_) => "EXEC_FAILED",
            OpError::Panicked(_) => "EXEC_PANIC",
            OpError::Sandbox(_) => "SANDBOX_VIOLATION",
            OpError::Arena(_) => "ARENA",
        }
    }
}

/// Output tensors plus the handler-supplied metric.
#[derive(Debug)]
pub struct ExecOutput {
    pub outputs: HashMap<String, TensorHandle>,
    pub items_processed: Option<u64>,
}

/// One named compute operation.
///
/// Handlers are constructed per invocation by their registered factory and
/// must not retain state between jobs; heavyweight caches (model weights)
/// belong to external collaborators.
pub trait Executor {
    fn execute(
        &mut self,
        arena: &Arena,
        inputs: &HashMap<String, TensorHandle>,
        params: &Params,
    ) -> Result<ExecOutput, OpError>;
}

type Factory = Box<dyn Fn() -> Box<dyn Executor> + Send + Sync>;

/// Outcome of one dispatch, successful or not. `duration` spans handler
/// construction through `execute` returning or unwinding; `peak_memory`
/// is the tensor-region watermark delta over the call.
pub struct Dispatched {
    pub outcome: Result<ExecOutput, OpError>,
    pub duration: Duration,
    pub peak_memory_bytes: u64,
}

/// Maps operation-type names to handler factories.
///
/// Populated by explicit registration calls during startup, before the
/// first dispatch. `dispatch` never lets a handler failure escape: errors
/// and panics both come back as a failed [`Dispatched`].
#[derive(Default)]
pub struct ExecutorRegistry {
    entries: HashMap<String, Factory>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the factory for `name`; the last registration wins.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        factory: impl Fn() -> Box<dyn Executor> + Send + Sync + 'static,
    ) {
        let name = name.into();
        if self.entries.insert(name.clone(), Box::new(factory)).is_some() {
            warn!(op = %name, "replacing previously registered executor");
        }
    }

    /// Registered operation names, sorted for a stable capability list.
    pub fn operation_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn dispatch(
        &self,
        op_type: &str,
        arena: &Arena,
        inputs: &HashMap<String, TensorHandle>,
        params: &Params,
    ) -> Dispatched {
        let used_before = arena.used();
        let started = Instant::now();

        // Policy check precedes lookup: a denied module is blocked even
        // if nothing is registered under it.
        if let Err(violation) = crate::sandbox::check_module(op_type) {
            return Dispatched {
                outcome: Err(violation.into()),
                duration: started.elapsed(),
                peak_memory_bytes: 0,
            };
        }

        let Some(factory) = self.entries.get(op_type) else {
            return Dispatched {
                outcome: Err(OpError::UnknownOperation(op_type.to_string())),
                duration: started.elapsed(),
                peak_memory_bytes: 0,
            };
        };

        let outcome = match catch_unwind(AssertUnwindSafe(|| {
            let mut handler = factory();
            handler.execute(arena, inputs, params)
        })) {
            Ok(result) => result,
            Err(panic) => Err(OpError::Panicked(panic_message(panic))),
        };

        let duration = started.elapsed();
        debug!(op = op_type, ok = outcome.is_ok(), ?duration, "dispatch finished");
        Dispatched {
            outcome,
            duration,
            peak_memory_bytes: arena.used().saturating_sub(used_before),
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
