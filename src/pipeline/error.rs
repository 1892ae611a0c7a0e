//! Fault classification, reporting and isolation for pipeline components.

use crate::error::Result;
use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};

/// A fault observed while the pipeline was running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// A collaborator failed; the pipeline keeps going.
    Recoverable(String),
    /// The component cannot continue and must be rebuilt.
    Fatal(String),
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::Recoverable(msg) => write!(f, "Recoverable error: {}", msg),
            Fault::Fatal(msg) => write!(f, "Fatal error: {}", msg),
        }
    }
}

impl std::error::Error for Fault {}

/// Sink for faults raised by pipeline components.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, component: &str, fault: &Fault);
}

/// Reporter that forwards faults to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report(&self, component: &str, fault: &Fault) {
        match fault {
            Fault::Recoverable(msg) => {
                tracing::error!(component, error = %msg, "Pipeline component failed")
            }
            Fault::Fatal(msg) => tracing::error!(
                component,
                error = %msg,
                "Pipeline worker died; this is probably a bug"
            ),
        }
    }
}

/// Extracts a readable message from a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(|s| s.as_str()))
        .unwrap_or("unknown panic")
        .to_string()
}

/// Runs a collaborator callback, turning both errors and panics into a
/// message so one failing callback cannot take down its caller.
pub fn isolate<F>(f: F) -> std::result::Result<(), String>
where
    F: FnOnce() -> Result<()>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(payload) => Err(format!("panicked: {}", panic_message(payload.as_ref()))),
    }
}
