// CLASSIFICATION: COMMUNITY
// Filename: runtime.rs v0.2
// Author: Lukas Bower
// Date Modified: 2027-08-24

//! Contract between the scheduler and a computer's script runtime.
//!
//! The interpreter itself lives outside this crate. It is driven in bounded
//! resumes and must call [`Slice::checkpoint`] between units of work; once
//! the slice deadline passes the checkpoint reports an interrupt and the
//! runtime is expected to return promptly.

use std::sync::Arc;

use crate::computer::ComputerId;
use crate::scheduler::Slice;

/// Error raised by the runtime itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeFault {
    /// Fatal faults (stack exhaustion and the like) turn the computer off.
    pub fatal: bool,
    pub message: String,
}

impl RuntimeFault {
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            fatal: true,
            message: message.into(),
        }
    }

    pub fn recoverable(message: impl Into<String>) -> Self {
        Self {
            fatal: false,
            message: message.into(),
        }
    }
}

/// How a resume ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeOutcome {
    /// Stopped at a checkpoint with more work to do. Re-queued at the tail.
    Yielded,
    /// Finished the current burst; runs again when an event arrives.
    Completed,
    Faulted(RuntimeFault),
}

pub trait ScriptRuntime: Send {
    /// Initialise the runtime. Success turns the computer on.
    fn boot(&mut self, _slice: &mut Slice<'_>) -> Result<(), RuntimeFault> {
        Ok(())
    }

    /// Run until the next yield point.
    fn resume(&mut self, slice: &mut Slice<'_>) -> ResumeOutcome;

    /// Release interpreter state. The instance is discarded afterwards.
    fn shutdown(&mut self) {}
}

/// Builds a fresh runtime instance for a computer. Called at creation and
/// whenever a runtime is torn down (shutdown, reboot, watchdog abort).
pub type RuntimeFactory = Arc<dyn Fn(ComputerId) -> Box<dyn ScriptRuntime> + Send + Sync>;

/// Wrap a closure as a [`RuntimeFactory`].
pub fn runtime_factory<F, R>(f: F) -> RuntimeFactory
where
    F: Fn(ComputerId) -> R + Send + Sync + 'static,
    R: ScriptRuntime + 'static,
{
    Arc::new(move |id| Box::new(f(id)) as Box<dyn ScriptRuntime>)
}
