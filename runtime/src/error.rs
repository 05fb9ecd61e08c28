//! Boundary error taxonomy (spec.md §6 "Error taxonomy", §7).
//!
//! Programming errors (double-wait on a fd+direction, sending through a
//! destroyed channel, joining an unspawned task) are not represented
//! here — per spec.md §7 those `panic!` with a diagnostic and are not
//! recoverable.

use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Raised at a cancellation point once `Task::cancel` has been
    /// observed and no deadline sentinel is due first.
    #[error("task was interrupted")]
    TaskInterrupted,

    /// Raised at a cancellation point once a `Deadline` has fired.
    /// Deadlines win over a concurrent cancel (spec.md P5).
    #[error("deadline reached")]
    DeadlineReached,

    /// Raised by a channel operation against a closed channel once no
    /// buffered items remain to drain.
    #[error("channel closed")]
    ChannelClosed,

    /// A syscall wrapper failed.
    #[error("io error during {op}: {source}")]
    Io {
        source: std::io::Error,
        op: &'static str,
    },
}

impl RuntimeError {
    pub(crate) fn io(op: &'static str) -> RuntimeError {
        RuntimeError::Io {
            source: std::io::Error::last_os_error(),
            op,
        }
    }

    /// True for the two cancellation sentinels (`TaskInterrupted`,
    /// `DeadlineReached`) as opposed to an operational failure like
    /// `ChannelClosed`/`Io` (spec.md §7).
    pub fn is_cancellation(&self) -> bool {
        matches!(self, RuntimeError::TaskInterrupted | RuntimeError::DeadlineReached)
    }
}

/// Sentinel returned as an ordinary `Err` at cancellation points, just
/// like any other `RuntimeError` — propagated with `?` through scoped
/// guards (whose `Drop` impls run as the `Result` unwinds the call stack)
/// up to the task trampoline, or caught earlier by application code that
/// needs to run cleanup before rethrowing/translating. Mirrors the
/// original's `task_interrupted`/deadline exceptions without requiring a
/// panic-based unwind to get the same RAII cleanup.
pub(crate) enum CancelSignal {
    Interrupted,
    DeadlineReached,
}

impl fmt::Debug for CancelSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelSignal::Interrupted => write!(f, "task_interrupted"),
            CancelSignal::DeadlineReached => write!(f, "deadline_reached"),
        }
    }
}

impl From<CancelSignal> for RuntimeError {
    fn from(s: CancelSignal) -> RuntimeError {
        match s {
            CancelSignal::Interrupted => RuntimeError::TaskInterrupted,
            CancelSignal::DeadlineReached => RuntimeError::DeadlineReached,
        }
    }
}
