//! Task objects, their stacks/contexts, the raw entry trampoline, and the
//! `this_task` free functions a running task uses to talk to its own
//! scheduler (spec.md §4.1/§4.2, §6 "this_task").

pub mod context;
pub mod stack;
pub mod task;

use std::panic::AssertUnwindSafe;

/// The only valid entry point for a task's stack. Set as the return
/// address baked into a fresh `Context` (`Context::new`); never called
/// directly. Reads the current task from thread-local state (set by the
/// scheduler immediately before the switch that lands here), runs its
/// entry closure to completion, and hands control back to the scheduler.
/// Never returns — the scheduler never switches back into a finished
/// task's stack (spec.md P6).
///
/// `catch_unwind` here isn't about cancellation — that's carried as an
/// ordinary `Result` through the closure's return type — it's a stack
/// safety requirement: a panic unwinding past this frame would walk into
/// the synthetic "caller" `Context::new` bakes in, which isn't a real
/// call frame.
pub(crate) extern "C" fn trampoline(_arg: u64) -> ! {
    let task = crate::sched::current_task().expect("trampoline entered without a current task");
    task.set_state("running");

    let entry = task
        .entry
        .lock()
        .take()
        .expect("task entry closure consumed twice");

    match std::panic::catch_unwind(AssertUnwindSafe(entry)) {
        Ok(Ok(())) => {}
        Ok(Err(e)) if e.is_cancellation() => {
            log::debug!("{} finished via {e}", task.id);
        }
        Ok(Err(e)) => {
            log::error!("{} exited with unhandled error: {e}", task.id);
            std::process::abort();
        }
        Err(payload) => {
            log::error!("{} panicked: {}", task.id, panic_message(&payload));
            std::process::abort();
        }
    }

    task.set_state("finished");
    crate::sched::scheduler::finish_current_task();
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

/// Operations a running task performs on itself. Mirrors the original's
/// free functions reaching into `tld->self` (spec.md §6).
pub mod this_task {
    use crate::error::RuntimeError;
    use crate::task::task::{CancellationPoint, TaskId};
    use std::time::{Duration, Instant};

    fn current() -> std::sync::Arc<crate::task::task::Task> {
        crate::sched::current_task().expect("this_task:: called outside a task")
    }

    pub fn id() -> TaskId {
        current().id
    }

    pub fn name() -> String {
        current().name()
    }

    pub fn set_name(name: impl Into<String>) {
        current().set_name(name);
    }

    pub fn cancel_requested() -> bool {
        current().is_canceled()
    }

    /// Suspend until the scheduler next picks this task up — yields the
    /// processor without blocking on anything. Not a cancellation point:
    /// a plain cooperative yield always returns (matches the original's
    /// unconditional `taskyield`).
    pub fn yield_now() {
        // `ready` stays true the whole time: the task never leaves the
        // running-or-queued state, so there's no window for a concurrent
        // `wake_task` to win a spurious CAS against it (spec.md P1).
        let task = current();
        let sched = crate::sched::current_scheduler().expect("no current scheduler");
        sched.requeue_current_and_suspend(&task);
    }

    /// Sleep for at least `dur`. A cancellation point: returns early with
    /// an error if canceled, or if an enclosing deadline fires first.
    pub fn sleep_for(dur: Duration) -> Result<(), RuntimeError> {
        sleep_until(Instant::now() + dur)
    }

    pub fn sleep_until(when: Instant) -> Result<(), RuntimeError> {
        let task = current();
        let _cp = CancellationPoint::enter(&task);
        task.check_interrupt()?;
        let sched = crate::sched::current_scheduler().expect("no current scheduler");
        sched.sleep_current_until(&task, when);
        task.check_interrupt()
    }
}
