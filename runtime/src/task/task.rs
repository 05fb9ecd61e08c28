//! The task object: a stack, a saved context, an id, and the cooperative
//! bookkeeping (`ready`, `canceled`, cancellation-point depth, pending
//! timeouts) the scheduler and sync primitives need.

use crate::error::CancelSignal;
use crate::sched::SchedulerId;
use crate::sched::timer::TimeoutHandle;
use crate::task::context::Context;
use crate::task::stack::Stack;
use parking_lot::Mutex;
use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Unique, monotonically increasing, process-wide task id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> TaskId {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        TaskId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Entry thunk a task runs exactly once. Boxed because tasks close over
/// arbitrary captured state; `FnOnce` because it's consumed by the
/// trampoline on first (and only) run. Returns `Result` so cancellation
/// and deadline sentinels raised by `?` inside the body reach the
/// trampoline as ordinary control flow rather than needing to unwind —
/// see `crate::task::trampoline` for how the two cancellation variants
/// are swallowed while any other error or panic aborts the process
/// (spec.md §7).
pub type TaskFn = Box<dyn FnOnce() -> Result<(), crate::error::RuntimeError> + Send + 'static>;

/// The object the scheduler and every sync primitive actually touch.
/// Always accessed through `Arc<Task>`; never moved once allocated.
pub struct Task {
    pub id: TaskId,
    pub(crate) scheduler: SchedulerId,

    // Set only by the trampoline, consumed exactly once.
    pub(crate) entry: Mutex<Option<TaskFn>>,

    pub(crate) stack: Stack,
    pub(crate) ctx: std::cell::UnsafeCell<Context>,

    /// true iff the task is currently running or present in exactly one
    /// ready-holding structure. Flips false->true only via CAS (spec.md
    /// §3 P1); the CAS winner is obligated to enqueue the task exactly
    /// once.
    pub(crate) ready: AtomicBool,
    /// Sticky once set.
    pub(crate) canceled: AtomicBool,

    /// Daemon tasks (e.g. the signal-handling task) don't count toward a
    /// scheduler's "every task has finished" termination check (spec.md
    /// §6 "Task API surface").
    pub(crate) daemon: AtomicBool,

    /// Depth counter for the RAII cancellation-point guard. Only the
    /// task itself, while running, touches this — no atomics needed.
    pub(crate) cancel_points: Cell<u64>,

    /// Pending timeouts, ordered by registration; removed on cancel or
    /// fire. Owned by the task; the scheduler's timer set holds a
    /// back-reference (the task id), not the record.
    pub(crate) timeouts: Mutex<Vec<TimeoutHandle>>,

    /// Action to run on the scheduler's own stack immediately after
    /// swapping away from this task — used to register reactor fd
    /// interest only once the task can no longer observe or race with
    /// the registration (spec.md §4.4, §9 "post-swap registration").
    pub(crate) post: Mutex<Option<Box<dyn FnOnce() + Send>>>,

    pub(crate) name: Mutex<String>,
    pub(crate) state: Mutex<&'static str>,

    /// Sentinels from fired deadline timeouts, oldest first. Popped one
    /// at a time by the next cancellation point the task reaches.
    pub(crate) due_sentinels: Mutex<VecDeque<CancelSignal>>,

    /// Closed by the trampoline on task exit; `join` recvs on it.
    pub(crate) done: crate::sync::channel::Channel<()>,
}

// Safety: a Task's `ctx`/`entry`/`stack` are touched only by whichever
// single thread currently owns the task (either it's running there, or
// the owning scheduler is the only thread that will swap into it next).
// Cross-thread handoff happens only through the `ready` CAS protocol,
// which establishes a happens-before edge before any other thread reads
// these fields.
unsafe impl Send for Task {}
unsafe impl Sync for Task {}

impl Task {
    pub(crate) fn new(scheduler: SchedulerId, stack_size: usize, f: TaskFn) -> std::io::Result<Arc<Task>> {
        let stack = Stack::new(stack_size)?;
        let ctx = unsafe { Context::new(stack.top(), crate::task::trampoline) };
        Ok(Arc::new(Task {
            id: TaskId::next(),
            scheduler,
            entry: Mutex::new(Some(f)),
            stack,
            ctx: std::cell::UnsafeCell::new(ctx),
            ready: AtomicBool::new(true),
            canceled: AtomicBool::new(false),
            daemon: AtomicBool::new(false),
            cancel_points: Cell::new(0),
            timeouts: Mutex::new(Vec::new()),
            post: Mutex::new(None),
            name: Mutex::new(String::new()),
            state: Mutex::new("fresh"),
            due_sentinels: Mutex::new(VecDeque::new()),
            done: crate::sync::channel::Channel::new(0),
        }))
    }

    pub(crate) fn queue_sentinel(&self, sentinel: CancelSignal) {
        self.due_sentinels.lock().push_back(sentinel);
    }

    /// Check cancellation/deadline state at a cancellation point: a due
    /// deadline sentinel wins over a plain cancel (spec.md P5).
    pub(crate) fn check_interrupt(&self) -> Result<(), crate::error::RuntimeError> {
        if let Some(sentinel) = self.due_sentinels.lock().pop_front() {
            return Err(sentinel.into());
        }
        if self.is_canceled() {
            return Err(crate::error::RuntimeError::TaskInterrupted);
        }
        Ok(())
    }

    /// Attempt the ready false->true transition. Returns `true` if this
    /// call won the CAS and is therefore obligated to enqueue the task.
    pub(crate) fn mark_ready(&self) -> bool {
        self.ready
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn mark_not_ready(&self) {
        self.ready.store(false, Ordering::Release);
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    pub(crate) fn mark_daemon(&self) {
        self.daemon.store(true, Ordering::Relaxed);
    }

    pub(crate) fn is_daemon(&self) -> bool {
        self.daemon.load(Ordering::Relaxed)
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.lock() = name.into();
    }

    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    pub fn set_state(&self, state: &'static str) {
        *self.state.lock() = state;
    }

    pub fn state(&self) -> &'static str {
        *self.state.lock()
    }
}

/// RAII guard marking a lexical region in which cancellation or deadline
/// exceptions may be observed. Suspension primitives refuse to raise
/// unless at least one guard is active — this is what makes cancellation
/// opt-in per primitive rather than ambient (spec.md §9).
pub struct CancellationPoint<'a> {
    task: &'a Task,
}

impl<'a> CancellationPoint<'a> {
    pub fn enter(task: &'a Task) -> Self {
        task.cancel_points.set(task.cancel_points.get() + 1);
        CancellationPoint { task }
    }
}

impl Drop for CancellationPoint<'_> {
    fn drop(&mut self) {
        let d = self.task.cancel_points.get();
        debug_assert!(d > 0);
        self.task.cancel_points.set(d - 1);
    }
}

/// Request cancellation of `task`: set the sticky flag and, if it was
/// previously unset, wake the task wherever it's currently suspended.
/// Idempotent and monotone (spec.md testable properties).
pub(crate) fn cancel_task(task: &Arc<Task>) {
    if task.canceled.swap(true, Ordering::AcqRel) {
        return;
    }
    log::debug!("{} canceled", task.id);
    crate::sched::wake_task(task.clone());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_ids_are_unique_and_increasing() {
        let a = TaskId::next();
        let b = TaskId::next();
        assert!(b.as_u64() > a.as_u64());
    }

    #[test]
    fn ready_cas_wins_exactly_once() {
        let ready = AtomicBool::new(false);
        let mut wins = 0;
        for _ in 0..4 {
            if ready
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }
}
