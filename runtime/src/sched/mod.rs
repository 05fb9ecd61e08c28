pub mod dirty_queue;
pub mod registry;
pub mod scheduler;
pub mod timer;

use std::sync::atomic::{AtomicU64, Ordering};

/// Identifies one scheduler (one OS thread participating in the
/// runtime). Not the OS thread id itself — just a stable handle stable
/// across the scheduler's lifetime, used as the registry key and as the
/// "home scheduler" a task remembers for cross-thread hand-off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SchedulerId(u64);

impl SchedulerId {
    fn next() -> SchedulerId {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        SchedulerId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    #[cfg(test)]
    pub(crate) fn for_test() -> SchedulerId {
        SchedulerId::next()
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

thread_local! {
    /// The task currently running on this thread, set by the scheduler
    /// just before swapping into it. Read by `this_task` free functions
    /// and by the trampoline on first entry.
    static CURRENT_TASK: std::cell::RefCell<Option<std::sync::Arc<crate::task::task::Task>>> =
        const { std::cell::RefCell::new(None) };

    /// The scheduler driving this thread, if any.
    static CURRENT_SCHEDULER: std::cell::RefCell<Option<std::sync::Weak<scheduler::Scheduler>>> =
        const { std::cell::RefCell::new(None) };
}

pub(crate) fn set_current_task(task: Option<std::sync::Arc<crate::task::task::Task>>) {
    CURRENT_TASK.with(|c| *c.borrow_mut() = task);
}

pub fn current_task() -> Option<std::sync::Arc<crate::task::task::Task>> {
    CURRENT_TASK.with(|c| c.borrow().clone())
}

pub(crate) fn set_current_scheduler(sched: Option<std::sync::Weak<scheduler::Scheduler>>) {
    CURRENT_SCHEDULER.with(|c| *c.borrow_mut() = sched);
}

pub fn current_scheduler() -> Option<std::sync::Arc<scheduler::Scheduler>> {
    CURRENT_SCHEDULER.with(|c| c.borrow().as_ref().and_then(|w| w.upgrade()))
}

/// Wake `task` if it's currently not-ready, handing it to its home
/// scheduler regardless of which thread (or which scheduler) is doing
/// the waking. Sync primitives use this uniformly rather than poking a
/// scheduler's ready queue directly, since the waiter they're waking may
/// live on a different thread entirely (spec.md §3 "Dirty queue").
pub(crate) fn wake_task(task: std::sync::Arc<crate::task::task::Task>) {
    if task.mark_ready() {
        let home = task.scheduler;
        registry::hand_off(home, task);
    }
}
