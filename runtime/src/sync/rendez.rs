//! A condition-variable-like wait-on-predicate bound to one [`Qutex`]
//! (spec.md §4.7). `wakeup`/`wakeup_all` don't grant ownership directly —
//! they move a waiter from the rendez FIFO onto the qutex's own FIFO, so
//! woken waiters still compete for reacquisition in fair order alongside
//! any plain `lock()` callers.

use crate::error::RuntimeError;
use crate::sync::qutex::{Qutex, QutexGuard};
use crate::task::task::{CancellationPoint, Task};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

pub struct Rendez<T> {
    qutex: Arc<Qutex<T>>,
    waiters: Mutex<VecDeque<Arc<Task>>>,
}

fn current_task() -> Arc<Task> {
    crate::sched::current_task().expect("rendez op called outside a task")
}

impl<T> Rendez<T> {
    pub fn new(qutex: Arc<Qutex<T>>) -> Rendez<T> {
        Rendez { qutex, waiters: Mutex::new(VecDeque::new()) }
    }

    pub fn qutex(&self) -> &Arc<Qutex<T>> {
        &self.qutex
    }

    /// Precondition: `guard` is this rendez's qutex, currently held by the
    /// calling task. Releases the qutex, suspends until woken, re-acquires
    /// it, and loops until `predicate` holds or cancellation/deadline
    /// fires. A cancellation point.
    pub fn sleep<'g>(
        &'g self,
        mut guard: QutexGuard<'g, T>,
        mut predicate: impl FnMut(&T) -> bool,
    ) -> Result<QutexGuard<'g, T>, RuntimeError> {
        loop {
            if predicate(&guard) {
                return Ok(guard);
            }
            let task = current_task();
            let _cp = CancellationPoint::enter(&task);
            if let Err(e) = task.check_interrupt() {
                return Err(e);
            }

            task.mark_not_ready();
            self.waiters.lock().push_back(task.clone());
            drop(guard); // releases the qutex; hands off to any plain locker

            guard = self.qutex.wait_for_ownership(&task)?;
        }
    }

    /// Move one waiter (oldest first) from the rendez FIFO onto the
    /// qutex's FIFO.
    pub fn wakeup(&self) {
        if let Some(task) = self.waiters.lock().pop_front() {
            self.qutex.adopt_waiter(task);
        }
    }

    /// Move every currently-queued waiter onto the qutex's FIFO.
    pub fn wakeup_all(&self) {
        let drained: Vec<_> = self.waiters.lock().drain(..).collect();
        for task in drained {
            self.qutex.adopt_waiter(task);
        }
    }
}
