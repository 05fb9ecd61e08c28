//! A task-level mutex with fair FIFO hand-off (spec.md §4.7). Named after
//! the original's "qutex" (task-queue mutex), distinguishing it from an
//! OS-thread `Mutex` even though both guard a `T`.

use crate::error::RuntimeError;
use crate::task::task::{CancellationPoint, Task, TaskId};
use parking_lot::Mutex as OsMutex;
use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

struct State {
    owner: Option<TaskId>,
    waiters: VecDeque<Arc<Task>>,
}

pub struct Qutex<T> {
    state: OsMutex<State>,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Qutex<T> {}
unsafe impl<T: Send> Sync for Qutex<T> {}

pub struct QutexGuard<'a, T> {
    qutex: &'a Qutex<T>,
}

impl<T> Deref for QutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.qutex.data.get() }
    }
}

impl<T> DerefMut for QutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.qutex.data.get() }
    }
}

impl<T> Drop for QutexGuard<'_, T> {
    fn drop(&mut self) {
        self.qutex.unlock();
    }
}

fn current_task() -> Arc<Task> {
    crate::sched::current_task().expect("qutex op called outside a task")
}

impl<T> Qutex<T> {
    pub fn new(data: T) -> Qutex<T> {
        Qutex {
            state: OsMutex::new(State { owner: None, waiters: VecDeque::new() }),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire, blocking if held. A cancellation point. No barging:
    /// arriving lockers never overtake already-queued waiters (spec.md
    /// P8).
    pub fn lock(&self) -> Result<QutexGuard<'_, T>, RuntimeError> {
        let task = current_task();
        let _cp = CancellationPoint::enter(&task);
        task.check_interrupt()?;

        {
            let mut state = self.state.lock();
            if state.owner.is_none() {
                state.owner = Some(task.id);
                return Ok(QutexGuard { qutex: self });
            }
            task.mark_not_ready();
            state.waiters.push_back(task.clone());
        }
        self.wait_for_ownership(&task)
    }

    pub fn try_lock(&self) -> Option<QutexGuard<'_, T>> {
        let task = current_task();
        let mut state = self.state.lock();
        if state.owner.is_none() {
            state.owner = Some(task.id);
            Some(QutexGuard { qutex: self })
        } else {
            None
        }
    }

    /// Park `task` until it becomes owner (spec.md P8 fairness), or until
    /// cancellation/deadline fires while still queued. Shared by `lock`
    /// (after self-enqueue) and by [`crate::sync::rendez::Rendez::wakeup`]
    /// (after it moves a rendez waiter onto our waiter list).
    pub(crate) fn wait_for_ownership(&self, task: &Arc<Task>) -> Result<QutexGuard<'_, T>, RuntimeError> {
        let sched = crate::sched::current_scheduler().expect("no current scheduler");
        loop {
            sched.suspend_current(task);

            let mut state = self.state.lock();
            if state.owner == Some(task.id) {
                drop(state);
                if let Err(e) = task.check_interrupt() {
                    // Granted ownership, but a deadline/cancel landed in
                    // the same window — release it back via the normal
                    // unlock path rather than leaving it held.
                    drop(QutexGuard { qutex: self });
                    return Err(e);
                }
                return Ok(QutexGuard { qutex: self });
            }
            if let Err(e) = task.check_interrupt() {
                state.waiters.retain(|t| t.id != task.id);
                return Err(e);
            }
            // Spurious wake with neither ownership nor cancellation
            // observed: re-park and wait again.
            task.mark_not_ready();
        }
    }

    /// Adopt a task directly onto the waiter list (or hand it ownership
    /// immediately if free) without it having called `lock()` itself —
    /// used by `Rendez::wakeup` to move a woken waiter from the rendez
    /// FIFO onto this qutex's FIFO (spec.md §4.7 "Rendez").
    pub(crate) fn adopt_waiter(&self, task: Arc<Task>) {
        let mut state = self.state.lock();
        if state.owner.is_none() {
            state.owner = Some(task.id);
            drop(state);
            crate::sched::wake_task(task);
        } else {
            state.waiters.push_back(task);
        }
    }

    fn unlock(&self) {
        let mut state = self.state.lock();
        if let Some(next) = state.waiters.pop_front() {
            state.owner = Some(next.id);
            drop(state);
            crate::sched::wake_task(next);
        } else {
            state.owner = None;
        }
    }
}
