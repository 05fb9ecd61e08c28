//! Scoped deadline: arms a timer that raises `DeadlineReached` at the next
//! cancellation point reached after it fires (spec.md §4.8). Deadlines
//! nest freely; each tracks its own timer handle independently, and
//! `TimerSet`'s insertion-order tie-break gives simultaneous deadlines a
//! stable "earliest registered fires first" order (spec.md P5 note).

use crate::sched::timer::TimeoutHandle;
use crate::task::task::Task;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct Deadline {
    task: Arc<Task>,
    handle: Option<TimeoutHandle>,
    when: Instant,
}

fn current_task() -> Arc<Task> {
    crate::sched::current_task().expect("Deadline::new called outside a task")
}

impl Deadline {
    /// Arm a deadline that fires `dur` from now. `Deadline::new(Duration::ZERO)`
    /// fires at the very next cancellation point (spec.md "boundary
    /// behaviors").
    pub fn new(dur: Duration) -> Deadline {
        let task = current_task();
        let sched = crate::sched::current_scheduler().expect("no current scheduler");
        let when = Instant::now() + dur;
        let handle = sched.timers().borrow_mut().insert(
            task.clone(),
            when,
            Some(crate::error::CancelSignal::DeadlineReached),
        );
        task.timeouts.lock().push(handle);
        Deadline { task, handle: Some(handle), when }
    }

    /// Disarm early. A no-op if the deadline already fired or was already
    /// canceled (idempotent, matching spec.md's round-trip properties).
    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Some(sched) = crate::sched::current_scheduler() {
                sched.timers().borrow_mut().cancel(handle);
            }
            self.task.timeouts.lock().retain(|h| *h != handle);
        }
    }

    /// Time remaining, or zero if fired or disarmed.
    pub fn remaining(&self) -> Duration {
        if self.handle.is_none() {
            return Duration::ZERO;
        }
        self.when.saturating_duration_since(Instant::now())
    }
}

impl Drop for Deadline {
    fn drop(&mut self) {
        self.cancel();
    }
}
