//! The scheduler loop: one per participating OS thread (spec.md §4.5).
//!
//! Owns the ready queue, the full task table, the timer set, and the
//! reactor. All of these are touched only by the owning thread — the
//! only cross-thread entry points are the dirty queue (other threads
//! hand tasks to us) and the wake eventfd (other threads nudge us out of
//! `epoll_wait`), both reached indirectly through `SchedulerHandle`.

use crate::reactor::Reactor;
use crate::sched::SchedulerId;
use crate::sched::registry::{self, SchedulerHandle};
use crate::sched::timer::TimerSet;
use crate::task::context::Context;
use crate::task::task::{Task, TaskFn, TaskId};
use std::cell::{RefCell, UnsafeCell};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

pub struct Scheduler {
    id: SchedulerId,
    handle: Arc<SchedulerHandle>,
    default_stack_size: usize,

    ready: RefCell<VecDeque<Arc<Task>>>,
    alltasks: RefCell<BTreeMap<TaskId, Arc<Task>>>,
    /// Count of tasks in `alltasks` that aren't daemons — the loop's
    /// "every task has finished" check is keyed off this reaching zero,
    /// not off `alltasks` itself, so a daemon (the signal task) left
    /// running doesn't pin the scheduler open forever (spec.md §6).
    non_daemon: std::cell::Cell<usize>,
    gc: RefCell<Vec<Arc<Task>>>,
    timers: RefCell<TimerSet>,
    reactor: RefCell<Reactor>,

    /// The scheduler loop's own saved context — what `do_swap` restores
    /// to resume the loop exactly where it called it.
    sched_ctx: UnsafeCell<Context>,

    /// Set once the shutdown sweep has canceled every task this scheduler
    /// knew about, so it only runs once per scheduler (shutdown itself is
    /// the process-wide `crate::runtime::is_shutdown_requested` flag).
    shutdown_swept: std::cell::Cell<bool>,

    /// Set once every non-daemon task has finished and the remaining
    /// daemons have been sent a cancellation nudge, so it only happens
    /// once per scheduler.
    daemon_swept: std::cell::Cell<bool>,
}

// Never shared across threads as a live `&Scheduler` from anywhere but
// the owning thread; `Arc<Scheduler>` only ever escapes as a `Weak` held
// in that thread's own thread-local.
unsafe impl Sync for Scheduler {}

impl Scheduler {
    pub fn new(default_stack_size: usize) -> std::io::Result<Arc<Scheduler>> {
        let id = SchedulerId::next();
        let handle = Arc::new(SchedulerHandle::new());
        let reactor = Reactor::new()?;
        handle.set_wake_fd(reactor.wake_fd());

        let sched = Arc::new(Scheduler {
            id,
            handle,
            default_stack_size,
            ready: RefCell::new(VecDeque::new()),
            alltasks: RefCell::new(BTreeMap::new()),
            non_daemon: std::cell::Cell::new(0),
            gc: RefCell::new(Vec::new()),
            timers: RefCell::new(TimerSet::new()),
            reactor: RefCell::new(reactor),
            sched_ctx: UnsafeCell::new(Context::empty()),
            shutdown_swept: std::cell::Cell::new(false),
            daemon_swept: std::cell::Cell::new(false),
        });
        registry::register(id, sched.handle.clone());
        Ok(sched)
    }

    pub fn id(&self) -> SchedulerId {
        self.id
    }

    /// Spawn a task onto this scheduler from within code already running
    /// on its thread (including from another task on it).
    pub fn spawn(self: &Arc<Self>, f: TaskFn) -> std::io::Result<Arc<Task>> {
        let task = Task::new(self.id, self.default_stack_size, f)?;
        self.alltasks.borrow_mut().insert(task.id, task.clone());
        self.non_daemon.set(self.non_daemon.get() + 1);
        self.ready.borrow_mut().push_back(task.clone());
        Ok(task)
    }

    /// Like [`spawn`](Self::spawn), but the task never counts toward the
    /// loop's termination check (spec.md §6 "Task API surface").
    pub fn spawn_daemon(self: &Arc<Self>, f: TaskFn) -> std::io::Result<Arc<Task>> {
        let task = Task::new(self.id, self.default_stack_size, f)?;
        task.mark_daemon();
        self.alltasks.borrow_mut().insert(task.id, task.clone());
        self.ready.borrow_mut().push_back(task.clone());
        Ok(task)
    }

    /// Run `f` as the initial task and drive the loop until every task
    /// (including ones spawned later, from any thread) has finished and
    /// no pending timers or fd waits remain. Must be called from the
    /// thread that is to become this scheduler (it claims the thread's
    /// current-scheduler slot for its own lifetime).
    pub fn run(self: Arc<Self>, f: TaskFn) -> std::io::Result<()> {
        crate::sched::set_current_scheduler(Some(Arc::downgrade(&self)));
        self.spawn(f)?;
        self.run_loop();
        crate::sched::set_current_scheduler(None);
        registry::unregister(self.id);
        Ok(())
    }

    fn run_loop(self: &Arc<Self>) {
        loop {
            unsafe {
                self.handle.dirty.drain(|task| {
                    self.alltasks.borrow_mut().insert(task.id, task.clone());
                    if !task.is_daemon() {
                        self.non_daemon.set(self.non_daemon.get() + 1);
                    }
                    self.ready.borrow_mut().push_back(task);
                });
            }

            let now = Instant::now();
            self.timers.borrow_mut().expire(now, |task| {
                if task.mark_ready() {
                    self.ready.borrow_mut().push_back(task);
                }
            });

            let shutting_down = crate::runtime::is_shutdown_requested();

            if shutting_down && !self.shutdown_swept.get() {
                self.shutdown_swept.set(true);
                // Cancel every still-live task in id order, best-effort:
                // the ones already finished are gone from `alltasks`, and
                // cancellation only nudges the rest toward their next
                // cancellation point rather than forcing an exit (spec.md
                // §4.5 "Shutdown protocol").
                for task in self.alltasks.borrow().values() {
                    crate::task::task::cancel_task(task);
                }
            }

            if shutting_down && self.alltasks.borrow().is_empty() {
                break;
            }

            if !shutting_down && self.non_daemon.get() == 0 && !self.daemon_swept.get() {
                self.daemon_swept.set(true);
                // Every non-daemon task has finished: nudge any daemons
                // still running (e.g. the signal task, parked forever on
                // its own `wait_readable`) toward their next
                // cancellation point so they can unwind and the loop can
                // actually drain (spec.md §6 "Task API surface": a
                // scheduler returns once every non-daemon task has
                // finished, daemons don't keep it open on their own).
                for task in self.alltasks.borrow().values() {
                    crate::task::task::cancel_task(task);
                }
            }

            while let Some(task) = self.ready.borrow_mut().pop_front() {
                self.run_one(task);
            }

            self.gc.borrow_mut().clear();

            if !shutting_down && self.non_daemon.get() == 0 && self.alltasks.borrow().is_empty() {
                break;
            }

            if self.alltasks.borrow().is_empty() {
                if shutting_down {
                    break;
                }
                // No local tasks at all: block until another thread
                // spawns one onto us (`spawn_on`) via the dirty queue's
                // eventfd, or the process shuts down.
                self.block_on_reactor(None);
            } else {
                // Every live task is suspended on a timer, an fd, or
                // another thread's wake: block until whichever fires
                // first (spec.md §4.4 "one tick of the multiplexer").
                let timeout = self
                    .timers
                    .borrow()
                    .earliest()
                    .map(|when| when.saturating_duration_since(Instant::now()));
                self.block_on_reactor(timeout);
            }
        }
    }

    fn block_on_reactor(self: &Arc<Self>, timeout: Option<std::time::Duration>) {
        if let Err(e) = self.reactor.borrow_mut().poll(timeout, |task| {
            if task.mark_ready() {
                self.ready.borrow_mut().push_back(task);
            }
        }) {
            log::warn!("reactor poll failed: {e}");
        }
    }

    /// Run exactly one task until it suspends or finishes, then run
    /// whatever post-swap action it left behind.
    fn run_one(self: &Arc<Self>, task: Arc<Task>) {
        crate::sched::set_current_task(Some(task.clone()));
        unsafe {
            crate::task::context::swap(self.sched_ctx.get(), task.ctx.get(), 0);
        }
        crate::sched::set_current_task(None);

        if let Some(post) = task.post.lock().take() {
            post();
        }

        if task.state() == "finished" {
            self.alltasks.borrow_mut().remove(&task.id);
            if !task.is_daemon() {
                self.non_daemon.set(self.non_daemon.get() - 1);
            }
            task.done.close();
            self.gc.borrow_mut().push(task);
        }
    }

    /// Swap from the current task's stack back onto the scheduler loop.
    /// Callers are responsible for whatever bookkeeping (mark_not_ready,
    /// enqueuing onto a waiter list, arming a timer) needs to happen
    /// before control leaves the task.
    pub(crate) fn suspend_current(&self, task: &Task) {
        unsafe {
            crate::task::context::swap(task.ctx.get(), self.sched_ctx.get(), 0);
        }
    }

    /// Cooperative yield: requeue without ever leaving the ready state.
    pub(crate) fn requeue_current_and_suspend(&self, task: &Arc<Task>) {
        self.ready.borrow_mut().push_back(task.clone());
        self.suspend_current(task);
    }

    /// Arm a one-shot wake at `when`, suspend, then disarm it again on
    /// resume — a sleep interrupted by a cancel or an enclosing deadline
    /// must not leave its own timer live in the set, or it fires later as
    /// a spurious wakeup against whatever the task is parked on by then
    /// (spec.md P5). On resume the caller is responsible for checking
    /// `task.check_interrupt()`.
    pub(crate) fn sleep_current_until(&self, task: &Arc<Task>, when: Instant) {
        task.mark_not_ready();
        let handle = self.timers.borrow_mut().insert(task.clone(), when, None);
        task.timeouts.lock().push(handle);
        self.suspend_current(task);
        self.timers.borrow_mut().cancel(handle);
    }

    pub(crate) fn timers(&self) -> &RefCell<TimerSet> {
        &self.timers
    }

    pub(crate) fn reactor(&self) -> &RefCell<Reactor> {
        &self.reactor
    }
}

/// Called from the task trampoline once the entry closure has returned
/// or been swallowed. Performs the final swap back onto the scheduler
/// stack; the scheduler loop notices `task.state() == "finished"` right
/// after that swap returns and retires the task. Never returns — the
/// scheduler never swaps back into a finished task's stack.
pub(crate) fn finish_current_task() -> ! {
    let sched = crate::sched::current_scheduler().expect("finish_current_task outside a scheduler");
    let task = crate::sched::current_task().expect("finish_current_task outside a task");
    sched.suspend_current(&task);
    unreachable!("scheduler resumed a finished task");
}
