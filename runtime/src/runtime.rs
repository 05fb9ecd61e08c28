//! Process-wide bootstrap, the task/scheduler spawn family, and the
//! `kernel::` namespace of process-level queries (spec.md §6 "External
//! interfaces", §9 "Global mutable state... model as a process singleton
//! with explicit init/teardown").

use crate::error::RuntimeError;
use crate::ioproc::IoProcPool;
use crate::sched::scheduler::Scheduler;
use crate::sched::{SchedulerId, registry};
use crate::task::task::{Task, TaskFn, TaskId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

/// Configuration accepted by [`main`] / [`boot`]. No file-based config —
/// this core has no bootstrap/CLI layer (spec.md §1 scope).
#[derive(Debug, Clone, Copy)]
pub struct RuntimeConfig {
    pub stack_size: usize,
    pub ioproc_threads: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig { stack_size: crate::task::stack::DEFAULT_STACK_SIZE, ioproc_threads: cpu_count() }
    }
}

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);
static IOPROC_POOL: OnceLock<Arc<IoProcPool>> = OnceLock::new();
static MAIN_THREAD: OnceLock<std::thread::ThreadId> = OnceLock::new();

/// Idempotent process-wide init: ignores `SIGPIPE`, starts the io-proc
/// pool, and remembers the calling thread as "the main thread" for
/// [`kernel::is_main_thread`]. Safe to call more than once (later calls
/// are no-ops; the first caller's config wins).
pub fn boot(config: RuntimeConfig) {
    unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) };
    IOPROC_POOL.get_or_init(|| Arc::new(IoProcPool::new(config.ioproc_threads)));
    MAIN_THREAD.get_or_init(|| std::thread::current().id());
    log::info!("runtime booted: stack_size={} ioproc_threads={}", config.stack_size, config.ioproc_threads);
}

pub(crate) fn ioproc_pool() -> Arc<IoProcPool> {
    IOPROC_POOL.get_or_init(|| Arc::new(IoProcPool::new(cpu_count()))).clone()
}

/// Request process-wide shutdown. Idempotent; may be called from any
/// scheduler thread or the signal task. Wakes every registered scheduler
/// so each notices on its next loop iteration (spec.md §4.5 "Shutdown
/// protocol").
pub fn shutdown() {
    if SHUTDOWN_REQUESTED.swap(true, Ordering::AcqRel) {
        return;
    }
    log::info!("shutdown requested");
    for id in registry::all_scheduler_ids() {
        if let Some(handle) = registry::lookup(id) {
            handle.wake();
        }
    }
}

pub(crate) fn is_shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::Acquire)
}

/// Process-level queries mirroring the original's `kernel::` namespace
/// (spec.md §6).
pub mod kernel {
    pub use super::{cpu_count, is_main_thread, now, shutdown};
}

pub fn now() -> std::time::Instant {
    std::time::Instant::now()
}

pub fn cpu_count() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

pub fn is_main_thread() -> bool {
    MAIN_THREAD.get().is_some_and(|id| *id == std::thread::current().id())
}

/// A handle to a spawned task: cancel it, join it, or read its id
/// (spec.md §6 "Task API surface").
#[derive(Clone)]
pub struct TaskHandle(pub(crate) Arc<Task>);

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.0.id
    }

    /// Idempotent, monotone: requests cancellation and wakes the task if
    /// it's currently suspended (spec.md §4.2, testable-property
    /// "cancel is idempotent and monotone").
    pub fn cancel(&self) {
        crate::task::task::cancel_task(&self.0);
    }

    /// Block the current task until this one finishes. A cancellation
    /// point. Backed by the task's internal one-shot `done` channel,
    /// closed by the trampoline on exit — so concurrent joiners and
    /// joiners arriving after the task has already finished both observe
    /// `Ok(())` (spec.md §B "join").
    pub fn join(&self) -> Result<(), RuntimeError> {
        match self.0.done.recv() {
            Ok(()) | Err(RuntimeError::ChannelClosed) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// A handle to another scheduler, for targeting with [`spawn_on`].
/// Obtained from [`spawn_thread`]'s [`ThreadHandle::scheduler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerRef(pub(crate) SchedulerId);

/// A handle to an OS thread running its own scheduler, as created by
/// [`spawn_thread`].
pub struct ThreadHandle {
    join: std::thread::JoinHandle<()>,
    scheduler: SchedulerRef,
}

impl ThreadHandle {
    pub fn scheduler(&self) -> SchedulerRef {
        self.scheduler
    }

    pub fn join(self) -> std::thread::Result<()> {
        self.join.join()
    }
}

/// Spawn a task onto the calling thread's scheduler. Must be called from
/// inside a scheduler (including its bootstrap closure) or from a running
/// task on it.
pub fn spawn<F>(f: F) -> TaskHandle
where
    F: FnOnce() -> Result<(), RuntimeError> + Send + 'static,
{
    let sched = crate::sched::current_scheduler().expect("spawn() called outside a scheduler");
    let task = sched.spawn(Box::new(f) as TaskFn).expect("failed to allocate task stack");
    TaskHandle(task)
}

/// Place a freshly created task directly into `target`'s dirty queue and
/// wake it, regardless of which thread (or scheduler) is calling (spec.md
/// §4.5 "Cross-thread spawn").
pub fn spawn_on<F>(target: SchedulerRef, f: F) -> std::io::Result<TaskHandle>
where
    F: FnOnce() -> Result<(), RuntimeError> + Send + 'static,
{
    let task = Task::new(target.0, crate::task::stack::DEFAULT_STACK_SIZE, Box::new(f) as TaskFn)?;
    registry::hand_off(target.0, task.clone());
    Ok(TaskHandle(task))
}

/// Start a brand new OS thread, boot a scheduler on it, and spawn `f` as
/// its first task.
pub fn spawn_thread<F>(f: F) -> std::io::Result<ThreadHandle>
where
    F: FnOnce() -> Result<(), RuntimeError> + Send + 'static,
{
    let sched = Scheduler::new(crate::task::stack::DEFAULT_STACK_SIZE)?;
    let id = sched.id();
    let join = std::thread::Builder::new()
        .name(format!("fiber-sched-{}", id.as_u64()))
        .spawn(move || {
            if let Err(e) = sched.run(Box::new(f) as TaskFn) {
                log::error!("scheduler {id:?} loop exited with an error: {e}");
            }
        })?;
    Ok(ThreadHandle { join, scheduler: SchedulerRef(id) })
}

/// Bootstrap the calling thread as a scheduler, spawn `f` as the first
/// task (plus a daemon signal task handling `SIGINT`/`SIGTERM`), and run
/// until every non-daemon task has finished or shutdown completes.
/// Returns a process-style exit code (spec.md §6 "Task API surface").
pub fn main<F>(f: F) -> i32
where
    F: FnOnce() -> Result<(), RuntimeError> + Send + 'static,
{
    boot(RuntimeConfig::default());
    let sched = match Scheduler::new(crate::task::stack::DEFAULT_STACK_SIZE) {
        Ok(s) => s,
        Err(e) => {
            log::error!("failed to create main scheduler: {e}");
            return 1;
        }
    };
    if sched.spawn_daemon(Box::new(signal_task) as TaskFn).is_err() {
        log::error!("failed to spawn signal-handling task");
        return 1;
    }
    match sched.run(Box::new(f) as TaskFn) {
        Ok(()) => 0,
        Err(e) => {
            log::error!("scheduler loop exited with an error: {e}");
            1
        }
    }
}

/// Reads `SIGINT`/`SIGTERM` off a `signalfd` registered in the reactor and
/// calls [`shutdown`]. `SIGPIPE` is handled separately at [`boot`] (spec.md
/// §6 "Environment", §B "Signal handling").
fn signal_task() -> Result<(), RuntimeError> {
    let mut mask: libc::sigset_t = unsafe { std::mem::zeroed() };
    unsafe {
        libc::sigemptyset(&mut mask);
        libc::sigaddset(&mut mask, libc::SIGINT);
        libc::sigaddset(&mut mask, libc::SIGTERM);
        if libc::pthread_sigmask(libc::SIG_BLOCK, &mask, std::ptr::null_mut()) != 0 {
            return Err(RuntimeError::io("pthread_sigmask"));
        }
    }
    let fd = unsafe { libc::signalfd(-1, &mask, libc::SFD_NONBLOCK | libc::SFD_CLOEXEC) };
    if fd < 0 {
        return Err(RuntimeError::io("signalfd"));
    }
    crate::task::this_task::set_name("signal");

    let result = (|| -> Result<(), RuntimeError> {
        loop {
            crate::reactor::wait_readable(fd, None)?;
            let mut info: libc::signalfd_siginfo = unsafe { std::mem::zeroed() };
            let n = unsafe {
                libc::read(fd, &mut info as *mut _ as *mut libc::c_void, std::mem::size_of::<libc::signalfd_siginfo>())
            };
            if n > 0 {
                log::info!("received signal {}, shutting down", info.ssi_signo);
                shutdown();
            }
        }
    })();

    unsafe { libc::close(fd) };
    match result {
        Err(e) if e.is_cancellation() => Ok(()),
        other => other,
    }
}
