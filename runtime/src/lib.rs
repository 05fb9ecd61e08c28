//! M:N cooperative fiber runtime: stack-switched tasks scheduled onto a
//! small number of OS threads, an edge-triggered epoll reactor, and the
//! task-level synchronization primitives (channels, qutex/rendez,
//! deadlines) built on top of them.
//!
//! Modeled on a stackful-coroutine-plus-epoll runtime: there is no
//! preemption. A task runs until it calls something that suspends it
//! (channel send/recv, a qutex lock, an fd wait, a sleep) or returns.
//! Cooperative scheduling means a task that never suspends starves every
//! other task on its scheduler.

pub mod error;
pub mod ioproc;
pub mod reactor;
pub mod runtime;
pub mod sched;
pub mod sync;
pub mod task;

pub use error::RuntimeError;
pub use reactor::{Direction, PollEvents, PollFd, poll, wait_readable, wait_writable};
pub use runtime::{RuntimeConfig, SchedulerRef, TaskHandle, ThreadHandle, boot, kernel, main, spawn, spawn_on, spawn_thread};
pub use sync::channel::{Channel, RecvDisposition, SendDisposition, channel};
pub use sync::deadline::Deadline;
pub use sync::qutex::{Qutex, QutexGuard};
pub use sync::rendez::Rendez;
pub use task::this_task;
