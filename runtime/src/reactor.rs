//! Edge-triggered fd readiness, integrated one per scheduler (spec.md §4.4).
//!
//! Wraps `epoll` directly (no `mio`/`polling` — the teacher reaches for
//! `libc` for anything syscall-shaped, and this crate follows suit). Per
//! fd, at most one reader task and one writer task; the event mask pushed
//! to `epoll_ctl` is the union of whichever of the two are set. A fd is
//! deregistered the instant both are empty.

use crate::error::RuntimeError;
use crate::task::task::Task;
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Read,
    Write,
}

struct FdSlot {
    reader: Option<Arc<Task>>,
    writer: Option<Arc<Task>>,
}

impl FdSlot {
    fn empty() -> FdSlot {
        FdSlot { reader: None, writer: None }
    }

    fn is_empty(&self) -> bool {
        self.reader.is_none() && self.writer.is_none()
    }

    /// `EPOLLET` always set: the multiplexer runs edge-triggered (spec.md
    /// §4.4 "Edge-triggered discipline").
    fn mask(&self) -> u32 {
        let mut m = libc::EPOLLET as u32;
        if self.reader.is_some() {
            m |= libc::EPOLLIN as u32;
        }
        if self.writer.is_some() {
            m |= libc::EPOLLOUT as u32;
        }
        m
    }
}

pub struct Reactor {
    epoll_fd: RawFd,
    wake_fd: RawFd,
    timer_fd: RawFd,
    slots: HashMap<RawFd, FdSlot>,
    events: Vec<libc::epoll_event>,
}

impl Reactor {
    pub fn new() -> std::io::Result<Reactor> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(std::io::Error::last_os_error());
        }
        let wake_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wake_fd < 0 {
            let e = std::io::Error::last_os_error();
            unsafe { libc::close(epoll_fd) };
            return Err(e);
        }
        let timer_fd = unsafe {
            libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC)
        };
        if timer_fd < 0 {
            let e = std::io::Error::last_os_error();
            unsafe {
                libc::close(epoll_fd);
                libc::close(wake_fd);
            }
            return Err(e);
        }

        let mut reactor = Reactor {
            epoll_fd,
            wake_fd,
            timer_fd,
            slots: HashMap::new(),
            events: Vec::with_capacity(256),
        };
        reactor.add_fixed(wake_fd)?;
        reactor.add_fixed(timer_fd)?;
        log::trace!("reactor initialized: epoll={epoll_fd} wake={wake_fd} timer={timer_fd}");
        Ok(reactor)
    }

    fn add_fixed(&self, fd: RawFd) -> std::io::Result<()> {
        let mut ev = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLET) as u32,
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut ev) };
        if rc < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn wake_fd(&self) -> RawFd {
        self.wake_fd
    }

    /// Register `task` as the waiter for `dir` on `fd`. Run only from the
    /// scheduler's `post` hook, after the task has already swapped away —
    /// this closes the lost-wakeup race where `fd` becomes ready before
    /// the task parks (spec.md §4.4, §9 "post-swap registration").
    ///
    /// # Panics
    /// If `dir` already has a waiter registered on `fd` — a programming
    /// error per spec.md §4.4 ("a second attempt ... is asserted").
    pub fn register_waiter(&mut self, fd: RawFd, dir: Direction, task: Arc<Task>) {
        let slot = self.slots.entry(fd).or_insert_with(FdSlot::empty);
        let was_empty = slot.is_empty();
        match dir {
            Direction::Read => {
                assert!(slot.reader.is_none(), "double wait_fd(read) on fd {fd}");
                slot.reader = Some(task);
            }
            Direction::Write => {
                assert!(slot.writer.is_none(), "double wait_fd(write) on fd {fd}");
                slot.writer = Some(task);
            }
        }
        let mut ev = libc::epoll_event { events: slot.mask(), u64: fd as u64 };
        let op = if was_empty { libc::EPOLL_CTL_ADD } else { libc::EPOLL_CTL_MOD };
        let rc = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut ev) };
        if rc < 0 {
            log::error!("epoll_ctl({op}) on fd {fd} failed: {}", std::io::Error::last_os_error());
        } else {
            log::trace!("registered fd {fd} for {dir:?}");
        }
    }

    /// Unwire `dir`'s waiter on `fd` without waking anyone — used on
    /// cancel, deadline fire, or after a readiness event has already been
    /// delivered (idempotent: a no-op if `dir` has no waiter).
    pub fn remove_waiter(&mut self, fd: RawFd, dir: Direction) {
        let Some(slot) = self.slots.get_mut(&fd) else { return };
        match dir {
            Direction::Read => slot.reader = None,
            Direction::Write => slot.writer = None,
        }
        if slot.is_empty() {
            self.slots.remove(&fd);
            let rc = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
            if rc < 0 {
                log::warn!("epoll_ctl(DEL) on fd {fd} failed: {}", std::io::Error::last_os_error());
            }
        } else {
            let mut ev = libc::epoll_event { events: slot.mask(), u64: fd as u64 };
            let rc = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_MOD, fd, &mut ev) };
            if rc < 0 {
                log::warn!("epoll_ctl(MOD) on fd {fd} failed: {}", std::io::Error::last_os_error());
            }
        }
    }

    /// One tick of the multiplexer. Arms the timer fd to the soonest
    /// pending deadline (precise wakeup, unlike `epoll_wait`'s millisecond
    /// rounding — spec.md §4.4 "Timer fd"), blocks, then wakes every task
    /// whose fd became ready via `on_ready`.
    pub fn poll(&mut self, timeout: Option<Duration>, mut on_ready: impl FnMut(Arc<Task>)) -> Result<(), RuntimeError> {
        self.arm_timer(timeout);

        // epoll's own timeout is just a backstop; the timerfd gives the
        // precise wakeup. Block indefinitely and let whichever fires first
        // (timerfd, a waited fd, or the wake fd) break us out.
        let epoll_timeout_ms = -1;

        self.events.resize(self.events.capacity().max(64), unsafe { std::mem::zeroed() });
        let n = loop {
            let rc = unsafe {
                libc::epoll_wait(
                    self.epoll_fd,
                    self.events.as_mut_ptr(),
                    self.events.len() as libc::c_int,
                    epoll_timeout_ms,
                )
            };
            if rc < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    log::warn!("epoll_wait interrupted by signal, retrying");
                    continue;
                }
                return Err(RuntimeError::io("epoll_wait"));
            }
            break rc as usize;
        };

        for i in 0..n {
            let ev = self.events[i];
            let fd = ev.u64 as RawFd;
            if fd == self.wake_fd {
                self.drain_eventfd(self.wake_fd);
                continue;
            }
            if fd == self.timer_fd {
                self.drain_eventfd(self.timer_fd);
                continue;
            }
            self.fire(fd, ev.events, &mut on_ready);
        }
        Ok(())
    }

    fn arm_timer(&mut self, timeout: Option<Duration>) {
        let spec = match timeout {
            Some(d) => libc::itimerspec {
                it_interval: libc::timespec { tv_sec: 0, tv_nsec: 0 },
                it_value: libc::timespec {
                    tv_sec: d.as_secs() as libc::time_t,
                    // timerfd treats an all-zero it_value as "disarm", so a
                    // same-instant deadline is nudged to the smallest
                    // representable positive delay instead of 0.
                    tv_nsec: (d.subsec_nanos() as i64).max(1),
                },
            },
            None => libc::itimerspec {
                it_interval: libc::timespec { tv_sec: 0, tv_nsec: 0 },
                it_value: libc::timespec { tv_sec: 0, tv_nsec: 0 },
            },
        };
        let rc = unsafe { libc::timerfd_settime(self.timer_fd, 0, &spec, std::ptr::null_mut()) };
        if rc < 0 {
            log::warn!("timerfd_settime failed: {}", std::io::Error::last_os_error());
        }
    }

    fn drain_eventfd(&self, fd: RawFd) {
        let mut buf: u64 = 0;
        loop {
            let rc = unsafe { libc::read(fd, &mut buf as *mut u64 as *mut libc::c_void, 8) };
            if rc < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() != std::io::ErrorKind::WouldBlock {
                    log::warn!("read of fd {fd} failed: {err}");
                }
                break;
            }
            if rc == 0 {
                break;
            }
        }
    }

    fn fire(&mut self, fd: RawFd, events: u32, on_ready: &mut impl FnMut(Arc<Task>)) {
        let Some(slot) = self.slots.get_mut(&fd) else {
            log::warn!("epoll event for untracked fd {fd}");
            return;
        };
        // HUP/ERR wake both directions — the caller discovers the exact
        // condition via the subsequent read/write return (spec.md §4.4).
        let readable = events & (libc::EPOLLIN | libc::EPOLLHUP | libc::EPOLLERR) as u32 != 0;
        let writable = events & (libc::EPOLLOUT | libc::EPOLLHUP | libc::EPOLLERR) as u32 != 0;

        if readable {
            if let Some(task) = slot.reader.take() {
                on_ready(task);
            }
        }
        if writable {
            if let Some(task) = slot.writer.take() {
                on_ready(task);
            }
        }

        if slot.is_empty() {
            self.slots.remove(&fd);
            let rc = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
            if rc < 0 {
                log::warn!("epoll_ctl(DEL) on fd {fd} failed: {}", std::io::Error::last_os_error());
            }
        } else {
            let mut ev = libc::epoll_event { events: slot.mask(), u64: fd as u64 };
            let rc = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_MOD, fd, &mut ev) };
            if rc < 0 {
                log::warn!("epoll_ctl(MOD) on fd {fd} failed: {}", std::io::Error::last_os_error());
            }
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll_fd);
            libc::close(self.wake_fd);
            libc::close(self.timer_fd);
        }
    }
}

/// Suspend the current task until `fd` is ready for `dir`, or `deadline`
/// passes. A cancellation point (spec.md §5).
fn wait_fd(fd: RawFd, dir: Direction, deadline: Option<Instant>) -> Result<(), RuntimeError> {
    let task = crate::sched::current_task().expect("wait_fd called outside a task");
    let _cp = crate::task::task::CancellationPoint::enter(&task);
    task.check_interrupt()?;

    let sched = crate::sched::current_scheduler().expect("wait_fd called outside a scheduler");

    task.mark_not_ready();
    // A fired fd-wait deadline must be distinguishable from the fd
    // actually becoming ready — `poll()` below tells "ready" from
    // "gave up" purely by whether this call returns `Err`. Reusing
    // `DeadlineReached` (rather than a bare wakeup with no sentinel)
    // is what makes that distinction possible.
    let timeout_handle = deadline.map(|when| {
        let h = sched.timers().borrow_mut().insert(
            task.clone(),
            when,
            Some(crate::error::CancelSignal::DeadlineReached),
        );
        task.timeouts.lock().push(h);
        h
    });

    // Deferred to run on the scheduler's own stack right after this task
    // swaps away, so the fd can't become ready and race the park.
    let post_task = task.clone();
    let post_sched = sched.clone();
    *task.post.lock() = Some(Box::new(move || {
        post_sched.reactor().borrow_mut().register_waiter(fd, dir, post_task);
    }));

    sched.suspend_current(&task);

    sched.reactor().borrow_mut().remove_waiter(fd, dir);
    if let Some(h) = timeout_handle {
        sched.timers().borrow_mut().cancel(h);
    }
    task.check_interrupt()
}

/// Waits for `fd` to become readable. `Ok` means it did; `Err` carries
/// whichever of cancellation or a past `deadline` stopped the wait first.
pub fn wait_readable(fd: RawFd, deadline: Option<Instant>) -> Result<(), RuntimeError> {
    wait_fd(fd, Direction::Read, deadline)
}

/// Waits for `fd` to become writable. See [`wait_readable`].
pub fn wait_writable(fd: RawFd, deadline: Option<Instant>) -> Result<(), RuntimeError> {
    wait_fd(fd, Direction::Write, deadline)
}

bitflags::bitflags! {
    /// Interest/readiness bits for [`poll`] — a `libc::pollfd`-shaped
    /// veneer over the per-fd edge-triggered primitive.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PollEvents: u32 {
        const READ = 0b01;
        const WRITE = 0b10;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PollFd {
    pub fd: RawFd,
    pub events: PollEvents,
    pub revents: PollEvents,
}

impl PollFd {
    pub fn new(fd: RawFd, events: PollEvents) -> PollFd {
        PollFd { fd, events, revents: PollEvents::empty() }
    }
}

/// One sub-task's outcome, fanned into `poll`'s rendezvous channel: either
/// it saw its direction become ready, or it gave up (canceled/deadline).
enum Outcome {
    Ready { fd_index: usize, dir: PollEvents },
    GaveUp,
}

/// Level-over-edge veneer (spec.md §6 "Reactor helpers"): races one
/// sub-task per requested direction against a shared fan-in channel, and
/// reports how many fds had at least one requested direction become ready
/// before `deadline`. Layered entirely on `wait_fd`/`spawn`/`Channel` — the
/// reactor itself knows nothing about multi-fd polling.
pub fn poll(fds: &mut [PollFd], deadline: Option<Instant>) -> Result<usize, RuntimeError> {
    let fan_in = crate::sync::channel::channel::<Outcome>(fds.len().max(1) * 2);
    let mut workers = Vec::with_capacity(fds.len() * 2);
    let mut outstanding = 0usize;

    for (i, pf) in fds.iter().enumerate() {
        if pf.events.contains(PollEvents::READ) {
            let tx = fan_in.clone();
            workers.push(crate::runtime::spawn(move || {
                let outcome = if wait_readable(pf.fd, deadline).is_ok() {
                    Outcome::Ready { fd_index: i, dir: PollEvents::READ }
                } else {
                    Outcome::GaveUp
                };
                let _ = tx.send(outcome);
                Ok(())
            }));
            outstanding += 1;
        }
        if pf.events.contains(PollEvents::WRITE) {
            let tx = fan_in.clone();
            workers.push(crate::runtime::spawn(move || {
                let outcome = if wait_writable(pf.fd, deadline).is_ok() {
                    Outcome::Ready { fd_index: i, dir: PollEvents::WRITE }
                } else {
                    Outcome::GaveUp
                };
                let _ = tx.send(outcome);
                Ok(())
            }));
            outstanding += 1;
        }
    }

    let mut ready = vec![false; fds.len()];
    let mut count = 0;
    while outstanding > 0 && count < fds.len() {
        match fan_in.recv() {
            Ok(Outcome::Ready { fd_index, dir }) => {
                fds[fd_index].revents |= dir;
                if !ready[fd_index] {
                    ready[fd_index] = true;
                    count += 1;
                }
            }
            Ok(Outcome::GaveUp) => {}
            Err(_) => break,
        }
        outstanding -= 1;
    }

    for w in &workers {
        w.cancel();
    }
    for w in workers {
        let _ = w.join();
    }
    Ok(count)
}
