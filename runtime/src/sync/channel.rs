//! Typed MPMC FIFO with optional bounded capacity and close semantics
//! (spec.md §4.6). Safe across schedulers: a single `parking_lot::Mutex`
//! protects the shared state, and waiters are woken through
//! `crate::sched::wake_task`, which hands off correctly whether the
//! waking side lives on the same scheduler or a different one.

use crate::error::RuntimeError;
use crate::task::task::{CancellationPoint, Task};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

enum RecvSlot<T> {
    Pending,
    Filled(T),
    Closed,
}

struct RecvWaiter<T> {
    task: Arc<Task>,
    slot: Arc<Mutex<RecvSlot<T>>>,
}

struct SendWaiter<T> {
    task: Arc<Task>,
    /// Taken by whichever side completes the handoff — a receiver direct
    /// unbuffered-transfer, or the channel itself moving it into the
    /// buffer once space frees up. `None` once taken.
    value: Arc<Mutex<Option<T>>>,
}

struct Inner<T> {
    capacity: usize,
    buffer: VecDeque<T>,
    send_waiters: VecDeque<SendWaiter<T>>,
    recv_waiters: VecDeque<RecvWaiter<T>>,
    closed: bool,
}

/// A cheaply-cloneable handle to shared channel state; every clone refers
/// to the same underlying queue (spec.md's channel is a reference type,
/// not a value type — `send`/`recv` mutate shared state).
pub struct Channel<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Channel { inner: self.inner.clone() }
    }
}

/// Non-suspending outcome of [`Channel::try_send`].
pub enum SendDisposition<T> {
    Sent,
    WouldBlock(T),
    Closed(T),
}

/// Non-suspending outcome of [`Channel::try_recv`].
pub enum RecvDisposition<T> {
    Ok(T),
    WouldBlock,
    Closed,
}

pub fn channel<T>(capacity: usize) -> Channel<T> {
    Channel::new(capacity)
}

impl<T> Channel<T> {
    pub fn new(capacity: usize) -> Channel<T> {
        Channel {
            inner: Arc::new(Mutex::new(Inner {
                capacity,
                buffer: VecDeque::new(),
                send_waiters: VecDeque::new(),
                recv_waiters: VecDeque::new(),
                closed: false,
            })),
        }
    }

    fn current_task() -> Arc<Task> {
        crate::sched::current_task().expect("channel op called outside a task")
    }

    /// Send `v`. A cancellation point when called from within a task.
    /// Fails once the channel is closed; never fails because the channel
    /// is merely full (it suspends instead).
    ///
    /// May also be called from a plain OS thread outside any task (e.g.
    /// an io-proc worker replying on a submitter's channel) — in that
    /// case there is nothing to cancel and nothing that could suspend,
    /// so the fast paths run unconditionally and only the park path
    /// below asserts it has a task to park.
    pub fn send(&self, v: T) -> Result<(), RuntimeError> {
        let task = crate::sched::current_task();
        let _cp = task.as_ref().map(|t| CancellationPoint::enter(t));
        if let Some(t) = &task {
            t.check_interrupt()?;
        }

        let value = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(RuntimeError::ChannelClosed);
            }
            if inner.capacity == 0 {
                if let Some(rw) = inner.recv_waiters.pop_front() {
                    *rw.slot.lock() = RecvSlot::Filled(v);
                    drop(inner);
                    crate::sched::wake_task(rw.task);
                    return Ok(());
                }
            } else if inner.buffer.len() < inner.capacity {
                inner.buffer.push_back(v);
                if let Some(rw) = inner.recv_waiters.pop_front() {
                    let item = inner.buffer.pop_front().unwrap();
                    *rw.slot.lock() = RecvSlot::Filled(item);
                    drop(inner);
                    crate::sched::wake_task(rw.task);
                }
                return Ok(());
            }

            // No room: park with our value for a receiver (or a future
            // buffer slot) to take. Only a task can park — a plain OS
            // thread (e.g. an io-proc worker) calling `send` on a full
            // channel it can't suspend on is a programming error; such
            // callers are expected to use a channel with enough capacity
            // that this path is never reached.
            let task = task.expect("channel send would block from outside a task");
            task.mark_not_ready();
            let value = Arc::new(Mutex::new(Some(v)));
            inner.send_waiters.push_back(SendWaiter { task: task.clone(), value: value.clone() });
            (task, value)
        };

        let (task, value) = value;
        let sched = crate::sched::current_scheduler().expect("no current scheduler");
        sched.suspend_current(&task);

        // A receiver may have taken our value in the same turn a cancel
        // or deadline was raised against us. The value is then already
        // delivered and must be reported as sent, not lost to the
        // interrupt (spec.md P3).
        if value.lock().is_none() {
            return Ok(());
        }

        if let Err(e) = task.check_interrupt() {
            // Woken by cancellation/deadline, not a real handoff: remove
            // our stale waiter entry (no-op if it was already serviced)
            // and report the value as unsent.
            let mut inner = self.inner.lock();
            inner.send_waiters.retain(|w| w.task.id != task.id);
            return Err(e);
        }

        // Not taken, not canceled: must have been woken by `close()`,
        // which wakes parked senders without touching their value so
        // they land here.
        let mut inner = self.inner.lock();
        inner.send_waiters.retain(|w| w.task.id != task.id);
        if inner.closed {
            return Err(RuntimeError::ChannelClosed);
        }
        unreachable!("woken send waiter with neither a taken value, an interrupt, nor a close")
    }

    /// Receive the next value. A cancellation point. Once closed, drains
    /// whatever remains buffered (in send order) before failing (spec.md
    /// P4).
    pub fn recv(&self) -> Result<T, RuntimeError> {
        let task = Self::current_task();
        let _cp = CancellationPoint::enter(&task);
        task.check_interrupt()?;

        let slot = {
            let mut inner = self.inner.lock();
            if let Some(v) = inner.buffer.pop_front() {
                if let Some(sw) = inner.send_waiters.pop_front() {
                    if let Some(pending) = sw.value.lock().take() {
                        inner.buffer.push_back(pending);
                    }
                    drop(inner);
                    crate::sched::wake_task(sw.task);
                }
                return Ok(v);
            }
            if inner.capacity == 0 {
                if let Some(sw) = inner.send_waiters.pop_front() {
                    let v = sw.value.lock().take().expect("send waiter value already taken");
                    drop(inner);
                    crate::sched::wake_task(sw.task);
                    return Ok(v);
                }
            }
            if inner.closed {
                return Err(RuntimeError::ChannelClosed);
            }

            task.mark_not_ready();
            let slot = Arc::new(Mutex::new(RecvSlot::Pending));
            inner.recv_waiters.push_back(RecvWaiter { task: task.clone(), slot: slot.clone() });
            slot
        };

        let sched = crate::sched::current_scheduler().expect("no current scheduler");
        sched.suspend_current(&task);

        // Check the slot before the interrupt: a sender may have
        // completed a handoff into it in the same turn a cancel or
        // deadline was also raised against us. The sender already
        // returned `Ok`, so once a value (or a close) has actually
        // landed here it must win over the interrupt, or the delivered
        // value is silently dropped (spec.md P3 "never loses a sent
        // value").
        match std::mem::replace(&mut *slot.lock(), RecvSlot::Pending) {
            RecvSlot::Filled(v) => return Ok(v),
            RecvSlot::Closed => return Err(RuntimeError::ChannelClosed),
            RecvSlot::Pending => {}
        }

        if let Err(e) = task.check_interrupt() {
            let mut inner = self.inner.lock();
            inner.recv_waiters.retain(|w| w.task.id != task.id);
            return Err(e);
        }

        unreachable!("recv woken with neither a value nor closed nor cancellation")
    }

    /// Non-suspending send.
    pub fn try_send(&self, v: T) -> SendDisposition<T> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return SendDisposition::Closed(v);
        }
        if inner.capacity == 0 {
            if let Some(rw) = inner.recv_waiters.pop_front() {
                *rw.slot.lock() = RecvSlot::Filled(v);
                drop(inner);
                crate::sched::wake_task(rw.task);
                return SendDisposition::Sent;
            }
            return SendDisposition::WouldBlock(v);
        }
        if inner.buffer.len() < inner.capacity {
            inner.buffer.push_back(v);
            if let Some(rw) = inner.recv_waiters.pop_front() {
                let item = inner.buffer.pop_front().unwrap();
                *rw.slot.lock() = RecvSlot::Filled(item);
                drop(inner);
                crate::sched::wake_task(rw.task);
            }
            return SendDisposition::Sent;
        }
        SendDisposition::WouldBlock(v)
    }

    /// Non-suspending receive.
    pub fn try_recv(&self) -> RecvDisposition<T> {
        let mut inner = self.inner.lock();
        if let Some(v) = inner.buffer.pop_front() {
            if let Some(sw) = inner.send_waiters.pop_front() {
                if let Some(pending) = sw.value.lock().take() {
                    inner.buffer.push_back(pending);
                }
                drop(inner);
                crate::sched::wake_task(sw.task);
            }
            return RecvDisposition::Ok(v);
        }
        if inner.capacity == 0 {
            if let Some(sw) = inner.send_waiters.pop_front() {
                let v = sw.value.lock().take().expect("send waiter value already taken");
                drop(inner);
                crate::sched::wake_task(sw.task);
                return RecvDisposition::Ok(v);
            }
        }
        if inner.closed {
            return RecvDisposition::Closed;
        }
        RecvDisposition::WouldBlock
    }

    /// Drain every currently-available item without blocking.
    pub fn recv_all(&self) -> Vec<T> {
        let mut out = Vec::new();
        loop {
            match self.try_recv() {
                RecvDisposition::Ok(v) => out.push(v),
                RecvDisposition::WouldBlock | RecvDisposition::Closed => break,
            }
        }
        out
    }

    /// Mark closed and wake every waiter. Idempotent.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;
        let recv_waiters = std::mem::take(&mut inner.recv_waiters);
        let send_waiters = std::mem::take(&mut inner.send_waiters);
        drop(inner);
        for rw in recv_waiters {
            *rw.slot.lock() = RecvSlot::Closed;
            crate::sched::wake_task(rw.task);
        }
        for sw in send_waiters {
            // Leave the value in place (still `Some`) so the woken sender
            // observes it as never taken and reports `ChannelClosed`.
            crate::sched::wake_task(sw.task);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Number of items currently buffered (not counting unbuffered
    /// rendezvous handoffs in flight).
    pub fn size(&self) -> usize {
        self.inner.lock().buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_send_recv_respects_capacity() {
        let c: Channel<i32> = Channel::new(1);
        assert!(matches!(c.try_send(1), SendDisposition::Sent));
        assert!(matches!(c.try_send(2), SendDisposition::WouldBlock(2)));
        assert!(matches!(c.try_recv(), RecvDisposition::Ok(1)));
        assert!(matches!(c.try_recv(), RecvDisposition::WouldBlock));
    }

    #[test]
    fn try_send_on_closed_fails_with_value() {
        let c: Channel<i32> = Channel::new(1);
        c.close();
        assert!(matches!(c.try_send(9), SendDisposition::Closed(9)));
    }

    #[test]
    fn recv_all_drains_without_blocking() {
        let c: Channel<i32> = Channel::new(4);
        for i in 0..3 {
            c.try_send(i);
        }
        assert_eq!(c.recv_all(), vec![0, 1, 2]);
    }

    #[test]
    fn close_is_idempotent() {
        let c: Channel<i32> = Channel::new(0);
        c.close();
        c.close();
        assert!(c.is_closed());
    }
}
