//! Lock-free MPSC queue used to hand tasks made ready by *other* threads
//! into this scheduler (spec.md §3 "Dirty queue", §9 design note).
//!
//! Vyukov's intrusive MPSC algorithm: non-blocking `push` from any
//! thread, single-consumer `pop` from the owning scheduler thread only.
//! Pop is lock-free but not wait-free — a pusher that has claimed a slot
//! via `head.swap` but not yet linked it into `prev.next` causes a
//! concurrent `pop` to observe a transient gap and report "empty" even
//! though a push is in flight; the next `pop` picks it up once the
//! pusher finishes linking.

use crossbeam_utils::CachePadded;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, Ordering};

struct Node<T> {
    next: AtomicPtr<Node<T>>,
    value: Option<T>,
}

impl<T> Node<T> {
    fn new(value: Option<T>) -> *mut Node<T> {
        Box::into_raw(Box::new(Node {
            next: AtomicPtr::new(std::ptr::null_mut()),
            value,
        }))
    }
}

pub struct DirtyQueue<T> {
    // `head` is hammered by every producer thread; `tail` is touched only
    // by the consumer. Padding them apart keeps a producer's cache-line
    // bouncing off `head` from also invalidating the consumer's `tail`.
    head: CachePadded<AtomicPtr<Node<T>>>,
    tail: CachePadded<std::cell::UnsafeCell<*mut Node<T>>>,
    stub: *mut Node<T>,
}

// `head` handles the multi-producer side; `tail`/pop are documented
// single-consumer only, which is the contract the scheduler upholds.
unsafe impl<T: Send> Send for DirtyQueue<T> {}
unsafe impl<T: Send> Sync for DirtyQueue<T> {}

impl<T> DirtyQueue<T> {
    pub fn new() -> Self {
        let stub = Node::new(None);
        DirtyQueue {
            head: CachePadded::new(AtomicPtr::new(stub)),
            tail: CachePadded::new(std::cell::UnsafeCell::new(stub)),
            stub,
        }
    }

    /// Push from any thread. Never blocks.
    pub fn push(&self, value: T) {
        let n = Node::new(Some(value));
        let prev = self.head.swap(n, Ordering::AcqRel);
        unsafe { (*prev).next.store(n, Ordering::Release) };
    }

    /// Pop from the single consumer thread only.
    ///
    /// # Safety
    /// Must not be called concurrently from more than one thread.
    pub unsafe fn pop(&self) -> Option<T> {
        unsafe {
            let tail = *self.tail.get();
            let next = (*tail).next.load(Ordering::Acquire);
            if tail == self.stub {
                if next.is_null() {
                    return None;
                }
                *self.tail.get() = next;
                let value = (*next).value.take();
                drop(Box::from_raw(tail));
                return value;
            }
            if !next.is_null() {
                *self.tail.get() = next;
                let value = (*tail).value.take();
                drop(Box::from_raw(tail));
                return value;
            }
            None
        }
    }

    /// Drain everything currently available, oldest first.
    ///
    /// # Safety
    /// Same single-consumer requirement as `pop`.
    pub unsafe fn drain(&self, mut f: impl FnMut(T)) {
        unsafe {
            while let Some(v) = self.pop() {
                f(v);
            }
        }
    }
}

impl<T> Drop for DirtyQueue<T> {
    fn drop(&mut self) {
        unsafe { while self.pop().is_some() {} }
        unsafe { drop(Box::from_raw(*self.tail.get())) };
    }
}

impl<T> Default for DirtyQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared handle so producers don't need to see the whole queue type.
pub type SharedDirtyQueue<T> = Arc<DirtyQueue<T>>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn fifo_per_producer() {
        let q = DirtyQueue::new();
        q.push(1);
        q.push(2);
        q.push(3);
        unsafe {
            assert_eq!(q.pop(), Some(1));
            assert_eq!(q.pop(), Some(2));
            assert_eq!(q.pop(), Some(3));
            assert_eq!(q.pop(), None);
        }
    }

    #[test]
    fn concurrent_producers_all_arrive() {
        let q = Arc::new(DirtyQueue::new());
        let mut handles = Vec::new();
        for p in 0..8 {
            let q = q.clone();
            handles.push(thread::spawn(move || {
                for i in 0..1000 {
                    q.push(p * 1000 + i);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let mut seen = Vec::new();
        unsafe { q.drain(|v| seen.push(v)) };
        seen.sort_unstable();
        let expected: Vec<i32> = (0..8000).collect();
        assert_eq!(seen, expected);
    }
}
