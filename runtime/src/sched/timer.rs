//! Per-scheduler ordered timeout storage, keyed by absolute monotonic
//! time (spec.md §4.3). Touched only by the owning scheduler thread, so
//! no internal locking is needed — unlike the cross-thread primitives,
//! this is plain scheduler-local state.

use crate::error::CancelSignal;
use crate::task::task::Task;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

/// Tie-break for entries sharing the same `when`; stable w.r.t.
/// insertion order, which is what gives nested deadlines their
/// "earliest insertion order fires first" guarantee (spec.md §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Seq(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Key {
    when: Instant,
    seq: Seq,
}

struct Entry {
    task: Arc<Task>,
    sentinel: Option<CancelSignal>,
}

/// Opaque handle returned by `insert`, used to `cancel` before it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutHandle(Key);

pub struct TimerSet {
    entries: BTreeMap<Key, Entry>,
    next_seq: u64,
}

impl TimerSet {
    pub fn new() -> TimerSet {
        TimerSet {
            entries: BTreeMap::new(),
            next_seq: 0,
        }
    }

    pub fn insert(&mut self, task: Arc<Task>, when: Instant, sentinel: Option<CancelSignal>) -> TimeoutHandle {
        let seq = self.next_seq;
        self.next_seq += 1;
        let key = Key { when, seq: Seq(seq) };
        self.entries.insert(key, Entry { task, sentinel });
        TimeoutHandle(key)
    }

    pub fn cancel(&mut self, handle: TimeoutHandle) {
        self.entries.remove(&handle.0);
    }

    pub fn earliest(&self) -> Option<Instant> {
        self.entries.keys().next().map(|k| k.when)
    }

    /// Pop and visit every entry due at or before `now`, in ascending
    /// `when`/insertion order. For entries carrying a sentinel, queue it
    /// on the task so the next cancellation point it reaches observes it
    /// (P5: earliest insertion order fires first). `on_due` is handed
    /// each task so the caller can fold it into the ready queue.
    pub fn expire(&mut self, now: Instant, mut on_due: impl FnMut(Arc<Task>)) {
        loop {
            let Some((&key, _)) = self.entries.iter().next() else {
                break;
            };
            if key.when > now {
                break;
            }
            let entry = self.entries.remove(&key).unwrap();
            if let Some(sentinel) = entry.sentinel {
                entry.task.queue_sentinel(sentinel);
            }
            on_due(entry.task);
        }
    }
}

impl Default for TimerSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::SchedulerId;
    use std::time::Duration;

    fn dummy_task(scheduler: SchedulerId) -> Arc<Task> {
        Task::new(scheduler, 64 * 1024, Box::new(|| Ok(()))).unwrap()
    }

    #[test]
    fn expires_in_ascending_order() {
        let mut ts = TimerSet::new();
        let base = Instant::now();
        let sched = SchedulerId::for_test();
        let a = dummy_task(sched);
        let b = dummy_task(sched);
        ts.insert(a.clone(), base + Duration::from_millis(10), None);
        ts.insert(b.clone(), base + Duration::from_millis(5), None);
        assert_eq!(ts.earliest(), Some(base + Duration::from_millis(5)));
        let mut order = Vec::new();
        ts.expire(base + Duration::from_millis(20), |t| order.push(t.id));
        assert_eq!(order, vec![b.id, a.id]);
        assert!(ts.earliest().is_none());
    }

    #[test]
    fn cancel_removes_before_fire() {
        let mut ts = TimerSet::new();
        let sched = SchedulerId::for_test();
        let a = dummy_task(sched);
        let handle = ts.insert(a, Instant::now() + Duration::from_secs(60), None);
        ts.cancel(handle);
        assert!(ts.earliest().is_none());
    }
}
