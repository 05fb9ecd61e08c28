//! Process-wide scheduler registry (spec.md §6 "a list of schedulers,
//! keyed by OS thread id, with `spawn_on` discovery"; §9 "global mutable
//! state... model as a process singleton with explicit init/teardown").

use crate::sched::SchedulerId;
use crate::sched::dirty_queue::DirtyQueue;
use crate::task::task::Task;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::sync::atomic::{AtomicI32, Ordering};

/// What other threads need to hand a task to this scheduler: the dirty
/// queue to push it on, and the wake fd to kick the reactor blocked in
/// `epoll_wait`.
pub struct SchedulerHandle {
    pub dirty: DirtyQueue<Arc<Task>>,
    wake_fd: AtomicI32,
}

impl SchedulerHandle {
    pub(crate) fn new() -> Self {
        SchedulerHandle {
            dirty: DirtyQueue::new(),
            wake_fd: AtomicI32::new(-1),
        }
    }

    pub(crate) fn set_wake_fd(&self, fd: i32) {
        self.wake_fd.store(fd, Ordering::Release);
    }

    pub(crate) fn wake(&self) {
        let fd = self.wake_fd.load(Ordering::Acquire);
        if fd < 0 {
            return;
        }
        let one: u64 = 1;
        let rc = unsafe {
            libc::write(
                fd,
                &one as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if rc < 0 {
            log::warn!("write to wake fd {fd} failed: {}", std::io::Error::last_os_error());
        }
    }
}

fn registry() -> &'static parking_lot::RwLock<HashMap<SchedulerId, Arc<SchedulerHandle>>> {
    static REGISTRY: OnceLock<parking_lot::RwLock<HashMap<SchedulerId, Arc<SchedulerHandle>>>> = OnceLock::new();
    REGISTRY.get_or_init(Default::default)
}

pub(crate) fn register(id: SchedulerId, handle: Arc<SchedulerHandle>) {
    registry().write().insert(id, handle);
}

pub(crate) fn unregister(id: SchedulerId) {
    registry().write().remove(&id);
}

pub fn lookup(id: SchedulerId) -> Option<Arc<SchedulerHandle>> {
    registry().read().get(&id).cloned()
}

/// Hand a task ready-made-elsewhere to its home scheduler. If the home
/// scheduler has already shut down and deregistered, the task is simply
/// dropped — matching `spawn_on`'s documented best-effort semantics
/// under shutdown races.
pub fn hand_off(id: SchedulerId, task: Arc<Task>) {
    match lookup(id) {
        Some(handle) => {
            handle.dirty.push(task);
            handle.wake();
        }
        None => log::warn!("hand_off to scheduler {id:?} which is no longer registered"),
    }
}

pub fn all_scheduler_ids() -> Vec<SchedulerId> {
    registry().read().keys().copied().collect()
}
