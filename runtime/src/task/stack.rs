//! Guard-paged stacks for tasks.
//!
//! Each task owns a contiguous mmap'd region with an unmapped (`PROT_NONE`)
//! guard page at the low end, so a stack overflow faults instead of
//! silently corrupting whatever memory sits below it.

use std::io;
use std::ptr::NonNull;

/// Default stack size for a task, matching spec.md's "≈256 KiB".
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

fn page_size() -> usize {
    // sysconf never fails for this name on any Linux we run on.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// An owned, guard-paged stack. Exclusively owned by whichever `Task` it
/// is bound to until that task is destroyed.
pub struct Stack {
    /// Base of the mapping, including the guard page.
    mapping: NonNull<u8>,
    mapping_len: usize,
    /// Usable size, i.e. `mapping_len` minus the guard page.
    usable_len: usize,
}

// The mapping is exclusively owned; nothing aliases it except the task
// that's currently running on it, and a task runs on exactly one thread
// at a time (spec.md §3 invariant).
unsafe impl Send for Stack {}

impl Stack {
    /// Allocate a new stack of `size` usable bytes, rounded up to a whole
    /// number of pages, plus one leading guard page.
    pub fn new(size: usize) -> io::Result<Self> {
        let page = page_size();
        let usable_len = size.div_ceil(page) * page;
        let mapping_len = usable_len + page;

        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                mapping_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        // Guard page at the low end: stacks grow down, so the first
        // access past the bottom of the usable region faults here.
        let rc = unsafe { libc::mprotect(addr, page, libc::PROT_NONE) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::munmap(addr, mapping_len) };
            return Err(err);
        }

        log::trace!("allocated stack: {mapping_len} bytes ({usable_len} usable)");

        Ok(Stack {
            mapping: NonNull::new(addr as *mut u8).unwrap(),
            mapping_len,
            usable_len,
        })
    }

    /// Highest usable address; the initial stack pointer for a fresh
    /// context grows down from here.
    pub fn top(&self) -> *mut u8 {
        unsafe { self.mapping.as_ptr().add(self.mapping_len) }
    }

    /// Lowest usable address, i.e. one byte above the guard page.
    pub fn bottom(&self) -> *mut u8 {
        unsafe { self.mapping.as_ptr().add(self.mapping_len - self.usable_len) }
    }

    pub fn usable_len(&self) -> usize {
        self.usable_len
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        // P6: this only runs once the task is `finished` and reclaimed on
        // the scheduler stack, never while any register could still point
        // into this mapping.
        let rc = unsafe { libc::munmap(self.mapping.as_ptr() as *mut _, self.mapping_len) };
        if rc != 0 {
            log::error!("munmap of task stack failed: {}", io::Error::last_os_error());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_requested_size_rounded_to_page() {
        let s = Stack::new(DEFAULT_STACK_SIZE).unwrap();
        assert!(s.usable_len() >= DEFAULT_STACK_SIZE);
        assert!((s.top() as usize) > (s.bottom() as usize));
    }

    #[test]
    fn top_minus_bottom_equals_usable_len() {
        let s = Stack::new(4096).unwrap();
        assert_eq!(s.top() as usize - s.bottom() as usize, s.usable_len());
    }
}
