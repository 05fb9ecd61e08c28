//! Minimal CPU-register save/restore over a caller-owned stack buffer.
//!
//! One entry point in each direction: [`Context::new`] prepares a fresh
//! context so its first resume enters `entry(arg)`, and [`swap`] saves the
//! caller's machine state and restores the callee's.
//!
//! Signal mask is deliberately **not** saved — `swap` is a plain register
//! save/restore, not a syscall, which is why it's fast enough to call on
//! every suspension point. A `ucontext`-based implementation would save
//! the signal mask too, at the cost of a syscall per switch.

#[cfg(not(target_arch = "x86_64"))]
compile_error!("fiber-runtime's context switch is implemented for x86_64 only");

use std::arch::naked_asm;

/// Saved callee-saved registers plus the instruction pointer to resume at.
/// Layout is load-bearing: `switch` and `trampoline_entry` address these
/// fields by fixed offset.
#[repr(C)]
pub struct Context {
    rsp: u64,
}

impl Context {
    /// Build a context whose first `swap`-in begins executing
    /// `entry(arg)` at the top of `stack_top` (must be 16-byte aligned
    /// per the SysV ABI before the call-frame adjustment below).
    ///
    /// # Safety
    /// `stack_top` must point one-past-the-end of a writable region of at
    /// least a few hundred bytes, and must remain valid and exclusively
    /// owned for the lifetime of this context.
    pub unsafe fn new(stack_top: *mut u8, entry: extern "C" fn(u64) -> !) -> Context {
        unsafe {
            // Build an initial frame so that the first `ret` inside
            // `switch` lands on `trampoline_entry`, and `trampoline_entry`
            // finds `entry` and the initial arg above it on the stack.
            let mut sp = (stack_top as usize & !0xf) as *mut u64;

            // Top-of-stack slot trampoline_entry pops `entry` from.
            sp = sp.sub(1);
            sp.write(entry as usize as u64);

            // Fake return address: switch's `ret` resumes here.
            sp = sp.sub(1);
            sp.write(trampoline_entry as usize as u64);

            // Six callee-saved registers (rbx, rbp, r12-r15), zeroed;
            // switch pops these back off before the `ret` above.
            for _ in 0..6 {
                sp = sp.sub(1);
                sp.write(0);
            }

            Context { rsp: sp as u64 }
        }
    }

    /// An empty context used only as the `from` side of the very first
    /// swap on a scheduler thread (there is no prior task to resume).
    pub fn empty() -> Context {
        Context { rsp: 0 }
    }
}

/// Lands here on a task's first resume. Pops `entry` (pushed by
/// `Context::new`) and the initial arg (passed in `rdi` by `switch`),
/// then tail-calls into it. `entry` never returns.
#[unsafe(naked)]
unsafe extern "C" fn trampoline_entry(arg: u64) -> ! {
    naked_asm!(
        "pop rax",     // entry fn, pushed by Context::new; leaves rsp 16-aligned
        "call rax",    // `call`, not `jmp`: gives entry's prologue the rsp%16==8 it expects
        "ud2",         // entry is `-> !`; a return here is a bug, not a valid continuation
    )
}

/// Save the running context into `from`, restore `to`, and resume it
/// passing `arg` in `rdi`. Returns whatever integer the reciprocal swap
/// back into `from` was given.
///
/// # Safety
/// `from` and `to` must each be either freshly built via [`Context::new`]
/// or previously suspended by a prior `swap`. Passing the same `Context`
/// as both is undefined.
#[unsafe(naked)]
pub unsafe extern "C" fn swap(from: *mut Context, to: *const Context, arg: u64) -> u64 {
    naked_asm!(
        "push rbx",
        "push rbp",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov [rdi], rsp",   // from.rsp = rsp
        "mov rsp, [rsi]",   // rsp = to.rsp
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbp",
        "pop rbx",
        // `arg` has to land in two different places depending on who's
        // on the other end of this `ret`: `trampoline_entry` expects its
        // `arg` parameter in rdi (a fresh context's first resume behaves
        // like a call into it), while a previously-suspended `swap` call
        // resumes mid-function and returns to its caller by plain `ret`,
        // which needs the u64 return value in rax. Setting both covers
        // either destination with one instruction sequence.
        "mov rdi, rdx",
        "mov rax, rdx",
        "ret",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::stack::Stack;
    use std::sync::atomic::{AtomicU64, Ordering};

    static SEEN: AtomicU64 = AtomicU64::new(0);
    /// Set by the test to point at its own suspended context just before
    /// switching into the task; `entry` has no closure captures (it must
    /// be a plain `extern "C" fn`), so this is the handoff.
    static mut RETURN_TO: *mut Context = std::ptr::null_mut();

    extern "C" fn entry(arg: u64) -> ! {
        SEEN.store(arg, Ordering::SeqCst);
        unsafe {
            let return_to = RETURN_TO;
            let mut scratch = Context::empty();
            swap(&mut scratch, return_to, 99);
        }
        unreachable!("swap back into caller must not return here");
    }

    #[test]
    fn switches_into_entry_and_back() {
        let stack = Stack::new(64 * 1024).unwrap();
        let task_ctx = unsafe { Context::new(stack.top(), entry) };
        let mut caller_ctx = Context::empty();
        unsafe {
            RETURN_TO = &mut caller_ctx;
            let result = swap(&mut caller_ctx, &task_ctx, 42);
            assert_eq!(SEEN.load(Ordering::SeqCst), 42);
            assert_eq!(result, 99);
        }
    }
}
