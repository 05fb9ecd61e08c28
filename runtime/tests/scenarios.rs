//! End-to-end scenarios exercising the scheduler, reactor, and sync
//! primitives together rather than in isolation.
//!
//! None of these call `fiber_runtime::kernel::shutdown()`: that flag is a
//! process-wide singleton with no reset, and `cargo test` runs every test
//! in this binary in the same process — a shutdown call here would leak
//! into whichever other test happens to run afterward. Termination is via
//! explicit `TaskHandle::cancel`/`join` or natural completion instead.

use fiber_runtime::sync::qutex::Qutex;
use fiber_runtime::sync::rendez::Rendez;
use fiber_runtime::{Deadline, channel, spawn, spawn_thread, this_task, wait_readable};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[test]
fn prime_sieve_first_five_are_2_3_5_7_11() {
    let primes = Arc::new(Mutex::new(Vec::new()));
    let collected = primes.clone();

    let code = fiber_runtime::main(move || {
        let mut handles = Vec::new();

        let head0 = channel::<u64>(16);
        {
            let tx = head0.clone();
            handles.push(spawn(move || {
                let mut n = 2u64;
                loop {
                    if tx.send(n).is_err() {
                        break;
                    }
                    n += 1;
                }
                Ok(())
            }));
        }

        let mut head = head0;
        for _ in 0..100 {
            let p = head.recv()?;
            collected.lock().unwrap().push(p);

            let next = channel::<u64>(16);
            let prev = head.clone();
            let fwd = next.clone();
            handles.push(spawn(move || {
                loop {
                    match prev.recv() {
                        Ok(v) if v % p != 0 => {
                            if fwd.send(v).is_err() {
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(_) => break,
                    }
                }
                Ok(())
            }));
            head = next;
        }

        for h in &handles {
            h.cancel();
        }
        for h in handles {
            let _ = h.join();
        }
        Ok(())
    });

    assert_eq!(code, 0);
    assert_eq!(&primes.lock().unwrap()[..5], &[2, 3, 5, 7, 11]);
}

#[test]
fn ring_of_ten_relays_ten_thousand_messages() {
    const N: usize = 10;
    const M: u64 = 1000;

    let relayed = Arc::new(AtomicU64::new(0));
    let counter = relayed.clone();

    let code = fiber_runtime::main(move || {
        let total = N as u64 * M;
        let chans: Vec<_> = (0..N).map(|_| channel::<u64>(1)).collect();

        let mut handles = Vec::new();
        for i in 0..N {
            let in_ch = chans[i].clone();
            let out_ch = chans[(i + 1) % N].clone();
            let counter = counter.clone();
            handles.push(spawn(move || {
                loop {
                    let v = match in_ch.recv() {
                        Ok(v) => v,
                        Err(_) => break,
                    };
                    if v >= total {
                        break;
                    }
                    counter.fetch_add(1, Ordering::Relaxed);
                    if out_ch.send(v + 1).is_err() {
                        break;
                    }
                }
                Ok(())
            }));
        }

        chans[0].send(0)?;
        while counter.load(Ordering::Relaxed) < total {
            this_task::yield_now();
        }
        for c in &chans {
            c.close();
        }
        for h in handles {
            let _ = h.join();
        }
        Ok(())
    });

    assert_eq!(code, 0);
    assert_eq!(relayed.load(Ordering::Relaxed), N as u64 * M);
}

#[test]
fn channel_close_races_two_receivers() {
    let closed_count = Arc::new(AtomicU64::new(0));
    let counter = closed_count.clone();

    let code = fiber_runtime::main(move || {
        let ch = channel::<u64>(0);

        let mut handles = Vec::new();
        for _ in 0..2 {
            let rx = ch.clone();
            let counter = counter.clone();
            handles.push(spawn(move || {
                if let Err(fiber_runtime::RuntimeError::ChannelClosed) = rx.recv() {
                    counter.fetch_add(1, Ordering::Relaxed);
                }
                Ok(())
            }));
        }

        {
            let closer = ch.clone();
            let counter = counter.clone();
            handles.push(spawn(move || {
                this_task::yield_now();
                closer.close();
                counter.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }));
        }

        for h in handles {
            let _ = h.join();
        }
        Ok(())
    });

    assert_eq!(code, 0);
    assert_eq!(closed_count.load(Ordering::Relaxed), 3);
}

#[test]
fn deadline_fires_then_yields_are_benign() {
    let fired = Arc::new(AtomicBool::new(false));
    let recovered = Arc::new(AtomicBool::new(false));
    let f = fired.clone();
    let r = recovered.clone();

    let code = fiber_runtime::main(move || {
        let h = spawn(move || {
            let mut deadline = Deadline::new(Duration::from_millis(10));
            match this_task::sleep_for(Duration::from_millis(200)) {
                Err(e) if e.is_cancellation() => f.store(true, Ordering::SeqCst),
                other => other?,
            }
            deadline.cancel();
            this_task::yield_now();
            this_task::yield_now();
            r.store(true, Ordering::SeqCst);
            Ok(())
        });
        let _ = h.join();
        Ok(())
    });

    assert_eq!(code, 0);
    assert!(fired.load(Ordering::SeqCst));
    assert!(recovered.load(Ordering::SeqCst));
}

#[test]
fn cross_thread_handoff_preserves_every_value() {
    let ch = channel::<i32>(0);
    let ch_b = ch.clone();
    let received = Arc::new(AtomicU64::new(0));
    let counter = received.clone();

    let code = fiber_runtime::main(move || {
        let thread_b = spawn_thread(move || {
            for _ in 0..1000 {
                ch_b.send(42)?;
            }
            Ok(())
        })
        .expect("failed to start scheduler B");

        for _ in 0..1000 {
            let v = ch.recv()?;
            assert_eq!(v, 42);
            counter.fetch_add(1, Ordering::Relaxed);
        }
        let _ = thread_b.join();
        Ok(())
    });

    assert_eq!(code, 0);
    assert_eq!(received.load(Ordering::Relaxed), 1000);
}

#[test]
fn fd_wait_cancel_then_rewaited_by_new_task() {
    let mut fds = [0i32; 2];
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
    assert_eq!(rc, 0, "pipe2 failed: {}", std::io::Error::last_os_error());
    let read_fd = fds[0];
    let write_fd = fds[1];

    let interrupted = Arc::new(AtomicBool::new(false));
    let rewaited_ok = Arc::new(AtomicBool::new(false));
    let i = interrupted.clone();
    let ok2 = rewaited_ok.clone();

    let code = fiber_runtime::main(move || {
        let r = spawn(move || {
            if let Err(e) = wait_readable(read_fd, None) {
                if e.is_cancellation() {
                    i.store(true, Ordering::SeqCst);
                }
            }
            Ok(())
        });
        spawn(move || {
            this_task::sleep_for(Duration::from_millis(10))?;
            r.cancel();
            Ok(())
        });
        let _ = r.join();

        spawn(move || {
            unsafe { libc::write(write_fd, b"x".as_ptr() as *const libc::c_void, 1) };
            Ok(())
        });
        let rr = spawn(move || {
            wait_readable(read_fd, None)?;
            Ok(())
        });
        let _ = rr.join();
        ok2.store(true, Ordering::SeqCst);

        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
        Ok(())
    });

    assert_eq!(code, 0);
    assert!(interrupted.load(Ordering::SeqCst));
    assert!(rewaited_ok.load(Ordering::SeqCst));
}

#[test]
fn qutex_and_rendez_coordinate_a_bounded_buffer() {
    struct Buf {
        items: Vec<u64>,
        cap: usize,
    }

    let code = fiber_runtime::main(move || {
        let qutex = Arc::new(Qutex::new(Buf { items: Vec::new(), cap: 2 }));
        let not_full = Arc::new(Rendez::new(qutex.clone()));
        let not_empty = Arc::new(Rendez::new(qutex.clone()));

        let mut handles = Vec::new();
        for v in 0..5u64 {
            let qutex = qutex.clone();
            let not_full = not_full.clone();
            let not_empty = not_empty.clone();
            handles.push(spawn(move || {
                let guard = qutex.lock()?;
                let mut guard = not_full.sleep(guard, |b| b.items.len() < b.cap)?;
                guard.items.push(v);
                drop(guard);
                not_empty.wakeup();
                Ok(())
            }));
        }

        let mut out = Vec::new();
        for _ in 0..5 {
            let guard = qutex.lock()?;
            let mut guard = not_empty.sleep(guard, |b| !b.items.is_empty())?;
            out.push(guard.items.remove(0));
            drop(guard);
            not_full.wakeup();
        }
        for h in handles {
            let _ = h.join();
        }
        out.sort_unstable();
        assert_eq!(out, vec![0, 1, 2, 3, 4]);
        Ok(())
    });

    assert_eq!(code, 0);
}
