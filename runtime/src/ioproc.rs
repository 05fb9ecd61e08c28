//! Fixed pool of OS threads running callbacks a task can't make
//! non-blocking itself — name resolution, `stat`, other small blocking
//! syscalls (spec.md §4.9). Submission and reply both go through an
//! ordinary [`crate::sync::channel::Channel`], so cancellation and
//! deadlines compose with `iocall` the same way they do with any other
//! suspension point.

use crate::error::RuntimeError;
use crate::sync::channel::Channel;
use std::panic::AssertUnwindSafe;
use std::sync::{mpsc, Arc, Mutex};

type Job = Box<dyn FnOnce() + Send>;

pub struct IoProcPool {
    tx: Option<mpsc::Sender<Job>>,
    workers: Vec<std::thread::JoinHandle<()>>,
}

impl IoProcPool {
    pub fn new(num_threads: usize) -> IoProcPool {
        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        let workers = (0..num_threads.max(1))
            .map(|i| {
                let rx = rx.clone();
                std::thread::Builder::new()
                    .name(format!("ioproc-{i}"))
                    .spawn(move || worker_loop(i, rx))
                    .expect("failed to spawn io-proc worker thread")
            })
            .collect();
        log::info!("io-proc pool started with {num_threads} worker threads");
        IoProcPool { tx: Some(tx), workers }
    }

    /// Submit `f`, block the current task on a reply channel, and return
    /// its result (or a captured panic translated to `RuntimeError`). A
    /// cancellation point, via the reply channel's `recv`.
    pub fn iocall<T, F>(&self, f: F) -> Result<T, RuntimeError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        // Capacity 1, not 0: the worker thread that eventually calls
        // `reply.send` is a plain OS thread, not a task, so it must never
        // take the park-on-full path (it has nothing to suspend). A
        // buffered slot of one guarantees its single reply always lands
        // without blocking, however the race against our own `recv` below
        // resolves.
        let reply = Channel::new(1);
        self.iocallasync(f, reply.clone());
        match reply.recv()? {
            Ok(v) => Ok(v),
            Err(message) => Err(RuntimeError::Io { source: std::io::Error::other(message), op: "ioproc callback panicked" }),
        }
    }

    /// Submit `f` and return immediately; the result (or captured panic
    /// message) arrives on `reply` once the worker thread finishes.
    pub fn iocallasync<T, F>(&self, f: F, reply: Channel<Result<T, String>>)
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let job: Job = Box::new(move || {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(f)).map_err(|p| panic_message(&p));
            let _ = reply.send(outcome);
        });
        if let Some(tx) = &self.tx {
            if tx.send(job).is_err() {
                log::error!("io-proc pool's worker threads have all exited; dropping submitted job");
            }
        }
    }
}

fn worker_loop(_index: usize, rx: Arc<Mutex<mpsc::Receiver<Job>>>) {
    loop {
        let job = {
            let rx = rx.lock().unwrap();
            rx.recv()
        };
        match job {
            Ok(job) => job(),
            Err(_) => break,
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

impl Drop for IoProcPool {
    fn drop(&mut self) {
        self.tx.take();
        for w in self.workers.drain(..) {
            let _ = w.join();
        }
    }
}
