//! Each stage owns one divisor and forwards whatever isn't a multiple of
//! it to the next stage, built lazily as each new prime is discovered —
//! the classic pipelined sieve, spec.md §8 scenario 1.

use fiber_runtime::channel;
use std::process::ExitCode;

const PRIME_COUNT: usize = 100;

fn main() -> ExitCode {
    env_logger::init();

    let code = fiber_runtime::main(|| {
        let mut handles = Vec::new();

        let head0 = channel::<u64>(16);
        {
            let tx = head0.clone();
            handles.push(fiber_runtime::spawn(move || {
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
        for i in 0..PRIME_COUNT {
            let p = head.recv()?;
            println!("prime #{}: {p}", i + 1);

            let next = channel::<u64>(16);
            let prev = head.clone();
            let fwd = next.clone();
            handles.push(fiber_runtime::spawn(move || {
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

    if code == 0 { ExitCode::SUCCESS } else { ExitCode::FAILURE }
}
