mod shared;

use trap_interceptor::{CountedBuffer, EXC_TYPES_COUNT, raise_bad_instruction};

#[test]
fn counted_buffer_has_every_exception_type() {
    let mut buffer = CountedBuffer::<u32, EXC_TYPES_COUNT>::default();
    assert_eq!(buffer.capacity(), 14);
    assert_eq!(std::mem::size_of_val(&buffer), 14 * 4);

    let first = buffer.as_mut_ptr();
    for i in 0..EXC_TYPES_COUNT {
        // SAFETY: within capacity
        unsafe { *first.add(i) = i as u32 * 2 };
    }

    assert!(buffer.iter().enumerate().all(|(i, v)| *v == i as u32 * 2));
}

#[cfg(unix)]
fn current_sigill_action() -> libc::sigaction {
    // SAFETY: syscall
    unsafe {
        let mut old = std::mem::zeroed();
        assert_eq!(libc::sigaction(libc::SIGILL, std::ptr::null(), &mut old), 0);
        old
    }
}

#[cfg(unix)]
fn assert_same_action(expected: &libc::sigaction, actual: &libc::sigaction) {
    assert_eq!(expected.sa_sigaction, actual.sa_sigaction);
    assert_eq!(expected.sa_flags, actual.sa_flags);

    for sig in 1..32 {
        // SAFETY: both masks were filled in by sigaction
        let (e, a) = unsafe {
            (
                libc::sigismember(&expected.sa_mask, sig),
                libc::sigismember(&actual.sa_mask, sig),
            )
        };
        assert_eq!(e, a, "signal {sig} differs in sa_mask");
    }
}

#[cfg(unix)]
#[test]
fn sigill_disposition_is_restored() {
    let _serial = shared::SERIAL.lock();
    let interceptor = shared::interceptor(shared::Backend::SignalContext);

    // Setting a disposition can add flags that were not present in the one
    // the process started with, eg. glibc always adds SA_RESTORER, so the
    // baseline is the current disposition after it has been set once
    let initial = current_sigill_action();
    // SAFETY: syscall, reinstalls the disposition that is already in place
    unsafe {
        assert_eq!(libc::sigaction(libc::SIGILL, &initial, std::ptr::null_mut()), 0);
    }
    let before = current_sigill_action();
    assert_eq!(initial.sa_sigaction, before.sa_sigaction);

    assert!(interceptor.run_guarded(|| raise_bad_instruction()).is_some());
    assert_same_action(&before, &current_sigill_action());

    assert!(interceptor.run_guarded(|| {}).is_none());
    assert_same_action(&before, &current_sigill_action());
}

/// Scenarios that end the process they run in are run in a copy of this test
/// binary, this is set in the environment of that copy
#[cfg(unix)]
const CHILD_ENV: &str = "TRAP_INTERCEPTOR_CHILD";

/// Runs the single test `name` in a new process and waits for it to exit
#[cfg(unix)]
fn run_in_child(name: &str) -> std::process::ExitStatus {
    std::process::Command::new(std::env::current_exe().unwrap())
        .args([name, "--exact", "--nocapture", "--test-threads=1"])
        .env(CHILD_ENV, "1")
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .unwrap()
}

#[cfg(unix)]
fn is_child() -> bool {
    std::env::var_os(CHILD_ENV).is_some()
}

/// A trap on a thread other than the guarded one is not ours to recover, it
/// must reach the disposition that was in place before the call, which is the
/// default one that terminates the process
#[cfg(unix)]
#[test]
fn trap_on_other_thread_reaches_previous_disposition() {
    use std::os::unix::process::ExitStatusExt;

    if is_child() {
        let interceptor = shared::interceptor(shared::Backend::SignalContext);
        interceptor.run_guarded(|| {
            let other: std::thread::JoinHandle<()> = std::thread::spawn(|| {
                raise_bad_instruction();
            });
            let _res = other.join();
        });

        // Only reached if the trap was swallowed
        std::process::exit(0);
    }

    let status = run_in_child("trap_on_other_thread_reaches_previous_disposition");
    assert_eq!(status.signal(), Some(libc::SIGILL), "{status:?}");
}

/// The signal-context backend only has a single slot, a call started on
/// another thread while one is in flight aborts rather than sharing it
#[cfg(unix)]
#[test]
fn concurrent_signal_context_call_aborts() {
    use std::os::unix::process::ExitStatusExt;

    if is_child() {
        let interceptor = shared::interceptor(shared::Backend::SignalContext);
        interceptor.run_guarded(|| {
            let other = std::thread::spawn(|| {
                let _trap = shared::interceptor(shared::Backend::SignalContext).run_guarded(|| {});
            });
            let _res = other.join();
        });

        // Only reached if the second call was allowed to run
        std::process::exit(0);
    }

    let status = run_in_child("concurrent_signal_context_call_aborts");
    assert_eq!(status.signal(), Some(libc::SIGABRT), "{status:?}");
}

#[cfg(target_os = "linux")]
#[test]
fn trap_code_is_illegal_opcode() {
    let _serial = shared::SERIAL.lock();
    let interceptor = shared::interceptor(shared::Backend::SignalContext);

    let trap = interceptor
        .run_guarded(|| raise_bad_instruction())
        .expect("trap should have been intercepted");
    // ILL_ILLOPN
    assert_eq!(trap.code(), 2);
}

#[cfg(target_os = "macos")]
mod exception_port {
    use super::*;
    use std::time::{Duration, Instant};
    use trap_interceptor::{Backend, Config, RepeatedTrapPolicy, TrapInterceptor};

    #[test]
    fn concurrent_calls_are_independent() {
        let threads: Vec<_> = (0..4)
            .map(|i| {
                std::thread::spawn(move || {
                    let interceptor =
                        TrapInterceptor::new(Config::default().backend(Backend::ExceptionPort));

                    (0..16)
                        .map(|j| {
                            if (i + j) % 2 == 0 {
                                interceptor.run_guarded(|| raise_bad_instruction()).is_some()
                            } else {
                                interceptor.run_guarded(|| {}).is_none()
                            }
                        })
                        .all(|ok| ok)
                })
            })
            .collect();

        for thread in threads {
            assert!(thread.join().unwrap());
        }
    }

    #[test]
    fn slow_listener_is_joined() {
        let delay = Duration::from_millis(250);
        let interceptor = TrapInterceptor::new(
            Config::default()
                .backend(Backend::ExceptionPort)
                .reply_delay(delay),
        );

        let start = Instant::now();
        assert!(interceptor.run_guarded(|| raise_bad_instruction()).is_some());
        assert!(start.elapsed() >= delay);

        // Without a trap the listener never replies, so there is no delay
        assert!(interceptor.run_guarded(|| {}).is_none());
    }

    #[test]
    fn ignore_policy_recovers_first_trap() {
        let interceptor = TrapInterceptor::new(
            Config::default()
                .backend(Backend::ExceptionPort)
                .repeated_trap(RepeatedTrapPolicy::Ignore),
        );

        assert!(interceptor.run_guarded(|| raise_bad_instruction()).is_some());
        assert!(interceptor.run_guarded(|| {}).is_none());
    }
}
