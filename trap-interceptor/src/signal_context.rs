//! Intercepts traps with a `SIGILL` handler.
//!
//! When the guarded thread executes an illegal instruction the kernel delivers
//! `SIGILL` to our handler along with the interrupted `ucontext`. Rather than
//! returning to the faulting instruction, the handler rewrites the context so
//! that the thread resumes in the landing routine, which jumps back to the
//! point where the guarded block was started.
//!
//! Signal dispositions are process wide, so there is only ever a single slot
//! for the guarded call, and only one call can be in flight at any time.

use crate::{debug_print, jump, Backend, Error, Guarded, TrapResult};
use std::{
    ffi::c_void,
    mem, ptr,
    sync::atomic::{AtomicBool, AtomicPtr, Ordering},
};
use trap_context::GeneralRegisters;

/// Set while a guarded call is using the backend
static IN_FLIGHT: AtomicBool = AtomicBool::new(false);
/// The jump point of the guarded call, null while its block is not executing
static JUMP_POINT: AtomicPtr<c_void> = AtomicPtr::new(ptr::null_mut());
/// The disposition that was installed before ours
static PREVIOUS: parking_lot::Mutex<Option<libc::sigaction>> = parking_lot::const_mutex(None);
/// The guarded call, if any
static ACTIVE: parking_lot::Mutex<Option<GuardedCall>> = parking_lot::const_mutex(None);

struct GuardedCall {
    /// The only thread whose traps are intercepted
    thread: libc::pthread_t,
    trapped: Option<TrapResult>,
}

// SAFETY: pthread_t is an opaque handle, only ever compared
unsafe impl Send for GuardedCall {}

/// Claims the backend for a single guarded call
struct InFlight;

impl InFlight {
    fn acquire() -> Result<Self, Error> {
        IN_FLIGHT
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| Self)
            .map_err(|_| Error::Reentrant)
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        IN_FLIGHT.store(false, Ordering::Release);
    }
}

/// Our `SIGILL` handler, restores the previous disposition when dropped
struct InstalledHandler;

impl InstalledHandler {
    fn install() -> Result<Self, Error> {
        // SAFETY: syscalls
        unsafe {
            let mut sa: libc::sigaction = mem::zeroed();
            libc::sigemptyset(&mut sa.sa_mask);
            libc::sigaddset(&mut sa.sa_mask, libc::SIGILL);
            sa.sa_sigaction = signal_handler as usize;
            sa.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;

            let mut old = mem::MaybeUninit::uninit();

            // The previous disposition must be visible to the handler before
            // the handler can possibly run, so hold the lock across the swap
            let mut previous = PREVIOUS.lock();
            if libc::sigaction(libc::SIGILL, &sa, old.as_mut_ptr()) == -1 {
                return Err(Error::Sigaction(std::io::Error::last_os_error()));
            }

            *previous = Some(old.assume_init());
        }

        log::trace!("installed SIGILL handler");

        Ok(Self)
    }
}

impl Drop for InstalledHandler {
    fn drop(&mut self) {
        let Some(previous) = PREVIOUS.lock().take() else {
            return;
        };

        // SAFETY: syscall
        if unsafe { libc::sigaction(libc::SIGILL, &previous, ptr::null_mut()) } == -1 {
            crate::fatal(&Error::Sigaction(std::io::Error::last_os_error()));
        }

        log::trace!("restored previous SIGILL disposition");
    }
}

/// Registers the calling thread as the one being guarded, the registration is
/// removed when dropped
struct ActiveCall;

impl ActiveCall {
    fn begin() -> Self {
        *ACTIVE.lock() = Some(GuardedCall {
            // SAFETY: syscall
            thread: unsafe { libc::pthread_self() },
            trapped: None,
        });

        Self
    }

    fn trapped(&self) -> Option<TrapResult> {
        ACTIVE.lock().as_mut().and_then(|call| call.trapped.take())
    }
}

impl Drop for ActiveCall {
    fn drop(&mut self) {
        ACTIVE.lock().take();
    }
}

/// Runs `block` with our `SIGILL` handler installed.
///
/// # Errors
///
/// - Another guarded call is already in flight, from this or any other thread
/// - The `SIGILL` disposition could not be changed
pub(crate) fn run_guarded<F: FnOnce()>(block: F) -> Result<Guarded, Error> {
    // Dropped in reverse order, the slot is cleared, then the handler
    // restored, then the backend released
    let _in_flight = InFlight::acquire()?;
    let _handler = InstalledHandler::install()?;
    let call = ActiveCall::begin();

    let guarded = match jump::run(&JUMP_POINT, block) {
        jump::Outcome::Completed => Guarded::Completed,
        jump::Outcome::Landed => Guarded::Trapped(call.trapped().ok_or(Error::LostTrap)?),
        jump::Outcome::Panicked(payload) => Guarded::Panicked(payload),
    };

    drop(call);

    Ok(guarded)
}

/// What to do once the handler has looked at the trap
enum Action {
    /// The context now points at the landing routine
    Resume,
    /// The trap is not ours, hand it to whoever was there before us
    Forward,
}

/// This is the actual function installed for `SIGILL`, invoked by the kernel
unsafe extern "C" fn signal_handler(sig: i32, info: *mut libc::siginfo_t, uc: *mut c_void) {
    unsafe {
        let action = {
            let mut active = ACTIVE.lock();

            match &mut *active {
                Some(call) if call.trapped.is_none() && call.thread == libc::pthread_self() => {
                    let jump_point = JUMP_POINT.load(Ordering::Acquire);

                    if jump_point.is_null() {
                        Action::Forward
                    } else {
                        let mut regs = GeneralRegisters::from_ucontext(uc);

                        call.trapped = Some(TrapResult::new(
                            regs.into(),
                            i64::from((*info).si_code),
                            Backend::SignalContext,
                        ));

                        regs.redirect_call(jump::landing_address(), jump_point as u64);
                        regs.write_ucontext(uc);

                        Action::Resume
                    }
                }
                _ => Action::Forward,
            }
        };

        match action {
            Action::Resume => {
                debug_print!("resuming trapped thread at landing routine");
            }
            Action::Forward => {
                debug_print!("forwarding SIGILL to previous disposition");
                forward(sig, info, uc);
            }
        }
    }
}

/// Hands a trap we don't own to the disposition we replaced.
///
/// If that disposition was the default, or to ignore the signal, it is
/// reinstalled so that the instruction faults again under it when we return.
unsafe fn forward(sig: i32, info: *mut libc::siginfo_t, uc: *mut c_void) {
    unsafe {
        let previous = *PREVIOUS.lock();

        let Some(previous) = previous else {
            libc::signal(sig, libc::SIG_DFL);
            return;
        };

        match previous.sa_sigaction {
            libc::SIG_DFL | libc::SIG_IGN => {
                if libc::sigaction(sig, &previous, ptr::null_mut()) == -1 {
                    libc::signal(sig, libc::SIG_DFL);
                }
            }
            action if previous.sa_flags & libc::SA_SIGINFO != 0 => {
                let action: extern "C" fn(i32, *mut libc::siginfo_t, *mut c_void) =
                    mem::transmute(action);
                action(sig, info, uc);
            }
            action => {
                let action: extern "C" fn(i32) = mem::transmute(action);
                action(sig);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn completes_without_trap() {
        let _serial = crate::TEST_SERIAL.lock();

        let mut ran = 0;
        let guarded = run_guarded(|| ran += 1).unwrap();

        assert!(matches!(guarded, Guarded::Completed));
        assert_eq!(ran, 1);
        assert!(!IN_FLIGHT.load(Ordering::Acquire));
        assert!(ACTIVE.lock().is_none());
        assert!(PREVIOUS.lock().is_none());
    }

    #[test]
    fn intercepts_illegal_instruction() {
        let _serial = crate::TEST_SERIAL.lock();

        let mut after_trap = false;
        let guarded = run_guarded(|| {
            crate::raise_bad_instruction();
            #[allow(unreachable_code)]
            {
                after_trap = true;
            }
        })
        .unwrap();

        let Guarded::Trapped(trap) = guarded else {
            panic!("expected the trap to be intercepted");
        };

        assert!(!after_trap);
        assert_eq!(trap.backend(), Backend::SignalContext);
        assert_ne!(trap.context().ip(), 0);
        assert_ne!(trap.context().sp(), 0);
        assert!(!IN_FLIGHT.load(Ordering::Acquire));
    }

    #[test]
    fn nested_calls_are_rejected() {
        let _serial = crate::TEST_SERIAL.lock();

        let mut nested = None;
        let outer = run_guarded(|| {
            nested = Some(run_guarded(|| {}));
        })
        .unwrap();

        assert!(matches!(outer, Guarded::Completed));
        assert!(matches!(nested, Some(Err(Error::Reentrant))));
        assert!(!IN_FLIGHT.load(Ordering::Acquire));
    }

    #[test]
    fn panics_are_returned_after_teardown() {
        let _serial = crate::TEST_SERIAL.lock();

        let guarded = run_guarded(|| panic!("unexpected")).unwrap();

        assert!(matches!(guarded, Guarded::Panicked(_)));
        assert!(ACTIVE.lock().is_none());
        assert!(!IN_FLIGHT.load(Ordering::Acquire));
    }
}
