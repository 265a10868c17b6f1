//! Intercepts traps with a thread level mach exception port.
//!
//! On Macos, exception ports are the first layer that exceptions are filtered
//! through, from a thread level, to a process (task) level, and finally to a
//! host level, before the exception is converted into a Unix signal. We
//! register a port at the thread level for `EXC_BAD_INSTRUCTION` only, and
//! spawn a listener thread that receives the exception message the kernel
//! sends when the guarded block traps. The faulting thread stays suspended
//! until the listener replies, and the reply carries the thread state it
//! resumes with, which points it at the landing routine.
//!
//! Everything is allocated per call, so calls on different threads are fully
//! independent of each other.

mod ffi;
mod listener;

use crate::{
    Config, CountedBuffer, EXC_TYPES_COUNT, Error, Guarded, TrapResult, jump,
    protocol::Responder,
};
use ffi::*;
use std::{
    ffi::c_void,
    ptr,
    sync::{Arc, atomic::AtomicPtr},
};
use trap_context::X86_THREAD_STATE64;

/// State shared between the guarded thread and the listener
pub(crate) struct Shared {
    /// The jump point of the guarded call, null while its block is not
    /// executing
    jump_point: AtomicPtr<c_void>,
    /// The trap the listener recovered from, if any
    trap: parking_lot::Mutex<Option<TrapResult>>,
}

/// The exception port registrations that were replaced by ours, as a
/// structure of arrays as that is how the kernel hands them out
struct SavedPorts {
    count: u32,
    masks: CountedBuffer<et::exception_mask_t, EXC_TYPES_COUNT>,
    ports: CountedBuffer<mach_port_t, EXC_TYPES_COUNT>,
    behaviors: CountedBuffer<et::exception_behavior_t, EXC_TYPES_COUNT>,
    flavors: CountedBuffer<ts::thread_state_flavor_t, EXC_TYPES_COUNT>,
}

impl SavedPorts {
    fn new() -> Self {
        Self {
            count: EXC_TYPES_COUNT as u32,
            masks: CountedBuffer::new(),
            ports: CountedBuffer::new(),
            behaviors: CountedBuffer::new(),
            flavors: CountedBuffer::new(),
        }
    }

    #[inline]
    fn len(&self) -> usize {
        (self.count as usize).min(EXC_TYPES_COUNT)
    }
}

/// The lifecycle of a [`HandlerContext`]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Stage {
    Idle,
    ChannelAllocated,
    RightsConfigured,
    HandlerInstalled,
    ListenerRunning,
    HandlerRestored,
    ChannelReleased,
    ListenerJoined,
}

/// Everything acquired to guard a single call. Dropping it releases all of
/// it, in the order that guarantees the listener can exit.
struct HandlerContext {
    stage: Stage,
    task: mach_port_t,
    /// Our send right to the guarded thread
    thread: mach_port_t,
    /// The receive (and send) right exceptions are delivered to
    port: Option<mach_port_t>,
    /// Present while our port is registered on the thread
    saved: Option<SavedPorts>,
    listener: Option<std::thread::JoinHandle<()>>,
    shared: Arc<Shared>,
}

impl HandlerContext {
    /// Registers a new exception port on the calling thread and spawns the
    /// listener servicing it
    fn install(config: &Config) -> Result<Self, Error> {
        // SAFETY: syscalls
        let (task, thread) = unsafe { (mach_task_self(), mach_thread_self()) };

        let mut ctx = Self {
            stage: Stage::Idle,
            task,
            thread,
            port: None,
            saved: None,
            listener: None,
            shared: Arc::new(Shared {
                jump_point: AtomicPtr::new(ptr::null_mut()),
                trap: parking_lot::Mutex::new(None),
            }),
        };

        // SAFETY: syscalls
        unsafe {
            let mut port = MACH_PORT_NULL;

            // Create a receive right so that we can actually receive exception
            // messages on the port
            kern_ret("mach_port_allocate", || {
                mp::mach_port_allocate(task, port::MACH_PORT_RIGHT_RECEIVE, &mut port)
            })?;
            ctx.port = Some(port);
            ctx.advance(Stage::ChannelAllocated);

            // Add send right
            kern_ret("mach_port_insert_right", || {
                mp::mach_port_insert_right(task, port, port, msg::MACH_MSG_TYPE_MAKE_SEND)
            })?;
            ctx.advance(Stage::RightsConfigured);

            let behavior =
                // Send a catch_exception_raise_state message including the
                // thread state, which we can then modify in the reply
                et::EXCEPTION_STATE |
                // Send 64-bit code and subcode in the exception header.
                et::MACH_EXCEPTION_CODES;

            let mut saved = SavedPorts::new();

            kern_ret("thread_swap_exception_ports", || {
                thread_swap_exception_ports(
                    thread,
                    et::EXC_MASK_BAD_INSTRUCTION,
                    port,
                    behavior as _,
                    X86_THREAD_STATE64,
                    saved.masks.as_mut_ptr(),
                    &mut saved.count,
                    saved.ports.as_mut_ptr(),
                    saved.behaviors.as_mut_ptr(),
                    saved.flavors.as_mut_ptr(),
                )
            })?;
            log::trace!("replaced {} exception port registration(s)", saved.len());
            ctx.saved = Some(saved);
            ctx.advance(Stage::HandlerInstalled);

            let responder =
                Responder::new(host_ndr(), jump::landing_address(), config.repeated_trap);
            ctx.listener = Some(listener::spawn(
                port,
                ctx.shared.clone(),
                responder,
                config.reply_delay,
            )?);
            ctx.advance(Stage::ListenerRunning);
        }

        Ok(ctx)
    }

    #[inline]
    fn advance(&mut self, stage: Stage) {
        log::trace!("{:?} -> {:?}", self.stage, stage);
        self.stage = stage;
    }

    /// Releases everything that was acquired, returning the first error
    /// encountered. Calling it again after it has completed does nothing.
    ///
    /// The port is destroyed before the listener is joined, destroying the
    /// port is what wakes the listener if it is still waiting for a message.
    fn teardown(&mut self) -> Result<(), Error> {
        let mut result = Ok(());
        let mut record = |res: Result<(), Error>| {
            if result.is_ok() {
                result = res;
            }
        };

        if let Some(saved) = self.saved.take() {
            record(self.restore(&saved));
            self.advance(Stage::HandlerRestored);
        }

        if let Some(port) = self.port.take() {
            // SAFETY: syscall
            record(kern_ret("mach_port_destroy", || unsafe {
                mach_port_destroy(self.task, port)
            }));
            self.advance(Stage::ChannelReleased);
        }

        if let Some(listener) = self.listener.take() {
            // The listener aborts the process rather than returning errors
            let _res = listener.join();
            self.advance(Stage::ListenerJoined);
        }

        if self.thread != MACH_PORT_NULL {
            // SAFETY: syscall
            record(kern_ret("mach_port_deallocate", || unsafe {
                mp::mach_port_deallocate(self.task, self.thread)
            }));
            self.thread = MACH_PORT_NULL;
            self.advance(Stage::Idle);
        }

        result
    }

    /// Restores the registrations our port replaced
    fn restore(&self, saved: &SavedPorts) -> Result<(), Error> {
        let thread = self.thread;

        // SAFETY: syscalls
        unsafe {
            if saved.len() == 0 {
                return kern_ret("thread_set_exception_ports", || {
                    thread_set_exception_ports(
                        thread,
                        et::EXC_MASK_BAD_INSTRUCTION,
                        MACH_PORT_NULL,
                        et::EXCEPTION_DEFAULT as _,
                        THREAD_STATE_NONE,
                    )
                });
            }

            for i in 0..saved.len() {
                kern_ret("thread_set_exception_ports", || {
                    thread_set_exception_ports(
                        thread,
                        saved.masks[i],
                        saved.ports[i],
                        saved.behaviors[i],
                        saved.flavors[i],
                    )
                })?;
            }

            // The swap handed us a send right for each of the previous ports,
            // the registrations hold their own now
            for &port in &saved.ports.as_slice()[..saved.len()] {
                if port != MACH_PORT_NULL {
                    kern_ret("mach_port_deallocate", || {
                        mp::mach_port_deallocate(self.task, port)
                    })?;
                }
            }
        }

        Ok(())
    }
}

impl Drop for HandlerContext {
    fn drop(&mut self) {
        if let Err(err) = self.teardown() {
            crate::fatal(&err);
        }
    }
}

/// Runs `block` with an exception port registered on the calling thread.
///
/// # Errors
///
/// - Any of the syscalls made to register or restore the exception port fail
/// - The listener thread could not be spawned
pub(crate) fn run_guarded<F: FnOnce()>(block: F, config: &Config) -> Result<Guarded, Error> {
    let mut ctx = HandlerContext::install(config)?;

    let outcome = jump::run(&ctx.shared.jump_point, block);

    // The listener has been joined after this, so anything it recorded is
    // visible to us
    ctx.teardown()?;

    let trap = ctx.shared.trap.lock().take();

    Ok(match outcome {
        jump::Outcome::Completed => Guarded::Completed,
        jump::Outcome::Landed => Guarded::Trapped(trap.ok_or(Error::LostTrap)?),
        jump::Outcome::Panicked(payload) => Guarded::Panicked(payload),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{Backend, RepeatedTrapPolicy};
    use std::time::{Duration, Instant};

    fn config() -> Config {
        Config::default().backend(Backend::ExceptionPort)
    }

    #[test]
    fn saved_ports_start_at_capacity() {
        let saved = SavedPorts::new();
        assert_eq!(saved.count, 14);
        assert_eq!(saved.masks.capacity(), 14);
        assert_eq!(saved.ports.capacity(), 14);
    }

    #[test]
    fn replies_carry_host_ndr() {
        let ndr = host_ndr();
        // NDR_INT_LITTLE_ENDIAN, NDR_CHAR_ASCII, NDR_FLOAT_IEEE
        assert_eq!((ndr.int_rep, ndr.char_rep, ndr.float_rep), (1, 0, 0));
        assert_eq!(ndr.mig_vers, 0);
    }

    #[test]
    fn completes_without_trap() {
        let mut ran = 0;
        let guarded = run_guarded(|| ran += 1, &config()).unwrap();

        assert!(matches!(guarded, Guarded::Completed));
        assert_eq!(ran, 1);
    }

    #[test]
    fn intercepts_illegal_instruction() {
        let mut after_trap = false;
        let guarded = run_guarded(
            || {
                crate::raise_bad_instruction();
                #[allow(unreachable_code)]
                {
                    after_trap = true;
                }
            },
            &config(),
        )
        .unwrap();

        let Guarded::Trapped(trap) = guarded else {
            panic!("expected the trap to be intercepted");
        };

        assert!(!after_trap);
        assert_eq!(trap.backend(), Backend::ExceptionPort);
        assert_ne!(trap.context().ip(), 0);
    }

    #[test]
    fn ignore_policy_stops_listener_after_first_trap() {
        let config = config().repeated_trap(RepeatedTrapPolicy::Ignore);
        let guarded = run_guarded(|| crate::raise_bad_instruction(), &config).unwrap();

        assert!(matches!(guarded, Guarded::Trapped(_)));
    }

    #[test]
    fn teardown_waits_for_slow_listener() {
        let delay = Duration::from_millis(200);
        let start = Instant::now();

        let guarded = run_guarded(
            || crate::raise_bad_instruction(),
            &config().reply_delay(delay),
        )
        .unwrap();

        assert!(matches!(guarded, Guarded::Trapped(_)));
        assert!(start.elapsed() >= delay);
    }

    #[test]
    fn teardown_is_idempotent() {
        let mut ctx = HandlerContext::install(&config()).unwrap();
        ctx.teardown().unwrap();
        assert_eq!(ctx.stage, Stage::Idle);
        ctx.teardown().unwrap();
        assert!(ctx.listener.is_none());
        assert!(ctx.port.is_none());
    }
}
