//! [`run_guarded`] runs a block of code and reports, instead of terminating the
//! process, whether that block raised an illegal instruction trap, which is
//! how failed preconditions and assertions in optimized native code typically
//! manifest. This makes it possible for a test harness to assert that code
//! *does* trap, and keep running afterwards.
//!
//! ```no_run
//! let trap = trap_interceptor::run_guarded(|| {
//!     trap_interceptor::raise_bad_instruction();
//! });
//! assert!(trap.is_some());
//! ```
//!
//! When a trap is intercepted the trapping thread is resumed at the point
//! [`run_guarded`] was called. Every frame between that point and the trapping
//! instruction is skipped without running destructors, so anything they owned
//! is leaked.
//!
//! Any failure to install or remove the trap handler aborts the process, as
//! continuing with a half installed handler could silently swallow real
//! crashes, or turn an intercepted trap into one.
//!
//! # Macos
//!
//! On Macos we use [exception ports](https://flylib.com/books/en/3.126.1.109/1/)
//! by default. A port is registered on the calling thread for
//! `EXC_BAD_INSTRUCTION` only, and a listener thread is spawned that receives
//! the exception message and replies with a modified thread state. Exception
//! ports take precedence over signal handlers and debuggers that use them, so
//! the calling thread's port is swapped in only for the duration of the call
//! and the previous ports are restored afterwards.
//!
//! Each call is independent, so guarded calls can be made concurrently from
//! different threads.
//!
//! # Linux
//!
//! On Linux, or on Macos with the `signal-context` feature enabled, we install
//! a handler for [`SIGILL`](https://man7.org/linux/man-pages/man7/signal.7.html)
//! that rewrites the interrupted context so the thread returns to the call
//! site. Signal dispositions are process wide, so only one guarded call can be
//! in flight at any time, a concurrent or nested call aborts the process.
//! Debuggers generally stop on `SIGILL` before our handler gets to see it.

#![allow(unsafe_code)]

#[cfg(not(target_arch = "x86_64"))]
compile_error!("trap-interceptor only supports x86_64");

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "macos")))]
compile_error!("trap-interceptor only supports Linux, Android and Macos");

mod counted;
mod error;
mod jump;
mod signal_context;

cfg_if::cfg_if! {
    if #[cfg(target_os = "macos")] {
        mod exception_port;
        mod protocol;
    } else if #[cfg(test)] {
        mod protocol;
    }
}

pub use counted::{CountedBuffer, EXC_TYPES_COUNT};
pub use error::{Error, ProtocolError};
pub use trap_context::{GeneralRegisters, MachineContextSnapshot};

use std::{any::Any, time::Duration};

#[cfg(feature = "debug-print")]
#[macro_export]
macro_rules! debug_print {
    ($s:literal) => {
        let cstr = concat!($s, "\n");
        $crate::write_stderr(cstr);
    };
}

#[cfg(not(feature = "debug-print"))]
#[macro_export]
macro_rules! debug_print {
    ($s:literal) => {};
}

/// Writes the specified string directly to stderr.
///
/// This is safe to be called from within a signal handler.
#[inline]
pub fn write_stderr(s: &'static str) {
    unsafe {
        libc::write(2, s.as_ptr().cast(), s.len());
    }
}

/// The mechanism used to intercept traps
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Backend {
    /// A thread level mach exception port, serviced by a listener thread.
    ///
    /// Only available on Macos.
    ExceptionPort,
    /// A process wide `SIGILL` handler that rewrites the interrupted context
    SignalContext,
}

impl Default for Backend {
    fn default() -> Self {
        if cfg!(all(target_os = "macos", not(feature = "signal-context"))) {
            Self::ExceptionPort
        } else {
            Self::SignalContext
        }
    }
}

impl Backend {
    /// Whether guarded calls can be made concurrently, or nested
    #[inline]
    pub fn is_reentrant(self) -> bool {
        matches!(self, Self::ExceptionPort)
    }

    /// Whether each guarded call spawns (and joins) a thread
    #[inline]
    pub fn spawns_listener_thread(self) -> bool {
        matches!(self, Self::ExceptionPort)
    }

    /// Whether traps are still intercepted while a debugger is attached.
    ///
    /// Debuggers stop on `SIGILL` before the process' handler is invoked.
    #[inline]
    pub fn debugger_compatible(self) -> bool {
        matches!(self, Self::ExceptionPort)
    }

    /// Whether the trapped thread's stack below its stack pointer is written
    /// to, the kernel pushes the signal frame there unless the thread has an
    /// alternate signal stack
    #[inline]
    pub fn writes_below_stack_pointer(self) -> bool {
        matches!(self, Self::SignalContext)
    }

    /// Whether the backend can be used on the current target
    #[inline]
    pub fn is_supported(self) -> bool {
        match self {
            Self::ExceptionPort => cfg!(target_os = "macos"),
            Self::SignalContext => true,
        }
    }

    #[inline]
    pub fn name(self) -> &'static str {
        match self {
            Self::ExceptionPort => "exception-port",
            Self::SignalContext => "signal-context",
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// What to do with a trap raised after a guarded call has already
/// intercepted one, eg. by the landing routine itself.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum RepeatedTrapPolicy {
    /// Reply to the exception with a failure, so the default handling, ie.
    /// process termination, proceeds
    #[default]
    Reject,
    /// Stop servicing the exception port once a trap has been handled, later
    /// exceptions are left to whatever handler comes after ours.
    ///
    /// The signal-context backend treats this the same as [`Self::Reject`].
    Ignore,
}

/// Configures a [`TrapInterceptor`]
#[derive(Clone, Debug, Default)]
pub struct Config {
    backend: Backend,
    // Only the exception port backend has a listener to configure
    #[cfg_attr(not(target_os = "macos"), allow(dead_code))]
    repeated_trap: RepeatedTrapPolicy,
    #[cfg_attr(not(target_os = "macos"), allow(dead_code))]
    reply_delay: Option<Duration>,
}

impl Config {
    /// Selects the backend, defaults to [`Backend::default`]
    #[inline]
    pub fn backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    /// Selects how repeated traps within a single call are handled
    #[inline]
    pub fn repeated_trap(mut self, policy: RepeatedTrapPolicy) -> Self {
        self.repeated_trap = policy;
        self
    }

    /// Delays every reply the exception port listener sends. This only exists
    /// to test that teardown waits for a slow listener.
    #[inline]
    pub fn reply_delay(mut self, delay: Duration) -> Self {
        self.reply_delay = Some(delay);
        self
    }
}

/// Details of an intercepted trap
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TrapResult {
    context: MachineContextSnapshot,
    code: i64,
    backend: Backend,
}

impl TrapResult {
    #[inline]
    pub(crate) fn new(context: MachineContextSnapshot, code: i64, backend: Backend) -> Self {
        Self {
            context,
            code,
            backend,
        }
    }

    /// The machine context of the thread at the trapping instruction
    #[inline]
    pub fn context(&self) -> &MachineContextSnapshot {
        &self.context
    }

    /// The platform specific trap code, the `si_code` of the signal, eg.
    /// `ILL_ILLOPN`, or the first code of the mach exception, eg.
    /// `EXC_I386_INVOP`
    #[inline]
    pub fn code(&self) -> i64 {
        self.code
    }

    /// The backend that intercepted the trap
    #[inline]
    pub fn backend(&self) -> Backend {
        self.backend
    }
}

/// How a guarded block finished
pub(crate) enum Guarded {
    Completed,
    Trapped(TrapResult),
    /// The block panicked, the panic is resumed once the handler is removed
    Panicked(Box<dyn Any + Send + 'static>),
}

/// Runs blocks of code with a trap handler installed
#[derive(Clone, Debug, Default)]
pub struct TrapInterceptor {
    config: Config,
}

impl TrapInterceptor {
    #[inline]
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Runs `block`, returning `None` if it completed, or `Some` if it raised
    /// an illegal instruction trap.
    ///
    /// If `block` panics the panic is resumed after the trap handler has been
    /// removed.
    ///
    /// # Aborts
    ///
    /// The process is aborted if the trap handler cannot be installed or
    /// removed, or if the signal-context backend is already in use.
    pub fn run_guarded<F: FnOnce()>(&self, block: F) -> Option<TrapResult> {
        match try_run_guarded(&self.config, block) {
            Ok(Guarded::Completed) => None,
            Ok(Guarded::Trapped(trap)) => Some(trap),
            Ok(Guarded::Panicked(payload)) => std::panic::resume_unwind(payload),
            Err(err) => fatal(&err),
        }
    }
}

/// Runs `block` with the default [`Config`], returning `None` if it completed,
/// or `Some` if it raised an illegal instruction trap.
///
/// See [`TrapInterceptor::run_guarded`].
#[inline]
pub fn run_guarded<F: FnOnce()>(block: F) -> Option<TrapResult> {
    TrapInterceptor::default().run_guarded(block)
}

/// Runs `block` with the handler for the configured backend installed, the
/// handler is always removed before this returns.
pub(crate) fn try_run_guarded<F: FnOnce()>(config: &Config, block: F) -> Result<Guarded, Error> {
    log::debug!("running guarded block with the {} backend", config.backend);

    match config.backend {
        #[cfg(target_os = "macos")]
        Backend::ExceptionPort => exception_port::run_guarded(block, config),
        #[cfg(not(target_os = "macos"))]
        Backend::ExceptionPort => Err(Error::Unsupported(config.backend)),
        Backend::SignalContext => signal_context::run_guarded(block),
    }
}

/// Logs `err` and aborts the process
#[cold]
pub(crate) fn fatal(err: &Error) -> ! {
    log::error!("fatal trap interception failure: {err}");
    eprintln!("trap-interceptor: {err}");
    std::process::abort()
}

/// Executes `ud2`, raising an illegal instruction trap
#[inline(never)]
pub fn raise_bad_instruction() -> ! {
    unsafe {
        std::arch::asm!("ud2", options(noreturn));
    }
}

/// Serializes tests that use the process wide signal-context backend
#[cfg(test)]
pub(crate) static TEST_SERIAL: parking_lot::Mutex<()> = parking_lot::const_mutex(());
