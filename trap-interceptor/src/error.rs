/// An error that can occur while installing or removing a trap handler.
///
/// None of these are ever returned to users of [`crate::run_guarded`], a
/// handler that is only partially installed or removed cannot be proven safe
/// to continue from, so they are converted into a process abort.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A mach kernel call failed
    #[error("{call} failed with kern_return_t {code:#x}")]
    Kernel { call: &'static str, code: i32 },
    /// Installing or restoring the `SIGILL` disposition failed
    #[error("unable to change the SIGILL disposition")]
    Sigaction(#[source] std::io::Error),
    /// The exception listener thread could not be spawned
    #[error("unable to spawn the exception listener thread")]
    ListenerSpawn(#[source] std::io::Error),
    /// A guarded call was started while another one was already in flight on
    /// the signal-context backend, which only has a single, process wide, slot
    #[error("a guarded call is already in flight on the signal-context backend")]
    Reentrant,
    /// The selected backend is not available on this target
    #[error("the {0} backend is not supported on this target")]
    Unsupported(crate::Backend),
    /// The landing routine was reached without a trap having been recorded
    #[error("the guarded call landed without recording a trap")]
    LostTrap,
    /// An exception message could not be decoded
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// An exception message that could not be handled
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("received unexpected message id {id}")]
    UnexpectedMessage { id: i32 },
    #[error("received {count} exception codes, expected a code and a subcode")]
    UnexpectedCodeCount { count: u32 },
    #[error("received thread state flavor {flavor}, expected x86_THREAD_STATE64")]
    UnexpectedFlavor { flavor: i32 },
    #[error("received {count} words of thread state, expected at least {expected}")]
    TruncatedState { count: u32, expected: u32 },
    #[error("received a {size} byte message that cannot hold its own contents")]
    TruncatedMessage { size: u32 },
}
