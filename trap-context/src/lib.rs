//! Portable types describing the state of a thread at the point it raised a
//! trap, along with conversions to and from the contexts the kernel hands to
//! trap handlers.
//!
//! Only the x86_64 register file is described. The layout of
//! [`GeneralRegisters`] follows Darwin's `x86_thread_state64_t`, which makes it
//! trivial to move between it and the state carried in a mach exception
//! message, see [`GeneralRegisters::from_thread_state`].

// crate-specific exceptions:
#![allow(unsafe_code, nonstandard_style)]

mod registers;
mod thread_state;

pub use registers::{GeneralRegisters, MachineContextSnapshot, RED_ZONE_SIZE};
pub use thread_state::{X86_THREAD_STATE64, X86_THREAD_STATE64_COUNT};

cfg_if::cfg_if! {
    if #[cfg(all(any(target_os = "linux", target_os = "android"), target_arch = "x86_64"))] {
        mod linux;
        pub use linux::*;
    } else if #[cfg(all(target_os = "macos", target_arch = "x86_64"))] {
        mod mac;
    }
}
