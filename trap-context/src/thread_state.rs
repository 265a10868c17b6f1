//! Conversion between [`GeneralRegisters`] and the `x86_THREAD_STATE64` flavor
//! of thread state carried by mach exception messages.
//!
//! Mach messages describe thread state as an array of `natural_t` (32-bit)
//! words, so a 64-bit register occupies two consecutive words, low word first.

use crate::GeneralRegisters;

/// `x86_THREAD_STATE64` from `<mach/i386/thread_status.h>`
pub const X86_THREAD_STATE64: i32 = 4;
/// `x86_THREAD_STATE64_COUNT`, the number of 32-bit words in the state
pub const X86_THREAD_STATE64_COUNT: u32 = (GeneralRegisters::COUNT * 2) as u32;

impl GeneralRegisters {
    /// Reads the register file from `x86_THREAD_STATE64` words, returning
    /// `None` if there are fewer words than the flavor requires
    pub fn from_thread_state(words: &[u32]) -> Option<Self> {
        let words = words.get(..X86_THREAD_STATE64_COUNT as usize)?;

        let mut regs = [0u64; Self::COUNT];
        for (reg, pair) in regs.iter_mut().zip(words.chunks_exact(2)) {
            *reg = u64::from(pair[0]) | (u64::from(pair[1]) << 32);
        }

        Some(Self::from_array(regs))
    }

    /// Writes the register file as `x86_THREAD_STATE64` words, returning the
    /// number of words written, or `None` if `words` is too small
    pub fn write_thread_state(&self, words: &mut [u32]) -> Option<u32> {
        let words = words.get_mut(..X86_THREAD_STATE64_COUNT as usize)?;

        for (pair, reg) in words.chunks_exact_mut(2).zip(self.to_array()) {
            pair[0] = reg as u32;
            pair[1] = (reg >> 32) as u32;
        }

        Some(X86_THREAD_STATE64_COUNT)
    }
}
