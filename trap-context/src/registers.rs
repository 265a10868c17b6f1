/// The number of bytes below the stack pointer that a leaf function may use
/// without adjusting the stack pointer, see the System V x86_64 psABI 3.2.2.
/// Darwin follows the same convention.
pub const RED_ZONE_SIZE: u64 = 128;

/// The x86_64 general purpose register file.
///
/// The field order matches `x86_thread_state64_t` from
/// `<mach/i386/_structs.h>`, 21 64-bit values.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct GeneralRegisters {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
    pub cs: u64,
    pub fs: u64,
    pub gs: u64,
}

impl GeneralRegisters {
    pub(crate) const COUNT: usize = 21;

    #[inline]
    pub(crate) fn to_array(self) -> [u64; Self::COUNT] {
        [
            self.rax,
            self.rbx,
            self.rcx,
            self.rdx,
            self.rdi,
            self.rsi,
            self.rbp,
            self.rsp,
            self.r8,
            self.r9,
            self.r10,
            self.r11,
            self.r12,
            self.r13,
            self.r14,
            self.r15,
            self.rip,
            self.rflags,
            self.cs,
            self.fs,
            self.gs,
        ]
    }

    #[inline]
    pub(crate) fn from_array(regs: [u64; Self::COUNT]) -> Self {
        let [
            rax,
            rbx,
            rcx,
            rdx,
            rdi,
            rsi,
            rbp,
            rsp,
            r8,
            r9,
            r10,
            r11,
            r12,
            r13,
            r14,
            r15,
            rip,
            rflags,
            cs,
            fs,
            gs,
        ] = regs;

        Self {
            rax,
            rbx,
            rcx,
            rdx,
            rdi,
            rsi,
            rbp,
            rsp,
            r8,
            r9,
            r10,
            r11,
            r12,
            r13,
            r14,
            r15,
            rip,
            rflags,
            cs,
            fs,
            gs,
        }
    }

    /// Rewrites the register file so that, once the thread is resumed, it
    /// executes `landing(argument)` as though `landing` had just been called.
    ///
    /// The stack pointer is moved below the red zone of the interrupted
    /// function and aligned so that `rsp + 8` is a multiple of 16, which is
    /// what the callee sees right after a `call`. No memory is written, so the
    /// return address slot is garbage and `landing` must never return.
    pub fn redirect_call(&mut self, landing: u64, argument: u64) {
        let aligned = self.rsp.wrapping_sub(RED_ZONE_SIZE) & !0xf;

        self.rsp = aligned.wrapping_sub(8);
        self.rip = landing;
        self.rdi = argument;
    }
}

/// The machine context of a thread captured at a single point in time,
/// typically the instruction that raised a trap.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MachineContextSnapshot {
    registers: GeneralRegisters,
}

impl MachineContextSnapshot {
    #[inline]
    pub fn new(registers: GeneralRegisters) -> Self {
        Self { registers }
    }

    /// The instruction pointer
    #[inline]
    pub fn ip(&self) -> u64 {
        self.registers.rip
    }

    /// The stack pointer
    #[inline]
    pub fn sp(&self) -> u64 {
        self.registers.rsp
    }

    /// The frame pointer. Note this is only meaningful if the code that was
    /// executing maintains frame pointers.
    #[inline]
    pub fn fp(&self) -> u64 {
        self.registers.rbp
    }

    /// The full general purpose register file
    #[inline]
    pub fn registers(&self) -> &GeneralRegisters {
        &self.registers
    }
}

impl From<GeneralRegisters> for MachineContextSnapshot {
    #[inline]
    fn from(registers: GeneralRegisters) -> Self {
        Self::new(registers)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn redirect_skips_red_zone_and_aligns() {
        let mut regs = GeneralRegisters {
            rsp: 0x7fff_5fbf_f8c3,
            rip: 0x1000_2000,
            rdi: 7,
            rbp: 0x7fff_5fbf_f900,
            ..Default::default()
        };

        regs.redirect_call(0xdead_0000, 0xbeef);

        assert_eq!(regs.rip, 0xdead_0000);
        assert_eq!(regs.rdi, 0xbeef);
        assert_eq!((regs.rsp + 8) % 16, 0);
        assert!(regs.rsp + 8 <= 0x7fff_5fbf_f8c3 - RED_ZONE_SIZE);
        assert!(0x7fff_5fbf_f8c3 - RED_ZONE_SIZE - (regs.rsp + 8) < 16);
        // The frame pointer is left alone so the landing routine can still be
        // attributed to the interrupted frame
        assert_eq!(regs.rbp, 0x7fff_5fbf_f900);
    }

    #[test]
    fn snapshot_accessors() {
        let snapshot = MachineContextSnapshot::from(GeneralRegisters {
            rip: 1,
            rsp: 2,
            rbp: 3,
            r15: 4,
            ..Default::default()
        });

        assert_eq!(snapshot.ip(), 1);
        assert_eq!(snapshot.sp(), 2);
        assert_eq!(snapshot.fp(), 3);
        assert_eq!(snapshot.registers().r15, 4);
    }
}
