use crate::GeneralRegisters;

#[repr(C)]
#[derive(Clone)]
pub struct sigset_t {
    __val: [u64; 16],
}

#[repr(C)]
#[derive(Clone)]
pub struct stack_t {
    pub ss_sp: *mut std::ffi::c_void,
    pub ss_flags: i32,
    pub ss_size: usize,
}

/// The context handed to an `SA_SIGINFO` signal handler.
///
/// Note that we use our own definition instead of [`libc::ucontext_t`] as
/// libc's differs between glibc and musl <https://github.com/rust-lang/libc/pull/1646>
/// even though the context received by a signal handler is the same regardless
/// of the libc implementation, as it is only arch specific.
#[repr(C)]
#[derive(Clone)]
pub struct ucontext_t {
    pub uc_flags: u64,
    pub uc_link: *mut ucontext_t,
    pub uc_stack: stack_t,
    pub uc_mcontext: mcontext_t,
    pub uc_sigmask: sigset_t,
    __private: [u8; 512],
}

#[repr(C)]
#[derive(Clone)]
pub struct mcontext_t {
    pub gregs: [i64; 23],
    pub fpregs: *mut std::ffi::c_void,
    __reserved: [u64; 8],
}

/// Indices into [`mcontext_t::gregs`], from `<sys/ucontext.h>`
pub mod reg {
    pub const REG_R8: usize = 0;
    pub const REG_R9: usize = 1;
    pub const REG_R10: usize = 2;
    pub const REG_R11: usize = 3;
    pub const REG_R12: usize = 4;
    pub const REG_R13: usize = 5;
    pub const REG_R14: usize = 6;
    pub const REG_R15: usize = 7;
    pub const REG_RDI: usize = 8;
    pub const REG_RSI: usize = 9;
    pub const REG_RBP: usize = 10;
    pub const REG_RBX: usize = 11;
    pub const REG_RDX: usize = 12;
    pub const REG_RAX: usize = 13;
    pub const REG_RCX: usize = 14;
    pub const REG_RSP: usize = 15;
    pub const REG_RIP: usize = 16;
    pub const REG_EFL: usize = 17;
    /// `cs`, `gs` and `fs` packed as 16-bit values, in that order
    pub const REG_CSGSFS: usize = 18;
}

impl GeneralRegisters {
    /// Reads the register file from the context passed to a signal handler
    ///
    /// # Safety
    ///
    /// `uc` must point to a valid `ucontext_t`
    pub unsafe fn from_ucontext(uc: *const std::ffi::c_void) -> Self {
        use reg::*;

        // SAFETY: caller guarantees the pointer is a ucontext_t
        let gregs = unsafe { &(*uc.cast::<ucontext_t>()).uc_mcontext.gregs };
        let g = |i: usize| gregs[i] as u64;
        let segments = g(REG_CSGSFS);

        Self {
            rax: g(REG_RAX),
            rbx: g(REG_RBX),
            rcx: g(REG_RCX),
            rdx: g(REG_RDX),
            rdi: g(REG_RDI),
            rsi: g(REG_RSI),
            rbp: g(REG_RBP),
            rsp: g(REG_RSP),
            r8: g(REG_R8),
            r9: g(REG_R9),
            r10: g(REG_R10),
            r11: g(REG_R11),
            r12: g(REG_R12),
            r13: g(REG_R13),
            r14: g(REG_R14),
            r15: g(REG_R15),
            rip: g(REG_RIP),
            rflags: g(REG_EFL),
            cs: segments & 0xffff,
            gs: (segments >> 16) & 0xffff,
            fs: (segments >> 32) & 0xffff,
        }
    }

    /// Writes the register file back into the context passed to a signal
    /// handler, which the kernel restores when the handler returns.
    ///
    /// The segment registers are not written.
    ///
    /// # Safety
    ///
    /// `uc` must point to a valid, writable `ucontext_t`
    pub unsafe fn write_ucontext(&self, uc: *mut std::ffi::c_void) {
        use reg::*;

        // SAFETY: caller guarantees the pointer is a ucontext_t
        let gregs = unsafe { &mut (*uc.cast::<ucontext_t>()).uc_mcontext.gregs };

        for (i, val) in [
            (REG_RAX, self.rax),
            (REG_RBX, self.rbx),
            (REG_RCX, self.rcx),
            (REG_RDX, self.rdx),
            (REG_RDI, self.rdi),
            (REG_RSI, self.rsi),
            (REG_RBP, self.rbp),
            (REG_RSP, self.rsp),
            (REG_R8, self.r8),
            (REG_R9, self.r9),
            (REG_R10, self.r10),
            (REG_R11, self.r11),
            (REG_R12, self.r12),
            (REG_R13, self.r13),
            (REG_R14, self.r14),
            (REG_R15, self.r15),
            (REG_RIP, self.rip),
            (REG_EFL, self.rflags),
        ] {
            gregs[i] = val as i64;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn gregs_round_trip_through_context() {
        // SAFETY: POD
        let mut uc: ucontext_t = unsafe { std::mem::zeroed() };
        uc.uc_mcontext.gregs[reg::REG_RIP] = 0x5555_0000_1234;
        uc.uc_mcontext.gregs[reg::REG_RSP] = 0x7ffc_0000_0010;
        uc.uc_mcontext.gregs[reg::REG_R8] = 8;
        uc.uc_mcontext.gregs[reg::REG_CSGSFS] = 0x33 | (0x2b << 32);

        let ptr = (&mut uc as *mut ucontext_t).cast();

        // SAFETY: valid context
        let mut regs = unsafe { GeneralRegisters::from_ucontext(ptr) };
        assert_eq!(regs.rip, 0x5555_0000_1234);
        assert_eq!(regs.rsp, 0x7ffc_0000_0010);
        assert_eq!(regs.r8, 8);
        assert_eq!(regs.cs, 0x33);
        assert_eq!(regs.fs, 0x2b);

        regs.redirect_call(0x4000, 0x99);

        // SAFETY: valid context
        unsafe { regs.write_ucontext(ptr) };
        assert_eq!(uc.uc_mcontext.gregs[reg::REG_RIP], 0x4000);
        assert_eq!(uc.uc_mcontext.gregs[reg::REG_RDI], 0x99);
        assert_eq!(uc.uc_mcontext.gregs[reg::REG_RSP], regs.rsp as i64);
        assert_eq!(uc.uc_mcontext.gregs[reg::REG_R8], 8);
        assert_eq!(uc.uc_mcontext.gregs[reg::REG_CSGSFS], 0x33 | (0x2b << 32));
    }
}
