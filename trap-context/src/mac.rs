use crate::GeneralRegisters;

impl GeneralRegisters {
    /// Reads the register file from the context passed to a signal handler
    ///
    /// # Safety
    ///
    /// `uc` must point to a valid `ucontext_t` whose `uc_mcontext` is valid
    pub unsafe fn from_ucontext(uc: *const std::ffi::c_void) -> Self {
        // SAFETY: caller guarantees the pointers are valid
        let ss = unsafe { &(*(*uc.cast::<libc::ucontext_t>()).uc_mcontext).__ss };

        Self {
            rax: ss.__rax,
            rbx: ss.__rbx,
            rcx: ss.__rcx,
            rdx: ss.__rdx,
            rdi: ss.__rdi,
            rsi: ss.__rsi,
            rbp: ss.__rbp,
            rsp: ss.__rsp,
            r8: ss.__r8,
            r9: ss.__r9,
            r10: ss.__r10,
            r11: ss.__r11,
            r12: ss.__r12,
            r13: ss.__r13,
            r14: ss.__r14,
            r15: ss.__r15,
            rip: ss.__rip,
            rflags: ss.__rflags,
            cs: ss.__cs,
            fs: ss.__fs,
            gs: ss.__gs,
        }
    }

    /// Writes the register file back into the context passed to a signal
    /// handler, which the kernel restores when the handler returns.
    ///
    /// The segment registers are not written.
    ///
    /// # Safety
    ///
    /// `uc` must point to a valid, writable `ucontext_t` whose `uc_mcontext`
    /// is valid
    pub unsafe fn write_ucontext(&self, uc: *mut std::ffi::c_void) {
        // SAFETY: caller guarantees the pointers are valid
        let ss = unsafe { &mut (*(*uc.cast::<libc::ucontext_t>()).uc_mcontext).__ss };

        ss.__rax = self.rax;
        ss.__rbx = self.rbx;
        ss.__rcx = self.rcx;
        ss.__rdx = self.rdx;
        ss.__rdi = self.rdi;
        ss.__rsi = self.rsi;
        ss.__rbp = self.rbp;
        ss.__rsp = self.rsp;
        ss.__r8 = self.r8;
        ss.__r9 = self.r9;
        ss.__r10 = self.r10;
        ss.__r11 = self.r11;
        ss.__r12 = self.r12;
        ss.__r13 = self.r13;
        ss.__r14 = self.r14;
        ss.__r15 = self.r15;
        ss.__rip = self.rip;
        ss.__rflags = self.rflags;
    }
}
