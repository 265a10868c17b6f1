//! The request/reply protocol spoken over an exception port.
//!
//! Exception ports installed with `EXCEPTION_STATE | MACH_EXCEPTION_CODES`
//! receive `mach_exception_raise_state` requests, which carry the exception
//! codes and the faulting thread's register state, and must be answered with a
//! reply carrying a return code and, on success, the state the thread resumes
//! with. The layouts were derived from the `mach_exc_server` generated by
//! `mig -v /usr/include/mach/mach_exc.defs`.
//!
//! Nothing in here performs syscalls so that the decoding can be tested on
//! every platform.

use crate::{Backend, ProtocolError, RepeatedTrapPolicy, TrapResult};
use std::mem;
use trap_context::{
    GeneralRegisters, MachineContextSnapshot, X86_THREAD_STATE64, X86_THREAD_STATE64_COUNT,
};

/// `mach_exception_raise_state` from `mach_exc.defs`
pub(crate) const EXCEPTION_RAISE_STATE_ID: i32 = 2406;
/// MIG replies use the id of the request + 100
const REPLY_ID_OFFSET: i32 = 100;
/// The number of 64-bit codes, a code and a subcode, sent with every exception
const EXCEPTION_CODE_COUNT: u32 = 2;
/// `EXC_BAD_INSTRUCTION` from `<mach/exception_types.h>`
pub(crate) const EXC_BAD_INSTRUCTION: i32 = 2;
/// `THREAD_STATE_MAX` from `<mach/thread_status.h>`
pub(crate) const THREAD_STATE_MAX: usize = 1296;
/// Size of the largest trailer the kernel can append to a received message
const MAX_TRAILER_SIZE: usize = 68;

const KERN_SUCCESS: i32 = 0;
const KERN_FAILURE: i32 = 5;
/// `MACH_MSGH_BITS_REMOTE_MASK`
const MSGH_BITS_REMOTE_MASK: u32 = 0x1f;

/// `mach_msg_header_t`
#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct MessageHeader {
    pub(crate) bits: u32,
    pub(crate) size: u32,
    pub(crate) remote_port: u32,
    pub(crate) local_port: u32,
    pub(crate) voucher_port: u32,
    pub(crate) id: i32,
}

/// Network Data Representation Record
///
/// ndr.h
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct NdrRecord {
    pub(crate) mig_vers: u8,
    pub(crate) if_vers: u8,
    pub(crate) reserved1: u8,
    pub(crate) mig_encoding: u8,
    pub(crate) int_rep: u8,
    pub(crate) char_rep: u8,
    pub(crate) float_rep: u8,
    pub(crate) reserved2: u8,
}

/// `__Request__mach_exception_raise_state_t`, sized for the largest state the
/// kernel can send plus the trailer it appends on receipt
#[repr(C)]
pub(crate) struct RaiseStateRequest {
    pub(crate) header: MessageHeader,
    pub(crate) ndr: NdrRecord,
    pub(crate) exception: i32,
    pub(crate) code_count: u32,
    pub(crate) code: [i64; 2],
    pub(crate) flavor: i32,
    pub(crate) old_state_count: u32,
    pub(crate) old_state: [u32; THREAD_STATE_MAX],
    _trailer: [u8; MAX_TRAILER_SIZE],
}

/// Offset of `old_state` in [`RaiseStateRequest`]
const REQUEST_STATE_OFFSET: usize = 64;

impl RaiseStateRequest {
    #[inline]
    pub(crate) fn zeroed() -> Self {
        // SAFETY: POD
        unsafe { mem::zeroed() }
    }

    /// The size of the buffer the kernel may write a message into
    #[inline]
    pub(crate) fn capacity() -> u32 {
        mem::size_of::<Self>() as u32
    }
}

/// `__Reply__mach_exception_raise_state_t`
#[repr(C)]
pub(crate) struct RaiseStateReply {
    pub(crate) header: MessageHeader,
    pub(crate) ndr: NdrRecord,
    pub(crate) ret_code: i32,
    pub(crate) flavor: i32,
    pub(crate) new_state_count: u32,
    pub(crate) new_state: [u32; THREAD_STATE_MAX],
}

/// Offset of `new_state` in [`RaiseStateReply`]
const REPLY_STATE_OFFSET: usize = 44;

impl RaiseStateReply {
    #[inline]
    pub(crate) fn zeroed() -> Self {
        // SAFETY: POD
        unsafe { mem::zeroed() }
    }
}

/// What the responder did with a request
#[derive(Debug)]
pub(crate) enum Response {
    /// The trap was accepted, the reply resumes the thread at the landing
    /// routine
    Recovered(TrapResult),
    /// The trap was declined, the reply tells the kernel to move on to the
    /// next handler, which for an illegal instruction is process termination
    Declined,
}

/// Builds replies to the exception messages received for a single guarded
/// call, enforcing the bounded handling policy.
pub(crate) struct Responder {
    ndr: NdrRecord,
    landing: u64,
    policy: RepeatedTrapPolicy,
    handled: bool,
}

impl Responder {
    pub(crate) fn new(ndr: NdrRecord, landing: u64, policy: RepeatedTrapPolicy) -> Self {
        Self {
            ndr,
            landing,
            policy,
            handled: false,
        }
    }

    /// Whether the listener should stop servicing the port
    #[inline]
    pub(crate) fn is_exhausted(&self) -> bool {
        self.handled && self.policy == RepeatedTrapPolicy::Ignore
    }

    /// Decodes `request` and fills out `reply`.
    ///
    /// `jump_point` is the jump point of the guarded call at the time the
    /// request was received, a null jump point means the block is not running
    /// and the trap is declined.
    pub(crate) fn respond(
        &mut self,
        request: &RaiseStateRequest,
        jump_point: u64,
        reply: &mut RaiseStateReply,
    ) -> Result<Response, ProtocolError> {
        if request.header.id != EXCEPTION_RAISE_STATE_ID {
            return Err(ProtocolError::UnexpectedMessage {
                id: request.header.id,
            });
        }

        // Every field after `code` moves with the number of codes sent, and
        // MACH_EXCEPTION_CODES always sends a code and a subcode
        if request.code_count != EXCEPTION_CODE_COUNT {
            return Err(ProtocolError::UnexpectedCodeCount {
                count: request.code_count,
            });
        }

        if request.flavor != X86_THREAD_STATE64 {
            return Err(ProtocolError::UnexpectedFlavor {
                flavor: request.flavor,
            });
        }

        let count = request.old_state_count;
        if count < X86_THREAD_STATE64_COUNT || count as usize > THREAD_STATE_MAX {
            return Err(ProtocolError::TruncatedState {
                count,
                expected: X86_THREAD_STATE64_COUNT,
            });
        }

        let size = request.header.size;
        if (size as usize) < REQUEST_STATE_OFFSET + count as usize * 4 {
            return Err(ProtocolError::TruncatedMessage { size });
        }

        // This magic incantation to send a reply back to the kernel was
        // derived from the exc_server generated by
        // 'mig -v /usr/include/mach/mach_exc.defs', or you can look at
        // https://github.com/doadam/xnu-4570.1.46/blob/2ad7fbf85ff567495a572cd4583961ffd8525083/BUILD/obj/RELEASE_X86_64/osfmk/RELEASE/mach/exc_server.c#L491-L520
        reply.header = MessageHeader {
            bits: request.header.bits & MSGH_BITS_REMOTE_MASK,
            size: 0,
            remote_port: request.header.remote_port,
            local_port: 0,
            voucher_port: 0,
            id: request.header.id + REPLY_ID_OFFSET,
        };
        reply.ndr = self.ndr;
        reply.flavor = request.flavor;

        let accept = request.exception == EXC_BAD_INSTRUCTION
            && jump_point != 0
            && !(self.handled && self.policy == RepeatedTrapPolicy::Reject);

        if !accept {
            reply.ret_code = KERN_FAILURE;
            reply.new_state_count = 0;
            reply.header.size = REPLY_STATE_OFFSET as u32;
            return Ok(Response::Declined);
        }

        let old_state = &request.old_state[..count as usize];
        let Some(mut regs) = GeneralRegisters::from_thread_state(old_state) else {
            return Err(ProtocolError::TruncatedState {
                count,
                expected: X86_THREAD_STATE64_COUNT,
            });
        };

        let trap = TrapResult::new(
            MachineContextSnapshot::new(regs),
            request.code[0],
            Backend::ExceptionPort,
        );

        regs.redirect_call(self.landing, jump_point);

        // Any words beyond the flavor are passed back untouched
        reply.new_state[..count as usize].copy_from_slice(old_state);
        if regs.write_thread_state(&mut reply.new_state).is_none() {
            return Err(ProtocolError::TruncatedState {
                count,
                expected: X86_THREAD_STATE64_COUNT,
            });
        }

        reply.ret_code = KERN_SUCCESS;
        reply.new_state_count = count;
        reply.header.size = (REPLY_STATE_OFFSET + count as usize * 4) as u32;

        self.handled = true;

        Ok(Response::Recovered(trap))
    }
}
