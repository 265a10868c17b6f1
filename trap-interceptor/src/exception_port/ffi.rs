//! Mach bindings used by the exception port backend.
//!
//! Most come from `mach2`, the ones it lacks are lifted from headers in
//! usr/include/mach, each one notes the specific header it can be located in

pub use mach2::{
    exception_types as et,
    kern_return::{KERN_SUCCESS, kern_return_t},
    mach_init::mach_thread_self,
    mach_port::{self as mp, mach_port_destroy},
    mach_types as mt,
    message::{
        self as msg, MACH_RCV_INTERRUPTED, MACH_RCV_INVALID_NAME, MACH_RCV_PORT_CHANGED,
        MACH_RCV_PORT_DIED,
    },
    port::{self, MACH_PORT_NULL, mach_port_t},
    thread_act::thread_set_exception_ports,
    thread_status as ts,
    traps::mach_task_self,
};

use crate::{Error, protocol::NdrRecord};

/// The flavor used when restoring a thread to having no exception port
///
/// `<mach/i386/thread_status.h>`
pub const THREAD_STATE_NONE: ts::thread_state_flavor_t = 13;

unsafe extern "C" {
    /// Swaps the exception ports registered on `thread` for the exceptions in
    /// `exception_mask` with `new_port`, writing the previous registrations
    /// into 4 caller owned arrays. `masks_count` holds the capacity of the
    /// arrays on input and the number of registrations written on output.
    ///
    /// thread_act.h
    pub fn thread_swap_exception_ports(
        thread: mt::thread_act_t,
        exception_mask: et::exception_mask_t,
        new_port: mach_port_t,
        behavior: et::exception_behavior_t,
        new_flavor: ts::thread_state_flavor_t,
        masks: *mut et::exception_mask_t,
        masks_count: *mut u32,
        old_handlers: *mut mach_port_t,
        old_behaviors: *mut et::exception_behavior_t,
        old_flavors: *mut ts::thread_state_flavor_t,
    ) -> kern_return_t;
}

/// The host NDR, as placed in our replies
#[inline]
pub(crate) fn host_ndr() -> NdrRecord {
    use mach2::ndr;

    const _: () = assert!(size_of::<ndr::NDR_record_t>() == size_of::<NdrRecord>());

    // SAFETY: both are 8 `repr(C)` bytes in ndr.h order, `mach2` just keeps
    // the fields private
    unsafe { std::mem::transmute::<ndr::NDR_record_t, NdrRecord>(ndr::NDR_record) }
}

#[inline]
pub(crate) fn kern_ret(
    call: &'static str,
    func: impl FnOnce() -> kern_return_t,
) -> Result<(), Error> {
    let code = func();

    if code == KERN_SUCCESS {
        Ok(())
    } else {
        Err(Error::Kernel { call, code })
    }
}
