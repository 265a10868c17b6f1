use super::{ffi::*, Shared};
use crate::{
    protocol::{RaiseStateReply, RaiseStateRequest, Responder, Response},
    Error,
};
use std::{sync::atomic::Ordering, sync::Arc, time::Duration};

/// Spawns the thread that services `port` for the duration of a single guarded
/// call.
///
/// The thread exits once `port` is destroyed, or after it has handled a trap
/// if the responder's policy says it should not handle any more.
pub(super) fn spawn(
    port: mach_port_t,
    shared: Arc<Shared>,
    responder: Responder,
    reply_delay: Option<Duration>,
) -> Result<std::thread::JoinHandle<()>, Error> {
    std::thread::Builder::new()
        .name("trap-interceptor-listener".to_owned())
        .spawn(move || {
            log::trace!("listening on exception port {port:#x}");

            // SAFETY: syscalls, `port` stays a valid name until it is
            // destroyed, which we detect
            if let Err(err) = unsafe { listen(port, &shared, responder, reply_delay) } {
                // The trapped thread is suspended until we reply, there is no
                // one else to report this to
                crate::fatal(&err);
            }

            log::trace!("exception listener exiting");
        })
        .map_err(Error::ListenerSpawn)
}

/// Message loop, waits for exception messages sent by the kernel and replies
/// to each one
unsafe fn listen(
    port: mach_port_t,
    shared: &Shared,
    mut responder: Responder,
    reply_delay: Option<Duration>,
) -> Result<(), Error> {
    // Too big to comfortably put on the stack of a thread we don't control the
    // stack size of
    let mut request = Box::new(RaiseStateRequest::zeroed());
    let mut reply = Box::new(RaiseStateReply::zeroed());

    loop {
        request.header.local_port = port;
        request.header.size = RaiseStateRequest::capacity();

        let kret = unsafe {
            msg::mach_msg(
                (&mut request.header as *mut crate::protocol::MessageHeader).cast(),
                msg::MACH_RCV_MSG | msg::MACH_RCV_INTERRUPT,
                0,
                RaiseStateRequest::capacity(),
                port,
                msg::MACH_MSG_TIMEOUT_NONE,
                MACH_PORT_NULL,
            )
        };

        match kret {
            KERN_SUCCESS => {}
            MACH_RCV_INTERRUPTED => continue,
            MACH_RCV_PORT_DIED | MACH_RCV_PORT_CHANGED | MACH_RCV_INVALID_NAME => {
                log::debug!("exception port closed ({kret:#x})");
                return Ok(());
            }
            code => {
                return Err(Error::Kernel {
                    call: "mach_msg",
                    code,
                })
            }
        }

        let jump_point = shared.jump_point.load(Ordering::Acquire) as u64;

        match responder.respond(&request, jump_point, &mut reply)? {
            Response::Recovered(trap) => {
                log::debug!(
                    "recovered trap at {:#x}, code {:#x}",
                    trap.context().ip(),
                    trap.code()
                );
                *shared.trap.lock() = Some(trap);
            }
            Response::Declined => {
                log::debug!("declined exception {}", request.exception);
            }
        }

        if let Some(delay) = reply_delay {
            std::thread::sleep(delay);
        }

        let size = reply.header.size;
        kern_ret("mach_msg", || unsafe {
            msg::mach_msg(
                (&mut reply.header as *mut crate::protocol::MessageHeader).cast(),
                msg::MACH_SEND_MSG,
                size,
                0,
                MACH_PORT_NULL,
                msg::MACH_MSG_TIMEOUT_NONE,
                MACH_PORT_NULL,
            )
        })?;

        if responder.is_exhausted() {
            log::debug!("trap handled, no longer servicing exception port");
            return Ok(());
        }
    }
}
