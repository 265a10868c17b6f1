//! The jump point a trapped thread is returned to.
//!
//! Both backends resume a trapped thread the same way: the thread's register
//! state is rewritten so it continues in [`landing_address`] with the jump
//! point as its argument, which then performs a `siglongjmp` back into
//! [`run`], skipping every frame of the guarded block in between.
//!
//! Skipping frames means their destructors are never run, anything owned by
//! those frames is leaked.

use std::{
    any::Any,
    ffi::c_void,
    ptr,
    sync::atomic::{AtomicPtr, Ordering},
};

unsafe extern "C" {
    fn trap_interceptor_run(
        jump_point: *mut *mut c_void,
        body: unsafe extern "C" fn(*mut c_void),
        payload: *mut c_void,
    ) -> i32;
    fn trap_interceptor_land(jump_point: *mut c_void) -> !;
}

/// The address of the routine a trapped thread is redirected to. It expects
/// the current jump point as its first argument.
#[inline]
pub(crate) fn landing_address() -> u64 {
    trap_interceptor_land as usize as u64
}

/// How the block passed to [`run`] finished
pub(crate) enum Outcome {
    /// The block returned normally
    Completed,
    /// Control came back through the landing routine
    Landed,
    /// The block panicked, the payload should be resumed once the trap
    /// handler has been torn down
    Panicked(Box<dyn Any + Send + 'static>),
}

struct Payload<F> {
    block: Option<F>,
    panic: Option<Box<dyn Any + Send + 'static>>,
}

unsafe extern "C" fn call_block<F: FnOnce()>(payload: *mut c_void) {
    // SAFETY: `run` passes a pointer to a `Payload<F>` that outlives this call
    let payload = unsafe { &mut *payload.cast::<Payload<F>>() };

    if let Some(block) = payload.block.take() {
        // Unwinding through the C frame is not allowed, so the panic is carried
        // over it instead
        if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(block)) {
            payload.panic = Some(panic);
        }
    }
}

/// Records a jump point in `slot`, then runs `block`.
///
/// The slot holds the jump point for exactly as long as `block` is executing
/// and is null otherwise.
pub(crate) fn run<F: FnOnce()>(slot: &AtomicPtr<c_void>, block: F) -> Outcome {
    let mut payload = Payload {
        block: Some(block),
        panic: None,
    };

    // SAFETY: the helper only writes the slot and calls `call_block` with the
    // payload we give it, both of which outlive the call
    let landed = unsafe {
        trap_interceptor_run(
            slot.as_ptr(),
            call_block::<F>,
            (&mut payload as *mut Payload<F>).cast(),
        )
    };

    // The helper clears the slot itself, but make sure the store is visible to
    // other threads before we start tearing down
    slot.store(ptr::null_mut(), Ordering::Release);

    if landed != 0 {
        Outcome::Landed
    } else if let Some(panic) = payload.panic {
        Outcome::Panicked(panic)
    } else {
        Outcome::Completed
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn completes_and_clears_slot() {
        let slot = AtomicPtr::new(ptr::null_mut());
        let mut saw_jump_point = false;

        let outcome = run(&slot, || {
            saw_jump_point = !slot.load(Ordering::Acquire).is_null();
        });

        assert!(matches!(outcome, Outcome::Completed));
        assert!(saw_jump_point);
        assert!(slot.load(Ordering::Acquire).is_null());
    }

    #[test]
    fn landing_returns_to_jump_point() {
        let slot = AtomicPtr::new(ptr::null_mut());
        let mut after_landing = false;

        let outcome = run(&slot, || {
            let jump_point = slot.load(Ordering::Acquire);
            // SAFETY: we are inside `run`, so the jump point is live
            unsafe { trap_interceptor_land(jump_point) };
            #[allow(unreachable_code)]
            {
                after_landing = true;
            }
        });

        assert!(matches!(outcome, Outcome::Landed));
        assert!(!after_landing);
        assert!(slot.load(Ordering::Acquire).is_null());
    }

    #[test]
    fn panics_are_carried_over_the_jump_point() {
        let slot = AtomicPtr::new(ptr::null_mut());

        let outcome = run(&slot, || panic!("precondition failed"));

        let Outcome::Panicked(payload) = outcome else {
            panic!("expected the panic to be captured");
        };
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"precondition failed"));
    }
}
