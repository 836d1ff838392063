//! x86_64 extended context: the FPU/SSE state
//!
//! Saved and restored with FXSAVE64/FXRSTOR64. Memory handed to these
//! helpers must satisfy [`ECTX_ALIGN`] and hold [`ECTX_SIZE`] bytes; the
//! [`crate::ctx::ExecEnv`] layout guarantees both for its embedded area.

/// Size of the architectural save area (FXSAVE region)
pub const ECTX_SIZE: usize = 512;

/// Alignment required by FXSAVE64/FXRSTOR64
pub const ECTX_ALIGN: usize = 16;

/// Bring the FPU into a state that can be saved: clear pending exceptions
/// so a later FXRSTOR of the saved image cannot fault.
///
/// # Safety
///
/// `state` must be valid for `ECTX_SIZE` bytes and `ECTX_ALIGN` aligned.
pub unsafe fn sanitize(state: *mut u8) {
    let _ = state;
    // SAFETY: FNCLEX only clears FPU exception flags of the executing CPU.
    unsafe { core::arch::asm!("fnclex", options(nomem, nostack)) };
}

/// Initialize `state` with the power-on default FPU/SSE configuration.
///
/// # Safety
///
/// `state` must be valid for `ECTX_SIZE` bytes and `ECTX_ALIGN` aligned.
pub unsafe fn init(state: *mut u8) {
    // Reset the live state to defaults, then capture it.
    // SAFETY: FNINIT and LDMXCSR only modify the executing CPU's FPU/SSE
    // state; the default MXCSR value lives on the stack for the load.
    unsafe {
        let mxcsr: u32 = 0x1F80;
        core::arch::asm!(
            "fninit",
            "ldmxcsr [{mxcsr}]",
            mxcsr = in(reg) &mxcsr as *const u32,
            options(nostack)
        );
        store(state);
    }
}

/// Save the executing CPU's extended state to `state`.
///
/// # Safety
///
/// `state` must be valid for `ECTX_SIZE` bytes and `ECTX_ALIGN` aligned.
pub unsafe fn store(state: *mut u8) {
    debug_assert_eq!(state as usize % ECTX_ALIGN, 0);
    // SAFETY: The caller guarantees size and alignment of the save area.
    unsafe {
        core::arch::asm!("fxsave64 [{area}]", area = in(reg) state, options(nostack));
    }
}

/// Restore a previously saved extended state on the executing CPU.
///
/// # Safety
///
/// `state` must hold an image produced by [`store`] or [`init`].
pub unsafe fn load(state: *const u8) {
    debug_assert_eq!(state as usize % ECTX_ALIGN, 0);
    // SAFETY: The caller guarantees the image is a valid FXSAVE region.
    unsafe {
        core::arch::asm!("fxrstor64 [{area}]", area = in(reg) state, options(nostack));
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[repr(align(16))]
    struct Area([u8; ECTX_SIZE]);

    #[test]
    fn store_load_roundtrip() {
        let mut a = Area([0; ECTX_SIZE]);
        let mut b = Area([0; ECTX_SIZE]);
        // SAFETY: Both areas satisfy the size and alignment contract.
        unsafe {
            init(a.0.as_mut_ptr());
            store(b.0.as_mut_ptr());
            load(b.0.as_ptr());
        }
        // The FXSAVE header (control/status words) of a freshly initialized
        // image is deterministic: FCW = 0x037F.
        assert_eq!(u16::from_le_bytes([a.0[0], a.0[1]]), 0x037F);
    }
}
