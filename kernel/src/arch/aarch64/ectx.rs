//! AArch64 extended context: the FP/SIMD register file
//!
//! Thirty-two 128-bit vector registers plus FPCR/FPSR. Memory handed to
//! these helpers must satisfy [`ECTX_ALIGN`] and hold [`ECTX_SIZE`] bytes.

/// Size of the save area: 32 x 16-byte Q registers + FPCR + FPSR
pub const ECTX_SIZE: usize = 32 * 16 + 16;

/// Alignment required for the paired Q-register stores
pub const ECTX_ALIGN: usize = 16;

/// Bring the FP/SIMD unit into a saveable state. Nothing to do on this
/// architecture; the register file is always accessible at EL1.
///
/// # Safety
///
/// `state` must be valid for `ECTX_SIZE` bytes and `ECTX_ALIGN` aligned.
pub unsafe fn sanitize(state: *mut u8) {
    let _ = state;
}

/// Initialize `state` with a zeroed FP/SIMD configuration.
///
/// # Safety
///
/// `state` must be valid for `ECTX_SIZE` bytes and `ECTX_ALIGN` aligned.
pub unsafe fn init(state: *mut u8) {
    // SAFETY: The caller guarantees size and alignment; a zero image is a
    // valid power-on register file with FPCR/FPSR cleared.
    unsafe { core::ptr::write_bytes(state, 0, ECTX_SIZE) };
}

/// Save the executing CPU's FP/SIMD state to `state`.
///
/// # Safety
///
/// `state` must be valid for `ECTX_SIZE` bytes and `ECTX_ALIGN` aligned.
pub unsafe fn store(state: *mut u8) {
    debug_assert_eq!(state as usize % ECTX_ALIGN, 0);
    #[cfg(target_os = "none")]
    // SAFETY: The caller guarantees the save area; the stores cover exactly
    // ECTX_SIZE bytes.
    unsafe {
        core::arch::asm!(
            "stp q0, q1, [{a}, #0]",
            "stp q2, q3, [{a}, #32]",
            "stp q4, q5, [{a}, #64]",
            "stp q6, q7, [{a}, #96]",
            "stp q8, q9, [{a}, #128]",
            "stp q10, q11, [{a}, #160]",
            "stp q12, q13, [{a}, #192]",
            "stp q14, q15, [{a}, #224]",
            "stp q16, q17, [{a}, #256]",
            "stp q18, q19, [{a}, #288]",
            "stp q20, q21, [{a}, #320]",
            "stp q22, q23, [{a}, #352]",
            "stp q24, q25, [{a}, #384]",
            "stp q26, q27, [{a}, #416]",
            "stp q28, q29, [{a}, #448]",
            "stp q30, q31, [{a}, #480]",
            "mrs {t1}, fpcr",
            "mrs {t2}, fpsr",
            "stp {t1}, {t2}, [{a}, #512]",
            a = in(reg) state,
            t1 = out(reg) _,
            t2 = out(reg) _,
            options(nostack)
        );
    }
    #[cfg(not(target_os = "none"))]
    let _ = state;
}

/// Restore a previously saved FP/SIMD state on the executing CPU.
///
/// # Safety
///
/// `state` must hold an image produced by [`store`] or [`init`].
pub unsafe fn load(state: *const u8) {
    debug_assert_eq!(state as usize % ECTX_ALIGN, 0);
    #[cfg(target_os = "none")]
    // SAFETY: The caller guarantees the image; the loads cover exactly
    // ECTX_SIZE bytes.
    unsafe {
        core::arch::asm!(
            "ldp q0, q1, [{a}, #0]",
            "ldp q2, q3, [{a}, #32]",
            "ldp q4, q5, [{a}, #64]",
            "ldp q6, q7, [{a}, #96]",
            "ldp q8, q9, [{a}, #128]",
            "ldp q10, q11, [{a}, #160]",
            "ldp q12, q13, [{a}, #192]",
            "ldp q14, q15, [{a}, #224]",
            "ldp q16, q17, [{a}, #256]",
            "ldp q18, q19, [{a}, #288]",
            "ldp q20, q21, [{a}, #320]",
            "ldp q22, q23, [{a}, #352]",
            "ldp q24, q25, [{a}, #384]",
            "ldp q26, q27, [{a}, #416]",
            "ldp q28, q29, [{a}, #448]",
            "ldp q30, q31, [{a}, #480]",
            "ldp {t1}, {t2}, [{a}, #512]",
            "msr fpcr, {t1}",
            "msr fpsr, {t2}",
            a = in(reg) state,
            t1 = out(reg) _,
            t2 = out(reg) _,
            options(nostack)
        );
    }
    #[cfg(not(target_os = "none"))]
    let _ = state;
}
