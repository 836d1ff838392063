//! Auxiliary-stack control block
//!
//! Each per-CPU auxiliary stack carries a small control block at its high
//! end: the current safe frame pointer inside the stack area and the
//! kernel's system context (TLS pointer). Exception entry code locates the
//! block by fixed offsets from the auxiliary stack pointer, which must
//! always point at the high end of the stack and be [`AUXSP_ALIGN`]
//! aligned.

use crate::arch::context::SysCtx;
use crate::error::{KernelError, KernelResult};
use crate::mm::{align_up, is_aligned};

/// Alignment of the auxiliary stack pointer and of `curr_fp`
pub const AUXSP_ALIGN: usize = 16;

const CURR_FP_SIZE: usize = core::mem::size_of::<u64>();
const AUXSPCB_PAD: usize = align_up(
    (CURR_FP_SIZE + core::mem::size_of::<SysCtx>()) as u64,
    AUXSP_ALIGN as u64,
) as usize
    - (CURR_FP_SIZE + core::mem::size_of::<SysCtx>());

/// Control block at the high end of an auxiliary stack
#[repr(C)]
pub struct AuxStackCb {
    /// Current safe frame pointer inside the auxiliary stack area
    pub curr_fp: u64,
    /// Kernel system registers (TLS pointer)
    pub sysctx: SysCtx,
    /// Padding; the usable stack area ends just below the block
    pad: [u8; AUXSPCB_PAD],
}

/// Size of the control block
pub const AUXSPCB_SIZE: usize = core::mem::size_of::<AuxStackCb>();

// Exception entry code relies on the fixed layout.
const _: () = assert!(core::mem::offset_of!(AuxStackCb, curr_fp) == 0);
const _: () = assert!(core::mem::offset_of!(AuxStackCb, sysctx) == CURR_FP_SIZE);
const _: () = assert!(AUXSPCB_SIZE % AUXSP_ALIGN == 0);

fn check_auxsp(auxsp: u64) -> KernelResult<()> {
    if auxsp == 0 || !is_aligned(auxsp, AUXSP_ALIGN as u64) {
        return Err(KernelError::InvalidArgument {
            what: "auxiliary stack pointer alignment",
        });
    }
    Ok(())
}

/// The control block of the auxiliary stack ending at `auxsp`
fn cb_ptr(auxsp: u64) -> *mut AuxStackCb {
    (auxsp - AUXSPCB_SIZE as u64) as *mut AuxStackCb
}

/// Initialize the control block of a fresh auxiliary stack. `auxsp` points
/// at the high end of the stack. Must be called before any other accessor.
///
/// # Safety
///
/// `auxsp` must be the high end of a live, writable stack of at least
/// [`AUXSPCB_SIZE`] bytes.
pub unsafe fn init(auxsp: u64) -> KernelResult<()> {
    check_auxsp(auxsp)?;
    let cb = cb_ptr(auxsp);
    // SAFETY: The caller vouches for the stack memory; the block lies just
    // below `auxsp`.
    unsafe {
        (*cb).curr_fp = auxsp - AUXSPCB_SIZE as u64;
        (*cb).sysctx = SysCtx::default();
    }
    debug_assert!(is_aligned(auxsp - AUXSPCB_SIZE as u64, AUXSP_ALIGN as u64));
    Ok(())
}

/// Read the current frame pointer of the auxiliary stack
///
/// # Safety
///
/// `auxsp` must have been initialized with [`init`].
pub unsafe fn curr_fp(auxsp: u64) -> u64 {
    debug_assert!(check_auxsp(auxsp).is_ok());
    // SAFETY: `init` established the block below `auxsp`.
    unsafe { (*cb_ptr(auxsp)).curr_fp }
}

/// Set the current frame pointer of the auxiliary stack
///
/// # Safety
///
/// As for [`curr_fp`]; `fp` must lie within the auxiliary stack area.
pub unsafe fn set_curr_fp(auxsp: u64, fp: u64) -> KernelResult<()> {
    check_auxsp(auxsp)?;
    if !is_aligned(fp, AUXSP_ALIGN as u64) {
        return Err(KernelError::InvalidArgument {
            what: "auxiliary frame pointer alignment",
        });
    }
    // SAFETY: `init` established the block below `auxsp`.
    unsafe { (*cb_ptr(auxsp)).curr_fp = fp };
    Ok(())
}

/// Read the kernel TLS pointer stored in the control block
///
/// # Safety
///
/// As for [`curr_fp`].
pub unsafe fn tlsp(auxsp: u64) -> u64 {
    debug_assert!(check_auxsp(auxsp).is_ok());
    // SAFETY: `init` established the block below `auxsp`.
    unsafe { (*cb_ptr(auxsp)).sysctx.tlsp() }
}

/// Store the kernel TLS pointer in the control block
///
/// # Safety
///
/// As for [`curr_fp`].
pub unsafe fn set_tlsp(auxsp: u64, tlsp: u64) {
    debug_assert!(check_auxsp(auxsp).is_ok());
    // SAFETY: `init` established the block below `auxsp`.
    unsafe { (*cb_ptr(auxsp)).sysctx.set_tlsp(tlsp) };
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use std::vec;

    fn auxstack() -> (vec::Vec<u128>, u64) {
        let buf = vec![0u128; 256];
        let top = buf.as_ptr() as u64 + (buf.len() * 16) as u64;
        (buf, top)
    }

    #[test]
    fn init_places_fp_below_block() {
        let (_buf, top) = auxstack();
        // SAFETY: The buffer outlives the accesses.
        unsafe {
            init(top).expect("auxiliary stack init");
            assert_eq!(curr_fp(top), top - AUXSPCB_SIZE as u64);
            assert!(is_aligned(curr_fp(top), AUXSP_ALIGN as u64));
        }
    }

    #[test]
    fn fp_and_tls_accessors_roundtrip() {
        let (_buf, top) = auxstack();
        // SAFETY: The buffer outlives the accesses.
        unsafe {
            init(top).expect("auxiliary stack init");

            let fp = top - 0x100;
            set_curr_fp(top, fp).expect("aligned frame pointer");
            assert_eq!(curr_fp(top), fp);

            set_tlsp(top, 0xdead_0000);
            assert_eq!(tlsp(top), 0xdead_0000);
        }
    }

    #[test]
    fn misaligned_inputs_are_rejected() {
        let (_buf, top) = auxstack();
        // SAFETY: Rejected before any write happens.
        unsafe {
            assert!(init(top - 4).is_err());
            init(top).expect("auxiliary stack init");
            assert!(set_curr_fp(top, top - 4).is_err());
        }
    }
}
