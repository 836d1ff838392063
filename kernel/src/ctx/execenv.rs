//! Execution environments and exception trampolines
//!
//! An [`ExecEnv`] is the full machine state visible to an exception-level
//! handler: the general-purpose register snapshot, the system context (TLS
//! pointers), and the extended context (FPU/SIMD), padded so the block's
//! end can sit at the extended-context alignment.
//!
//! The trampoline initializers arrange, on a caller-supplied stack, for
//!
//! ```text
//! prolog (store ECTX + SYSCTX, IRQs on) → handler(ee, args...) → epilog
//! ```
//!
//! where the epilog ([`execenv_load`]) restores the environment and resumes
//! the interrupted code. The chain is built from the same call trampolines
//! the entry contexts use; each stage finds its successor on the stack.

use super::{init_bare, rstack_push, Context, SP_ALIGN};
use crate::arch::context::{self as arch_ctx, Regs, SysCtx};
use crate::arch::ectx;
use crate::error::{KernelError, KernelResult};
use crate::mm::{align_down, align_up, is_aligned};

/// Size of the architectural extended-context save area
pub const ECTX_SIZE: usize = ectx::ECTX_SIZE;

/// Alignment of the extended-context save area
pub const ECTX_ALIGN: usize = ectx::ECTX_ALIGN;

/// Alignment required for the end of an in-stack [`ExecEnv`] block
pub const EXECENV_END_ALIGN: usize = ECTX_ALIGN;

const EXECENV_PAD: usize = align_up(ECTX_SIZE as u64, ECTX_ALIGN as u64) as usize - ECTX_SIZE;

/// Execution environment block
#[repr(C)]
pub struct ExecEnv {
    /// General-purpose and flags registers
    pub regs: Regs,
    /// System registers (TLS pointers)
    pub sysctx: SysCtx,
    /// Extended context (FPU/SIMD state)
    pub ectx: [u8; ECTX_SIZE],
    /// Padding for end alignment
    pad: [u8; EXECENV_PAD],
}

// The save/restore assembly and the FXSAVE-class instructions rely on these
// layout properties.
const _: () = assert!(core::mem::offset_of!(ExecEnv, regs) == 0);
const _: () = assert!(core::mem::offset_of!(ExecEnv, ectx) % ECTX_ALIGN == 0);
const _: () = assert!((EXECENV_PAD + ECTX_SIZE) % ECTX_ALIGN == 0);

/// Size of an [`ExecEnv`] block
pub const EXECENV_SIZE: usize = core::mem::size_of::<ExecEnv>();

/// Exception handler taking no extra arguments
pub type EhEntry0 = extern "C" fn(*mut ExecEnv);
/// Exception handler taking one extra argument
pub type EhEntry1 = extern "C" fn(*mut ExecEnv, u64);
/// Exception handler taking two extra arguments
pub type EhEntry2 = extern "C" fn(*mut ExecEnv, u64, u64);
/// Exception handler taking three extra arguments
pub type EhEntry3 = extern "C" fn(*mut ExecEnv, u64, u64, u64);

/// Trampoline prolog: runs first in a freshly built handler context.
/// Re-enables IRQs, then captures the extended and system context of the
/// interrupted code into the environment block.
extern "C" fn execenv_store(ee: *mut ExecEnv) {
    debug_assert!(!ee.is_null());

    crate::arch::irq_enable();

    // SAFETY: `ee` points at the in-stack environment block built by the
    // trampoline initializer; its ectx area satisfies size and alignment by
    // the const assertions above.
    unsafe {
        let ectx_area = (*ee).ectx.as_mut_ptr();
        ectx::sanitize(ectx_area);
        ectx::store(ectx_area);
        arch_ctx::sysctx_store(&mut (*ee).sysctx);
    }
}

/// Trampoline epilog: restore the execution environment and resume the
/// interrupted code. Never returns; the entire current context is replaced.
pub extern "C" fn execenv_load(ee: *mut ExecEnv) -> ! {
    debug_assert!(!ee.is_null());

    // SAFETY: `ee` was populated by `execenv_store` and the exception entry
    // path; restoring it is the defined way back.
    unsafe {
        arch_ctx::sysctx_load(&(*ee).sysctx);
        ectx::load((*ee).ectx.as_ptr());
        arch_ctx::regs_load(&(*ee).regs)
    }
}

/// Build the shared trampoline chain. Stack image, from high to low:
/// epilog frame (`execenv_load`), handler frame (`entry(ee, args...)`),
/// prolog frame (`execenv_store`). Initial `ip` is the one-argument call
/// trampoline consuming the prolog frame.
unsafe fn build_ehtrampo(
    ctx: &mut Context,
    regs: &Regs,
    sp: u64,
    entry: u64,
    args: &[u64],
) -> KernelResult<*mut ExecEnv> {
    if sp == 0 || !is_aligned(sp, SP_ALIGN) {
        return Err(KernelError::InvalidArgument {
            what: "stack pointer alignment",
        });
    }
    if entry == 0 {
        return Err(KernelError::InvalidArgument {
            what: "trampoline entry point",
        });
    }

    let mut sp = align_down(sp, EXECENV_END_ALIGN as u64);
    sp -= align_up(EXECENV_SIZE as u64, EXECENV_END_ALIGN as u64);
    let ee = sp as *mut ExecEnv;

    // SAFETY: The caller vouches for the stack; the block and all pushes
    // stay within it.
    unsafe {
        (*ee).regs = *regs;

        sp = rstack_push(sp, execenv_load as usize as u64);
        sp = rstack_push(sp, ee as u64);
        sp = rstack_push(sp, arch_ctx::call_addr(1));

        sp = rstack_push(sp, entry);
        sp = rstack_push(sp, ee as u64);
        for &arg in args {
            sp = rstack_push(sp, arg);
        }
        sp = rstack_push(sp, arch_ctx::call_addr(1 + args.len()));

        sp = rstack_push(sp, execenv_store as usize as u64);
        sp = rstack_push(sp, ee as u64);
    }

    init_bare(ctx, sp, arch_ctx::call_addr(1));
    Ok(ee)
}

/// Arrange for `entry(ee)` to run on `sp` with the interrupted register
/// snapshot `regs` visible in the environment block.
///
/// # Safety
///
/// `sp` must be the top of a live, writable stack large enough for the
/// environment block and the trampoline frames.
pub unsafe fn init_ehtrampo0(
    ctx: &mut Context,
    regs: &Regs,
    sp: u64,
    entry: EhEntry0,
) -> KernelResult<*mut ExecEnv> {
    // SAFETY: Forwarded caller contract.
    unsafe { build_ehtrampo(ctx, regs, sp, entry as usize as u64, &[]) }
}

/// Like [`init_ehtrampo0`] with one extra handler argument.
///
/// # Safety
///
/// As for [`init_ehtrampo0`].
pub unsafe fn init_ehtrampo1(
    ctx: &mut Context,
    regs: &Regs,
    sp: u64,
    entry: EhEntry1,
    arg: u64,
) -> KernelResult<*mut ExecEnv> {
    // SAFETY: Forwarded caller contract.
    unsafe { build_ehtrampo(ctx, regs, sp, entry as usize as u64, &[arg]) }
}

/// Like [`init_ehtrampo0`] with two extra handler arguments.
///
/// # Safety
///
/// As for [`init_ehtrampo0`].
pub unsafe fn init_ehtrampo2(
    ctx: &mut Context,
    regs: &Regs,
    sp: u64,
    entry: EhEntry2,
    arg0: u64,
    arg1: u64,
) -> KernelResult<*mut ExecEnv> {
    // SAFETY: Forwarded caller contract.
    unsafe { build_ehtrampo(ctx, regs, sp, entry as usize as u64, &[arg0, arg1]) }
}

/// Like [`init_ehtrampo0`] with three extra handler arguments.
///
/// # Safety
///
/// As for [`init_ehtrampo0`].
pub unsafe fn init_ehtrampo3(
    ctx: &mut Context,
    regs: &Regs,
    sp: u64,
    entry: EhEntry3,
    arg0: u64,
    arg1: u64,
    arg2: u64,
) -> KernelResult<*mut ExecEnv> {
    // SAFETY: Forwarded caller contract.
    unsafe { build_ehtrampo(ctx, regs, sp, entry as usize as u64, &[arg0, arg1, arg2]) }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use std::vec;

    extern "C" fn handler1(_ee: *mut ExecEnv, _arg: u64) {}

    struct Stack {
        _buf: vec::Vec<u128>,
        top: u64,
    }

    fn stack() -> Stack {
        let buf = vec![0u128; 1024];
        let top = buf.as_ptr() as u64 + (buf.len() * 16) as u64;
        Stack { _buf: buf, top }
    }

    fn word_at(addr: u64) -> u64 {
        // SAFETY: Test addresses point into the live stack buffer.
        unsafe { core::ptr::read(addr as *const u64) }
    }

    #[test]
    fn execenv_block_is_aligned_and_padded() {
        assert_eq!(EXECENV_SIZE % 8, 0);
        assert_eq!(
            (core::mem::size_of::<Regs>() + core::mem::size_of::<SysCtx>()) % ECTX_ALIGN,
            0,
            "the ectx area must start aligned inside the block"
        );
    }

    #[test]
    fn ehtrampo1_chain_layout() {
        let s = stack();
        let top = align_down(s.top, EXECENV_END_ALIGN as u64);

        let mut regs = Regs::default();
        regs.rip = 0xABCD;
        regs.rsp = 0x1234_5678;

        let mut ctx = Context::default();
        // SAFETY: The stack buffer outlives the context.
        let ee = unsafe { init_ehtrampo1(&mut ctx, &regs, top, handler1, 42) }
            .expect("trampoline construction");

        assert_eq!(
            ee as u64 % EXECENV_END_ALIGN as u64,
            0,
            "environment block must be end-aligned"
        );
        // SAFETY: `ee` points into the live stack buffer.
        let copied = unsafe { &(*ee).regs };
        assert_eq!(copied.rip, 0xABCD);
        assert_eq!(copied.rsp, 0x1234_5678);

        // Chain, bottom (ctx.sp) to top: prolog, handler frame, epilog.
        let call1 = crate::arch::context::call_addr(1);
        let call2 = crate::arch::context::call_addr(2);
        assert_eq!(ctx.ip, call1);
        assert_eq!(word_at(ctx.sp), ee as u64);
        assert_eq!(word_at(ctx.sp + 16), call2);
        assert_eq!(word_at(ctx.sp + 24), 42);
        assert_eq!(word_at(ctx.sp + 32), ee as u64);
        assert_eq!(word_at(ctx.sp + 40), handler1 as usize as u64);
        assert_eq!(word_at(ctx.sp + 48), call1);
        assert_eq!(word_at(ctx.sp + 56), ee as u64);
        assert_eq!(word_at(ctx.sp + 64), execenv_load as usize as u64);
    }

    #[test]
    fn misaligned_sp_is_rejected() {
        let s = stack();
        let mut ctx = Context::default();
        let regs = Regs::default();
        // SAFETY: Rejected before any write happens.
        let result = unsafe { init_ehtrampo0(&mut ctx, &regs, s.top - 4, handler0) };
        assert!(matches!(result, Err(KernelError::InvalidArgument { .. })));
    }

    extern "C" fn handler0(_ee: *mut ExecEnv) {}
}
