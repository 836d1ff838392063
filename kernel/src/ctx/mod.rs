//! Execution contexts for cooperative scheduling
//!
//! A [`Context`] is just an instruction pointer and a stack pointer; all
//! other machine state lives on the stack the context points at. The entry
//! initializers build a stack image that, on the first switch, routes
//! through the architecture's call trampolines: the trampoline pops the
//! entry arguments into the calling convention's argument registers and
//! tail-jumps to the entry function. When register clearing is requested,
//! the image is prefixed with the clearing trampoline so the new context
//! starts with a zeroed standard register set.
//!
//! Entry functions do not return; switching away is the only way out.

pub mod auxstack;
pub mod execenv;

pub use execenv::ExecEnv;

use crate::arch::context as arch_ctx;
use crate::error::{KernelError, KernelResult};
use crate::mm::is_aligned;

/// Stack-pointer alignment required at context entry points
pub const SP_ALIGN: u64 = arch_ctx::SP_ALIGN;

/// A minimal execution context
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct Context {
    /// Instruction pointer to resume at
    pub ip: u64,
    /// Stack pointer to resume with
    pub sp: u64,
}

// The switch assembly addresses these fields by offset.
const _: () = assert!(core::mem::offset_of!(Context, ip) == 0);
const _: () = assert!(core::mem::offset_of!(Context, sp) == 8);

/// Entry function taking no arguments
pub type Entry0 = extern "C" fn() -> !;
/// Entry function taking one argument
pub type Entry1 = extern "C" fn(u64) -> !;
/// Entry function taking two arguments
pub type Entry2 = extern "C" fn(u64, u64) -> !;
/// Entry function taking three arguments
pub type Entry3 = extern "C" fn(u64, u64, u64) -> !;
/// Entry function taking four arguments
pub type Entry4 = extern "C" fn(u64, u64, u64, u64) -> !;
/// Entry function taking five arguments
pub type Entry5 = extern "C" fn(u64, u64, u64, u64, u64) -> !;
/// Entry function taking six arguments
pub type Entry6 = extern "C" fn(u64, u64, u64, u64, u64, u64) -> !;

/// Push a value onto the stack of a context that is not currently running
///
/// # Safety
///
/// `sp` must point into writable stack memory with at least eight bytes of
/// headroom below it.
pub unsafe fn rstack_push(sp: u64, value: u64) -> u64 {
    let sp = sp - 8;
    // SAFETY: Guaranteed by the caller.
    unsafe { core::ptr::write(sp as *mut u64, value) };
    sp
}

/// Initialize `ctx` with a raw stack and instruction pointer. Nothing is
/// pushed and no registers are cleared on switch; execution does not have
/// to start at a function entry, so no alignment is enforced either.
pub fn init_bare(ctx: &mut Context, sp: u64, ip: u64) {
    *ctx = Context { ip, sp };
}

/// Initialize `ctx` to start executing at `ip` with a function-entry stack.
/// With `keep_regs == false` the standard register set is zeroed before
/// execution starts at `ip`.
///
/// # Safety
///
/// `sp` must be the top of a live, writable stack.
pub unsafe fn init(ctx: &mut Context, sp: u64, keep_regs: bool, ip: u64) -> KernelResult<()> {
    // SAFETY: Forwarded caller contract; `ip` is pushed as the chain target.
    unsafe { build_entry_chain(ctx, sp, keep_regs, ip, &[]) }
}

/// Initialize `ctx` to call `entry()` on the given stack
///
/// # Safety
///
/// `sp` must be the top of a live, writable stack with room for the image.
pub unsafe fn init_entry0(
    ctx: &mut Context,
    sp: u64,
    keep_regs: bool,
    entry: Entry0,
) -> KernelResult<()> {
    // SAFETY: Forwarded caller contract.
    unsafe { build_entry_chain(ctx, sp, keep_regs, entry as usize as u64, &[]) }
}

/// Initialize `ctx` to call `entry(arg)` on the given stack
///
/// # Safety
///
/// As for [`init_entry0`].
pub unsafe fn init_entry1(
    ctx: &mut Context,
    sp: u64,
    keep_regs: bool,
    entry: Entry1,
    arg: u64,
) -> KernelResult<()> {
    // SAFETY: Forwarded caller contract.
    unsafe { build_entry_chain(ctx, sp, keep_regs, entry as usize as u64, &[arg]) }
}

/// Initialize `ctx` to call `entry(arg0, arg1)` on the given stack
///
/// # Safety
///
/// As for [`init_entry0`].
pub unsafe fn init_entry2(
    ctx: &mut Context,
    sp: u64,
    keep_regs: bool,
    entry: Entry2,
    arg0: u64,
    arg1: u64,
) -> KernelResult<()> {
    // SAFETY: Forwarded caller contract.
    unsafe { build_entry_chain(ctx, sp, keep_regs, entry as usize as u64, &[arg0, arg1]) }
}

/// Initialize `ctx` to call `entry(arg0..arg2)` on the given stack
///
/// # Safety
///
/// As for [`init_entry0`].
pub unsafe fn init_entry3(
    ctx: &mut Context,
    sp: u64,
    keep_regs: bool,
    entry: Entry3,
    arg0: u64,
    arg1: u64,
    arg2: u64,
) -> KernelResult<()> {
    // SAFETY: Forwarded caller contract.
    unsafe {
        build_entry_chain(ctx, sp, keep_regs, entry as usize as u64, &[arg0, arg1, arg2])
    }
}

/// Initialize `ctx` to call `entry(arg0..arg3)` on the given stack
///
/// # Safety
///
/// As for [`init_entry0`].
pub unsafe fn init_entry4(
    ctx: &mut Context,
    sp: u64,
    keep_regs: bool,
    entry: Entry4,
    arg0: u64,
    arg1: u64,
    arg2: u64,
    arg3: u64,
) -> KernelResult<()> {
    // SAFETY: Forwarded caller contract.
    unsafe {
        build_entry_chain(
            ctx,
            sp,
            keep_regs,
            entry as usize as u64,
            &[arg0, arg1, arg2, arg3],
        )
    }
}

/// Initialize `ctx` to call `entry(arg0..arg4)` on the given stack
///
/// # Safety
///
/// As for [`init_entry0`].
pub unsafe fn init_entry5(
    ctx: &mut Context,
    sp: u64,
    keep_regs: bool,
    entry: Entry5,
    arg0: u64,
    arg1: u64,
    arg2: u64,
    arg3: u64,
    arg4: u64,
) -> KernelResult<()> {
    // SAFETY: Forwarded caller contract.
    unsafe {
        build_entry_chain(
            ctx,
            sp,
            keep_regs,
            entry as usize as u64,
            &[arg0, arg1, arg2, arg3, arg4],
        )
    }
}

/// Initialize `ctx` to call `entry(arg0..arg5)` on the given stack
///
/// # Safety
///
/// As for [`init_entry0`].
pub unsafe fn init_entry6(
    ctx: &mut Context,
    sp: u64,
    keep_regs: bool,
    entry: Entry6,
    arg0: u64,
    arg1: u64,
    arg2: u64,
    arg3: u64,
    arg4: u64,
    arg5: u64,
) -> KernelResult<()> {
    // SAFETY: Forwarded caller contract.
    unsafe {
        build_entry_chain(
            ctx,
            sp,
            keep_regs,
            entry as usize as u64,
            &[arg0, arg1, arg2, arg3, arg4, arg5],
        )
    }
}

/// Shared stack-image builder: push the entry, its arguments (first
/// argument highest), and route through the matching call trampoline,
/// optionally prefixed by the register-clearing trampoline.
unsafe fn build_entry_chain(
    ctx: &mut Context,
    sp: u64,
    keep_regs: bool,
    entry: u64,
    args: &[u64],
) -> KernelResult<()> {
    if sp == 0 || !is_aligned(sp, SP_ALIGN) {
        return Err(KernelError::InvalidArgument {
            what: "stack pointer alignment",
        });
    }
    if entry == 0 {
        return Err(KernelError::InvalidArgument {
            what: "context entry point",
        });
    }

    // SAFETY: The caller vouches for the stack; pushes stay within it.
    unsafe {
        let mut sp = rstack_push(sp, entry);
        for &arg in args {
            sp = rstack_push(sp, arg);
        }
        let call = arch_ctx::call_addr(args.len());
        if keep_regs {
            init_bare(ctx, sp, call);
        } else {
            sp = rstack_push(sp, call);
            init_bare(ctx, sp, arch_ctx::clearregs_addr());
        }
    }

    Ok(())
}

/// Switch the executing CPU to `load`, saving the current context into
/// `store`. The callee-saved register set goes to `store`'s stack and is
/// restored when `store` is switched to again; caller-saved registers are
/// clobbered per the calling convention.
///
/// # Safety
///
/// `load` must be an initialized context whose stack is live, and IRQs must
/// be disabled around the switch.
pub unsafe fn switch(store: &mut Context, load: &Context) {
    // SAFETY: Forwarded caller contract.
    unsafe { arch_ctx::ctx_switch(store, load) };
}

/// One-way switch to `load`; the current stack is abandoned.
///
/// # Safety
///
/// As for [`switch`], and nothing may reference the current stack again.
pub unsafe fn jump(load: &Context) -> ! {
    // SAFETY: Forwarded caller contract.
    unsafe { arch_ctx::ctx_jump(load) }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use std::vec;

    extern "C" fn entry2(_a: u64, _b: u64) -> ! {
        unreachable!("test entry is never executed")
    }

    struct Stack {
        _buf: vec::Vec<u128>,
        top: u64,
    }

    fn stack() -> Stack {
        // u128 storage keeps the buffer 16-byte aligned.
        let buf = vec![0u128; 512];
        let top = buf.as_ptr() as u64 + (buf.len() * 16) as u64;
        assert!(is_aligned(top, SP_ALIGN));
        Stack { _buf: buf, top }
    }

    fn word_at(addr: u64) -> u64 {
        // SAFETY: Test addresses point into the live stack buffer.
        unsafe { core::ptr::read(addr as *const u64) }
    }

    #[test]
    fn bare_context_stores_ip_and_sp() {
        let mut ctx = Context::default();
        init_bare(&mut ctx, 0x1000, 0x2000);
        assert_eq!(ctx.sp, 0x1000);
        assert_eq!(ctx.ip, 0x2000);
    }

    #[test]
    fn entry2_image_with_cleared_regs() {
        let s = stack();
        let mut ctx = Context::default();
        // SAFETY: The stack buffer outlives the context.
        unsafe { init_entry2(&mut ctx, s.top, false, entry2, 7, 11) }
            .expect("entry context construction");

        // Stack image, top down: entry, arg0, arg1, call2.
        assert_eq!(word_at(s.top - 8), entry2 as usize as u64);
        assert_eq!(word_at(s.top - 16), 7);
        assert_eq!(word_at(s.top - 24), 11);
        assert_eq!(
            word_at(s.top - 32),
            crate::arch::context::call_addr(2),
            "the two-argument trampoline must sit below the arguments"
        );
        assert_eq!(ctx.sp, s.top - 32);
        assert_eq!(
            ctx.ip,
            crate::arch::context::clearregs_addr(),
            "keep_regs == false must route through the clearing trampoline"
        );
    }

    #[test]
    fn entry2_image_keeping_regs() {
        let s = stack();
        let mut ctx = Context::default();
        // SAFETY: The stack buffer outlives the context.
        unsafe { init_entry2(&mut ctx, s.top, true, entry2, 1, 2) }
            .expect("entry context construction");

        assert_eq!(ctx.sp, s.top - 24);
        assert_eq!(ctx.ip, crate::arch::context::call_addr(2));
    }

    #[test]
    fn misaligned_sp_is_rejected() {
        let s = stack();
        let mut ctx = Context::default();
        // SAFETY: The stack buffer outlives the context.
        let result = unsafe { init_entry2(&mut ctx, s.top - 8, false, entry2, 0, 0) };
        assert!(matches!(result, Err(KernelError::InvalidArgument { .. })));
    }

    #[test]
    fn null_stack_is_rejected() {
        let mut ctx = Context::default();
        // SAFETY: Rejected before any write happens.
        let result = unsafe { init_entry0(&mut ctx, 0, false, null_entry) };
        assert!(result.is_err());
    }

    extern "C" fn null_entry() -> ! {
        unreachable!("test entry is never executed")
    }
}
