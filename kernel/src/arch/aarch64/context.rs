//! AArch64 execution-context support
//!
//! The call trampolines load entry-function arguments from a prepared stack
//! image into `x0..x5` and branch to the entry function found above them.
//! `_ferrite_ctx_switch` saves the callee-saved set on the source stack and
//! resumes the destination context at its stored instruction pointer.

use core::arch::global_asm;

use crate::ctx::Context;

/// Stack-pointer alignment required when a context starts at a function
/// entry point
pub const SP_ALIGN: u64 = 16;

/// General-purpose register snapshot, in the order the exception entry code
/// saves them and `_ferrite_execenv_regs_load` restores them.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct Regs {
    /// x0..x29
    pub x: [u64; 30],
    /// Link register (x30)
    pub lr: u64,
    /// Stack pointer of the interrupted context
    pub sp: u64,
    /// Exception link register (resume address)
    pub elr: u64,
    /// Saved program status
    pub spsr: u64,
    /// Exception syndrome
    pub esr: u64,
    /// Keeps the snapshot 16-byte sized
    pub pad: u64,
}

/// System context: the TLS base registers
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct SysCtx {
    pub tpidr_el0: u64,
    pub pad: u64,
}

impl SysCtx {
    /// The TLS pointer as the rest of the kernel sees it
    pub fn tlsp(&self) -> u64 {
        self.tpidr_el0
    }

    pub fn set_tlsp(&mut self, tlsp: u64) {
        self.tpidr_el0 = tlsp;
    }
}

/// Capture the executing CPU's system context
pub fn sysctx_store(sysctx: &mut SysCtx) {
    #[cfg(target_os = "none")]
    {
        let tpidr: u64;
        // SAFETY: Reading TPIDR_EL0 has no side effects.
        unsafe {
            core::arch::asm!("mrs {}, tpidr_el0", out(reg) tpidr, options(nomem, nostack));
        }
        sysctx.tpidr_el0 = tpidr;
    }
    #[cfg(not(target_os = "none"))]
    {
        *sysctx = SysCtx::default();
    }
}

/// Install a previously captured system context on the executing CPU
pub fn sysctx_load(sysctx: &SysCtx) {
    #[cfg(target_os = "none")]
    // SAFETY: TPIDR_EL0 only affects TLS addressing of the loaded context.
    unsafe {
        core::arch::asm!("msr tpidr_el0, {}", in(reg) sysctx.tpidr_el0, options(nomem, nostack));
    }
    #[cfg(not(target_os = "none"))]
    let _ = sysctx;
}

global_asm!(
    r#"
    .text

    // Zero the standard register set (x0..x29, lr), then continue with the
    // next stack-image element.
    .global _ferrite_ctx_clearregs
_ferrite_ctx_clearregs:
    mov x0, xzr
    mov x1, xzr
    mov x2, xzr
    mov x3, xzr
    mov x4, xzr
    mov x5, xzr
    mov x6, xzr
    mov x7, xzr
    mov x8, xzr
    mov x9, xzr
    mov x10, xzr
    mov x11, xzr
    mov x12, xzr
    mov x13, xzr
    mov x14, xzr
    mov x15, xzr
    mov x16, xzr
    mov x17, xzr
    mov x18, xzr
    mov x19, xzr
    mov x20, xzr
    mov x21, xzr
    mov x22, xzr
    mov x23, xzr
    mov x24, xzr
    mov x25, xzr
    mov x26, xzr
    mov x27, xzr
    mov x28, xzr
    mov x29, xzr
    mov x30, xzr
    ldr x16, [sp], #8
    br x16

    // _ferrite_ctx_callN: pop N arguments (pushed first-argument-highest)
    // into x0..xN-1 and branch to the entry function above them. The link
    // register is pointed back at _ferrite_ctx_call0 so a returning callee
    // continues with the next element of the stack image, mirroring the
    // ret-chaining the x86 trampolines get for free.
    .global _ferrite_ctx_call0
_ferrite_ctx_call0:
    ldr x16, [sp], #8
    adr x30, _ferrite_ctx_call0
    br x16

    .global _ferrite_ctx_call1
_ferrite_ctx_call1:
    ldr x0, [sp], #8
    ldr x16, [sp], #8
    adr x30, _ferrite_ctx_call0
    br x16

    .global _ferrite_ctx_call2
_ferrite_ctx_call2:
    ldp x1, x0, [sp], #16
    ldr x16, [sp], #8
    adr x30, _ferrite_ctx_call0
    br x16

    .global _ferrite_ctx_call3
_ferrite_ctx_call3:
    ldr x2, [sp], #8
    ldp x1, x0, [sp], #16
    ldr x16, [sp], #8
    adr x30, _ferrite_ctx_call0
    br x16

    .global _ferrite_ctx_call4
_ferrite_ctx_call4:
    ldp x3, x2, [sp], #16
    ldp x1, x0, [sp], #16
    ldr x16, [sp], #8
    adr x30, _ferrite_ctx_call0
    br x16

    .global _ferrite_ctx_call5
_ferrite_ctx_call5:
    ldr x4, [sp], #8
    ldp x3, x2, [sp], #16
    ldp x1, x0, [sp], #16
    ldr x16, [sp], #8
    adr x30, _ferrite_ctx_call0
    br x16

    .global _ferrite_ctx_call6
_ferrite_ctx_call6:
    ldp x5, x4, [sp], #16
    ldp x3, x2, [sp], #16
    ldp x1, x0, [sp], #16
    ldr x16, [sp], #8
    adr x30, _ferrite_ctx_call0
    br x16

    // _ferrite_ctx_switch(store: x0, load: x1)
    //
    // Saves the callee-saved set on the current stack, records the resume
    // point in *store, and continues *load.
    .global _ferrite_ctx_switch
_ferrite_ctx_switch:
    stp x19, x20, [sp, #-96]!
    stp x21, x22, [sp, #16]
    stp x23, x24, [sp, #32]
    stp x25, x26, [sp, #48]
    stp x27, x28, [sp, #64]
    stp x29, x30, [sp, #80]
    adr x2, 2f
    str x2, [x0, #0]        // store->ip
    mov x3, sp
    str x3, [x0, #8]        // store->sp
    ldr x3, [x1, #8]
    mov sp, x3
    ldr x2, [x1, #0]
    br x2
2:
    ldp x21, x22, [sp, #16]
    ldp x23, x24, [sp, #32]
    ldp x25, x26, [sp, #48]
    ldp x27, x28, [sp, #64]
    ldp x29, x30, [sp, #80]
    ldp x19, x20, [sp], #96
    ret

    // _ferrite_ctx_jump(load: x0) -- one-way switch
    .global _ferrite_ctx_jump
_ferrite_ctx_jump:
    ldr x2, [x0, #8]
    mov sp, x2
    ldr x1, [x0, #0]
    br x1

    // _ferrite_execenv_regs_load(regs: x0)
    //
    // Final stage of restoring an execution environment: reload the
    // general-purpose registers, stack and status from the snapshot and
    // ERET to the interrupted code.
    .global _ferrite_execenv_regs_load
_ferrite_execenv_regs_load:
    ldr x1, [x0, #248]      // regs->sp
    msr sp_el0, x1
    ldr x1, [x0, #256]      // regs->elr
    msr elr_el1, x1
    ldr x1, [x0, #264]      // regs->spsr
    msr spsr_el1, x1
    ldr x30, [x0, #240]     // regs->lr
    ldp x2, x3, [x0, #16]
    ldp x4, x5, [x0, #32]
    ldp x6, x7, [x0, #48]
    ldp x8, x9, [x0, #64]
    ldp x10, x11, [x0, #80]
    ldp x12, x13, [x0, #96]
    ldp x14, x15, [x0, #112]
    ldp x16, x17, [x0, #128]
    ldp x18, x19, [x0, #144]
    ldp x20, x21, [x0, #160]
    ldp x22, x23, [x0, #176]
    ldp x24, x25, [x0, #192]
    ldp x26, x27, [x0, #208]
    ldp x28, x29, [x0, #224]
    ldp x0, x1, [x0, #0]
    eret
"#
);

extern "C" {
    fn _ferrite_ctx_clearregs();
    fn _ferrite_ctx_call0();
    fn _ferrite_ctx_call1();
    fn _ferrite_ctx_call2();
    fn _ferrite_ctx_call3();
    fn _ferrite_ctx_call4();
    fn _ferrite_ctx_call5();
    fn _ferrite_ctx_call6();
    fn _ferrite_ctx_switch(store: *mut Context, load: *const Context);
    fn _ferrite_ctx_jump(load: *const Context) -> !;
    fn _ferrite_execenv_regs_load(regs: *const Regs) -> !;
}

/// Address of the register-clearing trampoline
pub fn clearregs_addr() -> u64 {
    _ferrite_ctx_clearregs as usize as u64
}

/// Address of the argument-loading trampoline for `nargs` arguments
pub fn call_addr(nargs: usize) -> u64 {
    let f: unsafe extern "C" fn() = match nargs {
        0 => _ferrite_ctx_call0,
        1 => _ferrite_ctx_call1,
        2 => _ferrite_ctx_call2,
        3 => _ferrite_ctx_call3,
        4 => _ferrite_ctx_call4,
        5 => _ferrite_ctx_call5,
        6 => _ferrite_ctx_call6,
        _ => unreachable!("at most six entry arguments are supported"),
    };
    f as usize as u64
}

/// Switch from `store` to `load`; see [`crate::ctx::switch`].
///
/// # Safety
///
/// Both contexts must be valid, `load` must have been initialized by one of
/// the context constructors or a previous switch, and IRQs must be disabled.
pub unsafe fn ctx_switch(store: &mut Context, load: &Context) {
    // SAFETY: Guaranteed by the caller.
    unsafe { _ferrite_ctx_switch(store, load) };
}

/// One-way switch to `load`, discarding the current context.
///
/// # Safety
///
/// As for [`ctx_switch`]; the current stack must not be referenced again.
pub unsafe fn ctx_jump(load: &Context) -> ! {
    // SAFETY: Guaranteed by the caller.
    unsafe { _ferrite_ctx_jump(load) }
}

/// Restore a general-purpose register snapshot and resume at its embedded
/// exception link address. Last stage of
/// [`crate::ctx::execenv::execenv_load`].
///
/// # Safety
///
/// `regs` must hold a complete, consistent snapshot including valid
/// elr/spsr values.
pub unsafe fn regs_load(regs: *const Regs) -> ! {
    // SAFETY: Guaranteed by the caller.
    unsafe { _ferrite_execenv_regs_load(regs) }
}
