//! x86_64 execution-context support
//!
//! The call trampolines pop entry-function arguments from a prepared stack
//! image into the System-V argument registers and tail-jump to the entry.
//! `_ferrite_ctx_switch` saves the callee-saved set on the source stack and
//! resumes the destination context at its stored instruction pointer.

use core::arch::global_asm;

use crate::ctx::Context;

/// Stack-pointer alignment required when a context starts at a function
/// entry point
pub const SP_ALIGN: u64 = 16;

/// General-purpose register snapshot, in the order the exception entry code
/// saves them and `_ferrite_execenv_load` restores them.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct Regs {
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

/// System context: the segment-base registers backing TLS
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct SysCtx {
    pub fs_base: u64,
    pub gs_base: u64,
}

impl SysCtx {
    /// The TLS pointer as the rest of the kernel sees it
    pub fn tlsp(&self) -> u64 {
        self.fs_base
    }

    pub fn set_tlsp(&mut self, tlsp: u64) {
        self.fs_base = tlsp;
    }
}

/// Capture the executing CPU's system context
pub fn sysctx_store(sysctx: &mut SysCtx) {
    #[cfg(target_os = "none")]
    {
        use x86_64::registers::model_specific::{FsBase, GsBase};
        sysctx.fs_base = FsBase::read().as_u64();
        sysctx.gs_base = GsBase::read().as_u64();
    }
    #[cfg(not(target_os = "none"))]
    {
        *sysctx = SysCtx::default();
    }
}

/// Install a previously captured system context on the executing CPU
pub fn sysctx_load(sysctx: &SysCtx) {
    #[cfg(target_os = "none")]
    {
        use x86_64::registers::model_specific::{FsBase, GsBase};
        FsBase::write(x86_64::VirtAddr::new_truncate(sysctx.fs_base));
        GsBase::write(x86_64::VirtAddr::new_truncate(sysctx.gs_base));
    }
    #[cfg(not(target_os = "none"))]
    let _ = sysctx;
}

global_asm!(
    r#"
    .text

    // Zero the standard register set (all GPRs except RSP), then return to
    // whatever the stack image holds next.
    .global _ferrite_ctx_clearregs
_ferrite_ctx_clearregs:
    xor eax, eax
    xor ebx, ebx
    xor ecx, ecx
    xor edx, edx
    xor esi, esi
    xor edi, edi
    xor ebp, ebp
    xor r8d, r8d
    xor r9d, r9d
    xor r10d, r10d
    xor r11d, r11d
    xor r12d, r12d
    xor r13d, r13d
    xor r14d, r14d
    xor r15d, r15d
    ret

    // _ferrite_ctx_callN: pop N arguments (pushed first-argument-highest)
    // into the argument registers and tail-jump to the entry function that
    // sits above them on the stack.
    .global _ferrite_ctx_call0
_ferrite_ctx_call0:
    ret

    .global _ferrite_ctx_call1
_ferrite_ctx_call1:
    pop rdi
    ret

    .global _ferrite_ctx_call2
_ferrite_ctx_call2:
    pop rsi
    pop rdi
    ret

    .global _ferrite_ctx_call3
_ferrite_ctx_call3:
    pop rdx
    pop rsi
    pop rdi
    ret

    .global _ferrite_ctx_call4
_ferrite_ctx_call4:
    pop rcx
    pop rdx
    pop rsi
    pop rdi
    ret

    .global _ferrite_ctx_call5
_ferrite_ctx_call5:
    pop r8
    pop rcx
    pop rdx
    pop rsi
    pop rdi
    ret

    .global _ferrite_ctx_call6
_ferrite_ctx_call6:
    pop r9
    pop r8
    pop rcx
    pop rdx
    pop rsi
    pop rdi
    ret

    // _ferrite_ctx_switch(store: *mut Context [rdi], load: *const Context [rsi])
    //
    // Saves the callee-saved set on the current stack, records the resume
    // point in *store, and continues *load. Caller-saved registers are
    // clobbered by the call itself per the C ABI.
    .global _ferrite_ctx_switch
_ferrite_ctx_switch:
    push rbp
    push rbx
    push r12
    push r13
    push r14
    push r15
    lea rax, [rip + 2f]
    mov qword ptr [rdi + 0], rax    // store->ip
    mov qword ptr [rdi + 8], rsp    // store->sp
    mov rsp, qword ptr [rsi + 8]
    jmp qword ptr [rsi + 0]
2:
    pop r15
    pop r14
    pop r13
    pop r12
    pop rbx
    pop rbp
    ret

    // _ferrite_ctx_jump(load: *const Context [rdi]) -- one-way switch
    .global _ferrite_ctx_jump
_ferrite_ctx_jump:
    mov rsp, qword ptr [rdi + 8]
    jmp qword ptr [rdi + 0]

    // _ferrite_execenv_regs_load(regs: *const Regs [rdi])
    //
    // Final stage of restoring an execution environment: walk the Regs
    // block as a stack, pop the general-purpose registers, and IRET through
    // the embedded rip/cs/rflags/rsp/ss frame.
    .global _ferrite_execenv_regs_load
_ferrite_execenv_regs_load:
    mov rsp, rdi
    pop rax
    pop rcx
    pop rdx
    pop rbx
    pop rbp
    pop rsi
    pop rdi
    pop r8
    pop r9
    pop r10
    pop r11
    pop r12
    pop r13
    pop r14
    pop r15
    iretq
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

/// Restore a general-purpose register snapshot and resume at its embedded
/// instruction pointer. Last stage of [`crate::ctx::execenv::execenv_load`].
///
/// # Safety
///
/// `regs` must hold a complete, consistent snapshot including a valid
/// rip/cs/rflags/rsp/ss frame.
pub unsafe fn regs_load(regs: *const Regs) -> ! {
    // SAFETY: Guaranteed by the caller.
    unsafe { _ferrite_execenv_regs_load(regs) }
}

/// Address of the register-clearing trampoline
pub fn clearregs_addr() -> u64 {
    _ferrite_ctx_clearregs as usize as u64
}

/// Address of the argument-popping trampoline for `nargs` arguments
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
