//! AArch64 architecture support

pub mod context;
pub mod ectx;
pub mod lcpu;
pub mod paging;
pub mod time;

/// Disable interrupts on the executing CPU
#[inline]
pub fn irq_disable() {
    #[cfg(target_os = "none")]
    // SAFETY: Masking IRQs via DAIFSet has no effect beyond the PSTATE.I
    // bit of the executing CPU.
    unsafe {
        core::arch::asm!("msr daifset, #2", options(nomem, nostack, preserves_flags));
    }
}

/// Enable interrupts on the executing CPU
#[inline]
pub fn irq_enable() {
    #[cfg(target_os = "none")]
    // SAFETY: See `irq_disable`.
    unsafe {
        core::arch::asm!("msr daifclr, #2", options(nomem, nostack, preserves_flags));
    }
}

/// Whether interrupts are disabled on the executing CPU
#[inline]
pub fn irqs_disabled() -> bool {
    #[cfg(target_os = "none")]
    {
        let daif: u64;
        // SAFETY: Reading DAIF has no side effects.
        unsafe {
            core::arch::asm!("mrs {}, daif", out(reg) daif, options(nomem, nostack));
        }
        daif & (1 << 7) != 0
    }
    #[cfg(not(target_os = "none"))]
    {
        true
    }
}

/// Save the interrupt mask and disable interrupts
#[inline]
pub fn irq_save() -> u64 {
    #[cfg(target_os = "none")]
    {
        let daif: u64;
        // SAFETY: Read-then-mask of the executing CPU's interrupt state.
        unsafe {
            core::arch::asm!("mrs {}, daif", out(reg) daif, options(nomem, nostack));
            core::arch::asm!("msr daifset, #2", options(nomem, nostack, preserves_flags));
        }
        daif
    }
    #[cfg(not(target_os = "none"))]
    {
        0
    }
}

/// Restore a previously saved interrupt mask
#[inline]
pub fn irq_restore(daif: u64) {
    #[cfg(target_os = "none")]
    // SAFETY: `daif` was produced by `irq_save` on this CPU.
    unsafe {
        core::arch::asm!("msr daif, {}", in(reg) daif, options(nomem, nostack));
    }
    #[cfg(not(target_os = "none"))]
    let _ = daif;
}

/// Halt until the next interrupt
#[inline]
pub fn halt() {
    #[cfg(target_os = "none")]
    cortex_a::asm::wfi();
    #[cfg(not(target_os = "none"))]
    core::hint::spin_loop();
}

/// Hardware identifier of the executing CPU (MPIDR affinity)
pub fn cpu_id() -> u64 {
    lcpu::hw_id()
}
