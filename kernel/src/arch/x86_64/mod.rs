//! x86_64 architecture support

pub mod context;
pub mod ectx;
pub mod lcpu;
pub mod paging;
pub mod time;

/// Disable interrupts on the executing CPU
#[inline]
pub fn irq_disable() {
    #[cfg(target_os = "none")]
    x86_64::instructions::interrupts::disable();
}

/// Enable interrupts on the executing CPU
#[inline]
pub fn irq_enable() {
    #[cfg(target_os = "none")]
    x86_64::instructions::interrupts::enable();
}

/// Whether interrupts are disabled on the executing CPU
#[inline]
pub fn irqs_disabled() -> bool {
    #[cfg(target_os = "none")]
    {
        !x86_64::instructions::interrupts::are_enabled()
    }
    #[cfg(not(target_os = "none"))]
    {
        true
    }
}

/// Save the interrupt flag and disable interrupts
#[inline]
pub fn irq_save() -> u64 {
    #[cfg(target_os = "none")]
    {
        let flags = x86_64::registers::rflags::read_raw();
        x86_64::instructions::interrupts::disable();
        flags
    }
    #[cfg(not(target_os = "none"))]
    {
        0
    }
}

/// Restore a previously saved interrupt flag
#[inline]
pub fn irq_restore(flags: u64) {
    #[cfg(target_os = "none")]
    {
        // SAFETY: `flags` was produced by `irq_save` on this CPU; writing it
        // back only toggles IF and the always-reserved bits RFLAGS ignores.
        unsafe { x86_64::registers::rflags::write_raw(flags) };
    }
    #[cfg(not(target_os = "none"))]
    let _ = flags;
}

/// Halt until the next interrupt
#[inline]
pub fn halt() {
    #[cfg(target_os = "none")]
    // SAFETY: `hlt` merely idles the CPU until the next interrupt or NMI.
    unsafe {
        core::arch::asm!("hlt", options(nomem, nostack, preserves_flags));
    }
    #[cfg(not(target_os = "none"))]
    core::hint::spin_loop();
}

/// Hardware identifier of the executing CPU (initial APIC id)
pub fn cpu_id() -> u64 {
    #[cfg(target_os = "none")]
    {
        // SAFETY: CPUID leaf 1 is available on every x86_64 CPU; the
        // instruction has no side effects beyond clobbering the output regs.
        let ebx = unsafe { core::arch::x86_64::__cpuid(1).ebx };
        u64::from(ebx >> 24)
    }
    #[cfg(not(target_os = "none"))]
    {
        0
    }
}
