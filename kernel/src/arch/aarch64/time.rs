//! AArch64 monotonic clock: the generic timer's virtual counter

/// Nanoseconds since an arbitrary boot-time epoch
pub fn monotonic_ns() -> u64 {
    #[cfg(target_os = "none")]
    {
        let cnt: u64;
        let frq: u64;
        // SAFETY: Reading the virtual counter and its frequency has no side
        // effects; ISB orders the counter read against surrounding code.
        unsafe {
            core::arch::asm!(
                "isb",
                "mrs {cnt}, cntvct_el0",
                "mrs {frq}, cntfrq_el0",
                cnt = out(reg) cnt,
                frq = out(reg) frq,
                options(nomem, nostack)
            );
        }
        let frq = frq.max(1);
        ((cnt as u128 * 1_000_000_000) / frq as u128) as u64
    }
    #[cfg(not(target_os = "none"))]
    {
        0
    }
}

/// Idle until the next interrupt (no-op spin on the host)
#[inline]
pub fn halt_until_interrupt() {
    #[cfg(target_os = "none")]
    {
        // SAFETY: Unmask IRQs for the wait, then restore the caller's
        // IRQs-disabled invariant.
        unsafe {
            core::arch::asm!("msr daifclr, #2", options(nomem, nostack));
        }
        cortex_a::asm::wfi();
        // SAFETY: See above.
        unsafe {
            core::arch::asm!("msr daifset, #2", options(nomem, nostack));
        }
    }
    #[cfg(not(target_os = "none"))]
    core::hint::spin_loop();
}
