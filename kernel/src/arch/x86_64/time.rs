//! x86_64 monotonic clock: TSC based
//!
//! The TSC frequency is assumed invariant (constant-rate TSC is required on
//! every platform the kernel targets). Until the boot shim calibrates the
//! frequency, a 1 GHz default keeps timestamps usable for ordering.

use core::sync::atomic::{AtomicU64, Ordering};

static TSC_KHZ: AtomicU64 = AtomicU64::new(1_000_000);

/// Record the calibrated TSC frequency in kHz
pub fn calibrate_tsc_khz(khz: u64) {
    if khz > 0 {
        TSC_KHZ.store(khz, Ordering::Relaxed);
    }
}

#[inline]
fn rdtsc() -> u64 {
    // SAFETY: RDTSC is available in all privilege levels on the supported
    // platforms and has no side effects.
    unsafe { core::arch::x86_64::_rdtsc() }
}

/// Nanoseconds since an arbitrary boot-time epoch
pub fn monotonic_ns() -> u64 {
    let khz = TSC_KHZ.load(Ordering::Relaxed);
    let cycles = rdtsc() as u128;
    ((cycles * 1_000_000) / khz as u128) as u64
}

/// Idle until the next interrupt (no-op spin on the host)
#[inline]
pub fn halt_until_interrupt() {
    #[cfg(target_os = "none")]
    // SAFETY: STI;HLT atomically enables interrupts for the halt, and CLI
    // restores the caller's IRQs-disabled invariant before returning.
    unsafe {
        core::arch::asm!("sti", "hlt", "cli", options(nomem, nostack));
    }
    #[cfg(not(target_os = "none"))]
    core::hint::spin_loop();
}
