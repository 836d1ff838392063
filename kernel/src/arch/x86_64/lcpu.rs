//! x86_64 LCPU support: APIC identification and inter-processor interrupts
//!
//! Secondary CPUs are started with the classic INIT / STARTUP sequence
//! through the local APIC's interrupt command register. The 16-bit startup
//! trampoline that the STARTUP IPI points at is installed below 1 MiB by
//! the boot shim; this module only issues the kicks.

// The APIC plumbing is only exercised on bare metal
#![allow(dead_code)]

use crate::error::KernelResult;

/// x86 needs the deferred STARTUP phase after the INIT kick
pub const MULTI_PHASE_STARTUP: bool = true;

/// Default IPI vector carrying cross-CPU function requests
pub const RUN_IRQ: u32 = 0xF2;

/// Default IPI vector for bare wakeups
pub const WAKEUP_IRQ: u32 = 0xF3;

/// Physical page (<1 MiB, page-number encoded in the STARTUP IPI) where the
/// boot shim installs the real-mode AP trampoline.
pub const AP_TRAMPOLINE: u64 = 0x8000;

/// Local APIC MMIO base (xAPIC), identity-covered by the direct map
const LAPIC_BASE: u64 = 0xFEE0_0000;
const LAPIC_ICR_LO: u64 = 0x300;
const LAPIC_ICR_HI: u64 = 0x310;

const ICR_DELIVERY_FIXED: u32 = 0x0 << 8;
const ICR_DELIVERY_INIT: u32 = 0x5 << 8;
const ICR_DELIVERY_STARTUP: u32 = 0x6 << 8;
const ICR_LEVEL_ASSERT: u32 = 1 << 14;
const ICR_PENDING: u32 = 1 << 12;

#[cfg(target_os = "none")]
fn lapic_write(reg: u64, val: u32) {
    // SAFETY: The local APIC register block is memory mapped at LAPIC_BASE
    // on every CPU; volatile is required for MMIO.
    unsafe { core::ptr::write_volatile((LAPIC_BASE + reg) as *mut u32, val) };
}

#[cfg(target_os = "none")]
fn lapic_read(reg: u64) -> u32 {
    // SAFETY: See `lapic_write`.
    unsafe { core::ptr::read_volatile((LAPIC_BASE + reg) as *const u32) }
}

#[cfg(target_os = "none")]
fn ipi_send(apic_id: u64, icr_lo: u32) {
    while lapic_read(LAPIC_ICR_LO) & ICR_PENDING != 0 {
        core::hint::spin_loop();
    }
    lapic_write(LAPIC_ICR_HI, (apic_id as u32) << 24);
    lapic_write(LAPIC_ICR_LO, icr_lo);
}

#[cfg(target_os = "none")]
fn spin_ns(ns: u64) {
    let deadline = crate::timer::monotonic_ns() + ns;
    while crate::timer::monotonic_ns() < deadline {
        core::hint::spin_loop();
    }
}

/// Hardware id of the executing CPU (initial APIC id)
pub fn hw_id() -> u64 {
    super::cpu_id()
}

/// Per-CPU architectural init (traps, APIC). The executing CPU's trap
/// vectors are installed by the boot shim before the core runs, so there is
/// nothing left to do here beyond sanity.
pub fn init_current() -> KernelResult<()> {
    Ok(())
}

/// Phase one of AP startup: the INIT kick
pub fn start(apic_id: u64) -> KernelResult<()> {
    #[cfg(target_os = "none")]
    {
        ipi_send(apic_id, ICR_DELIVERY_INIT | ICR_LEVEL_ASSERT);
        // De-assert per the multiprocessor startup protocol.
        ipi_send(apic_id, ICR_DELIVERY_INIT);
    }
    #[cfg(not(target_os = "none"))]
    let _ = apic_id;
    Ok(())
}

/// Phase two: after the post-INIT settle time, send the STARTUP IPIs to
/// every CPU the caller kicked in phase one.
pub fn post_start(indices: Option<&[u32]>, started: &mut usize) -> KernelResult<()> {
    #[cfg(target_os = "none")]
    {
        let vector = (AP_TRAMPOLINE >> 12) as u32 & 0xFF;
        spin_ns(10_000_000); // 10 ms after INIT

        let n = *started;
        for k in 0..n {
            let idx = match indices {
                Some(list) => list[k],
                None => k as u32 + 1,
            };
            let Some(lcpu) = crate::smp::lcpu_get(idx) else {
                continue;
            };
            ipi_send(lcpu.id(), ICR_DELIVERY_STARTUP | vector);
            spin_ns(200_000); // 200 us
            ipi_send(lcpu.id(), ICR_DELIVERY_STARTUP | vector);
        }
    }
    #[cfg(not(target_os = "none"))]
    {
        let _ = (indices, started);
    }
    Ok(())
}

/// Raise the RUN IPI on the target CPU
pub fn send_run_ipi(apic_id: u64) {
    #[cfg(target_os = "none")]
    ipi_send(apic_id, ICR_DELIVERY_FIXED | RUN_IRQ);
    #[cfg(not(target_os = "none"))]
    let _ = apic_id;
}

/// Raise the WAKEUP IPI on the target CPU
pub fn send_wakeup_ipi(apic_id: u64) {
    #[cfg(target_os = "none")]
    ipi_send(apic_id, ICR_DELIVERY_FIXED | WAKEUP_IRQ);
    #[cfg(not(target_os = "none"))]
    let _ = apic_id;
}

/// Continue execution at `entry` on the stack `sp`; used when an AP was
/// started with a user-supplied entry point.
///
/// # Safety
///
/// `entry` must be the address of a non-returning function and `sp` a valid
/// stack top for it.
pub unsafe fn jump_to(sp: u64, entry: u64) -> ! {
    let ctx = crate::ctx::Context { ip: entry, sp };
    // SAFETY: Forwarded caller contract.
    unsafe { super::context::ctx_jump(&ctx) }
}
