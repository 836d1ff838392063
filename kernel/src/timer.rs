//! Monotonic time
//!
//! Thin wrapper over the architectural counter (TSC on x86_64, the generic
//! timer on aarch64). Nanoseconds since an arbitrary boot-time epoch;
//! strictly monotonic on one CPU, which is all [`crate::smp`]'s wait and
//! halt-until primitives need.

use crate::arch;

/// Nanoseconds since boot (monotonic, per-CPU)
pub fn monotonic_ns() -> u64 {
    arch::time::monotonic_ns()
}

/// Block until the monotonic clock reaches `deadline` (nanoseconds).
///
/// Must be called with IRQs disabled; the wait halts the CPU between timer
/// interrupts on bare metal, so a timer must be ticking for this to make
/// progress there.
pub fn block_until(deadline: u64) {
    while monotonic_ns() < deadline {
        arch::time::halt_until_interrupt();
    }
}
