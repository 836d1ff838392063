//! Ferrite core runtime
//!
//! The lowest layers of a single-address-space library OS: logical-CPU
//! lifecycle, the physical memory model, the paging core, execution-context
//! management, and the interrupt-controller core. Everything above (device
//! drivers, filesystems, allocators, the application itself) links against
//! this crate.

#![no_std]

// Host target (unit tests): use std so test code can allocate and spawn
// threads. The kernel itself never touches this.
#[cfg(not(target_os = "none"))]
extern crate std;

pub mod arch;
pub mod bootinfo;
pub mod bootstrap;
pub mod ctx;
pub mod error;
pub mod irq;
pub mod logger;
pub mod mm;
pub mod serial;
pub mod smp;
pub mod sync;
pub mod timer;

pub use error::{KernelError, KernelResult};
// Re-export memory management types for external collaborators (boot shim,
// drivers) and tests.
pub use mm::{PhysicalAddress, VirtualAddress, PAGE_SIZE};

/// Kernel panic handler for bare-metal builds. Halts the executing CPU with
/// a generic error code; other CPUs keep running until the boot shim decides
/// otherwise.
#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    log::error!("kernel panic: {}", info);
    smp::halt_with(error::FATAL_PANIC)
}
