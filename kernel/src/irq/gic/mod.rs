//! ARM Generic Interrupt Controller core
//!
//! One distributor shared by all CPUs plus a per-CPU interface: the
//! memory-mapped GICC bank on GICv2, a redistributor frame and the ICC
//! system registers on GICv3. The two register layouts hide behind the
//! [`GicDevice`] sum type; per-call dispatch is a match.
//!
//! Discovery (device tree or ACPI) is the boot shim's business; it hands
//! the mapped base addresses over in a [`GicDiscovery`] and the first
//! `probe` caches the device for the whole system. The distributor is
//! shared mutable state and all writes to it go through the device's
//! distributor lock on SMP; CPU-interface and system-register accesses are
//! per-CPU and lockless.

pub mod v2;
pub mod v3;

use crate::arch::context::Regs;
use crate::error::{KernelError, KernelResult};
use crate::sync::OnceCell;

pub use v2::GicV2;
pub use v3::GicV3;

/// First software-generated interrupt id
pub const SGI_BASE: u32 = 0;
/// Highest SGI id
pub const SGI_MAX: u32 = 15;
/// First private peripheral interrupt id
pub const PPI_BASE: u32 = 16;
/// First shared peripheral interrupt id
pub const SPI_BASE: u32 = 32;
/// Highest interrupt id the architecture can report
pub const MAX_IRQ: u32 = 1019;
/// Spurious interrupt id returned by an acknowledge with nothing pending
pub const SPURIOUS: u32 = 1023;
/// Interrupt-id field of an acknowledge register value
pub const INTID_MASK: u32 = 0x3FF;

/// Default priority programmed for all interrupts at init
pub const DEFAULT_PRIORITY: u8 = 0xA0;

/// GIC architecture version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GicVersion {
    V2,
    V3,
}

/// Trigger mode of an interrupt line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Edge,
    Level,
}

/// Target selector for a software-generated interrupt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SgiTarget {
    /// A single CPU: interface number on GICv2, affinity value on GICv3
    Cpu(u64),
    /// GICv2 only: an 8-bit CPU-interface bitmap
    List(u8),
    /// Every CPU except the requester
    Others,
    /// Only the requester
    This,
}

/// Base addresses and sizes produced by firmware discovery, already mapped
/// by the paging core.
#[derive(Debug, Clone, Copy)]
pub struct GicDiscovery {
    pub version: GicVersion,
    /// Distributor base and size
    pub dist: (u64, u64),
    /// CPU-interface (GICv2) or redistributor (GICv3) base and size
    pub cpuif: (u64, u64),
}

/// The probed interrupt-controller device
pub enum GicDevice {
    V2(GicV2),
    V3(GicV3),
}

impl GicDevice {
    /// First call (BSP): initialize the distributor and the local CPU
    /// interface. Later calls (APs): local CPU interface only.
    pub fn initialize(&self) -> KernelResult<()> {
        match self {
            GicDevice::V2(g) => g.initialize(),
            GicDevice::V3(g) => g.initialize(),
        }
    }

    /// Acknowledge the highest-priority pending interrupt; the raw
    /// register value (spurious sentinel included) is returned for the
    /// paired [`GicDevice::eoi_irq`].
    pub fn ack_irq(&self) -> u32 {
        match self {
            GicDevice::V2(g) => g.ack_irq(),
            GicDevice::V3(g) => g.ack_irq(),
        }
    }

    /// Signal end of interrupt. On GICv3 this drops the running priority
    /// and deactivates the interrupt.
    pub fn eoi_irq(&self, ack: u32) {
        match self {
            GicDevice::V2(g) => g.eoi_irq(ack),
            GicDevice::V3(g) => g.eoi_irq(ack),
        }
    }

    pub fn enable_irq(&self, irq: u32) -> KernelResult<()> {
        match self {
            GicDevice::V2(g) => g.enable_irq(irq),
            GicDevice::V3(g) => g.enable_irq(irq),
        }
    }

    pub fn disable_irq(&self, irq: u32) -> KernelResult<()> {
        match self {
            GicDevice::V2(g) => g.disable_irq(irq),
            GicDevice::V3(g) => g.disable_irq(irq),
        }
    }

    /// Configure the trigger mode of a PPI or SPI. SGIs are always edge
    /// triggered and rejected here.
    pub fn set_irq_trigger(&self, irq: u32, trigger: Trigger) -> KernelResult<()> {
        match self {
            GicDevice::V2(g) => g.set_irq_trigger(irq, trigger),
            GicDevice::V3(g) => g.set_irq_trigger(irq, trigger),
        }
    }

    /// Set the priority of an interrupt; lower values are more urgent and
    /// the hardware may ignore low-order bits.
    pub fn set_irq_priority(&self, irq: u32, prio: u8) -> KernelResult<()> {
        match self {
            GicDevice::V2(g) => g.set_irq_priority(irq, prio),
            GicDevice::V3(g) => g.set_irq_priority(irq, prio),
        }
    }

    /// Route an SPI: an 8-bit target list on GICv2, a packed
    /// `Aff3|Aff2|Aff1|Aff0` value on GICv3.
    pub fn set_irq_affinity(&self, irq: u32, affinity: u32) -> KernelResult<()> {
        match self {
            GicDevice::V2(g) => g.set_irq_affinity(irq, affinity),
            GicDevice::V3(g) => g.set_irq_affinity(irq, affinity),
        }
    }

    /// Generate a software interrupt towards `target`
    pub fn sgi_gen(&self, sgi: u32, target: SgiTarget) -> KernelResult<()> {
        match self {
            GicDevice::V2(g) => g.sgi_gen(sgi, target),
            GicDevice::V3(g) => g.sgi_gen(sgi, target),
        }
    }

    /// Acknowledge-dispatch-EOI loop: drain all pending interrupts in one
    /// entry, handing each acknowledged id to the registered handler before
    /// its end-of-interrupt.
    pub fn handle_irq(&self, mut regs: Option<&mut Regs>) {
        loop {
            let stat = self.ack_irq();
            let irq = stat & INTID_MASK;

            if irq <= MAX_IRQ {
                crate::irq::dispatch(regs.as_mut().map(|r| &mut **r), irq);
                self.eoi_irq(stat);
                continue;
            }

            // End-of-interrupt must not be signaled for spurious ids.
            if irq != SPURIOUS {
                self.eoi_irq(stat);
            }
            break;
        }
    }
}

static DEVICE: OnceCell<GicDevice> = OnceCell::new();

/// Probe the interrupt controller from the discovery data. Idempotent:
/// only the first call performs the probe, later calls (secondary CPUs)
/// return the cached device.
pub fn probe(disc: &GicDiscovery) -> KernelResult<&'static GicDevice> {
    if let Some(dev) = DEVICE.get() {
        return Ok(dev);
    }

    let dev = match disc.version {
        GicVersion::V2 => GicDevice::V2(GicV2::probe(disc.dist, disc.cpuif)?),
        GicVersion::V3 => GicDevice::V3(GicV3::probe(disc.dist, disc.cpuif)?),
    };

    // A lost probe race just means another CPU's device is cached already.
    let _ = DEVICE.set(dev);
    DEVICE.get().ok_or(KernelError::NotFound {
        resource: "interrupt controller",
    })
}

/// The probed device
pub fn device() -> KernelResult<&'static GicDevice> {
    DEVICE.get().ok_or(KernelError::NotInitialized {
        subsystem: "interrupt controller",
    })
}

/// Initialize the controller for the executing CPU (see
/// [`GicDevice::initialize`]).
pub fn initialize() -> KernelResult<()> {
    device()?.initialize()
}

/// Top-level IRQ entry called from the trap vector
pub fn handle_irq(regs: Option<&mut Regs>) {
    if let Ok(dev) = device() {
        dev.handle_irq(regs);
    }
}

// ---------------------------------------------------------------------------
// MMIO access
// ---------------------------------------------------------------------------

pub(crate) fn mmio_read32(addr: u64) -> u32 {
    // SAFETY: Callers pass addresses inside a probed, mapped register bank;
    // volatile is required for device memory.
    unsafe { core::ptr::read_volatile(addr as usize as *const u32) }
}

pub(crate) fn mmio_write32(addr: u64, val: u32) {
    // SAFETY: See `mmio_read32`.
    unsafe { core::ptr::write_volatile(addr as usize as *mut u32, val) };
}

pub(crate) fn mmio_write64(addr: u64, val: u64) {
    // SAFETY: See `mmio_read32`.
    unsafe { core::ptr::write_volatile(addr as usize as *mut u64, val) };
}

pub(crate) fn mmio_write8(addr: u64, val: u8) {
    // SAFETY: See `mmio_read32`.
    unsafe { core::ptr::write_volatile(addr as usize as *mut u8, val) };
}
