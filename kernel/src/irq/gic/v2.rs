//! GICv2: distributor + memory-mapped CPU interface

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use spin::Mutex;

use super::{
    mmio_read32, mmio_write32, mmio_write8, SgiTarget, Trigger, DEFAULT_PRIORITY, MAX_IRQ,
    PPI_BASE, SPI_BASE,
};
use crate::error::{KernelError, KernelResult};

// Distributor register offsets
const GICD_CTLR: u64 = 0x000;
const GICD_TYPER: u64 = 0x004;
const GICD_ISENABLER: u64 = 0x100;
const GICD_ICENABLER: u64 = 0x180;
const GICD_ICACTIVER: u64 = 0x380;
const GICD_IPRIORITYR: u64 = 0x400;
const GICD_ITARGETSR: u64 = 0x800;
const GICD_ICFGR: u64 = 0xC00;
const GICD_SGIR: u64 = 0xF00;
const GICD_PIDR2: u64 = 0xFE8;

// CPU interface register offsets
const GICC_CTLR: u64 = 0x000;
const GICC_PMR: u64 = 0x004;
const GICC_IAR: u64 = 0x00C;
const GICC_EOIR: u64 = 0x010;

const GICD_CTLR_ENABLE: u32 = 1;
const GICC_CTLR_ENABLE: u32 = 1;
/// Lowest priority: every interrupt passes the mask
const GICC_PMR_PRIO_MIN: u32 = 0xFF;

/// Interrupts covered per configuration register word
const I_PER_ICFGR: u32 = 16;
const ICFGR_TRIG_MASK: u32 = 0x2;
const ICFGR_TRIG_EDGE: u32 = 0x2;
const ICFGR_TRIG_LVL: u32 = 0x0;

// GICD_SGIR fields
const SGIR_FILTER_TO_LIST: u32 = 0;
const SGIR_FILTER_TO_OTHERS: u32 = 1;
const SGIR_FILTER_TO_SELF: u32 = 2;
const SGIR_FILTER_SHIFT: u32 = 24;
const SGIR_TARGET_SHIFT: u32 = 16;

/// "All CPU interfaces" target word for GICD_ITARGETSR
const ITARGETSR_DEF: u32 = 0xFFFF_FFFF;
const PRIORITY_DEF: u32 = u32::from_le_bytes([DEFAULT_PRIORITY; 4]);

/// Minimum register bank sizes accepted at probe time
const DIST_MIN_SIZE: u64 = 0x1000;
const CPUIF_MIN_SIZE: u64 = 0x20;

/// Architecture revision field of GICD_PIDR2
const PIDR2_ARCHREV_SHIFT: u32 = 4;
const PIDR2_ARCHREV_MASK: u32 = 0xF;

/// GICv2 device state. Per-IRQ state lives in the hardware registers; the
/// only shadow state is the line count read from GICD_TYPER and the
/// distributor lock.
pub struct GicV2 {
    dist_base: u64,
    cpuif_base: u64,
    num_irqs: AtomicU32,
    initialized: AtomicBool,
    dist_lock: Mutex<()>,
}

impl GicV2 {
    /// Validate the discovered register banks and construct the device
    pub fn probe(dist: (u64, u64), cpuif: (u64, u64)) -> KernelResult<Self> {
        if dist.0 == 0 || cpuif.0 == 0 {
            return Err(KernelError::NotFound {
                resource: "GICv2 register banks",
            });
        }
        if dist.1 < DIST_MIN_SIZE || cpuif.1 < CPUIF_MIN_SIZE {
            return Err(KernelError::InvalidArgument {
                what: "GICv2 register bank size",
            });
        }

        let gic = Self {
            dist_base: dist.0,
            cpuif_base: cpuif.0,
            num_irqs: AtomicU32::new(0),
            initialized: AtomicBool::new(false),
            dist_lock: Mutex::new(()),
        };

        let archrev =
            (gic.read_dist(GICD_PIDR2) >> PIDR2_ARCHREV_SHIFT) & PIDR2_ARCHREV_MASK;
        if archrev != 2 {
            return Err(KernelError::NotSupported {
                feature: "GIC architecture revision other than 2",
            });
        }

        Ok(gic)
    }

    fn read_dist(&self, offset: u64) -> u32 {
        mmio_read32(self.dist_base + offset)
    }

    fn write_dist(&self, offset: u64, val: u32) {
        mmio_write32(self.dist_base + offset, val);
    }

    fn write_dist8(&self, offset: u64, val: u8) {
        mmio_write8(self.dist_base + offset, val);
    }

    fn read_cpuif(&self, offset: u64) -> u32 {
        mmio_read32(self.cpuif_base + offset)
    }

    fn write_cpuif(&self, offset: u64, val: u32) {
        mmio_write32(self.cpuif_base + offset, val);
    }

    /// Number of interrupt lines reported by the distributor (0 before the
    /// distributor was initialized)
    pub fn lines(&self) -> u32 {
        self.num_irqs.load(Ordering::Relaxed)
    }

    fn check_irq(&self, irq: u32, min: u32) -> KernelResult<()> {
        if irq < min || irq > MAX_IRQ {
            return Err(KernelError::InvalidArgument {
                what: "irq outside the controller's range",
            });
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // CPU interface
    // -----------------------------------------------------------------------

    /// Read the acknowledge register: id in bits [9:0], requesting CPU (for
    /// SGIs) in bits [12:10].
    pub fn ack_irq(&self) -> u32 {
        self.read_cpuif(GICC_IAR)
    }

    /// Signal completion. `ack` must be the unmodified value of the paired
    /// acknowledge read.
    pub fn eoi_irq(&self, ack: u32) {
        self.write_cpuif(GICC_EOIR, ack);
    }

    // -----------------------------------------------------------------------
    // Distributor
    // -----------------------------------------------------------------------

    pub fn enable_irq(&self, irq: u32) -> KernelResult<()> {
        self.check_irq(irq, 0)?;
        let _lock = self.dist_lock.lock();
        self.write_dist(GICD_ISENABLER + 4 * u64::from(irq / 32), 1 << (irq % 32));
        Ok(())
    }

    pub fn disable_irq(&self, irq: u32) -> KernelResult<()> {
        self.check_irq(irq, 0)?;
        let _lock = self.dist_lock.lock();
        self.write_dist(GICD_ICENABLER + 4 * u64::from(irq / 32), 1 << (irq % 32));
        Ok(())
    }

    pub fn set_irq_priority(&self, irq: u32, prio: u8) -> KernelResult<()> {
        self.check_irq(irq, 0)?;
        let _lock = self.dist_lock.lock();
        self.write_dist8(GICD_IPRIORITYR + u64::from(irq), prio);
        Ok(())
    }

    /// Route an SPI to the CPU interfaces set in the 8-bit target list
    pub fn set_irq_affinity(&self, irq: u32, targetlist: u32) -> KernelResult<()> {
        self.check_irq(irq, SPI_BASE)?;
        if targetlist > 0xFF {
            return Err(KernelError::InvalidArgument {
                what: "GICv2 target list is an 8-bit CPU mask",
            });
        }
        let _lock = self.dist_lock.lock();
        self.write_dist8(GICD_ITARGETSR + u64::from(irq), targetlist as u8);
        Ok(())
    }

    /// Configure edge or level triggering. SGIs have fixed behavior and
    /// must not be targeted.
    pub fn set_irq_trigger(&self, irq: u32, trigger: Trigger) -> KernelResult<()> {
        self.check_irq(irq, PPI_BASE)?;

        let _lock = self.dist_lock.lock();

        let reg = GICD_ICFGR + 4 * u64::from(irq / I_PER_ICFGR);
        let shift = (irq % I_PER_ICFGR) * 2;
        let mut val = self.read_dist(reg);
        let old = (val >> shift) & ICFGR_TRIG_MASK;
        let new = match trigger {
            Trigger::Edge => ICFGR_TRIG_EDGE,
            Trigger::Level => ICFGR_TRIG_LVL,
        };
        if old != new {
            val &= !(ICFGR_TRIG_MASK << shift);
            val |= new << shift;
            self.write_dist(reg, val);
        }
        Ok(())
    }

    /// Generate a software interrupt. The distributor lock serializes the
    /// SGIR write against concurrent senders.
    pub fn sgi_gen(&self, sgi: u32, target: SgiTarget) -> KernelResult<()> {
        if sgi > super::SGI_MAX {
            return Err(KernelError::InvalidArgument {
                what: "SGI id above 15",
            });
        }

        let (filter, list) = match target {
            SgiTarget::Cpu(cpu) => (SGIR_FILTER_TO_LIST, 1u8 << (cpu % 8)),
            SgiTarget::List(mask) => (SGIR_FILTER_TO_LIST, mask),
            SgiTarget::Others => (SGIR_FILTER_TO_OTHERS, 0),
            SgiTarget::This => (SGIR_FILTER_TO_SELF, 0),
        };

        let val =
            (filter << SGIR_FILTER_SHIFT) | (u32::from(list) << SGIR_TARGET_SHIFT) | sgi;

        let _lock = self.dist_lock.lock();
        self.write_dist(GICD_SGIR, val);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Initialization
    // -----------------------------------------------------------------------

    fn init_dist(&self) {
        let _lock = self.dist_lock.lock();

        // Quiesce the distributor while reprogramming it.
        self.write_dist(GICD_CTLR, self.read_dist(GICD_CTLR) & !GICD_CTLR_ENABLE);

        // ITLinesNumber: 32 * (N + 1) lines, capped architecturally.
        let typer = self.read_dist(GICD_TYPER);
        let num_irqs = ((typer & 0x1F) + 1) * 32;
        let num_irqs = num_irqs.min(MAX_IRQ + 1);
        self.num_irqs.store(num_irqs, Ordering::Relaxed);
        log::info!("GICv2: {} interrupt lines", num_irqs);

        // All SPIs: target every CPU interface, level triggered, default
        // priority, deactivated and disabled.
        let mut irq = SPI_BASE;
        while irq < num_irqs {
            self.write_dist(GICD_ITARGETSR + u64::from(irq), ITARGETSR_DEF);
            irq += 4;
        }
        let mut irq = SPI_BASE;
        while irq < num_irqs {
            self.write_dist(GICD_ICFGR + 4 * u64::from(irq / I_PER_ICFGR), 0);
            irq += I_PER_ICFGR;
        }
        let mut irq = SPI_BASE;
        while irq < num_irqs {
            self.write_dist(GICD_IPRIORITYR + u64::from(irq), PRIORITY_DEF);
            irq += 4;
        }
        let mut irq = SPI_BASE;
        while irq < num_irqs {
            self.write_dist(GICD_ICACTIVER + 4 * u64::from(irq / 32), 0xFFFF_FFFF);
            self.write_dist(GICD_ICENABLER + 4 * u64::from(irq / 32), 0xFFFF_FFFF);
            irq += 32;
        }

        self.write_dist(GICD_CTLR, self.read_dist(GICD_CTLR) | GICD_CTLR_ENABLE);
    }

    fn init_cpuif(&self) {
        // Accept all priorities.
        self.write_cpuif(GICC_PMR, GICC_PMR_PRIO_MIN);

        // Banked SGI/PPI state is unknown at boot: default priorities,
        // everything deactivated, PPIs disabled, SGIs enabled.
        let mut irq = 0;
        while irq < SPI_BASE {
            self.write_dist(GICD_IPRIORITYR + u64::from(irq), PRIORITY_DEF);
            irq += 4;
        }
        self.write_dist(GICD_ICACTIVER, 0xFFFF_FFFF);
        self.write_dist(GICD_ICENABLER, 0xFFFF_0000);
        self.write_dist(GICD_ISENABLER, 0x0000_FFFF);

        self.write_cpuif(GICC_CTLR, GICC_CTLR_ENABLE);
    }

    /// First call initializes the distributor and the calling CPU's
    /// interface; subsequent calls (secondary CPUs) the interface only.
    pub fn initialize(&self) -> KernelResult<()> {
        if !self.initialized.swap(true, Ordering::AcqRel) {
            self.init_dist();
        }
        self.init_cpuif();
        Ok(())
    }
}
