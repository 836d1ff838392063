//! GICv3: distributor + redistributors, CPU interface in system registers
//!
//! The shared API matches [`super::v2`]; the differences live in affinity
//! routing (IROUTER instead of target lists), the per-CPU redistributor
//! frame that replaces the banked GICD registers for SGIs and PPIs, and the
//! ICC system registers replacing the memory-mapped CPU interface.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use spin::Mutex;

use super::{
    mmio_read32, mmio_write32, mmio_write64, mmio_write8, SgiTarget, Trigger, DEFAULT_PRIORITY,
    MAX_IRQ, PPI_BASE, SPI_BASE, SPURIOUS,
};
use crate::error::{KernelError, KernelResult};

// Distributor register offsets
const GICD_CTLR: u64 = 0x0000;
const GICD_TYPER: u64 = 0x0004;
const GICD_ISENABLER: u64 = 0x0100;
const GICD_ICENABLER: u64 = 0x0180;
const GICD_ICACTIVER: u64 = 0x0380;
const GICD_IPRIORITYR: u64 = 0x0400;
const GICD_ICFGR: u64 = 0x0C00;
const GICD_IROUTER: u64 = 0x6000;
const GICD_PIDR2: u64 = 0xFFE8;

const GICD_CTLR_RWP: u32 = 1 << 31;
const GICD_CTLR_ARE_NS: u32 = 1 << 4;
const GICD_CTLR_ENABLE_G1NS: u32 = 1 << 1;

// Redistributor frames: RD_base, then the SGI frame one 64 KiB page up
const GICR_STRIDE: u64 = 0x2_0000;
const GICR_SGI_FRAME: u64 = 0x1_0000;
const GICR_WAKER: u64 = 0x0014;
const GICR_IGROUPR0: u64 = GICR_SGI_FRAME + 0x0080;
const GICR_ISENABLER0: u64 = GICR_SGI_FRAME + 0x0100;
const GICR_ICENABLER0: u64 = GICR_SGI_FRAME + 0x0180;
const GICR_ICACTIVER0: u64 = GICR_SGI_FRAME + 0x0380;
const GICR_IPRIORITYR: u64 = GICR_SGI_FRAME + 0x0400;
const GICR_ICFGR1: u64 = GICR_SGI_FRAME + 0x0C04;

const GICR_WAKER_PROCESSOR_SLEEP: u32 = 1 << 1;
const GICR_WAKER_CHILDREN_ASLEEP: u32 = 1 << 2;

const I_PER_ICFGR: u32 = 16;
const ICFGR_TRIG_MASK: u32 = 0x2;
const ICFGR_TRIG_EDGE: u32 = 0x2;

const PRIORITY_DEF: u32 = u32::from_le_bytes([DEFAULT_PRIORITY; 4]);

const DIST_MIN_SIZE: u64 = 0x1_0000;
const RDIST_MIN_SIZE: u64 = GICR_STRIDE;

const PIDR2_ARCHREV_SHIFT: u32 = 4;
const PIDR2_ARCHREV_MASK: u32 = 0xF;

/// ICC_CTLR_EL1.EOImode: EOI drops priority only, deactivation is explicit
const ICC_CTLR_EOIMODE_DROP: u64 = 1 << 1;
/// ICC_SRE_EL1: system-register access enable
const ICC_SRE_ENABLE: u64 = 1 << 0;

/// ICC_SGI1R_EL1.IRM: route to all but self
const SGI1R_IRM: u64 = 1 << 40;

/// GICv3 device state. Per-IRQ state lives in the hardware; the shadow
/// state is the line count and the distributor lock.
pub struct GicV3 {
    dist_base: u64,
    rdist_base: u64,
    num_irqs: AtomicU32,
    initialized: AtomicBool,
    dist_lock: Mutex<()>,
}

impl GicV3 {
    /// Validate the discovered register banks and construct the device
    pub fn probe(dist: (u64, u64), rdist: (u64, u64)) -> KernelResult<Self> {
        if dist.0 == 0 || rdist.0 == 0 {
            return Err(KernelError::NotFound {
                resource: "GICv3 register banks",
            });
        }
        if dist.1 < DIST_MIN_SIZE || rdist.1 < RDIST_MIN_SIZE {
            return Err(KernelError::InvalidArgument {
                what: "GICv3 register bank size",
            });
        }

        let gic = Self {
            dist_base: dist.0,
            rdist_base: rdist.0,
            num_irqs: AtomicU32::new(0),
            initialized: AtomicBool::new(false),
            dist_lock: Mutex::new(()),
        };

        let archrev =
            (gic.read_dist(GICD_PIDR2) >> PIDR2_ARCHREV_SHIFT) & PIDR2_ARCHREV_MASK;
        if archrev != 3 {
            return Err(KernelError::NotSupported {
                feature: "GIC architecture revision other than 3",
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

    fn write_dist64(&self, offset: u64, val: u64) {
        mmio_write64(self.dist_base + offset, val);
    }

    /// Base of the executing CPU's redistributor frame
    fn rdist(&self) -> u64 {
        self.rdist_base + u64::from(crate::smp::lcpu_current().idx()) * GICR_STRIDE
    }

    fn read_rdist(&self, offset: u64) -> u32 {
        mmio_read32(self.rdist() + offset)
    }

    fn write_rdist(&self, offset: u64, val: u32) {
        mmio_write32(self.rdist() + offset, val);
    }

    fn write_rdist8(&self, offset: u64, val: u8) {
        mmio_write8(self.rdist() + offset, val);
    }

    /// Wait for a distributor register write to take effect
    fn wait_rwp(&self) {
        while self.read_dist(GICD_CTLR) & GICD_CTLR_RWP != 0 {
            core::hint::spin_loop();
        }
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

    /// Affinity of the executing CPU, packed as `Aff3|Aff2|Aff1|Aff0`
    fn cpu_affinity() -> u32 {
        let mpidr = crate::arch::cpu_id();
        (((mpidr >> 8) & 0xFF00_0000) | (mpidr & 0x00FF_FFFF)) as u32
    }

    // -----------------------------------------------------------------------
    // CPU interface (system registers)
    // -----------------------------------------------------------------------

    /// Read ICC_IAR1_EL1: acknowledge the highest-priority pending
    /// interrupt.
    pub fn ack_irq(&self) -> u32 {
        #[cfg(all(target_arch = "aarch64", target_os = "none"))]
        {
            let iar: u64;
            // SAFETY: Reading the interrupt acknowledge register has the
            // architecturally defined side effect of activating the
            // returned interrupt, which is exactly what this function is
            // for.
            unsafe {
                core::arch::asm!("mrs {}, S3_0_C12_C12_0", out(reg) iar, options(nostack));
                core::arch::asm!("isb", options(nostack));
            }
            iar as u32
        }
        #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
        {
            SPURIOUS
        }
    }

    /// Priority drop plus explicit deactivation (EOImode is configured to
    /// "drop then deactivate").
    pub fn eoi_irq(&self, ack: u32) {
        #[cfg(all(target_arch = "aarch64", target_os = "none"))]
        // SAFETY: Writing EOIR/DIR with the value of the paired IAR read is
        // the architectural completion sequence.
        unsafe {
            core::arch::asm!("msr S3_0_C12_C12_1, {}", in(reg) u64::from(ack), options(nostack));
            core::arch::asm!("msr S3_0_C12_C11_1, {}", in(reg) u64::from(ack), options(nostack));
        }
        #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
        let _ = ack;
    }

    // -----------------------------------------------------------------------
    // Distributor / redistributor
    // -----------------------------------------------------------------------

    /// Enable an interrupt. SPIs are additionally routed to the executing
    /// CPU, matching the expectation that whoever enables a line wants to
    /// service it.
    pub fn enable_irq(&self, irq: u32) -> KernelResult<()> {
        self.check_irq(irq, 0)?;
        let _lock = self.dist_lock.lock();

        if irq >= SPI_BASE {
            let router = Self::affinity_to_router(Self::cpu_affinity());
            self.write_dist64(GICD_IROUTER + 8 * u64::from(irq), router);
            self.write_dist(GICD_ISENABLER + 4 * u64::from(irq / 32), 1 << (irq % 32));
        } else {
            self.write_rdist(GICR_ISENABLER0, 1 << irq);
        }
        Ok(())
    }

    pub fn disable_irq(&self, irq: u32) -> KernelResult<()> {
        self.check_irq(irq, 0)?;
        let _lock = self.dist_lock.lock();

        if irq >= SPI_BASE {
            self.write_dist(GICD_ICENABLER + 4 * u64::from(irq / 32), 1 << (irq % 32));
        } else {
            self.write_rdist(GICR_ICENABLER0, 1 << irq);
        }
        Ok(())
    }

    pub fn set_irq_priority(&self, irq: u32, prio: u8) -> KernelResult<()> {
        self.check_irq(irq, 0)?;
        let _lock = self.dist_lock.lock();

        if irq >= SPI_BASE {
            self.write_dist8(GICD_IPRIORITYR + u64::from(irq), prio);
        } else {
            self.write_rdist8(GICR_IPRIORITYR + u64::from(irq), prio);
        }
        Ok(())
    }

    /// Route an SPI to the CPU with the given packed affinity
    pub fn set_irq_affinity(&self, irq: u32, affinity: u32) -> KernelResult<()> {
        self.check_irq(irq, SPI_BASE)?;
        let _lock = self.dist_lock.lock();
        self.write_dist64(
            GICD_IROUTER + 8 * u64::from(irq),
            Self::affinity_to_router(affinity),
        );
        Ok(())
    }

    pub fn set_irq_trigger(&self, irq: u32, trigger: Trigger) -> KernelResult<()> {
        self.check_irq(irq, PPI_BASE)?;
        let _lock = self.dist_lock.lock();

        // PPIs configure through the redistributor's ICFGR1, SPIs through
        // the distributor.
        let target = if irq >= SPI_BASE {
            self.dist_base + GICD_ICFGR + 4 * u64::from(irq / I_PER_ICFGR)
        } else {
            self.rdist() + GICR_ICFGR1
        };

        let shift = (irq % I_PER_ICFGR) * 2;
        let mut val = mmio_read32(target);
        let old = (val >> shift) & ICFGR_TRIG_MASK;
        let new = match trigger {
            Trigger::Edge => ICFGR_TRIG_EDGE,
            Trigger::Level => 0,
        };
        if old != new {
            val &= !(ICFGR_TRIG_MASK << shift);
            val |= new << shift;
            mmio_write32(target, val);
        }
        Ok(())
    }

    /// Generate a software interrupt through ICC_SGI1R_EL1
    pub fn sgi_gen(&self, sgi: u32, target: SgiTarget) -> KernelResult<()> {
        if sgi > super::SGI_MAX {
            return Err(KernelError::InvalidArgument {
                what: "SGI id above 15",
            });
        }

        let val = match target {
            SgiTarget::Cpu(aff) => Self::sgi1r_value(sgi, aff),
            SgiTarget::This => Self::sgi1r_value(sgi, u64::from(Self::cpu_affinity())),
            SgiTarget::Others => (u64::from(sgi) << 24) | SGI1R_IRM,
            SgiTarget::List(_) => {
                return Err(KernelError::NotSupported {
                    feature: "GICv2-style target lists on GICv3",
                })
            }
        };

        let _lock = self.dist_lock.lock();
        Self::write_sgi1r(val);
        Ok(())
    }

    /// Pack an SGI id and a target affinity into an ICC_SGI1R_EL1 value.
    /// Affinity 0 selects one bit of the 16-wide target-list group.
    fn sgi1r_value(sgi: u32, aff: u64) -> u64 {
        let aff0 = aff & 0xFF;
        (u64::from(sgi) << 24)
            | (((aff >> 24) & 0xFF) << 48)
            | (((aff >> 16) & 0xFF) << 32)
            | (((aff >> 8) & 0xFF) << 16)
            | (((aff0 / 16) & 0xF) << 44)
            | (1 << (aff0 % 16))
    }

    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    fn write_sgi1r(val: u64) {
        // SAFETY: Writing the SGI generation register raises the requested
        // software interrupt; that is the caller's intent.
        unsafe {
            core::arch::asm!("msr S3_0_C12_C11_5, {}", in(reg) val, options(nostack));
            core::arch::asm!("isb", options(nostack));
        }
    }

    #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
    fn write_sgi1r(val: u64) {
        let _ = val;
    }

    fn affinity_to_router(aff: u32) -> u64 {
        // Aff3 moves to bits [39:32]; interrupt-routing-mode bit clear
        // (route to the specific CPU).
        (u64::from(aff) & 0x00FF_FFFF) | ((u64::from(aff) & 0xFF00_0000) << 8)
    }

    // -----------------------------------------------------------------------
    // Initialization
    // -----------------------------------------------------------------------

    fn init_dist(&self) {
        let _lock = self.dist_lock.lock();

        self.write_dist(GICD_CTLR, 0);
        self.wait_rwp();

        // ITLinesNumber, like GICv2.
        let typer = self.read_dist(GICD_TYPER);
        let num_irqs = (((typer & 0x1F) + 1) * 32).min(MAX_IRQ + 1);
        self.num_irqs.store(num_irqs, Ordering::Relaxed);
        log::info!("GICv3: {} interrupt lines", num_irqs);

        // All SPIs: level triggered, default priority, deactivated and
        // disabled, routed to the boot CPU.
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
        self.wait_rwp();

        let router = Self::affinity_to_router(Self::cpu_affinity());
        let mut irq = SPI_BASE;
        while irq < num_irqs {
            self.write_dist64(GICD_IROUTER + 8 * u64::from(irq), router);
            irq += 1;
        }

        // Affinity routing plus non-secure group 1 delivery.
        self.write_dist(GICD_CTLR, GICD_CTLR_ARE_NS | GICD_CTLR_ENABLE_G1NS);
        self.wait_rwp();
    }

    /// Wake the executing CPU's redistributor out of low-power state and
    /// program the SGI/PPI defaults.
    fn init_redist(&self) {
        let mut waker = self.read_rdist(GICR_WAKER);
        waker &= !GICR_WAKER_PROCESSOR_SLEEP;
        self.write_rdist(GICR_WAKER, waker);
        while self.read_rdist(GICR_WAKER) & GICR_WAKER_CHILDREN_ASLEEP != 0 {
            core::hint::spin_loop();
        }

        let mut irq = 0;
        while irq < SPI_BASE {
            self.write_rdist(GICR_IPRIORITYR + u64::from(irq), PRIORITY_DEF);
            irq += 4;
        }
        self.write_rdist(GICR_ICACTIVER0, 0xFFFF_FFFF);
        self.write_rdist(GICR_ICENABLER0, 0xFFFF_0000);
        self.write_rdist(GICR_IGROUPR0, 0xFFFF_FFFF);
        self.write_rdist(GICR_ISENABLER0, 0x0000_FFFF);
    }

    /// Enable the system-register CPU interface of the executing CPU
    fn init_cpuif(&self) {
        #[cfg(all(target_arch = "aarch64", target_os = "none"))]
        // SAFETY: The ICC configuration sequence below is the architectural
        // bring-up for the non-secure group-1 interface of this CPU.
        unsafe {
            let sre: u64;
            core::arch::asm!("mrs {}, S3_0_C12_C12_5", out(reg) sre, options(nostack));
            core::arch::asm!(
                "msr S3_0_C12_C12_5, {}",
                in(reg) sre | ICC_SRE_ENABLE,
                options(nostack)
            );
            core::arch::asm!("isb", options(nostack));

            // Full preemption granularity, accept all priorities, EOI
            // performs priority drop only, group 1 enabled.
            core::arch::asm!("msr S3_0_C12_C12_3, {}", in(reg) 0u64, options(nostack));
            core::arch::asm!("msr S3_0_C4_C6_0, {}", in(reg) 0xFFu64, options(nostack));
            core::arch::asm!(
                "msr S3_0_C12_C12_4, {}",
                in(reg) ICC_CTLR_EOIMODE_DROP,
                options(nostack)
            );
            core::arch::asm!("msr S3_0_C12_C12_7, {}", in(reg) 1u64, options(nostack));
            core::arch::asm!("isb", options(nostack));
        }
    }

    /// First call initializes the distributor; every call brings up the
    /// executing CPU's redistributor and system-register interface.
    pub fn initialize(&self) -> KernelResult<()> {
        if !self.initialized.swap(true, Ordering::AcqRel) {
            self.init_dist();
        }
        self.init_redist();
        self.init_cpuif();
        Ok(())
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use std::vec;
    use std::vec::Vec;

    struct FakeGicV3 {
        dist: Vec<u32>,
        rdist: Vec<u32>,
    }

    impl FakeGicV3 {
        fn new() -> Self {
            let mut fake = Self {
                dist: vec![0u32; (DIST_MIN_SIZE / 4) as usize],
                rdist: vec![0u32; (GICR_STRIDE / 4) as usize],
            };
            fake.dist[(GICD_PIDR2 / 4) as usize] = 3 << PIDR2_ARCHREV_SHIFT;
            fake.dist[(GICD_TYPER / 4) as usize] = 1; // 64 lines
            fake
        }

        fn device(&self) -> GicV3 {
            GicV3::probe(
                (self.dist.as_ptr() as u64, DIST_MIN_SIZE),
                (self.rdist.as_ptr() as u64, GICR_STRIDE),
            )
            .expect("probe of a well-formed fake bank should succeed")
        }

        fn dist_word(&self, offset: u64) -> u32 {
            self.dist[(offset / 4) as usize]
        }

        fn dist_word64(&self, offset: u64) -> u64 {
            u64::from(self.dist[(offset / 4) as usize])
                | (u64::from(self.dist[(offset / 4 + 1) as usize]) << 32)
        }

        fn rdist_word(&self, offset: u64) -> u32 {
            self.rdist[(offset / 4) as usize]
        }
    }

    #[test]
    fn probe_rejects_wrong_revision() {
        let mut fake = FakeGicV3::new();
        fake.dist[(GICD_PIDR2 / 4) as usize] = 2 << PIDR2_ARCHREV_SHIFT;
        let result = GicV3::probe(
            (fake.dist.as_ptr() as u64, DIST_MIN_SIZE),
            (fake.rdist.as_ptr() as u64, GICR_STRIDE),
        );
        assert!(matches!(result, Err(KernelError::NotSupported { .. })));
    }

    #[test]
    fn enable_spi_routes_and_sets_bit() {
        let fake = FakeGicV3::new();
        let gic = fake.device();

        gic.enable_irq(42).expect("enable SPI");
        assert_eq!(fake.dist_word(GICD_ISENABLER + 4), 1 << (42 - 32));
        // Routed to the executing CPU (affinity 0 on the host).
        assert_eq!(fake.dist_word64(GICD_IROUTER + 8 * 42), 0);

        gic.set_irq_affinity(42, 0x0101).expect("reroute");
        assert_eq!(fake.dist_word64(GICD_IROUTER + 8 * 42), 0x0101);
    }

    #[test]
    fn sgi_and_ppi_use_the_redistributor() {
        let fake = FakeGicV3::new();
        let gic = fake.device();

        gic.enable_irq(14).expect("enable SGI");
        assert_eq!(fake.rdist_word(GICR_ISENABLER0), 1 << 14);

        gic.disable_irq(27).expect("disable PPI");
        assert_eq!(fake.rdist_word(GICR_ICENABLER0), 1 << 27);

        gic.set_irq_priority(14, 0x40).expect("priority");
        let word = fake.rdist_word(GICR_IPRIORITYR + 12);
        assert_eq!((word >> 16) & 0xFF, 0x40);
    }

    #[test]
    fn redistributor_wakeup_clears_sleep_bit() {
        let mut fake = FakeGicV3::new();
        fake.rdist[(GICR_WAKER / 4) as usize] = GICR_WAKER_PROCESSOR_SLEEP;
        let gic = fake.device();

        gic.initialize().expect("initialize");
        assert_eq!(
            fake.rdist_word(GICR_WAKER) & GICR_WAKER_PROCESSOR_SLEEP,
            0,
            "ProcessorSleep must be cleared during redistributor wake"
        );
        // SGIs enabled, PPIs disabled, all group 1.
        assert_eq!(fake.rdist_word(GICR_ISENABLER0), 0x0000_FFFF);
        assert_eq!(fake.rdist_word(GICR_IGROUPR0), 0xFFFF_FFFF);

        // Distributor ended up with affinity routing and group 1 enabled.
        assert_eq!(
            fake.dist_word(GICD_CTLR),
            GICD_CTLR_ARE_NS | GICD_CTLR_ENABLE_G1NS
        );
    }

    #[test]
    fn trigger_rejects_sgis_and_programs_spis() {
        let fake = FakeGicV3::new();
        let gic = fake.device();

        assert!(gic.set_irq_trigger(3, Trigger::Edge).is_err());

        gic.set_irq_trigger(42, Trigger::Edge).expect("edge SPI");
        let reg = GICD_ICFGR + 4 * u64::from(42 / I_PER_ICFGR);
        let shift = (42 % I_PER_ICFGR) * 2;
        assert_eq!((fake.dist_word(reg) >> shift) & ICFGR_TRIG_MASK, ICFGR_TRIG_EDGE);
    }

    #[test]
    fn sgi1r_encoding() {
        // Affinity 0x01020304 → Aff3=1, Aff2=2, Aff1=3, Aff0=4.
        let val = GicV3::sgi1r_value(7, 0x0102_0304);
        assert_eq!((val >> 24) & 0xF, 7, "SGI id field");
        assert_eq!((val >> 32) & 0xFF, 2, "Aff2 field");
        assert_eq!((val >> 16) & 0xFF, 3, "Aff1 field");
        assert_eq!(val & 0xFFFF, 1 << 4, "target bit for Aff0 = 4");
        assert_eq!((val >> 44) & 0xF, 0, "range selector for Aff0 < 16");

        // GICv2-style lists are not expressible.
        let fake = FakeGicV3::new();
        let gic = fake.device();
        assert!(matches!(
            gic.sgi_gen(1, SgiTarget::List(0b11)),
            Err(KernelError::NotSupported { .. })
        ));
    }
}
