//! Boot-time initialization driver
//!
//! Strings the core subsystems together in hand-over order: validate the
//! boot-info block, bring the memory-region list into shape, seed the
//! page-table's frame allocator from the free regions, establish the
//! runtime mappings, then bring up the interrupt controller and the
//! secondary CPUs. The boot shim calls [`kernel_init`] (or the individual
//! stages) on the BSP with IRQs disabled.

use crate::bootinfo::BootInfo;
use crate::error::{KernelError, KernelResult};
use crate::irq::gic::{self, GicDiscovery};
use crate::mm::memregion::{BootWindows, MemRegionFlags, MemRegionType};
use crate::mm::paging::{PageAttr, PageOpFlags, PageTable};
use crate::mm::{FrameAllocator, PhysicalAddress, PAGE_SHIFT, PAGE_SIZE};
use crate::sync::GlobalState;
use crate::{arch, logger, smp};

/// Boot windows recorded once by the boot shim for bootstrap allocations
static BOOT_WINDOWS: GlobalState<BootWindows> = GlobalState::new();

/// Record the mapped boot area and kernel image extents used by
/// [`memregion_alloc`]. Recorded once, before memory init.
pub fn set_boot_windows(windows: BootWindows) -> KernelResult<()> {
    BOOT_WINDOWS
        .init(windows)
        .map_err(|_| KernelError::InvalidState {
            expected: "boot windows unset",
            actual: "boot windows already recorded",
        })
}

/// Bootstrap allocation from the memory-region list; the only allocator
/// available before the frame allocator exists. Without recorded boot
/// windows the allocation is unrestricted.
///
/// # Safety
///
/// Single-threaded boot context only.
pub unsafe fn memregion_alloc(
    bi: &mut BootInfo,
    size: u64,
    rtype: MemRegionType,
    flags: MemRegionFlags,
) -> Option<u64> {
    let windows = BOOT_WINDOWS.with(|w| *w).unwrap_or_default();
    bi.mrds.alloc(size, rtype, flags, &windows)
}

/// Validate the hand-off block and normalize the memory-region list.
/// Invariant violations in the list (overlapping allocated regions with
/// conflicting flags) surface as errors; callers treat them as fatal.
pub fn mem_init(bi: &mut BootInfo) -> KernelResult<()> {
    bi.validate()?;
    bi.mrds.coalesce()?;

    for mrd in bi.mrds.iter() {
        log::debug!(
            "memory {:#012x}-{:#012x} {:?} {:?}",
            mrd.pbase,
            mrd.pend(),
            mrd.rtype,
            mrd.flags
        );
    }
    Ok(())
}

fn attr_of(flags: MemRegionFlags) -> PageAttr {
    let mut attr = PageAttr::empty();
    if flags.contains(MemRegionFlags::READ) {
        attr |= PageAttr::READ;
    }
    if flags.contains(MemRegionFlags::WRITE) {
        attr |= PageAttr::WRITE;
    }
    if flags.contains(MemRegionFlags::EXEC) {
        attr |= PageAttr::EXEC;
    }
    if flags.contains(MemRegionFlags::WRITECOMBINE) {
        attr |= PageAttr::WRITECOMBINE;
    }
    attr
}

/// Build the runtime page table: donate the free regions to `fa` (largest
/// first, which also hosts the table hierarchy), then map every region
/// flagged `MAP` at its virtual base with its permission attributes.
/// `dm_off` is the direct-map offset for the donated physical memory (the
/// architectural direct-map base on bare metal).
pub fn paging_init<'fa>(
    bi: &mut BootInfo,
    fa: &'fa FrameAllocator,
    dm_off: u64,
) -> KernelResult<PageTable<'fa>> {
    // Smallest donation that survives its own metadata.
    let min_len = 2 * PAGE_SIZE as u64;

    let largest = bi
        .mrds
        .iter_filtered(
            MemRegionType::Free as u16,
            MemRegionFlags::empty(),
            MemRegionFlags::empty(),
        )
        .filter(|(_, m)| m.len >= min_len)
        .max_by_key(|(_, m)| m.len)
        .map(|(i, m)| (i, m.pbase, m.len))
        .ok_or(KernelError::OutOfMemory {
            requested: min_len as usize,
        })?;

    let pt = PageTable::new(
        fa,
        PhysicalAddress::new(largest.1),
        largest.2 & !(PAGE_SIZE as u64 - 1),
        dm_off,
    )?;

    for (i, m) in bi.mrds.iter_filtered(
        MemRegionType::Free as u16,
        MemRegionFlags::empty(),
        MemRegionFlags::empty(),
    ) {
        if i == largest.0 || m.len < min_len {
            continue;
        }
        if let Err(e) = pt.add_mem(
            PhysicalAddress::new(m.pbase),
            m.len & !(PAGE_SIZE as u64 - 1),
            dm_off,
        ) {
            // Running out of range slots just strands the memory; boot can
            // continue on what the allocator already owns.
            log::warn!("free region {:#x}+{:#x} not donated: {}", m.pbase, m.len, e);
        }
    }

    // Establish the runtime mappings for the kernel artifacts.
    for mrd in bi.mrds.iter() {
        if !mrd.flags.contains(MemRegionFlags::MAP) {
            continue;
        }
        let pages = (crate::mm::align_up(mrd.len, PAGE_SIZE as u64) >> PAGE_SHIFT) as usize;
        pt.map(
            mrd.vbase,
            Some(PhysicalAddress::new(mrd.pbase)),
            pages,
            attr_of(mrd.flags),
            PageOpFlags::NONE,
        )?;
    }

    Ok(pt)
}

/// Probe and initialize the interrupt controller for the executing CPU
pub fn intctlr_init(disc: &GicDiscovery) -> KernelResult<()> {
    gic::probe(disc)?;
    gic::initialize()
}

/// Bring up the secondary CPUs: allocate their records, wire the RUN and
/// WAKEUP IPI vectors, and start every AP on its stack from `stacks`.
/// Returns the number of successfully started APs.
pub fn mp_boot(secondary_ids: &[u64], stacks: &[u64]) -> KernelResult<usize> {
    if stacks.len() < secondary_ids.len() {
        return Err(KernelError::InvalidArgument {
            what: "one startup stack required per secondary CPU",
        });
    }

    smp::mp_init(secondary_ids, arch::lcpu::RUN_IRQ, arch::lcpu::WAKEUP_IRQ)?;

    let mut started = 0;
    let res = smp::lcpu_start(None, &mut started, stacks, None);
    res.map(|()| started)
}

/// Full BSP bring-up in hand-over order. Returns the runtime page table;
/// the caller (boot shim) switches to it and enters the application.
pub fn kernel_init<'fa>(
    bi: &mut BootInfo,
    fa: &'fa FrameAllocator,
    disc: &GicDiscovery,
) -> KernelResult<PageTable<'fa>> {
    let _ = logger::init(log::LevelFilter::Info);
    log::info!("ferrite core starting");

    smp::lcpu_init()?;
    mem_init(bi)?;

    let pt = paging_init(bi, fa, arch::paging::DIRECTMAP_BASE)?;

    #[cfg(target_os = "none")]
    // SAFETY: paging_init mapped every MAP-flagged region (kernel image
    // included) and the direct map before this point.
    unsafe {
        pt.set_active()
    };

    intctlr_init(disc)?;

    Ok(pt)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::frame_alloc::tests::TestArena;
    use crate::mm::memregion::MemRegionDesc;
    use crate::mm::PAGE_SIZE;

    fn boot_info_with_arena(arena: &TestArena) -> BootInfo {
        let mut bi = BootInfo::new();
        bi.mrds
            .insert(MemRegionDesc::new(
                arena.start.as_u64(),
                arena.len,
                MemRegionType::Free,
                MemRegionFlags::READ | MemRegionFlags::WRITE,
            ))
            .expect("insert free region");
        bi
    }

    #[test]
    fn mem_init_validates_and_coalesces() {
        let arena = TestArena::new(0x40_0000, 64 * PAGE_SIZE);
        let mut bi = boot_info_with_arena(&arena);
        // A second, contiguous free region merges away.
        bi.mrds
            .insert(MemRegionDesc::new(
                arena.start.as_u64() + arena.len,
                0, // zero-length tail is dropped by page rounding
                MemRegionType::Free,
                MemRegionFlags::READ | MemRegionFlags::WRITE,
            ))
            .expect("insert");

        mem_init(&mut bi).expect("mem init");
        assert!(bi.mrds.len() >= 1);

        let mut corrupt = BootInfo::new();
        corrupt.magic = 0;
        assert!(mem_init(&mut corrupt).is_err());
    }

    #[test]
    fn paging_init_builds_runtime_table() {
        let arena = TestArena::new(0x40_0000, 256 * PAGE_SIZE);
        let mut bi = boot_info_with_arena(&arena);

        // A synthetic kernel artifact that must be mapped.
        bi.mrds
            .insert(MemRegionDesc::new(
                0x10_0000,
                2 * PAGE_SIZE as u64,
                MemRegionType::Kernel,
                MemRegionFlags::READ | MemRegionFlags::EXEC | MemRegionFlags::MAP,
            ))
            .expect("insert kernel region");

        mem_init(&mut bi).expect("mem init");

        let fa = FrameAllocator::new();
        let pt = paging_init(&mut bi, &fa, arena.dm_off).expect("paging init");

        // The kernel artifact is mapped at its virtual base with its
        // permissions.
        let walk = pt.walk(0x10_0000).expect("walk");
        assert!(walk.present(), "MAP-flagged regions must end up mapped");
        let attr = walk.attr().expect("present");
        assert!(attr.contains(PageAttr::EXEC));
        assert!(!attr.contains(PageAttr::WRITE));
        assert_eq!(walk.paddr().map(|p| p.as_u64()), Some(0x10_0000));

        // The free region was donated to the frame allocator.
        assert!(fa.total_frames() >= 255);
    }

    #[test]
    fn mp_boot_requires_stacks() {
        assert!(matches!(
            mp_boot(&[1, 2], &[0x9000]),
            Err(KernelError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn memregion_alloc_carves_from_free() {
        let arena = TestArena::new(0x40_0000, 64 * PAGE_SIZE);
        let mut bi = boot_info_with_arena(&arena);

        // SAFETY: Tests run the boot path single-threaded.
        let got = unsafe {
            memregion_alloc(
                &mut bi,
                PAGE_SIZE as u64,
                MemRegionType::Stack,
                MemRegionFlags::READ | MemRegionFlags::WRITE,
            )
        };
        assert_eq!(got, Some(arena.start.as_u64()));
        assert!(bi
            .mrds
            .iter()
            .any(|m| m.rtype == MemRegionType::Stack && m.pbase == arena.start.as_u64()));
    }
}
