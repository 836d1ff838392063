//! Architecture-agnostic paging core
//!
//! A table-driven walker and mapper over the multi-level page table format
//! described by [`crate::arch::paging`]. Page-table pages are allocated from
//! the page table's frame allocator and are read and written through the
//! allocator's direct map, so no temporary mappings are needed to edit the
//! hierarchy.
//!
//! Each page table is owned by a single logical context; concurrent
//! mutation of the same table from multiple CPUs is undefined. Every PTE
//! write is paired with a TLB invalidation of the affected virtual address
//! on the mutating CPU; cross-CPU TLB coherence is the caller's business.

use core::ops::BitOr;

use bitflags::bitflags;

use super::{is_aligned, FrameAllocator, PhysicalAddress, VirtualAddress, PAGE_SHIFT, PAGE_SIZE};
use crate::arch::paging as arch;
use crate::error::{KernelError, KernelResult};

bitflags! {
    /// Abstract page attributes, mapped onto architectural PTE bits by the
    /// per-architecture constructor. Empty attributes request a
    /// mapped-but-inaccessible page (as close as the architecture allows).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageAttr: u64 {
        const READ         = 1 << 0;
        const WRITE        = 1 << 1;
        const EXEC         = 1 << 2;
        const WRITECOMBINE = 1 << 3;
    }
}

impl PageAttr {
    /// Read-write data mapping
    pub const RW: PageAttr = PageAttr::READ.union(PageAttr::WRITE);
}

/// Flags controlling map/unmap/attribute operations, with an embedded
/// requested page-size level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageOpFlags(u64);

impl PageOpFlags {
    pub const NONE: Self = Self(0);
    /// Preserve existing PTEs: reuse their physical address on map, only
    /// invalidate them on unmap
    pub const KEEP_PTES: Self = Self(1 << 0);
    /// Do not release backing frames on unmap/free
    pub const KEEP_FRAMES: Self = Self(1 << 1);
    /// Use exactly the page size encoded in the flags, never a different one
    pub const FORCE_SIZE: Self = Self(1 << 2);

    const SIZE_SHIFT: u64 = 4;
    const SIZE_MASK: u64 = 0xf;

    /// Encode the requested page-size level (0 = base pages)
    pub const fn size(level: usize) -> Self {
        Self((level as u64 & Self::SIZE_MASK) << Self::SIZE_SHIFT)
    }

    /// The page-size level encoded in the flags
    pub const fn size_level(&self) -> usize {
        ((self.0 >> Self::SIZE_SHIFT) & Self::SIZE_MASK) as usize
    }

    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for PageOpFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// How to derive the new top level in [`PageTable::clone_from`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloneMode {
    /// Copy the source's top-level table; lower levels are shared
    Inherit,
    /// Start from an empty top-level table
    Empty,
}

/// Verdict of a page-mapper callback for one proposed PTE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapDecision {
    /// Write the (possibly modified) PTE
    Apply,
    /// Leave the slot unchanged and continue with the next page
    Skip,
    /// Retry this mapping with a smaller page size
    TooBig,
}

/// Page-mapper callback, invoked just before each leaf PTE write with the
/// virtual address, the level of the proposed mapping, and the proposed PTE
/// (which it may modify in place).
pub type MapxHandler<'m> = dyn FnMut(u64, usize, &mut u64) -> KernelResult<MapDecision> + 'm;

/// Result of a page-table walk
#[derive(Debug, Clone, Copy)]
pub struct Walk {
    /// Level at which the translation ended
    pub level: usize,
    /// Virtual address of the page table holding `pte`
    pub pt_vaddr: VirtualAddress,
    /// The PTE where the translation ended (possibly non-present)
    pub pte: u64,
}

impl Walk {
    /// Whether the walk ended at a present mapping
    pub fn present(&self) -> bool {
        arch::pte_present(self.pte)
    }

    /// Physical address of the mapping, if present
    pub fn paddr(&self) -> Option<PhysicalAddress> {
        self.present()
            .then(|| PhysicalAddress::new(arch::pte_paddr(self.pte, self.level)))
    }

    /// Decoded attributes of the mapping, if present
    pub fn attr(&self) -> Option<PageAttr> {
        self.present().then(|| arch::pte_attr(self.pte))
    }
}

const KMAP_WORDS: usize = arch::KMAP_PAGES_MAX.div_ceil(64);

/// A multi-level page table with its backing frame allocator
pub struct PageTable<'fa> {
    pt_vbase: VirtualAddress,
    pt_pbase: PhysicalAddress,
    fa: &'fa FrameAllocator,
    dm_off: u64,
    kmap_slots: spin::Mutex<[u64; KMAP_WORDS]>,
}

impl<'fa> PageTable<'fa> {
    /// Construct a fresh page table. `[start, start + len)` is donated to
    /// `fa` and becomes the table's allocation domain; `dm_off` is the
    /// direct-map offset under which that physical range is virtually
    /// accessible (the architectural direct-map base on bare metal). The
    /// donated range is mapped into the direct map and the kmap window's
    /// table hierarchy is pre-built so later kmaps never allocate.
    pub fn new(
        fa: &'fa FrameAllocator,
        start: PhysicalAddress,
        len: u64,
        dm_off: u64,
    ) -> KernelResult<Self> {
        fa.add_range(start, len, dm_off)?;

        let root = Self::alloc_table_frame(fa)?;
        let pt = Self {
            pt_vbase: fa.directmap(root)?,
            pt_pbase: root,
            fa,
            dm_off,
            kmap_slots: spin::Mutex::new([0; KMAP_WORDS]),
        };

        // Direct-map the donated range so its frames stay reachable when
        // this table becomes the active one.
        let dm_vaddr = start.as_u64().wrapping_add(dm_off);
        let pages = (len >> PAGE_SHIFT) as usize;
        pt.map(dm_vaddr, Some(start), pages, PageAttr::RW, PageOpFlags::NONE)?;

        pt.prebuild_kmap_window()?;

        Ok(pt)
    }

    /// Donate another physical range to this table's frame allocator and
    /// extend the direct map over it.
    pub fn add_mem(&self, start: PhysicalAddress, len: u64, dm_off: u64) -> KernelResult<()> {
        self.fa.add_range(start, len, dm_off)?;
        let dm_vaddr = start.as_u64().wrapping_add(dm_off);
        let pages = (len >> PAGE_SHIFT) as usize;
        self.map(dm_vaddr, Some(start), pages, PageAttr::RW, PageOpFlags::NONE)
    }

    /// Derive a new page table from `src`, sharing its frame allocator.
    /// `Inherit` copies the top-level table (sharing all lower levels);
    /// `Empty` produces a blank top level.
    pub fn clone_from(src: &PageTable<'fa>, mode: CloneMode) -> KernelResult<Self> {
        let root = Self::alloc_table_frame(src.fa)?;
        let pt = Self {
            pt_vbase: src.fa.directmap(root)?,
            pt_pbase: root,
            fa: src.fa,
            dm_off: src.dm_off,
            kmap_slots: spin::Mutex::new([0; KMAP_WORDS]),
        };

        if mode == CloneMode::Inherit {
            let dst = pt.pt_vbase.as_mut_ptr::<u64>();
            let srcp = src.pt_vbase.as_ptr::<u64>();
            // SAFETY: Both pointers reference whole, distinct page-table
            // pages owned by the shared frame allocator and mapped through
            // its direct map.
            unsafe { core::ptr::copy_nonoverlapping(srcp, dst, arch::PT_ENTRIES) };
        }

        Ok(pt)
    }

    /// Physical address of the top-level table
    pub fn root(&self) -> PhysicalAddress {
        self.pt_pbase
    }

    /// The frame allocator backing this table
    pub fn frame_allocator(&self) -> &'fa FrameAllocator {
        self.fa
    }

    /// Install this table as the active one on the executing CPU.
    ///
    /// # Safety
    ///
    /// The table must map the executing code, the current stack, and the
    /// direct-map window at their current virtual addresses.
    pub unsafe fn set_active(&self) {
        // SAFETY: Guaranteed by the caller.
        unsafe { arch::set_active_pt_root(self.pt_pbase.as_u64()) };
    }

    /// Physical root of the page table currently active in hardware
    pub fn active_root() -> PhysicalAddress {
        PhysicalAddress::new(arch::active_pt_root())
    }

    // -----------------------------------------------------------------------
    // Walking
    // -----------------------------------------------------------------------

    /// Resolve `vaddr`, stopping at the deepest present level
    pub fn walk(&self, vaddr: u64) -> KernelResult<Walk> {
        let mut table_pa = self.pt_pbase.as_u64();
        let mut level = arch::PT_LEVELS - 1;

        loop {
            let pt_vaddr = self.fa.directmap(PhysicalAddress::new(table_pa))?;
            let idx = arch::pt_index(vaddr, level);
            let pte = Self::pte_read(pt_vaddr, idx);

            if level == arch::PAGE_LEVEL
                || !arch::pte_present(pte)
                || arch::pte_is_leaf(pte, level)
            {
                return Ok(Walk {
                    level,
                    pt_vaddr,
                    pte,
                });
            }

            table_pa = arch::pte_paddr(pte, arch::PAGE_LEVEL);
            level -= 1;
        }
    }

    // -----------------------------------------------------------------------
    // Mapping
    // -----------------------------------------------------------------------

    /// Map `pages` pages (of the size requested in `flags`) starting at
    /// `vaddr`. `paddr` of `None` draws frames from the frame allocator.
    pub fn map(
        &self,
        vaddr: u64,
        paddr: Option<PhysicalAddress>,
        pages: usize,
        attr: PageAttr,
        flags: PageOpFlags,
    ) -> KernelResult<()> {
        self.mapx(vaddr, paddr, pages, attr, flags, None)
    }

    /// Like [`PageTable::map`], with a page-mapper callback consulted before
    /// each leaf PTE write.
    ///
    /// The mapper may accept, skip, or veto each proposed PTE, or demand a
    /// smaller page size (see [`MapDecision`]). On error, mappings already
    /// established remain in place.
    pub fn mapx(
        &self,
        vaddr: u64,
        paddr: Option<PhysicalAddress>,
        pages: usize,
        attr: PageAttr,
        flags: PageOpFlags,
        mut mapper: Option<&mut MapxHandler<'_>>,
    ) -> KernelResult<()> {
        let req_level = flags.size_level();
        if req_level > arch::LEAF_LEVEL_MAX || !arch::level_is_leaf_capable(req_level) {
            return Err(KernelError::NotSupported {
                feature: "requested page size",
            });
        }
        let req_size = arch::level_page_size(req_level);
        if !is_aligned(vaddr, req_size) {
            return Err(KernelError::InvalidArgument {
                what: "vaddr not aligned to requested page size",
            });
        }
        if let Some(p) = paddr {
            if !is_aligned(p.as_u64(), req_size) {
                return Err(KernelError::InvalidArgument {
                    what: "paddr not aligned to requested page size",
                });
            }
        }

        let mut remaining = (pages as u64) * req_size;
        let mut va = vaddr;
        let mut pa = paddr.map(|p| p.as_u64());

        while remaining > 0 {
            let mut level = if flags.contains(PageOpFlags::FORCE_SIZE) {
                req_level
            } else {
                Self::choose_level(va, pa, remaining)
            };

            loop {
                let handler = mapper.as_mut().map(|m| &mut **m);
                match self.map_one(va, pa, level, attr, flags, handler) {
                    Ok(()) => break,
                    Err(MapOneError::Retry) => {
                        // A smaller page size is wanted (mapper veto or
                        // fragmented physical memory).
                        debug_assert!(level > arch::PAGE_LEVEL);
                        level -= 1;
                    }
                    Err(MapOneError::Fatal(e)) => return Err(e),
                }
            }

            let step = arch::level_page_size(level);
            va += step;
            if let Some(p) = pa.as_mut() {
                *p += step;
            }
            remaining -= step;
        }

        Ok(())
    }

    /// Remove mappings for `pages` pages starting at `vaddr`. Backing
    /// frames owned by the frame allocator are released unless
    /// `KEEP_FRAMES`; address ranges without a valid mapping are skipped.
    pub fn unmap(&self, vaddr: u64, pages: usize, flags: PageOpFlags) -> KernelResult<()> {
        let req_level = flags.size_level();
        let req_size = arch::level_page_size(req_level);
        if !is_aligned(vaddr, req_size) {
            return Err(KernelError::InvalidArgument {
                what: "vaddr not aligned to requested page size",
            });
        }

        let mut remaining = (pages as u64) * req_size;
        let mut va = vaddr;

        while remaining > 0 {
            let walk = self.walk(va)?;
            let step = if !walk.present() {
                Self::gap_step(va, walk.level, remaining)
            } else {
                let leaf_size = arch::level_page_size(walk.level);
                let oversize = leaf_size > remaining
                    || !is_aligned(va, leaf_size)
                    || (flags.contains(PageOpFlags::FORCE_SIZE) && walk.level > req_level);
                if oversize {
                    // The present page extends past the requested range (or
                    // starts before it, or a smaller unmap granularity is
                    // enforced); split it and retry this address.
                    self.split_leaf(va, &walk)?;
                    continue;
                }

                let idx = arch::pt_index(va, walk.level);
                let residual = if flags.contains(PageOpFlags::KEEP_PTES) {
                    // Invalidate only; the hierarchy and PTE contents stay.
                    walk.pte & !1
                } else {
                    0
                };
                Self::pte_write(walk.pt_vaddr, idx, residual);
                arch::tlb_flush_page(va);

                if !flags.contains(PageOpFlags::KEEP_FRAMES) {
                    let paddr = PhysicalAddress::new(arch::pte_paddr(walk.pte, walk.level));
                    if self.fa.owns(paddr) {
                        // Multiple mappings of one frame are not reference
                        // counted; freeing an already-free frame is ignored.
                        let _ = self.fa.free(paddr, (leaf_size >> PAGE_SHIFT) as usize);
                    }
                }
                leaf_size
            };

            let step = step.min(remaining);
            va += step;
            remaining -= step;
        }

        Ok(())
    }

    /// Change the attributes of `pages` pages starting at `vaddr` without
    /// touching their physical addresses. Unmapped ranges are skipped.
    pub fn set_attr(
        &self,
        vaddr: u64,
        pages: usize,
        new_attr: PageAttr,
        flags: PageOpFlags,
    ) -> KernelResult<()> {
        let req_level = flags.size_level();
        let req_size = arch::level_page_size(req_level);
        if !is_aligned(vaddr, req_size) {
            return Err(KernelError::InvalidArgument {
                what: "vaddr not aligned to requested page size",
            });
        }

        let mut remaining = (pages as u64) * req_size;
        let mut va = vaddr;

        while remaining > 0 {
            let walk = self.walk(va)?;
            let step = if !walk.present() {
                Self::gap_step(va, walk.level, remaining)
            } else {
                let leaf_size = arch::level_page_size(walk.level);
                let oversize = leaf_size > remaining
                    || !is_aligned(va, leaf_size)
                    || (flags.contains(PageOpFlags::FORCE_SIZE) && walk.level > req_level);
                if oversize {
                    self.split_leaf(va, &walk)?;
                    continue;
                }

                let idx = arch::pt_index(va, walk.level);
                let paddr = arch::pte_paddr(walk.pte, walk.level);
                let pte = arch::pte_create(paddr, new_attr, walk.level, walk.pte);
                Self::pte_write(walk.pt_vaddr, idx, pte);
                arch::tlb_flush_page(va);
                leaf_size
            };

            let step = step.min(remaining);
            va += step;
            remaining -= step;
        }

        Ok(())
    }

    // -----------------------------------------------------------------------
    // kmap
    // -----------------------------------------------------------------------

    /// Establish a short-lived kernel mapping of `pages` base pages at
    /// `paddr` inside the fixed kmap window. Guaranteed not to allocate;
    /// fails only when more than [`arch::KMAP_PAGES_MAX`] pages are mapped
    /// concurrently.
    pub fn kmap(&self, paddr: PhysicalAddress, pages: usize) -> KernelResult<VirtualAddress> {
        if !paddr.is_page_aligned() || pages == 0 || pages > arch::KMAP_PAGES_MAX {
            return Err(KernelError::InvalidArgument {
                what: "kmap address/page count",
            });
        }

        let slot = self.kmap_reserve(pages)?;
        let vaddr = arch::KMAP_BASE + (slot as u64) * PAGE_SIZE as u64;

        for i in 0..pages {
            let va = vaddr + (i as u64) * PAGE_SIZE as u64;
            // The leaf tables for the window were built at init; the walk
            // ends at the base level without allocating.
            let walk = self.walk(va)?;
            debug_assert_eq!(walk.level, arch::PAGE_LEVEL);
            let idx = arch::pt_index(va, arch::PAGE_LEVEL);
            let pte = arch::pte_create(
                paddr.as_u64() + (i as u64) * PAGE_SIZE as u64,
                PageAttr::RW,
                arch::PAGE_LEVEL,
                0,
            );
            Self::pte_write(walk.pt_vaddr, idx, pte);
            arch::tlb_flush_page(va);
        }

        Ok(VirtualAddress::new(vaddr))
    }

    /// Remove a mapping previously established with [`PageTable::kmap`]
    pub fn kunmap(&self, vaddr: VirtualAddress, pages: usize) -> KernelResult<()> {
        let base = vaddr.as_u64();
        if base < arch::KMAP_BASE
            || base + (pages as u64) * PAGE_SIZE as u64
                > arch::KMAP_BASE + (arch::KMAP_PAGES_MAX as u64) * PAGE_SIZE as u64
        {
            return Err(KernelError::InvalidArgument {
                what: "kunmap address outside the kmap window",
            });
        }

        for i in 0..pages {
            let va = base + (i as u64) * PAGE_SIZE as u64;
            let walk = self.walk(va)?;
            let idx = arch::pt_index(va, arch::PAGE_LEVEL);
            Self::pte_write(walk.pt_vaddr, idx, 0);
            arch::tlb_flush_page(va);
        }

        let slot = ((base - arch::KMAP_BASE) >> PAGE_SHIFT) as usize;
        self.kmap_release(slot, pages);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// Tear down the hierarchy, releasing page-table pages and (unless
    /// `KEEP_FRAMES`) all mapped frames owned by the frame allocator.
    pub fn free(self, flags: PageOpFlags) -> KernelResult<()> {
        self.free_table(self.pt_pbase, arch::PT_LEVELS - 1, flags)?;
        Ok(())
    }

    fn free_table(
        &self,
        table_pa: PhysicalAddress,
        level: usize,
        flags: PageOpFlags,
    ) -> KernelResult<()> {
        let table_va = self.fa.directmap(table_pa)?;
        for idx in 0..arch::PT_ENTRIES {
            let pte = Self::pte_read(table_va, idx);
            if !arch::pte_present(pte) {
                continue;
            }
            if arch::pte_is_leaf(pte, level) {
                if !flags.contains(PageOpFlags::KEEP_FRAMES) {
                    let paddr = PhysicalAddress::new(arch::pte_paddr(pte, level));
                    if self.fa.owns(paddr) {
                        let frames = (arch::level_page_size(level) >> PAGE_SHIFT) as usize;
                        let _ = self.fa.free(paddr, frames);
                    }
                }
            } else {
                let child = PhysicalAddress::new(arch::pte_paddr(pte, arch::PAGE_LEVEL));
                self.free_table(child, level - 1, flags)?;
            }
        }
        // The direct map covers the page-table pages themselves, so the leaf
        // sweep above may already have returned this frame.
        let _ = self.fa.free(table_pa, 1);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn alloc_table_frame(fa: &FrameAllocator) -> KernelResult<PhysicalAddress> {
        let frame = fa.alloc(1, PAGE_SIZE as u64)?;
        let vaddr = fa.directmap(frame)?;
        // SAFETY: The frame was just allocated from `fa` and is reachable
        // through the direct map; zeroing a full page of it is in bounds.
        unsafe { core::ptr::write_bytes(vaddr.as_mut_ptr::<u8>(), 0, PAGE_SIZE) };
        Ok(frame)
    }

    fn pte_read(table: VirtualAddress, idx: usize) -> u64 {
        debug_assert!(idx < arch::PT_ENTRIES);
        // SAFETY: `table` references a live page-table page obtained through
        // the frame allocator's direct map; `idx` is bounded by PT_ENTRIES.
        // Volatile because the CPU's table walker reads the same memory.
        unsafe { core::ptr::read_volatile(table.as_ptr::<u64>().add(idx)) }
    }

    fn pte_write(table: VirtualAddress, idx: usize, pte: u64) {
        debug_assert!(idx < arch::PT_ENTRIES);
        // SAFETY: Same bounds as `pte_read`; volatile so the write is not
        // elided or reordered around the paired TLB invalidation.
        unsafe { core::ptr::write_volatile(table.as_mut_ptr::<u64>().add(idx), pte) };
    }

    /// Pick the largest leaf level usable for the next mapping step
    fn choose_level(va: u64, pa: Option<u64>, remaining: u64) -> usize {
        let mut level = arch::LEAF_LEVEL_MAX;
        while level > arch::PAGE_LEVEL {
            let size = arch::level_page_size(level);
            let aligned =
                is_aligned(va, size) && pa.map(|p| is_aligned(p, size)).unwrap_or(true);
            if aligned && size <= remaining {
                break;
            }
            level -= 1;
        }
        level
    }

    /// Bytes from `va` to the end of the non-present entry at `level`
    fn gap_step(va: u64, level: usize, remaining: u64) -> u64 {
        let size = arch::level_page_size(level);
        let step = size - (va & (size - 1));
        step.min(remaining)
    }

    /// Descend from the root to `target_level` for `vaddr`, creating
    /// missing intermediate tables. Present leaves above the target are
    /// split when `allow_split`, otherwise reported as already mapped.
    fn walk_create(
        &self,
        vaddr: u64,
        target_level: usize,
        allow_split: bool,
    ) -> Result<(VirtualAddress, usize), MapOneError> {
        let mut table_pa = self.pt_pbase.as_u64();
        let mut level = arch::PT_LEVELS - 1;

        while level > target_level {
            let table_va = self
                .fa
                .directmap(PhysicalAddress::new(table_pa))
                .map_err(MapOneError::Fatal)?;
            let idx = arch::pt_index(vaddr, level);
            let pte = Self::pte_read(table_va, idx);

            if !arch::pte_present(pte) {
                let child = Self::alloc_table_frame(self.fa).map_err(MapOneError::Fatal)?;
                Self::pte_write(table_va, idx, arch::pte_table(child.as_u64()));
                table_pa = child.as_u64();
            } else if arch::pte_is_leaf(pte, level) {
                if !allow_split {
                    return Err(MapOneError::Fatal(KernelError::AlreadyMapped {
                        vaddr,
                        level,
                    }));
                }
                let walk = Walk {
                    level,
                    pt_vaddr: table_va,
                    pte,
                };
                self.split_leaf(vaddr, &walk).map_err(MapOneError::Fatal)?;
                table_pa = arch::pte_paddr(Self::pte_read(table_va, idx), arch::PAGE_LEVEL);
            } else {
                table_pa = arch::pte_paddr(pte, arch::PAGE_LEVEL);
            }
            level -= 1;
        }

        let table_va = self
            .fa
            .directmap(PhysicalAddress::new(table_pa))
            .map_err(MapOneError::Fatal)?;
        Ok((table_va, arch::pt_index(vaddr, target_level)))
    }

    /// Map a single page of `level` size at `va`
    fn map_one(
        &self,
        va: u64,
        pa: Option<u64>,
        level: usize,
        attr: PageAttr,
        flags: PageOpFlags,
        mapper: Option<&mut MapxHandler<'_>>,
    ) -> Result<(), MapOneError> {
        let allow_split =
            flags.contains(PageOpFlags::KEEP_PTES) || flags.contains(PageOpFlags::FORCE_SIZE);
        let (table_va, idx) = self.walk_create(va, level, allow_split)?;

        let old = Self::pte_read(table_va, idx);
        let size = arch::level_page_size(level);

        let mut allocated = None;
        let paddr = if arch::pte_present(old) {
            if !arch::pte_is_leaf(old, level) {
                // A table hierarchy already exists below the requested
                // mapping size.
                return Err(MapOneError::Fatal(KernelError::AlreadyMapped {
                    vaddr: va,
                    level,
                }));
            }
            if !flags.contains(PageOpFlags::KEEP_PTES) && mapper.is_none() {
                return Err(MapOneError::Fatal(KernelError::AlreadyMapped {
                    vaddr: va,
                    level,
                }));
            }
            // Reuse the present mapping's physical address; only protection
            // and cacheability change.
            arch::pte_paddr(old, level)
        } else {
            match pa {
                Some(p) => p,
                None => {
                    let frames = (size >> PAGE_SHIFT) as usize;
                    match self.fa.alloc(frames, size) {
                        Ok(p) => {
                            allocated = Some(p);
                            p.as_u64()
                        }
                        Err(e) => {
                            if level > arch::PAGE_LEVEL
                                && !flags.contains(PageOpFlags::FORCE_SIZE)
                            {
                                // No contiguous run of this size; retry with
                                // smaller pages.
                                return Err(MapOneError::Retry);
                            }
                            return Err(MapOneError::Fatal(e));
                        }
                    }
                }
            }
        };

        let mut pte = arch::pte_create(paddr, attr, level, old);

        if let Some(mapper) = mapper {
            match mapper(va, level, &mut pte) {
                Ok(MapDecision::Apply) => {}
                Ok(MapDecision::Skip) => {
                    if let Some(p) = allocated {
                        let _ = self.fa.free(p, (size >> PAGE_SHIFT) as usize);
                    }
                    return Ok(());
                }
                Ok(MapDecision::TooBig) => {
                    if let Some(p) = allocated {
                        let _ = self.fa.free(p, (size >> PAGE_SHIFT) as usize);
                    }
                    if flags.contains(PageOpFlags::FORCE_SIZE) || level == arch::PAGE_LEVEL {
                        return Err(MapOneError::Fatal(KernelError::InvalidArgument {
                            what: "mapper demanded a smaller size than allowed",
                        }));
                    }
                    if arch::pte_present(old) && arch::pte_is_leaf(old, level) {
                        let walk = Walk {
                            level,
                            pt_vaddr: table_va,
                            pte: old,
                        };
                        self.split_leaf(va, &walk).map_err(MapOneError::Fatal)?;
                    }
                    return Err(MapOneError::Retry);
                }
                Err(e) => {
                    if let Some(p) = allocated {
                        let _ = self.fa.free(p, (size >> PAGE_SHIFT) as usize);
                    }
                    return Err(MapOneError::Fatal(e));
                }
            }
        }

        Self::pte_write(table_va, idx, pte);
        arch::tlb_flush_page(va);
        Ok(())
    }

    /// Split the present leaf described by `walk` into a table of
    /// next-smaller pages, preserving the mapping and its attributes.
    fn split_leaf(&self, vaddr: u64, walk: &Walk) -> KernelResult<()> {
        debug_assert!(walk.level > arch::PAGE_LEVEL);
        debug_assert!(walk.present());

        let child_level = walk.level - 1;
        let child_size = arch::level_page_size(child_level);
        let old_paddr = arch::pte_paddr(walk.pte, walk.level);
        let attr = arch::pte_attr(walk.pte);

        let table = Self::alloc_table_frame(self.fa)?;
        let table_va = self.fa.directmap(table)?;
        for i in 0..arch::PT_ENTRIES {
            let pte = arch::pte_create(
                old_paddr + (i as u64) * child_size,
                attr,
                child_level,
                walk.pte,
            );
            Self::pte_write(table_va, i, pte);
        }

        let idx = arch::pt_index(vaddr, walk.level);
        Self::pte_write(walk.pt_vaddr, idx, arch::pte_table(table.as_u64()));
        arch::tlb_flush_page(vaddr);
        Ok(())
    }

    /// Build the table hierarchy under the kmap window so kmap itself never
    /// allocates.
    fn prebuild_kmap_window(&self) -> KernelResult<()> {
        let end = arch::KMAP_BASE + (arch::KMAP_PAGES_MAX as u64) * PAGE_SIZE as u64;
        let mut va = arch::KMAP_BASE;
        while va < end {
            match self.walk_create(va, arch::PAGE_LEVEL, false) {
                Ok(_) => {}
                Err(MapOneError::Fatal(e)) => return Err(e),
                Err(MapOneError::Retry) => unreachable!("walk_create does not retry"),
            }
            // One leaf table covers 512 slots; step by its coverage.
            va += arch::level_page_size(arch::PAGE_LEVEL + 1);
        }
        Ok(())
    }

    fn kmap_reserve(&self, pages: usize) -> KernelResult<usize> {
        let mut slots = self.kmap_slots.lock();
        let mut run = 0;
        for slot in 0..arch::KMAP_PAGES_MAX {
            if slots[slot / 64] & (1 << (slot % 64)) == 0 {
                run += 1;
                if run == pages {
                    let first = slot + 1 - pages;
                    for s in first..=slot {
                        slots[s / 64] |= 1 << (s % 64);
                    }
                    return Ok(first);
                }
            } else {
                run = 0;
            }
        }
        Err(KernelError::OutOfMemory {
            requested: pages * PAGE_SIZE,
        })
    }

    fn kmap_release(&self, first: usize, pages: usize) {
        let mut slots = self.kmap_slots.lock();
        for s in first..first + pages {
            slots[s / 64] &= !(1 << (s % 64));
        }
    }
}

/// Internal error distinguishing retry-with-smaller-size from hard failure
enum MapOneError {
    Retry,
    Fatal(KernelError),
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::frame_alloc::tests::TestArena;

    fn setup(pages: usize) -> (TestArena, FrameAllocator) {
        let arena = TestArena::new(0x40_0000, pages * PAGE_SIZE);
        let fa = FrameAllocator::new();
        (arena, fa)
    }

    fn new_pt<'a>(arena: &TestArena, fa: &'a FrameAllocator) -> PageTable<'a> {
        PageTable::new(fa, arena.start, arena.len, arena.dm_off)
            .expect("page table construction from a fresh arena should succeed")
    }

    #[test]
    fn init_direct_maps_donated_range() {
        let (arena, fa) = setup(128);
        let pt = new_pt(&arena, &fa);

        // A page in the middle of the donated range must be reachable
        // through the direct map.
        let probe = arena.start.as_u64() + 64 * PAGE_SIZE as u64;
        let walk = pt
            .walk(probe.wrapping_add(arena.dm_off))
            .expect("walk of a direct-mapped address");
        assert!(walk.present(), "direct map must cover the donated range");
        assert_eq!(walk.paddr().map(|p| p.as_u64()), Some(probe));
    }

    #[test]
    fn map_anonymous_base_page() {
        let (arena, fa) = setup(128);
        let pt = new_pt(&arena, &fa);

        let va = 0x2000_0000_0000u64;
        pt.map(va, None, 1, PageAttr::RW, PageOpFlags::NONE)
            .expect("mapping one anonymous base page should succeed");

        let walk = pt.walk(va).expect("walk");
        assert!(walk.present());
        assert_eq!(walk.level, 0);
        let attr = walk.attr().expect("attributes of a present mapping");
        assert!(attr.contains(PageAttr::WRITE));
        assert!(!attr.contains(PageAttr::EXEC), "RW mapping must not be executable");

        // The backing frame must come from the donated range.
        let paddr = walk.paddr().expect("present mapping has a paddr");
        assert!(fa.owns(paddr), "anonymous frames must come from the frame allocator");
    }

    #[test]
    fn map_unmap_roundtrip_leaves_nothing() {
        let (arena, fa) = setup(128);
        let pt = new_pt(&arena, &fa);
        let free_before = fa.free_frames();

        let va = 0x2000_0000_0000u64;
        pt.map(va, None, 8, PageAttr::RW, PageOpFlags::NONE)
            .expect("map");
        pt.unmap(va, 8, PageOpFlags::NONE).expect("unmap");

        for i in 0..8u64 {
            let walk = pt.walk(va + i * PAGE_SIZE as u64).expect("walk");
            assert!(!walk.present(), "page {} must be unmapped", i);
        }
        // Anonymous frames were given back; only the intermediate tables
        // remain allocated.
        assert!(fa.free_frames() >= free_before - 3);
    }

    #[test]
    fn unmap_keep_frames_preserves_allocation() {
        let (arena, fa) = setup(128);
        let pt = new_pt(&arena, &fa);

        let frame = fa.alloc(1, PAGE_SIZE as u64).expect("frame");
        let va = 0x3000_0000_0000u64;
        pt.map(va, Some(frame), 1, PageAttr::RW, PageOpFlags::NONE)
            .expect("map");
        pt.unmap(va, 1, PageOpFlags::KEEP_FRAMES).expect("unmap");

        // Still allocated: a second free must succeed exactly once.
        fa.free(frame, 1)
            .expect("frame must still be allocated after KEEP_FRAMES unmap");
    }

    #[test]
    fn set_attr_last_writer_wins() {
        let (arena, fa) = setup(128);
        let pt = new_pt(&arena, &fa);

        let va = 0x2000_0000_0000u64;
        pt.map(va, None, 4, PageAttr::RW, PageOpFlags::NONE)
            .expect("map");
        pt.set_attr(va, 4, PageAttr::READ | PageAttr::EXEC, PageOpFlags::NONE)
            .expect("first set_attr");
        pt.set_attr(va, 4, PageAttr::READ, PageOpFlags::NONE)
            .expect("second set_attr");

        let attr = pt.walk(va).expect("walk").attr().expect("present");
        assert!(!attr.contains(PageAttr::WRITE));
        assert!(!attr.contains(PageAttr::EXEC), "attributes must reflect the last change");
    }

    #[test]
    fn map_over_present_requires_keep_ptes_or_mapper() {
        let (arena, fa) = setup(128);
        let pt = new_pt(&arena, &fa);

        let va = 0x2000_0000_0000u64;
        pt.map(va, None, 1, PageAttr::RW, PageOpFlags::NONE)
            .expect("map");
        let original = pt.walk(va).expect("walk").paddr().expect("present");

        assert!(matches!(
            pt.map(va, None, 1, PageAttr::READ, PageOpFlags::NONE),
            Err(KernelError::AlreadyMapped { .. })
        ));

        // KEEP_PTES reuses the existing frame and only rewrites protection.
        pt.map(va, None, 1, PageAttr::READ, PageOpFlags::KEEP_PTES)
            .expect("remap with KEEP_PTES");
        let walk = pt.walk(va).expect("walk");
        assert_eq!(walk.paddr(), Some(original));
        assert!(!walk.attr().expect("present").contains(PageAttr::WRITE));
    }

    #[test]
    fn force_size_with_misaligned_vaddr_is_rejected() {
        let (arena, fa) = setup(128);
        let pt = new_pt(&arena, &fa);

        let result = pt.map(
            0x2000_0000_1000u64,
            None,
            1,
            PageAttr::RW,
            PageOpFlags::FORCE_SIZE | PageOpFlags::size(2),
        );
        assert!(matches!(result, Err(KernelError::InvalidArgument { .. })));
    }

    #[test]
    fn large_page_used_when_aligned() {
        // 2 MiB of frames plus room for metadata and tables.
        let (arena, fa) = setup(1024 + 64);
        let pt = new_pt(&arena, &fa);

        let va = 0x2000_0020_0000u64; // 2 MiB aligned
        pt.map(va, None, 512, PageAttr::RW, PageOpFlags::NONE)
            .expect("mapping 512 base pages at an aligned address");

        let walk = pt.walk(va).expect("walk");
        assert!(walk.present());
        assert_eq!(walk.level, 1, "an aligned 2 MiB range should use a large page");
    }

    #[test]
    fn mapper_skip_leaves_slot_unmapped() {
        let (arena, fa) = setup(128);
        let pt = new_pt(&arena, &fa);

        let va = 0x2000_0000_0000u64;
        let mut skipped = 0;
        let mut mapper = |_va: u64, _level: usize, _pte: &mut u64| {
            skipped += 1;
            Ok(MapDecision::Skip)
        };
        pt.mapx(va, None, 2, PageAttr::RW, PageOpFlags::NONE, Some(&mut mapper))
            .expect("mapx with a skipping mapper");

        assert_eq!(skipped, 2);
        assert!(!pt.walk(va).expect("walk").present());
    }

    #[test]
    fn mapper_toobig_forces_smaller_pages() {
        let (arena, fa) = setup(1024 + 64);
        let pt = new_pt(&arena, &fa);

        let va = 0x2000_0020_0000u64;
        let mut mapper = |_va: u64, level: usize, _pte: &mut u64| {
            if level > 0 {
                Ok(MapDecision::TooBig)
            } else {
                Ok(MapDecision::Apply)
            }
        };
        pt.mapx(va, None, 512, PageAttr::RW, PageOpFlags::NONE, Some(&mut mapper))
            .expect("mapx with a TooBig mapper");

        let walk = pt.walk(va).expect("walk");
        assert_eq!(walk.level, 0, "mapper veto must force base pages");
    }

    #[test]
    fn split_preserves_surrounding_mapping() {
        let (arena, fa) = setup(1024 + 64);
        let pt = new_pt(&arena, &fa);

        let va = 0x2000_0020_0000u64;
        pt.map(va, None, 512, PageAttr::RW, PageOpFlags::NONE)
            .expect("large mapping");
        let before = pt.walk(va).expect("walk").paddr().expect("present");

        // Changing one base page inside the large page splits it.
        pt.set_attr(
            va + 0x1000,
            1,
            PageAttr::READ,
            PageOpFlags::FORCE_SIZE | PageOpFlags::size(0),
        )
        .expect("set_attr on a sub-page of a large mapping");

        let changed = pt.walk(va + 0x1000).expect("walk");
        assert_eq!(changed.level, 0);
        assert!(!changed.attr().expect("present").contains(PageAttr::WRITE));

        // Neighbours keep the old attributes and stay contiguous with the
        // original physical range.
        let neighbour = pt.walk(va).expect("walk");
        assert_eq!(neighbour.level, 0);
        assert!(neighbour.attr().expect("present").contains(PageAttr::WRITE));
        assert_eq!(neighbour.paddr(), Some(before));
        let far = pt.walk(va + 0x3000).expect("walk");
        assert_eq!(
            far.paddr().map(|p| p.as_u64()),
            Some(before.as_u64() + 0x3000)
        );
    }

    #[test]
    fn kmap_roundtrip() {
        let (arena, fa) = setup(128);
        let pt = new_pt(&arena, &fa);

        let frame = fa.alloc(1, PAGE_SIZE as u64).expect("frame");
        let va = pt.kmap(frame, 1).expect("kmap should not fail while slots remain");
        assert!(va.as_u64() >= crate::arch::paging::KMAP_BASE);

        let walk = pt.walk(va.as_u64()).expect("walk");
        assert_eq!(walk.paddr(), Some(frame));

        pt.kunmap(va, 1).expect("kunmap");
        assert!(!pt.walk(va.as_u64()).expect("walk").present());

        // The slot is reusable afterwards.
        let va2 = pt.kmap(frame, 1).expect("kmap after kunmap");
        assert_eq!(va, va2, "released slots should be reused first-fit");
        pt.kunmap(va2, 1).expect("kunmap");
    }

    #[test]
    fn kmap_exhaustion() {
        let (arena, fa) = setup(256);
        let pt = new_pt(&arena, &fa);
        let frame = fa.alloc(1, PAGE_SIZE as u64).expect("frame");

        let mut held = std::vec::Vec::new();
        for _ in 0..crate::arch::paging::KMAP_PAGES_MAX {
            held.push(pt.kmap(frame, 1).expect("kmap within the slot budget"));
        }
        assert!(
            pt.kmap(frame, 1).is_err(),
            "kmap beyond the in-flight limit must fail"
        );
        for va in held {
            pt.kunmap(va, 1).expect("kunmap");
        }
    }

    #[test]
    fn clone_inherit_shares_mappings() {
        let (arena, fa) = setup(256);
        let pt = new_pt(&arena, &fa);
        let va = 0x2000_0000_0000u64;
        pt.map(va, None, 1, PageAttr::RW, PageOpFlags::NONE)
            .expect("map");

        let clone = PageTable::clone_from(&pt, CloneMode::Inherit).expect("clone");
        assert!(clone.walk(va).expect("walk").present());
        assert_ne!(clone.root(), pt.root());

        let empty = PageTable::clone_from(&pt, CloneMode::Empty).expect("empty clone");
        assert!(!empty.walk(va).expect("walk").present());
    }

    #[test]
    fn free_returns_table_and_leaf_frames() {
        let (arena, fa) = setup(256);
        let pt = new_pt(&arena, &fa);
        let va = 0x2000_0000_0000u64;
        pt.map(va, None, 16, PageAttr::RW, PageOpFlags::NONE)
            .expect("map");

        let free_before_teardown = fa.free_frames();
        pt.free(PageOpFlags::NONE).expect("teardown");
        assert!(
            fa.free_frames() > free_before_teardown,
            "teardown must return page-table and leaf frames"
        );
    }
}
