//! Memory-region descriptor list
//!
//! The boot shim hands over a typed, ordered, non-overlapping description of
//! all physical memory ranges known at boot. The list is mutated (insert,
//! delete, coalesce) only until memory initialization completes and is
//! read-only afterwards; none of the operations here are thread-safe.
//!
//! Regions carry a priority for conflict resolution: `Reserved` ranges must
//! be preserved bit-exact, kernel resources (kernel image, initrd, command
//! line, stacks, device tree) rank below that, and `Free` ranges absorb all
//! adjustments. Overlap between two non-free regions of equal priority with
//! different flags means the boot shim handed us garbage; callers treat that
//! error as fatal.

use bitflags::bitflags;

use super::{align_down, align_up, range_contains, ranges_overlap, PAGE_SIZE};
use crate::error::{KernelError, KernelResult};

/// Maximum number of memory region descriptors in a list
pub const MAX_MEMREGIONS: usize = 64;

/// Type of a memory region. The values double as bits in the type masks
/// accepted by [`MemRegionList::iter_filtered`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MemRegionType {
    /// Available for use
    Free = 0x0001,
    /// Must not be touched (firmware, MMIO holes)
    Reserved = 0x0002,
    /// Kernel image
    Kernel = 0x0004,
    /// Initial ramdisk
    Initrd = 0x0008,
    /// Kernel command line
    Cmdline = 0x0010,
    /// Boot or per-CPU stack
    Stack = 0x0020,
    /// Flattened device tree blob
    DeviceTree = 0x0040,
    /// Allocated at boot time via [`MemRegionList::alloc`]
    Allocated = 0x0080,
}

impl MemRegionType {
    /// Priority for conflict resolution during coalescing. Higher values
    /// win; the losing region is shrunk, split, or dropped.
    pub const fn priority(&self) -> u8 {
        match self {
            MemRegionType::Free => 0,
            MemRegionType::Kernel
            | MemRegionType::Initrd
            | MemRegionType::Cmdline
            | MemRegionType::Stack
            | MemRegionType::DeviceTree
            | MemRegionType::Allocated => 1,
            MemRegionType::Reserved => 2,
        }
    }
}

bitflags! {
    /// Flags of a memory region (on-wire `u16`)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemRegionFlags: u16 {
        const READ         = 0x0001;
        const WRITE        = 0x0002;
        const EXEC         = 0x0004;
        /// Region must be mapped during paging initialization
        const MAP          = 0x0010;
        /// Region must be unmapped during paging initialization
        const UNMAP        = 0x0020;
        /// Map with write-combining cacheability
        const WRITECOMBINE = 0x0040;
    }
}

impl MemRegionFlags {
    /// The permission bits of the flags field
    pub const PERMS: MemRegionFlags = MemRegionFlags::READ
        .union(MemRegionFlags::WRITE)
        .union(MemRegionFlags::EXEC);
}

/// Memory region descriptor, in the boot hand-off layout: three `u64`
/// fields, two `u16` fields, padding zeroed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct MemRegionDesc {
    /// Virtual base; equals `pbase` unless an explicit remap was performed
    pub vbase: u64,
    /// Physical base
    pub pbase: u64,
    /// Length in bytes
    pub len: u64,
    /// Region type
    pub rtype: MemRegionType,
    /// Region flags
    pub flags: MemRegionFlags,
    /// Unused, zero
    pub pad: [u8; 4],
}

impl MemRegionDesc {
    pub const fn new(pbase: u64, len: u64, rtype: MemRegionType, flags: MemRegionFlags) -> Self {
        Self {
            vbase: pbase,
            pbase,
            len,
            rtype,
            flags,
            pad: [0; 4],
        }
    }

    /// Exclusive physical end address
    pub const fn pend(&self) -> u64 {
        self.pbase + self.len
    }

    fn overlaps(&self, other: &MemRegionDesc) -> bool {
        ranges_overlap(self.pbase, self.len, other.pbase, other.len)
    }

    fn contains(&self, other: &MemRegionDesc) -> bool {
        range_contains(self.pbase, self.len, other.pbase, other.len)
    }

    /// Round both endpoints outward to page granularity, returning the
    /// original `(pbase, len)` so non-free regions can be restored after
    /// conflict resolution.
    fn align_outward(&mut self) -> (u64, u64) {
        let original = (self.pbase, self.len);
        let pend = align_up(self.pbase + self.len, PAGE_SIZE as u64);
        self.pbase = align_down(self.pbase, PAGE_SIZE as u64);
        self.len = pend - self.pbase;
        original
    }

    fn restore(&mut self, original: (u64, u64)) {
        self.pbase = original.0;
        self.len = original.1;
    }
}

/// Boot-time address windows consulted by [`MemRegionList::alloc`]. Both are
/// `(base, len)` pairs in bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct BootWindows {
    /// Range covered by the static boot page tables. Bootstrap allocations
    /// must land inside it so the result is usable without a page-table
    /// update. `None` lifts the restriction.
    pub mapped: Option<(u64, u64)>,
    /// Range occupied by the kernel image. Allocations outside it need a
    /// mapping later and are flagged `MAP`.
    pub image: Option<(u64, u64)>,
}

/// Ordered, non-overlapping list of memory region descriptors
#[repr(C)]
pub struct MemRegionList {
    count: u32,
    pad: u32,
    mrds: [MemRegionDesc; MAX_MEMREGIONS],
}

impl MemRegionList {
    const EMPTY: MemRegionDesc =
        MemRegionDesc::new(0, 0, MemRegionType::Free, MemRegionFlags::empty());

    pub const fn new() -> Self {
        Self {
            count: 0,
            pad: 0,
            mrds: [Self::EMPTY; MAX_MEMREGIONS],
        }
    }

    pub const fn len(&self) -> usize {
        self.count as usize
    }

    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn get(&self, i: usize) -> Option<&MemRegionDesc> {
        if i < self.count as usize {
            Some(&self.mrds[i])
        } else {
            None
        }
    }

    pub fn get_mut(&mut self, i: usize) -> Option<&mut MemRegionDesc> {
        if i < self.count as usize {
            Some(&mut self.mrds[i])
        } else {
            None
        }
    }

    /// Insert `mrd` at its sorted position (ascending `pbase`, ties broken
    /// by ascending `len`). Does not coalesce. Returns the insertion index.
    pub fn insert(&mut self, mrd: MemRegionDesc) -> KernelResult<usize> {
        let count = self.count as usize;
        let mut i = 0;
        while i < count {
            let cur = &self.mrds[i];
            if cur.pbase > mrd.pbase || (cur.pbase == mrd.pbase && cur.len > mrd.len) {
                break;
            }
            i += 1;
        }
        self.insert_at(mrd, i)?;
        Ok(i)
    }

    /// Insert `mrd` at index `i`, shifting the tail up by one. Used by the
    /// coalescing pass to split a region in place.
    pub fn insert_at(&mut self, mrd: MemRegionDesc, i: usize) -> KernelResult<()> {
        let count = self.count as usize;
        if count == MAX_MEMREGIONS {
            return Err(KernelError::OutOfMemory {
                requested: core::mem::size_of::<MemRegionDesc>(),
            });
        }
        if i > count {
            return Err(KernelError::InvalidArgument {
                what: "memregion insert index",
            });
        }
        self.mrds.copy_within(i..count, i + 1);
        self.mrds[i] = mrd;
        self.count += 1;
        Ok(())
    }

    /// Remove entry `i`, shifting the tail down by one
    pub fn delete(&mut self, i: usize) -> KernelResult<()> {
        let count = self.count as usize;
        if i >= count {
            return Err(KernelError::InvalidArgument {
                what: "memregion delete index",
            });
        }
        self.mrds.copy_within(i + 1..count, i);
        self.count -= 1;
        Ok(())
    }

    /// Iterate regions whose type matches any bit in `type_mask` (0 matches
    /// everything), whose flags contain all of `flags_all`, and, if
    /// `flags_any` is non-empty, at least one bit of it.
    pub fn iter_filtered(
        &self,
        type_mask: u16,
        flags_all: MemRegionFlags,
        flags_any: MemRegionFlags,
    ) -> impl Iterator<Item = (usize, &MemRegionDesc)> {
        self.mrds[..self.count as usize]
            .iter()
            .enumerate()
            .filter(move |(_, m)| {
                (type_mask == 0 || (m.rtype as u16) & type_mask != 0)
                    && m.flags.contains(flags_all)
                    && (flags_any.is_empty() || m.flags.intersects(flags_any))
            })
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemRegionDesc> {
        self.mrds[..self.count as usize].iter()
    }

    fn swap_if_unordered(&mut self, l: usize, r: usize) {
        let (ml, mr) = (&self.mrds[l], &self.mrds[r]);
        if ml.pbase > mr.pbase || (ml.pbase == mr.pbase && ml.pend() > mr.pend()) {
            self.mrds.swap(l, r);
        }
    }

    /// Resolve the overlap between the lower-priority and the higher-priority
    /// of two adjacent regions. The higher-priority region is untouched; the
    /// lower-priority one is shrunk, split (inserting the suffix after `r`),
    /// or reduced to zero length for the caller to delete.
    fn fixup_overlap(&mut self, l: usize, r: usize) {
        let ml = self.mrds[l];
        let mr = self.mrds[r];

        if ml.rtype.priority() > mr.rtype.priority() {
            let mr = &mut self.mrds[r];
            if range_contains(ml.pbase, ml.len, mr.pbase, mr.len) {
                mr.len = 0;
            } else {
                // Keep only the tail of the right region that lies past the
                // left one.
                mr.len -= ml.pend() - mr.pbase;
                mr.pbase = ml.pend();
                mr.vbase = mr.pbase;
            }
        } else {
            if range_contains(mr.pbase, mr.len, ml.pbase, ml.len) {
                self.mrds[l].len = 0;
            } else {
                if ml.contains(&mr) {
                    // The left region extends past the right one on both
                    // sides: keep the prefix in place and re-insert the
                    // suffix after the right region. An insertion failure
                    // (list full) loses the suffix; there is nothing better
                    // to do with it at this point.
                    let suffix = MemRegionDesc {
                        vbase: mr.pend(),
                        pbase: mr.pend(),
                        len: ml.pend() - mr.pend(),
                        rtype: ml.rtype,
                        flags: ml.flags,
                        pad: [0; 4],
                    };
                    if self.insert_at(suffix, r + 1).is_err() {
                        log::warn!(
                            "memregion list full, dropping split suffix {:#x}-{:#x}",
                            suffix.pbase,
                            suffix.pend()
                        );
                    }
                }
                self.mrds[l].len = mr.pbase - ml.pbase;
            }
        }
    }

    /// Coalesce the list: order adjacent pairs, resolve overlaps by region
    /// priority, and merge contiguous or overlapping regions of equal
    /// priority and identical flags.
    ///
    /// Endpoints are compared at page granularity; the original endpoints of
    /// non-free regions are restored afterwards so exact kernel artifact
    /// addresses (e.g. the initrd) survive. Free regions keep the rounding.
    pub fn coalesce(&mut self) -> KernelResult<()> {
        let mut i = 0;
        while i + 1 < self.count as usize {
            self.swap_if_unordered(i, i + 1);

            let l_prio = self.mrds[i].rtype.priority();
            let r_prio = self.mrds[i + 1].rtype.priority();

            let l_orig = self.mrds[i].align_outward();
            let r_orig = self.mrds[i + 1].align_outward();

            let ml = self.mrds[i];
            let mr = self.mrds[i + 1];

            // Tracks the entry the C-era `ml` pointer refers to; restored
            // and vbase-synced at the end of the iteration.
            let cur = i;
            let mut deleted = true;

            if ml.overlaps(&mr) {
                if l_prio != r_prio {
                    // One of the two must be free; overlapping allocated
                    // regions of different priorities cannot be resolved.
                    if l_prio != 0 && r_prio != 0 {
                        return Err(KernelError::InvalidArgument {
                            what: "overlapping non-free memory regions",
                        });
                    }
                    self.fixup_overlap(i, i + 1);
                    if self.mrds[i].len == 0 {
                        self.delete(i)?;
                    } else if self.mrds[i + 1].len == 0 {
                        self.delete(i + 1)?;
                    } else {
                        i += 1;
                        deleted = false;
                    }
                } else if ml.flags != mr.flags {
                    return Err(KernelError::InvalidArgument {
                        what: "overlapping equal-priority regions with different flags",
                    });
                } else if mr.contains(&ml) {
                    self.delete(i)?;
                } else if ml.contains(&mr) {
                    self.delete(i + 1)?;
                } else {
                    // Partial overlap, same priority and flags: extend the
                    // left region to cover both and drop the right one.
                    let merged = &mut self.mrds[i];
                    merged.len = mr.pend() - merged.pbase;
                    self.delete(i + 1)?;
                }
            } else if ml.pend() == mr.pbase && l_prio == r_prio && ml.flags == mr.flags {
                self.mrds[i].len += mr.len;
                self.delete(i + 1)?;
            } else {
                i += 1;
                deleted = false;
            }

            if !deleted {
                // Only free regions may keep the page rounding; everything
                // else gets its exact endpoints back.
                if l_prio != 0 {
                    self.mrds[cur].restore(l_orig);
                }
                if r_prio != 0 {
                    self.mrds[cur + 1].restore(r_orig);
                }
            }

            self.mrds[cur].vbase = self.mrds[cur].pbase;
        }

        if !self.is_empty() {
            let last = i.min(self.count as usize - 1);
            self.mrds[last].vbase = self.mrds[last].pbase;
        }

        Ok(())
    }

    /// Bootstrap allocation: carve an aligned, page-granular slice of the
    /// requested size out of a free region that lies inside the mapped boot
    /// window. The only allocator available before the frame allocator
    /// exists.
    ///
    /// If the chosen slice consumes the free region entirely, the region is
    /// overwritten in place with the new type and flags so no zero-length
    /// descriptor is ever created. Returns the physical address of the
    /// allocation, or `None` if no suitable free region exists.
    pub fn alloc(
        &mut self,
        size: u64,
        rtype: MemRegionType,
        flags: MemRegionFlags,
        windows: &BootWindows,
    ) -> Option<u64> {
        if size == 0 {
            return None;
        }

        let window = windows.mapped.map(|(base, len)| {
            let start = align_down(base, PAGE_SIZE as u64);
            let end = start + align_down(len, PAGE_SIZE as u64);
            (start, end - start)
        });

        // The descriptor keeps the caller's exact size; the cut out of the
        // free region is page granular.
        let desired = size;
        let size = align_up(size, PAGE_SIZE as u64);

        for i in 0..self.count as usize {
            if self.mrds[i].rtype != MemRegionType::Free {
                continue;
            }
            let mrd = self.mrds[i];
            let pstart = align_up(mrd.pbase, PAGE_SIZE as u64);
            let pend = pstart + size;

            if let Some((win_start, win_len)) = window {
                if !range_contains(win_start, win_len, pstart, size) || pend > mrd.pend() {
                    continue;
                }
            } else if pend > mrd.pend() {
                continue;
            }

            if mrd.flags & MemRegionFlags::PERMS != MemRegionFlags::READ | MemRegionFlags::WRITE {
                return None;
            }

            let mut flags = flags;
            let inside_image = windows
                .image
                .map(|(base, len)| range_contains(base, len, pstart, size))
                .unwrap_or(false);
            if !inside_image {
                // Not backed by the already-mapped kernel image, so paging
                // init has to map it.
                flags |= MemRegionFlags::MAP;
            }

            if mrd.len - (pstart - mrd.pbase) == size {
                // The slice consumes the free region; overwrite it in place
                // instead of leaving a zero-length leftover.
                let m = &mut self.mrds[i];
                m.pbase = pstart;
                m.vbase = pstart;
                m.len = desired;
                m.rtype = rtype;
                m.flags = flags;
                return Some(pstart);
            }

            {
                let m = &mut self.mrds[i];
                m.len -= pend - m.pbase;
                m.pbase = pend;
                m.vbase = m.pbase;
            }

            let mut alloc_mrd = MemRegionDesc::new(pstart, desired, rtype, flags);
            alloc_mrd.flags |= MemRegionFlags::MAP;
            if self.insert(alloc_mrd).is_err() {
                // Roll the free region back so the failed allocation leaves
                // no trace.
                let m = &mut self.mrds[i];
                m.pbase = mrd.pbase;
                m.vbase = mrd.pbase;
                m.len = mrd.len;
                return None;
            }

            return Some(pstart);
        }

        None
    }
}

impl Default for MemRegionList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn free(pbase: u64, len: u64) -> MemRegionDesc {
        MemRegionDesc::new(pbase, len, MemRegionType::Free, MemRegionFlags::empty())
    }

    fn kernel(pbase: u64, len: u64) -> MemRegionDesc {
        MemRegionDesc::new(
            pbase,
            len,
            MemRegionType::Kernel,
            MemRegionFlags::READ | MemRegionFlags::EXEC,
        )
    }

    fn regions(list: &MemRegionList) -> std::vec::Vec<(u64, u64, MemRegionType)> {
        list.iter().map(|m| (m.pbase, m.len, m.rtype)).collect()
    }

    #[test]
    fn insert_keeps_order() {
        let mut list = MemRegionList::new();
        list.insert(free(0x4000, 0x1000)).expect("insert");
        list.insert(free(0x1000, 0x1000)).expect("insert");
        list.insert(free(0x1000, 0x3000)).expect("insert");
        let bases: std::vec::Vec<_> = list.iter().map(|m| (m.pbase, m.len)).collect();
        assert_eq!(bases, [(0x1000, 0x1000), (0x1000, 0x3000), (0x4000, 0x1000)]);
    }

    #[test]
    fn insert_then_delete_is_identity() {
        let mut list = MemRegionList::new();
        list.insert(free(0x1000, 0x1000)).expect("insert");
        list.insert(free(0x8000, 0x1000)).expect("insert");
        let before = regions(&list);

        let idx = list.insert(kernel(0x4000, 0x1000)).expect("insert");
        list.delete(idx).expect("delete");
        assert_eq!(regions(&list), before);
    }

    #[test]
    fn insert_full_list_fails() {
        let mut list = MemRegionList::new();
        for i in 0..MAX_MEMREGIONS as u64 {
            list.insert(free(i * 0x10000, 0x1000)).expect("insert");
        }
        assert!(matches!(
            list.insert(free(0xffff_0000, 0x1000)),
            Err(KernelError::OutOfMemory { .. })
        ));
    }

    #[test]
    fn coalesce_merges_contiguous_free() {
        // Two touching free regions collapse into one.
        let mut list = MemRegionList::new();
        list.insert(free(0x1000, 0x3000)).expect("insert");
        list.insert(free(0x4000, 0x1000)).expect("insert");
        list.coalesce().expect("coalesce");
        assert_eq!(regions(&list), [(0x1000, 0x4000, MemRegionType::Free)]);
    }

    #[test]
    fn coalesce_splits_free_around_kernel() {
        // A kernel region inside a free region splits it in three.
        let mut list = MemRegionList::new();
        list.insert(free(0x0, 0x10000)).expect("insert");
        list.insert(kernel(0x4000, 0x1000)).expect("insert");
        list.coalesce().expect("coalesce");
        assert_eq!(
            regions(&list),
            [
                (0x0, 0x4000, MemRegionType::Free),
                (0x4000, 0x1000, MemRegionType::Kernel),
                (0x5000, 0xB000, MemRegionType::Free),
            ]
        );
    }

    #[test]
    fn coalesce_merges_partial_overlap() {
        let mut list = MemRegionList::new();
        list.insert(free(0x1000, 0x3000)).expect("insert");
        list.insert(free(0x3000, 0x3000)).expect("insert");
        list.coalesce().expect("coalesce");
        assert_eq!(regions(&list), [(0x1000, 0x5000, MemRegionType::Free)]);
    }

    #[test]
    fn coalesce_is_idempotent() {
        let mut list = MemRegionList::new();
        list.insert(free(0x0, 0x10000)).expect("insert");
        list.insert(kernel(0x4000, 0x1000)).expect("insert");
        list.insert(free(0x10000, 0x4000)).expect("insert");
        list.coalesce().expect("coalesce");
        let once = regions(&list);
        list.coalesce().expect("coalesce");
        assert_eq!(regions(&list), once, "coalesce(coalesce(L)) == coalesce(L)");
    }

    #[test]
    fn coalesce_keeps_higher_priority_region_exact() {
        // A sub-page initrd overlapping free memory: the initrd endpoints
        // survive, the free region is trimmed to page granularity.
        let mut list = MemRegionList::new();
        list.insert(free(0x2000, 0x6000)).expect("insert");
        list.insert(MemRegionDesc::new(
            0x3100,
            0x0e00,
            MemRegionType::Initrd,
            MemRegionFlags::READ | MemRegionFlags::MAP,
        ))
        .expect("insert");
        list.coalesce().expect("coalesce");

        let initrd = list
            .iter()
            .find(|m| m.rtype == MemRegionType::Initrd)
            .expect("initrd region must survive coalescing");
        assert_eq!((initrd.pbase, initrd.len), (0x3100, 0x0e00));

        for m in list.iter().filter(|m| m.rtype == MemRegionType::Free) {
            assert_eq!(m.pbase % PAGE_SIZE as u64, 0);
            assert!(!ranges_overlap(m.pbase, m.len, 0x3000, 0x1000));
        }
    }

    #[test]
    fn coalesce_drops_free_contained_in_reserved() {
        let mut list = MemRegionList::new();
        list.insert(MemRegionDesc::new(
            0x1000,
            0x4000,
            MemRegionType::Reserved,
            MemRegionFlags::empty(),
        ))
        .expect("insert");
        list.insert(free(0x2000, 0x1000)).expect("insert");
        list.coalesce().expect("coalesce");
        assert_eq!(regions(&list), [(0x1000, 0x4000, MemRegionType::Reserved)]);
    }

    #[test]
    fn coalesce_rejects_equal_priority_flag_mismatch() {
        let mut list = MemRegionList::new();
        list.insert(free(0x1000, 0x2000)).expect("insert");
        let mut other = free(0x2000, 0x2000);
        other.flags = MemRegionFlags::READ;
        list.insert(other).expect("insert");
        assert!(matches!(
            list.coalesce(),
            Err(KernelError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn coalesce_orders_after_invariant() {
        let mut list = MemRegionList::new();
        list.insert(free(0x9000, 0x1000)).expect("insert");
        list.insert(free(0x1000, 0x1000)).expect("insert");
        list.insert(kernel(0x5000, 0x1000)).expect("insert");
        list.coalesce().expect("coalesce");

        let rs = regions(&list);
        for w in rs.windows(2) {
            assert!(
                w[0].0 + w[0].1 <= w[1].0,
                "regions must be ordered and disjoint after coalesce: {:?}",
                rs
            );
        }
        for m in list.iter() {
            assert_eq!(m.vbase, m.pbase);
        }
    }

    #[test]
    fn alloc_carves_tail_of_free_region() {
        let mut list = MemRegionList::new();
        let mut f = free(0x10000, 0x10000);
        f.flags = MemRegionFlags::READ | MemRegionFlags::WRITE;
        list.insert(f).expect("insert");

        let windows = BootWindows::default();
        let pstart = list
            .alloc(
                0x2000,
                MemRegionType::Stack,
                MemRegionFlags::READ | MemRegionFlags::WRITE,
                &windows,
            )
            .expect("allocation from a large free region should succeed");
        assert_eq!(pstart, 0x10000);

        // The free region shrank and the allocation was inserted.
        let stack = list
            .iter()
            .find(|m| m.rtype == MemRegionType::Stack)
            .expect("allocated region must appear in the list");
        assert_eq!((stack.pbase, stack.len), (0x10000, 0x2000));
        assert!(stack.flags.contains(MemRegionFlags::MAP));

        let f = list
            .iter()
            .find(|m| m.rtype == MemRegionType::Free)
            .expect("remainder of the free region must survive");
        assert_eq!((f.pbase, f.len), (0x12000, 0xE000));
    }

    #[test]
    fn alloc_overwrites_fully_consumed_region() {
        let mut list = MemRegionList::new();
        let mut f = free(0x10000, 0x2000);
        f.flags = MemRegionFlags::READ | MemRegionFlags::WRITE;
        list.insert(f).expect("insert");

        let windows = BootWindows::default();
        let pstart = list
            .alloc(
                0x2000,
                MemRegionType::Allocated,
                MemRegionFlags::READ | MemRegionFlags::WRITE,
                &windows,
            )
            .expect("exact-fit allocation should succeed");
        assert_eq!(pstart, 0x10000);
        assert_eq!(list.len(), 1, "no zero-length leftover may be created");
        assert_eq!(list.get(0).map(|m| m.rtype), Some(MemRegionType::Allocated));
    }

    #[test]
    fn alloc_respects_mapped_window() {
        let mut list = MemRegionList::new();
        let mut f = free(0x100000, 0x10000);
        f.flags = MemRegionFlags::READ | MemRegionFlags::WRITE;
        list.insert(f).expect("insert");

        // The only free region lies outside the mapped boot window.
        let windows = BootWindows {
            mapped: Some((0x0, 0x10000)),
            image: None,
        };
        assert_eq!(
            list.alloc(
                0x1000,
                MemRegionType::Stack,
                MemRegionFlags::READ | MemRegionFlags::WRITE,
                &windows,
            ),
            None
        );
    }

    #[test]
    fn alloc_without_free_region_fails() {
        let mut list = MemRegionList::new();
        list.insert(kernel(0x1000, 0x1000)).expect("insert");
        assert_eq!(
            list.alloc(
                0x1000,
                MemRegionType::Stack,
                MemRegionFlags::READ | MemRegionFlags::WRITE,
                &BootWindows::default(),
            ),
            None
        );
    }
}
