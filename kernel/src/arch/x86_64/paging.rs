//! x86_64 page-table entry construction and decoding
//!
//! Four-level paging with 4 KiB base pages, 2 MiB large pages, and 1 GiB
//! huge pages. The generic walker in [`crate::mm::paging`] drives these
//! helpers with a runtime level, 0 being the leaf (4 KiB) level.

use crate::mm::paging::PageAttr;

/// Number of page-table levels
pub const PT_LEVELS: usize = 4;

/// Entries per page table
pub const PT_ENTRIES: usize = 512;

/// Base page level (4 KiB)
pub const PAGE_LEVEL: usize = 0;

/// Largest level at which leaf mappings are allowed (1 GiB)
pub const LEAF_LEVEL_MAX: usize = 2;

/// Start of the direct-map window (-512 GiB). Physical memory donated to a
/// page table's frame allocator is also mapped here so that page-table
/// pages can be read and written by address arithmetic.
pub const DIRECTMAP_BASE: u64 = 0xffff_ff80_0000_0000;

/// Size of the direct-map window
pub const DIRECTMAP_SIZE: u64 = 0x0000_0080_0000_0000;

/// Start of the fixed kmap window, directly below the direct map
pub const KMAP_BASE: u64 = 0xffff_ff7f_f000_0000;

/// Maximum number of base pages concurrently mapped through the kmap window
pub const KMAP_PAGES_MAX: usize = 64;

const PTE_PRESENT: u64 = 1 << 0;
const PTE_RW: u64 = 1 << 1;
const PTE_US: u64 = 1 << 2;
const PTE_PWT: u64 = 1 << 3;
const PTE_PCD: u64 = 1 << 4;
const PTE_ACCESSED: u64 = 1 << 5;
const PTE_DIRTY: u64 = 1 << 6;
const PTE_PSE: u64 = 1 << 7;
const PTE_GLOBAL: u64 = 1 << 8;
const PTE_NX: u64 = 1 << 63;

const PTE_PADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

/// Bits preserved from an existing PTE when its protection is rewritten
/// (user bit, accessed/dirty, global, and the software-available bits).
const PTE_TEMPLATE_MASK: u64 =
    PTE_US | PTE_ACCESSED | PTE_DIRTY | PTE_GLOBAL | 0x7ff0_0000_0000_0000 | (0x7 << 9);

/// log2 of the page size mapped by a leaf at `level`
pub const fn level_shift(level: usize) -> usize {
    12 + 9 * level
}

/// Bytes mapped by a leaf at `level`
pub const fn level_page_size(level: usize) -> u64 {
    1u64 << level_shift(level)
}

/// Index into the table at `level` for `vaddr`
pub const fn pt_index(vaddr: u64, level: usize) -> usize {
    ((vaddr >> level_shift(level)) & (PT_ENTRIES as u64 - 1)) as usize
}

/// Whether the architecture allows a leaf mapping at `level`
pub const fn level_is_leaf_capable(level: usize) -> bool {
    level <= LEAF_LEVEL_MAX
}

/// Construct a leaf PTE mapping `paddr` with `attr` at `level`.
///
/// The present bit is always set; attribute `NONE` (empty) therefore maps
/// readable-but-not-writable-not-executable, which is the closest this
/// architecture comes to an inaccessible-but-mapped page. `template`
/// carries the user and software-managed bits of a PTE being replaced.
pub fn pte_create(paddr: u64, attr: PageAttr, level: usize, template: u64) -> u64 {
    debug_assert_eq!(paddr & (level_page_size(level) - 1), 0);

    let mut pte = (paddr & PTE_PADDR_MASK) | PTE_PRESENT;

    if level > PAGE_LEVEL {
        pte |= PTE_PSE;
    }
    if attr.contains(PageAttr::WRITE) {
        pte |= PTE_RW;
    }
    if !attr.contains(PageAttr::EXEC) {
        pte |= PTE_NX;
    }
    if attr.contains(PageAttr::WRITECOMBINE) {
        pte |= PTE_PCD | PTE_PWT;
    }

    pte | (template & PTE_TEMPLATE_MASK)
}

/// Construct a non-leaf PTE referencing the next-level table at `paddr`.
/// Intermediate entries are maximally permissive; restrictions live in the
/// leaves.
pub fn pte_table(paddr: u64) -> u64 {
    (paddr & PTE_PADDR_MASK) | PTE_PRESENT | PTE_RW
}

pub const fn pte_present(pte: u64) -> bool {
    pte & PTE_PRESENT != 0
}

/// Whether a present PTE at `level` is a leaf (terminal) mapping
pub const fn pte_is_leaf(pte: u64, level: usize) -> bool {
    level == PAGE_LEVEL || pte & PTE_PSE != 0
}

/// Physical address a leaf PTE at `level` maps, or a table PTE references
pub const fn pte_paddr(pte: u64, level: usize) -> u64 {
    pte & PTE_PADDR_MASK & !(level_page_size(level) - 1)
}

/// Decode the abstract attributes of a leaf PTE
pub fn pte_attr(pte: u64) -> PageAttr {
    let mut attr = PageAttr::READ;
    if pte & PTE_RW != 0 {
        attr |= PageAttr::WRITE;
    }
    if pte & PTE_NX == 0 {
        attr |= PageAttr::EXEC;
    }
    if pte & PTE_PCD != 0 && pte & PTE_PWT != 0 {
        attr |= PageAttr::WRITECOMBINE;
    }
    attr
}

/// Invalidate the TLB entry for `vaddr` on the executing CPU. Cross-CPU
/// coherence is the caller's responsibility.
#[inline]
pub fn tlb_flush_page(vaddr: u64) {
    #[cfg(target_os = "none")]
    x86_64::instructions::tlb::flush(x86_64::VirtAddr::new_truncate(vaddr));
    #[cfg(not(target_os = "none"))]
    let _ = vaddr;
}

/// Invalidate the whole TLB on the executing CPU
#[inline]
pub fn tlb_flush_all() {
    #[cfg(target_os = "none")]
    x86_64::instructions::tlb::flush_all();
}

/// Physical address of the active top-level page table
pub fn active_pt_root() -> u64 {
    #[cfg(target_os = "none")]
    {
        let (frame, _) = x86_64::registers::control::Cr3::read();
        frame.start_address().as_u64()
    }
    #[cfg(not(target_os = "none"))]
    {
        0
    }
}

/// Install `root` as the active top-level page table.
///
/// # Safety
///
/// `root` must be the physical address of a valid, populated top-level page
/// table that maps the executing code at its current virtual address.
pub unsafe fn set_active_pt_root(root: u64) {
    #[cfg(target_os = "none")]
    {
        use x86_64::registers::control::{Cr3, Cr3Flags};
        use x86_64::structures::paging::PhysFrame;
        let frame = PhysFrame::from_start_address(x86_64::PhysAddr::new(root))
            .expect("page table root must be page aligned");
        // SAFETY: Caller guarantees `root` is a valid top-level table that
        // keeps the current instruction stream mapped.
        unsafe { Cr3::write(frame, Cr3Flags::empty()) };
    }
    #[cfg(not(target_os = "none"))]
    let _ = root;
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn pte_roundtrip() {
        let pte = pte_create(0x20_0000, PageAttr::READ | PageAttr::WRITE, 1, 0);
        assert!(pte_present(pte));
        assert!(pte_is_leaf(pte, 1));
        assert_eq!(pte_paddr(pte, 1), 0x20_0000);
        let attr = pte_attr(pte);
        assert!(attr.contains(PageAttr::WRITE));
        assert!(!attr.contains(PageAttr::EXEC));
    }

    #[test]
    fn base_level_pte_has_no_pse() {
        let pte = pte_create(0x1000, PageAttr::READ, 0, 0);
        assert_eq!(pte & PTE_PSE, 0);
        assert!(pte & PTE_NX != 0, "non-exec mapping must carry NX");
    }

    #[test]
    fn writecombine_sets_pcd_pwt() {
        let pte = pte_create(0x1000, PageAttr::READ | PageAttr::WRITECOMBINE, 0, 0);
        assert!(pte & PTE_PCD != 0 && pte & PTE_PWT != 0);
        assert!(pte_attr(pte).contains(PageAttr::WRITECOMBINE));
    }

    #[test]
    fn template_bits_survive() {
        let template = PTE_US | PTE_GLOBAL | PTE_ACCESSED;
        let pte = pte_create(0x1000, PageAttr::READ, 0, template);
        assert!(pte & PTE_US != 0);
        assert!(pte & PTE_GLOBAL != 0);
    }

    #[test]
    fn index_decomposition() {
        let vaddr = 0x0000_2000_0030_5000u64;
        assert_eq!(pt_index(vaddr, 0), (vaddr >> 12) as usize & 511);
        assert_eq!(pt_index(vaddr, 3), (vaddr >> 39) as usize & 511);
        assert_eq!(level_page_size(1), 0x20_0000);
        assert_eq!(level_page_size(2), 0x4000_0000);
    }
}
