//! AArch64 page-table entry construction and decoding (4 KiB granule)
//!
//! Four translation levels with block mappings at 2 MiB and 1 GiB. The
//! level numbering matches the generic walker: 0 is the leaf (page) level,
//! 3 the top. Descriptors use the stage-1 EL1 format with the MAIR indices
//! fixed by the boot shim: index 0 = normal write-back memory, index 1 =
//! device-nGnRnE, index 2 = normal non-cacheable (write-combine).

use crate::mm::paging::PageAttr;

/// Number of page-table levels
pub const PT_LEVELS: usize = 4;

/// Entries per page table
pub const PT_ENTRIES: usize = 512;

/// Base page level (4 KiB)
pub const PAGE_LEVEL: usize = 0;

/// Largest level at which block mappings are allowed (1 GiB)
pub const LEAF_LEVEL_MAX: usize = 2;

/// Start of the direct-map window (TTBR1 upper range)
pub const DIRECTMAP_BASE: u64 = 0xffff_ff80_0000_0000;

/// Size of the direct-map window
pub const DIRECTMAP_SIZE: u64 = 0x0000_0080_0000_0000;

/// Start of the fixed kmap window, directly below the direct map
pub const KMAP_BASE: u64 = 0xffff_ff7f_f000_0000;

/// Maximum number of base pages concurrently mapped through the kmap window
pub const KMAP_PAGES_MAX: usize = 64;

const PTE_VALID: u64 = 1 << 0;
/// At the leaf level: page descriptor; at upper levels: table descriptor
const PTE_TYPE_BIT: u64 = 1 << 1;
const PTE_ATTR_IDX_SHIFT: u64 = 2;
const PTE_AP_RO: u64 = 1 << 7;
const PTE_SH_INNER: u64 = 3 << 8;
const PTE_AF: u64 = 1 << 10;
const PTE_PXN: u64 = 1 << 53;
const PTE_UXN: u64 = 1 << 54;

const PTE_PADDR_MASK: u64 = 0x0000_ffff_ffff_f000;

/// MAIR index for normal write-back memory
const ATTR_IDX_NORMAL: u64 = 0;
/// MAIR index for normal non-cacheable (write-combine) memory
const ATTR_IDX_NORMAL_NC: u64 = 2;

/// Software and accessed/dirty-class bits preserved from a replaced PTE
const PTE_TEMPLATE_MASK: u64 = (0xF << 55) | (1 << 51) | (1 << 11);

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

/// Construct a leaf PTE mapping `paddr` with `attr` at `level`
pub fn pte_create(paddr: u64, attr: PageAttr, level: usize, template: u64) -> u64 {
    debug_assert_eq!(paddr & (level_page_size(level) - 1), 0);

    let mut pte = (paddr & PTE_PADDR_MASK) | PTE_VALID | PTE_AF | PTE_SH_INNER;

    // Level 0 uses page descriptors (type bit set); upper levels use block
    // descriptors (type bit clear).
    if level == PAGE_LEVEL {
        pte |= PTE_TYPE_BIT;
    }
    if !attr.contains(PageAttr::WRITE) {
        pte |= PTE_AP_RO;
    }
    if !attr.contains(PageAttr::EXEC) {
        pte |= PTE_PXN | PTE_UXN;
    }
    let attr_idx = if attr.contains(PageAttr::WRITECOMBINE) {
        ATTR_IDX_NORMAL_NC
    } else {
        ATTR_IDX_NORMAL
    };
    pte |= attr_idx << PTE_ATTR_IDX_SHIFT;

    pte | (template & PTE_TEMPLATE_MASK)
}

/// Construct a table descriptor referencing the next-level table
pub fn pte_table(paddr: u64) -> u64 {
    (paddr & PTE_PADDR_MASK) | PTE_VALID | PTE_TYPE_BIT
}

pub const fn pte_present(pte: u64) -> bool {
    pte & PTE_VALID != 0
}

/// Whether a present PTE at `level` terminates the walk
pub const fn pte_is_leaf(pte: u64, level: usize) -> bool {
    // Block descriptors have the type bit clear; at level 0 every valid
    // descriptor is a page.
    level == PAGE_LEVEL || pte & PTE_TYPE_BIT == 0
}

/// Physical address a leaf PTE at `level` maps, or a table PTE references
pub const fn pte_paddr(pte: u64, level: usize) -> u64 {
    pte & PTE_PADDR_MASK & !(level_page_size(level) - 1)
}

/// Decode the abstract attributes of a leaf PTE
pub fn pte_attr(pte: u64) -> PageAttr {
    let mut attr = PageAttr::READ;
    if pte & PTE_AP_RO == 0 {
        attr |= PageAttr::WRITE;
    }
    if pte & (PTE_PXN | PTE_UXN) == 0 {
        attr |= PageAttr::EXEC;
    }
    if (pte >> PTE_ATTR_IDX_SHIFT) & 0x7 == ATTR_IDX_NORMAL_NC {
        attr |= PageAttr::WRITECOMBINE;
    }
    attr
}

/// Invalidate the TLB entry for `vaddr` on the executing CPU
#[inline]
pub fn tlb_flush_page(vaddr: u64) {
    #[cfg(target_os = "none")]
    // SAFETY: TLBI VAAE1IS with a page-aligned VA operand only drops
    // translations; DSB/ISB order the invalidation against later accesses.
    unsafe {
        core::arch::asm!(
            "dsb ishst",
            "tlbi vaae1is, {page}",
            "dsb ish",
            "isb",
            page = in(reg) vaddr >> 12,
            options(nostack)
        );
    }
    #[cfg(not(target_os = "none"))]
    let _ = vaddr;
}

/// Invalidate the whole TLB on the executing CPU
#[inline]
pub fn tlb_flush_all() {
    #[cfg(target_os = "none")]
    // SAFETY: Full EL1 TLB invalidation; only drops cached translations.
    unsafe {
        core::arch::asm!("dsb ishst", "tlbi vmalle1is", "dsb ish", "isb", options(nostack));
    }
}

/// Physical address of the active upper-range translation table
pub fn active_pt_root() -> u64 {
    #[cfg(target_os = "none")]
    {
        let ttbr1: u64;
        // SAFETY: Reading TTBR1_EL1 has no side effects.
        unsafe {
            core::arch::asm!("mrs {}, ttbr1_el1", out(reg) ttbr1, options(nomem, nostack));
        }
        ttbr1 & 0x0000_ffff_ffff_fffe
    }
    #[cfg(not(target_os = "none"))]
    {
        0
    }
}

/// Install `root` as the active upper-range translation table.
///
/// # Safety
///
/// `root` must be the physical address of a valid, populated top-level
/// table that maps the executing code at its current virtual address.
pub unsafe fn set_active_pt_root(root: u64) {
    #[cfg(target_os = "none")]
    // SAFETY: Caller guarantees the table is valid; the barrier sequence
    // makes the switch architecturally complete before returning.
    unsafe {
        core::arch::asm!(
            "msr ttbr1_el1, {root}",
            "isb",
            "tlbi vmalle1is",
            "dsb ish",
            "isb",
            root = in(reg) root,
            options(nostack)
        );
    }
    #[cfg(not(target_os = "none"))]
    let _ = root;
}
