//! Page-granular physical frame allocator
//!
//! Owns one or more disjoint physical ranges donated from the memory-region
//! list. The allocation bitmap for each range is carved out of the first
//! frames of the range itself and is reached through the range's direct-map
//! offset, so the allocator has no memory needs of its own.
//!
//! Every donated range records `dm_off`, the constant offset at which its
//! physical frames are also mapped virtually (`vaddr = paddr + dm_off`).
//! The paging core relies on this to read and write page-table pages with
//! ordinary loads and stores instead of temporary mappings.
//!
//! All operations take the internal lock; critical sections are short.

use spin::Mutex;

use super::{is_aligned, PhysicalAddress, VirtualAddress, PAGE_SHIFT, PAGE_SIZE};
use crate::error::{KernelError, KernelResult};

/// Maximum number of physical ranges a frame allocator can own
pub const MAX_FRAME_RANGES: usize = 8;

/// One donated physical range. The bitmap lives in the first
/// `meta_frames` frames of the range (1 bit per frame, set = free).
struct FrameRange {
    /// Physical start, page aligned
    start: u64,
    /// Total number of frames, including metadata frames
    frames: usize,
    /// Direct-map offset: `vaddr = paddr.wrapping_add(dm_off)`
    dm_off: u64,
    /// Number of leading frames holding the bitmap
    meta_frames: usize,
    /// Free frames remaining
    free: usize,
}

impl FrameRange {
    fn bitmap_words(&self) -> usize {
        self.frames.div_ceil(64)
    }

    fn bitmap(&self) -> &mut [u64] {
        let vaddr = self.start.wrapping_add(self.dm_off) as usize as *mut u64;
        // SAFETY: The bitmap occupies the first `meta_frames` frames of the
        // donated range, which `add_range` verified to be large enough for
        // `bitmap_words()` words and mapped at `dm_off`. The allocator lock
        // is held by all callers, so no aliasing mutable access exists.
        unsafe { core::slice::from_raw_parts_mut(vaddr, self.bitmap_words()) }
    }

    fn contains(&self, paddr: u64) -> bool {
        paddr >= self.start && paddr < self.start + ((self.frames as u64) << PAGE_SHIFT)
    }

    fn frame_is_free(&self, idx: usize) -> bool {
        self.bitmap()[idx / 64] & (1 << (idx % 64)) != 0
    }

    fn set_frame(&mut self, idx: usize, free: bool) {
        let word = &mut self.bitmap()[idx / 64];
        if free {
            *word |= 1 << (idx % 64);
        } else {
            *word &= !(1 << (idx % 64));
        }
    }
}

struct Inner {
    ranges: [Option<FrameRange>; MAX_FRAME_RANGES],
    total_frames: usize,
    free_frames: usize,
}

/// Frame allocator over donated physical ranges
pub struct FrameAllocator {
    inner: Mutex<Inner>,
}

impl FrameAllocator {
    const NO_RANGE: Option<FrameRange> = None;

    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                ranges: [Self::NO_RANGE; MAX_FRAME_RANGES],
                total_frames: 0,
                free_frames: 0,
            }),
        }
    }

    /// Donate the physical range `[start, start + len)` to the allocator.
    /// `dm_off` is the direct-map offset under which the whole range is
    /// virtually accessible. The head of the range is consumed for the
    /// allocation bitmap.
    pub fn add_range(&self, start: PhysicalAddress, len: u64, dm_off: u64) -> KernelResult<()> {
        if !start.is_page_aligned() || !is_aligned(len, PAGE_SIZE as u64) || len == 0 {
            return Err(KernelError::InvalidArgument {
                what: "frame range must be page aligned and non-empty",
            });
        }

        let frames = (len >> PAGE_SHIFT) as usize;
        let bitmap_bytes = frames.div_ceil(64) * 8;
        let meta_frames = bitmap_bytes.div_ceil(PAGE_SIZE);
        if meta_frames >= frames {
            return Err(KernelError::InvalidArgument {
                what: "frame range too small for its own metadata",
            });
        }

        let mut inner = self.inner.lock();
        let slot = inner
            .ranges
            .iter()
            .position(|r| r.is_none())
            .ok_or(KernelError::OutOfMemory {
                requested: core::mem::size_of::<FrameRange>(),
            })?;

        let mut range = FrameRange {
            start: start.as_u64(),
            frames,
            dm_off,
            meta_frames,
            free: frames - meta_frames,
        };

        // Everything past the metadata starts out free.
        {
            let bitmap = range.bitmap();
            bitmap.fill(u64::MAX);
            // Clear any trailing bits beyond the last frame.
            let tail = frames % 64;
            if tail != 0 {
                if let Some(last) = bitmap.last_mut() {
                    *last = (1 << tail) - 1;
                }
            }
        }
        for i in 0..meta_frames {
            range.set_frame(i, false);
        }

        inner.total_frames += frames;
        inner.free_frames += range.free;
        inner.ranges[slot] = Some(range);

        log::debug!(
            "frame allocator: added {:#x}-{:#x} ({} frames, {} metadata)",
            start.as_u64(),
            start.as_u64() + len,
            frames,
            meta_frames
        );

        Ok(())
    }

    /// Allocate `count` physically contiguous frames whose base address is a
    /// multiple of `align` bytes (at least page size).
    pub fn alloc(&self, count: usize, align: u64) -> KernelResult<PhysicalAddress> {
        if count == 0 || !align.is_power_of_two() || align < PAGE_SIZE as u64 {
            return Err(KernelError::InvalidArgument {
                what: "frame allocation count/alignment",
            });
        }

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        for range in inner.ranges.iter_mut().flatten() {
            if range.free < count {
                continue;
            }
            if let Some(idx) = Self::find_run(range, count, align) {
                for i in idx..idx + count {
                    range.set_frame(i, false);
                }
                range.free -= count;
                let paddr = range.start + ((idx as u64) << PAGE_SHIFT);
                inner.free_frames -= count;
                return Ok(PhysicalAddress::new(paddr));
            }
        }

        Err(KernelError::OutOfMemory {
            requested: count * PAGE_SIZE,
        })
    }

    fn find_run(range: &FrameRange, count: usize, align: u64) -> Option<usize> {
        let step = (align as usize >> PAGE_SHIFT).max(1);
        // First candidate index with a properly aligned physical address.
        let misalign = (range.start % align) >> PAGE_SHIFT;
        let first = if misalign == 0 {
            0
        } else {
            step - misalign as usize
        };

        let mut idx = first;
        while idx + count <= range.frames {
            let mut run = 0;
            while run < count && range.frame_is_free(idx + run) {
                run += 1;
            }
            if run == count {
                return Some(idx);
            }
            // Skip past the blocking frame, keeping alignment.
            let next = idx + run + 1;
            idx += ((next - idx).div_ceil(step)) * step;
        }
        None
    }

    /// Return `count` frames starting at `paddr` to the allocator. Freeing
    /// frames that are not currently allocated (including the metadata
    /// frames) is an error.
    pub fn free(&self, paddr: PhysicalAddress, count: usize) -> KernelResult<()> {
        if !paddr.is_page_aligned() || count == 0 {
            return Err(KernelError::InvalidArgument {
                what: "frame free address/count",
            });
        }

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let range = inner
            .ranges
            .iter_mut()
            .flatten()
            .find(|r| r.contains(paddr.as_u64()))
            .ok_or(KernelError::NotFound {
                resource: "frame range",
            })?;

        let idx = ((paddr.as_u64() - range.start) >> PAGE_SHIFT) as usize;
        if idx + count > range.frames || idx < range.meta_frames {
            return Err(KernelError::InvalidArgument {
                what: "frame free range",
            });
        }
        for i in idx..idx + count {
            if range.frame_is_free(i) {
                return Err(KernelError::InvalidState {
                    expected: "allocated frame",
                    actual: "free frame",
                });
            }
        }
        for i in idx..idx + count {
            range.set_frame(i, true);
        }
        range.free += count;
        inner.free_frames += count;
        Ok(())
    }

    /// Whether `paddr` lies within a donated range
    pub fn owns(&self, paddr: PhysicalAddress) -> bool {
        self.inner
            .lock()
            .ranges
            .iter()
            .flatten()
            .any(|r| r.contains(paddr.as_u64()))
    }

    /// Translate a physical address inside a donated range to its
    /// direct-mapped virtual address.
    pub fn directmap(&self, paddr: PhysicalAddress) -> KernelResult<VirtualAddress> {
        let inner = self.inner.lock();
        let range = inner
            .ranges
            .iter()
            .flatten()
            .find(|r| r.contains(paddr.as_u64()))
            .ok_or(KernelError::NotFound {
                resource: "frame range",
            })?;
        Ok(VirtualAddress::new(paddr.as_u64().wrapping_add(range.dm_off)))
    }

    /// Free frames currently available
    pub fn free_frames(&self) -> usize {
        self.inner.lock().free_frames
    }

    /// Total frames under management (including metadata frames)
    pub fn total_frames(&self) -> usize {
        self.inner.lock().total_frames
    }
}

impl Default for FrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(target_os = "none")))]
pub(crate) mod tests {
    use super::*;
    use std::vec;
    use std::vec::Vec;

    /// A heap-backed "physical" arena: frames live in an aligned buffer and
    /// the direct-map offset points the allocator at it.
    pub(crate) struct TestArena {
        #[allow(dead_code)]
        buf: Vec<u8>,
        pub start: PhysicalAddress,
        pub len: u64,
        pub dm_off: u64,
    }

    impl TestArena {
        pub fn new(start: u64, len: usize) -> Self {
            let mut buf = vec![0u8; len + PAGE_SIZE];
            let base = buf.as_mut_ptr() as u64;
            let aligned = (base + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1);
            Self {
                buf,
                start: PhysicalAddress::new(start),
                len: len as u64,
                dm_off: aligned.wrapping_sub(start),
            }
        }

        pub fn allocator(&self) -> FrameAllocator {
            let fa = FrameAllocator::new();
            fa.add_range(self.start, self.len, self.dm_off)
                .expect("arena range should be accepted");
            fa
        }
    }

    #[test]
    fn alloc_skips_metadata_frames() {
        let arena = TestArena::new(0x100000, 64 * PAGE_SIZE);
        let fa = arena.allocator();

        let first = fa
            .alloc(1, PAGE_SIZE as u64)
            .expect("allocation from a fresh range should succeed");
        assert!(
            first.as_u64() >= 0x100000 + PAGE_SIZE as u64,
            "first frame must not overlap the bitmap metadata"
        );
    }

    #[test]
    fn alloc_free_realloc_roundtrip() {
        let arena = TestArena::new(0x100000, 64 * PAGE_SIZE);
        let fa = arena.allocator();

        let a = fa.alloc(4, PAGE_SIZE as u64).expect("first alloc");
        let b = fa.alloc(4, PAGE_SIZE as u64).expect("second alloc");
        assert_ne!(a, b);

        fa.free(a, 4).expect("free should succeed");
        let c = fa.alloc(4, PAGE_SIZE as u64).expect("realloc");
        assert_eq!(c, a, "first-fit should reuse the freed run");
    }

    #[test]
    fn alloc_honors_alignment() {
        let arena = TestArena::new(0x100000, 1024 * PAGE_SIZE);
        let fa = arena.allocator();

        // Perturb the free map so the aligned run is not at the start.
        let _ = fa.alloc(3, PAGE_SIZE as u64).expect("filler alloc");

        let aligned = fa
            .alloc(16, 16 * PAGE_SIZE as u64)
            .expect("aligned allocation should succeed");
        assert_eq!(aligned.as_u64() % (16 * PAGE_SIZE as u64), 0);
    }

    #[test]
    fn alloc_exhaustion_returns_out_of_memory() {
        let arena = TestArena::new(0x100000, 8 * PAGE_SIZE);
        let fa = arena.allocator();

        // 8 frames, 1 for metadata.
        let got = fa.alloc(7, PAGE_SIZE as u64).expect("drain the range");
        assert!(matches!(
            fa.alloc(1, PAGE_SIZE as u64),
            Err(KernelError::OutOfMemory { .. })
        ));
        fa.free(got, 7).expect("free");
        assert!(fa.alloc(1, PAGE_SIZE as u64).is_ok());
    }

    #[test]
    fn double_free_is_detected() {
        let arena = TestArena::new(0x100000, 16 * PAGE_SIZE);
        let fa = arena.allocator();
        let a = fa.alloc(2, PAGE_SIZE as u64).expect("alloc");
        fa.free(a, 2).expect("first free");
        assert!(matches!(
            fa.free(a, 2),
            Err(KernelError::InvalidState { .. })
        ));
    }

    #[test]
    fn directmap_translates_within_range() {
        let arena = TestArena::new(0x200000, 16 * PAGE_SIZE);
        let fa = arena.allocator();
        let paddr = fa.alloc(1, PAGE_SIZE as u64).expect("alloc");
        let vaddr = fa.directmap(paddr).expect("translation");
        assert_eq!(vaddr.as_u64(), paddr.as_u64().wrapping_add(arena.dm_off));

        // Addresses outside any donated range do not translate.
        assert!(fa.directmap(PhysicalAddress::new(0x10)).is_err());
    }

    #[test]
    fn multiple_ranges() {
        let a1 = TestArena::new(0x100000, 16 * PAGE_SIZE);
        let a2 = TestArena::new(0x800000, 16 * PAGE_SIZE);
        let fa = a1.allocator();
        fa.add_range(a2.start, a2.len, a2.dm_off)
            .expect("second range should be accepted");

        // Drain the first range; the allocator falls over to the second.
        let first = fa.alloc(15, PAGE_SIZE as u64).expect("drain range 1");
        assert!(first.as_u64() < 0x200000);
        let second = fa.alloc(8, PAGE_SIZE as u64).expect("alloc from range 2");
        assert!(second.as_u64() >= 0x800000);
    }
}
