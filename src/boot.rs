//! Boot-time frame supply, before the reference-counted allocator exists.
//!
//! The kernel heap has to be mapped before the frame allocator can build its
//! tables, so early frames come from a bump allocator over the start of the
//! largest usable region. Everything it hands out stays reserved for the
//! kernel's lifetime; the rest of the region becomes managed memory.

use bootloader_api::info::{MemoryRegion, MemoryRegionKind};
use x86_64::structures::paging::{FrameAllocator, PhysFrame, Size4KiB};
use x86_64::PhysAddr;

use paryanta_mm::memory::{page_round_down, page_round_up, MemoryLayout, PAGE_SIZE};

/// Upper bound on managed frames, so the allocator's tables fit in the heap.
pub const MAX_MANAGED_FRAMES: u64 = 128 * 1024;

/// A page-aligned span of usable physical memory.
#[derive(Debug, Clone, Copy)]
pub struct UsableRegion {
    pub start: PhysAddr,
    pub end: PhysAddr,
}

/// The largest `Usable` region of the bootloader memory map, trimmed to
/// whole pages and capped at [`MAX_MANAGED_FRAMES`].
pub fn largest_usable(regions: &[MemoryRegion]) -> Option<UsableRegion> {
    regions
        .iter()
        .filter(|r| r.kind == MemoryRegionKind::Usable)
        .map(|r| {
            let start = page_round_up(r.start);
            let end = page_round_down(r.end).max(start);
            let end = end.min(start + MAX_MANAGED_FRAMES * PAGE_SIZE);
            UsableRegion {
                start: PhysAddr::new(start),
                end: PhysAddr::new(end),
            }
        })
        .max_by_key(|r| r.end - r.start)
}

/// Bump allocator over the head of a [`UsableRegion`]. Frames are never freed.
pub struct BootFrameAllocator {
    region: UsableRegion,
    next: PhysAddr,
}

impl BootFrameAllocator {
    /// # Safety
    /// The caller must guarantee that `region` is unused RAM.
    pub unsafe fn new(region: UsableRegion) -> Self {
        BootFrameAllocator {
            region,
            next: region.start,
        }
    }

    /// Hand the untouched remainder of the region to the frame allocator.
    /// Frames already bumped out count as the kernel image.
    pub fn into_layout(self) -> MemoryLayout {
        MemoryLayout::new(self.region.start, self.next, self.region.end)
    }
}

unsafe impl FrameAllocator<Size4KiB> for BootFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        if self.next + PAGE_SIZE > self.region.end {
            return None;
        }
        let frame = PhysFrame::containing_address(self.next);
        self.next += PAGE_SIZE;
        Some(frame)
    }
}
