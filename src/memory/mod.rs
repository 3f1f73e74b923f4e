//! Physical memory management.
//!
//! Provides:
//! - A reference count for every frame of the managed range
//! - A page frame allocator that only recycles frames nobody references
//! - The kernel-lifetime allocator instance, built once at boot

pub mod frame_allocator;
pub mod refcount;

pub use frame_allocator::{CowAction, FrameMemory, FrameStats, PageFrameAllocator, PhysWindow};
pub use refcount::ReferenceTable;

use spin::Once;
use x86_64::PhysAddr;

/// Size of a page frame in bytes.
pub const PAGE_SIZE: u64 = 4096;

/// Filler written over a frame when it is handed out, so reads of
/// uninitialized memory show up as 0x05 bytes.
pub const ALLOC_JUNK: u8 = 0x05;

/// Filler written over a frame when its last reference goes away, so
/// dangling accesses show up as 0x01 bytes.
pub const FREE_JUNK: u8 = 0x01;

/// Round `addr` up to the next page boundary.
pub const fn page_round_up(addr: u64) -> u64 {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Round `addr` down to a page boundary.
pub const fn page_round_down(addr: u64) -> u64 {
    addr & !(PAGE_SIZE - 1)
}

/// Boundaries of the physical range the allocator manages, fixed at boot.
///
/// Reference counts cover `[base, top)`. Frames in `[base, kernel_end)` hold
/// the kernel image and are never handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLayout {
    /// First byte of managed physical memory.
    pub base: PhysAddr,
    /// First byte after the kernel image.
    pub kernel_end: PhysAddr,
    /// First byte past the end of managed memory.
    pub top: PhysAddr,
}

impl MemoryLayout {
    /// Create a layout, checking that the boundaries are ordered and page aligned.
    pub fn new(base: PhysAddr, kernel_end: PhysAddr, top: PhysAddr) -> Self {
        assert!(base.is_aligned(PAGE_SIZE), "memory base {:#x} not page aligned", base.as_u64());
        assert!(top.is_aligned(PAGE_SIZE), "memory top {:#x} not page aligned", top.as_u64());
        assert!(
            base <= kernel_end && kernel_end <= top,
            "bad memory layout: base={:#x} kernel_end={:#x} top={:#x}",
            base.as_u64(),
            kernel_end.as_u64(),
            top.as_u64()
        );
        MemoryLayout { base, kernel_end, top }
    }

    /// Number of frames covered by the reference table.
    pub fn frame_count(&self) -> usize {
        ((self.top - self.base) / PAGE_SIZE) as usize
    }

    /// First frame the allocator may hand out.
    pub fn first_usable(&self) -> PhysAddr {
        PhysAddr::new(page_round_up(self.kernel_end.as_u64()))
    }
}

/// The kernel's frame allocator.
static FRAMES: Once<PageFrameAllocator<PhysWindow>> = Once::new();

/// Build the global frame allocator and release every usable frame into it.
///
/// Must be called once, after the kernel heap is up. Later calls return the
/// existing instance.
pub fn init(layout: MemoryLayout, window: PhysWindow) -> &'static PageFrameAllocator<PhysWindow> {
    FRAMES.call_once(|| {
        let frames = PageFrameAllocator::new(layout, window);
        frames.initialize();
        let stats = frames.stats();
        log::info!(
            "frame allocator ready: {} free of {} managed frames ({} MiB)",
            stats.free,
            stats.managed,
            stats.free as u64 * PAGE_SIZE / 1024 / 1024
        );
        frames
    })
}

/// Handle to the global frame allocator.
///
/// # Panics
/// Panics if [`init`] has not run yet.
pub fn frames() -> &'static PageFrameAllocator<PhysWindow> {
    FRAMES.get().expect("frame allocator used before memory::init")
}
