//! Kernel heap setup.
//!
//! Maps virtual pages to physical frames and registers a
//! linked_list_allocator as the #[global_allocator]. The frame allocator's
//! reference table and free-list links live here.

use linked_list_allocator::LockedHeap;
use x86_64::structures::paging::{
    mapper::MapToError, FrameAllocator, Mapper, Page, PageTableFlags, Size4KiB,
};
use x86_64::VirtAddr;

/// Start address of the kernel heap (chosen to be in a high, unused region).
pub const HEAP_START: usize = 0x_4444_4444_0000;

/// Size of the kernel heap in bytes (2 MiB): 12 bytes of allocator
/// bookkeeping per managed frame, plus headroom.
pub const HEAP_SIZE: usize = 2 * 1024 * 1024;

#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Map `HEAP_SIZE` bytes at `HEAP_START` and hand them to the heap allocator.
pub fn init_heap(
    mapper: &mut impl Mapper<Size4KiB>,
    frame_allocator: &mut impl FrameAllocator<Size4KiB>,
) -> Result<(), MapToError<Size4KiB>> {
    let heap_start = VirtAddr::new(HEAP_START as u64);
    let heap_end = heap_start + HEAP_SIZE as u64 - 1u64;
    let pages = Page::range_inclusive(
        Page::containing_address(heap_start),
        Page::containing_address(heap_end),
    );

    let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::NO_EXECUTE;
    for page in pages {
        let frame = frame_allocator
            .allocate_frame()
            .ok_or(MapToError::FrameAllocationFailed)?;
        // SAFETY: the heap range is reserved for this mapping and the frame is fresh.
        unsafe {
            mapper.map_to(page, frame, flags, frame_allocator)?.flush();
        }
    }

    // SAFETY: the range was mapped above and is used for nothing else.
    unsafe {
        ALLOCATOR.lock().init(HEAP_START as *mut u8, HEAP_SIZE);
    }

    log::debug!("kernel heap mapped at {:#x} ({} KiB)", HEAP_START, HEAP_SIZE / 1024);
    Ok(())
}
