//! Reference-counted physical frame allocator.
//!
//! Free frames sit on a LIFO list whose links live in a side array indexed
//! by frame number, never inside the frames themselves. A frame only goes
//! back on the list when its reference count drops to zero, which is what
//! lets fork share pages copy-on-write instead of copying them.
//!
//! The free list and the reference table each have their own lock. No
//! operation holds both at once.

use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;
use x86_64::structures::paging::{FrameAllocator, FrameDeallocator, PhysFrame, Size4KiB};
use x86_64::{PhysAddr, VirtAddr};

use super::refcount::ReferenceTable;
use super::{MemoryLayout, ALLOC_JUNK, FREE_JUNK, PAGE_SIZE};

/// Byte-level access to frame contents, used to stamp filler patterns.
pub trait FrameMemory {
    /// Overwrite the whole frame with `byte`.
    fn fill(&self, frame: PhysFrame<Size4KiB>, byte: u8);
}

/// Physical memory seen through the bootloader's linear mapping at `offset`.
pub struct PhysWindow {
    offset: VirtAddr,
}

impl PhysWindow {
    /// # Safety
    /// All managed physical memory must be mapped writable at
    /// `offset + phys`, and nothing else may live in that window.
    pub unsafe fn new(offset: VirtAddr) -> Self {
        PhysWindow { offset }
    }
}

impl FrameMemory for PhysWindow {
    fn fill(&self, frame: PhysFrame<Size4KiB>, byte: u8) {
        let ptr: *mut u8 = (self.offset + frame.start_address().as_u64()).as_mut_ptr();
        // SAFETY: guaranteed by `PhysWindow::new`; the allocator owns the frame.
        unsafe { core::ptr::write_bytes(ptr, byte, PAGE_SIZE as usize) };
    }
}

/// What a write fault on a present page should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CowAction {
    /// The faulting address space is the only owner; make the page writable.
    WriteInPlace,
    /// The frame is shared; copy it into a fresh frame first.
    CopyThenWrite,
}

/// Frame accounting snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameStats {
    /// Frames the allocator can hand out (kernel image excluded).
    pub managed: usize,
    /// Frames currently on the free list.
    pub free: usize,
}

impl FrameStats {
    /// Frames handed out and not yet freed.
    pub fn used(&self) -> usize {
        self.managed - self.free
    }
}

/// Free frames as a stack of frame indices with out-of-band links.
struct FreeStack {
    head: Option<u32>,
    next: Vec<Option<u32>>,
    len: usize,
}

impl FreeStack {
    fn new(frames: usize) -> Self {
        assert!(frames <= u32::MAX as usize, "too many frames for the free list");
        FreeStack {
            head: None,
            next: vec![None; frames],
            len: 0,
        }
    }

    fn push(&mut self, idx: usize) {
        self.next[idx] = self.head;
        self.head = Some(idx as u32);
        self.len += 1;
    }

    fn pop(&mut self) -> Option<usize> {
        let idx = self.head? as usize;
        self.head = self.next[idx].take();
        self.len -= 1;
        Some(idx)
    }

    fn contains(&self, idx: usize) -> bool {
        let mut cursor = self.head;
        while let Some(i) = cursor {
            if i as usize == idx {
                return true;
            }
            cursor = self.next[i as usize];
        }
        false
    }
}

/// Page frame allocator over a fixed physical range.
pub struct PageFrameAllocator<M> {
    layout: MemoryLayout,
    memory: M,
    free: Mutex<FreeStack>,
    refs: ReferenceTable,
}

impl<M: FrameMemory> PageFrameAllocator<M> {
    /// Create an allocator with an empty free list and all counts zero.
    ///
    /// Call [`initialize`](Self::initialize) before handing out frames.
    pub fn new(layout: MemoryLayout, memory: M) -> Self {
        let frames = layout.frame_count();
        PageFrameAllocator {
            layout,
            memory,
            free: Mutex::new(FreeStack::new(frames)),
            refs: ReferenceTable::new(layout.base, frames),
        }
    }

    /// Mark every frame held, then release `[kernel_end, top)` through
    /// [`free`](Self::free), one frame at a time.
    pub fn initialize(&self) {
        self.refs.reset(1);
        let mut addr = self.layout.first_usable();
        while addr + PAGE_SIZE <= self.layout.top {
            self.free(addr);
            addr += PAGE_SIZE;
        }
        log::debug!(
            "released {:#x}..{:#x} into the free list",
            self.layout.first_usable().as_u64(),
            self.layout.top.as_u64()
        );
    }

    /// Boundaries of the managed range.
    pub fn layout(&self) -> &MemoryLayout {
        &self.layout
    }

    /// Backing memory the filler patterns are written through.
    pub fn memory(&self) -> &M {
        &self.memory
    }

    /// Take a frame off the free list. Its count becomes 1 and its bytes
    /// are overwritten with [`ALLOC_JUNK`].
    ///
    /// Returns `None` when no frame is free; nothing is reclaimed or retried.
    pub fn allocate(&self) -> Option<PhysFrame<Size4KiB>> {
        let idx = self.free.lock().pop();
        let Some(idx) = idx else {
            log::debug!("frame allocator exhausted");
            return None;
        };
        let frame = self.frame_at(idx);

        let previous = self.refs.set(frame, 1);
        assert!(
            previous == 0,
            "frame {:#x} on the free list with {} references",
            frame.start_address().as_u64(),
            previous
        );

        self.memory.fill(frame, ALLOC_JUNK);
        Some(frame)
    }

    /// Drop one reference to the frame at `addr`. When no references are
    /// left the frame is filled with [`FREE_JUNK`] and put on the free list.
    ///
    /// # Panics
    /// Panics if `addr` is not page aligned, lies below the kernel image end
    /// or at/above the top of managed memory, or already has no references.
    pub fn free(&self, addr: PhysAddr) {
        if !addr.is_aligned(PAGE_SIZE) || addr < self.layout.kernel_end || addr >= self.layout.top {
            panic!("free: bad frame address {:#x}", addr.as_u64());
        }
        let frame = PhysFrame::containing_address(addr);

        if self.refs.decrement(frame) > 0 {
            return;
        }

        self.memory.fill(frame, FREE_JUNK);
        self.free.lock().push(self.index(frame));
    }

    /// Add an owner to an allocated frame, e.g. when fork shares it with the
    /// child instead of copying. Returns the new count.
    ///
    /// # Panics
    /// Panics if the frame is free.
    pub fn bump(&self, addr: PhysAddr) -> u32 {
        let frame = self.checked_frame(addr, "bump");
        let count = self.refs.increment(frame);
        if count == 1 {
            panic!("bump: frame {:#x} is free", addr.as_u64());
        }
        count
    }

    /// Drop an owner without touching the free list. Returns the new count.
    ///
    /// # Panics
    /// Panics if this would drop the last reference; that one must go
    /// through [`free`](Self::free).
    pub fn release_reference(&self, addr: PhysAddr) -> u32 {
        let frame = self.checked_frame(addr, "release_reference");
        let count = self.refs.decrement(frame);
        if count == 0 {
            panic!("release_reference: last reference to {:#x} dropped outside free", addr.as_u64());
        }
        count
    }

    /// Current number of owners of the frame at `addr`.
    pub fn read_reference(&self, addr: PhysAddr) -> u32 {
        let frame = self.checked_frame(addr, "read_reference");
        self.refs.get(frame)
    }

    /// Decide how a write fault on the mapped frame at `addr` is resolved.
    ///
    /// # Panics
    /// Panics if the frame is free, since a free frame can't be mapped.
    pub fn cow_action(&self, addr: PhysAddr) -> CowAction {
        match self.read_reference(addr) {
            0 => panic!("write fault on free frame {:#x}", addr.as_u64()),
            1 => CowAction::WriteInPlace,
            _ => CowAction::CopyThenWrite,
        }
    }

    /// Whether the frame at `addr` is currently on the free list.
    ///
    /// Walks the list; meant for diagnostics.
    pub fn is_free(&self, addr: PhysAddr) -> bool {
        let frame = self.checked_frame(addr, "is_free");
        let idx = self.index(frame);
        self.free.lock().contains(idx)
    }

    /// Snapshot of managed and free frame counts.
    pub fn stats(&self) -> FrameStats {
        let managed = ((self.layout.top - self.layout.first_usable()) / PAGE_SIZE) as usize;
        FrameStats {
            managed,
            free: self.free.lock().len,
        }
    }

    fn checked_frame(&self, addr: PhysAddr, op: &str) -> PhysFrame<Size4KiB> {
        if addr < self.layout.base || addr >= self.layout.top {
            panic!("{}: frame {:#x} outside managed memory", op, addr.as_u64());
        }
        match PhysFrame::from_start_address(addr) {
            Ok(frame) => frame,
            Err(_) => panic!("{}: frame address {:#x} not page aligned", op, addr.as_u64()),
        }
    }

    fn index(&self, frame: PhysFrame<Size4KiB>) -> usize {
        ((frame.start_address() - self.layout.base) / PAGE_SIZE) as usize
    }

    fn frame_at(&self, idx: usize) -> PhysFrame<Size4KiB> {
        PhysFrame::containing_address(self.layout.base + idx as u64 * PAGE_SIZE)
    }
}

unsafe impl<M: FrameMemory> FrameAllocator<Size4KiB> for &PageFrameAllocator<M> {
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        self.allocate()
    }
}

impl<M: FrameMemory> FrameDeallocator<Size4KiB> for &PageFrameAllocator<M> {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame<Size4KiB>) {
        self.free(frame.start_address());
    }
}
