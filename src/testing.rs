//! In-memory stand-ins for physical memory, files and page tables.

use alloc::rc::Rc;
use alloc::vec;
use alloc::vec::Vec;
use core::cell::RefCell;
use spin::Mutex;
use x86_64::structures::paging::{PhysFrame, Size4KiB};
use x86_64::{PhysAddr, VirtAddr};

use crate::memory::{FrameMemory, MemoryLayout, PAGE_SIZE};
use crate::vma::{AddressSpace, FileBackend, VmaError};

/// `frames` frames at 2 GiB, the first `kernel_frames` holding the kernel.
pub(crate) fn layout(frames: usize, kernel_frames: usize) -> MemoryLayout {
    let base = PhysAddr::new(0x8000_0000);
    MemoryLayout::new(
        base,
        base + kernel_frames as u64 * PAGE_SIZE,
        base + frames as u64 * PAGE_SIZE,
    )
}

/// Physical memory emulated with a heap buffer.
pub(crate) struct RamFrames {
    base: u64,
    bytes: Mutex<Vec<u8>>,
}

impl RamFrames {
    pub(crate) fn new(layout: &MemoryLayout) -> Self {
        RamFrames {
            base: layout.base.as_u64(),
            bytes: Mutex::new(vec![0; layout.frame_count() * PAGE_SIZE as usize]),
        }
    }

    pub(crate) fn byte_at(&self, addr: u64) -> u8 {
        self.bytes.lock()[(addr - self.base) as usize]
    }

    pub(crate) fn write(&self, addr: u64, byte: u8) {
        self.bytes.lock()[(addr - self.base) as usize] = byte;
    }

    pub(crate) fn frame_bytes(&self, addr: u64) -> Vec<u8> {
        let start = (addr - self.base) as usize;
        self.bytes.lock()[start..start + PAGE_SIZE as usize].to_vec()
    }
}

impl FrameMemory for RamFrames {
    fn fill(&self, frame: PhysFrame<Size4KiB>, byte: u8) {
        let start = (frame.start_address().as_u64() - self.base) as usize;
        self.bytes.lock()[start..start + PAGE_SIZE as usize].fill(byte);
    }
}

/// Side effects observed by the fakes, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Event {
    Write { inode: usize, src: u64, len: u64, offset: u64 },
    Unmap { base: u64, pages: u64, free: bool },
    Close { inode: usize },
}

#[derive(Clone, Default)]
pub(crate) struct Journal(Rc<RefCell<Vec<Event>>>);

impl Journal {
    fn push(&self, event: Event) {
        self.0.borrow_mut().push(event);
    }

    pub(crate) fn events(&self) -> Vec<Event> {
        self.0.borrow().clone()
    }
}

/// A counted reference to one of the fake inodes.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct FileRef {
    pub(crate) inode: usize,
}

/// Descriptor table where fd `n` names inode `n`, each held once by the
/// descriptor itself.
pub(crate) struct FakeFiles {
    refs: Vec<usize>,
    journal: Journal,
    pub(crate) fail_writes: bool,
}

impl FakeFiles {
    pub(crate) fn new(files: usize, journal: Journal) -> Self {
        FakeFiles {
            refs: vec![1; files],
            journal,
            fail_writes: false,
        }
    }

    pub(crate) fn refs(&self, inode: usize) -> usize {
        self.refs[inode]
    }
}

impl FileBackend for FakeFiles {
    type File = FileRef;

    fn open(&mut self, fd: usize) -> Option<FileRef> {
        let count = self.refs.get_mut(fd)?;
        *count += 1;
        Some(FileRef { inode: fd })
    }

    fn dup(&mut self, file: &FileRef) -> FileRef {
        self.refs[file.inode] += 1;
        FileRef { inode: file.inode }
    }

    fn write_at(&mut self, file: &FileRef, src: VirtAddr, len: u64, offset: u64) -> Result<(), VmaError> {
        if self.fail_writes {
            return Err(VmaError::WriteBack);
        }
        self.journal.push(Event::Write {
            inode: file.inode,
            src: src.as_u64(),
            len,
            offset,
        });
        Ok(())
    }

    fn close(&mut self, file: FileRef) {
        self.refs[file.inode] -= 1;
        self.journal.push(Event::Close { inode: file.inode });
    }
}

pub(crate) struct FakeSpace {
    journal: Journal,
}

impl FakeSpace {
    pub(crate) fn new(journal: Journal) -> Self {
        FakeSpace { journal }
    }
}

impl AddressSpace for FakeSpace {
    fn unmap(&mut self, base: VirtAddr, pages: u64, free_frames: bool) {
        self.journal.push(Event::Unmap {
            base: base.as_u64(),
            pages,
            free: free_frames,
        });
    }
}
