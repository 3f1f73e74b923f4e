//! End-to-end checks of the public API on the host.

use std::sync::{Arc, Mutex as StdMutex};
use std::thread;

use paryanta_mm::memory::{FrameMemory, MemoryLayout, PageFrameAllocator, ALLOC_JUNK, PAGE_SIZE};
use paryanta_mm::syscall::{sys_mmap, sys_munmap, SYSCALL_FAILED};
use paryanta_mm::vma::{AddressSpace, FileBackend, VmaError, VmaTable, MAP_SHARED};
use x86_64::structures::paging::{PhysFrame, Size4KiB};
use x86_64::{PhysAddr, VirtAddr};

const BASE: u64 = 0x10_0000;

/// Frame contents are only tracked for the first byte of each frame.
struct FirstBytes {
    bytes: StdMutex<Vec<u8>>,
}

impl FrameMemory for FirstBytes {
    fn fill(&self, frame: PhysFrame<Size4KiB>, byte: u8) {
        let idx = ((frame.start_address().as_u64() - BASE) / PAGE_SIZE) as usize;
        self.bytes.lock().unwrap()[idx] = byte;
    }
}

fn allocator(frames: u64, kernel_frames: u64) -> PageFrameAllocator<FirstBytes> {
    let layout = MemoryLayout::new(
        PhysAddr::new(BASE),
        PhysAddr::new(BASE + kernel_frames * PAGE_SIZE),
        PhysAddr::new(BASE + frames * PAGE_SIZE),
    );
    let memory = FirstBytes {
        bytes: StdMutex::new(vec![0; frames as usize]),
    };
    let alloc = PageFrameAllocator::new(layout, memory);
    alloc.initialize();
    alloc
}

#[test]
fn single_free_frame_cycles() {
    let frames = allocator(3, 2);
    let f = frames.allocate().expect("one frame is free");
    assert_eq!(f.start_address().as_u64(), BASE + 2 * PAGE_SIZE);
    assert_eq!(frames.read_reference(f.start_address()), 1);
    assert!(frames.allocate().is_none());

    frames.free(f.start_address());
    assert_eq!(frames.read_reference(f.start_address()), 0);
    assert_eq!(frames.allocate(), Some(f));
}

#[test]
fn concurrent_allocate_and_free() {
    const THREADS: usize = 8;
    const ROUNDS: usize = 200;

    let frames = Arc::new(allocator(64, 4));
    let managed = frames.stats().free;

    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let frames = Arc::clone(&frames);
            thread::spawn(move || {
                let mut held = Vec::new();
                for round in 0..ROUNDS {
                    if let Some(f) = frames.allocate() {
                        assert_eq!(frames.read_reference(f.start_address()), 1);
                        if round % 3 == 0 {
                            frames.bump(f.start_address());
                            frames.free(f.start_address());
                        }
                        held.push(f);
                    }
                    if held.len() > 4 {
                        let f = held.remove(0);
                        frames.free(f.start_address());
                    }
                }
                for f in held {
                    frames.free(f.start_address());
                }
            })
        })
        .collect();

    for w in workers {
        w.join().unwrap();
    }

    let stats = frames.stats();
    assert_eq!(stats.free, managed);
    assert_eq!(stats.used(), 0);

    // Every frame is handed out exactly once when draining.
    let mut drained: Vec<u64> = std::iter::from_fn(|| frames.allocate())
        .map(|f| f.start_address().as_u64())
        .collect();
    assert_eq!(drained.len(), managed);
    drained.sort_unstable();
    drained.dedup();
    assert_eq!(drained.len(), managed);
    assert!(frames
        .memory()
        .bytes
        .lock()
        .unwrap()
        .iter()
        .skip(4)
        .all(|&b| b == ALLOC_JUNK));
}

// ─── mmap through the syscall layer ─────────────────────────────

#[derive(Default)]
struct Files {
    refs: Vec<usize>,
    written: Vec<(u64, u64, u64)>,
}

impl FileBackend for Files {
    type File = usize;

    fn open(&mut self, fd: usize) -> Option<usize> {
        *self.refs.get_mut(fd)? += 1;
        Some(fd)
    }

    fn dup(&mut self, file: &usize) -> usize {
        self.refs[*file] += 1;
        *file
    }

    fn write_at(&mut self, _file: &usize, src: VirtAddr, len: u64, offset: u64) -> Result<(), VmaError> {
        self.written.push((src.as_u64(), len, offset));
        Ok(())
    }

    fn close(&mut self, file: usize) {
        self.refs[file] -= 1;
    }
}

#[derive(Default)]
struct Pages {
    unmapped: Vec<(u64, u64)>,
}

impl AddressSpace for Pages {
    fn unmap(&mut self, base: VirtAddr, pages: u64, _free_frames: bool) {
        self.unmapped.push((base.as_u64(), pages));
    }
}

#[test]
fn shared_mapping_lifecycle() {
    let top = 0x7f_ffff;
    let vmas = spin::Mutex::new(VmaTable::new(top, 0x10_0000));
    let mut files = Files {
        refs: vec![1; 4],
        ..Files::default()
    };
    let mut pages = Pages::default();

    let base = sys_mmap(&vmas, &mut files, &[0, 8192, 1, MAP_SHARED as u64, 3, 0]);
    assert_eq!(base, top - 8192 + 1);
    assert_eq!(vmas.lock().watermark(), top - 8192);
    assert_eq!(vmas.lock().len(), 1);
    assert_eq!(files.refs[3], 2);

    // Drop the second page, then the first.
    assert_eq!(sys_munmap(&vmas, &mut files, &mut pages, &[base + 4096, 4096, 0, 0, 0, 0]), 0);
    assert_eq!(files.refs[3], 2);
    assert_eq!(sys_munmap(&vmas, &mut files, &mut pages, &[base, 4096, 0, 0, 0, 0]), 0);
    assert_eq!(files.refs[3], 1);
    assert!(vmas.lock().is_empty());

    assert_eq!(files.written, vec![(base + 4096, 4096, 4096), (base, 4096, 0)]);
    assert_eq!(pages.unmapped, vec![(base + 4096, 1), (base, 1)]);

    // Unknown descriptor.
    assert_eq!(sys_mmap(&vmas, &mut files, &[0, 4096, 1, MAP_SHARED as u64, 9, 0]), SYSCALL_FAILED);
}
