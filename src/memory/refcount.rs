//! Per-frame reference counts.
//!
//! Every frame in the managed range has a count of the owners mapping it.
//! A count above one means the frame is shared copy-on-write; zero means the
//! frame belongs on the free list.

use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;
use x86_64::structures::paging::{PhysFrame, Size4KiB};
use x86_64::PhysAddr;

use super::PAGE_SIZE;

/// Reference counts for `[base, base + len * PAGE_SIZE)`, behind one lock.
pub struct ReferenceTable {
    base: PhysAddr,
    counts: Mutex<Vec<u32>>,
}

impl ReferenceTable {
    /// Create a table for `frames` frames starting at `base`, all counts zero.
    pub fn new(base: PhysAddr, frames: usize) -> Self {
        ReferenceTable {
            base,
            counts: Mutex::new(vec![0; frames]),
        }
    }

    /// Number of frames covered.
    pub fn len(&self) -> usize {
        self.counts.lock().len()
    }

    /// True when the table covers no frames.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn index(&self, frame: PhysFrame<Size4KiB>) -> usize {
        let addr = frame.start_address();
        assert!(addr >= self.base, "frame {:#x} below managed memory", addr.as_u64());
        ((addr - self.base) / PAGE_SIZE) as usize
    }

    /// Set every count to `count`. Used once at boot.
    pub fn reset(&self, count: u32) {
        self.counts.lock().iter_mut().for_each(|c| *c = count);
    }

    /// Store `count` for `frame`, returning the previous value.
    pub fn set(&self, frame: PhysFrame<Size4KiB>, count: u32) -> u32 {
        let idx = self.index(frame);
        let mut counts = self.counts.lock();
        core::mem::replace(&mut counts[idx], count)
    }

    /// Add an owner; returns the new count.
    pub fn increment(&self, frame: PhysFrame<Size4KiB>) -> u32 {
        let idx = self.index(frame);
        let mut counts = self.counts.lock();
        counts[idx] += 1;
        let count = counts[idx];
        drop(counts);
        log::trace!("ref+ {:#x} -> {}", frame.start_address().as_u64(), count);
        count
    }

    /// Drop an owner; returns the new count.
    ///
    /// # Panics
    /// Panics if the count is already zero.
    pub fn decrement(&self, frame: PhysFrame<Size4KiB>) -> u32 {
        let idx = self.index(frame);
        let mut counts = self.counts.lock();
        let Some(count) = counts[idx].checked_sub(1) else {
            drop(counts);
            panic!("refcount underflow on frame {:#x}", frame.start_address().as_u64());
        };
        counts[idx] = count;
        drop(counts);
        log::trace!("ref- {:#x} -> {}", frame.start_address().as_u64(), count);
        count
    }

    /// Current count of `frame`.
    pub fn get(&self, frame: PhysFrame<Size4KiB>) -> u32 {
        let idx = self.index(frame);
        self.counts.lock()[idx]
    }
}
