//! Per-process table of mmap regions.
//!
//! Regions are kept in a `BTreeMap` keyed by base address, bounded to
//! [`NVMA`] entries. New regions are carved downward from a watermark that
//! only ever decreases, so a fresh region can't overlap an existing one.

use alloc::collections::BTreeMap;
use x86_64::VirtAddr;

use super::{AddressSpace, FileBackend, MapMode, MapRequest, Vma, VmaError, MMAP_FLOOR, MMAP_TOP, NVMA};
use crate::memory::{page_round_up, PAGE_SIZE};

/// The mmap regions of one process.
pub struct VmaTable<F> {
    areas: BTreeMap<u64, Vma<F>>,
    /// Highest byte still available for placement (inclusive).
    watermark: u64,
    floor: u64,
}

impl<F> VmaTable<F> {
    /// Create an empty table placing regions in `[floor, top]`.
    ///
    /// # Panics
    /// Panics unless `top` is the last byte of a page, since region bases
    /// must stay page aligned for munmap to accept them.
    pub const fn new(top: u64, floor: u64) -> Self {
        assert!(top % PAGE_SIZE == PAGE_SIZE - 1, "mmap top must be the last byte of a page");
        VmaTable {
            areas: BTreeMap::new(),
            watermark: top,
            floor,
        }
    }

    /// Current watermark; the next region ends at this byte.
    pub fn watermark(&self) -> u64 {
        self.watermark
    }

    /// Number of regions in use.
    pub fn len(&self) -> usize {
        self.areas.len()
    }

    /// True when no region is mapped.
    pub fn is_empty(&self) -> bool {
        self.areas.is_empty()
    }

    /// True when all [`NVMA`] slots are taken.
    pub fn is_full(&self) -> bool {
        self.areas.len() >= NVMA
    }

    /// Regions in ascending address order.
    pub fn iter(&self) -> impl Iterator<Item = &Vma<F>> + '_ {
        self.areas.values()
    }

    /// The region containing `addr`, if any. Used by the page-fault path to
    /// find the file page behind a lazily mapped address.
    pub fn find(&self, addr: VirtAddr) -> Option<&Vma<F>> {
        self.areas
            .range(..=addr.as_u64())
            .next_back()
            .map(|(_, area)| area)
            .filter(|area| area.contains(addr))
    }

    /// Map `req.len` bytes of the file behind `req.fd`, rounded up to whole
    /// pages, just below the watermark. Returns the base address.
    ///
    /// Nothing is read from the file and no page is mapped yet. On failure
    /// the table and the file are left untouched.
    pub fn mmap<B>(&mut self, files: &mut B, req: MapRequest) -> Result<VirtAddr, VmaError>
    where
        B: FileBackend<File = F>,
    {
        if req.len == 0 || req.len > u64::MAX - PAGE_SIZE {
            return Err(VmaError::InvalidArgument);
        }
        if self.is_full() {
            return Err(VmaError::NoFreeSlot);
        }

        let len = page_round_up(req.len);
        let base = (self.watermark + 1)
            .checked_sub(len)
            .filter(|base| *base >= self.floor)
            .ok_or(VmaError::OutOfAddressSpace)?;

        let file = files.open(req.fd).ok_or(VmaError::BadFileDescriptor)?;

        self.watermark -= len;
        let base = VirtAddr::new(base);
        log::debug!(
            "mmap {:#x}..{:#x} {} {:?} fd={} off={:#x}",
            base.as_u64(),
            base.as_u64() + len,
            req.prot,
            req.mode,
            req.fd,
            req.offset
        );
        self.areas.insert(
            base.as_u64(),
            Vma {
                base,
                len,
                prot: req.prot,
                mode: req.mode,
                offset: req.offset,
                file,
            },
        );
        Ok(base)
    }

    /// Unmap `[addr, addr + len)`, with `len` rounded up to whole pages.
    ///
    /// The range must start inside a region and end at or before that
    /// region's end. Unmapping the whole region releases its file
    /// reference; unmapping its head or tail shrinks it; unmapping the
    /// middle splits it in two, which needs a free slot. Shared regions
    /// write the range back to the file before it is unmapped.
    pub fn munmap<B, S>(&mut self, files: &mut B, space: &mut S, addr: VirtAddr, len: u64) -> Result<(), VmaError>
    where
        B: FileBackend<File = F>,
        S: AddressSpace,
    {
        if len == 0 || len > u64::MAX - PAGE_SIZE || !addr.is_aligned(PAGE_SIZE) {
            return Err(VmaError::InvalidArgument);
        }
        let len = page_round_up(len);
        let start = addr.as_u64();
        let end = start.checked_add(len).ok_or(VmaError::InvalidRange)?;

        let area = self.find(addr).ok_or(VmaError::NotMapped)?;
        let key = area.base.as_u64();
        let area_end = area.end().as_u64();
        if end > area_end {
            return Err(VmaError::InvalidRange);
        }
        let split = start > key && end < area_end;
        if split && self.is_full() {
            return Err(VmaError::NoFreeSlot);
        }

        if area.mode == MapMode::Shared {
            files.write_at(&area.file, addr, len, area.file_offset(addr))?;
        }
        space.unmap(addr, len / PAGE_SIZE, true);

        let Some(mut area) = self.areas.remove(&key) else {
            return Err(VmaError::NotMapped);
        };
        log::debug!("munmap {:#x}..{:#x} from {:#x}..{:#x}", start, end, key, area_end);

        match (start == key, end == area_end) {
            (true, true) => files.close(area.file),
            (true, false) => {
                area.base = VirtAddr::new(end);
                area.offset += len;
                area.len -= len;
                self.areas.insert(end, area);
            }
            (false, true) => {
                area.len -= len;
                self.areas.insert(key, area);
            }
            (false, false) => {
                let upper = Vma {
                    base: VirtAddr::new(end),
                    len: area_end - end,
                    prot: area.prot,
                    mode: area.mode,
                    offset: area.offset + (end - key),
                    file: files.dup(&area.file),
                };
                area.len = start - key;
                self.areas.insert(key, area);
                self.areas.insert(end, upper);
            }
        }
        Ok(())
    }

    /// Copy the table for a forked child. Every region of the copy holds its
    /// own file reference; pages are shared through the frame reference
    /// counts by the fork path, not here.
    pub fn duplicate<B>(&self, files: &mut B) -> Self
    where
        B: FileBackend<File = F>,
    {
        let areas = self
            .areas
            .iter()
            .map(|(&key, area)| {
                let copy = Vma {
                    base: area.base,
                    len: area.len,
                    prot: area.prot,
                    mode: area.mode,
                    offset: area.offset,
                    file: files.dup(&area.file),
                };
                (key, copy)
            })
            .collect();
        VmaTable {
            areas,
            watermark: self.watermark,
            floor: self.floor,
        }
    }

    /// Tear down every region at process exit: write back shared regions,
    /// unmap their pages and drop their file references.
    ///
    /// A failed write-back is logged and does not stop the teardown.
    pub fn release_all<B, S>(&mut self, files: &mut B, space: &mut S)
    where
        B: FileBackend<File = F>,
        S: AddressSpace,
    {
        let areas = core::mem::take(&mut self.areas);
        for area in areas.into_values() {
            if area.mode == MapMode::Shared {
                if let Err(e) = files.write_at(&area.file, area.base, area.len, area.offset) {
                    log::warn!("exit: write-back of {:#x} failed: {}", area.base.as_u64(), e);
                }
            }
            space.unmap(area.base, area.len / PAGE_SIZE, true);
            files.close(area.file);
        }
    }
}

impl<F> Default for VmaTable<F> {
    fn default() -> Self {
        VmaTable::new(MMAP_TOP, MMAP_FLOOR)
    }
}
