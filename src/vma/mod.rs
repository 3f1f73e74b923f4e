//! File-backed virtual memory areas.
//!
//! Each process keeps a small table of mmap regions. Mapping is lazy: mmap
//! only records the region, and the page-fault path fills pages from the
//! file on first touch. Regions are placed top-down below a per-process
//! watermark, so they never overlap.

pub mod table;

pub use table::VmaTable;

use x86_64::VirtAddr;

/// Maximum number of regions a process may have mapped at once.
pub const NVMA: usize = 16;

/// Initial watermark: the highest byte an mmap region may occupy.
pub const MMAP_TOP: u64 = 0x0000_7fff_0000_0000 - 1;

/// Lowest address an mmap region may start at.
pub const MMAP_FLOOR: u64 = 0x0000_4000_0000_0000;

/// `flags` value for a region whose writes go back to the file.
pub const MAP_SHARED: u32 = 0x01;

/// `flags` value for a copy-private region.
pub const MAP_PRIVATE: u32 = 0x02;

// ─── Protection (bitflags) ──────────────────────────────────────

bitflags::bitflags! {
    /// Access permissions of a mapped region.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Protection: u32 {
        const READ  = 0b0000_0001;
        const WRITE = 0b0000_0010;
        const EXEC  = 0b0000_0100;

        const RW = Self::READ.bits() | Self::WRITE.bits();
    }
}

impl core::fmt::Display for Protection {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        let r = if self.contains(Protection::READ) { 'r' } else { '-' };
        let w = if self.contains(Protection::WRITE) { 'w' } else { '-' };
        let x = if self.contains(Protection::EXEC) { 'x' } else { '-' };
        write!(f, "{}{}{}", r, w, x)
    }
}

// ─── Sharing mode ───────────────────────────────────────────────

/// Whether writes to a region reach the backing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapMode {
    /// Dirty bytes are written back to the file on unmap.
    Shared,
    /// Writes stay private to the process.
    Private,
}

impl MapMode {
    /// Decode the mmap `flags` argument. Exactly one mode must be given.
    pub fn from_flags(flags: u32) -> Option<Self> {
        match flags {
            MAP_SHARED => Some(MapMode::Shared),
            MAP_PRIVATE => Some(MapMode::Private),
            _ => None,
        }
    }
}

// ─── Region ─────────────────────────────────────────────────────

/// One mapped region and the file reference it holds.
#[derive(Debug)]
pub struct Vma<F> {
    /// First byte of the region (page aligned).
    pub base: VirtAddr,
    /// Length in bytes (whole pages).
    pub len: u64,
    pub prot: Protection,
    pub mode: MapMode,
    /// File offset that `base` maps.
    pub offset: u64,
    /// Reference to the open file, owned by this region alone.
    pub file: F,
}

impl<F> Vma<F> {
    /// First byte past the region.
    pub fn end(&self) -> VirtAddr {
        self.base + self.len
    }

    /// Whether `addr` falls inside `[base, end)`.
    pub fn contains(&self, addr: VirtAddr) -> bool {
        addr >= self.base && addr < self.end()
    }

    /// File offset backing `addr`, which must lie inside the region.
    pub fn file_offset(&self, addr: VirtAddr) -> u64 {
        self.offset + (addr - self.base)
    }
}

/// Arguments of an mmap call after decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapRequest {
    pub len: u64,
    pub prot: Protection,
    pub mode: MapMode,
    pub fd: usize,
    pub offset: u64,
}

// ─── Collaborators ──────────────────────────────────────────────

/// The filesystem as seen by the mmap code.
pub trait FileBackend {
    /// A counted reference to an open file.
    type File;

    /// Resolve `fd` in the calling process and take a new reference to the
    /// open file, independent of the descriptor itself.
    fn open(&mut self, fd: usize) -> Option<Self::File>;

    /// Take another reference to an already referenced file.
    fn dup(&mut self, file: &Self::File) -> Self::File;

    /// Write `len` bytes of user memory starting at `src` to the file at `offset`.
    fn write_at(&mut self, file: &Self::File, src: VirtAddr, len: u64, offset: u64) -> Result<(), VmaError>;

    /// Drop a reference taken by `open` or `dup`.
    fn close(&mut self, file: Self::File);
}

/// The page-table side of the calling process.
pub trait AddressSpace {
    /// Remove the mappings of `pages` pages starting at `base`, releasing the
    /// frames behind them when `free_frames` is set. Pages never faulted in
    /// have no entry and are skipped.
    fn unmap(&mut self, base: VirtAddr, pages: u64, free_frames: bool);
}

// ─── Errors ─────────────────────────────────────────────────────

/// mmap/munmap failures reported to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmaError {
    /// Malformed length, address, flags or offset.
    InvalidArgument,
    /// All region slots are in use.
    NoFreeSlot,
    /// No room left below the watermark.
    OutOfAddressSpace,
    /// The descriptor does not name an open file.
    BadFileDescriptor,
    /// No region contains the address.
    NotMapped,
    /// The range runs past the end of its region.
    InvalidRange,
    /// Writing a shared region back to its file failed.
    WriteBack,
}

impl core::fmt::Display for VmaError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            VmaError::InvalidArgument => write!(f, "invalid argument"),
            VmaError::NoFreeSlot => write!(f, "no free mapping slot"),
            VmaError::OutOfAddressSpace => write!(f, "out of mmap address space"),
            VmaError::BadFileDescriptor => write!(f, "bad file descriptor"),
            VmaError::NotMapped => write!(f, "address not mapped"),
            VmaError::InvalidRange => write!(f, "range crosses mapping end"),
            VmaError::WriteBack => write!(f, "write-back to file failed"),
        }
    }
}
