//! ParyantaOS memory core.
//!
//! The part of the kernel that owns physical memory and file-backed
//! mappings:
//! - Page frame allocation with per-frame reference counts (copy-on-write)
//! - Per-process mmap regions backed by open files
//! - Decoding of the `mmap`/`munmap` system calls
//!
//! Page tables, the fault handler and the filesystem live elsewhere and are
//! reached through the traits in [`memory`] and [`vma`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod memory;
pub mod syscall;
pub mod vma;

#[cfg(test)]
mod testing;
