//! `mmap` and `munmap` system calls.
//!
//! Arguments arrive as raw register values: addresses are full 64-bit
//! words, everything else is a C `int` in the low 32 bits. Any failure is
//! reported to user space as -1.

use spin::Mutex;
use x86_64::VirtAddr;

use crate::memory::PAGE_SIZE;
use crate::vma::{AddressSpace, FileBackend, MapMode, MapRequest, Protection, VmaError, VmaTable};

/// Return value of a failed system call (-1).
pub const SYSCALL_FAILED: u64 = u64::MAX;

/// First address past the user half of the address space.
const USER_END: u64 = 0x0000_8000_0000_0000;

fn arg_int(args: &[u64; 6], n: usize) -> i32 {
    args[n] as u32 as i32
}

/// Decode `mmap(addr, length, prot, flags, fd, offset)`.
///
/// The address hint in `args[0]` is ignored; placement is always chosen by
/// the kernel.
pub fn decode_mmap(args: &[u64; 6]) -> Result<MapRequest, VmaError> {
    let len = arg_int(args, 1);
    let prot = arg_int(args, 2);
    let flags = arg_int(args, 3);
    let fd = arg_int(args, 4);
    let offset = arg_int(args, 5);

    if len <= 0 || fd < 0 || offset < 0 || offset as u64 % PAGE_SIZE != 0 {
        return Err(VmaError::InvalidArgument);
    }
    let prot = Protection::from_bits(prot as u32).ok_or(VmaError::InvalidArgument)?;
    let mode = MapMode::from_flags(flags as u32).ok_or(VmaError::InvalidArgument)?;

    Ok(MapRequest {
        len: len as u64,
        prot,
        mode,
        fd: fd as usize,
        offset: offset as u64,
    })
}

/// Decode `munmap(addr, length)`.
pub fn decode_munmap(args: &[u64; 6]) -> Result<(VirtAddr, u64), VmaError> {
    // try_new would sign-extend 0x0000_8000_0000_0000 into the kernel half
    if args[0] >= USER_END {
        return Err(VmaError::InvalidArgument);
    }
    let addr = VirtAddr::new(args[0]);
    let len = arg_int(args, 1);
    if len <= 0 {
        return Err(VmaError::InvalidArgument);
    }
    Ok((addr, len as u64))
}

/// `mmap` entry point. Returns the base address of the new region, or -1.
pub fn sys_mmap<B>(vmas: &Mutex<VmaTable<B::File>>, files: &mut B, args: &[u64; 6]) -> u64
where
    B: FileBackend,
{
    let result = decode_mmap(args).and_then(|req| vmas.lock().mmap(files, req));
    match result {
        Ok(base) => base.as_u64(),
        Err(e) => {
            log::debug!("mmap failed: {}", e);
            SYSCALL_FAILED
        }
    }
}

/// `munmap` entry point. Returns 0, or -1.
pub fn sys_munmap<B, S>(vmas: &Mutex<VmaTable<B::File>>, files: &mut B, space: &mut S, args: &[u64; 6]) -> u64
where
    B: FileBackend,
    S: AddressSpace,
{
    let result = decode_munmap(args).and_then(|(addr, len)| vmas.lock().munmap(files, space, addr, len));
    match result {
        Ok(()) => 0,
        Err(e) => {
            log::debug!("munmap failed: {}", e);
            SYSCALL_FAILED
        }
    }
}
