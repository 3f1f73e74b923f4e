//! ParyantaOS Exokernel
//!
//! Kernel image: brings up serial logging and the heap, then hands the
//! largest usable region of physical memory to the reference-counted frame
//! allocator.

#![no_std]
#![no_main]

extern crate alloc;

mod boot;
mod heap;
mod serial;

use bootloader_api::config::{BootloaderConfig, Mapping};
use bootloader_api::{entry_point, BootInfo};
use core::panic::PanicInfo;
use x86_64::registers::control::Cr3;
use x86_64::structures::paging::{OffsetPageTable, PageTable};
use x86_64::VirtAddr;

use paryanta_mm::memory::{self, PhysWindow};

pub static BOOTLOADER_CONFIG: BootloaderConfig = {
    let mut config = BootloaderConfig::new_default();
    config.mappings.physical_memory = Some(Mapping::Dynamic);
    config
};

entry_point!(kernel_main, config = &BOOTLOADER_CONFIG);

fn kernel_main(boot_info: &'static mut BootInfo) -> ! {
    // Initialize serial output first (for debugging in QEMU)
    serial::init();

    println!("ParyantaOS Exokernel v0.1.0");
    println!("===========================");

    let Some(phys_offset) = boot_info.physical_memory_offset.as_ref().copied() else {
        panic!("bootloader did not map physical memory");
    };
    let phys_offset = VirtAddr::new(phys_offset);

    // SAFETY: the bootloader maps all of physical memory at `phys_offset`,
    // and CR3 points at the active level 4 table.
    let mut mapper = unsafe {
        let (level_4_frame, _) = Cr3::read();
        let table = phys_offset + level_4_frame.start_address().as_u64();
        OffsetPageTable::new(&mut *table.as_mut_ptr::<PageTable>(), phys_offset)
    };

    let Some(region) = boot::largest_usable(&boot_info.memory_regions) else {
        panic!("no usable physical memory");
    };
    log::info!(
        "managing physical memory {:#x}..{:#x}",
        region.start.as_u64(),
        region.end.as_u64()
    );

    // SAFETY: regions marked usable by the bootloader are free RAM.
    let mut boot_frames = unsafe { boot::BootFrameAllocator::new(region) };
    if let Err(e) = heap::init_heap(&mut mapper, &mut boot_frames) {
        panic!("heap initialization failed: {:?}", e);
    }
    println!("[OK] Heap initialized");

    // SAFETY: same physical memory mapping as the page table walk above.
    let window = unsafe { PhysWindow::new(phys_offset) };
    let frames = memory::init(boot_frames.into_layout(), window);
    println!("[OK] Frame allocator initialized");

    // Exercise one shared frame end to end.
    if let Some(frame) = frames.allocate() {
        let frame = frame.start_address();
        frames.bump(frame);
        log::debug!(
            "frame {:#x}: refs={} cow={:?}",
            frame.as_u64(),
            frames.read_reference(frame),
            frames.cow_action(frame)
        );
        frames.free(frame);
        frames.free(frame);
    }

    let stats = frames.stats();
    println!("Exokernel ready: {} of {} frames free. Halting.", stats.free, stats.managed);

    loop {
        x86_64::instructions::hlt();
    }
}

/// Panic handler for kernel panics.
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    println!("\n!!! KERNEL PANIC !!!");
    println!("{}", info);

    loop {
        x86_64::instructions::hlt();
    }
}
