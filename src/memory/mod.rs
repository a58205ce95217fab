pub mod frame_allocator;
pub mod heap;
pub mod paging;

use lazy_static::lazy_static;
use spin::Mutex;
use x86_64::structures::paging::{Page, Size4KiB};
use x86_64::{PhysAddr, VirtAddr};

use frame_allocator::FrameBitmap;
use paging::{AddressSpace, MapFlags};

lazy_static! {
    /// C1: the single physical frame allocator shared by every address
    /// space. Taken briefly whenever page tables are walked or modified.
    pub static ref FRAME_ALLOCATOR: Mutex<FrameBitmap> = Mutex::new(FrameBitmap::empty());
}

/// Reserve the first 4 MiB for the kernel image, boot structures and the
/// very first page tables the bootloader set up, so the bitmap never
/// hands those frames back out.
const RESERVE_BELOW: u64 = 4 * 1024 * 1024;

/// Boot entry point (C1→C2→C3 init): parse the Multiboot2 memory map,
/// build the frame bitmap, then bring up the heap over a fixed kernel
/// virtual range.
pub fn init(multiboot_info_addr: usize) {
    let boot_info = unsafe {
        multiboot2::BootInformation::load(multiboot_info_addr as *const _)
            .expect("Failed to load Multiboot2 info")
    };
    let memory_map_tag = boot_info
        .memory_map_tag()
        .expect("Multiboot2 memory map tag required");

    let areas = memory_map_tag.memory_areas();
    // The tag's backing memory is part of the boot-info blob, which the
    // bootloader guarantees stays resident for the kernel's lifetime.
    let static_areas: &'static [multiboot2::MemoryArea] =
        unsafe { core::slice::from_raw_parts(areas.as_ptr(), areas.len()) };

    {
        let mut allocator = FRAME_ALLOCATOR.lock();
        allocator.init(static_areas, PhysAddr::new(RESERVE_BELOW));
        crate::log_info!(
            "C1: frame allocator initialized — {} frames free of {}.",
            allocator.count(),
            allocator.total()
        );
    }

    map_heap_region();
    crate::log_info!("C2: paging/address-space manager ready.");

    unsafe {
        ALLOCATOR.init(crate::config::HEAP_START, crate::config::HEAP_SIZE);
    }
    crate::log_info!(
        "C3: kernel heap initialized — {} bytes free.",
        ALLOCATOR.free_bytes()
    );
}

fn map_heap_region() {
    let active = AddressSpace::active();
    let mut frame_alloc = FRAME_ALLOCATOR.lock();

    let start_page: Page<Size4KiB> =
        Page::containing_address(VirtAddr::new(crate::config::HEAP_START as u64));
    let page_count = crate::config::HEAP_SIZE / crate::config::PAGE_SIZE;

    for i in 0..page_count {
        let page = start_page + i as u64;
        let frame = frame_alloc
            .alloc_block()
            .expect("out of physical memory while mapping the kernel heap");
        active
            .map_page(page, frame, MapFlags::WRITABLE, &mut frame_alloc)
            .expect("failed to map kernel heap page");
    }
}

/// The kernel heap, exposed globally so `alloc::{Box, Vec, String, ...}`
/// work everywhere once `init` has run. On the bare-metal target this is
/// also the process's `#[global_allocator]`; the host test target uses
/// `std`'s `System` allocator instead (wired in `lib.rs`) so unit tests
/// don't need a real address space behind `Vec`/`String`/`Box`.
#[cfg_attr(target_os = "none", global_allocator)]
pub static ALLOCATOR: heap::LockedHeap = heap::LockedHeap::empty();
