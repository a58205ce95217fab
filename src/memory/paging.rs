//! Virtual memory manager: one `AddressSpace` per level-4 page table,
//! built on `x86_64::structures::paging`'s 4-level walker.

use bitflags::bitflags;
use x86_64::{
    registers::control::{Cr3, Cr3Flags},
    structures::paging::{
        FrameAllocator, FrameDeallocator, Mapper, OffsetPageTable, Page, PageTable,
        PageTableFlags, PhysFrame, Size4KiB, Translate,
    },
    PhysAddr, VirtAddr,
};

use crate::config::{PHYS_MEM_OFFSET, SCRATCH_PAGE_ADDR};
use crate::memory::frame_allocator::FrameBitmap;

bitflags! {
    /// Mapping permissions, independent of the `x86_64` crate's raw
    /// `PageTableFlags` so callers don't need to know the PRESENT bit is
    /// implicit.
    pub struct MapFlags: u32 {
        const WRITABLE       = 0b001;
        const USER_ACCESSIBLE = 0b010;
        const NO_EXECUTE     = 0b100;
    }
}

impl From<MapFlags> for PageTableFlags {
    fn from(flags: MapFlags) -> Self {
        let mut out = PageTableFlags::PRESENT;
        if flags.contains(MapFlags::WRITABLE) {
            out |= PageTableFlags::WRITABLE;
        }
        if flags.contains(MapFlags::USER_ACCESSIBLE) {
            out |= PageTableFlags::USER_ACCESSIBLE;
        }
        if flags.contains(MapFlags::NO_EXECUTE) {
            out |= PageTableFlags::NO_EXECUTE;
        }
        out
    }
}

/// A single page-table hierarchy (one value of CR3). `None` page tables
/// other than the currently active one are reached only through the
/// scratch-page mechanism in `copy_to`/`memset_in`.
pub struct AddressSpace {
    level4_frame: PhysFrame,
}

fn offset_page_table(level4_frame: PhysFrame) -> OffsetPageTable<'static> {
    let phys = level4_frame.start_address();
    let virt = VirtAddr::new(PHYS_MEM_OFFSET + phys.as_u64());
    let table: &'static mut PageTable = unsafe { &mut *virt.as_mut_ptr() };
    unsafe { OffsetPageTable::new(table, VirtAddr::new(PHYS_MEM_OFFSET)) }
}

impl AddressSpace {
    /// The address space backing the currently loaded CR3.
    pub fn active() -> Self {
        let (frame, _) = Cr3::read();
        AddressSpace {
            level4_frame: frame,
        }
    }

    pub fn cr3_value(&self) -> u64 {
        self.level4_frame.start_address().as_u64()
    }

    /// Load this address space into CR3. Only ever called by the
    /// scheduler across a context switch.
    pub unsafe fn activate(&self) {
        Cr3::write(self.level4_frame, Cr3Flags::empty());
    }

    /// Allocate a fresh level-4 table, copying the active table's kernel
    /// half (entries 256..512) so every process shares one kernel mapping
    /// and gets a private, empty user half.
    pub fn create_directory(frame_alloc: &mut FrameBitmap) -> Option<Self> {
        let new_frame = frame_alloc.alloc_block()?;
        let new_virt = VirtAddr::new(PHYS_MEM_OFFSET + new_frame.start_address().as_u64());
        let new_table: &mut PageTable = unsafe { &mut *new_virt.as_mut_ptr() };
        new_table.zero();

        let active = Self::active();
        let active_table_virt =
            VirtAddr::new(PHYS_MEM_OFFSET + active.level4_frame.start_address().as_u64());
        let active_table: &PageTable = unsafe { &*active_table_virt.as_ptr() };
        for i in 256..512 {
            new_table[i] = active_table[i].clone();
        }

        Some(AddressSpace {
            level4_frame: new_frame,
        })
    }

    /// Tear down the user half: unmap and free every frame mapped below
    /// the kernel/user split, then free the level-4 table itself. Must
    /// not be called on the currently active address space.
    pub fn free_directory(self, frame_alloc: &mut FrameBitmap) {
        let virt = VirtAddr::new(PHYS_MEM_OFFSET + self.level4_frame.start_address().as_u64());
        let table: &mut PageTable = unsafe { &mut *virt.as_mut_ptr() };

        for l4_entry in table.iter_mut().take(256) {
            if l4_entry.is_unused() {
                continue;
            }
            let l3_frame = l4_entry.frame().unwrap();
            free_table_recursive(l3_frame, 3, frame_alloc);
            l4_entry.set_unused();
        }

        unsafe { frame_alloc.free_block(self.level4_frame) };
    }

    pub fn map_page(
        &self,
        page: Page<Size4KiB>,
        frame: PhysFrame,
        flags: MapFlags,
        frame_alloc: &mut FrameBitmap,
    ) -> Result<(), &'static str> {
        let mut mapper = offset_page_table(self.level4_frame);
        unsafe {
            mapper
                .map_to(page, frame, flags.into(), frame_alloc)
                .map_err(|_| "map_to failed")?
                .flush();
        }
        Ok(())
    }

    pub fn unmap_page(&self, page: Page<Size4KiB>, frame_alloc: &mut FrameBitmap) {
        let mut mapper = offset_page_table(self.level4_frame);
        if let Ok((frame, flush)) = mapper.unmap(page) {
            flush.flush();
            unsafe { frame_alloc.free_block(frame) };
        }
    }

    pub fn is_mapped(&self, addr: VirtAddr) -> bool {
        let mapper = offset_page_table(self.level4_frame);
        mapper.translate_addr(addr).is_some()
    }

    pub fn translate(&self, addr: VirtAddr) -> Option<PhysAddr> {
        let mapper = offset_page_table(self.level4_frame);
        mapper.translate_addr(addr)
    }

    /// Copy `src` into this address space starting at `dst`, one frame at
    /// a time, via the reserved scratch page. Works whether or not this
    /// address space is currently active.
    pub fn copy_to(&self, dst: VirtAddr, src: &[u8], frame_alloc: &mut FrameBitmap) {
        self.with_scratch_frames(dst, src.len(), frame_alloc, |scratch, src_off, len| {
            scratch[..len].copy_from_slice(&src[src_off..src_off + len]);
        });
    }

    /// Zero-fill `len` bytes starting at `dst` in this address space.
    pub fn memset_in(&self, dst: VirtAddr, len: usize, frame_alloc: &mut FrameBitmap) {
        self.with_scratch_frames(dst, len, frame_alloc, |scratch, _src_off, fill_len| {
            for b in scratch[..fill_len].iter_mut() {
                *b = 0;
            }
        });
    }

    fn with_scratch_frames(
        &self,
        dst: VirtAddr,
        total_len: usize,
        frame_alloc: &mut FrameBitmap,
        mut fill: impl FnMut(&mut [u8], usize, usize),
    ) {
        let scratch_page: Page<Size4KiB> = Page::containing_address(VirtAddr::new(SCRATCH_PAGE_ADDR));
        let active = Self::active();
        let mut written = 0usize;
        let mut cursor = dst;

        while written < total_len {
            let page_offset = cursor.as_u64() as usize % crate::config::PAGE_SIZE;
            let chunk = (crate::config::PAGE_SIZE - page_offset).min(total_len - written);

            let dst_page: Page<Size4KiB> = Page::containing_address(cursor);
            let frame = {
                let mapper = offset_page_table(self.level4_frame);
                mapper
                    .translate_page(dst_page)
                    .expect("copy_to/memset_in target must already be mapped")
            };

            active.unmap_page(scratch_page, &mut NoFree);
            active
                .map_page(scratch_page, frame, MapFlags::WRITABLE, frame_alloc)
                .expect("scratch mapping failed");

            let scratch_ptr = scratch_page.start_address().as_mut_ptr::<u8>();
            let scratch_slice =
                unsafe { core::slice::from_raw_parts_mut(scratch_ptr.add(page_offset), chunk) };
            fill(scratch_slice, written, chunk);

            written += chunk;
            cursor += chunk as u64;
        }

        active.unmap_page(scratch_page, &mut NoFree);
    }
}

/// A `FrameAllocator`/`FrameDeallocator` that never actually frees,
/// used when tearing down a scratch mapping whose frame is owned by a
/// different address space's directory and must not be returned to the
/// free list here.
struct NoFree;
unsafe impl FrameAllocator<Size4KiB> for NoFree {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        None
    }
}
impl FrameDeallocator<Size4KiB> for NoFree {
    unsafe fn deallocate_frame(&mut self, _frame: PhysFrame) {}
}

fn free_table_recursive(frame: PhysFrame, level: u8, frame_alloc: &mut FrameBitmap) {
    let virt = VirtAddr::new(PHYS_MEM_OFFSET + frame.start_address().as_u64());
    let table: &mut PageTable = unsafe { &mut *virt.as_mut_ptr() };

    if level > 1 {
        for entry in table.iter_mut() {
            if entry.is_unused() {
                continue;
            }
            if let Ok(child) = entry.frame() {
                free_table_recursive(child, level - 1, frame_alloc);
            }
            entry.set_unused();
        }
    }

    unsafe { frame_alloc.free_block(frame) };
}
