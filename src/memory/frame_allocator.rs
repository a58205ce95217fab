//! Physical frame allocator: a bitmap over the usable RAM reported by the
//! Multiboot2 memory map, one bit per 4 KiB frame.

use bit_field::BitField;
use x86_64::{
    structures::paging::{FrameAllocator, PhysFrame, Size4KiB},
    PhysAddr,
};

use crate::config::PAGE_SIZE;

const WORD_BITS: usize = 64;

/// Upper bound on the RAM this bitmap can track: 256 MiB worth of 4 KiB
/// frames, comfortably past what a teaching kernel's QEMU target hands
/// it. The bitmap backing store is a statically reserved BSS array
/// rather than a heap `Vec` — `FrameBitmap::init` runs before C3's heap
/// is usable (the heap's own backing pages are mapped with frames this
/// allocator hands out), so it must not allocate from the heap itself,
/// and the array is kept small enough not to risk overflowing the boot
/// stack it's first constructed on.
const MAX_FRAMES: usize = 256 * 1024 * 1024 / PAGE_SIZE;
const MAX_WORDS: usize = MAX_FRAMES / WORD_BITS;

/// First-fit bitmap allocator. `1` means allocated, `0` means free.
pub struct FrameBitmap {
    bits: [u64; MAX_WORDS],
    base_frame: u64,
    frame_count: usize,
    free_count: usize,
}

impl FrameBitmap {
    pub const fn empty() -> Self {
        FrameBitmap {
            bits: [0u64; MAX_WORDS],
            base_frame: 0,
            frame_count: 0,
            free_count: 0,
        }
    }

    /// Build the bitmap from Multiboot2 `MemoryArea`s, marking everything
    /// below `reserve_below` (the first frame past the kernel image and
    /// boot info struct) as already allocated. Usable RAM past
    /// [`MAX_FRAMES`] is silently not tracked (never handed out) rather
    /// than overflowing the static backing array.
    pub fn init(&mut self, areas: &[multiboot2::MemoryArea], reserve_below: PhysAddr) {
        let lowest = areas.iter().map(|a| a.start_address()).min().unwrap_or(0);
        let highest = areas.iter().map(|a| a.end_address()).max().unwrap_or(0);

        self.base_frame = lowest / PAGE_SIZE as u64;
        let wanted_frames = ((highest - lowest) / PAGE_SIZE as u64) as usize;
        self.frame_count = wanted_frames.min(MAX_FRAMES);
        let words = (self.frame_count + WORD_BITS - 1) / WORD_BITS;
        for word in self.bits[..words].iter_mut() {
            *word = u64::MAX;
        }
        self.free_count = 0;

        for area in areas {
            let start_frame = area.start_address() / PAGE_SIZE as u64;
            let end_frame = area.end_address() / PAGE_SIZE as u64;
            for frame in start_frame..end_frame {
                let idx = (frame - self.base_frame) as usize;
                if idx < self.frame_count {
                    self.set_free(idx);
                }
            }
        }

        let reserve_frames = reserve_below.as_u64() / PAGE_SIZE as u64;
        for frame in self.base_frame..reserve_frames.max(self.base_frame) {
            let idx = (frame - self.base_frame) as usize;
            if idx < self.frame_count {
                self.set_allocated(idx);
            }
        }
    }

    fn get(&self, idx: usize) -> bool {
        self.bits[idx / WORD_BITS].get_bit(idx % WORD_BITS)
    }

    fn set_allocated(&mut self, idx: usize) {
        if !self.get(idx) {
            self.free_count -= 1;
        }
        self.bits[idx / WORD_BITS].set_bit(idx % WORD_BITS, true);
    }

    fn set_free(&mut self, idx: usize) {
        if self.get(idx) {
            self.free_count += 1;
        }
        self.bits[idx / WORD_BITS].set_bit(idx % WORD_BITS, false);
    }

    fn idx_to_frame(&self, idx: usize) -> PhysFrame {
        PhysFrame::containing_address(PhysAddr::new((self.base_frame + idx as u64) * PAGE_SIZE as u64))
    }

    fn frame_to_idx(&self, frame: PhysFrame) -> usize {
        (frame.start_address().as_u64() / PAGE_SIZE as u64 - self.base_frame) as usize
    }

    /// Allocate a single free frame, first-fit.
    pub fn alloc_block(&mut self) -> Option<PhysFrame> {
        for idx in 0..self.frame_count {
            if !self.get(idx) {
                self.set_allocated(idx);
                return Some(self.idx_to_frame(idx));
            }
        }
        None
    }

    /// Allocate `n` contiguous free frames, first-fit over runs.
    pub fn alloc_blocks(&mut self, n: usize) -> Option<PhysFrame> {
        if n == 0 {
            return None;
        }
        let mut run_start = None;
        let mut run_len = 0;
        for idx in 0..self.frame_count {
            if !self.get(idx) {
                if run_start.is_none() {
                    run_start = Some(idx);
                }
                run_len += 1;
                if run_len == n {
                    let start = run_start.unwrap();
                    for i in start..start + n {
                        self.set_allocated(i);
                    }
                    return Some(self.idx_to_frame(start));
                }
            } else {
                run_start = None;
                run_len = 0;
            }
        }
        None
    }

    /// Free a single frame. Idempotent: freeing an already-free frame is
    /// a no-op rather than a double-free bug.
    pub fn free_block(&mut self, frame: PhysFrame) {
        let idx = self.frame_to_idx(frame);
        if idx < self.frame_count {
            self.set_free(idx);
        }
    }

    pub fn free_blocks(&mut self, frame: PhysFrame, n: usize) {
        let start = self.frame_to_idx(frame);
        for i in start..(start + n).min(self.frame_count) {
            self.set_free(i);
        }
    }

    /// Frames currently free.
    pub fn count(&self) -> usize {
        self.free_count
    }

    pub fn total(&self) -> usize {
        self.frame_count
    }
}

unsafe impl FrameAllocator<Size4KiB> for FrameBitmap {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        self.alloc_block()
    }
}

impl x86_64::structures::paging::FrameDeallocator<Size4KiB> for FrameBitmap {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame) {
        self.free_block(frame);
    }
}

#[cfg(not(target_os = "none"))]
#[cfg(test)]
mod tests {
    use super::*;

    fn bitmap_of(frame_count: usize) -> FrameBitmap {
        let mut bm = FrameBitmap::empty();
        bm.frame_count = frame_count;
        bm.free_count = frame_count;
        bm
    }

    #[test]
    fn alloc_free_round_trip() {
        let mut bm = bitmap_of(128);
        let f1 = bm.alloc_block().unwrap();
        assert_eq!(bm.count(), 127);
        bm.free_block(f1);
        assert_eq!(bm.count(), 128);
    }

    #[test]
    fn double_free_is_idempotent() {
        let mut bm = bitmap_of(64);
        let f1 = bm.alloc_block().unwrap();
        bm.free_block(f1);
        bm.free_block(f1);
        assert_eq!(bm.count(), 64);
    }

    #[test]
    fn alloc_blocks_finds_contiguous_run() {
        let mut bm = bitmap_of(64);
        let run = bm.alloc_blocks(4).unwrap();
        assert_eq!(bm.count(), 60);
        bm.free_blocks(run, 4);
        assert_eq!(bm.count(), 64);
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut bm = bitmap_of(4);
        for _ in 0..4 {
            assert!(bm.alloc_block().is_some());
        }
        assert!(bm.alloc_block().is_none());
    }

    #[test]
    fn first_fit_prefers_lowest_free_run() {
        let mut bm = bitmap_of(16);
        let a = bm.alloc_block().unwrap();
        let _b = bm.alloc_block().unwrap();
        bm.free_block(a);
        let c = bm.alloc_block().unwrap();
        assert_eq!(a, c);
    }
}
