//! Page Frame Allocator
//!
//! Tracks ownership of every physical page with a bitmap: bit `i` set
//! means frame `base + i * 4 KiB` is owned by someone. An optional
//! 16-bit reference count per frame backs copy-on-write sharing; a
//! decrement that reaches zero clears the ownership bit.
//!
//! The allocator is O(total frames) per allocation. That is fine: it is
//! only invoked for kernel structures and copy-on-write faults, never
//! per user allocation.

use core::sync::atomic::{AtomicBool, Ordering};

use kite_arch::IrqSpinMutex;
use kite_common::memory::{MemoryMapView, page};
use kite_paging::phys_to_virt;

/// Errors from frame-allocator operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// The address lies outside `[base, base + length)`.
    OutOfRange,
    /// No run of free frames was large enough.
    OutOfMemory,
}

/// Bitmap allocator over the machine's physical memory.
pub struct PageFrameAllocator {
    /// Lowest physical address in the map.
    base: u64,
    /// Bytes covered from `base`.
    length: u64,
    /// One bit per frame, 1 = owned.
    bitmap: &'static mut [u8],
    /// Optional per-frame reference counts, in a separately allocated
    /// region.
    refcounts: Option<&'static mut [u16]>,
}

impl PageFrameAllocator {
    /// Build the allocator from the boot memory map.
    ///
    /// The first conventional region hosts the bitmap. Everything starts
    /// locked; conventional ranges are then cleared and the bitmap's own
    /// frames re-locked.
    ///
    /// # Safety
    ///
    /// The map must describe this machine's RAM, and the chosen bitmap
    /// region must be writable through the direct map.
    pub unsafe fn from_memory_map(map: &MemoryMapView) -> Result<Self, FrameError> {
        let mut base = u64::MAX;
        let mut end = 0u64;
        let mut bitmap_addr = 0u64;

        for desc in map.iter() {
            if desc.is_conventional() && bitmap_addr == 0 {
                bitmap_addr = desc.physical_start;
            }
            base = base.min(desc.physical_start);
            end = end.max(desc.end());
        }

        if bitmap_addr == 0 || base >= end {
            return Err(FrameError::OutOfMemory);
        }

        let length = end - base;
        let frame_count = (length / page::SIZE_4K as u64) as usize;
        let bitmap_len = frame_count.div_ceil(8);

        // SAFETY: The bitmap region is conventional RAM per the caller's
        // contract, and nothing else owns it yet.
        let bitmap = unsafe {
            core::slice::from_raw_parts_mut(phys_to_virt(bitmap_addr) as *mut u8, bitmap_len)
        };
        bitmap.fill(0xFF);

        let mut allocator = Self { base, length, bitmap, refcounts: None };

        for desc in map.iter() {
            if desc.is_conventional() {
                allocator.set_lock(desc.physical_start, desc.number_of_pages as usize, false)?;
            }
        }

        allocator.set_lock(bitmap_addr, bitmap_len.div_ceil(page::SIZE_4K).max(1), true)?;

        Ok(allocator)
    }

    /// Lowest managed physical address.
    #[inline]
    #[must_use]
    pub const fn base(&self) -> u64 {
        self.base
    }

    /// Bytes covered from [`base`](Self::base).
    #[inline]
    #[must_use]
    pub const fn length(&self) -> u64 {
        self.length
    }

    /// Number of frames covered.
    #[inline]
    #[must_use]
    pub const fn frame_count(&self) -> usize {
        (self.length / page::SIZE_4K as u64) as usize
    }

    /// Borrow the raw bitmap.
    #[must_use]
    pub fn bitmap(&self) -> &[u8] {
        self.bitmap
    }

    #[inline]
    fn frame_index(&self, frame: u64) -> usize {
        ((frame - self.base) / page::SIZE_4K as u64) as usize
    }

    #[inline]
    fn is_locked(&self, index: usize) -> bool {
        self.bitmap[index / 8] & (1 << (index % 8)) != 0
    }

    /// Find the lowest-address run of `count` consecutive free frames.
    ///
    /// Returns the physical address of the first frame, or `None`.
    #[must_use]
    pub fn find_free(&self, count: usize) -> Option<u64> {
        if count == 0 {
            return None;
        }

        let mut run = 0;
        for index in 0..self.frame_count() {
            if self.is_locked(index) {
                run = 0;
            } else {
                run += 1;
                if run == count {
                    let first = index + 1 - count;
                    return Some(self.base + (first * page::SIZE_4K) as u64);
                }
            }
        }
        None
    }

    /// Set or clear `count` ownership bits starting at the frame
    /// containing `frame`.
    pub fn set_lock(&mut self, frame: u64, count: usize, lock: bool) -> Result<(), FrameError> {
        if frame < self.base || frame >= self.base + self.length {
            return Err(FrameError::OutOfRange);
        }
        let start = self.frame_index(frame);
        if start + count > self.frame_count() {
            return Err(FrameError::OutOfRange);
        }
        fill_region(self.bitmap, start, count, lock);
        Ok(())
    }

    /// Allocate `count` contiguous frames.
    #[must_use]
    pub fn alloc_frames(&mut self, count: usize) -> Option<u64> {
        let addr = self.find_free(count)?;
        self.set_lock(addr, count, true).ok()?;
        Some(addr)
    }

    /// Release `count` frames starting at `addr`. Out-of-range releases
    /// are ignored.
    pub fn free_frames(&mut self, addr: u64, count: usize) {
        let _ = self.set_lock(addr, count, false);
    }

    /// Carve the per-frame reference-count array out of free memory and
    /// switch reference counting on.
    pub fn enable_refcounts(&mut self) -> Result<(), FrameError> {
        let frames = self.frame_count();
        let bytes = frames * core::mem::size_of::<u16>();
        let pages = bytes.div_ceil(page::SIZE_4K);

        let addr = self.find_free(pages).ok_or(FrameError::OutOfMemory)?;
        self.set_lock(addr, pages, true)?;

        // SAFETY: The frames were free and are now locked for this array.
        let counts = unsafe {
            core::slice::from_raw_parts_mut(phys_to_virt(addr) as *mut u16, frames)
        };
        counts.fill(0);
        self.refcounts = Some(counts);
        Ok(())
    }

    /// Read a frame's reference count (0 when counting is off).
    #[must_use]
    pub fn refcount(&self, frame: u64) -> u16 {
        if frame < self.base || frame >= self.base + self.length {
            return 0;
        }
        let index = self.frame_index(frame);
        self.refcounts.as_ref().map_or(0, |counts| counts[index])
    }

    /// Increment a frame's reference count.
    pub fn ref_inc(&mut self, frame: u64) {
        if frame < self.base || frame >= self.base + self.length {
            return;
        }
        let index = self.frame_index(frame);
        if let Some(counts) = self.refcounts.as_mut() {
            counts[index] = counts[index].saturating_add(1);
        }
    }

    /// Decrement a frame's reference count, clearing its ownership bit at
    /// zero. Without a refcount array the bit is cleared immediately.
    pub fn ref_dec(&mut self, frame: u64) {
        if frame < self.base || frame >= self.base + self.length {
            return;
        }
        let index = self.frame_index(frame);
        match self.refcounts.as_mut() {
            Some(counts) => {
                counts[index] = counts[index].saturating_sub(1);
                if counts[index] == 0 {
                    fill_region(self.bitmap, index, 1, false);
                }
            }
            None => fill_region(self.bitmap, index, 1, false),
        }
    }

    /// Count free frames. O(n); used for boot logging.
    #[must_use]
    pub fn free_count(&self) -> usize {
        (0..self.frame_count()).filter(|&i| !self.is_locked(i)).count()
    }
}

/// Set or clear a run of bits, masking the partial leading and trailing
/// bytes and byte-filling the middle.
fn fill_region(bitmap: &mut [u8], start: usize, count: usize, value: bool) {
    if count == 0 {
        return;
    }
    let end = start + count;
    let first_full = start.div_ceil(8);
    let last_full = end / 8;

    let apply = |bitmap: &mut [u8], index: usize, mask: u8| {
        if value {
            bitmap[index] |= mask;
        } else {
            bitmap[index] &= !mask;
        }
    };

    if first_full > last_full {
        let mask = (0xFFu8 << (start % 8)) & (0xFFu8 >> (8 - end % 8));
        apply(bitmap, start / 8, mask);
        return;
    }

    if start % 8 != 0 {
        apply(bitmap, start / 8, 0xFFu8 << (start % 8));
    }
    bitmap[first_full..last_full].fill(if value { 0xFF } else { 0x00 });
    if end % 8 != 0 {
        apply(bitmap, last_full, 0xFFu8 >> (8 - end % 8));
    }
}

// -- Global Frame Allocator

/// Global frame allocator instance.
static FRAME_ALLOCATOR: IrqSpinMutex<Option<PageFrameAllocator>> = IrqSpinMutex::new(None);

/// Guard against double initialisation of the frame allocator.
static FRAME_ALLOCATOR_INITIALISED: AtomicBool = AtomicBool::new(false);

/// Initialise the global frame allocator from the boot memory map and
/// switch on reference counting.
///
/// # Safety
///
/// As for [`PageFrameAllocator::from_memory_map`]; call exactly once.
///
/// # Panics
///
/// Panics on double initialisation or when no conventional memory
/// exists, which halts the boot.
pub unsafe fn init(map: &MemoryMapView) {
    if FRAME_ALLOCATOR_INITIALISED.swap(true, Ordering::SeqCst) {
        panic!("frame allocator initialised twice");
    }

    // SAFETY: Forwarded to the caller's contract.
    let mut allocator = unsafe { PageFrameAllocator::from_memory_map(map) }
        .expect("no conventional memory for the frame allocator");
    allocator
        .enable_refcounts()
        .expect("no room for the frame refcount array");

    log::info!(
        "frame allocator: {:#x}..{:#x}, {} frames free",
        allocator.base(),
        allocator.base() + allocator.length(),
        allocator.free_count()
    );

    *FRAME_ALLOCATOR.lock() = Some(allocator);
}

/// Run `f` against the global allocator.
///
/// # Panics
///
/// Panics before [`init`].
pub fn with<R>(f: impl FnOnce(&mut PageFrameAllocator) -> R) -> R {
    let mut guard = FRAME_ALLOCATOR.lock();
    f(guard.as_mut().expect("frame allocator not initialised"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kite_common::PhysAddr;
    use kite_common::memory::{CONVENTIONAL, MemoryDescriptor};
    use std::boxed::Box;
    use std::vec::Vec;

    #[repr(C, align(4096))]
    struct PageBuf([u8; page::SIZE_4K]);

    /// Leak a run of pages and return its base address: fake physical
    /// memory the identity direct map hands straight back.
    fn fake_ram(pages: usize) -> u64 {
        let mut buf = Vec::with_capacity(pages);
        buf.resize_with(pages, || PageBuf([0; page::SIZE_4K]));
        Box::leak(buf.into_boxed_slice()).as_ptr() as u64
    }

    fn conventional(start: u64, pages: u64) -> MemoryDescriptor {
        MemoryDescriptor {
            kind: CONVENTIONAL,
            _pad: 0,
            physical_start: start,
            virtual_start: 0,
            number_of_pages: pages,
            attribute: 0,
        }
    }

    fn view(descs: &'static [MemoryDescriptor]) -> MemoryMapView {
        unsafe {
            MemoryMapView::new(
                PhysAddr::new(descs.as_ptr() as u64),
                core::mem::size_of::<MemoryDescriptor>(),
                descs.len(),
            )
        }
    }

    fn allocator_over(pages: usize) -> PageFrameAllocator {
        let ram = fake_ram(pages);
        let descs = Box::leak(Box::new([conventional(ram, pages as u64)]));
        unsafe { PageFrameAllocator::from_memory_map(&view(descs)) }.unwrap()
    }

    #[test]
    fn test_init_bitmap_shape() {
        // One conventional region of 256 pages: the bitmap is 32 bytes,
        // occupies the first frame, and only that frame is locked.
        let pfa = allocator_over(256);
        assert_eq!(pfa.bitmap().len(), 256 / 8);
        assert!(pfa.is_locked(0));
        for index in 1..256 {
            assert!(!pfa.is_locked(index), "frame {index} unexpectedly locked");
        }
        assert_eq!(pfa.free_count(), 255);
    }

    #[test]
    fn test_find_free_returns_lowest_run() {
        let mut pfa = allocator_over(64);
        let base = pfa.base();

        assert_eq!(pfa.find_free(1), Some(base + page::SIZE_4K as u64));

        // Lock frames 1..=2 so the first two-frame run starts at 3.
        pfa.set_lock(base + page::SIZE_4K as u64, 2, true).unwrap();
        assert_eq!(pfa.find_free(2), Some(base + 3 * page::SIZE_4K as u64));

        assert_eq!(pfa.find_free(0), None);
        assert_eq!(pfa.find_free(64), None);
    }

    #[test]
    fn test_set_lock_half_open_bound() {
        let mut pfa = allocator_over(16);
        let base = pfa.base();
        let last = base + 15 * page::SIZE_4K as u64;

        assert_eq!(pfa.set_lock(last, 1, true), Ok(()));
        assert!(pfa.is_locked(15));
        assert_eq!(
            pfa.set_lock(base + 16 * page::SIZE_4K as u64, 1, true),
            Err(FrameError::OutOfRange)
        );
        assert_eq!(pfa.set_lock(base - 1, 1, true), Err(FrameError::OutOfRange));
        assert_eq!(pfa.set_lock(last, 2, true), Err(FrameError::OutOfRange));
    }

    #[test]
    fn test_refcounts_clear_bit_at_zero() {
        let mut pfa = allocator_over(64);
        pfa.enable_refcounts().unwrap();

        let frame = pfa.alloc_frames(1).unwrap();
        pfa.ref_inc(frame);
        pfa.ref_inc(frame);
        assert_eq!(pfa.refcount(frame), 2);

        pfa.ref_dec(frame);
        assert!(pfa.is_locked(pfa.frame_index(frame)));
        pfa.ref_dec(frame);
        assert!(!pfa.is_locked(pfa.frame_index(frame)));
        assert_eq!(pfa.refcount(frame), 0);
    }

    #[test]
    fn test_alloc_and_free_roundtrip() {
        let mut pfa = allocator_over(32);
        let free_before = pfa.free_count();

        let run = pfa.alloc_frames(4).unwrap();
        assert_eq!(pfa.free_count(), free_before - 4);
        pfa.free_frames(run, 4);
        assert_eq!(pfa.free_count(), free_before);
    }

    #[test]
    fn test_fill_region_partial_bytes() {
        let mut bitmap = [0u8; 4];
        fill_region(&mut bitmap, 3, 2, true);
        assert_eq!(bitmap, [0b0001_1000, 0, 0, 0]);

        fill_region(&mut bitmap, 6, 4, true);
        assert_eq!(bitmap, [0b1101_1000, 0b0000_0011, 0, 0]);

        fill_region(&mut bitmap, 0, 32, true);
        assert_eq!(bitmap, [0xFF; 4]);

        fill_region(&mut bitmap, 8, 16, false);
        assert_eq!(bitmap, [0xFF, 0, 0, 0xFF]);
    }
}
