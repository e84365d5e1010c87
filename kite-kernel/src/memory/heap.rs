//! Kernel Heap
//!
//! One global arena of doubly-linked blocks whose headers live inline in
//! the heap memory. `malloc` is a first-fit forward scan with in-place
//! splitting; `free` merges eagerly with both neighbours; when the arena
//! runs dry it grows by exactly one page taken from the frame allocator
//! and mapped at the current arena end.
//!
//! The free list itself is not thread-safe; the global wrapper at the
//! bottom serialises it, and kernel paths that can race additionally
//! hold the task lock.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};

use kite_arch::IrqSpinMutex;
use kite_common::boot::BootInfo;
use kite_common::memory::page;
use kite_paging::PageFlags;

use super::{KernelFrames, boot_root, frame};

/// Every payload is aligned to this; header size is a multiple of it.
const HEAP_ALIGN: usize = 16;

/// Arena placement when the bootloader owned neither an initrd nor a
/// framebuffer: past the low memory the kernel image occupies.
const DEFAULT_ARENA_START: usize = 0x0100_0000;

/// Inline block header; the payload follows it immediately.
#[repr(C)]
struct BlockHeader {
    used: bool,
    size: usize,
    prev: *mut BlockHeader,
    next: *mut BlockHeader,
}

const HEADER_SIZE: usize = core::mem::size_of::<BlockHeader>();

const _: () = assert!(HEADER_SIZE % HEAP_ALIGN == 0);

/// The free-list allocator over one contiguous, growable arena.
pub struct FreeListHeap {
    /// Arena bounds; `end` moves up one page per expansion.
    start: usize,
    end: usize,
    first: *mut BlockHeader,
    last: *mut BlockHeader,
}

// SAFETY: The raw block pointers all point into the arena, which the
// owner of the FreeListHeap has exclusive use of.
unsafe impl Send for FreeListHeap {}

impl FreeListHeap {
    /// Build a heap over `[start, start + size)` as one free block.
    ///
    /// # Safety
    ///
    /// The range must be mapped, writable, at least one page, aligned to
    /// [`HEAP_ALIGN`], and used by nothing else.
    pub unsafe fn new(start: usize, size: usize) -> Self {
        let first = start as *mut BlockHeader;
        // SAFETY: Caller guarantees the range.
        unsafe {
            first.write(BlockHeader {
                used: false,
                size: size - HEADER_SIZE,
                prev: ptr::null_mut(),
                next: ptr::null_mut(),
            });
        }
        Self { start, end: start + size, first, last: first }
    }

    /// Exclusive upper bound of the arena.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> usize {
        self.end
    }

    /// Allocate `size` bytes; first fit, splitting when the surplus
    /// exceeds two headers. Returns the address just past the chosen
    /// header.
    #[must_use]
    pub fn malloc(&mut self, size: usize) -> Option<ptr::NonNull<u8>> {
        let need = size.max(1).div_ceil(HEAP_ALIGN) * HEAP_ALIGN;

        let mut cursor = self.first;
        while !cursor.is_null() {
            // SAFETY: cursor came from the list, whose headers all live
            // in the arena.
            let block = unsafe { &mut *cursor };
            if !block.used && block.size >= need {
                if block.size > need + 2 * HEADER_SIZE {
                    // SAFETY: The block is large enough to carry a second
                    // header plus payload.
                    unsafe { self.split(cursor, need) };
                }
                block.used = true;
                let payload = (cursor as usize + HEADER_SIZE) as *mut u8;
                return ptr::NonNull::new(payload);
            }
            cursor = block.next;
        }
        None
    }

    /// Split `block` so its payload is exactly `size`, leaving the tail
    /// as a free block.
    ///
    /// # Safety
    ///
    /// `block` must be a live header with `size > size + 2 * HEADER_SIZE`.
    unsafe fn split(&mut self, block: *mut BlockHeader, size: usize) {
        // SAFETY: Caller guarantees the block and the room behind it.
        unsafe {
            let second = (block as usize + HEADER_SIZE + size) as *mut BlockHeader;
            second.write(BlockHeader {
                used: false,
                size: (*block).size - size - HEADER_SIZE,
                prev: block,
                next: (*block).next,
            });
            if !(*second).next.is_null() {
                (*(*second).next).prev = second;
            }
            (*block).next = second;
            (*block).size = size;

            if self.last == block {
                self.last = second;
            }
        }
    }

    /// Merge `second` into `first`; both must be adjacent in memory and
    /// in the list.
    ///
    /// # Safety
    ///
    /// Both must be live headers with `first.next == second`.
    unsafe fn merge(&mut self, first: *mut BlockHeader, second: *mut BlockHeader) {
        // SAFETY: Caller guarantees adjacency.
        unsafe {
            if !(*second).next.is_null() {
                (*(*second).next).prev = first;
            }
            (*first).next = (*second).next;
            (*first).size += (*second).size + HEADER_SIZE;

            if self.last == second {
                self.last = first;
            }
        }
    }

    /// Free the allocation at `ptr`, merging with free neighbours. A
    /// pointer whose header lies outside the arena is ignored.
    pub fn free(&mut self, ptr: *mut u8) {
        let header = (ptr as usize).wrapping_sub(HEADER_SIZE);
        if header < self.start || header >= self.end {
            return;
        }

        let block = header as *mut BlockHeader;
        // SAFETY: The header is inside the arena; free of a live
        // allocation is the caller's contract, out-of-arena was screened.
        unsafe {
            (*block).used = false;
            let next = (*block).next;
            if !next.is_null() && !(*next).used {
                self.merge(block, next);
            }
            let prev = (*block).prev;
            if !prev.is_null() && !(*prev).used {
                self.merge(prev, block);
            }
        }
    }

    /// Absorb one fresh page mapped at the arena end as a trailing free
    /// block, merging with the old tail if that tail is free.
    ///
    /// # Safety
    ///
    /// A writable page must be mapped at `self.end()`.
    pub unsafe fn expand(&mut self) {
        let block = self.end as *mut BlockHeader;
        // SAFETY: Caller mapped the page.
        unsafe {
            block.write(BlockHeader {
                used: false,
                size: page::SIZE_4K - HEADER_SIZE,
                prev: self.last,
                next: ptr::null_mut(),
            });
            self.end += page::SIZE_4K;

            if !self.last.is_null() && !(*self.last).used {
                let tail = self.last;
                self.merge(tail, block);
            } else {
                (*self.last).next = block;
                self.last = block;
            }
        }
    }

    /// Walk the list and check its structural invariants: every header
    /// in-arena and reachable, `prev` the inverse of `next`, physical
    /// adjacency, and no two free neighbours.
    #[must_use]
    pub fn verify(&self) -> bool {
        let mut cursor = self.first;
        let mut prev: *mut BlockHeader = ptr::null_mut();
        let mut previous_free = false;

        while !cursor.is_null() {
            let addr = cursor as usize;
            if addr < self.start || addr + HEADER_SIZE > self.end {
                return false;
            }
            // SAFETY: Bounds were just checked.
            let block = unsafe { &*cursor };
            if block.prev != prev {
                return false;
            }
            if !prev.is_null() {
                // SAFETY: prev was validated on the previous step.
                let expected = prev as usize + HEADER_SIZE + unsafe { (*prev).size };
                if addr != expected {
                    return false;
                }
            }
            if previous_free && !block.used {
                return false;
            }
            previous_free = !block.used;
            prev = cursor;
            cursor = block.next;
        }

        prev == self.last
    }

    /// Number of blocks in the list.
    #[must_use]
    pub fn block_count(&self) -> usize {
        let mut count = 0;
        let mut cursor = self.first;
        while !cursor.is_null() {
            count += 1;
            // SAFETY: List headers live in the arena.
            cursor = unsafe { (*cursor).next };
        }
        count
    }
}

// -- Global Kernel Heap

static KERNEL_HEAP: IrqSpinMutex<Option<FreeListHeap>> = IrqSpinMutex::new(None);

/// Guard against double initialisation of the heap.
static HEAP_INITIALISED: AtomicBool = AtomicBool::new(false);

/// Pick the arena's lower bound: just past whichever bootloader-owned
/// region (initrd, framebuffer) ends highest, or a fixed floor.
fn arena_start(boot_info: &BootInfo) -> usize {
    if boot_info.has_initrd() {
        page::align_down_4k(boot_info.initrd_end() as usize) + page::SIZE_4K
    } else if boot_info.framebuffer.is_present() {
        page::align_down_4k(boot_info.framebuffer.end() as usize) + page::SIZE_4K
    } else {
        DEFAULT_ARENA_START
    }
}

/// Map one fresh frame at the arena end in the boot address space.
fn map_arena_page(at: usize) -> bool {
    let Some(frame) = frame::with(|f| f.alloc_frames(1)) else {
        return false;
    };
    let mapped = kite_paging::space::map::<kite_paging::arch::Native, _>(
        boot_root(),
        at as u64,
        frame,
        PageFlags::KERNEL_WRITE,
        &mut KernelFrames,
    );
    if mapped.is_err() {
        frame::with(|f| f.free_frames(frame, 1));
        return false;
    }
    true
}

/// Initialise the global heap with its first page.
///
/// # Safety
///
/// The frame allocator and boot root must be initialised; call exactly
/// once.
///
/// # Panics
///
/// Panics on double initialisation or when the first page cannot be
/// provided, which halts the boot.
pub unsafe fn init(boot_info: &BootInfo) {
    if HEAP_INITIALISED.swap(true, Ordering::SeqCst) {
        panic!("heap initialised twice");
    }

    let start = arena_start(boot_info);
    assert!(map_arena_page(start), "no memory for the kernel heap");

    // SAFETY: The page was just mapped writable and belongs to the heap.
    let heap = unsafe { FreeListHeap::new(start, page::SIZE_4K) };
    log::info!("kernel heap at {:#x}", start);

    *KERNEL_HEAP.lock() = Some(heap);
}

/// Allocate from the global heap, growing it page by page on demand.
/// Returns null when physical memory is exhausted.
#[must_use]
pub fn kmalloc(size: usize) -> *mut u8 {
    let mut guard = KERNEL_HEAP.lock();
    let Some(heap) = guard.as_mut() else {
        return ptr::null_mut();
    };

    loop {
        if let Some(payload) = heap.malloc(size) {
            return payload.as_ptr();
        }
        if !map_arena_page(heap.end()) {
            return ptr::null_mut();
        }
        // SAFETY: A page is now mapped at the arena end.
        unsafe { heap.expand() };
    }
}

/// Return an allocation to the global heap.
pub fn kfree(ptr: *mut u8) {
    let mut guard = KERNEL_HEAP.lock();
    if let Some(heap) = guard.as_mut() {
        heap.free(ptr);
    }
}

/// `GlobalAlloc` adapter over the kernel heap; the kernel binary installs
/// it as `#[global_allocator]`.
pub struct KernelAllocator;

// SAFETY: kmalloc/kfree implement the GlobalAlloc contract over the
// serialised global heap; alignments beyond HEAP_ALIGN are refused.
unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > HEAP_ALIGN {
            return ptr::null_mut();
        }
        kmalloc(layout.size())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        kfree(ptr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::boxed::Box;

    #[repr(C, align(4096))]
    struct Arena([u8; 2 * page::SIZE_4K]);

    fn fresh_arena() -> (&'static mut Arena, usize) {
        let arena = Box::leak(Box::new(Arena([0; 2 * page::SIZE_4K])));
        let addr = arena as *mut Arena as usize;
        (arena, addr)
    }

    #[test]
    fn test_malloc_free_roundtrip_restores_single_block() {
        let (_arena, addr) = fresh_arena();
        let mut heap = unsafe { FreeListHeap::new(addr, page::SIZE_4K) };

        let p = heap.malloc(100).unwrap();
        unsafe { ptr::write_bytes(p.as_ptr(), 0xAA, 100) };
        assert!(heap.verify());

        heap.free(p.as_ptr());
        assert!(heap.verify());
        assert_eq!(heap.block_count(), 1);
        unsafe {
            let first = &*(addr as *const BlockHeader);
            assert!(!first.used);
            assert_eq!(first.size, page::SIZE_4K - HEADER_SIZE);
        }
    }

    #[test]
    fn test_payloads_are_aligned() {
        let (_arena, addr) = fresh_arena();
        let mut heap = unsafe { FreeListHeap::new(addr, page::SIZE_4K) };
        for size in [1, 7, 30, 100] {
            let p = heap.malloc(size).unwrap();
            assert_eq!(p.as_ptr() as usize % HEAP_ALIGN, 0);
        }
        assert!(heap.verify());
    }

    #[test]
    fn test_free_merges_both_neighbours() {
        let (_arena, addr) = fresh_arena();
        let mut heap = unsafe { FreeListHeap::new(addr, page::SIZE_4K) };

        let a = heap.malloc(64).unwrap();
        let b = heap.malloc(64).unwrap();
        let c = heap.malloc(64).unwrap();
        assert!(heap.verify());

        heap.free(a.as_ptr());
        heap.free(c.as_ptr());
        assert!(heap.verify());
        heap.free(b.as_ptr());
        assert!(heap.verify());
        assert_eq!(heap.block_count(), 1);
    }

    #[test]
    fn test_first_fit_reuses_earliest_hole() {
        let (_arena, addr) = fresh_arena();
        let mut heap = unsafe { FreeListHeap::new(addr, page::SIZE_4K) };

        let a = heap.malloc(96).unwrap();
        let _b = heap.malloc(96).unwrap();
        heap.free(a.as_ptr());

        let again = heap.malloc(32).unwrap();
        assert_eq!(again.as_ptr(), a.as_ptr());
        assert!(heap.verify());
    }

    #[test]
    fn test_free_outside_arena_is_noop() {
        let (_arena, addr) = fresh_arena();
        let mut heap = unsafe { FreeListHeap::new(addr, page::SIZE_4K) };
        let p = heap.malloc(64).unwrap();

        heap.free(core::ptr::null_mut());
        heap.free((addr + 3 * page::SIZE_4K) as *mut u8);
        heap.free(0x10 as *mut u8);

        assert!(heap.verify());
        heap.free(p.as_ptr());
        assert_eq!(heap.block_count(), 1);
    }

    #[test]
    fn test_expand_merges_free_tail() {
        let (_arena, addr) = fresh_arena();
        let mut heap = unsafe { FreeListHeap::new(addr, page::SIZE_4K) };

        // The second arena page is already present in the test buffer,
        // standing in for the page the kernel would map there.
        unsafe { heap.expand() };
        assert!(heap.verify());
        assert_eq!(heap.block_count(), 1);
        unsafe {
            let first = &*(addr as *const BlockHeader);
            assert_eq!(first.size, 2 * page::SIZE_4K - HEADER_SIZE);
        }

        // A used tail stays separate.
        let p = heap.malloc(2 * page::SIZE_4K - 3 * HEADER_SIZE).unwrap();
        assert!(heap.verify());
        heap.free(p.as_ptr());
        assert_eq!(heap.block_count(), 1);
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let (_arena, addr) = fresh_arena();
        let mut heap = unsafe { FreeListHeap::new(addr, page::SIZE_4K) };
        assert!(heap.malloc(page::SIZE_4K).is_none());
        assert!(heap.malloc(page::SIZE_4K - HEADER_SIZE).is_some());
    }
}
