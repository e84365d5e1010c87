//! Memory management
//!
//! Physical frames, the kernel heap, and fault handling. Brought up in
//! that order during boot, before the filesystem needs to allocate.

use core::sync::atomic::{AtomicU64, Ordering};

use kite_common::boot::BootInfo;
use kite_common::memory::page;
use kite_paging::FrameSource;
use kite_paging::phys_to_virt;

pub mod fault;
pub mod frame;
pub mod heap;

pub use frame::{FrameError, PageFrameAllocator};
pub use heap::{KernelAllocator, kfree, kmalloc};

/// Root of the boot address space, captured at init; the kernel half of
/// every process aliases it, and kernel-only mappings (heap pages, ELF
/// mirrors) land in it.
static BOOT_ROOT: AtomicU64 = AtomicU64::new(0);

/// Bring the memory subsystem up: frame allocator with reference counts,
/// boot-root capture, then the heap's first page.
///
/// # Safety
///
/// `boot_info` must be the record the bootloader handed over; call
/// exactly once, before anything allocates.
pub unsafe fn init(boot_info: &BootInfo) {
    // SAFETY: The boot record's memory-map fields are the bootloader's
    // contract.
    unsafe {
        frame::init(&boot_info.memory_map());
    }

    // SAFETY: Paging is on from entry, so the active root is valid.
    let root = unsafe { kite_paging::arch::current_root() };
    BOOT_ROOT.store(root, Ordering::Release);

    // SAFETY: Frame allocator and boot root are ready.
    unsafe {
        heap::init(boot_info);
    }
}

/// The boot address-space root captured by [`init`].
#[must_use]
pub fn boot_root() -> u64 {
    BOOT_ROOT.load(Ordering::Acquire)
}

/// [`FrameSource`] adapter over the global frame allocator, handed to
/// every page-table operation the kernel performs.
pub struct KernelFrames;

impl FrameSource for KernelFrames {
    fn allocate_table(&mut self) -> Option<u64> {
        let pa = frame::with(|f| f.alloc_frames(1))?;
        // SAFETY: Freshly allocated frame, reachable through the direct
        // map.
        unsafe {
            core::ptr::write_bytes(phys_to_virt(pa) as *mut u8, 0, page::SIZE_4K);
        }
        Some(pa)
    }

    fn allocate_frame(&mut self) -> Option<u64> {
        frame::with(|f| f.alloc_frames(1))
    }

    fn allocate_contiguous(&mut self, count: usize) -> Option<u64> {
        frame::with(|f| f.alloc_frames(count))
    }

    fn ref_inc(&mut self, frame: u64) {
        frame::with(|f| f.ref_inc(frame));
    }

    fn ref_dec(&mut self, frame: u64) {
        frame::with(|f| f.ref_dec(frame));
    }

    fn release_frame(&mut self, frame: u64) {
        frame::with(|f| f.free_frames(frame, 1));
    }
}
