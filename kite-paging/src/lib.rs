//! # kite-paging
//!
//! Page-table management for the Kite kernel: an architecture-
//! parameterised 4-level radix walker keyed on the virtual address, with
//! the operations the rest of the kernel builds on: mapping, unmapping,
//! sharing the kernel half into every address space, copy-on-write
//! forking, fault resolution and teardown.
//!
//! # Architecture
//!
//! - [`flags`]: the neutral `{WRITE, USER, COW}` permission set
//! - [`frames`]: the allocation/refcount seam ([`frames::FrameSource`])
//!   and the TLB seam ([`frames::TlbInvalidate`]), so the walker itself
//!   stays free of hardware access
//! - [`arch`]: per-architecture leaf and table-entry encodings plus the
//!   live TLB/root-register operations
//! - [`space`]: the walker and the address-space operations
//!
//! # Physical-to-Virtual Mapping
//!
//! The walker touches tables through [`phys_to_virt`]. The default is
//! identity (physical == virtual), which matches the boot environment;
//! a kernel with a direct map elsewhere calls
//! [`set_phys_to_virt_offset`] once during initialisation.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

#[cfg(test)]
extern crate std;

use spin::Once;

pub mod arch;
pub mod flags;
pub mod frames;
pub mod space;

pub use flags::PageFlags;
pub use frames::{FrameSource, NoOpInvalidator, TlbInvalidate};
pub use space::{AddressSpace, MapError};

/// Page size constant (4 KiB)
pub const PAGE_SIZE: usize = 4096;

/// Number of entries per page table (512 for the 4 KiB granule)
pub const ENTRIES_PER_TABLE: usize = 512;

/// First virtual address of the kernel half. Everything at or above this
/// boundary is shared between all address spaces; everything below is
/// per-process.
pub const KERNEL_BASE: u64 = 0xFFFF_FFFF_F800_0000;

// Compile-time verification of paging constants
const _: () = assert!(PAGE_SIZE.is_power_of_two(), "PAGE_SIZE must be a power of two");
const _: () = assert!(ENTRIES_PER_TABLE == 512, "4 KiB granule requires 512 entries per table");
const _: () = assert!(KERNEL_BASE & 0x1F_FFFF == 0, "kernel base must sit on an L2 boundary");

/// Physical-to-virtual offset (initialised once during kernel init).
static PHYS_TO_VIRT_OFFSET: Once<u64> = Once::new();

/// Set the offset to add to physical addresses when touching page-table
/// memory. Can only be set once; later calls are ignored.
pub fn set_phys_to_virt_offset(offset: u64) {
    PHYS_TO_VIRT_OFFSET.call_once(|| offset);
}

/// Get the current physical-to-virtual offset (0 = identity).
#[inline]
#[must_use]
pub fn phys_to_virt_offset() -> u64 {
    PHYS_TO_VIRT_OFFSET.get().copied().unwrap_or(0)
}

/// Convert a physical address to a kernel-accessible virtual address.
#[inline]
#[must_use]
pub fn phys_to_virt(phys: u64) -> u64 {
    phys.wrapping_add(phys_to_virt_offset())
}
