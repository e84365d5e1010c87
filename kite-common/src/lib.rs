//! # kite-common
//!
//! Types shared between the Kite bootloader ABI and the kernel proper:
//! the boot handoff record, the UEFI-style memory map, and the address
//! newtypes used across the kernel crates.
//!
//! Everything here is `#[repr(C)]` or `#[repr(transparent)]` so the
//! layout is stable across separately compiled boot stages.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod addr;
pub mod boot;
pub mod memory;

pub use addr::{PhysAddr, VirtAddr};
pub use boot::BootInfo;
pub use memory::{MemoryDescriptor, MemoryMapView};
