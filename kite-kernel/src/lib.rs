//! # kite-kernel
//!
//! The Kite microkernel: a small multi-architecture kernel for x86_64
//! and AArch64 machines booted by a UEFI-style bootloader. A freshly
//! booted machine comes up through the page-frame allocator, the kernel
//! heap, the RAM filesystem, the architecture layer and SMP start-up,
//! then loads `/init` and schedules it; from there every interaction is
//! kernel-mediated message passing between user processes.
//!
//! # Boot Requirements
//!
//! The kernel expects the following state when `_start` is called:
//! - Paging enabled with the boot tables identity-mapping RAM
//! - A stack the boot path can keep using
//! - The first argument register holding a pointer to a
//!   [`BootInfo`](kite_common::boot::BootInfo)
//! - Interrupts disabled

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod acpi;
pub mod elf;
pub mod fs;
pub mod ipc;
pub mod logging;
pub mod memory;
pub mod smp;
pub mod syscall;
pub mod task;

#[cfg(test)]
pub mod testutil;
