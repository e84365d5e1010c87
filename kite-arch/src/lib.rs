//! # kite-arch
//!
//! Architecture support for the Kite kernel. The kernel proper is
//! architecture-neutral; everything that touches rings, exception levels,
//! descriptor tables, interrupt controllers or serial hardware lives here,
//! behind a small shared surface:
//!
//! - [`sync::IrqSpinMutex`]: the spinlock every kernel global sits behind
//! - [`cpu`]: interrupt masking, the per-core pointer, halting
//! - [`InterruptFrame`]: the saved context delivered to every interrupt,
//!   fault and syscall handler, and re-installed on return
//! - [`hooks`]: the kernel-registered handlers the low-level entry code
//!   dispatches into
//! - [`console`]: the serial debug sink
//! - timer and SMP start-up entry points per architecture
//!
//! The kernel registers its handlers through [`hooks`] during boot; the
//! reverse direction is all function calls, so this crate never depends on
//! the kernel crate.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

#[cfg(test)]
extern crate std;

pub mod console;
pub mod cpu;
pub mod hooks;
pub mod sync;

#[cfg(target_arch = "x86_64")]
pub mod x86_64;
#[cfg(target_arch = "x86_64")]
pub use crate::x86_64 as native;

#[cfg(target_arch = "aarch64")]
pub mod aarch64;
#[cfg(target_arch = "aarch64")]
pub use crate::aarch64 as native;

pub use hooks::FaultInfo;
pub use native::frame::InterruptFrame;
pub use sync::IrqSpinMutex;

/// Byte offset of the kernel stack pointer slot inside the per-core
/// structure. The syscall entry path loads it gs-relative before any Rust
/// code can run, so the kernel's `CoreBase` layout must pin it here.
pub const CORE_LOCAL_KERNEL_STACK_OFFSET: usize = 8;

/// Byte offset of the saved user stack pointer slot inside the per-core
/// structure, written by the syscall entry path.
pub const CORE_LOCAL_USER_STACK_OFFSET: usize = 16;
