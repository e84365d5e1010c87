//! # kite-syscall
//!
//! The syscall ABI shared between the Kite kernel and user space: call
//! numbers, the wire-format parameter record, per-call payload records,
//! and the error codes returned in the architecture's first return
//! register.
//!
//! # Calling convention
//!
//! One register holds the syscall number, a second holds a pointer to the
//! call-specific payload, and the result comes back in the first return
//! register (`rdi`/`rsi`/`rax` on x86_64, `x0`/`x1`/`x0` on AArch64).

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod error;
pub mod ifaces;
pub mod numbers;
pub mod param;

pub use error::{KernelError, SyscallResult};
pub use numbers::Syscall;
pub use param::{MethodData, SignalData, SyscallParam, TargetedSignalData};
