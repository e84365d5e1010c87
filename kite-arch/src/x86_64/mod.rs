//! x86_64 backend
//!
//! Descriptor tables, the interrupt stubs that materialise full
//! [`frame::InterruptFrame`]s, the local APIC and its timer, the 16550
//! debug console, and the `syscall` fast path.

pub mod apic;
pub mod cpu;
pub mod frame;
pub mod gdt;
pub mod idt;
pub mod serial;
pub mod syscall;

/// Bring up the boot core: descriptor tables, interrupt table and the
/// syscall MSRs.
///
/// # Safety
///
/// Must run once per core, with a valid per-core kernel stack, before
/// interrupts are enabled.
pub unsafe fn init_core(core_id: usize, kernel_stack_top: u64) {
    // SAFETY: Forwarded to the caller's contract.
    unsafe {
        gdt::init(core_id, kernel_stack_top);
        idt::init();
        syscall::init();
    }
}
