//! x86_64 CPU primitives

use x86_64::VirtAddr;
use x86_64::instructions::interrupts;
use x86_64::registers::model_specific::{GsBase, KernelGsBase};
use x86_64::registers::rflags;

const RFLAGS_IF: u64 = 1 << 9;

/// Save RFLAGS and mask interrupts.
#[inline]
pub fn disable_interrupts() -> u64 {
    let saved = rflags::read_raw();
    interrupts::disable();
    saved
}

/// Restore the interrupt flag from a saved RFLAGS value.
#[inline]
pub fn restore_interrupts(saved: u64) {
    if saved & RFLAGS_IF != 0 {
        interrupts::enable();
    }
}

/// Enable interrupts unconditionally.
#[inline]
pub fn enable_interrupts() {
    interrupts::enable();
}

/// Mask interrupts and halt forever.
pub fn halt() -> ! {
    loop {
        interrupts::disable();
        x86_64::instructions::hlt();
    }
}

/// Halt until the next interrupt.
#[inline]
pub fn wait_for_interrupt() {
    x86_64::instructions::hlt();
}

/// Install the per-core pointer.
///
/// Both GS bases get the same value: in-kernel code reads the live
/// `GS.base`, and the `swapgs` pair on every user transition keeps the
/// two slots consistent as long as user code never loads its own base.
///
/// # Safety
///
/// See [`crate::cpu::set_core_local_ptr`].
pub unsafe fn set_core_local_ptr(ptr: *mut u8) {
    GsBase::write(VirtAddr::new(ptr as u64));
    KernelGsBase::write(VirtAddr::new(ptr as u64));
}

/// Read the per-core pointer.
#[inline]
#[must_use]
pub fn core_local_ptr() -> *mut u8 {
    GsBase::read().as_u64() as *mut u8
}

/// The local APIC id of the calling CPU, via CPUID.
#[inline]
#[must_use]
pub fn hardware_core_id() -> u32 {
    // SAFETY: CPUID leaf 1 is available on every 64-bit CPU.
    let ebx = unsafe { core::arch::x86_64::__cpuid(1).ebx };
    ebx >> 24
}
