//! AArch64 CPU primitives

use aarch64_cpu::registers::{DAIF, MPIDR_EL1, TPIDR_EL1};
use tock_registers::interfaces::{Readable, Writeable};

/// Save DAIF and mask IRQs.
#[inline]
pub fn disable_interrupts() -> u64 {
    let saved = DAIF.get();
    // SAFETY: Masking IRQs has no memory effects.
    unsafe {
        core::arch::asm!("msr daifset, #2", options(nomem, nostack, preserves_flags));
    }
    saved
}

/// Restore a DAIF value saved by [`disable_interrupts`].
#[inline]
pub fn restore_interrupts(saved: u64) {
    DAIF.set(saved);
}

/// Enable IRQs unconditionally.
#[inline]
pub fn enable_interrupts() {
    // SAFETY: Unmasking IRQs has no memory effects.
    unsafe {
        core::arch::asm!("msr daifclr, #2", options(nomem, nostack, preserves_flags));
    }
}

/// Mask interrupts and halt forever.
pub fn halt() -> ! {
    loop {
        // SAFETY: Masking and waiting have no memory effects.
        unsafe {
            core::arch::asm!("msr daifset, #2", "wfe", options(nomem, nostack, preserves_flags));
        }
    }
}

/// Halt until the next interrupt.
#[inline]
pub fn wait_for_interrupt() {
    // SAFETY: wfi has no memory effects.
    unsafe {
        core::arch::asm!("wfi", options(nomem, nostack, preserves_flags));
    }
}

/// Install the per-core pointer in `TPIDR_EL1`.
///
/// # Safety
///
/// See [`crate::cpu::set_core_local_ptr`].
pub unsafe fn set_core_local_ptr(ptr: *mut u8) {
    TPIDR_EL1.set(ptr as u64);
}

/// Read the per-core pointer.
#[inline]
#[must_use]
pub fn core_local_ptr() -> *mut u8 {
    TPIDR_EL1.get() as *mut u8
}

/// Affinity-0 field of MPIDR, the conventional core number.
#[inline]
#[must_use]
pub fn hardware_core_id() -> u32 {
    (MPIDR_EL1.get() & 0xFF) as u32
}
