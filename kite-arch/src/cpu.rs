//! CPU-level primitives
//!
//! Interrupt masking, the per-core pointer, and halt loops, dispatched to
//! the architecture backends. Test builds run in user mode on the host,
//! so the privileged operations compile to no-ops there.

/// Save the current interrupt state and disable interrupts.
///
/// Returns an opaque value for [`restore_interrupts`].
#[cfg(not(test))]
#[inline]
pub fn disable_interrupts() -> u64 {
    crate::native::cpu::disable_interrupts()
}

/// Restore interrupt state previously saved by [`disable_interrupts`].
#[cfg(not(test))]
#[inline]
pub fn restore_interrupts(saved: u64) {
    crate::native::cpu::restore_interrupts(saved);
}

#[cfg(test)]
#[inline]
pub fn disable_interrupts() -> u64 {
    0
}

#[cfg(test)]
#[inline]
pub fn restore_interrupts(_saved: u64) {}

/// Enable interrupts unconditionally.
#[inline]
pub fn enable_interrupts() {
    crate::native::cpu::enable_interrupts();
}

/// Halt this core forever.
#[inline]
pub fn halt() -> ! {
    crate::native::cpu::halt()
}

/// Wait for the next interrupt.
#[inline]
pub fn wait_for_interrupt() {
    crate::native::cpu::wait_for_interrupt();
}

/// Install the per-core pointer for the calling core.
///
/// The pointer survives every user/kernel transition and is readable in
/// O(1) from any kernel entry via [`core_local_ptr`].
///
/// # Safety
///
/// `ptr` must point to a live per-core structure laid out with the
/// kernel-stack and saved-user-stack slots at
/// [`crate::CORE_LOCAL_KERNEL_STACK_OFFSET`] and
/// [`crate::CORE_LOCAL_USER_STACK_OFFSET`], and must stay valid for the
/// lifetime of the core.
pub unsafe fn set_core_local_ptr(ptr: *mut u8) {
    // SAFETY: Forwarded to the caller's contract.
    unsafe { crate::native::cpu::set_core_local_ptr(ptr) }
}

/// Read back the per-core pointer installed by [`set_core_local_ptr`].
///
/// Returns null before installation.
#[inline]
#[must_use]
pub fn core_local_ptr() -> *mut u8 {
    crate::native::cpu::core_local_ptr()
}

/// Identify the calling core as the hardware numbers it (LAPIC id on
/// x86_64, MPIDR affinity on AArch64). Only meaningful before the
/// per-core structure is installed; after that the kernel carries its own
/// core index.
#[inline]
#[must_use]
pub fn hardware_core_id() -> u32 {
    crate::native::cpu::hardware_core_id()
}
