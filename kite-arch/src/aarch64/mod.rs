//! AArch64 backend
//!
//! Exception vectors that materialise full [`frame::InterruptFrame`]s,
//! the generic timer, the GIC, the PL011 debug console and PSCI-based
//! secondary-core start-up.

pub mod cpu;
pub mod exceptions;
pub mod frame;
pub mod gic;
pub mod psci;
pub mod serial;
pub mod timer;

/// Bring up the calling core: exception vectors only; the stack was
/// established by the boot path or the AP launch block.
///
/// # Safety
///
/// Must run once per core before interrupts are enabled.
pub unsafe fn init_core(_core_id: usize, _kernel_stack_top: u64) {
    // SAFETY: The vector table is a static in our image.
    unsafe {
        exceptions::install_vectors();
    }
}
