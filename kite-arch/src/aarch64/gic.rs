//! GICv2 interrupt controller
//!
//! Just enough of the distributor and CPU interface for the kernel's
//! needs: setup, enabling the timer PPI, and the acknowledge/EOI pair
//! around each dispatched IRQ.

use arm_gic::IntId;
use arm_gic::gicv2::GicV2;

use crate::sync::IrqSpinMutex;

use super::timer::TIMER_INTID;

/// QEMU `virt` machine defaults, overridable at init.
const GICD_DEFAULT_BASE: u64 = 0x0800_0000;
const GICC_DEFAULT_BASE: u64 = 0x0801_0000;

struct GicState(Option<GicV2<'static>>);

// SAFETY: The GIC registers are only touched through the mutex below.
unsafe impl Send for GicState {}

static GIC: IrqSpinMutex<GicState> = IrqSpinMutex::new(GicState(None));

/// Initialise the distributor and this core's CPU interface.
///
/// # Safety
///
/// The addresses (or the defaults) must be the GIC's device memory,
/// accessible at their physical addresses; call once from the boot core.
pub unsafe fn init(gicd_base: Option<u64>, gicc_base: Option<u64>) {
    let gicd = gicd_base.unwrap_or(GICD_DEFAULT_BASE) as *mut _;
    let gicc = gicc_base.unwrap_or(GICC_DEFAULT_BASE) as *mut _;

    // SAFETY: Caller guarantees the register blocks; nothing else touches
    // them.
    let mut gic = unsafe { GicV2::new(gicd, gicc) };
    gic.setup();
    gic.set_priority_mask(0xFF);

    GIC.lock().0 = Some(gic);
}

/// Enable this core's CPU interface and the timer PPI.
pub fn enable_local() {
    let mut guard = GIC.lock();
    if let Some(gic) = guard.0.as_mut() {
        gic.enable_interrupt(IntId::ppi(TIMER_INTID - 16), true);
    }
}

/// Acknowledge the highest-priority pending interrupt, run `handler`
/// with its id, then signal end-of-interrupt.
pub fn with_acknowledged(handler: impl FnOnce(u32)) {
    let mut guard = GIC.lock();
    let Some(gic) = guard.0.as_mut() else { return };

    if let Some(intid) = gic.get_and_acknowledge_interrupt() {
        handler(u32::from(intid));
        gic.end_interrupt(intid);
    }
}
