//! ARM generic timer
//!
//! The virtual timer drives the per-core preemption tick. Each core arms
//! its own compare value; the tick handler re-arms before dispatching
//! into the scheduler.

use core::sync::atomic::{AtomicU64, Ordering};

use aarch64_cpu::registers::{CNTFRQ_EL0, CNTV_CTL_EL0, CNTV_CVAL_EL0, CNTVCT_EL0};
use tock_registers::interfaces::{Readable, Writeable};

/// PPI interrupt id of the virtual timer.
pub const TIMER_INTID: u32 = 27;

/// Preemption frequency.
const TICK_HZ: u64 = 100;

/// Counter frequency, set once at init and read on every re-arm.
static TIMER_FREQ: AtomicU64 = AtomicU64::new(0);

/// Timer control register bits
mod ctl {
    /// Timer enabled
    pub const ENABLE: u64 = 1 << 0;
}

fn ticks_per_interval() -> u64 {
    let freq = TIMER_FREQ.load(Ordering::Relaxed);
    freq / TICK_HZ
}

/// Start the periodic tick on the calling core.
pub fn start() {
    let freq = CNTFRQ_EL0.get();
    TIMER_FREQ.store(freq, Ordering::Relaxed);

    CNTV_CVAL_EL0.set(CNTVCT_EL0.get() + freq / TICK_HZ);
    CNTV_CTL_EL0.set(ctl::ENABLE);
}

/// Arm the next tick; called from the IRQ path before dispatch.
pub fn rearm() {
    CNTV_CVAL_EL0.set(CNTVCT_EL0.get() + ticks_per_interval());
}

/// Raw counter value, for coarse timestamps.
#[must_use]
pub fn read_counter() -> u64 {
    CNTVCT_EL0.get()
}
