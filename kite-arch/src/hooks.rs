//! Kernel handler registration
//!
//! The low-level entry code (interrupt stubs, exception vectors, syscall
//! entry) dispatches into handlers the kernel registers here during boot.
//! Registration happens once, before interrupts are enabled, so plain
//! atomic function-pointer slots are enough.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::InterruptFrame;

/// Details of a CPU fault delivered to the kernel.
#[derive(Debug, Clone, Copy)]
pub struct FaultInfo {
    /// Architecture fault code (vector number or exception class).
    pub code: u64,
    /// Architecture error code (error code or exception syndrome).
    pub error: u64,
    /// Faulting address, when the fault carries one.
    pub address: u64,
    /// The access that faulted was a write.
    pub write: bool,
    /// The fault came from user mode.
    pub user: bool,
}

/// Handler for the periodic timer tick.
pub type TimerTickFn = fn(&mut InterruptFrame);
/// Handler for the syscall instruction.
pub type SyscallFn = fn(&mut InterruptFrame);
/// Handler for page faults; returns true when the fault was resolved.
pub type PageFaultFn = fn(&FaultInfo, &mut InterruptFrame) -> bool;
/// Handler of last resort for unresolved faults; never returns.
pub type FatalFaultFn = fn(&FaultInfo, &InterruptFrame) -> !;

static TIMER_TICK: AtomicUsize = AtomicUsize::new(0);
static SYSCALL: AtomicUsize = AtomicUsize::new(0);
static PAGE_FAULT: AtomicUsize = AtomicUsize::new(0);
static FATAL_FAULT: AtomicUsize = AtomicUsize::new(0);

/// Register the timer-tick handler.
pub fn set_timer_tick(handler: TimerTickFn) {
    TIMER_TICK.store(handler as usize, Ordering::Release);
}

/// Register the syscall handler.
pub fn set_syscall(handler: SyscallFn) {
    SYSCALL.store(handler as usize, Ordering::Release);
}

/// Register the page-fault handler.
pub fn set_page_fault(handler: PageFaultFn) {
    PAGE_FAULT.store(handler as usize, Ordering::Release);
}

/// Register the fatal-fault handler.
pub fn set_fatal_fault(handler: FatalFaultFn) {
    FATAL_FAULT.store(handler as usize, Ordering::Release);
}

/// Dispatch a timer tick to the kernel. No-op before registration.
pub fn timer_tick(frame: &mut InterruptFrame) {
    let raw = TIMER_TICK.load(Ordering::Acquire);
    if raw != 0 {
        // SAFETY: The slot only ever holds a TimerTickFn.
        let handler: TimerTickFn = unsafe { core::mem::transmute(raw) };
        handler(frame);
    }
}

/// Dispatch a syscall to the kernel. No-op before registration.
pub fn syscall(frame: &mut InterruptFrame) {
    let raw = SYSCALL.load(Ordering::Acquire);
    if raw != 0 {
        // SAFETY: The slot only ever holds a SyscallFn.
        let handler: SyscallFn = unsafe { core::mem::transmute(raw) };
        handler(frame);
    }
}

/// Dispatch a page fault to the kernel.
///
/// Returns false (unresolved) before registration.
pub fn page_fault(info: &FaultInfo, frame: &mut InterruptFrame) -> bool {
    let raw = PAGE_FAULT.load(Ordering::Acquire);
    if raw != 0 {
        // SAFETY: The slot only ever holds a PageFaultFn.
        let handler: PageFaultFn = unsafe { core::mem::transmute(raw) };
        handler(info, frame)
    } else {
        false
    }
}

/// Dispatch an unresolved fault to the kernel; halts this core if no
/// handler is registered yet.
pub fn fatal_fault(info: &FaultInfo, frame: &InterruptFrame) -> ! {
    let raw = FATAL_FAULT.load(Ordering::Acquire);
    if raw != 0 {
        // SAFETY: The slot only ever holds a FatalFaultFn.
        let handler: FatalFaultFn = unsafe { core::mem::transmute(raw) };
        handler(info, frame)
    }
    crate::cpu::halt();
}
