//! Page-fault handling
//!
//! The one recoverable fault is a write to a present page tagged
//! copy-on-write: the frame is duplicated, remapped writable, and the
//! old frame's reference dropped. Everything else is fatal: the handler
//! prints the saved register state to the serial console and halts the
//! core.

use kite_arch::hooks::FaultInfo;
use kite_arch::{InterruptFrame, cpu};
use kite_common::memory::page;
use kite_paging::arch::NativeTlb;

use super::KernelFrames;
use crate::task;

/// Attempt to resolve a page fault; `false` sends it to
/// [`fatal_fault`].
///
/// Only the current thread is observable between the TLB invalidations
/// the resolution performs, because the task lock is held throughout.
pub fn page_fault(info: &FaultInfo, _frame: &mut InterruptFrame) -> bool {
    if !info.write {
        return false;
    }

    let fault_page = page::align_down_4k(info.address as usize) as u64;

    task::with_current_space(|space| {
        space
            .resolve_cow_fault(fault_page, &mut KernelFrames, &NativeTlb)
            .is_ok()
    })
    .unwrap_or(false)
}

/// Print the fault and the saved register state, then halt this core.
pub fn fatal_fault(info: &FaultInfo, frame: &InterruptFrame) -> ! {
    log::error!("=== PANIC! ===");
    #[cfg(target_arch = "x86_64")]
    log::error!(
        " - unhandled {} @ {:#018x}",
        kite_arch::native::idt::exception_name(info.code),
        frame.instruction_pointer()
    );
    #[cfg(not(target_arch = "x86_64"))]
    log::error!(
        " - unhandled exception class {:#x} @ {:#018x}",
        info.code,
        frame.instruction_pointer()
    );

    log::error!("{:#x?}", frame);
    log::error!(
        "fault address {:#018x} (error {:#x}, write={}, user={})",
        info.address,
        info.error,
        info.write,
        info.user
    );

    cpu::halt();
}
