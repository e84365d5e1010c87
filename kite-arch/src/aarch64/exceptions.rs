//! Exception vectors
//!
//! The vector table saves the complete register file into an
//! [`InterruptFrame`](super::frame::InterruptFrame) on the kernel stack,
//! hands it to the Rust dispatchers below, and restores it with `eret`.
//! Lower-EL synchronous exceptions carry both syscalls (SVC) and page
//! faults; IRQs route through the GIC to the timer tick.

use core::arch::global_asm;

use aarch64_cpu::registers::{ESR_EL1, FAR_EL1, VBAR_EL1};
use tock_registers::interfaces::{Readable, Writeable};

use super::frame::InterruptFrame;
use super::{gic, timer};
use crate::hooks::{self, FaultInfo};

/// Exception classes we route (ESR_EL1.EC).
const EC_SVC64: u64 = 0b010101;
const EC_INSTR_ABORT_LOWER: u64 = 0b100000;
const EC_DATA_ABORT_LOWER: u64 = 0b100100;
const EC_DATA_ABORT_SAME: u64 = 0b100101;

global_asm!(
    r#"
.macro save_context
    sub sp, sp, #272
    stp x0, x1, [sp, #16 * 0]
    stp x2, x3, [sp, #16 * 1]
    stp x4, x5, [sp, #16 * 2]
    stp x6, x7, [sp, #16 * 3]
    stp x8, x9, [sp, #16 * 4]
    stp x10, x11, [sp, #16 * 5]
    stp x12, x13, [sp, #16 * 6]
    stp x14, x15, [sp, #16 * 7]
    stp x16, x17, [sp, #16 * 8]
    stp x18, x19, [sp, #16 * 9]
    stp x20, x21, [sp, #16 * 10]
    stp x22, x23, [sp, #16 * 11]
    stp x24, x25, [sp, #16 * 12]
    stp x26, x27, [sp, #16 * 13]
    stp x28, x29, [sp, #16 * 14]
    str x30, [sp, #240]
    mrs x10, sp_el0
    mrs x11, elr_el1
    mrs x12, spsr_el1
    stp x10, x11, [sp, #248]
    str x12, [sp, #264]
.endm

.macro restore_context
    ldp x10, x11, [sp, #248]
    ldr x12, [sp, #264]
    msr sp_el0, x10
    msr elr_el1, x11
    msr spsr_el1, x12
    ldp x0, x1, [sp, #16 * 0]
    ldp x2, x3, [sp, #16 * 1]
    ldp x4, x5, [sp, #16 * 2]
    ldp x6, x7, [sp, #16 * 3]
    ldp x8, x9, [sp, #16 * 4]
    ldp x10, x11, [sp, #16 * 5]
    ldp x12, x13, [sp, #16 * 6]
    ldp x14, x15, [sp, #16 * 7]
    ldp x16, x17, [sp, #16 * 8]
    ldp x18, x19, [sp, #16 * 9]
    ldp x20, x21, [sp, #16 * 10]
    ldp x22, x23, [sp, #16 * 11]
    ldp x24, x25, [sp, #16 * 12]
    ldp x26, x27, [sp, #16 * 13]
    ldp x28, x29, [sp, #16 * 14]
    ldr x30, [sp, #240]
    add sp, sp, #272
.endm

sync_entry:
    save_context
    mov x0, sp
    bl sync_exception_dispatch
    restore_context
    eret

irq_entry:
    save_context
    mov x0, sp
    bl irq_dispatch
    restore_context
    eret

invalid_entry:
    save_context
    mov x0, sp
    mrs x1, esr_el1
    bl invalid_vector_dispatch
1:
    wfe
    b 1b

.balign 0x800
.global exception_vector_table
exception_vector_table:
    // Current EL with SP_EL0: never used, SPSel stays 1.
    .balign 0x80
    b invalid_entry
    .balign 0x80
    b invalid_entry
    .balign 0x80
    b invalid_entry
    .balign 0x80
    b invalid_entry
    // Current EL with SP_ELx.
    .balign 0x80
    b sync_entry
    .balign 0x80
    b irq_entry
    .balign 0x80
    b invalid_entry
    .balign 0x80
    b invalid_entry
    // Lower EL, AArch64.
    .balign 0x80
    b sync_entry
    .balign 0x80
    b irq_entry
    .balign 0x80
    b invalid_entry
    .balign 0x80
    b invalid_entry
    // Lower EL, AArch32: unsupported.
    .balign 0x80
    b invalid_entry
    .balign 0x80
    b invalid_entry
    .balign 0x80
    b invalid_entry
    .balign 0x80
    b invalid_entry
"#
);

unsafe extern "C" {
    static exception_vector_table: u8;
}

/// Point VBAR_EL1 at the table above.
///
/// # Safety
///
/// Must run with IRQs masked, once per core.
pub unsafe fn install_vectors() {
    // SAFETY: Only the address of the linker symbol is taken.
    let table = unsafe { &raw const exception_vector_table } as u64;
    VBAR_EL1.set(table);
}

#[unsafe(no_mangle)]
extern "C" fn sync_exception_dispatch(frame: *mut InterruptFrame) {
    // SAFETY: The stub passes the frame it built on this core's stack.
    let frame = unsafe { &mut *frame };
    let esr = ESR_EL1.get();
    let ec = esr >> 26;

    match ec {
        EC_SVC64 => hooks::syscall(frame),
        EC_INSTR_ABORT_LOWER | EC_DATA_ABORT_LOWER | EC_DATA_ABORT_SAME => {
            let info = FaultInfo {
                code: ec,
                error: esr,
                address: FAR_EL1.get(),
                // WnR is only defined for data aborts.
                write: ec != EC_INSTR_ABORT_LOWER && esr & (1 << 6) != 0,
                user: ec != EC_DATA_ABORT_SAME,
            };
            if !hooks::page_fault(&info, frame) {
                hooks::fatal_fault(&info, frame);
            }
        }
        _ => {
            let info = FaultInfo {
                code: ec,
                error: esr,
                address: FAR_EL1.get(),
                write: false,
                user: frame.from_user(),
            };
            hooks::fatal_fault(&info, frame);
        }
    }
}

#[unsafe(no_mangle)]
extern "C" fn irq_dispatch(frame: *mut InterruptFrame) {
    // SAFETY: The stub passes the frame it built on this core's stack.
    let frame = unsafe { &mut *frame };

    gic::with_acknowledged(|intid| {
        if intid == timer::TIMER_INTID {
            timer::rearm();
            hooks::timer_tick(frame);
        }
    });
}

#[unsafe(no_mangle)]
extern "C" fn invalid_vector_dispatch(frame: *const InterruptFrame, esr: u64) {
    // SAFETY: The stub passes the frame it built on this core's stack.
    let frame = unsafe { &*frame };
    let info = FaultInfo {
        code: esr >> 26,
        error: esr,
        address: FAR_EL1.get(),
        write: false,
        user: frame.from_user(),
    };
    hooks::fatal_fault(&info, frame);
}
