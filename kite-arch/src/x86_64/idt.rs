//! Interrupt descriptor table and entry stubs
//!
//! Every vector funnels through a naked stub that pushes the full
//! general-purpose register file, producing the
//! [`InterruptFrame`](super::frame::InterruptFrame) layout the scheduler
//! saves and restores. The `x86-interrupt` ABI is not enough here: a
//! context switch rewrites the whole frame, so the whole frame must be on
//! the stack.

use core::arch::naked_asm;
use core::cell::UnsafeCell;

use spin::Once;
use x86_64::VirtAddr;
use x86_64::registers::control::Cr2;
use x86_64::structures::DescriptorTablePointer;

use super::apic;
use super::frame::InterruptFrame;
use super::gdt::KERNEL_CS;
use crate::hooks::{self, FaultInfo};

/// The LAPIC timer fires on this vector.
pub const TIMER_VECTOR: u8 = 0x30;

const PAGE_FAULT_VECTOR: u64 = 14;

/// One interrupt gate, as the hardware reads it.
#[derive(Clone, Copy)]
#[repr(C)]
struct IdtEntry {
    isr_low: u16,
    selector: u16,
    ist: u8,
    attributes: u8,
    isr_mid: u16,
    isr_high: u32,
    reserved: u32,
}

const _: () = assert!(core::mem::size_of::<IdtEntry>() == 16);

impl IdtEntry {
    const EMPTY: Self = Self {
        isr_low: 0,
        selector: 0,
        ist: 0,
        attributes: 0,
        isr_mid: 0,
        isr_high: 0,
        reserved: 0,
    };

    fn interrupt_gate(isr: usize) -> Self {
        Self {
            isr_low: isr as u16,
            selector: KERNEL_CS,
            ist: 0,
            attributes: 0x8E,
            isr_mid: (isr >> 16) as u16,
            isr_high: (isr >> 32) as u32,
            reserved: 0,
        }
    }
}

#[repr(C, align(16))]
struct IdtTable([IdtEntry; 256]);

struct IdtCell(UnsafeCell<IdtTable>);

// SAFETY: The table is written once under the Once below and read-only
// afterwards (by the CPU).
unsafe impl Sync for IdtCell {}

static IDT: IdtCell = IdtCell(UnsafeCell::new(IdtTable([IdtEntry::EMPTY; 256])));
static IDT_BUILT: Once<()> = Once::new();

macro_rules! isr_stub {
    ($name:ident, $vector:literal, no_error_code) => {
        #[unsafe(naked)]
        unsafe extern "C" fn $name() {
            naked_asm!(
                "push 0",
                "push {vector}",
                "jmp {common}",
                vector = const $vector,
                common = sym interrupt_common,
            );
        }
    };
    ($name:ident, $vector:literal, error_code) => {
        #[unsafe(naked)]
        unsafe extern "C" fn $name() {
            naked_asm!(
                "push {vector}",
                "jmp {common}",
                vector = const $vector,
                common = sym interrupt_common,
            );
        }
    };
}

isr_stub!(isr_0, 0, no_error_code);
isr_stub!(isr_1, 1, no_error_code);
isr_stub!(isr_2, 2, no_error_code);
isr_stub!(isr_3, 3, no_error_code);
isr_stub!(isr_4, 4, no_error_code);
isr_stub!(isr_5, 5, no_error_code);
isr_stub!(isr_6, 6, no_error_code);
isr_stub!(isr_7, 7, no_error_code);
isr_stub!(isr_8, 8, error_code);
isr_stub!(isr_9, 9, no_error_code);
isr_stub!(isr_10, 10, error_code);
isr_stub!(isr_11, 11, error_code);
isr_stub!(isr_12, 12, error_code);
isr_stub!(isr_13, 13, error_code);
isr_stub!(isr_14, 14, error_code);
isr_stub!(isr_15, 15, no_error_code);
isr_stub!(isr_16, 16, no_error_code);
isr_stub!(isr_17, 17, error_code);
isr_stub!(isr_18, 18, no_error_code);
isr_stub!(isr_19, 19, no_error_code);
isr_stub!(isr_20, 20, no_error_code);
isr_stub!(isr_21, 21, error_code);
isr_stub!(isr_22, 22, no_error_code);
isr_stub!(isr_23, 23, no_error_code);
isr_stub!(isr_24, 24, no_error_code);
isr_stub!(isr_25, 25, no_error_code);
isr_stub!(isr_26, 26, no_error_code);
isr_stub!(isr_27, 27, no_error_code);
isr_stub!(isr_28, 28, no_error_code);
isr_stub!(isr_29, 29, error_code);
isr_stub!(isr_30, 30, error_code);
isr_stub!(isr_31, 31, no_error_code);
isr_stub!(isr_timer, 0x30, no_error_code);

const EXCEPTION_STUBS: [unsafe extern "C" fn(); 32] = [
    isr_0, isr_1, isr_2, isr_3, isr_4, isr_5, isr_6, isr_7, isr_8, isr_9, isr_10, isr_11,
    isr_12, isr_13, isr_14, isr_15, isr_16, isr_17, isr_18, isr_19, isr_20, isr_21, isr_22,
    isr_23, isr_24, isr_25, isr_26, isr_27, isr_28, isr_29, isr_30, isr_31,
];

/// The shared tail of every stub: save the register file, fix GS if the
/// interrupt came from user mode, hand the frame to the dispatcher, then
/// unwind the exact same way. The CS slot sits 144 bytes above the frame
/// base once the fifteen registers are pushed.
#[unsafe(naked)]
unsafe extern "C" fn interrupt_common() {
    naked_asm!(
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rbp",
        "push rdi",
        "push rsi",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "cmp qword ptr [rsp + 144], 0x08",
        "je 2f",
        "swapgs",
        "2:",
        "mov rdi, rsp",
        "cld",
        "call {dispatch}",
        "cmp qword ptr [rsp + 144], 0x08",
        "je 3f",
        "swapgs",
        "3:",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rsi",
        "pop rdi",
        "pop rbp",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        "add rsp, 16",
        "iretq",
        dispatch = sym interrupt_dispatch,
    );
}

extern "C" fn interrupt_dispatch(frame: *mut InterruptFrame) {
    // SAFETY: The stub passes a pointer to the frame it built on this
    // core's stack; it stays alive until the stub unwinds it.
    let frame = unsafe { &mut *frame };

    match frame.vector {
        v if v == TIMER_VECTOR as u64 => {
            hooks::timer_tick(frame);
            apic::eoi();
        }
        PAGE_FAULT_VECTOR => {
            let address = Cr2::read().as_u64();
            let info = FaultInfo {
                code: frame.vector,
                error: frame.error_code,
                address,
                write: frame.error_code & 0x2 != 0,
                user: frame.error_code & 0x4 != 0,
            };
            if !hooks::page_fault(&info, frame) {
                hooks::fatal_fault(&info, frame);
            }
        }
        v if v < 32 => {
            let info = FaultInfo {
                code: v,
                error: frame.error_code,
                address: 0,
                write: false,
                user: frame.from_user(),
            };
            hooks::fatal_fault(&info, frame);
        }
        _ => apic::eoi(),
    }
}

/// Load the IDT on the calling core, building the shared table on first
/// use.
///
/// # Safety
///
/// The GDT must already be loaded with [`KERNEL_CS`] valid.
pub unsafe fn init() {
    IDT_BUILT.call_once(|| {
        // SAFETY: First and only mutation of the table, serialised by the
        // surrounding Once.
        let table = unsafe { &mut *IDT.0.get() };
        for (vector, stub) in EXCEPTION_STUBS.iter().enumerate() {
            table.0[vector] = IdtEntry::interrupt_gate(*stub as usize);
        }
        table.0[TIMER_VECTOR as usize] = IdtEntry::interrupt_gate(isr_timer as usize);
    });

    let pointer = DescriptorTablePointer {
        limit: (core::mem::size_of::<IdtTable>() - 1) as u16,
        base: VirtAddr::new(IDT.0.get() as u64),
    };
    // SAFETY: The table is static and fully built.
    unsafe {
        x86_64::instructions::tables::lidt(&pointer);
    }
}

/// Human-readable exception names, indexed by vector.
#[must_use]
pub fn exception_name(vector: u64) -> &'static str {
    const NAMES: [&str; 22] = [
        "division by zero",
        "debug exception",
        "non-maskable interrupt",
        "breakpoint",
        "overflow",
        "bound range exceeded",
        "invalid opcode",
        "device unavailable",
        "double fault",
        "coprocessor segment overrun",
        "invalid TSS",
        "segment not present",
        "stack-segment fault",
        "general protection fault",
        "page fault",
        "reserved exception",
        "FPU error",
        "alignment check",
        "machine check",
        "SIMD exception",
        "virtualization exception",
        "control protection exception",
    ];
    NAMES.get(vector as usize).copied().unwrap_or("reserved exception")
}
