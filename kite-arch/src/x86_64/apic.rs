//! Local APIC
//!
//! MMIO access to the per-core interrupt controller: enabling it, the
//! periodic preemption timer, end-of-interrupt, and the INIT/SIPI dance
//! that pulls application processors out of real mode through the
//! trampoline below.

use core::arch::global_asm;
use core::sync::atomic::{AtomicU64, Ordering};

use super::idt::TIMER_VECTOR;

const REG_ID: usize = 0x20;
const REG_EOI: usize = 0xB0;
const REG_SPURIOUS: usize = 0xF0;
const REG_ERROR_STATUS: usize = 0x280;
const REG_ICR_LOW: usize = 0x300;
const REG_ICR_HIGH: usize = 0x310;
const REG_LVT_TIMER: usize = 0x320;
const REG_TIMER_INIT_COUNT: usize = 0x380;
const REG_TIMER_DIVIDE: usize = 0x3E0;

/// Software-enable plus spurious vector 0xFF.
const SPURIOUS_ENABLE: u32 = 0x1FF;
/// Periodic mode bit in the timer LVT.
const LVT_TIMER_PERIODIC: u32 = 1 << 17;
/// Divide-by-16 configuration.
const TIMER_DIVIDE_BY_16: u32 = 0x3;
/// Initial count giving roughly a 100 Hz tick on common bus clocks.
const TIMER_INITIAL_COUNT: u32 = 1_000_000;

/// ICR delivery-status bit.
const ICR_PENDING: u32 = 1 << 12;

/// Physical address the trampoline is copied to; must be page-aligned and
/// below 1 MiB so a SIPI can point at it.
const TRAMPOLINE_TARGET: u64 = 0x8000;

static LAPIC_BASE: AtomicU64 = AtomicU64::new(0);

/// Record the LAPIC MMIO base discovered from the MADT.
pub fn set_base(base: u64) {
    LAPIC_BASE.store(base, Ordering::Release);
}

fn read(reg: usize) -> u32 {
    let base = LAPIC_BASE.load(Ordering::Acquire);
    debug_assert!(base != 0, "LAPIC used before discovery");
    // SAFETY: The MADT gave us this MMIO base; registers are 32-bit
    // aligned reads.
    unsafe { core::ptr::read_volatile((base as usize + reg) as *const u32) }
}

fn write(reg: usize, value: u32) {
    let base = LAPIC_BASE.load(Ordering::Acquire);
    debug_assert!(base != 0, "LAPIC used before discovery");
    // SAFETY: As in `read`.
    unsafe { core::ptr::write_volatile((base as usize + reg) as *mut u32, value) }
}

/// Software-enable the calling core's local APIC.
pub fn enable_local() {
    write(REG_SPURIOUS, SPURIOUS_ENABLE);
}

/// This core's LAPIC id.
#[must_use]
pub fn local_id() -> u32 {
    read(REG_ID) >> 24
}

/// Signal end-of-interrupt.
pub fn eoi() {
    write(REG_EOI, 0);
}

/// Start the periodic preemption timer on the calling core.
pub fn timer_start() {
    write(REG_TIMER_DIVIDE, TIMER_DIVIDE_BY_16);
    write(REG_LVT_TIMER, LVT_TIMER_PERIODIC | TIMER_VECTOR as u32);
    write(REG_TIMER_INIT_COUNT, TIMER_INITIAL_COUNT);
}

fn wait_icr_idle() {
    while read(REG_ICR_LOW) & ICR_PENDING != 0 {
        core::hint::spin_loop();
    }
}

/// Kick one application processor: INIT, INIT deassert, then two SIPIs
/// pointing at the trampoline page.
///
/// # Safety
///
/// The trampoline must be installed and its launch slots filled for this
/// AP before the call; the target id must be a real, halted core.
pub unsafe fn start_ap(apic_id: u32) {
    let sipi_vector = (TRAMPOLINE_TARGET >> 12) as u32;

    write(REG_ERROR_STATUS, 0);
    write(REG_ICR_HIGH, apic_id << 24);
    write(REG_ICR_LOW, 0xC500);
    wait_icr_idle();

    write(REG_ICR_HIGH, apic_id << 24);
    write(REG_ICR_LOW, 0x8500);
    wait_icr_idle();

    for _ in 0..2 {
        write(REG_ERROR_STATUS, 0);
        write(REG_ICR_HIGH, apic_id << 24);
        write(REG_ICR_LOW, 0x600 | sipi_vector);
        wait_icr_idle();
    }
}

// -- AP trampoline
//
// Copied to TRAMPOLINE_TARGET before the first SIPI. The AP wakes in real
// mode, switches PAE + long mode on with the boot page tables, loads a
// throwaway 64-bit GDT and jumps into the entry slot with its core id in
// rdi. The far jump is emitted as raw bytes: the 16-bit encoding is the
// one thing assemblers disagree about.
global_asm!(
    r#"
.section .text.ap_trampoline, "ax"
.balign 4096
.code16
.global ap_trampoline_start
ap_trampoline_start:
    cli
    cld
    mov eax, cr4
    or eax, 1 << 5
    mov cr4, eax
    off_slot_pml4 = ap_slot_pml4 - ap_trampoline_start
    mov eax, dword ptr [0x8000 + off_slot_pml4]
    mov cr3, eax
    mov ecx, 0xC0000080
    rdmsr
    or eax, 1 << 8
    wrmsr
    off_gdt_ptr = ap_gdt_ptr - ap_trampoline_start
    lgdt [0x8000 + off_gdt_ptr]
    mov eax, cr0
    or eax, 0x80000001
    mov cr0, eax
    .byte 0x66, 0xEA
    .long 0x8000 + (ap_long_mode - ap_trampoline_start)
    .word 0x08
.code64
ap_long_mode:
    mov ax, 0x10
    mov ds, ax
    mov es, ax
    mov ss, ax
    off_slot_stack = ap_slot_stack - ap_trampoline_start
    off_slot_core_id = ap_slot_core_id - ap_trampoline_start
    off_slot_entry = ap_slot_entry - ap_trampoline_start
    mov rsp, qword ptr [0x8000 + off_slot_stack]
    mov rdi, qword ptr [0x8000 + off_slot_core_id]
    mov rax, qword ptr [0x8000 + off_slot_entry]
    call rax
1:
    hlt
    jmp 1b
.balign 8
ap_gdt:
    .quad 0
    .quad 0x00209A0000000000
    .quad 0x0000920000000000
ap_gdt_ptr:
    .word 23
    .long 0x8000 + (ap_gdt - ap_trampoline_start)
.global ap_slot_pml4
ap_slot_pml4:
    .quad 0
.global ap_slot_stack
ap_slot_stack:
    .quad 0
.global ap_slot_core_id
ap_slot_core_id:
    .quad 0
.global ap_slot_entry
ap_slot_entry:
    .quad 0
.global ap_trampoline_end
ap_trampoline_end:
.text
"#
);

unsafe extern "C" {
    static ap_trampoline_start: u8;
    static ap_slot_pml4: u8;
    static ap_slot_stack: u8;
    static ap_slot_core_id: u8;
    static ap_slot_entry: u8;
    static ap_trampoline_end: u8;
}

fn trampoline_slot(symbol: *const u8) -> *mut u64 {
    // SAFETY: Only the address of the linker symbol is taken.
    let start = unsafe { &raw const ap_trampoline_start } as usize;
    let offset = symbol as usize - start;
    (TRAMPOLINE_TARGET as usize + offset) as *mut u64
}

/// Copy the trampoline to its sub-1 MiB home and stamp in the page-table
/// root the APs should load.
///
/// # Safety
///
/// The target page must be identity-mapped, unused RAM, and `pml4` must
/// be the physical root the boot CPU is running on.
pub unsafe fn install_trampoline(pml4: u64) {
    // SAFETY: Caller guarantees the target page; the source is our own
    // image, and the symbols only contribute addresses.
    unsafe {
        let start = &raw const ap_trampoline_start;
        let end = &raw const ap_trampoline_end;
        let length = end as usize - start as usize;

        core::ptr::copy_nonoverlapping(start, TRAMPOLINE_TARGET as *mut u8, length);
        trampoline_slot(&raw const ap_slot_pml4).write_volatile(pml4);
    }
}

/// Fill the per-AP launch slots before a [`start_ap`].
///
/// # Safety
///
/// [`install_trampoline`] must have run; no other AP may be mid-launch.
pub unsafe fn set_ap_launch(stack_top: u64, core_id: u64, entry: extern "C" fn(u64) -> !) {
    // SAFETY: The trampoline copy owns these slots.
    unsafe {
        trampoline_slot(&raw const ap_slot_stack).write_volatile(stack_top);
        trampoline_slot(&raw const ap_slot_core_id).write_volatile(core_id);
        trampoline_slot(&raw const ap_slot_entry).write_volatile(entry as usize as u64);
    }
}
