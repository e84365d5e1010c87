//! Fast syscall entry
//!
//! `syscall` arrives with user rip in rcx, user rflags in r11 and the
//! user stack still live. The entry swaps to this core's kernel stack and
//! synthesises a frame indistinguishable from an interrupt's, so the
//! scheduler can rotate syscall-preempted threads through the same
//! save/restore path as timer-preempted ones, and the return is a plain
//! `iretq`.

use core::arch::naked_asm;

use x86_64::VirtAddr;
use x86_64::registers::model_specific::{Efer, EferFlags, LStar, Msr};

use crate::{CORE_LOCAL_KERNEL_STACK_OFFSET, CORE_LOCAL_USER_STACK_OFFSET};

const MSR_STAR: u32 = 0xC000_0081;
const MSR_SFMASK: u32 = 0xC000_0084;

/// STAR: syscall CS base 0x08, sysret base 0x18 (see the GDT layout).
const STAR_VALUE: u64 = (0x08u64 << 32) | (0x18u64 << 48);
/// Mask IF, DF and TF on entry.
const SFMASK_VALUE: u64 = 0x700;

/// Enable `syscall`/`sysretq` and point LSTAR at the entry stub.
///
/// # Safety
///
/// The GDT selectors backing STAR must be live, and the per-core pointer
/// must be installed before user space can reach `syscall`.
pub unsafe fn init() {
    // SAFETY: MSR writes with the values documented above.
    unsafe {
        Efer::update(|flags| flags.insert(EferFlags::SYSTEM_CALL_EXTENSIONS));
        Msr::new(MSR_STAR).write(STAR_VALUE);
        LStar::write(VirtAddr::new(syscall_entry as usize as u64));
        Msr::new(MSR_SFMASK).write(SFMASK_VALUE);
    }
}

/// The `syscall` landing pad: stash the user stack in the per-core
/// structure, adopt the kernel stack, build an `iretq`-compatible frame
/// (ss, rsp, rflags, cs, rip, error, vector, then the register file) and
/// dispatch. User cs/ss are the sysret selectors 0x2B/0x23.
#[unsafe(naked)]
unsafe extern "C" fn syscall_entry() {
    naked_asm!(
        "swapgs",
        "mov gs:[{user_stack}], rsp",
        "mov rsp, gs:[{kernel_stack}]",
        "push 0x23",
        "push qword ptr gs:[{user_stack}]",
        "push r11",
        "push 0x2B",
        "push rcx",
        "push 0",
        "push 0",
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
        "mov rdi, rsp",
        "cld",
        "call {dispatch}",
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
        "swapgs",
        "iretq",
        user_stack = const CORE_LOCAL_USER_STACK_OFFSET,
        kernel_stack = const CORE_LOCAL_KERNEL_STACK_OFFSET,
        dispatch = sym syscall_dispatch,
    );
}

extern "C" fn syscall_dispatch(frame: *mut super::frame::InterruptFrame) {
    // SAFETY: The entry stub passes the frame it built on this core's
    // kernel stack.
    let frame = unsafe { &mut *frame };
    crate::hooks::syscall(frame);
}
