//! Saved interrupt context
//!
//! The layout mirrors what the interrupt stubs push: fifteen
//! general-purpose registers, the vector and error code, then the
//! hardware `iretq` frame. The same record is synthesised by the syscall
//! entry so the scheduler resumes syscall-preempted and
//! interrupt-preempted threads identically.

use super::gdt::{KERNEL_CS, KERNEL_SS, USER_CS, USER_SS};

/// RFLAGS value for fresh threads: interrupts enabled plus the always-one
/// bit.
pub const INITIAL_RFLAGS: u64 = 0x202;

/// A full saved CPU context, laid out exactly as the entry stubs build it
/// on the stack.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct InterruptFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    /// Interrupt vector number (0 for syscall frames).
    pub vector: u64,
    /// Hardware error code, or 0 for vectors without one.
    pub error_code: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

// The stubs hard-code these positions.
const _: () = {
    assert!(core::mem::size_of::<InterruptFrame>() == 22 * 8);
    assert!(core::mem::offset_of!(InterruptFrame, vector) == 15 * 8);
    assert!(core::mem::offset_of!(InterruptFrame, cs) == 18 * 8);
};

impl InterruptFrame {
    /// Build a frame that enters user mode at `entry` with an empty stack.
    #[must_use]
    pub fn user(entry: u64, stack_top: u64) -> Self {
        Self {
            rip: entry,
            rsp: stack_top,
            rbp: stack_top,
            cs: USER_CS as u64,
            ss: USER_SS as u64,
            rflags: INITIAL_RFLAGS,
            ..Self::default()
        }
    }

    /// Build a frame that resumes kernel code at `entry`, used for the
    /// per-core idle loop.
    #[must_use]
    pub fn kernel(entry: u64, stack_top: u64) -> Self {
        Self {
            rip: entry,
            rsp: stack_top,
            rbp: stack_top,
            cs: KERNEL_CS as u64,
            ss: KERNEL_SS as u64,
            rflags: INITIAL_RFLAGS,
            ..Self::default()
        }
    }

    /// Whether the saved context was executing in user mode.
    #[inline]
    #[must_use]
    pub const fn from_user(&self) -> bool {
        self.cs & 0x3 == 0x3
    }

    /// Saved instruction pointer.
    #[inline]
    #[must_use]
    pub const fn instruction_pointer(&self) -> u64 {
        self.rip
    }

    /// Saved stack pointer.
    #[inline]
    #[must_use]
    pub const fn stack_pointer(&self) -> u64 {
        self.rsp
    }

    /// The syscall number register.
    #[inline]
    #[must_use]
    pub const fn syscall_number(&self) -> u64 {
        self.rdi
    }

    /// The syscall payload-pointer register.
    #[inline]
    #[must_use]
    pub const fn syscall_payload(&self) -> u64 {
        self.rsi
    }

    /// Store a syscall result in the return register.
    #[inline]
    pub const fn set_syscall_result(&mut self, result: i64) {
        self.rax = result as u64;
    }

    /// Load the first three argument registers, used when a fresh IPC
    /// handler thread starts with `(iid, mid_or_sid, caller_pid)`.
    #[inline]
    pub const fn set_entry_args(&mut self, a0: u64, a1: u64, a2: u64) {
        self.rdi = a0;
        self.rsi = a1;
        self.rdx = a2;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_frame_shape() {
        let frame = InterruptFrame::user(0x40_0000, 0x7000);
        assert_eq!(frame.rip, 0x40_0000);
        assert_eq!(frame.rsp, 0x7000);
        assert_eq!(frame.rbp, 0x7000);
        assert!(frame.from_user());
        assert_eq!(frame.rflags, INITIAL_RFLAGS);
    }

    #[test]
    fn test_kernel_frame_stays_ring0() {
        let frame = InterruptFrame::kernel(0x1000, 0x2000);
        assert!(!frame.from_user());
    }

    #[test]
    fn test_syscall_registers() {
        let mut frame = InterruptFrame::user(0, 0);
        frame.rdi = 4;
        frame.rsi = 0xdead;
        assert_eq!(frame.syscall_number(), 4);
        assert_eq!(frame.syscall_payload(), 0xdead);
        frame.set_syscall_result(-3);
        assert_eq!(frame.rax as i64, -3);
    }
}
