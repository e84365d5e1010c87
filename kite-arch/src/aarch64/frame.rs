//! Saved exception context
//!
//! The layout mirrors what the vector stubs store: x0..x30, the user
//! stack pointer (`SP_EL0`), the return address (`ELR_EL1`) and the saved
//! program status (`SPSR_EL1`).

/// SPSR for a fresh user thread: EL0t, all interrupt masks clear.
pub const SPSR_USER: u64 = 0x0;
/// SPSR for kernel code resumed via `eret`: EL1h, interrupt masks clear.
pub const SPSR_KERNEL: u64 = 0x5;

/// A full saved CPU context, laid out exactly as the vector stubs build
/// it on the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct InterruptFrame {
    /// General-purpose registers x0..x30.
    pub x: [u64; 31],
    /// User stack pointer (`SP_EL0`).
    pub sp: u64,
    /// Saved program counter (`ELR_EL1`).
    pub elr: u64,
    /// Saved program status (`SPSR_EL1`).
    pub spsr: u64,
}

// The stubs hard-code these positions.
const _: () = {
    assert!(core::mem::size_of::<InterruptFrame>() == 34 * 8);
    assert!(core::mem::offset_of!(InterruptFrame, sp) == 31 * 8);
    assert!(core::mem::offset_of!(InterruptFrame, spsr) == 33 * 8);
};

impl Default for InterruptFrame {
    fn default() -> Self {
        Self { x: [0; 31], sp: 0, elr: 0, spsr: SPSR_USER }
    }
}

impl InterruptFrame {
    /// Build a frame that enters user mode at `entry` with an empty stack.
    #[must_use]
    pub fn user(entry: u64, stack_top: u64) -> Self {
        Self {
            elr: entry,
            sp: stack_top,
            spsr: SPSR_USER,
            ..Self::default()
        }
    }

    /// Build a frame that resumes kernel code at `entry`, used for the
    /// per-core idle loop.
    #[must_use]
    pub fn kernel(entry: u64, stack_top: u64) -> Self {
        Self {
            elr: entry,
            sp: stack_top,
            spsr: SPSR_KERNEL,
            ..Self::default()
        }
    }

    /// Whether the saved context was executing in user mode.
    #[inline]
    #[must_use]
    pub const fn from_user(&self) -> bool {
        self.spsr & 0xF == 0
    }

    /// Saved instruction pointer.
    #[inline]
    #[must_use]
    pub const fn instruction_pointer(&self) -> u64 {
        self.elr
    }

    /// Saved stack pointer.
    #[inline]
    #[must_use]
    pub const fn stack_pointer(&self) -> u64 {
        self.sp
    }

    /// The syscall number register.
    #[inline]
    #[must_use]
    pub const fn syscall_number(&self) -> u64 {
        self.x[0]
    }

    /// The syscall payload-pointer register.
    #[inline]
    #[must_use]
    pub const fn syscall_payload(&self) -> u64 {
        self.x[1]
    }

    /// Store a syscall result in the return register.
    #[inline]
    pub const fn set_syscall_result(&mut self, result: i64) {
        self.x[0] = result as u64;
    }

    /// Load the first three argument registers, used when a fresh IPC
    /// handler thread starts with `(iid, mid_or_sid, caller_pid)`.
    #[inline]
    pub const fn set_entry_args(&mut self, a0: u64, a1: u64, a2: u64) {
        self.x[0] = a0;
        self.x[1] = a1;
        self.x[2] = a2;
    }
}
