//! PSCI secondary-core start-up
//!
//! `CPU_ON` through the HVC conduit (EL2 firmware or QEMU), carrying a
//! launch block whose address arrives in x0 on the fresh core. A short
//! asm landing pad loads the stack and core id from the block and tails
//! into the kernel's AP entry.
//!
//! Reference: ARM DEN0022D - Power State Coordination Interface

use core::arch::{asm, global_asm};

/// CPU_ON, SMC64 convention.
const CPU_ON_64: u32 = 0xC400_0003;

/// PSCI error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum PsciError {
    NotSupported = -1,
    InvalidParameters = -2,
    Denied = -3,
    AlreadyOn = -4,
    OnPending = -5,
    InternalFailure = -6,
    NotPresent = -7,
    Disabled = -8,
    InvalidAddress = -9,
}

impl PsciError {
    fn from_i64(value: i64) -> Self {
        match value as i32 {
            -1 => Self::NotSupported,
            -2 => Self::InvalidParameters,
            -3 => Self::Denied,
            -4 => Self::AlreadyOn,
            -5 => Self::OnPending,
            -7 => Self::NotPresent,
            -8 => Self::Disabled,
            -9 => Self::InvalidAddress,
            _ => Self::InternalFailure,
        }
    }
}

/// What a fresh core needs before it can run Rust.
#[repr(C)]
pub struct ApLaunch {
    /// Stack top for the new core.
    pub stack_top: u64,
    /// Kernel core index passed through to the entry function.
    pub core_id: u64,
    /// `extern "C" fn(u64) -> !` the landing pad tails into.
    pub entry: u64,
}

global_asm!(
    r#"
.global ap_landing_pad
ap_landing_pad:
    // x0 = &ApLaunch
    ldr x1, [x0]
    mov sp, x1
    ldr x2, [x0, #8]
    ldr x3, [x0, #16]
    mov x0, x2
    br x3
"#
);

unsafe extern "C" {
    static ap_landing_pad: u8;
}

#[inline]
unsafe fn psci_call_hvc(func: u32, arg0: u64, arg1: u64, arg2: u64) -> i64 {
    let result: i64;
    // SAFETY: HVC traps to the PSCI implementation; registers per DEN0022.
    unsafe {
        asm!(
            "hvc #0",
            inout("x0") func as u64 => result,
            inout("x1") arg0 => _,
            inout("x2") arg1 => _,
            inout("x3") arg2 => _,
            options(nomem, nostack)
        );
    }
    result
}

/// Start a secondary core through the landing pad.
///
/// # Safety
///
/// `launch` must stay alive until the target core has read it, and
/// `launch.entry` must be a diverging `extern "C" fn(u64)`.
pub unsafe fn cpu_on(target_mpidr: u64, launch: &ApLaunch) -> Result<(), PsciError> {
    // SAFETY: Only the address of the linker symbol is taken.
    let pad = unsafe { &raw const ap_landing_pad } as u64;
    let context = launch as *const ApLaunch as u64;

    // SAFETY: Caller keeps the launch block alive; the pad is kernel text.
    let result = unsafe { psci_call_hvc(CPU_ON_64, target_mpidr, pad, context) };
    if result == 0 { Ok(()) } else { Err(PsciError::from_i64(result)) }
}
