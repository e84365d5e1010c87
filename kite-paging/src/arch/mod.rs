//! Per-architecture page-table encodings
//!
//! Both targets use a 4-level tree of 512-entry tables over the 4 KiB
//! granule, so the walker is shared and only the entry encodings and the
//! TLB/root-register operations differ. The encodings are plain bit
//! manipulation, implemented for both architectures on every build; the
//! live register operations exist only on their own target.

use crate::flags::PageFlags;

pub mod aarch64;
pub mod x86_64;

/// Entry encoding for one architecture's page tables.
pub trait ArchPageTable {
    /// Encode a leaf entry mapping `frame` with `flags`.
    fn leaf_entry(frame: u64, flags: PageFlags) -> u64;

    /// Decode the neutral flags from a leaf entry.
    fn decode_leaf(entry: u64) -> PageFlags;

    /// Encode an intermediate entry pointing at `table`.
    fn table_entry(table: u64) -> u64;

    /// Whether an entry (leaf or intermediate) is present.
    fn is_present(entry: u64) -> bool;

    /// Extract the physical address from an entry.
    fn entry_address(entry: u64) -> u64;
}

/// The encoding of the architecture this kernel is built for.
#[cfg(target_arch = "x86_64")]
pub type Native = x86_64::X86_64;
#[cfg(target_arch = "aarch64")]
pub type Native = aarch64::Aarch64;

/// Install `root` as the active address space.
///
/// # Safety
///
/// `root` must be the physical address of a valid root table whose kernel
/// half maps the currently executing code.
#[cfg(target_arch = "x86_64")]
pub unsafe fn set_current(root: u64) {
    // SAFETY: Caller guarantees the root; writing CR3 flushes non-global
    // TLB entries as required.
    unsafe {
        core::arch::asm!("mov cr3, {0}", in(reg) root, options(nostack, preserves_flags));
    }
}

/// Install `root` as the active address space.
///
/// # Safety
///
/// As for the x86_64 variant; TTBR0 carries the user half on this target.
#[cfg(target_arch = "aarch64")]
pub unsafe fn set_current(root: u64) {
    // SAFETY: Caller guarantees the root; the barrier/invalidate sequence
    // is the architectural requirement for a TTBR switch.
    unsafe {
        core::arch::asm!(
            "msr ttbr0_el1, {0}",
            "isb",
            "tlbi vmalle1",
            "dsb ish",
            "isb",
            in(reg) root,
            options(nostack, preserves_flags)
        );
    }
}

/// Read the active root installed by the boot path.
///
/// # Safety
///
/// Only meaningful once paging is on, which holds from entry.
#[cfg(target_arch = "x86_64")]
#[must_use]
pub unsafe fn current_root() -> u64 {
    let root: u64;
    // SAFETY: Reading CR3 has no side effects.
    unsafe {
        core::arch::asm!("mov {0}, cr3", out(reg) root, options(nomem, nostack, preserves_flags));
    }
    root & !0xFFF
}

/// Read the active root installed by the boot path.
///
/// # Safety
///
/// Only meaningful once paging is on, which holds from entry.
#[cfg(target_arch = "aarch64")]
#[must_use]
pub unsafe fn current_root() -> u64 {
    let root: u64;
    // SAFETY: Reading TTBR0 has no side effects.
    unsafe {
        core::arch::asm!("mrs {0}, ttbr0_el1", out(reg) root, options(nomem, nostack, preserves_flags));
    }
    root & !0xFFF
}

/// The live TLB of the executing core.
pub struct NativeTlb;

impl crate::frames::TlbInvalidate for NativeTlb {
    #[cfg(target_arch = "x86_64")]
    fn invalidate(&self, va: u64) {
        // SAFETY: invlpg is always safe on a canonical address.
        unsafe {
            core::arch::asm!("invlpg [{0}]", in(reg) va, options(nostack, preserves_flags));
        }
    }

    #[cfg(target_arch = "aarch64")]
    fn invalidate(&self, va: u64) {
        // SAFETY: Broadcast invalidate by VA, all ASIDs, inner shareable.
        unsafe {
            core::arch::asm!(
                "dsb ishst",
                "tlbi vaae1is, {0}",
                "dsb ish",
                "isb",
                in(reg) va >> 12,
                options(nostack, preserves_flags)
            );
        }
    }

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    fn invalidate(&self, _va: u64) {}
}
