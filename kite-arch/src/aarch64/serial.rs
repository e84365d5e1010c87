//! PL011 UART

use core::ptr;
use core::sync::atomic::{AtomicU64, Ordering};

/// QEMU `virt` machine default, overridable before init.
const PL011_DEFAULT_BASE: u64 = 0x0900_0000;

/// Data register offset
const DR: usize = 0x00;
/// Flag register offset
const FR: usize = 0x18;
/// Flag: transmit FIFO full
const FR_TXFF: u32 = 1 << 5;

static UART_BASE: AtomicU64 = AtomicU64::new(PL011_DEFAULT_BASE);

/// Override the UART base before the first write.
pub fn set_base(base: u64) {
    UART_BASE.store(base, Ordering::Release);
}

/// The firmware leaves the PL011 configured; nothing to do.
pub fn init() {}

/// Blocking write of one byte.
pub fn write_byte(byte: u8) {
    let base = UART_BASE.load(Ordering::Acquire) as usize;
    // SAFETY: The base points at the PL011 register block.
    unsafe {
        while ptr::read_volatile((base + FR) as *const u32) & FR_TXFF != 0 {
            core::hint::spin_loop();
        }
        ptr::write_volatile((base + DR) as *mut u8, byte);
    }
}
