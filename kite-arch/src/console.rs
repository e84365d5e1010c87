//! Serial debug console
//!
//! The one output channel the kernel has: a 16550 on x86_64, a PL011 on
//! AArch64. Writes are serialised through a spinlock so concurrent cores
//! do not interleave mid-line.

use core::fmt;

use crate::sync::IrqSpinMutex;

static CONSOLE_LOCK: IrqSpinMutex<()> = IrqSpinMutex::new(());

/// Initialise the serial console.
///
/// Must be called once before the first output; the earliest boot code
/// does this before anything can be printed.
pub fn init() {
    crate::native::serial::init();
}

/// Write a string to the console.
pub fn puts(s: &str) {
    let _guard = CONSOLE_LOCK.lock();
    for byte in s.bytes() {
        crate::native::serial::write_byte(byte);
    }
}

/// Write raw bytes to the console; non-ASCII bytes pass straight through.
pub fn put_bytes(bytes: &[u8]) {
    let _guard = CONSOLE_LOCK.lock();
    for &byte in bytes {
        crate::native::serial::write_byte(byte);
    }
}

/// `fmt::Write` adapter over the console.
pub struct ConsoleWriter;

impl fmt::Write for ConsoleWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        puts(s);
        Ok(())
    }
}
