//! Kernel Logging
//!
//! Wires the `log` facade to the serial console. Messages are formatted
//! into a fixed stack buffer first so a long line never holds the
//! console lock while formatting, and levels get ANSI colouring for
//! anyone watching the port.

use core::fmt::Write;

use kite_arch::console;
use log::{Level, LevelFilter, Log, Metadata, Record};

/// Most of a serial line; longer messages are truncated.
const MESSAGE_BUFFER_SIZE: usize = 256;

/// Stack buffer for formatting log messages before writing them out.
struct MessageBuffer {
    data: [u8; MESSAGE_BUFFER_SIZE],
    len: usize,
}

impl MessageBuffer {
    const fn new() -> Self {
        Self { data: [0u8; MESSAGE_BUFFER_SIZE], len: 0 }
    }

    fn as_str(&self) -> &str {
        core::str::from_utf8(&self.data[..self.len]).unwrap_or("<invalid>")
    }
}

impl Write for MessageBuffer {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let bytes = s.as_bytes();
        let remaining = MESSAGE_BUFFER_SIZE - self.len;
        let to_copy = bytes.len().min(remaining);
        self.data[self.len..self.len + to_copy].copy_from_slice(&bytes[..to_copy]);
        self.len += to_copy;
        Ok(())
    }
}

/// Kernel logger implementation
struct KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Debug
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let level_str = match record.level() {
            Level::Error => "\x1b[31mERROR\x1b[0m",
            Level::Warn => "\x1b[33m WARN\x1b[0m",
            Level::Info => "\x1b[32m INFO\x1b[0m",
            Level::Debug => "\x1b[34mDEBUG\x1b[0m",
            Level::Trace => "\x1b[35mTRACE\x1b[0m",
        };

        let mut buffer = MessageBuffer::new();
        let _ = writeln!(buffer, "{} {}: {}", level_str, record.target(), record.args());
        console::puts(buffer.as_str());
    }

    fn flush(&self) {}
}

/// Global logger instance
static LOGGER: KernelLogger = KernelLogger;

/// Initialise the logging system.
pub fn init() {
    log::set_logger(&LOGGER)
        .map(|()| log::set_max_level(LevelFilter::Debug))
        .ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_buffer_truncates() {
        let mut buffer = MessageBuffer::new();
        for _ in 0..MESSAGE_BUFFER_SIZE {
            let _ = buffer.write_str("ab");
        }
        assert_eq!(buffer.len, MESSAGE_BUFFER_SIZE);
        assert!(buffer.as_str().starts_with("ab"));
    }
}
