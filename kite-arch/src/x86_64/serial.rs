//! 16550 serial port (COM1)

use x86_64::instructions::port::Port;

const COM1: u16 = 0x3F8;

const DATA: u16 = COM1;
const INT_ENABLE: u16 = COM1 + 1;
const FIFO_CTRL: u16 = COM1 + 2;
const LINE_CTRL: u16 = COM1 + 3;
const MODEM_CTRL: u16 = COM1 + 4;
const LINE_STATUS: u16 = COM1 + 5;

const LINE_STATUS_THR_EMPTY: u8 = 1 << 5;

/// Programme COM1 for 38400 baud, 8N1, FIFOs on.
pub fn init() {
    // SAFETY: COM1 register writes in the documented init order; no other
    // code touches these ports during boot.
    unsafe {
        Port::<u8>::new(INT_ENABLE).write(0x00);
        Port::<u8>::new(LINE_CTRL).write(0x80); // DLAB on
        Port::<u8>::new(DATA).write(0x03); // divisor low: 38400 baud
        Port::<u8>::new(INT_ENABLE).write(0x00); // divisor high
        Port::<u8>::new(LINE_CTRL).write(0x03); // 8N1, DLAB off
        Port::<u8>::new(FIFO_CTRL).write(0xC7);
        Port::<u8>::new(MODEM_CTRL).write(0x0B);
    }
}

/// Blocking write of one byte.
pub fn write_byte(byte: u8) {
    // SAFETY: Reading line status and writing the data register are the
    // documented transmit sequence.
    unsafe {
        let mut status = Port::<u8>::new(LINE_STATUS);
        while status.read() & LINE_STATUS_THR_EMPTY == 0 {
            core::hint::spin_loop();
        }
        Port::<u8>::new(DATA).write(byte);
    }
}
