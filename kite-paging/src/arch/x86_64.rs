//! x86_64 entry encoding
//!
//! Long-mode 4-level tables. The copy-on-write tag uses bit 9, the first
//! of the software-available bits.

use super::ArchPageTable;
use crate::flags::PageFlags;

const PRESENT: u64 = 1 << 0;
const WRITABLE: u64 = 1 << 1;
const USER: u64 = 1 << 2;
/// Software-available bit marking a copy-on-write leaf.
const COW: u64 = 1 << 9;

/// Physical address field of an entry.
const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// Intermediate entries stay fully permissive; the leaf constrains.
const TABLE_DEFAULT: u64 = PRESENT | WRITABLE | USER;

/// Marker type for the x86_64 encoding.
pub struct X86_64;

impl ArchPageTable for X86_64 {
    fn leaf_entry(frame: u64, flags: PageFlags) -> u64 {
        let mut entry = (frame & ADDR_MASK) | PRESENT;
        if flags.write {
            entry |= WRITABLE;
        }
        if flags.user {
            entry |= USER;
        }
        if flags.cow {
            entry |= COW;
        }
        entry
    }

    fn decode_leaf(entry: u64) -> PageFlags {
        PageFlags {
            write: entry & WRITABLE != 0,
            user: entry & USER != 0,
            cow: entry & COW != 0,
        }
    }

    fn table_entry(table: u64) -> u64 {
        (table & ADDR_MASK) | TABLE_DEFAULT
    }

    fn is_present(entry: u64) -> bool {
        entry & PRESENT != 0
    }

    fn entry_address(entry: u64) -> u64 {
        entry & ADDR_MASK
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leaf_roundtrip() {
        let flags = PageFlags::USER_WRITE;
        let entry = X86_64::leaf_entry(0x1234_5000, flags);
        assert!(X86_64::is_present(entry));
        assert_eq!(X86_64::entry_address(entry), 0x1234_5000);
        assert_eq!(X86_64::decode_leaf(entry), flags);
    }

    #[test]
    fn test_cow_clears_hardware_write() {
        let entry = X86_64::leaf_entry(0x2000, PageFlags::USER_WRITE.into_cow());
        assert_eq!(entry & WRITABLE, 0);
        assert!(X86_64::decode_leaf(entry).cow);
    }
}
