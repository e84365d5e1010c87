//! AArch64 entry encoding
//!
//! 4 KiB granule, 48-bit addresses. Writability is the inverted AP[2]
//! read-only attribute; the copy-on-write tag uses descriptor bit 55,
//! the first software-reserved bit.

use super::ArchPageTable;
use crate::flags::PageFlags;

const VALID: u64 = 1 << 0;
/// Level 3 page descriptors and table descriptors share this bit.
const TABLE_OR_PAGE: u64 = 1 << 1;
/// Access flag; absence faults on first touch.
const ACCESS: u64 = 1 << 10;
/// AP[2]: read-only when set.
const READ_ONLY: u64 = 1 << 7;
/// AP[1]: accessible from EL0 when set.
const EL0_ACCESS: u64 = 1 << 6;
/// Software-reserved bit marking a copy-on-write leaf.
const COW: u64 = 1 << 55;

/// Physical address field of a descriptor.
const ADDR_MASK: u64 = 0x0000_FFFF_FFFF_F000;

/// Marker type for the AArch64 encoding.
pub struct Aarch64;

impl ArchPageTable for Aarch64 {
    fn leaf_entry(frame: u64, flags: PageFlags) -> u64 {
        let mut entry = (frame & ADDR_MASK) | VALID | TABLE_OR_PAGE | ACCESS;
        if !flags.write {
            entry |= READ_ONLY;
        }
        if flags.user {
            entry |= EL0_ACCESS;
        }
        if flags.cow {
            entry |= COW;
        }
        entry
    }

    fn decode_leaf(entry: u64) -> PageFlags {
        PageFlags {
            write: entry & READ_ONLY == 0,
            user: entry & EL0_ACCESS != 0,
            cow: entry & COW != 0,
        }
    }

    fn table_entry(table: u64) -> u64 {
        (table & ADDR_MASK) | VALID | TABLE_OR_PAGE
    }

    fn is_present(entry: u64) -> bool {
        entry & VALID != 0
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
        let flags = PageFlags::USER_RO;
        let entry = Aarch64::leaf_entry(0x4_0000_1000, flags);
        assert!(Aarch64::is_present(entry));
        assert_eq!(Aarch64::entry_address(entry), 0x4_0000_1000);
        assert_eq!(Aarch64::decode_leaf(entry), flags);
    }

    #[test]
    fn test_read_only_is_inverted_write() {
        let writable = Aarch64::leaf_entry(0x1000, PageFlags::USER_WRITE);
        assert_eq!(writable & READ_ONLY, 0);

        let cow = Aarch64::leaf_entry(0x1000, PageFlags::USER_WRITE.into_cow());
        assert!(cow & READ_ONLY != 0);
        assert!(cow & COW != 0);
    }
}
