//! ACPI table discovery
//!
//! Just enough ACPI to start the other cores: walk the firmware
//! configuration tables for the RSDP, follow the XSDT, and pull the
//! local-APIC base and the processor ids out of the MADT. Reads go
//! through unaligned copies because firmware only promises 4-byte
//! alignment at best.

use alloc::vec::Vec;

use kite_common::boot::BootInfo;
use kite_paging::phys_to_virt;
use zerocopy::{FromBytes, Immutable, KnownLayout};

/// EFI_ACPI_20_TABLE_GUID, byte order as it appears in memory.
const ACPI2_GUID: [u8; 16] = [
    0x71, 0xE8, 0x68, 0x88, 0xF1, 0xE4, 0xD3, 0x11, 0xBC, 0x22, 0x00, 0x80, 0xC7, 0x3C, 0x88,
    0x81,
];

/// Bytes per firmware configuration-table entry (GUID + pointer).
const CONFIG_TABLE_ENTRY_SIZE: usize = 24;

/// Root System Description Pointer, ACPI 2.0 shape.
#[derive(Debug, Clone, Copy, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
struct Rsdp {
    signature: [u8; 8],
    checksum: u8,
    oem_id: [u8; 6],
    revision: u8,
    rsdt_address: u32,
    length: u32,
    xsdt_address: u64,
    extended_checksum: u8,
    _reserved: [u8; 3],
}

/// Common header of every System Description Table.
#[derive(Debug, Clone, Copy, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
struct SdtHeader {
    signature: [u8; 4],
    length: u32,
    revision: u8,
    checksum: u8,
    oem_id: [u8; 6],
    oem_table_id: [u8; 8],
    oem_revision: u32,
    creator_id: u32,
    creator_revision: u32,
}

const SDT_HEADER_SIZE: usize = core::mem::size_of::<SdtHeader>();
const _: () = assert!(SDT_HEADER_SIZE == 36);

/// MADT processor entry type.
const MADT_LOCAL_APIC: u8 = 0;

/// What SMP start-up needs from the MADT.
#[derive(Debug)]
pub struct MadtInfo {
    /// Physical MMIO base of every core's local APIC.
    pub lapic_base: u64,
    /// APIC ids of the processors the firmware reports.
    pub apic_ids: Vec<u8>,
}

/// Copy a record out of physical memory.
///
/// # Safety
///
/// `phys` must point at `size_of::<T>()` readable bytes.
unsafe fn read_phys<T: FromBytes>(phys: u64) -> T {
    // SAFETY: Forwarded to the caller's contract; FromBytes accepts any
    // bit pattern and the unaligned read tolerates firmware placement.
    unsafe { core::ptr::read_unaligned(phys_to_virt(phys) as *const T) }
}

/// Find the MADT through the firmware configuration tables.
///
/// # Safety
///
/// The boot record's configuration-table fields must describe the
/// firmware's table array, and the ACPI tables it points at must be
/// mapped.
pub unsafe fn find_madt(boot_info: &BootInfo) -> Option<MadtInfo> {
    let base = boot_info.config_table_base.as_u64();
    for index in 0..boot_info.config_table_count {
        let entry = base + index * CONFIG_TABLE_ENTRY_SIZE as u64;
        // SAFETY: In-bounds entry of the firmware table array.
        let guid: [u8; 16] = unsafe { read_phys(entry) };
        if guid == ACPI2_GUID {
            // SAFETY: The pointer field follows the GUID.
            let rsdp_addr: u64 = unsafe { read_phys(entry + 16) };
            // SAFETY: The firmware table points at the RSDP.
            return unsafe { parse_rsdp(rsdp_addr) };
        }
    }
    None
}

/// # Safety
///
/// `rsdp_addr` must point at a mapped RSDP.
unsafe fn parse_rsdp(rsdp_addr: u64) -> Option<MadtInfo> {
    // SAFETY: Caller contract.
    let rsdp: Rsdp = unsafe { read_phys(rsdp_addr) };
    if &rsdp.signature != b"RSD PTR " || rsdp.revision < 2 {
        return None;
    }

    // SAFETY: A valid RSDP points at the XSDT.
    let xsdt: SdtHeader = unsafe { read_phys(rsdp.xsdt_address) };
    if &xsdt.signature != b"XSDT" {
        return None;
    }

    let entries = (xsdt.length as usize - SDT_HEADER_SIZE) / 8;
    for index in 0..entries {
        let slot = rsdp.xsdt_address + (SDT_HEADER_SIZE + index * 8) as u64;
        // SAFETY: In-bounds XSDT entry.
        let table_addr: u64 = unsafe { read_phys(slot) };
        // SAFETY: XSDT entries point at mapped tables.
        let header: SdtHeader = unsafe { read_phys(table_addr) };
        if &header.signature == b"APIC" {
            // SAFETY: The header said this is the MADT.
            return Some(unsafe { parse_madt(table_addr, header.length as usize) });
        }
    }
    None
}

/// # Safety
///
/// `madt_addr` must point at a mapped MADT of `length` bytes.
unsafe fn parse_madt(madt_addr: u64, length: usize) -> MadtInfo {
    // SAFETY: The fixed MADT fields follow the header.
    let lapic_base: u32 = unsafe { read_phys(madt_addr + SDT_HEADER_SIZE as u64) };

    let mut apic_ids = Vec::new();
    let mut offset = SDT_HEADER_SIZE + 8;
    while offset + 2 <= length {
        // SAFETY: Offset stays within the table per the loop bound.
        let kind: u8 = unsafe { read_phys(madt_addr + offset as u64) };
        let entry_len: u8 = unsafe { read_phys(madt_addr + offset as u64 + 1) };
        if entry_len < 2 {
            break;
        }
        if kind == MADT_LOCAL_APIC && offset + 4 <= length {
            // SAFETY: Local-APIC entries carry the id at byte 3.
            let apic_id: u8 = unsafe { read_phys(madt_addr + offset as u64 + 3) };
            apic_ids.push(apic_id);
        }
        offset += entry_len as usize;
    }

    MadtInfo { lapic_base: lapic_base as u64, apic_ids }
}
