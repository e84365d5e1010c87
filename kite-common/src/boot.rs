//! Boot Handoff Protocol
//!
//! Defines the structure passed from the bootloader to the kernel. The
//! layout is fixed (`#[repr(C)]`, verified offsets) because the two sides
//! are compiled separately.

use crate::addr::PhysAddr;
use crate::memory::MemoryMapView;

/// Framebuffer information from the UEFI graphics output protocol.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct FramebufferInfo {
    /// Physical base address of the framebuffer (0 if absent).
    pub base: PhysAddr,
    /// Size of the framebuffer in bytes.
    pub size: u64,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Pixels per scan line (stride, >= width).
    pub pixels_per_scan_line: u32,
    /// Padding to keep the following fields 8-byte aligned.
    pub _reserved: u32,
}

impl FramebufferInfo {
    /// Check whether a framebuffer was handed over.
    #[must_use]
    pub const fn is_present(&self) -> bool {
        !self.base.is_null() && self.size != 0
    }

    /// Physical end of the framebuffer (one past the last byte).
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base.as_u64() + self.size
    }
}

/// Boot information passed from the bootloader to the kernel.
///
/// Consumed by name: the frame allocator reads the memory map, the
/// filesystem reads the initrd range, the heap places its arena past
/// whichever bootloader-owned region ends highest, and the interrupt
/// controller discovery walks the firmware configuration tables.
#[derive(Debug)]
#[repr(C)]
pub struct BootInfo {
    /// Framebuffer description (base 0 when not present).
    pub framebuffer: FramebufferInfo,
    /// Physical address of the memory-map descriptor array.
    pub memory_map_base: PhysAddr,
    /// Stride between memory-map descriptors in bytes.
    pub memory_map_entry_size: u64,
    /// Number of memory-map descriptors.
    pub memory_map_entry_count: u64,
    /// Physical address of the initrd image (0 if not present).
    pub initrd_base: PhysAddr,
    /// Size of the initrd in bytes (0 if not present).
    pub initrd_size: u64,
    /// Physical address of the firmware configuration-table array.
    pub config_table_base: PhysAddr,
    /// Number of firmware configuration-table entries.
    pub config_table_count: u64,
}

// Compile-time verification of the handoff layout.
const _: () = {
    assert!(core::mem::offset_of!(BootInfo, memory_map_base) == 32);
    assert!(core::mem::offset_of!(BootInfo, initrd_base) == 56);
    assert!(core::mem::offset_of!(BootInfo, config_table_base) == 72);
    assert!(core::mem::size_of::<BootInfo>() == 88);
};

impl BootInfo {
    /// Check if an initrd is present.
    #[must_use]
    pub const fn has_initrd(&self) -> bool {
        !self.initrd_base.is_null() && self.initrd_size != 0
    }

    /// Physical end of the initrd (one past the last byte).
    #[must_use]
    pub const fn initrd_end(&self) -> u64 {
        self.initrd_base.as_u64() + self.initrd_size
    }

    /// Borrow the memory map.
    ///
    /// # Safety
    ///
    /// The memory-map fields must describe a readable descriptor array,
    /// which holds for a `BootInfo` produced by the bootloader.
    #[must_use]
    pub unsafe fn memory_map(&self) -> MemoryMapView {
        // SAFETY: Forwarded to the caller's contract.
        unsafe {
            MemoryMapView::new(
                self.memory_map_base,
                self.memory_map_entry_size as usize,
                self.memory_map_entry_count as usize,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const fn empty_boot_info() -> BootInfo {
        BootInfo {
            framebuffer: FramebufferInfo {
                base: PhysAddr::new(0),
                size: 0,
                width: 0,
                height: 0,
                pixels_per_scan_line: 0,
                _reserved: 0,
            },
            memory_map_base: PhysAddr::new(0),
            memory_map_entry_size: 0,
            memory_map_entry_count: 0,
            initrd_base: PhysAddr::new(0),
            initrd_size: 0,
            config_table_base: PhysAddr::new(0),
            config_table_count: 0,
        }
    }

    #[test]
    fn test_initrd_presence() {
        let mut info = empty_boot_info();
        assert!(!info.has_initrd());
        info.initrd_base = PhysAddr::new(0x100000);
        info.initrd_size = 0x40;
        assert!(info.has_initrd());
        assert_eq!(info.initrd_end(), 0x100040);
    }

    #[test]
    fn test_framebuffer_presence() {
        let mut info = empty_boot_info();
        assert!(!info.framebuffer.is_present());
        info.framebuffer.base = PhysAddr::new(0x8000_0000);
        info.framebuffer.size = 0x300000;
        assert!(info.framebuffer.is_present());
        assert_eq!(info.framebuffer.end(), 0x8030_0000);
    }
}
