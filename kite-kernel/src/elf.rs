//! ELF loader
//!
//! Loads a static 64-bit executable from an open file handle into a
//! destination address space. Segments are backed by contiguous frame
//! runs mapped user-writable in the destination; the payload is written
//! through the kernel's direct map, which reaches the frames whether or
//! not the destination space is current. The raw program-header table
//! is kept in the image record for the process lifetime.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use kite_common::memory::page;
use kite_paging::arch::ArchPageTable;
use kite_paging::{FrameSource, PageFlags, phys_to_virt, space};
use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::fs::{FileHandle, FsError, Vfs};

/// ELF identification magic.
const ELF_MAGIC: [u8; 4] = *b"\x7fELF";
/// Executable object type.
const ET_EXEC: u16 = 2;
/// Loadable program segment.
const PT_LOAD: u32 = 1;

/// Errors from the loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfError {
    /// Bad magic, ABI, type, or a truncated/misaligned image.
    InvalidElf,
    /// Frames or tables could not be allocated.
    OutOfMemory,
}

impl From<FsError> for ElfError {
    fn from(_: FsError) -> Self {
        Self::InvalidElf
    }
}

impl From<space::MapError> for ElfError {
    fn from(err: space::MapError) -> Self {
        match err {
            space::MapError::OutOfMemory => Self::OutOfMemory,
            _ => Self::InvalidElf,
        }
    }
}

/// ELF64 file header.
#[derive(Debug, Clone, Copy, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct ElfHeader {
    pub magic: [u8; 4],
    pub class: u8,
    pub endianness: u8,
    pub ident_version: u8,
    pub abi: u8,
    pub _unused: [u8; 8],
    pub elf_type: u16,
    pub machine: u16,
    pub version: u32,
    pub entry: u64,
    pub phoff: u64,
    pub shoff: u64,
    pub flags: u32,
    pub ehsize: u16,
    pub phentsize: u16,
    pub phnum: u16,
    pub shentsize: u16,
    pub shnum: u16,
    pub shstrndx: u16,
}

const _: () = assert!(core::mem::size_of::<ElfHeader>() == 64);

/// ELF64 program header.
#[derive(Debug, Clone, Copy, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct ProgramHeader {
    pub ptype: u32,
    pub flags: u32,
    pub offset: u64,
    pub vaddr: u64,
    pub paddr: u64,
    pub filesz: u64,
    pub memsz: u64,
    pub align: u64,
}

const _: () = assert!(core::mem::size_of::<ProgramHeader>() == 56);

/// What a process keeps of its executable, shared with forked children
/// until an exec replaces it.
#[derive(Debug)]
pub struct ElfImage {
    /// Entry-point virtual address.
    pub entry: u64,
    /// Program-header record size.
    pub phdr_entry_size: u16,
    /// Number of program headers.
    pub phdr_count: u16,
    /// The raw program-header table.
    pub phdr_copy: Vec<u8>,
}

/// Shared handle to an image; the reference count is the number of
/// processes using it.
pub type ImageRef = Arc<ElfImage>;

fn validate(header: &ElfHeader) -> bool {
    header.magic == ELF_MAGIC && header.abi == 0 && header.elf_type == ET_EXEC
}

/// Read and validate the file header, leaving the cursor past it.
///
/// Cheap enough to run before any destructive step of an exec.
pub fn read_header(vfs: &Vfs, handle: &mut FileHandle) -> Result<ElfHeader, ElfError> {
    vfs.seek(handle, 0)?;
    let mut buf = [0u8; core::mem::size_of::<ElfHeader>()];
    vfs.read(handle, &mut buf)?;

    let header = ElfHeader::read_from_bytes(&buf).map_err(|_| ElfError::InvalidElf)?;
    if !validate(&header) {
        return Err(ElfError::InvalidElf);
    }
    Ok(header)
}

/// Load the executable behind `handle` into `dest`.
///
/// For every `PT_LOAD` segment: lock a contiguous frame run covering
/// `memsz`, map it user-writable at `vaddr` in `dest`, write `filesz`
/// bytes of payload through the direct map and zero the remainder.
pub fn load<A: ArchPageTable, F: FrameSource>(
    vfs: &Vfs,
    handle: &mut FileHandle,
    dest: u64,
    frames: &mut F,
) -> Result<ElfImage, ElfError> {
    let header = read_header(vfs, handle)?;

    let entry_size = header.phentsize as usize;
    if entry_size < core::mem::size_of::<ProgramHeader>() {
        return Err(ElfError::InvalidElf);
    }

    vfs.seek(handle, header.phoff as usize)?;
    let mut phdr_copy = vec![0u8; entry_size * header.phnum as usize];
    vfs.read(handle, &mut phdr_copy)?;

    for index in 0..header.phnum as usize {
        let record = &phdr_copy[index * entry_size..][..core::mem::size_of::<ProgramHeader>()];
        let phdr = ProgramHeader::read_from_bytes(record).map_err(|_| ElfError::InvalidElf)?;
        if phdr.ptype != PT_LOAD || phdr.memsz == 0 {
            continue;
        }
        if phdr.vaddr as usize % page::SIZE_4K != 0 || phdr.filesz > phdr.memsz {
            return Err(ElfError::InvalidElf);
        }

        let pages = (phdr.memsz as usize).div_ceil(page::SIZE_4K);
        let run = frames.allocate_contiguous(pages).ok_or(ElfError::OutOfMemory)?;

        for page_index in 0..pages {
            let offset = (page_index * page::SIZE_4K) as u64;
            space::map::<A, _>(dest, phdr.vaddr + offset, run + offset, PageFlags::USER_WRITE, frames)?;
        }

        // The tail of the run past filesz stays zero.
        let total = pages * page::SIZE_4K;
        // SAFETY: The run was just allocated for this segment and is
        // reachable through the direct map.
        let segment = unsafe {
            core::slice::from_raw_parts_mut(phys_to_virt(run) as *mut u8, total)
        };
        segment[phdr.filesz as usize..].fill(0);
        vfs.seek(handle, phdr.offset as usize)?;
        vfs.read(handle, &mut segment[..phdr.filesz as usize])?;
    }

    Ok(ElfImage {
        entry: header.entry,
        phdr_entry_size: header.phentsize,
        phdr_count: header.phnum,
        phdr_copy,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::ramfs::RamFs;
    use crate::fs::{FsDriver, NodeKind};
    use crate::testutil::{Segment, TestFrames, build_elf};
    use kite_paging::arch::x86_64::X86_64;
    use std::boxed::Box;

    fn vfs_with(image: Vec<u8>) -> Vfs {
        let mut root = RamFs::new();
        root.mkfile(root.root(), "init", Box::leak(image.into_boxed_slice()))
            .unwrap();
        let mut vfs = Vfs::new();
        vfs.mount("/", Box::new(root));
        vfs
    }

    #[test]
    fn test_load_maps_segments_user_writable() {
        let image = build_elf(
            0x40_0080,
            &[
                Segment { vaddr: 0x40_0000, data: std::vec![0x90; 32], memsz: 0x1000 },
                Segment { vaddr: 0x60_0000, data: std::vec![0xCC; 16], memsz: 0x1000 },
            ],
        );
        let vfs = vfs_with(image);
        let mut handle = vfs.find_node("/init").unwrap();
        assert_eq!(handle.kind, NodeKind::File);

        let mut frames = TestFrames::new();
        let dest = space::create_table(&mut frames).unwrap();

        let loaded = load::<X86_64, _>(&vfs, &mut handle, dest, &mut frames).unwrap();
        assert_eq!(loaded.entry, 0x40_0080);
        assert_eq!(loaded.phdr_count, 2);
        assert_eq!(loaded.phdr_copy.len(), 2 * 56);

        for (vaddr, fill, filesz) in [(0x40_0000u64, 0x90u8, 32usize), (0x60_0000, 0xCC, 16)] {
            let (pa, flags) = space::translate::<X86_64>(dest, vaddr).unwrap();
            assert_eq!(flags, PageFlags::USER_WRITE);
            assert_eq!(frames.refcount(pa), 1);

            // Payload present, remainder of the page zero.
            let bytes =
                unsafe { core::slice::from_raw_parts(pa as *const u8, page::SIZE_4K) };
            assert!(bytes[..filesz].iter().all(|&b| b == fill));
            assert!(bytes[filesz..].iter().all(|&b| b == 0));
        }
    }

    #[test]
    fn test_validation_rejects_bad_headers() {
        let good = build_elf(0x1000, &[Segment { vaddr: 0x1000, data: std::vec![1], memsz: 1 }]);

        let mut bad_magic = good.clone();
        bad_magic[0] = b'Z';
        let mut bad_abi = good.clone();
        bad_abi[7] = 3;
        let mut bad_type = good.clone();
        bad_type[16] = 1; // ET_REL

        for image in [bad_magic, bad_abi, bad_type] {
            let vfs = vfs_with(image);
            let mut handle = vfs.find_node("/init").unwrap();
            let mut frames = TestFrames::new();
            let dest = space::create_table(&mut frames).unwrap();
            assert_eq!(
                load::<X86_64, _>(&vfs, &mut handle, dest, &mut frames).err(),
                Some(ElfError::InvalidElf)
            );
        }
    }

    #[test]
    fn test_truncated_image_is_invalid() {
        let mut image = build_elf(
            0x40_0000,
            &[Segment { vaddr: 0x40_0000, data: std::vec![7; 64], memsz: 64 }],
        );
        image.truncate(image.len() - 32);

        let vfs = vfs_with(image);
        let mut handle = vfs.find_node("/init").unwrap();
        let mut frames = TestFrames::new();
        let dest = space::create_table(&mut frames).unwrap();
        assert_eq!(
            load::<X86_64, _>(&vfs, &mut handle, dest, &mut frames).err(),
            Some(ElfError::InvalidElf)
        );
    }
}
