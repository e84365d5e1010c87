//! USTAR archive ingest
//!
//! Parses the boot initrd as a USTAR tar archive and builds the RAM
//! filesystem from it. Only regular-file entries (type byte '0') are
//! ingested; intermediate directories are created once as paths reveal
//! them; file data aliases the archive in place. The first block
//! without the USTAR magic terminates the walk.

use zerocopy::{FromBytes, Immutable, KnownLayout};

use super::ramfs::RamFs;
use super::{FsDriver, FsError};

/// TAR block size (always 512 bytes).
const TAR_BLOCK_SIZE: usize = 512;

/// USTAR magic string.
const USTAR_MAGIC: &[u8; 5] = b"ustar";

/// Regular file type flag.
const TYPE_REGULAR: u8 = b'0';

/// USTAR tar header (512 bytes).
///
/// All numeric fields are stored as ASCII octal strings.
#[derive(FromBytes, Immutable, KnownLayout)]
#[repr(C)]
struct TarHeader {
    /// File name (null-terminated).
    name: [u8; 100],
    /// File mode (octal).
    mode: [u8; 8],
    /// Owner user ID (octal).
    uid: [u8; 8],
    /// Owner group ID (octal).
    gid: [u8; 8],
    /// File size in bytes (octal).
    size: [u8; 12],
    /// Modification time (octal).
    mtime: [u8; 12],
    /// Header checksum.
    chksum: [u8; 8],
    /// File type flag.
    typeflag: u8,
    /// Link name (for links).
    linkname: [u8; 100],
    /// USTAR magic ("ustar").
    magic: [u8; 6],
    /// USTAR version.
    version: [u8; 2],
    /// Owner user name.
    uname: [u8; 32],
    /// Owner group name.
    gname: [u8; 32],
    /// Device major number.
    devmajor: [u8; 8],
    /// Device minor number.
    devminor: [u8; 8],
    /// Filename prefix.
    prefix: [u8; 155],
    /// Padding to 512 bytes.
    _pad: [u8; 12],
}

const _: () = assert!(core::mem::size_of::<TarHeader>() == TAR_BLOCK_SIZE);

/// Parse an octal ASCII field, stopping at the first NUL or space.
fn parse_octal(field: &[u8]) -> usize {
    let mut result = 0usize;
    for &byte in field {
        if byte == 0 || byte == b' ' {
            break;
        }
        if byte.is_ascii_digit() && byte < b'8' {
            result = result.saturating_mul(8).saturating_add((byte - b'0') as usize);
        }
    }
    result
}

/// Extract the (null-terminated) entry name.
fn extract_name(header: &TarHeader) -> Option<&str> {
    let len = header.name.iter().position(|&b| b == 0).unwrap_or(header.name.len());
    if len == 0 {
        return None;
    }
    core::str::from_utf8(&header.name[..len]).ok()
}

fn is_ustar(header: &TarHeader) -> bool {
    header.magic[..5] == *USTAR_MAGIC
}

fn header_at(archive: &[u8], offset: usize) -> Option<&TarHeader> {
    let block = archive.get(offset..offset + TAR_BLOCK_SIZE)?;
    TarHeader::ref_from_bytes(block).ok()
}

/// Walk the archive and create every regular file in `fs`.
///
/// Returns the number of files created. A regular-file entry whose path
/// ends in `/` (or is empty) is malformed and fails the ingest with
/// [`FsError::InvalidArgument`].
pub fn ingest(archive: &'static [u8], fs: &mut RamFs) -> Result<usize, FsError> {
    let mut offset = 0;
    let mut ingested = 0;

    while let Some(header) = header_at(archive, offset) {
        if !is_ustar(header) {
            break;
        }

        let size = parse_octal(&header.size);
        if header.typeflag == TYPE_REGULAR {
            let name = extract_name(header).ok_or(FsError::InvalidArgument)?;
            if name.ends_with('/') {
                return Err(FsError::InvalidArgument);
            }

            let data_start = offset + TAR_BLOCK_SIZE;
            let data = archive
                .get(data_start..data_start + size)
                .ok_or(FsError::InvalidArgument)?;

            let mut tokens = name.split('/').filter(|t| !t.is_empty()).peekable();
            let mut parent = fs.root();
            while let Some(token) = tokens.next() {
                if tokens.peek().is_none() {
                    fs.mkfile(parent, token, data)?;
                    ingested += 1;
                } else {
                    parent = match fs.child_by_name(parent, token) {
                        Some(existing) => existing,
                        None => fs.mkdir(parent, token)?,
                    };
                }
            }
        }

        offset += TAR_BLOCK_SIZE + size.div_ceil(TAR_BLOCK_SIZE) * TAR_BLOCK_SIZE;
    }

    Ok(ingested)
}

/// Log the archive's entries, boot diagnostics only.
pub fn list(archive: &[u8]) {
    let mut offset = 0;
    while let Some(header) = header_at(archive, offset) {
        if !is_ustar(header) {
            break;
        }
        let size = parse_octal(&header.size);
        if let Some(name) = extract_name(header) {
            let kind = match header.typeflag {
                TYPE_REGULAR => '-',
                b'5' => 'd',
                b'2' => 'l',
                _ => '?',
            };
            log::debug!("  {} {:>10} {}", kind, size, name);
        }
        offset += TAR_BLOCK_SIZE + size.div_ceil(TAR_BLOCK_SIZE) * TAR_BLOCK_SIZE;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::NodeKind;
    use std::boxed::Box;
    use std::string::String;
    use std::vec::Vec;

    fn entry(name: &str, typeflag: u8, data: &[u8]) -> Vec<u8> {
        let mut header = [0u8; TAR_BLOCK_SIZE];
        header[..name.len()].copy_from_slice(name.as_bytes());
        let size_field = {
            let mut s = String::new();
            use core::fmt::Write;
            write!(s, "{:011o}", data.len()).unwrap();
            s
        };
        header[124..124 + 11].copy_from_slice(size_field.as_bytes());
        header[156] = typeflag;
        header[257..263].copy_from_slice(b"ustar\0");

        let mut block = Vec::from(header);
        block.extend_from_slice(data);
        while block.len() % TAR_BLOCK_SIZE != 0 {
            block.push(0);
        }
        block
    }

    fn archive(entries: &[Vec<u8>]) -> &'static [u8] {
        let mut bytes = Vec::new();
        for e in entries {
            bytes.extend_from_slice(e);
        }
        bytes.extend_from_slice(&[0u8; 2 * TAR_BLOCK_SIZE]);
        Box::leak(bytes.into_boxed_slice())
    }

    #[test]
    fn test_single_file_roundtrip() {
        // One 64-byte /init, then read it back through a lookup.
        let payload: Vec<u8> = (0u8..64).collect();
        let tar = archive(&[entry("init", TYPE_REGULAR, &payload)]);

        let mut fs = RamFs::new();
        assert_eq!(ingest(tar, &mut fs), Ok(1));

        let info = fs.find_node("/init").unwrap();
        assert_eq!(info.kind, NodeKind::File);
        assert_eq!(info.size, 64);

        let mut back = [0u8; 64];
        fs.read(info.node, 0, &mut back).unwrap();
        assert_eq!(&back[..], &payload[..]);
    }

    #[test]
    fn test_nested_paths_create_directories_once() {
        let tar = archive(&[
            entry("usr/bin/sh", TYPE_REGULAR, b"#!"),
            entry("usr/bin/env", TYPE_REGULAR, b"env"),
            entry("usr/lib/libc", TYPE_REGULAR, b"\x7fELF"),
        ]);

        let mut fs = RamFs::new();
        assert_eq!(ingest(tar, &mut fs), Ok(3));

        assert!(fs.find_node("/usr/bin/sh").is_ok());
        assert!(fs.find_node("/usr/bin/env").is_ok());
        assert!(fs.find_node("/usr/lib/libc").is_ok());

        // "usr" and "bin" exist exactly once.
        let usr = fs.child_by_name(fs.root(), "usr").unwrap();
        let bin = fs.child_by_name(usr, "bin").unwrap();
        assert!(fs.child_by_name(bin, "sh").is_some());
    }

    #[test]
    fn test_directory_entries_are_skipped() {
        let tar = archive(&[
            entry("opt/", b'5', b""),
            entry("opt/tool", TYPE_REGULAR, b"t"),
        ]);
        let mut fs = RamFs::new();
        assert_eq!(ingest(tar, &mut fs), Ok(1));
        assert!(fs.find_node("/opt/tool").is_ok());
    }

    #[test]
    fn test_regular_entry_with_trailing_slash_is_rejected() {
        let tar = archive(&[entry("bad/", TYPE_REGULAR, b"")]);
        let mut fs = RamFs::new();
        assert_eq!(ingest(tar, &mut fs), Err(FsError::InvalidArgument));
    }

    #[test]
    fn test_first_non_ustar_block_terminates() {
        let mut entries = std::vec![entry("kept", TYPE_REGULAR, b"k")];
        let mut bogus = entry("lost", TYPE_REGULAR, b"l");
        bogus[257..263].copy_from_slice(b"nope\0\0");
        entries.push(bogus);

        let mut fs = RamFs::new();
        assert_eq!(ingest(archive(&entries), &mut fs), Ok(1));
        assert!(fs.find_node("/kept").is_ok());
        assert_eq!(fs.find_node("/lost"), Err(FsError::NotFound));
    }

    #[test]
    fn test_octal_parser() {
        assert_eq!(parse_octal(b"00000000100"), 64);
        assert_eq!(parse_octal(b"777 "), 511);
        assert_eq!(parse_octal(b"\0junk"), 0);
    }
}
