//! Virtual filesystem
//!
//! A mount table with longest-prefix dispatch over a small driver
//! capability set, and cursor-based open handles. The only driver in the
//! core is [`ramfs::RamFs`], populated from the boot initrd by
//! [`tar::ingest`].

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;

use kite_arch::IrqSpinMutex;
use kite_common::boot::BootInfo;
use kite_paging::phys_to_virt;

pub mod ramfs;
pub mod tar;

/// Errors from filesystem operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// No mount or node matches the path.
    NotFound,
    /// Malformed path or archive entry.
    InvalidArgument,
    /// A read or seek past the end of the file.
    OutOfRange,
    /// The node does not support the operation.
    Unsupported,
}

/// What a node is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Directory,
    Symlink,
}

/// Driver-opaque node handle.
pub type NodeRef = usize;

/// Result of a driver lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeInfo {
    pub node: NodeRef,
    pub kind: NodeKind,
    pub size: usize,
}

/// The capability set a filesystem driver provides.
pub trait FsDriver: Send {
    /// Resolve a path suffix (relative to the mount) to a node.
    fn find_node(&self, suffix: &str) -> Result<NodeInfo, FsError>;

    /// Copy `out.len()` bytes starting at `cursor` out of a file node.
    fn read(&self, node: NodeRef, cursor: usize, out: &mut [u8]) -> Result<(), FsError>;

    /// Create a directory under `parent`.
    fn mkdir(&mut self, parent: NodeRef, name: &str) -> Result<NodeRef, FsError>;

    /// Create a file under `parent` whose contents alias `data`.
    fn mkfile(&mut self, parent: NodeRef, name: &str, data: &'static [u8])
    -> Result<NodeRef, FsError>;
}

/// An open node: which mount and node it came from, plus the read
/// cursor.
#[derive(Debug, Clone)]
pub struct FileHandle {
    mount: usize,
    node: NodeRef,
    pub kind: NodeKind,
    pub cursor: usize,
    pub size: usize,
}

struct MountPoint {
    prefix: String,
    driver: Box<dyn FsDriver>,
}

/// The mount table.
pub struct Vfs {
    mounts: Vec<MountPoint>,
}

impl Vfs {
    /// An empty mount table.
    #[must_use]
    pub const fn new() -> Self {
        Self { mounts: Vec::new() }
    }

    /// Register a driver at `prefix`.
    pub fn mount(&mut self, prefix: &str, driver: Box<dyn FsDriver>) {
        self.mounts.push(MountPoint { prefix: String::from(prefix), driver });
    }

    /// The mount whose prefix matches the longest run of `path`, with
    /// the match length.
    #[must_use]
    pub fn mount_for(&self, path: &str) -> Option<(usize, usize)> {
        self.mounts
            .iter()
            .enumerate()
            .filter(|(_, mount)| path.starts_with(mount.prefix.as_str()))
            .max_by_key(|(_, mount)| mount.prefix.len())
            .map(|(index, mount)| (index, mount.prefix.len()))
    }

    /// Open the node at `path`.
    pub fn find_node(&self, path: &str) -> Result<FileHandle, FsError> {
        let (mount, matched) = self.mount_for(path).ok_or(FsError::NotFound)?;
        let info = self.mounts[mount].driver.find_node(&path[matched..])?;
        Ok(FileHandle {
            mount,
            node: info.node,
            kind: info.kind,
            cursor: 0,
            size: info.size,
        })
    }

    /// Read `out.len()` bytes at the handle's cursor, advancing it.
    pub fn read(&self, handle: &mut FileHandle, out: &mut [u8]) -> Result<(), FsError> {
        let mount = self.mounts.get(handle.mount).ok_or(FsError::NotFound)?;
        mount.driver.read(handle.node, handle.cursor, out)?;
        handle.cursor += out.len();
        Ok(())
    }

    /// Move the handle's cursor to an absolute position within the file.
    pub fn seek(&self, handle: &mut FileHandle, position: usize) -> Result<usize, FsError> {
        if position > handle.size {
            return Err(FsError::OutOfRange);
        }
        handle.cursor = position;
        Ok(position)
    }
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

// -- Global VFS

static VFS: IrqSpinMutex<Option<Vfs>> = IrqSpinMutex::new(None);

/// Mount the RAM filesystem at `/` and ingest the initrd.
///
/// # Safety
///
/// The boot record's initrd fields must describe a mapped image that
/// stays resident; file nodes alias it without copying.
///
/// # Panics
///
/// Panics when the initrd is present but malformed, which halts the
/// boot.
pub unsafe fn init(boot_info: &BootInfo) {
    let mut root = ramfs::RamFs::new();

    if boot_info.has_initrd() {
        // SAFETY: The initrd stays mapped for the kernel's lifetime per
        // the caller's contract.
        let image = unsafe {
            core::slice::from_raw_parts(
                phys_to_virt(boot_info.initrd_base.as_u64()) as *const u8,
                boot_info.initrd_size as usize,
            )
        };
        let ingested = tar::ingest(image, &mut root).expect("malformed initrd archive");
        log::info!("initrd: {} files", ingested);
        tar::list(image);
    }

    let mut vfs = Vfs::new();
    vfs.mount("/", Box::new(root));
    *VFS.lock() = Some(vfs);
}

/// Run `f` against the global mount table, for callers that hold the
/// lock across several operations (the ELF loader's seek/read runs).
///
/// # Panics
///
/// Panics before [`init`].
pub fn with_vfs<R>(f: impl FnOnce(&Vfs) -> R) -> R {
    let guard = VFS.lock();
    f(guard.as_ref().expect("filesystem not initialised"))
}

/// Open a node through the global mount table.
pub fn find_node(path: &str) -> Result<FileHandle, FsError> {
    let guard = VFS.lock();
    let vfs = guard.as_ref().ok_or(FsError::NotFound)?;
    vfs.find_node(path)
}

/// Read through the global mount table.
pub fn read(handle: &mut FileHandle, out: &mut [u8]) -> Result<(), FsError> {
    let guard = VFS.lock();
    let vfs = guard.as_ref().ok_or(FsError::NotFound)?;
    vfs.read(handle, out)
}

/// Seek through the global mount table.
pub fn seek(handle: &mut FileHandle, position: usize) -> Result<usize, FsError> {
    let guard = VFS.lock();
    let vfs = guard.as_ref().ok_or(FsError::NotFound)?;
    vfs.seek(handle, position)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_longest_prefix_mount_wins() {
        let mut vfs = Vfs::new();
        let mut root = ramfs::RamFs::new();
        let dev_root = ramfs::RamFs::new();

        let etc = root.mkdir(root.root(), "etc").unwrap();
        root.mkfile(etc, "motd", b"hello").unwrap();
        vfs.mount("/", Box::new(root));
        vfs.mount("/dev", Box::new(dev_root));

        assert_eq!(vfs.mount_for("/etc/motd"), Some((0, 1)));
        assert_eq!(vfs.mount_for("/dev/tty"), Some((1, 4)));
        assert_eq!(vfs.mount_for("relative"), None);
    }

    #[test]
    fn test_handle_cursor_and_seek() {
        let mut vfs = Vfs::new();
        let mut root = ramfs::RamFs::new();
        root.mkfile(root.root(), "data", b"0123456789").unwrap();
        vfs.mount("/", Box::new(root));

        let mut handle = vfs.find_node("/data").unwrap();
        assert_eq!(handle.kind, NodeKind::File);
        assert_eq!(handle.size, 10);
        assert_eq!(handle.cursor, 0);

        let mut buf = [0u8; 4];
        vfs.read(&mut handle, &mut buf).unwrap();
        assert_eq!(&buf, b"0123");
        assert_eq!(handle.cursor, 4);

        vfs.seek(&mut handle, 8).unwrap();
        let mut tail = [0u8; 2];
        vfs.read(&mut handle, &mut tail).unwrap();
        assert_eq!(&tail, b"89");

        let mut over = [0u8; 1];
        assert_eq!(vfs.read(&mut handle, &mut over), Err(FsError::OutOfRange));
        assert_eq!(vfs.seek(&mut handle, 11), Err(FsError::OutOfRange));
    }
}
