//! RAM filesystem
//!
//! A tree of nodes held in an arena, with parent / first-child /
//! next-sibling links. File contents are never copied: each file node
//! aliases a slice of the still-mapped initrd image.

use alloc::string::String;
use alloc::vec::Vec;

use super::{FsDriver, FsError, NodeInfo, NodeKind, NodeRef};

struct RamfsNode {
    name: String,
    kind: NodeKind,
    #[allow(dead_code)]
    parent: Option<NodeRef>,
    first_child: Option<NodeRef>,
    next_sibling: Option<NodeRef>,
    data: &'static [u8],
}

/// The in-memory filesystem; node 0 is the root directory with the
/// empty name.
pub struct RamFs {
    nodes: Vec<RamfsNode>,
}

impl RamFs {
    /// A filesystem containing only the root directory.
    #[must_use]
    pub fn new() -> Self {
        let root = RamfsNode {
            name: String::new(),
            kind: NodeKind::Directory,
            parent: None,
            first_child: None,
            next_sibling: None,
            data: &[],
        };
        let mut nodes = Vec::new();
        nodes.push(root);
        Self { nodes }
    }

    /// The root directory.
    #[inline]
    #[must_use]
    pub fn root(&self) -> NodeRef {
        0
    }

    /// Look a child up by name.
    #[must_use]
    pub fn child_by_name(&self, parent: NodeRef, name: &str) -> Option<NodeRef> {
        let mut cursor = self.nodes.get(parent)?.first_child;
        while let Some(node) = cursor {
            if self.nodes[node].name == name {
                return Some(node);
            }
            cursor = self.nodes[node].next_sibling;
        }
        None
    }

    /// Append a fresh node at the tail of `parent`'s child list.
    fn attach(&mut self, parent: NodeRef, node: RamfsNode) -> Result<NodeRef, FsError> {
        if self.nodes.get(parent).map(|n| n.kind) != Some(NodeKind::Directory) {
            return Err(FsError::Unsupported);
        }

        let fresh = self.nodes.len();
        self.nodes.push(node);

        match self.nodes[parent].first_child {
            None => self.nodes[parent].first_child = Some(fresh),
            Some(first) => {
                let mut tail = first;
                while let Some(next) = self.nodes[tail].next_sibling {
                    tail = next;
                }
                self.nodes[tail].next_sibling = Some(fresh);
            }
        }
        Ok(fresh)
    }
}

impl Default for RamFs {
    fn default() -> Self {
        Self::new()
    }
}

impl FsDriver for RamFs {
    fn find_node(&self, suffix: &str) -> Result<NodeInfo, FsError> {
        let mut node = self.root();
        for token in suffix.split('/').filter(|t| !t.is_empty()) {
            node = self.child_by_name(node, token).ok_or(FsError::NotFound)?;
        }

        let found = &self.nodes[node];
        Ok(NodeInfo {
            node,
            kind: found.kind,
            size: found.data.len(),
        })
    }

    fn read(&self, node: NodeRef, cursor: usize, out: &mut [u8]) -> Result<(), FsError> {
        let file = self.nodes.get(node).ok_or(FsError::NotFound)?;
        if file.kind != NodeKind::File {
            return Err(FsError::Unsupported);
        }
        let end = cursor.checked_add(out.len()).ok_or(FsError::OutOfRange)?;
        if end > file.data.len() {
            return Err(FsError::OutOfRange);
        }
        out.copy_from_slice(&file.data[cursor..end]);
        Ok(())
    }

    fn mkdir(&mut self, parent: NodeRef, name: &str) -> Result<NodeRef, FsError> {
        if name.is_empty() {
            return Err(FsError::InvalidArgument);
        }
        self.attach(
            parent,
            RamfsNode {
                name: String::from(name),
                kind: NodeKind::Directory,
                parent: Some(parent),
                first_child: None,
                next_sibling: None,
                data: &[],
            },
        )
    }

    fn mkfile(
        &mut self,
        parent: NodeRef,
        name: &str,
        data: &'static [u8],
    ) -> Result<NodeRef, FsError> {
        if name.is_empty() {
            return Err(FsError::InvalidArgument);
        }
        self.attach(
            parent,
            RamfsNode {
                name: String::from(name),
                kind: NodeKind::File,
                parent: Some(parent),
                first_child: None,
                next_sibling: None,
                data,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tree_walk() {
        let mut fs = RamFs::new();
        let bin = fs.mkdir(fs.root(), "bin").unwrap();
        fs.mkfile(bin, "init", b"\x7fELF").unwrap();
        fs.mkfile(fs.root(), "readme", b"hi").unwrap();

        let info = fs.find_node("/bin/init").unwrap();
        assert_eq!(info.kind, NodeKind::File);
        assert_eq!(info.size, 4);

        let root_info = fs.find_node("").unwrap();
        assert_eq!(root_info.kind, NodeKind::Directory);

        assert_eq!(fs.find_node("/bin/missing"), Err(FsError::NotFound));
        assert_eq!(fs.find_node("/readme/impossible"), Err(FsError::NotFound));
    }

    #[test]
    fn test_read_bounds() {
        let mut fs = RamFs::new();
        let file = fs.mkfile(fs.root(), "data", b"abcdef").unwrap();

        let mut buf = [0u8; 3];
        fs.read(file, 2, &mut buf).unwrap();
        assert_eq!(&buf, b"cde");

        let mut exact = [0u8; 6];
        fs.read(file, 0, &mut exact).unwrap();
        assert_eq!(&exact, b"abcdef");

        let mut over = [0u8; 2];
        assert_eq!(fs.read(file, 5, &mut over), Err(FsError::OutOfRange));
        assert_eq!(fs.read(fs.root(), 0, &mut over), Err(FsError::Unsupported));
    }

    #[test]
    fn test_children_append_in_order() {
        let mut fs = RamFs::new();
        fs.mkdir(fs.root(), "a").unwrap();
        fs.mkdir(fs.root(), "b").unwrap();
        fs.mkdir(fs.root(), "c").unwrap();

        assert_eq!(fs.child_by_name(fs.root(), "a"), Some(1));
        assert_eq!(fs.child_by_name(fs.root(), "b"), Some(2));
        assert_eq!(fs.child_by_name(fs.root(), "c"), Some(3));
        assert_eq!(fs.child_by_name(fs.root(), "d"), None);
    }
}
