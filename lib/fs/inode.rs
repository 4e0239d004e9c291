use crate::utils::FS_ROOT_INODE;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub type Ino = u64;

struct Node {
    /// relative to the mirrored root, empty for the root itself
    path: PathBuf,
    lookups: u64,
}

/// Inode numbers handed to the kernel, keyed by path relative to the root. A node lives while
/// the kernel holds lookups on it, the root lives forever.
pub struct InodeTable {
    nodes: HashMap<Ino, Node>,
    by_path: HashMap<PathBuf, Ino>,
    next: Ino,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        let mut by_path = HashMap::new();
        nodes.insert(
            FS_ROOT_INODE,
            Node {
                path: PathBuf::new(),
                lookups: 1,
            },
        );
        by_path.insert(PathBuf::new(), FS_ROOT_INODE);
        Self {
            nodes,
            by_path,
            next: FS_ROOT_INODE + 1,
        }
    }

    pub fn path(&self, ino: Ino) -> Option<&Path> {
        self.nodes.get(&ino).map(|n| n.path.as_path())
    }

    /// ino of `path`, allocating one when it's unknown, each call counts one kernel lookup
    pub fn lookup(&mut self, path: &Path) -> Ino {
        if let Some(ino) = self.by_path.get(path) {
            if let Some(n) = self.nodes.get_mut(ino) {
                n.lookups += 1;
            }
            return *ino;
        }
        let ino = self.next;
        self.next += 1;
        self.nodes.insert(
            ino,
            Node {
                path: path.to_path_buf(),
                lookups: 1,
            },
        );
        self.by_path.insert(path.to_path_buf(), ino);
        ino
    }

    pub fn forget(&mut self, ino: Ino, n: u64) {
        if ino == FS_ROOT_INODE {
            return;
        }
        let gone = match self.nodes.get_mut(&ino) {
            Some(node) => {
                node.lookups = node.lookups.saturating_sub(n);
                node.lookups == 0
            }
            None => false,
        };
        if gone {
            if let Some(node) = self.nodes.remove(&ino) {
                if self.by_path.get(&node.path) == Some(&ino) {
                    self.by_path.remove(&node.path);
                }
            }
        }
    }

    /// the name is gone, a later lookup of the same path gets a fresh ino
    pub fn unlink(&mut self, path: &Path) {
        self.by_path.remove(path);
    }

    /// re-key `from` and everything below it to `to`
    pub fn rename(&mut self, from: &Path, to: &Path) {
        // a replaced target loses its name
        self.by_path.remove(to);
        let moved: Vec<(PathBuf, Ino)> = self
            .by_path
            .iter()
            .filter(|(p, _)| p.starts_with(from))
            .map(|(p, i)| (p.clone(), *i))
            .collect();
        for (old, ino) in moved {
            self.by_path.remove(&old);
            let new = match old.strip_prefix(from) {
                Ok(rest) if rest.as_os_str().is_empty() => to.to_path_buf(),
                Ok(rest) => to.join(rest),
                Err(_) => continue,
            };
            if let Some(n) = self.nodes.get_mut(&ino) {
                n.path = new.clone();
            }
            self.by_path.insert(new, ino);
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
