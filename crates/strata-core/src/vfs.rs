//! In-memory mirror of the extraction tree.
//!
//! When the orchestrator is given a [`VfsDirectory`], every persisted
//! artifact is also attached below a per-input mount point so the tree can
//! be browsed or mounted without touching the disk.

use bytes::Bytes;
use std::fmt::Write as FmtWrite;
use std::path::{Component, Path};

/// A node of the virtual tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VfsNode {
    /// Leaf holding artifact bytes
    File {
        /// Entry name within its directory
        name: String,
        /// Shared contents
        data: Bytes,
    },
    /// Nested directory
    Directory(VfsDirectory),
}

impl VfsNode {
    /// Creates a file node
    pub fn file(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        VfsNode::File {
            name: name.into(),
            data: data.into(),
        }
    }

    /// Entry name within its directory
    pub fn name(&self) -> &str {
        match self {
            VfsNode::File { name, .. } => name,
            VfsNode::Directory(dir) => dir.name(),
        }
    }

    /// Returns the directory if this node is one
    pub fn as_directory(&self) -> Option<&VfsDirectory> {
        match self {
            VfsNode::Directory(dir) => Some(dir),
            VfsNode::File { .. } => None,
        }
    }

    /// Returns the file contents if this node is a file
    pub fn as_file(&self) -> Option<&Bytes> {
        match self {
            VfsNode::File { data, .. } => Some(data),
            VfsNode::Directory(_) => None,
        }
    }
}

/// A directory of the virtual tree; children keep insertion order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VfsDirectory {
    name: String,
    children: Vec<VfsNode>,
}

impl VfsDirectory {
    /// Creates an empty directory
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            children: Vec::new(),
        }
    }

    /// Directory name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Direct children
    pub fn children(&self) -> &[VfsNode] {
        &self.children
    }

    /// Returns the child directory `name`, creating it if needed.
    ///
    /// A file already using that name is replaced by the directory.
    pub fn mount(&mut self, name: &str) -> &mut VfsDirectory {
        let index = match self.children.iter().position(|c| c.name() == name) {
            Some(i) => {
                if self.children[i].as_directory().is_none() {
                    self.children[i] = VfsNode::Directory(VfsDirectory::new(name));
                }
                i
            }
            None => {
                self.children.push(VfsNode::Directory(VfsDirectory::new(name)));
                self.children.len() - 1
            }
        };
        match &mut self.children[index] {
            VfsNode::Directory(dir) => dir,
            VfsNode::File { .. } => unreachable!("mount point replaced by a directory above"),
        }
    }

    /// Walks (and creates) the directories along `path`.
    ///
    /// Only normal components are honoured; `..`, roots and prefixes are
    /// dropped so a node can never escape this directory.
    pub fn directory_at(&mut self, path: &Path) -> &mut VfsDirectory {
        let mut dir = self;
        for component in path.components() {
            if let Component::Normal(segment) = component {
                dir = dir.mount(&segment.to_string_lossy());
            }
        }
        dir
    }

    /// Adds `node`, replacing any child with the same name
    pub fn insert(&mut self, node: VfsNode) {
        match self.children.iter().position(|c| c.name() == node.name()) {
            Some(i) => self.children[i] = node,
            None => self.children.push(node),
        }
    }

    /// Looks up a descendant by relative path
    pub fn get(&self, path: impl AsRef<Path>) -> Option<&VfsNode> {
        let mut segments = path
            .as_ref()
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
                _ => None,
            })
            .peekable();

        let mut dir = self;
        while let Some(segment) = segments.next() {
            let child = dir.children.iter().find(|c| c.name() == segment)?;
            if segments.peek().is_none() {
                return Some(child);
            }
            dir = child.as_directory()?;
        }
        None
    }

    /// Number of file nodes anywhere below this directory
    pub fn file_count(&self) -> usize {
        self.children
            .iter()
            .map(|c| match c {
                VfsNode::File { .. } => 1,
                VfsNode::Directory(dir) => dir.file_count(),
            })
            .sum()
    }

    /// Draws the tree, one entry per line, two spaces per level
    pub fn render(&self) -> String {
        let mut out = String::new();
        // Writing to a String cannot fail
        let _ = self.render_into(&mut out, 0);
        out
    }

    fn render_into(&self, out: &mut String, depth: usize) -> std::fmt::Result {
        writeln!(out, "{}{}/", "  ".repeat(depth), self.name)?;
        for child in &self.children {
            match child {
                VfsNode::Directory(dir) => dir.render_into(out, depth + 1)?,
                VfsNode::File { name, data } => {
                    writeln!(out, "{}{} ({} bytes)", "  ".repeat(depth + 1), name, data.len())?
                }
            }
        }
        Ok(())
    }
}
