//! In-memory mirror of the device filesystem under `/usr`.

use std::cmp::Ordering;

use serde::Deserialize;

use crate::error::{AppError, Result};

/// Top-level device directory. Nodes directly under it live at the tree root.
pub const DEVICE_ROOT: &str = "/usr";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileNode {
    pub name: String,
    /// `"<N> B"` for files, empty for directories.
    pub size: String,
    pub path: String,
    /// `Some` for directories, even when empty.
    pub children: Option<Vec<FileNode>>,
}

impl FileNode {
    pub fn file(name: impl Into<String>, size: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size: size.into(),
            path: path.into(),
            children: None,
        }
    }

    pub fn dir(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size: String::new(),
            path: path.into(),
            children: Some(Vec::new()),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.children.is_some()
    }
}

/// One entry of the structured listing printed by the device helper.
#[derive(Debug, Clone, Deserialize)]
pub struct ListingEntry {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub size: String,
    pub path: String,
    #[serde(default)]
    pub sub: Option<Vec<ListingEntry>>,
}

impl From<ListingEntry> for FileNode {
    fn from(entry: ListingEntry) -> Self {
        let children = match entry.sub {
            Some(sub) => Some(sub.into_iter().map(FileNode::from).collect()),
            None if entry.kind == "dir" => Some(Vec::new()),
            None => None,
        };
        Self {
            name: entry.name,
            size: entry.size,
            path: entry.path,
            children,
        }
    }
}

/// Directories before files, then case-insensitive by name.
pub fn compare_nodes(x: &FileNode, y: &FileNode) -> Ordering {
    match (x.size.is_empty(), y.size.is_empty()) {
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        _ => x.name.to_uppercase().cmp(&y.name.to_uppercase()),
    }
}

pub fn sort_nodes(nodes: &mut [FileNode]) {
    nodes.sort_by(compare_nodes);
    for node in nodes.iter_mut() {
        if let Some(children) = node.children.as_mut() {
            sort_nodes(children);
        }
    }
}

pub fn find_node<'a>(nodes: &'a [FileNode], path: &str) -> Option<&'a FileNode> {
    for node in nodes {
        if node.path == path {
            return Some(node);
        }
        if let Some(children) = &node.children
            && let Some(found) = find_node(children, path)
        {
            return Some(found);
        }
    }
    None
}

pub fn find_node_mut<'a>(nodes: &'a mut [FileNode], path: &str) -> Option<&'a mut FileNode> {
    for node in nodes.iter_mut() {
        if node.path == path {
            return Some(node);
        }
        if let Some(children) = node.children.as_mut()
            && let Some(found) = find_node_mut(children, path)
        {
            return Some(found);
        }
    }
    None
}

/// Remove the node at `path`, searching recursively. Returns whether one was removed.
pub fn remove_by_path(nodes: &mut Vec<FileNode>, path: &str) -> bool {
    if let Some(index) = nodes.iter().position(|n| n.path == path) {
        nodes.remove(index);
        return true;
    }
    nodes
        .iter_mut()
        .filter_map(|n| n.children.as_mut())
        .any(|children| remove_by_path(children, path))
}

/// Remove a node by name at this level only.
pub fn remove_by_name(nodes: &mut Vec<FileNode>, name: &str) -> bool {
    match nodes.iter().position(|n| n.name == name) {
        Some(index) => {
            nodes.remove(index);
            true
        }
        None => false,
    }
}

/// The shared device tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileTree {
    nodes: Vec<FileNode>,
}

impl FileTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nodes(&self) -> &[FileNode] {
        &self.nodes
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
    }

    pub fn replace(&mut self, nodes: Vec<FileNode>) {
        self.nodes = nodes;
        self.sort();
    }

    pub fn sort(&mut self) {
        sort_nodes(&mut self.nodes);
    }

    pub fn find(&self, path: &str) -> Option<&FileNode> {
        find_node(&self.nodes, path)
    }

    pub fn remove(&mut self, path: &str) -> bool {
        remove_by_path(&mut self.nodes, path)
    }

    fn level_mut(&mut self, parent: &str) -> Result<&mut Vec<FileNode>> {
        if parent == DEVICE_ROOT {
            return Ok(&mut self.nodes);
        }
        find_node_mut(&mut self.nodes, parent)
            .and_then(|node| node.children.as_mut())
            .ok_or_else(|| AppError::ProtocolError(format!("No directory {parent} in tree")))
    }

    /// Append `node` under `parent` (the root when `parent` is `/usr`) and re-sort.
    pub fn insert(&mut self, parent: &str, node: FileNode) -> Result<()> {
        self.level_mut(parent)?.push(node);
        self.sort();
        Ok(())
    }

    /// Replace any same-named node under `parent` with a fresh file leaf.
    pub fn upsert_file(&mut self, parent: &str, name: &str, size: &str) -> Result<()> {
        let path = format!("{}/{}", parent.trim_end_matches('/'), name);
        let level = self.level_mut(parent)?;
        remove_by_name(level, name);
        level.push(FileNode::file(name, size, path));
        self.sort();
        Ok(())
    }

    /// Indented text rendering, one node per line.
    pub fn render_lines(&self) -> Vec<String> {
        fn walk(nodes: &[FileNode], depth: usize, out: &mut Vec<String>) {
            for node in nodes {
                let indent = "  ".repeat(depth);
                if node.is_dir() {
                    out.push(format!("{indent}{}/", node.name));
                    if let Some(children) = &node.children {
                        walk(children, depth + 1, out);
                    }
                } else {
                    out.push(format!("{indent}{}  {}", node.name, node.size));
                }
            }
        }

        let mut out = Vec::new();
        walk(&self.nodes, 0, &mut out);
        out
    }
}

/// Split `/usr/a/b` into (`/usr/a`, `b`).
pub fn split_parent(path: &str) -> Option<(&str, &str)> {
    let trimmed = path.trim_end_matches('/');
    let (parent, name) = trimmed.rsplit_once('/')?;
    if name.is_empty() {
        return None;
    }
    let parent = if parent.is_empty() { "/" } else { parent };
    Some((parent, name))
}
