//! Hierarchy materialization for `GetTree`.
//!
//! An arena of nodes linked by non-owning parent indices, which keeps
//! `UpdateFile`/`RemoveFile` O(depth) instead of requiring a full rebuild.

use crate::model::{basename, is_path_under, FileEntry};
use std::collections::HashMap;

#[derive(Debug, Clone)]
struct Node {
    name: String,
    path: String,
    is_dir: bool,
    size: i64,
    mtime: i64,
    parent: Option<usize>,
    children: Vec<usize>,
}

/// A materialized directory tree rooted at one indexed path. Directory
/// sizes are the sum of their descendants', kept up to date incrementally
/// as files are added, updated or removed.
pub struct Tree {
    root: String,
    nodes: Vec<Node>,
    by_path: HashMap<String, usize>,
}

impl Tree {
    /// Builds a tree from a flat list of entries, all of which must lie
    /// under `root` (enforced by the caller, typically a `Store` scan).
    pub fn build(root: &str, entries: Vec<FileEntry>) -> Self {
        let mut tree = Self {
            root: root.to_string(),
            nodes: Vec::new(),
            by_path: HashMap::new(),
        };
        tree.ensure_node(root, true, 0, 0);
        for entry in entries {
            if entry.path == root {
                continue;
            }
            tree.add_file(&entry.path, entry.is_dir, entry.size, entry.mtime);
        }
        tree
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Inserts or overwrites a leaf, materializing any missing ancestor
    /// directories along the way and adding the new size to every
    /// ancestor's aggregate.
    pub fn add_file(&mut self, path: &str, is_dir: bool, size: i64, mtime: i64) {
        if !is_path_under(path, &self.root) {
            return;
        }
        let parent_path = parent_of(path);
        let parent_idx = self.ensure_ancestors(&parent_path);

        if let Some(&idx) = self.by_path.get(path) {
            let old_size = self.nodes[idx].size;
            self.nodes[idx].size = size;
            self.nodes[idx].mtime = mtime;
            self.nodes[idx].is_dir = is_dir;
            self.propagate_delta(parent_idx, size - old_size);
            return;
        }

        let idx = self.nodes.len();
        self.nodes.push(Node {
            name: basename(path).to_string(),
            path: path.to_string(),
            is_dir,
            size,
            mtime,
            parent: Some(parent_idx),
            children: Vec::new(),
        });
        self.by_path.insert(path.to_string(), idx);
        self.nodes[parent_idx].children.push(idx);
        self.propagate_delta(parent_idx, size);
    }

    /// Updates an existing leaf's size/mtime in place. Equivalent to
    /// `add_file` on an already-present path; kept as a separate name to
    /// match the `UpdateFile` operation.
    pub fn update_file(&mut self, path: &str, size: i64, mtime: i64) {
        if let Some(&idx) = self.by_path.get(path) {
            self.add_file(path, self.nodes[idx].is_dir, size, mtime);
        }
    }

    /// Removes a leaf and prunes any ancestor directory left with no
    /// children as a result.
    pub fn remove_file(&mut self, path: &str) {
        let Some(idx) = self.by_path.remove(path) else {
            return;
        };
        let size = self.nodes[idx].size;
        let parent = self.nodes[idx].parent;
        if let Some(parent_idx) = parent {
            self.nodes[parent_idx].children.retain(|&c| c != idx);
            self.propagate_delta(parent_idx, -size);
            self.prune_if_empty(parent_idx);
        }
    }

    fn prune_if_empty(&mut self, idx: usize) {
        if idx == self.root_index() {
            return;
        }
        if !self.nodes[idx].children.is_empty() {
            return;
        }
        let path = self.nodes[idx].path.clone();
        let parent = self.nodes[idx].parent;
        self.by_path.remove(&path);
        if let Some(parent_idx) = parent {
            self.nodes[parent_idx].children.retain(|&c| c != idx);
            self.prune_if_empty(parent_idx);
        }
    }

    fn propagate_delta(&mut self, mut idx: usize, delta: i64) {
        if delta == 0 {
            return;
        }
        loop {
            self.nodes[idx].size += delta;
            match self.nodes[idx].parent {
                Some(parent) => idx = parent,
                None => break,
            }
        }
    }

    fn ensure_ancestors(&mut self, path: &str) -> usize {
        if let Some(&idx) = self.by_path.get(path) {
            return idx;
        }
        if path == self.root || !is_path_under(path, &self.root) {
            return self.root_index();
        }
        let grandparent = parent_of(path);
        let parent_idx = self.ensure_ancestors(&grandparent);
        let idx = self.ensure_node(path, true, 0, 0);
        self.nodes[idx].parent = Some(parent_idx);
        if !self.nodes[parent_idx].children.contains(&idx) {
            self.nodes[parent_idx].children.push(idx);
        }
        idx
    }

    fn ensure_node(&mut self, path: &str, is_dir: bool, size: i64, mtime: i64) -> usize {
        if let Some(&idx) = self.by_path.get(path) {
            return idx;
        }
        let idx = self.nodes.len();
        self.nodes.push(Node {
            name: basename(path).to_string(),
            path: path.to_string(),
            is_dir,
            size,
            mtime,
            parent: None,
            children: Vec::new(),
        });
        self.by_path.insert(path.to_string(), idx);
        idx
    }

    fn root_index(&self) -> usize {
        self.by_path[&self.root]
    }

    /// Renders a node and its subtree, children sorted by size descending,
    /// directories before files on a size tie, then alphabetically.
    pub fn render(&self, path: &str, max_depth: Option<usize>) -> Option<TreeNode> {
        let idx = *self.by_path.get(path)?;
        Some(self.render_node(idx, max_depth))
    }

    fn render_node(&self, idx: usize, depth_remaining: Option<usize>) -> TreeNode {
        let node = &self.nodes[idx];
        let mut children = Vec::new();
        if node.is_dir && depth_remaining != Some(0) {
            let mut child_idxs = node.children.clone();
            child_idxs.sort_by(|&a, &b| {
                let na = &self.nodes[a];
                let nb = &self.nodes[b];
                nb.size
                    .cmp(&na.size)
                    .then(nb.is_dir.cmp(&na.is_dir))
                    .then(na.name.cmp(&nb.name))
            });
            let next_depth = depth_remaining.map(|d| d - 1);
            children = child_idxs
                .into_iter()
                .map(|c| self.render_node(c, next_depth))
                .collect();
        }
        TreeNode {
            name: node.name.clone(),
            path: node.path.clone(),
            is_dir: node.is_dir,
            size: node.size,
            mtime: node.mtime,
            children,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TreeNode {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    pub size: i64,
    pub mtime: i64,
    pub children: Vec<TreeNode>,
}

fn parent_of(path: &str) -> String {
    match path.rfind(crate::model::SEPARATOR) {
        Some(0) => crate::model::SEPARATOR.to_string(),
        Some(i) => path[..i].to_string(),
        None => path.to_string(),
    }
}
