//! Sparse accumulation of pending snapshots
//!
//! A node either holds a complete value or fans out to children. Forgetting
//! part of a complete value first expands it into one child per key.

use crate::path::Path;
use crate::value::{Value, PRIORITY_KEY};
use std::collections::BTreeMap;

/// Sparse tree of remembered values
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SparseSnapshotTree {
    value: Option<Value>,
    children: BTreeMap<String, SparseSnapshotTree>,
}

impl SparseSnapshotTree {
    /// An empty tree.
    pub fn new() -> Self {
        SparseSnapshotTree::default()
    }

    /// True when nothing is remembered.
    pub fn is_empty(&self) -> bool {
        self.value.is_none() && self.children.is_empty()
    }

    /// Remembered value covering `path`, if any.
    pub fn find(&self, path: &Path) -> Option<Value> {
        if let Some(value) = &self.value {
            return Some(value.get_child(path).clone());
        }
        let front = path.front_directory()?;
        self.children
            .get(front)
            .and_then(|child| child.find(&path.pop_front_directory()))
    }

    /// Remember `value` at `path`, splicing it into a covering value if one
    /// exists.
    pub fn remember(&mut self, path: &Path, value: Value) {
        let Some(front) = path.front_directory() else {
            self.value = Some(value);
            self.children.clear();
            return;
        };
        if let Some(existing) = &mut self.value {
            existing.update_child(path, value);
            return;
        }
        self.children
            .entry(front.to_string())
            .or_default()
            .remember(&path.pop_front_directory(), value);
    }

    /// Forget everything at and below `path`. Returns true when this node is
    /// left empty, so the caller may drop it.
    pub fn forget(&mut self, path: &Path) -> bool {
        let Some(front) = path.front_directory() else {
            self.value = None;
            self.children.clear();
            return true;
        };

        if let Some(value) = self.value.take() {
            match value {
                Value::Object(map) => {
                    for (key, child) in map {
                        if key != PRIORITY_KEY {
                            self.remember(&Path::new(&key), child);
                        }
                    }
                    return self.forget(path);
                }
                leaf => {
                    // A leaf has no addressable children.
                    self.value = Some(leaf);
                    return false;
                }
            }
        }

        if self.children.is_empty() {
            return true;
        }
        let rest = path.pop_front_directory();
        let drop_child = self
            .children
            .get_mut(front)
            .map(|child| child.forget(&rest))
            .unwrap_or(false);
        if drop_child {
            self.children.remove(front);
        }
        self.children.is_empty()
    }

    /// Pre-order visit of every remembered value with its full path.
    pub fn for_each_tree<F>(&self, prefix: &Path, visitor: &mut F)
    where
        F: FnMut(&Path, &Value),
    {
        if let Some(value) = &self.value {
            visitor(prefix, value);
            return;
        }
        for (key, child) in &self.children {
            child.for_each_tree(&prefix.child(key), visitor);
        }
    }

    /// Visit immediate children.
    pub fn for_each_child<F>(&self, mut visitor: F)
    where
        F: FnMut(&str, &SparseSnapshotTree),
    {
        for (key, child) in &self.children {
            visitor(key, child);
        }
    }
}
