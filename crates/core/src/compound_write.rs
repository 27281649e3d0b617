//! Overlay of overlapping writes
//!
//! A [`CompoundWrite`] is a [`Tree<Value>`] in which every valued node is a
//! complete write at its location. A write below an existing write is merged
//! into the ancestor's value; a write at or above existing writes replaces
//! them. No valued node ever has a valued descendant.

use crate::error::check_invariant;
use crate::path::Path;
use crate::tree::{NodeId, Tree};
use crate::value::{Value, PRIORITY_KEY, VALUE_KEY};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Set of complete writes keyed by path
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(into = "Vec<(Path, Value)>", from = "Vec<(Path, Value)>")]
pub struct CompoundWrite {
    write_tree: Tree<Value>,
}

impl CompoundWrite {
    /// An overlay holding no writes.
    pub fn new() -> Self {
        CompoundWrite::default()
    }

    /// Wrap an existing write tree.
    pub fn from_tree(write_tree: Tree<Value>) -> Self {
        CompoundWrite { write_tree }
    }

    /// One write per top-level key of `merge`. A non-object becomes a single
    /// write at the root.
    pub fn from_value_merge(merge: &Value) -> Self {
        let mut write = CompoundWrite::new();
        match merge {
            Value::Object(children) => {
                for (key, value) in children {
                    write.add_write_inline(&Path::new(key), value.clone());
                }
            }
            other => write.add_write_inline(&Path::root(), other.clone()),
        }
        write
    }

    /// One write per child key.
    pub fn from_child_merge(children: &BTreeMap<String, Value>) -> Self {
        let mut write = CompoundWrite::new();
        for (key, value) in children {
            write.add_write_inline(&Path::new(key), value.clone());
        }
        write
    }

    /// One write per path.
    pub fn from_path_merge(writes: &BTreeMap<Path, Value>) -> Self {
        let mut write = CompoundWrite::new();
        for (path, value) in writes {
            write.add_write_inline(path, value.clone());
        }
        write
    }

    /// Underlying write tree.
    pub fn write_tree(&self) -> &Tree<Value> {
        &self.write_tree
    }

    /// True when no write is recorded.
    pub fn is_empty(&self) -> bool {
        self.write_tree.is_empty()
    }

    /// Copy of this overlay with one more write.
    pub fn add_write(&self, path: &Path, value: impl Into<Option<Value>>) -> CompoundWrite {
        let mut result = self.clone();
        result.add_write_inline(path, value);
        result
    }

    /// Record a write at `path`. `None` clears the location.
    pub fn add_write_inline(&mut self, path: &Path, value: impl Into<Option<Value>>) {
        let value = value.into();
        if path.is_empty() {
            self.write_tree = Tree::with_value(value);
            return;
        }
        let Some(root_most) = self.write_tree.find_root_most_path_with_value(path) else {
            self.write_tree.set_subtree(path, &Tree::with_value(value));
            return;
        };
        let relative = Path::relative(&root_most, path).unwrap_or_default();
        let Some(existing) = self.write_tree.get_value_at_mut(&root_most) else {
            return;
        };
        if !relative.is_empty()
            && relative.base_name() == PRIORITY_KEY
            && existing.get_child(&relative.parent()).is_empty()
        {
            // A priority never lands on an empty value.
            return;
        }
        existing.update_child(&relative, value.unwrap_or_default());
    }

    /// Copy of this overlay with every write of `updates` added below `path`.
    pub fn add_writes(&self, path: &Path, updates: &CompoundWrite) -> CompoundWrite {
        let mut result = self.clone();
        result.add_writes_inline(path, updates);
        result
    }

    /// Add every write of `updates` below `path`.
    pub fn add_writes_inline(&mut self, path: &Path, updates: &CompoundWrite) {
        let writes = updates.write_tree.fold(Vec::new(), |relative, value, mut acc| {
            acc.push((path.child_path(relative), value.clone()));
            acc
        });
        for (target, value) in writes {
            self.add_write_inline(&target, value);
        }
    }

    /// Copy of this overlay without the writes at and below `path`.
    pub fn remove_write(&self, path: &Path) -> CompoundWrite {
        let mut result = self.clone();
        result.remove_write_inline(path);
        result
    }

    /// Drop the writes at and below `path`. Writes at ancestors stay.
    pub fn remove_write_inline(&mut self, path: &Path) {
        if path.is_empty() {
            self.write_tree = Tree::new();
        } else {
            self.write_tree.set_subtree(path, &Tree::new());
        }
    }

    /// True if some ancestor-or-self write fully determines `path`.
    pub fn has_complete_write(&self, path: &Path) -> bool {
        self.get_complete_value(path).is_some()
    }

    /// Write recorded at the root, if any.
    pub fn root_write(&self) -> Option<&Value> {
        self.write_tree.value()
    }

    /// Value at `path` as determined by an ancestor-or-self write, or `None`
    /// when only partial writes cover it.
    pub fn get_complete_value(&self, path: &Path) -> Option<Value> {
        let root_most = self.write_tree.find_root_most_path_with_value(path)?;
        let relative = Path::relative(&root_most, path)?;
        let value = self.write_tree.get_value_at(&root_most)?;
        Some(value.get_child(&relative).clone())
    }

    /// Immediate children written completely, with their values.
    pub fn get_complete_children(&self) -> Vec<(String, Value)> {
        if let Some(root) = self.root_write() {
            let unwrapped = match root.get_key(VALUE_KEY) {
                Value::Null => root,
                leaf => leaf,
            };
            return match unwrapped {
                Value::Object(children) => children
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                _ => Vec::new(),
            };
        }
        self.write_tree
            .children(Tree::<Value>::ROOT)
            .filter_map(|(key, child)| {
                self.write_tree
                    .node_value(child)
                    .map(|value| (key.to_string(), value.clone()))
            })
            .collect()
    }

    /// The overlay as seen from `path`. A shadowing ancestor write yields a
    /// single root write.
    pub fn child_compound_write(&self, path: &Path) -> CompoundWrite {
        if path.is_empty() {
            return self.clone();
        }
        if let Some(shadowing) = self.get_complete_value(path) {
            return CompoundWrite::from_tree(Tree::with_value(shadowing));
        }
        match self.write_tree.subtree(path) {
            Some(subtree) => CompoundWrite::from_tree(subtree),
            None => CompoundWrite::new(),
        }
    }

    /// Overlay projected onto each immediate child.
    pub fn child_compound_writes(&self) -> BTreeMap<String, CompoundWrite> {
        if let Some(Value::Object(children)) = self.root_write() {
            return children
                .iter()
                .map(|(key, value)| {
                    (
                        key.clone(),
                        CompoundWrite::from_tree(Tree::with_value(value.clone())),
                    )
                })
                .collect();
        }
        let keys: Vec<String> = self
            .write_tree
            .children(Tree::<Value>::ROOT)
            .map(|(key, _)| key.to_string())
            .collect();
        keys.into_iter()
            .map(|key| {
                let child = self.child_compound_write(&Path::new(&key));
                (key, child)
            })
            .filter(|(_, child)| !child.is_empty())
            .collect()
    }

    /// Every write as `(path, value)` in post-order.
    pub fn writes(&self) -> Vec<(Path, Value)> {
        self.write_tree.fold(Vec::new(), |path, value, mut acc| {
            acc.push((path.clone(), value.clone()));
            acc
        })
    }

    /// Apply every write to `base`. Priority writes land after their sibling
    /// content, and only on non-empty values.
    pub fn apply(&self, base: &Value) -> Value {
        self.apply_subtree(&Path::root(), Tree::<Value>::ROOT, base.clone())
    }

    fn apply_subtree(&self, relative: &Path, id: NodeId, mut value: Value) -> Value {
        if let Some(write) = self.write_tree.node_value(id) {
            value.update_child(relative, write.clone());
            return value;
        }
        let mut priority_write = None;
        for (key, child) in self.write_tree.children(id) {
            if key == PRIORITY_KEY {
                check_invariant(self.write_tree.children(child).next().is_none(), || {
                    "priority writes must always be leaves".to_string()
                });
                priority_write = self.write_tree.node_value(child).cloned();
            } else {
                value = self.apply_subtree(&relative.child(key), child, value);
            }
        }
        if let Some(priority) = priority_write {
            if !value.get_child(relative).is_empty() {
                value.update_child(&relative.child(PRIORITY_KEY), priority);
            }
        }
        value
    }
}

impl From<CompoundWrite> for Vec<(Path, Value)> {
    fn from(write: CompoundWrite) -> Self {
        write.writes()
    }
}

impl From<Vec<(Path, Value)>> for CompoundWrite {
    fn from(writes: Vec<(Path, Value)>) -> Self {
        let mut result = CompoundWrite::new();
        for (path, value) in writes {
            result.add_write_inline(&path, value);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn v(json: serde_json::Value) -> Value {
        Value::from(json)
    }

    fn p(s: &str) -> Path {
        Path::new(s)
    }

    #[test]
    fn test_empty_write_is_empty() {
        let write = CompoundWrite::new();
        assert!(write.is_empty());
        assert_eq!(write.root_write(), None);
        assert_eq!(write.get_complete_value(&p("a")), None);
    }

    #[test]
    fn test_root_write_replaces_everything() {
        let write = CompoundWrite::new()
            .add_write(&p("a"), Value::Int(1))
            .add_write(&Path::root(), v(json!({"b": 2})));
        assert_eq!(write.root_write(), Some(&v(json!({"b": 2}))));
        assert_eq!(write.get_complete_value(&p("a")), Some(Value::Null));
    }

    #[test]
    fn test_deeper_write_merges_into_ancestor() {
        let write = CompoundWrite::new()
            .add_write(&p("a"), v(json!({"x": 1})))
            .add_write(&p("a/b"), v(json!({"y": 2})));
        assert_eq!(
            write.get_complete_value(&p("a/b")),
            Some(v(json!({"y": 2})))
        );
        assert_eq!(
            write.get_complete_value(&p("a")),
            Some(v(json!({"x": 1, "b": {"y": 2}})))
        );
        assert!(write.write_tree().get_child(&p("a/b")).is_none());
    }

    #[test]
    fn test_shallower_write_supersedes_descendants() {
        let write = CompoundWrite::new()
            .add_write(&p("a/b"), Value::Int(1))
            .add_write(&p("a/c"), Value::Int(2))
            .add_write(&p("a"), Value::Int(3));
        assert_eq!(write.get_complete_value(&p("a")), Some(Value::Int(3)));
        assert_eq!(write.writes(), vec![(p("a"), Value::Int(3))]);
    }

    #[test]
    fn test_partial_merge_is_not_complete() {
        let write = CompoundWrite::new().add_write(&p("a/b"), Value::Int(1));
        assert!(!write.has_complete_write(&p("a")));
        assert!(write.has_complete_write(&p("a/b")));
        assert!(write.has_complete_write(&p("a/b/c")));
    }

    #[test]
    fn test_priority_on_empty_value_is_ignored() {
        let write = CompoundWrite::new()
            .add_write(&p("a"), Value::Null)
            .add_write(&p("a/.priority"), Value::Int(5));
        assert_eq!(write.get_complete_value(&p("a")), Some(Value::Null));

        let write = CompoundWrite::new()
            .add_write(&p("a"), Value::Int(1))
            .add_write(&p("a/.priority"), Value::Int(5));
        assert_eq!(
            write.get_complete_value(&p("a")),
            Some(v(json!({".value": 1, ".priority": 5})))
        );
    }

    #[test]
    fn test_remove_write_keeps_ancestors() {
        let write = CompoundWrite::new()
            .add_write(&p("a/b"), Value::Int(1))
            .add_write(&p("a/c"), Value::Int(2))
            .remove_write(&p("a/b"));
        assert!(!write.has_complete_write(&p("a/b")));
        assert!(write.has_complete_write(&p("a/c")));

        let merged = CompoundWrite::new()
            .add_write(&p("a"), v(json!({"b": 1})))
            .remove_write(&p("a/b"));
        assert!(merged.has_complete_write(&p("a")));
        assert!(CompoundWrite::new()
            .add_write(&p("a"), Value::Int(1))
            .remove_write(&Path::root())
            .is_empty());
    }

    #[test]
    fn test_get_complete_children() {
        let write = CompoundWrite::new()
            .add_write(&p("a"), Value::Int(1))
            .add_write(&p("b/c"), Value::Int(2));
        assert_eq!(write.get_complete_children(), vec![("a".to_string(), Value::Int(1))]);

        let rooted = CompoundWrite::new().add_write(&Path::root(), v(json!({"x": 1, "y": 2})));
        assert_eq!(rooted.get_complete_children().len(), 2);
    }

    #[test]
    fn test_child_compound_write_respects_shadowing() {
        let write = CompoundWrite::new().add_write(&p("a"), v(json!({"b": {"c": 1}})));
        let child = write.child_compound_write(&p("a/b"));
        assert_eq!(child.root_write(), Some(&v(json!({"c": 1}))));

        let deep = CompoundWrite::new().add_write(&p("a/b/c"), Value::Int(1));
        let child = deep.child_compound_write(&p("a"));
        assert_eq!(child.get_complete_value(&p("b/c")), Some(Value::Int(1)));
        assert!(deep.child_compound_write(&p("zzz")).is_empty());
    }

    #[test]
    fn test_child_compound_writes() {
        let write = CompoundWrite::new()
            .add_write(&p("a/x"), Value::Int(1))
            .add_write(&p("b"), Value::Int(2));
        let children = write.child_compound_writes();
        assert_eq!(children.len(), 2);
        assert_eq!(children["a"].get_complete_value(&p("x")), Some(Value::Int(1)));
        assert_eq!(children["b"].root_write(), Some(&Value::Int(2)));
    }

    #[test]
    fn test_apply_writes_and_deferred_priority() {
        let base = v(json!({"a": 1, "b": {"c": 2}}));
        let write = CompoundWrite::new()
            .add_write(&p("b/c"), Value::Int(3))
            .add_write(&p("d/.priority"), Value::Int(7))
            .add_write(&p("d/e"), Value::Int(4));
        let result = write.apply(&base);
        assert_eq!(
            result,
            v(json!({"a": 1, "b": {"c": 3}, "d": {"e": 4, ".priority": 7}}))
        );
    }

    #[test]
    fn test_apply_skips_priority_for_empty_result() {
        let write = CompoundWrite::new().add_write(&p("d/.priority"), Value::Int(7));
        assert_eq!(write.apply(&Value::Null), Value::Null);
    }

    #[test]
    fn test_add_writes_folds_other_overlay() {
        let other = CompoundWrite::new()
            .add_write(&p("x"), Value::Int(1))
            .add_write(&p("y/z"), Value::Int(2));
        let write = CompoundWrite::new().add_writes(&p("root"), &other);
        assert_eq!(write.get_complete_value(&p("root/x")), Some(Value::Int(1)));
        assert_eq!(write.get_complete_value(&p("root/y/z")), Some(Value::Int(2)));
    }

    #[test]
    fn test_from_merges() {
        let merge = v(json!({"a": 1, "b/c": 2}));
        let write = CompoundWrite::from_value_merge(&merge);
        assert_eq!(write.get_complete_value(&p("a")), Some(Value::Int(1)));
        assert_eq!(write.get_complete_value(&p("b/c")), Some(Value::Int(2)));

        let mut paths = BTreeMap::new();
        paths.insert(p("q/r"), Value::Int(3));
        let write = CompoundWrite::from_path_merge(&paths);
        assert_eq!(write.get_complete_value(&p("q/r")), Some(Value::Int(3)));

        let leaf = CompoundWrite::from_value_merge(&Value::Int(9));
        assert_eq!(leaf.root_write(), Some(&Value::Int(9)));
    }

    #[test]
    fn test_msgpack_round_trip() {
        let write = CompoundWrite::new()
            .add_write(&p("a/b"), v(json!({"c": [1, 2]})))
            .add_write(&p("d"), Value::from("x"));
        let bytes = rmp_serde::to_vec_named(&write).unwrap();
        let back: CompoundWrite = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(back, write);
    }

    proptest! {
        #[test]
        fn prop_apply_without_writes_is_identity(n in any::<i64>(), s in "[a-z]{0,8}") {
            let base = v(json!({"n": n, "s": s, "nested": {"k": [n]}}));
            prop_assert_eq!(CompoundWrite::new().apply(&base), base);
        }

        #[test]
        fn prop_adding_same_write_twice_is_idempotent(
            segments in proptest::collection::vec("[a-c]", 1..4),
            n in any::<i64>(),
        ) {
            let path = Path::from_segments(&segments);
            let base = CompoundWrite::new().add_write(&p("a"), v(json!({"b": 1})));
            let once = base.add_write(&path, Value::Int(n));
            let twice = once.add_write(&path, Value::Int(n));
            prop_assert_eq!(once, twice);
        }
    }
}
