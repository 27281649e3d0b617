//! Path-indexed N-ary tree
//!
//! [`Tree<V>`] stores an optional value per node and a sorted map of child
//! segments. Nodes live in an arena and are addressed by [`NodeId`]; each
//! node records its parent's id, so ancestor walks and [`Tree::get_path`] need
//! no back-pointers. Freed slots are recycled.
//!
//! Every lookup returns `None` for a missing path. Passing a [`NodeId`] that
//! was never issued by this tree, or whose node has been removed, is an
//! invariant violation.

use crate::error::invariant_violation;
use crate::path::Path;
use std::collections::BTreeMap;

/// Stable index of a node inside one [`Tree`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(usize);

#[derive(Debug, Clone)]
struct Node<V> {
    key: String,
    value: Option<V>,
    children: BTreeMap<String, NodeId>,
    parent: Option<NodeId>,
}

impl<V> Node<V> {
    fn new(key: String, value: Option<V>, parent: Option<NodeId>) -> Self {
        Node {
            key,
            value,
            children: BTreeMap::new(),
            parent,
        }
    }
}

/// Arena-backed tree keyed by path segments
#[derive(Debug, Clone)]
pub struct Tree<V> {
    nodes: Vec<Option<Node<V>>>,
    free: Vec<usize>,
}

impl<V> Default for Tree<V> {
    fn default() -> Self {
        Tree::new()
    }
}

impl<V> Tree<V> {
    /// Id of the root node; valid for every tree.
    pub const ROOT: NodeId = NodeId(0);

    /// A tree with a single, valueless root.
    pub fn new() -> Self {
        Tree {
            nodes: vec![Some(Node::new(String::new(), None, None))],
            free: Vec::new(),
        }
    }

    /// A tree whose root holds `value`.
    pub fn with_value(value: impl Into<Option<V>>) -> Self {
        let mut tree = Tree::new();
        tree.set_value(value);
        tree
    }

    fn node(&self, id: NodeId) -> &Node<V> {
        match self.nodes.get(id.0).and_then(Option::as_ref) {
            Some(node) => node,
            None => invariant_violation(format!("stale tree node id {}", id.0)),
        }
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node<V> {
        match self.nodes.get_mut(id.0).and_then(Option::as_mut) {
            Some(node) => node,
            None => invariant_violation(format!("stale tree node id {}", id.0)),
        }
    }

    fn alloc(&mut self, node: Node<V>) -> NodeId {
        match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(node);
                NodeId(slot)
            }
            None => {
                self.nodes.push(Some(node));
                NodeId(self.nodes.len() - 1)
            }
        }
    }

    // ========================================================================
    // Node accessors
    // ========================================================================

    /// Value at the root.
    pub fn value(&self) -> Option<&V> {
        self.node_value(Self::ROOT)
    }

    /// Mutable value at the root.
    pub fn value_mut(&mut self) -> Option<&mut V> {
        self.node_value_mut(Self::ROOT)
    }

    /// Replace the value at the root.
    pub fn set_value(&mut self, value: impl Into<Option<V>>) {
        self.node_mut(Self::ROOT).value = value.into();
    }

    /// Value held by `id`.
    pub fn node_value(&self, id: NodeId) -> Option<&V> {
        self.node(id).value.as_ref()
    }

    /// Mutable value held by `id`.
    pub fn node_value_mut(&mut self, id: NodeId) -> Option<&mut V> {
        self.node_mut(id).value.as_mut()
    }

    /// Replace the value held by `id`.
    pub fn set_node_value(&mut self, id: NodeId, value: impl Into<Option<V>>) {
        self.node_mut(id).value = value.into();
    }

    /// Segment under which `id` hangs from its parent; empty for the root.
    pub fn key(&self, id: NodeId) -> &str {
        &self.node(id).key
    }

    /// Parent of `id`; `None` for the root.
    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).parent
    }

    /// Immediate children of `id` in key order.
    pub fn children(&self, id: NodeId) -> impl Iterator<Item = (&str, NodeId)> + '_ {
        self.node(id)
            .children
            .iter()
            .map(|(key, child)| (key.as_str(), *child))
    }

    /// Immediate child of `id` named `key`.
    pub fn find_child(&self, id: NodeId, key: &str) -> Option<NodeId> {
        if key.is_empty() {
            return Some(id);
        }
        self.node(id).children.get(key).copied()
    }

    /// Full path from the root to `id`.
    pub fn get_path(&self, id: NodeId) -> Path {
        let mut segments = Vec::new();
        let mut current = Some(id);
        while let Some(node_id) = current {
            let node = self.node(node_id);
            if node.parent.is_some() {
                segments.push(node.key.as_str());
            }
            current = node.parent;
        }
        Path::from_segments(segments.into_iter().rev())
    }

    // ========================================================================
    // Path-addressed access
    // ========================================================================

    /// Node at `path`, if every segment exists.
    pub fn get_child(&self, path: &Path) -> Option<NodeId> {
        self.get_child_from(Self::ROOT, path)
    }

    /// Node at `path` below `start`.
    pub fn get_child_from(&self, start: NodeId, path: &Path) -> Option<NodeId> {
        let mut current = start;
        for segment in path.segments() {
            current = self.find_child(current, segment)?;
        }
        Some(current)
    }

    /// Node at `path`, creating valueless intermediates as needed.
    pub fn get_or_make_subtree(&mut self, path: &Path) -> NodeId {
        let mut current = Self::ROOT;
        for segment in path.segments() {
            current = match self.find_child(current, segment) {
                Some(child) => child,
                None => {
                    let child = self.alloc(Node::new(segment.to_string(), None, Some(current)));
                    self.node_mut(current)
                        .children
                        .insert(segment.to_string(), child);
                    child
                }
            };
        }
        current
    }

    /// Set or clear the value at `path`. An empty path targets the root.
    pub fn set_value_at(&mut self, path: &Path, value: impl Into<Option<V>>) -> NodeId {
        let id = self.get_or_make_subtree(path);
        self.node_mut(id).value = value.into();
        id
    }

    /// Value at `path`.
    pub fn get_value_at(&self, path: &Path) -> Option<&V> {
        self.get_child(path).and_then(|id| self.node_value(id))
    }

    /// Mutable value at `path`.
    pub fn get_value_at_mut(&mut self, path: &Path) -> Option<&mut V> {
        let id = self.get_child(path)?;
        self.node_value_mut(id)
    }

    /// Drop the node at `path` with everything below it. At the root this
    /// empties the tree.
    pub fn remove_subtree_at(&mut self, path: &Path) {
        if let Some(id) = self.get_child(path) {
            self.remove_subtree(id);
        }
    }

    fn remove_subtree(&mut self, id: NodeId) {
        let mut doomed = Vec::new();
        self.call_on_each_descendant(id, false, false, &mut |d| doomed.push(d));
        for d in doomed {
            self.nodes[d.0] = None;
            self.free.push(d.0);
        }
        let node = self.node_mut(id);
        node.children.clear();
        node.value = None;
        if let Some(parent) = node.parent {
            let key = std::mem::take(&mut node.key);
            self.node_mut(parent).children.remove(&key);
            self.nodes[id.0] = None;
            self.free.push(id.0);
        }
    }

    // ========================================================================
    // Route queries
    // ========================================================================

    fn route(&self, path: &Path) -> Vec<(usize, NodeId)> {
        let mut route = vec![(0, Self::ROOT)];
        let mut current = Self::ROOT;
        for (depth, segment) in path.segments().enumerate() {
            match self.find_child(current, segment) {
                Some(child) => {
                    current = child;
                    route.push((depth + 1, child));
                }
                None => break,
            }
        }
        route
    }

    /// Shallowest value on the route from the root to `path`.
    pub fn root_most_value(&self, path: &Path) -> Option<&V> {
        self.root_most_value_matching(path, |_| true)
    }

    /// Shallowest value on the route to `path` satisfying `predicate`.
    pub fn root_most_value_matching<P>(&self, path: &Path, predicate: P) -> Option<&V>
    where
        P: Fn(&V) -> bool,
    {
        self.route(path)
            .into_iter()
            .find_map(|(_, id)| self.node_value(id).filter(|v| predicate(*v)))
    }

    /// Deepest value on the route from the root to `path`.
    pub fn leaf_most_value(&self, path: &Path) -> Option<&V> {
        self.leaf_most_value_matching(path, |_| true)
    }

    /// Deepest value on the route to `path` satisfying `predicate`.
    pub fn leaf_most_value_matching<P>(&self, path: &Path, predicate: P) -> Option<&V>
    where
        P: Fn(&V) -> bool,
    {
        let mut best = None;
        for (_, id) in self.route(path) {
            if let Some(value) = self.node_value(id).filter(|v| predicate(*v)) {
                best = Some(value);
            }
        }
        best
    }

    /// Path to the shallowest node on the route to `path` whose value
    /// satisfies `predicate`.
    pub fn find_root_most_matching_path<P>(&self, path: &Path, predicate: P) -> Option<Path>
    where
        P: Fn(&V) -> bool,
    {
        self.route(path)
            .into_iter()
            .find(|(_, id)| self.node_value(*id).is_some_and(|v| predicate(v)))
            .map(|(depth, _)| Path::from_segments(path.segments().take(depth)))
    }

    /// Path to the shallowest valued node on the route to `path`.
    pub fn find_root_most_path_with_value(&self, path: &Path) -> Option<Path> {
        self.find_root_most_matching_path(path, |_| true)
    }

    // ========================================================================
    // Whole-tree queries
    // ========================================================================

    /// True if no node holds a value.
    pub fn is_empty(&self) -> bool {
        self.is_node_empty(Self::ROOT)
    }

    /// True if no node at or below `id` holds a value.
    pub fn is_node_empty(&self, id: NodeId) -> bool {
        !self.subtree_contains_matching_value(id, |_| true)
    }

    /// True if any value in the tree satisfies `predicate`.
    pub fn contains_matching_value<P>(&self, predicate: P) -> bool
    where
        P: Fn(&V) -> bool,
    {
        self.subtree_contains_matching_value(Self::ROOT, predicate)
    }

    /// True if any value at or below `id` satisfies `predicate`.
    pub fn subtree_contains_matching_value<P>(&self, id: NodeId, predicate: P) -> bool
    where
        P: Fn(&V) -> bool,
    {
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let node = self.node(current);
            if node.value.as_ref().is_some_and(&predicate) {
                return true;
            }
            stack.extend(node.children.values().copied());
        }
        false
    }

    // ========================================================================
    // Traversal
    // ========================================================================

    /// Post-order fold over valued nodes, children before their parent.
    /// Paths passed to `visitor` are relative to the root.
    pub fn fold<A, F>(&self, init: A, mut visitor: F) -> A
    where
        F: FnMut(&Path, &V, A) -> A,
    {
        self.fold_node(Self::ROOT, &Path::root(), init, &mut visitor)
    }

    fn fold_node<A, F>(&self, id: NodeId, path: &Path, init: A, visitor: &mut F) -> A
    where
        F: FnMut(&Path, &V, A) -> A,
    {
        let node = self.node(id);
        let mut acc = init;
        for (key, child) in &node.children {
            acc = self.fold_node(*child, &path.child(key), acc, visitor);
        }
        if let Some(value) = &node.value {
            acc = visitor(path, value, acc);
        }
        acc
    }

    /// Pre-order visit of valued nodes at or below `path`. Paths passed to
    /// `visitor` are full paths from the root.
    pub fn call_on_each<F>(&self, path: &Path, mut visitor: F)
    where
        F: FnMut(&Path, &V),
    {
        if let Some(id) = self.get_child(path) {
            self.each_node(id, path, &mut visitor);
        }
    }

    fn each_node<F>(&self, id: NodeId, path: &Path, visitor: &mut F)
    where
        F: FnMut(&Path, &V),
    {
        let node = self.node(id);
        if let Some(value) = &node.value {
            visitor(path, value);
        }
        for (key, child) in &node.children {
            self.each_node(*child, &path.child(key), visitor);
        }
    }

    /// Walk from `id` toward the root. Stops as soon as `visitor` returns
    /// true and reports whether it did.
    pub fn call_on_each_ancestor<F>(&self, id: NodeId, include_self: bool, mut visitor: F) -> bool
    where
        F: FnMut(NodeId) -> bool,
    {
        let mut current = if include_self {
            Some(id)
        } else {
            self.parent(id)
        };
        while let Some(node_id) = current {
            if visitor(node_id) {
                return true;
            }
            current = self.parent(node_id);
        }
        false
    }

    /// Visit every node below `id`, optionally including `id` itself.
    pub fn call_on_each_descendant<F>(
        &self,
        id: NodeId,
        include_self: bool,
        children_first: bool,
        visitor: &mut F,
    ) where
        F: FnMut(NodeId),
    {
        if include_self && !children_first {
            visitor(id);
        }
        for child in self.node(id).children.values() {
            self.call_on_each_descendant(*child, true, children_first, visitor);
        }
        if include_self && children_first {
            visitor(id);
        }
    }
}

impl<V: Clone> Tree<V> {
    /// Copy of the subtree at `path` as a standalone tree.
    pub fn subtree(&self, path: &Path) -> Option<Tree<V>> {
        let id = self.get_child(path)?;
        let mut result = Tree::with_value(self.node_value(id).cloned());
        self.copy_children(id, &mut result, Self::ROOT);
        Some(result)
    }

    fn copy_children(&self, from: NodeId, into: &mut Tree<V>, at: NodeId) {
        for (key, child) in self.children(from) {
            let value = self.node_value(child).cloned();
            let new_child = into.alloc(Node::new(key.to_string(), value, Some(at)));
            into.node_mut(at).children.insert(key.to_string(), new_child);
            self.copy_children(child, into, new_child);
        }
    }

    /// Replace everything at and below `path` with a copy of `subtree`.
    pub fn set_subtree(&mut self, path: &Path, subtree: &Tree<V>) {
        let id = self.get_or_make_subtree(path);
        let children: Vec<NodeId> = self.node(id).children.values().copied().collect();
        for child in children {
            self.remove_subtree(child);
        }
        self.node_mut(id).value = subtree.value().cloned();
        subtree.copy_children(Self::ROOT, self, id);
    }
}

impl<V: PartialEq> Tree<V> {
    fn node_eq(&self, id: NodeId, other: &Tree<V>, other_id: NodeId) -> bool {
        let a = self.node(id);
        let b = other.node(other_id);
        a.value == b.value
            && a.children.len() == b.children.len()
            && a.children.iter().all(|(key, child)| match b.children.get(key) {
                Some(other_child) => self.node_eq(*child, other, *other_child),
                None => false,
            })
    }
}

impl<V: PartialEq> PartialEq for Tree<V> {
    fn eq(&self, other: &Self) -> bool {
        self.node_eq(Self::ROOT, other, Self::ROOT)
    }
}
