//! Prune/keep markings over the server cache
//!
//! A [`PruneForest`] is a `Tree<bool>`: `true` marks a location for pruning,
//! `false` protects it. The leaf-most marking on the route to a location
//! decides its fate. Keeping a location below a pruned one is how a pruned
//! subtree retains specific children; pruning below a kept location is a
//! contradiction and aborts.

use crate::error::invariant_violation;
use crate::path::Path;
use crate::tree::Tree;

const PRUNE: bool = true;
const KEEP: bool = false;

fn is_prune(marking: &bool) -> bool {
    *marking
}

fn is_keep(marking: &bool) -> bool {
    !*marking
}

/// Markings describing which cached locations to evict
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PruneForest {
    prune_tree: Tree<bool>,
}

impl PruneForest {
    /// A forest with no markings.
    pub fn new() -> Self {
        PruneForest::default()
    }

    fn from_tree(prune_tree: Tree<bool>) -> Self {
        PruneForest { prune_tree }
    }

    /// Underlying marking tree.
    pub fn prune_tree(&self) -> &Tree<bool> {
        &self.prune_tree
    }

    /// True if any location is marked for pruning.
    pub fn prunes_anything(&self) -> bool {
        self.prune_tree.contains_matching_value(is_prune)
    }

    /// True if the leaf-most marking on the route to `path` is keep.
    pub fn should_keep(&self, path: &Path) -> bool {
        self.prune_tree.leaf_most_value(path).is_some_and(is_keep)
    }

    /// True if the leaf-most marking on the route to `path` is prune.
    pub fn should_prune_unkept_descendants(&self, path: &Path) -> bool {
        self.prune_tree.leaf_most_value(path).is_some_and(is_prune)
    }

    /// True if `path` has a marking at, above, or below it.
    pub fn affects_path(&self, path: &Path) -> bool {
        if self.prune_tree.root_most_value(path).is_some() {
            return true;
        }
        self.prune_tree
            .get_child(path)
            .is_some_and(|id| !self.prune_tree.is_node_empty(id))
    }

    /// Forest as seen from the child `key`. An inherited marking becomes the
    /// child's root marking.
    pub fn child(&self, key: &str) -> PruneForest {
        match self.prune_tree.subtree(&Path::new(key)) {
            Some(mut subtree) => {
                if subtree.value().is_none() {
                    subtree.set_value(self.prune_tree.value().copied());
                }
                PruneForest::from_tree(subtree)
            }
            None => PruneForest::from_tree(Tree::with_value(self.prune_tree.value().copied())),
        }
    }

    /// Forest as seen from `path`.
    pub fn get_child(&self, path: &Path) -> PruneForest {
        path.segments()
            .fold(self.clone(), |forest, segment| forest.child(segment))
    }

    /// Mark `path` for pruning. No-op below an existing prune marking.
    pub fn prune(&mut self, path: &Path) {
        if self.prune_tree.root_most_value_matching(path, is_keep).is_some() {
            invariant_violation(format!("cannot prune {path}: an ancestor is kept"));
        }
        if self.prune_tree.root_most_value_matching(path, is_prune).is_some() {
            return;
        }
        self.prune_tree.set_subtree(path, &Tree::with_value(PRUNE));
    }

    /// Protect `path`. No-op below an existing keep marking.
    pub fn keep(&mut self, path: &Path) {
        if self.prune_tree.root_most_value_matching(path, is_keep).is_some() {
            return;
        }
        self.prune_tree.set_subtree(path, &Tree::with_value(KEEP));
    }

    /// Mark each named child of `path` for pruning.
    pub fn prune_all<I, S>(&mut self, path: &Path, children: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if self.prune_tree.root_most_value_matching(path, is_keep).is_some() {
            invariant_violation(format!("cannot prune children of {path}: it is kept"));
        }
        if self.prune_tree.root_most_value_matching(path, is_prune).is_some() {
            return;
        }
        self.mark_children(path, children, PRUNE);
    }

    /// Protect each named child of `path`.
    pub fn keep_all<I, S>(&mut self, path: &Path, children: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if self.prune_tree.root_most_value_matching(path, is_keep).is_some() {
            return;
        }
        self.mark_children(path, children, KEEP);
    }

    fn mark_children<I, S>(&mut self, path: &Path, children: I, marking: bool)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let leaf = Tree::with_value(marking);
        for child in children {
            self.prune_tree.set_subtree(&path.child(child.as_ref()), &leaf);
        }
    }

    /// Fold over every kept location, post-order.
    pub fn fold_kept_nodes<A, F>(&self, init: A, mut visitor: F) -> A
    where
        F: FnMut(&Path, A) -> A,
    {
        self.prune_tree.fold(init, |path, marking, acc| {
            if is_keep(marking) {
                visitor(path, acc)
            } else {
                acc
            }
        })
    }
}
