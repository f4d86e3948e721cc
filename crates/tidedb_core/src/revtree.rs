//! Per-document revision trees.
//!
//! A document's retained revisions form a forest: due to history pruning a
//! root may itself be a non-generation-1 revision, and replicated history
//! can introduce additional roots. Nodes reference their parent by revision
//! ID looked up within the tree's arena, never by owning pointer, so
//! pruning is a simple compaction pass over the map.

use crate::error::{EngineError, EngineResult};
use crate::types::{Body, RevId, Sequence};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// One node of a revision tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevNode {
    /// This node's revision ID.
    pub rev_id: RevId,
    /// Parent revision ID; `None` for roots.
    pub parent: Option<RevId>,
    /// Tombstone flag.
    pub deleted: bool,
    /// Content; `None` for placeholder ancestors.
    pub body: Option<Body>,
    /// Commit sequence; `None` for placeholders.
    pub sequence: Option<Sequence>,
}

impl RevNode {
    /// Returns true if this node has no stored content.
    #[must_use]
    pub fn is_placeholder(&self) -> bool {
        self.body.is_none() && !self.deleted
    }
}

/// All retained revisions of one document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RevTree {
    nodes: BTreeMap<String, RevNode>,
}

impl RevTree {
    /// Creates an empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the tree holds no revisions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of retained revisions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if `rev_id` is present anywhere in the tree, leaf or
    /// internal node.
    #[must_use]
    pub fn contains(&self, rev_id: &RevId) -> bool {
        self.nodes.contains_key(&rev_id.to_string())
    }

    /// Looks up a node by revision ID.
    #[must_use]
    pub fn get(&self, rev_id: &RevId) -> Option<&RevNode> {
        self.nodes.get(&rev_id.to_string())
    }

    /// Adds a node to the tree.
    ///
    /// The parent must already be present unless `allow_orphan` is set
    /// (force-insert mode, pending future history arrival).
    ///
    /// # Errors
    ///
    /// `BadRequest` if the revision already exists or the parent is
    /// missing without `allow_orphan`.
    pub fn add(&mut self, node: RevNode, allow_orphan: bool) -> EngineResult<()> {
        let key = node.rev_id.to_string();
        if self.nodes.contains_key(&key) {
            return Err(EngineError::bad_request(format!(
                "revision {key} already present"
            )));
        }
        if let Some(parent) = &node.parent {
            if !self.contains(parent) && !allow_orphan {
                return Err(EngineError::bad_request(format!(
                    "parent revision {parent} not present"
                )));
            }
        }
        self.nodes.insert(key, node);
        Ok(())
    }

    /// Replaces the stored node for `rev_id`. The node must exist.
    pub(crate) fn update(&mut self, node: RevNode) {
        self.nodes.insert(node.rev_id.to_string(), node);
    }

    /// Returns true if any node names `rev_id` as its parent.
    #[must_use]
    pub fn has_child(&self, rev_id: &RevId) -> bool {
        self.nodes
            .values()
            .any(|n| n.parent.as_ref() == Some(rev_id))
    }

    /// All leaves (nodes without children), ordered by revision ID
    /// descending, so the winner comes first among live leaves.
    #[must_use]
    pub fn leaves(&self) -> Vec<&RevNode> {
        let parents: HashSet<String> = self
            .nodes
            .values()
            .filter_map(|n| n.parent.as_ref().map(ToString::to_string))
            .collect();

        let mut leaves: Vec<&RevNode> = self
            .nodes
            .iter()
            .filter(|(key, _)| !parents.contains(*key))
            .map(|(_, node)| node)
            .collect();
        leaves.sort_by(|a, b| b.rev_id.cmp(&a.rev_id));
        leaves
    }

    /// The winning revision: the non-deleted leaf with the highest
    /// `(generation, digest)` ordering, or, if every leaf is deleted, the
    /// highest deleted leaf (the document then reads as deleted).
    #[must_use]
    pub fn winner(&self) -> Option<&RevNode> {
        let leaves = self.leaves();
        leaves
            .iter()
            .find(|n| !n.deleted)
            .or_else(|| leaves.first())
            .copied()
    }

    /// Non-deleted leaves other than the winner: the unresolved conflicts.
    #[must_use]
    pub fn conflicts(&self) -> Vec<RevId> {
        let Some(winner) = self.winner() else {
            return Vec::new();
        };
        self.leaves()
            .iter()
            .filter(|n| !n.deleted && n.rev_id != winner.rev_id)
            .map(|n| n.rev_id.clone())
            .collect()
    }

    /// Returns true if the tree has more than one live leaf.
    #[must_use]
    pub fn is_conflicted(&self) -> bool {
        self.leaves().iter().filter(|n| !n.deleted).count() > 1
    }

    /// Ancestry of `rev_id`, newest first, starting with `rev_id` itself,
    /// following parent links as far as they are retained.
    #[must_use]
    pub fn history(&self, rev_id: &RevId) -> Vec<RevId> {
        let mut chain = Vec::new();
        let mut current = Some(rev_id.clone());
        while let Some(rev) = current {
            let Some(node) = self.get(&rev) else { break };
            chain.push(rev);
            current = node.parent.clone();
        }
        chain
    }

    /// Returns true if `ancestor` appears in `descendant`'s ancestry
    /// (a revision counts as its own ancestor).
    #[must_use]
    pub fn is_ancestor(&self, ancestor: &RevId, descendant: &RevId) -> bool {
        self.history(descendant).iter().any(|r| r == ancestor)
    }

    /// Iterates over every retained revision ID.
    pub fn rev_ids(&self) -> impl Iterator<Item = &RevNode> {
        self.nodes.values()
    }

    /// Prunes history deeper than `max_depth` generations below the
    /// deepest leaf. Leaves are never pruned; children of pruned nodes
    /// become roots.
    ///
    /// Returns the number of revisions removed.
    pub fn prune(&mut self, max_depth: usize) -> usize {
        let Some(max_gen) = self
            .leaves()
            .iter()
            .map(|n| n.rev_id.generation())
            .max()
        else {
            return 0;
        };
        if max_gen as usize <= max_depth {
            return 0;
        }
        let min_gen = max_gen - max_depth as u64;

        let parents: HashSet<String> = self
            .nodes
            .values()
            .filter_map(|n| n.parent.as_ref().map(ToString::to_string))
            .collect();

        let doomed: Vec<String> = self
            .nodes
            .iter()
            .filter(|(key, node)| {
                // Internal nodes only; a shallow branch keeps its leaf.
                node.rev_id.generation() <= min_gen && parents.contains(*key)
            })
            .map(|(key, _)| key.clone())
            .collect();

        for key in &doomed {
            self.nodes.remove(key);
        }

        // Orphaned children become roots.
        let removed: HashSet<&String> = doomed.iter().collect();
        for node in self.nodes.values_mut() {
            if let Some(parent) = &node.parent {
                if removed.contains(&parent.to_string()) {
                    node.parent = None;
                }
            }
        }

        doomed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rev(s: &str) -> RevId {
        RevId::parse(s).unwrap()
    }

    fn node(rev_id: &str, parent: Option<&str>, deleted: bool) -> RevNode {
        RevNode {
            rev_id: rev(rev_id),
            parent: parent.map(rev),
            deleted,
            body: Some(Body::new()),
            sequence: None,
        }
    }

    fn linear_tree() -> RevTree {
        let mut tree = RevTree::new();
        tree.add(node("1-a", None, false), false).unwrap();
        tree.add(node("2-b", Some("1-a"), false), false).unwrap();
        tree.add(node("3-c", Some("2-b"), false), false).unwrap();
        tree
    }

    #[test]
    fn add_and_contains() {
        let tree = linear_tree();
        assert_eq!(tree.len(), 3);
        assert!(tree.contains(&rev("2-b")));
        assert!(!tree.contains(&rev("2-x")));
    }

    #[test]
    fn add_rejects_duplicate() {
        let mut tree = linear_tree();
        let result = tree.add(node("2-b", Some("1-a"), false), false);
        assert!(matches!(result, Err(EngineError::BadRequest(_))));
    }

    #[test]
    fn add_rejects_missing_parent_unless_orphan_allowed() {
        let mut tree = RevTree::new();
        let result = tree.add(node("2-b", Some("1-a"), false), false);
        assert!(result.is_err());

        tree.add(node("2-b", Some("1-a"), false), true).unwrap();
        assert!(tree.contains(&rev("2-b")));
    }

    #[test]
    fn linear_tree_has_single_leaf_winner() {
        let tree = linear_tree();
        let leaves = tree.leaves();
        assert_eq!(leaves.len(), 1);
        assert_eq!(tree.winner().unwrap().rev_id, rev("3-c"));
        assert!(!tree.is_conflicted());
    }

    #[test]
    fn branch_creates_conflict_and_highest_wins() {
        let mut tree = linear_tree();
        tree.add(node("3-z", Some("2-b"), false), false).unwrap();

        assert!(tree.is_conflicted());
        // 3-z > 3-c lexicographically on the digest.
        assert_eq!(tree.winner().unwrap().rev_id, rev("3-z"));
        assert_eq!(tree.conflicts(), vec![rev("3-c")]);
    }

    #[test]
    fn deleting_a_branch_resolves_conflict() {
        let mut tree = linear_tree();
        tree.add(node("3-z", Some("2-b"), false), false).unwrap();
        tree.add(node("4-t", Some("3-z"), true), false).unwrap();

        // The tombstoned branch no longer competes.
        assert_eq!(tree.winner().unwrap().rev_id, rev("3-c"));
        assert!(!tree.is_conflicted());
    }

    #[test]
    fn all_deleted_leaves_yields_deleted_winner() {
        let mut tree = RevTree::new();
        tree.add(node("1-a", None, false), false).unwrap();
        tree.add(node("2-b", Some("1-a"), true), false).unwrap();

        let winner = tree.winner().unwrap();
        assert_eq!(winner.rev_id, rev("2-b"));
        assert!(winner.deleted);
    }

    #[test]
    fn history_newest_first() {
        let tree = linear_tree();
        let history = tree.history(&rev("3-c"));
        assert_eq!(history, vec![rev("3-c"), rev("2-b"), rev("1-a")]);
    }

    #[test]
    fn ancestry_check() {
        let tree = linear_tree();
        assert!(tree.is_ancestor(&rev("1-a"), &rev("3-c")));
        assert!(tree.is_ancestor(&rev("3-c"), &rev("3-c")));
        assert!(!tree.is_ancestor(&rev("3-c"), &rev("1-a")));
    }

    #[test]
    fn prune_removes_deep_ancestors() {
        let mut tree = RevTree::new();
        tree.add(node("1-a", None, false), false).unwrap();
        for g in 2..=10u64 {
            let child = format!("{g}-r");
            let parent = format!("{}-r", g - 1);
            let parent = if g == 2 { "1-a".to_string() } else { parent };
            tree.add(node(&child, Some(&parent), false), false).unwrap();
        }
        assert_eq!(tree.len(), 10);

        let removed = tree.prune(3);
        assert_eq!(removed, 7);
        assert_eq!(tree.len(), 3);
        // The leaf survives and the new root has no parent.
        assert_eq!(tree.winner().unwrap().rev_id, rev("10-r"));
        assert!(tree.get(&rev("8-r")).unwrap().parent.is_none());
    }

    #[test]
    fn prune_keeps_shallow_branch_leaves() {
        let mut tree = linear_tree();
        for g in 4..=25u64 {
            let child = format!("{g}-r");
            let parent = if g == 4 {
                "3-c".to_string()
            } else {
                format!("{}-r", g - 1)
            };
            tree.add(node(&child, Some(&parent), false), false).unwrap();
        }
        // A stale conflicting leaf at generation 2.
        tree.add(node("2-zzz", Some("1-a"), false), false).unwrap();

        tree.prune(5);
        // The shallow leaf survives pruning even below the threshold.
        assert!(tree.contains(&rev("2-zzz")));
        assert!(tree.get(&rev("2-zzz")).unwrap().parent.is_none());
        assert_eq!(tree.winner().unwrap().rev_id, rev("25-r"));
    }

    #[test]
    fn prune_noop_on_shallow_tree() {
        let mut tree = linear_tree();
        assert_eq!(tree.prune(20), 0);
        assert_eq!(tree.len(), 3);
    }

    #[test]
    fn tree_serde_roundtrip() {
        let tree = linear_tree();
        let json = serde_json::to_string(&tree).unwrap();
        let back: RevTree = serde_json::from_str(&json).unwrap();
        assert_eq!(tree, back);
    }
}
