//! Revision tree of a single document.
//!
//! The root is the oldest known revision. Every node may have several
//! branches; a document whose tree has more than one leaf carries an
//! unresolved conflict, and [`RevisionTree::winner`] picks the leaf every
//! instance agrees on.

use crate::revision::{compare_revs, generation};
use serde::{Deserialize, Serialize};

/// A revision and the branches that descend from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionTree {
    pub rev: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub branches: Vec<RevisionTree>,
}

impl RevisionTree {
    /// Creates a tree with a single revision.
    pub fn new(rev: impl Into<String>) -> Self {
        Self {
            rev: rev.into(),
            branches: Vec::new(),
        }
    }

    /// Builds a linear tree from an ordered chain, oldest first.
    ///
    /// Returns `None` for an empty chain.
    pub fn from_chain(chain: &[String]) -> Option<Self> {
        let first = chain.first()?;
        let mut tree = Self::new(first.clone());
        tree.insert_chain_from(0, chain);
        Some(tree)
    }

    /// Depth-first search for the subtree rooted at `rev`.
    pub fn find(&self, rev: &str) -> Option<&RevisionTree> {
        if self.rev == rev {
            return Some(self);
        }
        self.branches.iter().find_map(|branch| branch.find(rev))
    }

    /// Returns true if `rev` appears anywhere in the tree.
    pub fn contains(&self, rev: &str) -> bool {
        self.find(rev).is_some()
    }

    /// Number of revisions in the tree.
    pub fn len(&self) -> usize {
        1 + self.branches.iter().map(RevisionTree::len).sum::<usize>()
    }

    /// A tree always holds at least its root.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Appends a brand-new revision.
    ///
    /// The revision becomes a child of the most recent leaf that is older
    /// than it (the winning leaf when several qualify). When no leaf is
    /// older, a new branch is forked from the most recent older interior
    /// node. Returns false if the revision is already known or is not
    /// younger than the root.
    pub fn add(&mut self, rev: &str) -> bool {
        if self.contains(rev) {
            return false;
        }
        let Some(path) = self.ancestor_for(rev) else {
            return false;
        };
        self.node_mut(&path).branches.push(Self::new(rev));
        true
    }

    /// Attaches `rev` as a child of `parent`.
    ///
    /// An unknown parent is added first. Returns false, leaving the tree
    /// untouched, if `rev` is already known or the parent cannot be placed.
    pub fn insert_after(&mut self, rev: &str, parent: &str) -> bool {
        if self.contains(rev) {
            return false;
        }
        if !self.contains(parent) && !self.add(parent) {
            return false;
        }
        match self.path_to(parent) {
            Some(path) => {
                self.node_mut(&path).branches.push(Self::new(rev));
                true
            }
            None => false,
        }
    }

    /// Inserts an ordered chain of revisions, oldest first.
    ///
    /// The longest already-known prefix is reused and only the new suffix
    /// is appended, so inserting the same chain twice is a no-op.
    ///
    /// Returns false, leaving the tree untouched, when the chain shares no
    /// revision with the tree and its oldest revision is not younger than
    /// the root.
    pub fn insert_chain(&mut self, chain: &[String]) -> bool {
        let start = match chain.iter().rposition(|rev| self.contains(rev)) {
            Some(known) => known,
            None => {
                let Some(first) = chain.first() else {
                    return true;
                };
                if !self.add(first) {
                    return false;
                }
                0
            }
        };
        self.insert_chain_from(start, chain);
        true
    }

    fn insert_chain_from(&mut self, start: usize, chain: &[String]) {
        for pair in chain[start..].windows(2) {
            self.insert_after(&pair[1], &pair[0]);
        }
    }

    /// Revisions with no descendants.
    pub fn leaves(&self) -> Vec<&str> {
        let mut leaves = Vec::new();
        self.collect_leaves(&mut leaves);
        leaves
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a str>) {
        if self.branches.is_empty() {
            out.push(&self.rev);
        } else {
            for branch in &self.branches {
                branch.collect_leaves(out);
            }
        }
    }

    /// The maximum generation found along any leaf.
    pub fn generation(&self) -> u64 {
        self.leaves()
            .into_iter()
            .map(generation)
            .max()
            .unwrap_or_default()
    }

    /// The deterministic winning leaf: highest generation, then highest
    /// revision string.
    pub fn winner(&self) -> &str {
        self.leaves()
            .into_iter()
            .max_by(|a, b| compare_revs(a, b))
            .unwrap_or(self.rev.as_str())
    }

    /// True when the document has several leaves.
    pub fn has_conflicts(&self) -> bool {
        self.leaves().len() > 1
    }

    /// The ordered chain of revisions from the root down to `rev`.
    pub fn chain_to(&self, rev: &str) -> Option<Vec<String>> {
        let path = self.path_to(rev)?;
        let mut chain = vec![self.rev.clone()];
        let mut node = self;
        for &index in &path {
            node = &node.branches[index];
            chain.push(node.rev.clone());
        }
        Some(chain)
    }

    fn path_to(&self, rev: &str) -> Option<Vec<usize>> {
        if self.rev == rev {
            return Some(Vec::new());
        }
        self.branches.iter().enumerate().find_map(|(index, branch)| {
            branch.path_to(rev).map(|mut path| {
                path.insert(0, index);
                path
            })
        })
    }

    fn node_mut(&mut self, path: &[usize]) -> &mut RevisionTree {
        let mut node = self;
        for &index in path {
            node = &mut node.branches[index];
        }
        node
    }

    /// Every node with its path from the root, breadth first.
    fn nodes(&self) -> Vec<(Vec<usize>, &RevisionTree)> {
        let mut nodes = vec![(Vec::new(), self)];
        let mut cursor = 0;
        while cursor < nodes.len() {
            let (path, node) = (nodes[cursor].0.clone(), nodes[cursor].1);
            for (index, branch) in node.branches.iter().enumerate() {
                let mut child = path.clone();
                child.push(index);
                nodes.push((child, branch));
            }
            cursor += 1;
        }
        nodes
    }

    fn ancestor_for(&self, rev: &str) -> Option<Vec<usize>> {
        let target = generation(rev);
        let nodes = self.nodes();
        let best_older = |leaves_only: bool| {
            nodes
                .iter()
                .filter(|(_, node)| generation(&node.rev) < target)
                .filter(|(_, node)| !leaves_only || node.branches.is_empty())
                .max_by(|(_, a), (_, b)| compare_revs(&a.rev, &b.rev))
                .map(|(path, _)| path.clone())
        };
        best_older(true).or_else(|| best_older(false))
    }
}
