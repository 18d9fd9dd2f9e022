//! Spine - the hierarchical partition shared by origins and destinations.
//!
//! The spine is an arena of nodes with index-based parent and child links:
//!
//! ```text
//! level 0   [root "0"]
//!              │
//! level 1   [Nord] ───── [Sud]
//!            │   │         │
//! level 2  [MI] [TO]     [NA]
//! ```
//!
//! Every node is addressed by a [`NodeId`] (its arena index), so labels only
//! need to be unique among siblings. Parent lookup is O(1).
//!
//! A [`Spine`] is a depth-limited *view* over a shared, immutable tree:
//! [`Spine::truncate`] returns a shallower view without touching the tree,
//! so views can be handed to worker threads freely.

mod nested;

pub use nested::NestedSpine;

use crate::error::{ReleaseError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Label of the root sentinel at level 0.
pub const ROOT_LABEL: &str = "0";

/// Handle of a spine node (index into the node arena).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(u32);

impl NodeId {
    /// The root sentinel.
    pub const ROOT: NodeId = NodeId(0);

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SpineNode {
    label: String,
    level: usize,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

#[derive(Debug, PartialEq, Eq)]
struct SpineTree {
    nodes: Vec<SpineNode>,
    /// Node handles per level, in sorted label order within each parent.
    levels: Vec<Vec<NodeId>>,
}

impl SpineTree {
    fn depth(&self) -> usize {
        self.levels.len() - 1
    }
}

/// Depth-limited view over an immutable hierarchical tree.
#[derive(Debug, Clone)]
pub struct Spine {
    tree: Arc<SpineTree>,
    depth: usize,
}

impl PartialEq for Spine {
    fn eq(&self, other: &Self) -> bool {
        self.depth == other.depth && (Arc::ptr_eq(&self.tree, &other.tree) || self.tree == other.tree)
    }
}

impl Eq for Spine {}

impl Spine {
    /// Build a spine from its nested-mapping form.
    ///
    /// Fails with `InvalidInput` if leaves sit at different depths.
    pub fn from_nested(nested: &NestedSpine) -> Result<Self> {
        let depth = nested.depth();
        let mut nodes = vec![SpineNode {
            label: ROOT_LABEL.to_string(),
            level: 0,
            parent: None,
            children: Vec::new(),
        }];
        let mut levels: Vec<Vec<NodeId>> = vec![Vec::new(); depth + 1];
        levels[0].push(NodeId::ROOT);

        // Breadth-first so each level is filled parent by parent.
        let mut frontier: Vec<(NodeId, &NestedSpine)> = vec![(NodeId::ROOT, nested)];
        for level in 1..=depth {
            let mut next = Vec::new();
            for (parent, mapping) in frontier {
                if mapping.is_empty() {
                    return Err(ReleaseError::invalid(format!(
                        "leaf '{}' at level {} but spine depth is {}",
                        nodes[parent.index()].label,
                        level - 1,
                        depth
                    )));
                }
                for (label, subtree) in &mapping.0 {
                    let id = NodeId(u32::try_from(nodes.len()).map_err(|_| {
                        ReleaseError::invalid("spine has more nodes than addressable")
                    })?);
                    nodes.push(SpineNode {
                        label: label.clone(),
                        level,
                        parent: Some(parent),
                        children: Vec::new(),
                    });
                    nodes[parent.index()].children.push(id);
                    levels[level].push(id);
                    next.push((id, subtree));
                }
            }
            frontier = next;
        }

        Ok(Self {
            tree: Arc::new(SpineTree { nodes, levels }),
            depth,
        })
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        Self::from_nested(&NestedSpine::from_json_str(json)?)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Self::from_nested(&NestedSpine::from_yaml_str(yaml)?)
    }

    /// Nested-mapping form of this view (deeper subtrees become empty mappings).
    pub fn to_nested(&self) -> NestedSpine {
        self.nested_below(NodeId::ROOT)
    }

    fn nested_below(&self, node: NodeId) -> NestedSpine {
        let entry = &self.tree.nodes[node.index()];
        if entry.level >= self.depth {
            return NestedSpine::new();
        }
        NestedSpine(
            entry
                .children
                .iter()
                .map(|child| {
                    (
                        self.tree.nodes[child.index()].label.clone(),
                        self.nested_below(*child),
                    )
                })
                .collect(),
        )
    }

    /// Longest root-to-leaf chain of this view.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Depth of the underlying tree, independent of truncation.
    pub fn full_depth(&self) -> usize {
        self.tree.depth()
    }

    /// Whether two views share the same underlying tree, so their handles are comparable.
    pub fn same_tree(&self, other: &Spine) -> bool {
        Arc::ptr_eq(&self.tree, &other.tree)
    }

    /// New view keeping only nodes within `level` steps of the root.
    pub fn truncate(&self, level: usize) -> Result<Spine> {
        if level > self.full_depth() {
            return Err(ReleaseError::Range {
                level,
                max: self.full_depth(),
            });
        }
        Ok(Spine {
            tree: Arc::clone(&self.tree),
            depth: level,
        })
    }

    pub fn label(&self, node: NodeId) -> Option<&str> {
        self.tree.nodes.get(node.index()).map(|n| n.label.as_str())
    }

    fn check_level(&self, level: usize) -> Result<()> {
        if level > self.depth {
            return Err(ReleaseError::Range {
                level,
                max: self.depth,
            });
        }
        Ok(())
    }

    fn node_at(&self, level: usize, node: NodeId) -> Result<&SpineNode> {
        self.check_level(level)?;
        match self.tree.nodes.get(node.index()) {
            Some(entry) if entry.level == level => Ok(entry),
            Some(entry) => Err(ReleaseError::NotFound {
                level,
                node: entry.label.clone(),
            }),
            None => Err(ReleaseError::NotFound {
                level,
                node: node.to_string(),
            }),
        }
    }

    /// All nodes at `level`; level 0 is the root alone.
    pub fn nodes_at_level(&self, level: usize) -> Result<&[NodeId]> {
        self.check_level(level)?;
        Ok(&self.tree.levels[level])
    }

    /// Children one level below `node`; empty at the depth of the view.
    pub fn children_of(&self, level: usize, node: NodeId) -> Result<&[NodeId]> {
        let entry = self.node_at(level, node)?;
        if level == self.depth {
            return Ok(&[]);
        }
        Ok(&entry.children)
    }

    /// Unique parent of `node`; level 1 nodes return the root.
    ///
    /// Level 0 has no fathers and is a `Range` error.
    pub fn father_of(&self, level: usize, node: NodeId) -> Result<NodeId> {
        let entry = self.node_at(level, node)?;
        entry.parent.ok_or(ReleaseError::Range {
            level,
            max: self.depth,
        })
    }

    /// Descendants of `node` at level `target` (`level < target <= depth`).
    pub fn descendants_of(&self, level: usize, node: NodeId, target: usize) -> Result<Vec<NodeId>> {
        self.node_at(level, node)?;
        if target <= level {
            return Err(ReleaseError::invalid(format!(
                "descendant level {} must lie below level {}",
                target, level
            )));
        }
        self.check_level(target)?;

        let mut frontier = vec![node];
        for current in level..target {
            let mut next = Vec::new();
            for id in &frontier {
                next.extend_from_slice(self.children_of(current, *id)?);
            }
            frontier = next;
        }
        Ok(frontier)
    }

    /// Ancestor of `node` at level `target` (`0 <= target < level`).
    pub fn ancestors_of(&self, level: usize, node: NodeId, target: usize) -> Result<NodeId> {
        self.node_at(level, node)?;
        if target >= level {
            return Err(ReleaseError::invalid(format!(
                "ancestor level {} must lie above level {}",
                target, level
            )));
        }
        if target == 0 {
            return Ok(NodeId::ROOT);
        }
        let mut current = node;
        for l in ((target + 1)..=level).rev() {
            current = self.father_of(l, current)?;
        }
        Ok(current)
    }

    /// Root-to-node handles, `level + 1` long, starting at the root.
    pub fn path_to(&self, level: usize, node: NodeId) -> Result<Vec<NodeId>> {
        self.node_at(level, node)?;
        let mut path = vec![node];
        let mut current = node;
        for l in (1..=level).rev() {
            current = self.father_of(l, current)?;
            path.push(current);
        }
        path.reverse();
        Ok(path)
    }

    /// Root-to-node labels.
    pub fn path_labels(&self, level: usize, node: NodeId) -> Result<Vec<String>> {
        Ok(self
            .path_to(level, node)?
            .into_iter()
            .map(|id| self.tree.nodes[id.index()].label.clone())
            .collect())
    }

    /// Every path from `node` down to a leaf of this view, each starting at `node`.
    pub fn paths_from(&self, level: usize, node: NodeId) -> Result<Vec<Vec<NodeId>>> {
        self.node_at(level, node)?;
        let mut paths = vec![vec![node]];
        for current in level..self.depth {
            let mut extended = Vec::new();
            for path in paths {
                let tail = *path.last().unwrap_or(&node);
                for child in self.children_of(current, tail)? {
                    let mut longer = path.clone();
                    longer.push(*child);
                    extended.push(longer);
                }
            }
            paths = extended;
        }
        Ok(paths)
    }

    /// Every root-to-leaf path at the current depth.
    pub fn all_root_to_leaf_paths(&self) -> Vec<Vec<NodeId>> {
        // The root always exists at level 0.
        self.paths_from(0, NodeId::ROOT).unwrap_or_default()
    }

    /// Look up a node by label.
    ///
    /// Labels are only unique among siblings; an ambiguous label at `level`
    /// is rejected rather than silently picking one of the matches.
    pub fn find(&self, level: usize, label: &str) -> Result<NodeId> {
        let mut matches = self
            .nodes_at_level(level)?
            .iter()
            .copied()
            .filter(|id| self.tree.nodes[id.index()].label == label);
        let first = matches.next().ok_or_else(|| ReleaseError::NotFound {
            level,
            node: label.to_string(),
        })?;
        if matches.next().is_some() {
            return Err(ReleaseError::invalid(format!(
                "label '{}' is ambiguous at level {}; resolve it by path",
                label, level
            )));
        }
        Ok(first)
    }

    /// Resolve a root-to-node label path (first label must be the root).
    pub fn resolve_path<S: AsRef<str>>(&self, labels: &[S]) -> Result<NodeId> {
        let (head, rest) = labels
            .split_first()
            .ok_or_else(|| ReleaseError::invalid("empty spine path"))?;
        if head.as_ref() != ROOT_LABEL {
            return Err(ReleaseError::invalid(format!(
                "spine path must start at root '{}', found '{}'",
                ROOT_LABEL,
                head.as_ref()
            )));
        }
        self.check_level(rest.len())?;

        let mut current = NodeId::ROOT;
        for (offset, label) in rest.iter().enumerate() {
            let level = offset + 1;
            current = self
                .children_of(level - 1, current)?
                .iter()
                .copied()
                .find(|id| self.tree.nodes[id.index()].label == label.as_ref())
                .ok_or_else(|| ReleaseError::NotFound {
                    level,
                    node: label.as_ref().to_string(),
                })?;
        }
        Ok(current)
    }
}
