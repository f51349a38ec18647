//! n-ary communication trees over a roster.
//!
//! Layout is breadth-first over roster order: entry 0 is the root, entry `i`
//! has children `i*b+1 ..= i*b+b`. The whole tree is serializable so it can
//! ride along inside protocol messages; a node that has never seen an
//! instance learns its place from the tree in the first message.

use collective_protocol::{Roster, ServerIdentity};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Random per-tree identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TreeId(pub u64);

impl TreeId {
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for TreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl fmt::Debug for TreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TreeId({:016x})", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeNode {
    pub server: ServerIdentity,
    pub children: Vec<TreeNode>,
}

impl TreeNode {
    fn size(&self) -> usize {
        1 + self.children.iter().map(TreeNode::size).sum::<usize>()
    }

    fn depth(&self) -> usize {
        1 + self.children.iter().map(TreeNode::depth).max().unwrap_or(0)
    }

    fn find(&self, address: &str) -> Option<&TreeNode> {
        if self.server.address == address {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(address))
    }

    fn parent_of(&self, address: &str) -> Option<&TreeNode> {
        if self.children.iter().any(|c| c.server.address == address) {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.parent_of(address))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tree {
    pub id: TreeId,
    pub roster: Roster,
    pub root: TreeNode,
}

impl Tree {
    /// Build a tree with at most `branching` children per node. A branching
    /// factor of zero is treated as one (a chain). `None` for an empty
    /// roster.
    pub fn nary(roster: &Roster, branching: usize) -> Option<Self> {
        if roster.is_empty() {
            return None;
        }
        let branching = branching.max(1);
        Some(Self {
            id: TreeId::random(),
            roster: roster.clone(),
            root: build(roster, branching, 0),
        })
    }

    pub fn root_identity(&self) -> &ServerIdentity {
        &self.root.server
    }

    pub fn is_root(&self, address: &str) -> bool {
        self.root.server.address == address
    }

    pub fn contains(&self, address: &str) -> bool {
        self.find(address).is_some()
    }

    pub fn find(&self, address: &str) -> Option<&TreeNode> {
        self.root.find(address)
    }

    pub fn parent_of(&self, address: &str) -> Option<&ServerIdentity> {
        self.root.parent_of(address).map(|n| &n.server)
    }

    /// Children of `address`; empty for leaves and for unknown addresses.
    pub fn children_of(&self, address: &str) -> Vec<&ServerIdentity> {
        self.find(address)
            .map(|n| n.children.iter().map(|c| &c.server).collect())
            .unwrap_or_default()
    }

    pub fn size(&self) -> usize {
        self.root.size()
    }

    pub fn depth(&self) -> usize {
        self.root.depth()
    }
}

fn build(roster: &Roster, branching: usize, index: usize) -> TreeNode {
    let children = (1..=branching)
        .map(|k| index * branching + k)
        .filter(|&child| child < roster.len())
        .map(|child| build(roster, branching, child))
        .collect();
    TreeNode {
        server: roster.list[index].clone(),
        children,
    }
}
