use conode_crypto::Hash256;
use serde::{Deserialize, Serialize};

use crate::identity::{Roster, ServerId, ServerIdentity};
use crate::{OnetError, OnetResult};

/// Communication tree over a roster.
///
/// Nodes are addressed by their roster index. The root comes first in
/// traversal order, followed by the remaining members in roster order; the
/// node at position `p` has children at positions `p*b+1 ..= p*b+b`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tree {
    pub roster: Roster,
    pub root: usize,
    pub branching: usize,
}

impl Tree {
    /// `branching == 0` builds a star rooted at `root`.
    pub fn new(roster: Roster, root: usize, branching: usize) -> OnetResult<Self> {
        if roster.is_empty() {
            return Err(OnetError::InvalidTree("empty roster".into()));
        }
        if root >= roster.len() {
            return Err(OnetError::InvalidTree(format!(
                "root {} outside roster of {}",
                root,
                roster.len()
            )));
        }
        let branching = if branching == 0 {
            roster.len().saturating_sub(1).max(1)
        } else {
            branching
        };
        Ok(Tree {
            roster,
            root,
            branching,
        })
    }

    pub fn star(roster: Roster, root: usize) -> OnetResult<Self> {
        Self::new(roster, root, 0)
    }

    /// Tree rooted at the server `root_id`.
    pub fn rooted_at(roster: Roster, root_id: &ServerId, branching: usize) -> OnetResult<Self> {
        let root = roster
            .search(root_id)
            .map(|(i, _)| i)
            .ok_or(OnetError::NotInTree(*root_id))?;
        Self::new(roster, root, branching)
    }

    pub fn id(&self) -> Hash256 {
        Hash256::from_parts(&[
            self.roster.id.as_ref(),
            &(self.root as u64).to_le_bytes(),
            &(self.branching as u64).to_le_bytes(),
        ])
    }

    pub fn size(&self) -> usize {
        self.roster.len()
    }

    fn order(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.size());
        order.push(self.root);
        order.extend((0..self.size()).filter(|&i| i != self.root));
        order
    }

    fn position(&self, index: usize) -> Option<usize> {
        self.order().iter().position(|&i| i == index)
    }

    pub fn is_root(&self, index: usize) -> bool {
        index == self.root
    }

    pub fn parent(&self, index: usize) -> Option<usize> {
        let pos = self.position(index)?;
        if pos == 0 {
            return None;
        }
        Some(self.order()[(pos - 1) / self.branching])
    }

    pub fn children(&self, index: usize) -> Vec<usize> {
        let Some(pos) = self.position(index) else {
            return Vec::new();
        };
        let order = self.order();
        let first = pos * self.branching + 1;
        (first..first + self.branching)
            .filter_map(|p| order.get(p).copied())
            .collect()
    }

    pub fn is_leaf(&self, index: usize) -> bool {
        self.children(index).is_empty()
    }

    /// Height of the subtree below `index`; leaves have depth 0.
    pub fn subtree_depth(&self, index: usize) -> usize {
        self.children(index)
            .into_iter()
            .map(|c| 1 + self.subtree_depth(c))
            .max()
            .unwrap_or(0)
    }

    /// `index` and all its descendants.
    pub fn subtree(&self, index: usize) -> Vec<usize> {
        let mut out = vec![index];
        for c in self.children(index) {
            out.extend(self.subtree(c));
        }
        out
    }

    pub fn server(&self, index: usize) -> Option<&ServerIdentity> {
        self.roster.list.get(index)
    }

    pub fn index_of(&self, id: &ServerId) -> Option<usize> {
        self.roster.search(id).map(|(i, _)| i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conode_crypto::KeyPair;

    fn roster(n: usize) -> Roster {
        Roster::new(
            (0..n)
                .map(|i| ServerIdentity::new(KeyPair::generate().public(), format!("local://{}", i)))
                .collect(),
        )
    }

    #[test]
    fn test_star() {
        let tree = Tree::star(roster(5), 2).unwrap();
        assert_eq!(tree.children(2), vec![0, 1, 3, 4]);
        assert_eq!(tree.parent(4), Some(2));
        assert_eq!(tree.parent(2), None);
        assert!(tree.is_leaf(0));
        assert_eq!(tree.subtree_depth(2), 1);
    }

    #[test]
    fn test_binary_tree() {
        let tree = Tree::new(roster(7), 0, 2).unwrap();
        assert_eq!(tree.children(0), vec![1, 2]);
        assert_eq!(tree.children(1), vec![3, 4]);
        assert_eq!(tree.children(2), vec![5, 6]);
        assert_eq!(tree.parent(6), Some(2));
        assert_eq!(tree.subtree_depth(0), 2);
        let mut sub = tree.subtree(1);
        sub.sort();
        assert_eq!(sub, vec![1, 3, 4]);
    }

    #[test]
    fn test_single_node_and_bad_root() {
        let tree = Tree::star(roster(1), 0).unwrap();
        assert!(tree.children(0).is_empty());
        assert!(Tree::star(roster(2), 2).is_err());
    }
}
