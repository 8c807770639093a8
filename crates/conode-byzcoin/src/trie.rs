//! Authenticated binary trie.
//!
//! A key is placed along the bits of `sha256(nonce || key)`. Interior nodes
//! hash their two children, leaves and empty nodes hash their position
//! (prefix) together with the nonce, so a path from the root to the node
//! where a key belongs proves either its presence or its absence.
//!
//! The shape only depends on the set of keys: inserting splits a leaf until
//! the two keys diverge, removing collapses interiors left with a single
//! leaf.

use std::collections::HashMap;

use conode_crypto::Hash256;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::TrieError;

pub type TrieResult<T> = Result<T, TrieError>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Node {
    Empty { prefix: Vec<bool> },
    Leaf { prefix: Vec<bool>, key: Vec<u8>, value: Vec<u8> },
    Interior { left: Hash256, right: Hash256 },
}

impl Node {
    pub fn hash(&self, nonce: &[u8]) -> Hash256 {
        let mut h = Sha256::new();
        match self {
            Node::Empty { prefix } => {
                h.update([0u8]);
                h.update(nonce);
                h.update(pack_bits(prefix));
                h.update((prefix.len() as u32).to_le_bytes());
            }
            Node::Leaf { prefix, key, value } => {
                h.update([2u8]);
                h.update(nonce);
                h.update(pack_bits(prefix));
                h.update((prefix.len() as u32).to_le_bytes());
                h.update((key.len() as u32).to_le_bytes());
                h.update(key);
                h.update(value);
            }
            Node::Interior { left, right } => {
                h.update([1u8]);
                h.update(left.as_bytes());
                h.update(right.as_bytes());
            }
        }
        Hash256(h.finalize().into())
    }
}

fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut out = vec![0u8; (bits.len() + 7) / 8];
    for (i, bit) in bits.iter().enumerate() {
        if *bit {
            out[i / 8] |= 0x80 >> (i % 8);
        }
    }
    out
}

/// Bits of `sha256(nonce || key)`, most significant first.
pub fn key_path(nonce: &[u8], key: &[u8]) -> Vec<bool> {
    let digest = Hash256::from_parts(&[nonce, key]);
    digest
        .as_bytes()
        .iter()
        .flat_map(|b| (0..8).map(move |i| b & (0x80 >> i) != 0))
        .collect()
}

#[derive(Clone, Debug)]
pub struct Trie {
    nonce: Vec<u8>,
    root: Hash256,
    nodes: HashMap<Hash256, Node>,
}

impl Trie {
    pub fn new(nonce: &[u8]) -> Self {
        let mut trie = Trie {
            nonce: nonce.to_vec(),
            root: Hash256::ZERO,
            nodes: HashMap::new(),
        };
        trie.root = trie.put(Node::Empty { prefix: Vec::new() });
        trie
    }

    pub fn nonce(&self) -> &[u8] {
        &self.nonce
    }

    pub fn root(&self) -> Hash256 {
        self.root
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    fn put(&mut self, node: Node) -> Hash256 {
        let hash = node.hash(&self.nonce);
        self.nodes.insert(hash, node);
        hash
    }

    fn node(&self, hash: &Hash256) -> TrieResult<&Node> {
        self.nodes.get(hash).ok_or(TrieError::MissingNode(*hash))
    }

    fn take(&mut self, hash: &Hash256) -> TrieResult<Node> {
        self.nodes.remove(hash).ok_or(TrieError::MissingNode(*hash))
    }

    pub fn get(&self, key: &[u8]) -> TrieResult<Option<Vec<u8>>> {
        let path = key_path(&self.nonce, key);
        let mut cur = self.root;
        for bit in &path {
            match self.node(&cur)? {
                Node::Interior { left, right } => cur = if *bit { *right } else { *left },
                Node::Leaf { key: k, value, .. } if k == key => return Ok(Some(value.clone())),
                _ => return Ok(None),
            }
        }
        Ok(None)
    }

    pub fn set(&mut self, key: &[u8], value: &[u8]) -> TrieResult<()> {
        let path = key_path(&self.nonce, key);
        self.root = self.insert_at(self.root, 0, &path, key.to_vec(), value.to_vec())?;
        Ok(())
    }

    fn insert_at(&mut self, at: Hash256, depth: usize, path: &[bool], key: Vec<u8>, value: Vec<u8>) -> TrieResult<Hash256> {
        match self.take(&at)? {
            Node::Empty { prefix } => Ok(self.put(Node::Leaf { prefix, key, value })),
            Node::Leaf { prefix, key: k, .. } if k == key => Ok(self.put(Node::Leaf { prefix, key, value })),
            Node::Leaf { prefix, key: k, value: v } => {
                if depth >= path.len() {
                    return Err(TrieError::InvalidProof("key paths collide".into()));
                }
                let mut left_prefix = prefix.clone();
                left_prefix.push(false);
                let mut right_prefix = prefix;
                right_prefix.push(true);
                let left = self.put(Node::Empty { prefix: left_prefix });
                let right = self.put(Node::Empty { prefix: right_prefix });
                let interior = self.put(Node::Interior { left, right });
                let other = key_path(&self.nonce, &k);
                let interior = self.insert_at(interior, depth, &other, k, v)?;
                self.insert_at(interior, depth, path, key, value)
            }
            Node::Interior { left, right } => {
                if path[depth] {
                    let right = self.insert_at(right, depth + 1, path, key, value)?;
                    Ok(self.put(Node::Interior { left, right }))
                } else {
                    let left = self.insert_at(left, depth + 1, path, key, value)?;
                    Ok(self.put(Node::Interior { left, right }))
                }
            }
        }
    }

    /// Removes `key`; returns whether it was present.
    pub fn delete(&mut self, key: &[u8]) -> TrieResult<bool> {
        if self.get(key)?.is_none() {
            return Ok(false);
        }
        let path = key_path(&self.nonce, key);
        self.root = self.remove_at(self.root, 0, &path, key)?;
        Ok(true)
    }

    fn remove_at(&mut self, at: Hash256, depth: usize, path: &[bool], key: &[u8]) -> TrieResult<Hash256> {
        match self.take(&at)? {
            Node::Leaf { prefix, key: k, .. } if k == key => Ok(self.put(Node::Empty { prefix })),
            Node::Interior { left, right } => {
                let (left, right) = if path[depth] {
                    (left, self.remove_at(right, depth + 1, path, key)?)
                } else {
                    (self.remove_at(left, depth + 1, path, key)?, right)
                };
                self.compact(left, right, &path[..depth])
            }
            other => Ok(self.put(other)),
        }
    }

    /// Collapses an interior whose children are an empty node and at most
    /// one leaf.
    fn compact(&mut self, left: Hash256, right: Hash256, prefix: &[bool]) -> TrieResult<Hash256> {
        let collapse = match (self.node(&left)?, self.node(&right)?) {
            (Node::Empty { .. }, Node::Empty { .. }) => Some(None),
            (Node::Empty { .. }, Node::Leaf { .. }) => Some(Some(right)),
            (Node::Leaf { .. }, Node::Empty { .. }) => Some(Some(left)),
            _ => None,
        };
        match collapse {
            None => Ok(self.put(Node::Interior { left, right })),
            Some(leaf) => {
                let moved = match leaf {
                    Some(hash) => match self.take(&hash)? {
                        Node::Leaf { key, value, .. } => Node::Leaf {
                            prefix: prefix.to_vec(),
                            key,
                            value,
                        },
                        other => other,
                    },
                    None => Node::Empty {
                        prefix: prefix.to_vec(),
                    },
                };
                self.nodes.remove(&left);
                self.nodes.remove(&right);
                Ok(self.put(moved))
            }
        }
    }

    pub fn get_proof(&self, key: &[u8]) -> TrieResult<TrieProof> {
        let path = key_path(&self.nonce, key);
        let mut interiors = Vec::new();
        let mut cur = self.root;
        loop {
            match self.node(&cur)? {
                Node::Interior { left, right } => {
                    interiors.push((*left, *right));
                    cur = if path[interiors.len() - 1] { *right } else { *left };
                }
                terminal => {
                    return Ok(TrieProof {
                        nonce: self.nonce.clone(),
                        interiors,
                        terminal: terminal.clone(),
                    })
                }
            }
        }
    }
}

/// Path from the root to the node where a key belongs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrieProof {
    pub nonce: Vec<u8>,
    pub interiors: Vec<(Hash256, Hash256)>,
    pub terminal: Node,
}

impl TrieProof {
    pub fn root(&self) -> Hash256 {
        match self.interiors.first() {
            Some((left, right)) => Node::Interior {
                left: *left,
                right: *right,
            }
            .hash(&self.nonce),
            None => self.terminal.hash(&self.nonce),
        }
    }

    /// Checks that the path hashes up to `root` and ends where `key` belongs.
    pub fn verify(&self, root: &Hash256, key: &[u8]) -> TrieResult<()> {
        let path = key_path(&self.nonce, key);
        let depth = self.interiors.len();
        if depth > path.len() {
            return Err(TrieError::InvalidProof("path longer than the key".into()));
        }
        let prefix = match &self.terminal {
            Node::Empty { prefix } | Node::Leaf { prefix, .. } => prefix,
            Node::Interior { .. } => return Err(TrieError::InvalidProof("proof ends on an interior".into())),
        };
        if prefix[..] != path[..depth] {
            return Err(TrieError::InvalidProof("terminal is not on the key path".into()));
        }
        let mut expected = self.terminal.hash(&self.nonce);
        for (i, (left, right)) in self.interiors.iter().enumerate().rev() {
            let child = if path[i] { right } else { left };
            if *child != expected {
                return Err(TrieError::InvalidProof(format!("hash mismatch at depth {}", i)));
            }
            expected = Node::Interior {
                left: *left,
                right: *right,
            }
            .hash(&self.nonce);
        }
        if expected != *root {
            return Err(TrieError::InvalidProof("root mismatch".into()));
        }
        Ok(())
    }

    /// Value of `key` if the proof shows its presence, `None` if it shows
    /// its absence. Only meaningful after [`TrieProof::verify`].
    pub fn value(&self, key: &[u8]) -> Option<&[u8]> {
        match &self.terminal {
            Node::Leaf { key: k, value, .. } if k == key => Some(value),
            _ => None,
        }
    }

    pub fn matches(&self, key: &[u8]) -> bool {
        self.value(key).is_some()
    }
}
