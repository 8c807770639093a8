//! Self-contained proof that a key is (or is not) in a ledger's state.
//!
//! A client that only knows the ledger id checks, in order: the genesis
//! block hashes to that id, the forward links lead from the genesis to the
//! latest block with every link signed by the roster in charge at that
//! point, the latest block's header commits to the trie root, and the trie
//! path for the key hashes up to that root.

use conode_skipchain::{ForwardLink, SkipBlock, SkipBlockDb, SkipBlockId};
use serde::{Deserialize, Serialize};

use crate::block::BlockData;
use crate::instruction::InstanceId;
use crate::state::StateEntry;
use crate::trie::{Node, TrieProof};
use crate::{ByzCoinError, ByzCoinResult};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    pub inclusion: TrieProof,
    pub latest: SkipBlock,
    pub genesis: SkipBlock,
    pub links: Vec<ForwardLink>,
}

impl Proof {
    /// Assembles a proof for `inclusion` against `latest`, following the
    /// longest links stored in `db` that do not jump past `latest`.
    pub fn new(inclusion: TrieProof, latest: SkipBlock, db: &SkipBlockDb) -> ByzCoinResult<Self> {
        let genesis = db.get_or_err(&latest.skipchain_id())?;
        let mut links = Vec::new();
        let mut cur = genesis.clone();
        while cur.hash != latest.hash {
            let next = cur
                .forward_links
                .iter()
                .rev()
                .filter_map(|l| db.get(&l.to).map(|b| (l, b)))
                .find(|(_, b)| b.index <= latest.index);
            match next {
                Some((link, block)) => {
                    links.push(link.clone());
                    cur = block;
                }
                None => {
                    return Err(ByzCoinError::InvalidProof(format!(
                        "no forward link from block {} towards {}",
                        cur.index, latest.index
                    )))
                }
            }
        }
        Ok(Proof {
            inclusion,
            latest,
            genesis,
            links,
        })
    }

    pub fn verify(&self, skipchain_id: &SkipBlockId, key: &InstanceId) -> ByzCoinResult<()> {
        if self.genesis.hash != *skipchain_id || self.genesis.compute_hash() != self.genesis.hash {
            return Err(ByzCoinError::InvalidProof("genesis does not match the ledger id".into()));
        }

        let mut roster = &self.genesis.roster;
        let mut cur = self.genesis.hash;
        for link in &self.links {
            if link.from != cur {
                return Err(ByzCoinError::InvalidProof("forward links are not contiguous".into()));
            }
            link.verify(roster)
                .map_err(|e| ByzCoinError::InvalidProof(format!("forward link: {}", e)))?;
            if let Some(new_roster) = &link.new_roster {
                roster = new_roster;
            }
            cur = link.to;
        }
        if cur != self.latest.hash || self.latest.compute_hash() != self.latest.hash {
            return Err(ByzCoinError::InvalidProof("links do not end at the latest block".into()));
        }

        let data = BlockData::decode(&self.latest)?;
        if data.header.trie_root != self.inclusion.root() {
            return Err(ByzCoinError::InvalidProof("trie root differs from the block header".into()));
        }
        self.inclusion
            .verify(&data.header.trie_root, key.as_ref())
            .map_err(|e| ByzCoinError::InvalidProof(e.to_string()))
    }

    /// Whether the proof shows `key` to be present.
    pub fn matches(&self, key: &InstanceId) -> bool {
        self.inclusion.matches(key.as_ref())
    }

    /// Key and entry of the leaf the proof ends on, if it ends on one.
    pub fn key_value(&self) -> ByzCoinResult<Option<(InstanceId, StateEntry)>> {
        match &self.inclusion.terminal {
            Node::Leaf { key, value, .. } => {
                let id = InstanceId::from_slice(key).map_err(|e| ByzCoinError::InvalidProof(e.to_string()))?;
                Ok(Some((id, bincode::deserialize(value)?)))
            }
            _ => Ok(None),
        }
    }

    /// Entry stored under `key`; only meaningful after [`Proof::verify`].
    pub fn entry(&self, key: &InstanceId) -> ByzCoinResult<Option<StateEntry>> {
        match self.inclusion.value(key.as_ref()) {
            Some(bytes) => Ok(Some(bincode::deserialize(bytes)?)),
            None => Ok(None),
        }
    }
}
