use conode_crypto::{CollectiveSignature, Hash256};
use conode_onet::Roster;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{SkipchainError, SkipchainResult};

pub type SkipBlockId = Hash256;

/// Names a verification function that every signer runs on a new block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VerifierId(pub Hash256);

impl VerifierId {
    pub fn from_name(name: &str) -> Self {
        VerifierId(Hash256::from_parts(&[b"skipchain-verifier:", name.as_bytes()]))
    }

    /// Structural checks shared by every chain.
    pub fn base() -> Self {
        Self::from_name("base")
    }
}

// ==================== FORWARD LINKS ====================

/// Signed pointer from a block to a later block of the same chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardLink {
    pub from: SkipBlockId,
    pub to: SkipBlockId,
    /// Set when the target block changes the roster
    pub new_roster: Option<Roster>,
    pub signature: CollectiveSignature,
}

impl ForwardLink {
    /// Message the from-roster signs for this link.
    pub fn message(from: &SkipBlockId, to: &SkipBlockId, new_roster: Option<&Roster>) -> Hash256 {
        let roster_id = new_roster.map(|r| r.id).unwrap_or_default();
        Hash256::from_parts(&[b"forwardlink", from.as_ref(), to.as_ref(), roster_id.as_ref()])
    }

    pub fn hash(&self) -> Hash256 {
        Self::message(&self.from, &self.to, self.new_roster.as_ref())
    }

    /// Checks the signature against the roster of the from-block.
    pub fn verify(&self, roster: &Roster) -> SkipchainResult<()> {
        if let Some(new_roster) = &self.new_roster {
            if !new_roster.is_consistent() {
                return Err(SkipchainError::InvalidLink("inconsistent new roster".into()));
            }
        }
        self.signature
            .verify(&roster.publics(), self.hash().as_ref(), roster.threshold())
            .map_err(SkipchainError::from)
    }
}

// ==================== SKIP BLOCK ====================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipBlock {
    /// Position in the chain, genesis is 0
    pub index: u64,

    /// Number of link levels of this block
    pub height: u32,

    pub max_height: u32,

    /// A block reaches level h when its index is a multiple of base^h
    pub base_height: u32,

    /// One hash per level, pointing to the closest earlier block of that level
    pub back_links: Vec<SkipBlockId>,

    pub verifiers: Vec<VerifierId>,

    /// Identifier of the chain; `None` on the genesis block itself
    pub genesis: Option<SkipBlockId>,

    pub data: Vec<u8>,

    pub roster: Roster,

    pub hash: SkipBlockId,

    /// Level i links to the next block of height > i, filled in later
    pub forward_links: Vec<ForwardLink>,
}

impl SkipBlock {
    /// Template for a new chain or for a proposal on top of an existing one;
    /// index, height and links are filled in when the block is stored.
    pub fn new(roster: Roster, base_height: u32, max_height: u32, verifiers: Vec<VerifierId>, data: Vec<u8>) -> Self {
        let mut block = SkipBlock {
            index: 0,
            height: max_height.max(1),
            max_height: max_height.max(1),
            base_height,
            back_links: Vec::new(),
            verifiers,
            genesis: None,
            data,
            roster,
            hash: Hash256::ZERO,
            forward_links: Vec::new(),
        };
        block.update_hash();
        block
    }

    /// Height of the block at `index`.
    pub fn height_for_index(index: u64, base_height: u32, max_height: u32) -> u32 {
        let mut height = 1u32;
        while height < max_height {
            match u64::from(base_height).checked_pow(height) {
                Some(m) if m > 0 && index % m == 0 => height += 1,
                _ => break,
            }
        }
        height
    }

    pub fn compute_hash(&self) -> SkipBlockId {
        let mut h = Sha256::new();
        h.update(self.index.to_le_bytes());
        h.update(self.height.to_le_bytes());
        h.update(self.max_height.to_le_bytes());
        h.update(self.base_height.to_le_bytes());
        h.update((self.back_links.len() as u64).to_le_bytes());
        for bl in &self.back_links {
            h.update(bl.as_bytes());
        }
        h.update((self.verifiers.len() as u64).to_le_bytes());
        for v in &self.verifiers {
            h.update(v.0.as_bytes());
        }
        match &self.genesis {
            Some(g) => {
                h.update([1u8]);
                h.update(g.as_bytes());
            }
            None => h.update([0u8]),
        }
        h.update((self.data.len() as u64).to_le_bytes());
        h.update(&self.data);
        h.update(self.roster.id.as_bytes());
        Hash256(h.finalize().into())
    }

    pub fn update_hash(&mut self) {
        self.hash = self.compute_hash();
    }

    pub fn is_genesis(&self) -> bool {
        self.index == 0 && self.genesis.is_none()
    }

    pub fn skipchain_id(&self) -> SkipBlockId {
        self.genesis.unwrap_or(self.hash)
    }

    /// Checks the fields a signer can verify without any other block.
    pub fn verify_structure(&self) -> SkipchainResult<()> {
        if self.hash != self.compute_hash() {
            return Err(SkipchainError::InvalidBlock(format!("hash mismatch for {}", self.hash)));
        }
        if self.roster.is_empty() || !self.roster.is_consistent() {
            return Err(SkipchainError::InvalidBlock("inconsistent roster".into()));
        }
        if self.height == 0 || self.height > self.max_height {
            return Err(SkipchainError::InvalidBlock(format!("height {} out of range", self.height)));
        }
        if self.index > 0 {
            if self.genesis.is_none() {
                return Err(SkipchainError::InvalidBlock("missing genesis id".into()));
            }
            if self.back_links.len() != self.height as usize {
                return Err(SkipchainError::InvalidBlock("one back link per level required".into()));
            }
            let expected = Self::height_for_index(self.index, self.base_height, self.max_height);
            if self.height != expected {
                return Err(SkipchainError::InvalidBlock(format!(
                    "height {} but index {} requires {}",
                    self.height, self.index, expected
                )));
            }
        }
        Ok(())
    }

    /// Verifies every forward link of this block against its roster.
    pub fn verify_forward_links(&self) -> SkipchainResult<()> {
        for link in &self.forward_links {
            if link.from != self.hash {
                return Err(SkipchainError::InvalidLink(format!("link from {} stored on {}", link.from, self.hash)));
            }
            link.verify(&self.roster)?;
        }
        Ok(())
    }

    /// Appends the link for `level`; lower levels must already be present.
    pub fn add_forward_link(&mut self, level: usize, link: ForwardLink) -> SkipchainResult<()> {
        if level >= self.height as usize {
            return Err(SkipchainError::InvalidLink(format!("level {} above height {}", level, self.height)));
        }
        if self.forward_links.len() != level {
            return Err(SkipchainError::NotLatest(self.hash));
        }
        self.forward_links.push(link);
        Ok(())
    }
}

/// Checks a chain of blocks as returned by an update-chain query: every
/// block is well formed and linked to the next one by a valid signature of
/// its roster.
pub fn verify_update_chain(blocks: &[SkipBlock]) -> SkipchainResult<()> {
    for block in blocks {
        block.verify_structure()?;
    }
    for pair in blocks.windows(2) {
        let (from, to) = (&pair[0], &pair[1]);
        let link = from
            .forward_links
            .iter()
            .find(|l| l.to == to.hash)
            .ok_or_else(|| SkipchainError::InvalidLink(format!("no link {} -> {}", from.hash, to.hash)))?;
        link.verify(&from.roster)?;
        match &link.new_roster {
            Some(r) if r.id != to.roster.id => {
                return Err(SkipchainError::InvalidLink("link roster differs from block roster".into()))
            }
            None if from.roster.id != to.roster.id => {
                return Err(SkipchainError::InvalidLink("roster change without new roster".into()))
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use conode_crypto::KeyPair;
    use conode_onet::ServerIdentity;

    fn roster(n: usize) -> Roster {
        Roster::new(
            (0..n)
                .map(|i| ServerIdentity::new(KeyPair::generate().public(), format!("local://{}", i)))
                .collect(),
        )
    }

    #[test]
    fn test_height_for_index() {
        assert_eq!(SkipBlock::height_for_index(0, 4, 3), 3);
        assert_eq!(SkipBlock::height_for_index(1, 4, 3), 1);
        assert_eq!(SkipBlock::height_for_index(4, 4, 3), 2);
        assert_eq!(SkipBlock::height_for_index(16, 4, 3), 3);
        assert_eq!(SkipBlock::height_for_index(64, 4, 3), 3);
        assert_eq!(SkipBlock::height_for_index(6, 2, 8), 2);
        assert_eq!(SkipBlock::height_for_index(5, 1, 4), 4);
        assert_eq!(SkipBlock::height_for_index(5, 0, 4), 1);
    }

    #[test]
    fn test_hash_covers_data_not_links() {
        let mut b = SkipBlock::new(roster(3), 2, 4, vec![VerifierId::base()], b"data".to_vec());
        let h = b.hash;
        assert_eq!(b.compute_hash(), h);
        b.data = b"other".to_vec();
        assert_ne!(b.compute_hash(), h);
        b.data = b"data".to_vec();
        b.forward_links.clear();
        assert_eq!(b.compute_hash(), h);
        assert!(b.verify_structure().is_ok());
    }

    #[test]
    fn test_tampered_block_fails_structure() {
        let mut b = SkipBlock::new(roster(3), 2, 4, vec![], vec![]);
        b.index = 3;
        assert!(b.verify_structure().is_err());
    }

    #[test]
    fn test_link_message_depends_on_roster() {
        let r = roster(2);
        let a = Hash256::digest(b"a");
        let b = Hash256::digest(b"b");
        assert_ne!(ForwardLink::message(&a, &b, None), ForwardLink::message(&a, &b, Some(&r)));
    }
}
