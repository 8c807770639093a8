//! Arena of skipblocks keyed by hash, plus the link slots this node
//! agreed to sign.
//!
//! Blocks never point at each other directly; links are hashes resolved
//! through this store, so adding a forward link is an in-place update of
//! one entry. When opened on a sled database every mutation is written
//! through and the arena is rebuilt from disk on start.
//!
//! A link slot is one level of one block's forward links. Announced
//! proposals only reserve a slot, and a reservation expires. Once a
//! response share for a target left the node the slot is locked to that
//! target for good, on disk too.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};

use crate::block::{ForwardLink, SkipBlock, SkipBlockId};
use crate::{SkipchainError, SkipchainResult};

const TREE_NAME: &str = "skipblocks";
const SLOTS_TREE_NAME: &str = "link_slots";

type SlotKey = (SkipBlockId, usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Slot {
    Reserved { target: SkipBlockId, until: Instant },
    Locked(SkipBlockId),
}

pub struct SkipBlockDb {
    blocks: RwLock<HashMap<SkipBlockId, SkipBlock>>,
    slots: Mutex<HashMap<SlotKey, Slot>>,
    disk: Option<sled::Tree>,
    slots_disk: Option<sled::Tree>,
}

fn slot_key(from: &SkipBlockId, level: usize) -> Vec<u8> {
    let mut key = from.as_bytes().to_vec();
    key.extend_from_slice(&(level as u32).to_be_bytes());
    key
}

impl SkipBlockDb {
    pub fn in_memory() -> Self {
        SkipBlockDb {
            blocks: RwLock::new(HashMap::new()),
            slots: Mutex::new(HashMap::new()),
            disk: None,
            slots_disk: None,
        }
    }

    /// Opens the block tree of `db` and loads every stored block and every
    /// locked link slot.
    pub fn open(db: &sled::Db) -> SkipchainResult<Self> {
        let tree = db.open_tree(TREE_NAME)?;
        let mut blocks = HashMap::new();
        for entry in tree.iter() {
            let (_, value) = entry?;
            let block: SkipBlock = bincode::deserialize(&value)?;
            blocks.insert(block.hash, block);
        }
        let slots_tree = db.open_tree(SLOTS_TREE_NAME)?;
        let mut slots = HashMap::new();
        for entry in slots_tree.iter() {
            let (key, value) = entry?;
            if key.len() != 36 {
                warn!("skipping link slot with a key of {} bytes", key.len());
                continue;
            }
            let from = SkipBlockId::from_slice(&key[..32])?;
            let mut level = [0u8; 4];
            level.copy_from_slice(&key[32..]);
            let target = SkipBlockId::from_slice(&value)?;
            slots.insert((from, u32::from_be_bytes(level) as usize), Slot::Locked(target));
        }
        info!("loaded {} skipblocks and {} locked link slots from disk", blocks.len(), slots.len());
        Ok(SkipBlockDb {
            blocks: RwLock::new(blocks),
            slots: Mutex::new(slots),
            disk: Some(tree),
            slots_disk: Some(slots_tree),
        })
    }

    // ==================== LINK SLOTS ====================

    /// Reserves forward link `level` of `from` for `target` during `ttl`.
    /// A live reservation for another target gives way only to a smaller
    /// target hash, so nodes seeing the same competing proposals settle on
    /// the same one.
    pub fn reserve_link(&self, from: &SkipBlockId, level: usize, target: &SkipBlockId, ttl: Duration) -> SkipchainResult<()> {
        let mut slots = self.slots.lock();
        let now = Instant::now();
        match slots.get(&(*from, level)) {
            Some(Slot::Locked(held)) if held != target => return Err(SkipchainError::NotLatest(*from)),
            Some(Slot::Locked(_)) => return Ok(()),
            Some(Slot::Reserved { target: held, until }) if held != target && *until > now && held < target => {
                return Err(SkipchainError::NotLatest(*from));
            }
            Some(Slot::Reserved { target: held, .. }) if held != target => {
                debug!("link {} of {} moves from {} to {}", level, from, held, target);
            }
            _ => {}
        }
        slots.insert(
            (*from, level),
            Slot::Reserved {
                target: *target,
                until: now + ttl,
            },
        );
        Ok(())
    }

    /// Binds the slot to `target` for good. Fails if the slot went to
    /// another target in the meantime.
    pub fn lock_link(&self, from: &SkipBlockId, level: usize, target: &SkipBlockId) -> SkipchainResult<()> {
        let mut slots = self.slots.lock();
        match slots.get(&(*from, level)) {
            Some(Slot::Locked(held)) if held == target => return Ok(()),
            Some(Slot::Locked(_)) => return Err(SkipchainError::NotLatest(*from)),
            Some(Slot::Reserved { target: held, until }) if held != target && *until > Instant::now() => {
                return Err(SkipchainError::NotLatest(*from));
            }
            _ => {}
        }
        if let Some(tree) = &self.slots_disk {
            tree.insert(slot_key(from, level), target.as_bytes().to_vec())?;
            tree.flush()?;
        }
        slots.insert((*from, level), Slot::Locked(*target));
        Ok(())
    }

    /// Frees a slot locked for `target`. Only for a signer whose share
    /// never left this node, i.e. the root of a failed signing run.
    pub fn release_link(&self, from: &SkipBlockId, level: usize, target: &SkipBlockId) -> SkipchainResult<()> {
        let mut slots = self.slots.lock();
        let held = match slots.get(&(*from, level)) {
            Some(Slot::Locked(held)) | Some(Slot::Reserved { target: held, .. }) => *held,
            None => return Ok(()),
        };
        if held != *target {
            return Ok(());
        }
        if let Some(tree) = &self.slots_disk {
            tree.remove(slot_key(from, level))?;
        }
        slots.remove(&(*from, level));
        Ok(())
    }

    /// Target currently holding the slot, if any.
    pub fn link_holder(&self, from: &SkipBlockId, level: usize) -> Option<SkipBlockId> {
        match self.slots.lock().get(&(*from, level)) {
            Some(Slot::Locked(held)) => Some(*held),
            Some(Slot::Reserved { target, until }) if *until > Instant::now() => Some(*target),
            _ => None,
        }
    }

    fn persist(&self, block: &SkipBlock) -> SkipchainResult<()> {
        if let Some(tree) = &self.disk {
            tree.insert(block.hash.as_bytes(), bincode::serialize(block)?)?;
        }
        Ok(())
    }

    pub fn get(&self, id: &SkipBlockId) -> Option<SkipBlock> {
        self.blocks.read().get(id).cloned()
    }

    pub fn get_or_err(&self, id: &SkipBlockId) -> SkipchainResult<SkipBlock> {
        self.get(id).ok_or(SkipchainError::UnknownBlock(*id))
    }

    pub fn contains(&self, id: &SkipBlockId) -> bool {
        self.blocks.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.read().is_empty()
    }

    /// Stores `block`, or extends the stored copy with the additional
    /// forward links it carries. Returns true when the block was new.
    pub fn store(&self, block: SkipBlock) -> SkipchainResult<bool> {
        let mut blocks = self.blocks.write();
        match blocks.get_mut(&block.hash) {
            Some(existing) => {
                let known = existing.forward_links.len();
                if block.forward_links.len() > known {
                    if block.forward_links[..known] != existing.forward_links[..] {
                        return Err(SkipchainError::InvalidLink(format!(
                            "conflicting forward links on {}",
                            block.hash
                        )));
                    }
                    existing.forward_links = block.forward_links;
                    debug!("block {} now has {} forward links", existing.hash, existing.forward_links.len());
                    self.persist(existing)?;
                }
                Ok(false)
            }
            None => {
                self.persist(&block)?;
                blocks.insert(block.hash, block);
                Ok(true)
            }
        }
    }

    /// Atomically appends `links` (block id, level, link) and stores `block`.
    /// Fails without any change if one of the levels is already taken.
    pub fn commit_links(
        &self,
        block: SkipBlock,
        links: Vec<(SkipBlockId, usize, ForwardLink)>,
    ) -> SkipchainResult<Vec<SkipBlock>> {
        let mut blocks = self.blocks.write();
        let mut updated: HashMap<SkipBlockId, SkipBlock> = HashMap::new();
        for (id, level, link) in links {
            let entry = match updated.remove(&id) {
                Some(b) => b,
                None => blocks.get(&id).cloned().ok_or(SkipchainError::UnknownBlock(id))?,
            };
            let mut entry = entry;
            entry.add_forward_link(level, link)?;
            updated.insert(id, entry);
        }
        for b in updated.values() {
            self.persist(b)?;
        }
        self.persist(&block)?;
        let out: Vec<SkipBlock> = updated.values().cloned().collect();
        for (id, b) in updated {
            blocks.insert(id, b);
        }
        blocks.insert(block.hash, block);
        Ok(out)
    }

    /// Follows the highest forward link whose target is known, starting at
    /// `from`. The result starts with `from` and ends at the latest block.
    pub fn update_chain(&self, from: &SkipBlockId) -> SkipchainResult<Vec<SkipBlock>> {
        let blocks = self.blocks.read();
        let mut cur = blocks.get(from).cloned().ok_or(SkipchainError::UnknownBlock(*from))?;
        let mut chain = Vec::new();
        loop {
            let next = cur
                .forward_links
                .iter()
                .rev()
                .find_map(|l| blocks.get(&l.to))
                .cloned();
            chain.push(cur);
            match next {
                Some(b) => cur = b,
                None => break,
            }
        }
        Ok(chain)
    }

    pub fn latest(&self, chain: &SkipBlockId) -> SkipchainResult<SkipBlock> {
        self.update_chain(chain)?
            .pop()
            .ok_or(SkipchainError::UnknownBlock(*chain))
    }

    /// Walks from the genesis towards `index`, taking the longest jump that
    /// does not overshoot it.
    pub fn block_by_index(&self, genesis: &SkipBlockId, index: u64) -> SkipchainResult<SkipBlock> {
        let blocks = self.blocks.read();
        let mut cur = blocks.get(genesis).ok_or(SkipchainError::UnknownBlock(*genesis))?;
        while cur.index < index {
            let next = cur
                .forward_links
                .iter()
                .rev()
                .filter_map(|l| blocks.get(&l.to))
                .find(|b| b.index <= index);
            match next {
                Some(b) => cur = b,
                None => {
                    return Err(SkipchainError::InvalidBlock(format!(
                        "no block with index {} in chain {}",
                        index, genesis
                    )))
                }
            }
        }
        Ok(cur.clone())
    }

    /// Latest block of every stored chain.
    pub fn all_latest(&self) -> Vec<SkipBlock> {
        let genesis_ids: Vec<SkipBlockId> = self
            .blocks
            .read()
            .values()
            .filter(|b| b.is_genesis())
            .map(|b| b.hash)
            .collect();
        genesis_ids
            .iter()
            .filter_map(|id| self.latest(id).ok())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conode_crypto::KeyPair;
    use conode_onet::{Roster, ServerIdentity};

    fn genesis() -> SkipBlock {
        let roster = Roster::new(vec![ServerIdentity::new(KeyPair::generate().public(), "local://0")]);
        SkipBlock::new(roster, 2, 3, vec![], b"genesis".to_vec())
    }

    #[test]
    fn test_store_is_idempotent() {
        let db = SkipBlockDb::in_memory();
        let g = genesis();
        assert!(db.store(g.clone()).unwrap());
        assert!(!db.store(g.clone()).unwrap());
        assert_eq!(db.len(), 1);
        assert_eq!(db.latest(&g.hash).unwrap().hash, g.hash);
        assert_eq!(db.all_latest().len(), 1);
    }

    #[test]
    fn test_unknown_block() {
        let db = SkipBlockDb::in_memory();
        let id = SkipBlockId::digest(b"nothing");
        assert!(matches!(db.update_chain(&id), Err(SkipchainError::UnknownBlock(_))));
    }

    #[test]
    fn test_persisted_blocks_reload() {
        let disk = sled::Config::new().temporary(true).open().unwrap();
        let g = genesis();
        {
            let db = SkipBlockDb::open(&disk).unwrap();
            db.store(g.clone()).unwrap();
        }
        let db = SkipBlockDb::open(&disk).unwrap();
        assert_eq!(db.get(&g.hash), Some(g));
    }

    #[test]
    fn test_smaller_target_takes_over_a_reservation() {
        let db = SkipBlockDb::in_memory();
        let from = SkipBlockId::digest(b"tip");
        let (small, large) = {
            let a = SkipBlockId::digest(b"a");
            let b = SkipBlockId::digest(b"b");
            (a.min(b), a.max(b))
        };
        let ttl = Duration::from_secs(10);
        db.reserve_link(&from, 0, &large, ttl).unwrap();
        db.reserve_link(&from, 0, &small, ttl).unwrap();
        assert!(matches!(db.reserve_link(&from, 0, &large, ttl), Err(SkipchainError::NotLatest(_))));
        assert!(db.lock_link(&from, 0, &large).is_err());
        assert_eq!(db.link_holder(&from, 0), Some(small));
        // Other levels are independent.
        db.reserve_link(&from, 1, &large, ttl).unwrap();
    }

    #[test]
    fn test_expired_reservation_gives_way() {
        let db = SkipBlockDb::in_memory();
        let from = SkipBlockId::digest(b"tip");
        let (small, large) = {
            let a = SkipBlockId::digest(b"a");
            let b = SkipBlockId::digest(b"b");
            (a.min(b), a.max(b))
        };
        db.reserve_link(&from, 0, &small, Duration::ZERO).unwrap();
        db.reserve_link(&from, 0, &large, Duration::from_secs(10)).unwrap();
        assert_eq!(db.link_holder(&from, 0), Some(large));
    }

    #[test]
    fn test_locked_slot_survives_a_reopen_and_never_moves() {
        let disk = sled::Config::new().temporary(true).open().unwrap();
        let from = SkipBlockId::digest(b"tip");
        let (small, large) = {
            let a = SkipBlockId::digest(b"a");
            let b = SkipBlockId::digest(b"b");
            (a.min(b), a.max(b))
        };
        {
            let db = SkipBlockDb::open(&disk).unwrap();
            db.reserve_link(&from, 0, &large, Duration::from_secs(10)).unwrap();
            db.lock_link(&from, 0, &large).unwrap();
            db.lock_link(&from, 0, &large).unwrap();
        }
        let db = SkipBlockDb::open(&disk).unwrap();
        assert_eq!(db.link_holder(&from, 0), Some(large));
        assert!(db.reserve_link(&from, 0, &small, Duration::from_secs(10)).is_err());
        assert!(db.lock_link(&from, 0, &small).is_err());

        db.release_link(&from, 0, &large).unwrap();
        let db = SkipBlockDb::open(&disk).unwrap();
        assert_eq!(db.link_holder(&from, 0), None);
    }
}
