//! Per-node table of long-term secrets.
//!
//! Readers get a cloned snapshot of a record and never hold the lock across
//! a protocol run. When opened on a sled database every write goes through
//! to disk and the table is reloaded on start.

use std::collections::HashMap;

use conode_crypto::Point;
use conode_dkg::{DistKeyShare, SharedSecret};
use conode_onet::Roster;
use conode_skipchain::SkipBlockId;
use log::{debug, info};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::service::CreateLtsReply;
use crate::{CalypsoError, CalypsoResult, LtsId};

const TREE_NAME: &str = "lts_records";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LtsRecord {
    /// Ledger holding the LTS instance
    pub byzcoin_id: SkipBlockId,
    pub roster: Roster,
    /// Keys of the share holders, in share index order
    pub dkg_publics: Vec<Point>,
    /// None once this node has been reshared out of the group
    pub share: Option<DistKeyShare>,
    pub reply: CreateLtsReply,
}

impl LtsRecord {
    pub fn shared_secret(&self) -> Option<SharedSecret> {
        self.share.as_ref().map(SharedSecret::from)
    }

    /// Commitments of the joint polynomial, if this node holds a share.
    pub fn commits(&self) -> Option<&[Point]> {
        self.share.as_ref().map(|s| s.commits.as_slice())
    }
}

pub struct LtsStore {
    records: RwLock<HashMap<LtsId, LtsRecord>>,
    disk: Option<sled::Tree>,
}

impl LtsStore {
    pub fn in_memory() -> Self {
        LtsStore {
            records: RwLock::new(HashMap::new()),
            disk: None,
        }
    }

    pub fn open(db: &sled::Db) -> CalypsoResult<Self> {
        let tree = db.open_tree(TREE_NAME)?;
        let mut records = HashMap::new();
        for entry in tree.iter() {
            let (key, value) = entry?;
            let id = LtsId::from_slice(&key)?;
            records.insert(id, bincode::deserialize(&value)?);
        }
        info!("loaded {} long-term secrets from disk", records.len());
        Ok(LtsStore {
            records: RwLock::new(records),
            disk: Some(tree),
        })
    }

    pub fn get(&self, id: &LtsId) -> Option<LtsRecord> {
        self.records.read().get(id).cloned()
    }

    pub fn get_or_err(&self, id: &LtsId) -> CalypsoResult<LtsRecord> {
        self.get(id).ok_or(CalypsoError::UnknownLts(*id))
    }

    pub fn contains(&self, id: &LtsId) -> bool {
        self.records.read().contains_key(id)
    }

    pub fn ids(&self) -> Vec<LtsId> {
        self.records.read().keys().copied().collect()
    }

    /// Stores `record` under `id`, replacing any previous one.
    pub fn put(&self, id: LtsId, record: LtsRecord) -> CalypsoResult<()> {
        let mut records = self.records.write();
        if let Some(tree) = &self.disk {
            tree.insert(id.as_bytes(), bincode::serialize(&record)?)?;
            tree.flush()?;
        }
        debug!(
            "stored lts {} with {} holders, share held: {}",
            id,
            record.dkg_publics.len(),
            record.share.is_some()
        );
        records.insert(id, record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use conode_crypto::{base_mul, random_scalar, Hash256, KeyPair, PriShare};
    use conode_onet::ServerIdentity;

    use super::*;

    fn record() -> LtsRecord {
        let keys: Vec<KeyPair> = (0..3).map(|_| KeyPair::generate()).collect();
        let roster = Roster::new(
            keys.iter()
                .enumerate()
                .map(|(i, k)| ServerIdentity::new(k.public(), format!("local://{}", i)))
                .collect(),
        );
        let secret = random_scalar();
        let x = base_mul(&secret);
        LtsRecord {
            byzcoin_id: Hash256::digest(b"ledger"),
            dkg_publics: roster.publics(),
            roster,
            share: Some(DistKeyShare {
                share: PriShare { index: 1, value: secret },
                commits: vec![x],
            }),
            reply: CreateLtsReply {
                byzcoin_id: Hash256::digest(b"ledger"),
                instance_id: Hash256::digest(b"lts"),
                x,
            },
        }
    }

    #[test]
    fn test_records_survive_a_reopen() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let id = Hash256::digest(b"lts");
        let rec = record();
        {
            let store = LtsStore::open(&db).unwrap();
            assert!(!store.contains(&id));
            store.put(id, rec.clone()).unwrap();
        }
        let store = LtsStore::open(&db).unwrap();
        assert_eq!(store.get(&id), Some(rec.clone()));
        assert_eq!(store.ids(), vec![id]);
        let secret = store.get(&id).unwrap().shared_secret().unwrap();
        assert_eq!(secret.x, rec.reply.x);
        assert_eq!(secret.index, 1);
    }

    #[test]
    fn test_unknown_lts_is_an_error() {
        let store = LtsStore::in_memory();
        let id = Hash256::digest(b"nothing");
        assert!(matches!(store.get_or_err(&id), Err(CalypsoError::UnknownLts(_))));
    }
}
