//! Calypso service of a conode.
//!
//! `create_lts` and `reshare_lts` run the DKG over the roster named in an
//! LTS instance of a ledger; every participant checks the ledger proof
//! before taking part. `decrypt_key` runs the re-encryption protocol over
//! the LTS roster once the read and write proofs check out, on the root as
//! well as on every node asked for a share.

use std::sync::{Arc, Weak};
use std::time::Duration;

use conode_byzcoin::{ByzCoinService, Proof};
use conode_crypto::schnorr;
use conode_crypto::{bft_threshold, point_to_bytes, Point, SchnorrSignature};
use conode_dkg::{DistKeyShare, DkgError, ReshareInfo, SetupProtocol, DKG_PROTOCOL};
use conode_onet::{Roster, Server, Tree, TreeNodeInstance};
use conode_skipchain::SkipBlockId;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::contracts::{LtsContract, LtsInstanceInfo, WriteContract, CONTRACT_LTS, CONTRACT_READ, CONTRACT_WRITE};
use crate::ocs::{OcsProtocol, VerifyRequest, OCS_PROTOCOL};
use crate::store::{LtsRecord, LtsStore};
use crate::write::{Read, Write};
use crate::{CalypsoConfig, CalypsoError, CalypsoResult, LtsId};

// ==================== REQUESTS ====================

/// Sets up the LTS whose instance is shown by `proof`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateLts {
    pub proof: Proof,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateLtsReply {
    pub byzcoin_id: SkipBlockId,
    pub instance_id: LtsId,
    /// Public key of the LTS
    pub x: Point,
}

/// Moves an LTS to the roster its instance now holds.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReshareLts {
    pub proof: Proof,
}

/// Asks for the key of `write` to be re-encrypted for the reader of
/// `read`. With `ephemeral` set, and signed by the reader's key, the key
/// is re-encrypted to `ephemeral` instead.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DecryptKey {
    pub read: Proof,
    pub write: Proof,
    pub ephemeral: Option<Point>,
    pub signature: Option<SchnorrSignature>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecryptKeyReply {
    pub x: Point,
    pub cs: Vec<Point>,
    /// `x·(U + target)`
    pub xhat_enc: Point,
}

/// Session config of a DKG run started by this service.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct DkgRun {
    proof: Proof,
    reshare: bool,
}

/// An LTS instance whose proof checked out.
struct ProvenLts {
    byzcoin_id: SkipBlockId,
    lts_id: LtsId,
    info: LtsInstanceInfo,
}

/// A read and write pair that may be re-encrypted.
struct Reencryption {
    write: Write,
    target: Point,
}

// ==================== SERVICE ====================

pub struct CalypsoService {
    byzcoin: Arc<ByzCoinService>,
    store: LtsStore,
    config: CalypsoConfig,
}

impl CalypsoService {
    pub fn new(byzcoin: Arc<ByzCoinService>, store: LtsStore, config: CalypsoConfig) -> Arc<Self> {
        byzcoin.register_contract(Arc::new(WriteContract));
        byzcoin.register_contract(Arc::new(LtsContract));
        let service = Arc::new(CalypsoService {
            byzcoin,
            store,
            config,
        });

        let make = Arc::downgrade(&service);
        let done = Arc::downgrade(&service);
        service.server().register_protocol::<SetupProtocol, _, _>(
            DKG_PROTOCOL,
            move |inst: &TreeNodeInstance| match make.upgrade() {
                Some(s) => s.make_dkg(inst).map_err(|e| DkgError::InvalidConfig(e.to_string())),
                None => Err(DkgError::InvalidConfig("calypso service stopped".into())),
            },
            move |inst: &TreeNodeInstance, res: Result<Option<DistKeyShare>, DkgError>| {
                if let Some(s) = done.upgrade() {
                    s.dkg_done(inst, res);
                }
            },
        );

        let make = Arc::downgrade(&service);
        service.server().register_protocol::<OcsProtocol, _, _>(
            OCS_PROTOCOL,
            move |inst: &TreeNodeInstance| match make.upgrade() {
                Some(s) => s.make_ocs(inst, make.clone()),
                None => Err(CalypsoError::Invalid("calypso service stopped".into())),
            },
            |inst: &TreeNodeInstance, res: Result<Option<Point>, CalypsoError>| match res {
                Ok(_) => debug!("node {} answered a re-encryption request", inst.index),
                Err(e) => warn!("re-encryption at node {} failed: {}", inst.index, e),
            },
        );
        service
    }

    fn server(&self) -> &Arc<Server> {
        self.byzcoin.skipchain().server()
    }

    pub fn store(&self) -> &LtsStore {
        &self.store
    }

    fn dkg_timeout(&self) -> Duration {
        Duration::from_millis(self.config.dkg_timeout_ms)
    }

    fn reencrypt_timeout(&self) -> Duration {
        Duration::from_millis(self.config.reencrypt_timeout_ms)
    }

    // ==================== LONG-TERM SECRETS ====================

    /// Checks that `proof` shows an LTS instance of a ledger this node follows.
    fn check_lts_proof(&self, proof: &Proof) -> CalypsoResult<ProvenLts> {
        let (lts_id, entry) = proof
            .key_value()?
            .ok_or_else(|| CalypsoError::Invalid("proof holds no instance".into()))?;
        if entry.contract_id != CONTRACT_LTS {
            return Err(CalypsoError::WrongInstance(lts_id, CONTRACT_LTS));
        }
        let byzcoin_id = proof.genesis.hash;
        self.byzcoin.latest_block(&byzcoin_id)?;
        proof.verify(&byzcoin_id, &lts_id)?;
        let info = LtsInstanceInfo::decode(&entry.value).map_err(|e| CalypsoError::Invalid(e.to_string()))?;
        Ok(ProvenLts {
            byzcoin_id,
            lts_id,
            info,
        })
    }

    async fn run_dkg(
        &self,
        tree: Tree,
        run: &DkgRun,
        proto: impl FnOnce(TreeNodeInstance) -> SetupProtocol,
    ) -> CalypsoResult<Option<DistKeyShare>> {
        let server = self.server();
        let instance = server.new_instance(DKG_PROTOCOL, tree, bincode::serialize(run)?)?;
        let proto = proto(instance.clone());
        match tokio::time::timeout(self.dkg_timeout(), server.run_root(instance, proto)).await {
            Ok(res) => Ok(res?),
            Err(_) => Err(CalypsoError::Timeout("dkg")),
        }
    }

    fn tree_rooted_here(&self, roster: Roster) -> CalypsoResult<Tree> {
        let me = self.server().identity().id;
        if !roster.contains(&me) {
            return Err(CalypsoError::NotMember);
        }
        Ok(Tree::rooted_at(roster, &me, 0)?)
    }

    /// Runs a fresh DKG over the roster of the LTS instance, with this node
    /// as leader, and stores the resulting share.
    pub async fn create_lts(&self, req: CreateLts) -> CalypsoResult<CreateLtsReply> {
        let lts = self.check_lts_proof(&req.proof)?;
        if self.store.contains(&lts.lts_id) {
            return Err(CalypsoError::Invalid(format!("lts {} is already set up", lts.lts_id)));
        }
        let tree = self.tree_rooted_here(lts.info.roster.clone())?;
        let run = DkgRun {
            proof: req.proof,
            reshare: false,
        };
        let timeout = self.dkg_timeout();
        let share = self
            .run_dkg(tree, &run, |inst| SetupProtocol::new(inst, true, timeout))
            .await?
            .ok_or(CalypsoError::NotMember)?;

        let reply = CreateLtsReply {
            byzcoin_id: lts.byzcoin_id,
            instance_id: lts.lts_id,
            x: share.public(),
        };
        self.store.put(
            lts.lts_id,
            LtsRecord {
                byzcoin_id: lts.byzcoin_id,
                dkg_publics: lts.info.roster.publics(),
                roster: lts.info.roster,
                share: Some(share),
                reply: reply.clone(),
            },
        )?;
        info!("created lts {} with key {}", lts.lts_id, hex::encode(point_to_bytes(&reply.x)));
        Ok(reply)
    }

    /// Reshares the LTS to the roster its instance now names. This node
    /// must hold a share of the current key.
    pub async fn reshare_lts(&self, req: ReshareLts) -> CalypsoResult<()> {
        let lts = self.check_lts_proof(&req.proof)?;
        let record = self.store.get_or_err(&lts.lts_id)?;
        if record.byzcoin_id != lts.byzcoin_id {
            return Err(CalypsoError::Invalid("lts instance moved to another ledger".into()));
        }
        let old_share = record.share.clone().ok_or(CalypsoError::NotMember)?;
        if lts.info.roster.id == record.roster.id {
            return Err(CalypsoError::Invalid("roster did not change".into()));
        }

        let new_nodes = lts.info.roster.publics();
        let info = ReshareInfo {
            old_nodes: record.dkg_publics.clone(),
            threshold: bft_threshold(new_nodes.len()),
            new_nodes,
            commits: old_share.commits.clone(),
        };
        let tree = self.tree_rooted_here(lts.info.roster.concat(&record.roster))?;
        let run = DkgRun {
            proof: req.proof,
            reshare: true,
        };
        let timeout = self.dkg_timeout();
        let share = self
            .run_dkg(tree, &run, |inst| {
                SetupProtocol::new(inst, true, timeout)
                    .with_share(Some(old_share.clone()))
                    .with_reshare(info)
            })
            .await?;
        if let Some(new) = &share {
            new.check_reshare(&old_share)?;
        }
        self.store.put(
            lts.lts_id,
            LtsRecord {
                dkg_publics: lts.info.roster.publics(),
                roster: lts.info.roster,
                share,
                ..record
            },
        )?;
        info!("reshared lts {}", lts.lts_id);
        Ok(())
    }

    pub fn get_lts_reply(&self, lts_id: &LtsId) -> CalypsoResult<CreateLtsReply> {
        Ok(self.store.get_or_err(lts_id)?.reply)
    }

    fn make_dkg(&self, inst: &TreeNodeInstance) -> CalypsoResult<SetupProtocol> {
        let run: DkgRun = bincode::deserialize(&inst.config)?;
        let lts = self.check_lts_proof(&run.proof)?;
        if lts.info.roster.list.iter().any(|si| !inst.tree.roster.contains(&si.id)) {
            return Err(CalypsoError::Invalid("session tree misses members of the lts roster".into()));
        }
        let share = match (run.reshare, self.store.get(&lts.lts_id)) {
            (false, Some(_)) => {
                return Err(CalypsoError::Invalid(format!("lts {} is already set up", lts.lts_id)));
            }
            (false, None) => None,
            (true, Some(record)) if record.roster.id == lts.info.roster.id => {
                return Err(CalypsoError::Invalid("roster did not change".into()));
            }
            (true, record) => record.and_then(|r| r.share),
        };
        Ok(SetupProtocol::new(inst.clone(), false, self.dkg_timeout()).with_share(share))
    }

    fn dkg_done(&self, inst: &TreeNodeInstance, res: Result<Option<DistKeyShare>, DkgError>) {
        match res {
            Ok(share) => {
                if let Err(e) = self.store_dkg_result(inst, share) {
                    error!("node {} could not store its lts share: {}", inst.index, e);
                }
            }
            Err(e) => warn!("dkg run at node {} failed: {}", inst.index, e),
        }
    }

    fn store_dkg_result(&self, inst: &TreeNodeInstance, share: Option<DistKeyShare>) -> CalypsoResult<()> {
        let run: DkgRun = bincode::deserialize(&inst.config)?;
        let lts = self.check_lts_proof(&run.proof)?;
        let previous = self.store.get(&lts.lts_id);

        let reply = match (&previous, &share) {
            (Some(prev), _) => prev.reply.clone(),
            (None, Some(s)) => CreateLtsReply {
                byzcoin_id: lts.byzcoin_id,
                instance_id: lts.lts_id,
                x: s.public(),
            },
            (None, None) => return Ok(()),
        };
        if let (Some(old), Some(new)) = (previous.as_ref().and_then(|p| p.share.as_ref()), &share) {
            new.check_reshare(old)?;
        }
        self.store.put(
            lts.lts_id,
            LtsRecord {
                byzcoin_id: lts.byzcoin_id,
                dkg_publics: lts.info.roster.publics(),
                roster: lts.info.roster,
                share,
                reply,
            },
        )
    }

    // ==================== RE-ENCRYPTION ====================

    /// Checks a decryption request against the ledger of its LTS and
    /// returns what to re-encrypt and for whom.
    fn check_request(&self, req: &DecryptKey) -> CalypsoResult<(LtsRecord, Reencryption)> {
        let (read_id, read_entry) = req
            .read
            .key_value()?
            .ok_or_else(|| CalypsoError::Invalid("read proof holds no instance".into()))?;
        if read_entry.contract_id != CONTRACT_READ {
            return Err(CalypsoError::WrongInstance(read_id, CONTRACT_READ));
        }
        let (write_id, write_entry) = req
            .write
            .key_value()?
            .ok_or_else(|| CalypsoError::Invalid("write proof holds no instance".into()))?;
        if write_entry.contract_id != CONTRACT_WRITE {
            return Err(CalypsoError::WrongInstance(write_id, CONTRACT_WRITE));
        }
        let read: Read = bincode::deserialize(&read_entry.value)?;
        if read.write != write_id {
            return Err(CalypsoError::Mismatch);
        }
        let write: Write = bincode::deserialize(&write_entry.value)?;

        let record = self.store.get_or_err(&write.lts_id)?;
        req.read.verify(&record.byzcoin_id, &read_id)?;
        req.write.verify(&record.byzcoin_id, &write_id)?;

        let target = match (req.ephemeral, req.signature) {
            (None, _) => read.xc,
            (Some(ephemeral), Some(sig)) => {
                schnorr::verify(&read.xc, &point_to_bytes(&ephemeral), &sig)?;
                ephemeral
            }
            (Some(_), None) => return Err(CalypsoError::Invalid("unsigned ephemeral key".into())),
        };
        Ok((record, Reencryption { write, target }))
    }

    /// Re-encrypts the key of a write to its reader, or to the reader's
    /// ephemeral key.
    pub async fn decrypt_key(&self, req: DecryptKey) -> CalypsoResult<DecryptKeyReply> {
        let (record, re) = self.check_request(&req)?;
        let secret = record.shared_secret().ok_or(CalypsoError::NotMember)?;
        let tree = self.tree_rooted_here(record.roster.clone())?;
        let server = self.server();
        let instance = server.new_instance(OCS_PROTOCOL, tree, re.write.lts_id.as_bytes().to_vec())?;
        let proto = OcsProtocol::root(
            instance.clone(),
            secret.clone(),
            re.write.u,
            re.target,
            bincode::serialize(&req)?,
            self.reencrypt_timeout(),
        );
        let xhat_enc = match tokio::time::timeout(self.reencrypt_timeout(), server.run_root(instance, proto)).await {
            Ok(res) => res?.ok_or_else(|| CalypsoError::Invalid("re-encryption produced nothing".into()))?,
            Err(_) => return Err(CalypsoError::Timeout("re-encryption")),
        };
        debug!("re-encrypted write of lts {}", re.write.lts_id);
        Ok(DecryptKeyReply {
            x: secret.x,
            cs: re.write.cs,
            xhat_enc,
        })
    }

    fn make_ocs(&self, inst: &TreeNodeInstance, me: Weak<CalypsoService>) -> CalypsoResult<OcsProtocol> {
        let lts_id = LtsId::from_slice(&inst.config)?;
        let secret = self.store.get(&lts_id).and_then(|r| r.shared_secret());
        let verify: VerifyRequest = Arc::new(move |data: &[u8], u: &Point, xc: &Point| match me.upgrade() {
            Some(s) => match s.verify_reencryption(&lts_id, data, u, xc) {
                Ok(()) => true,
                Err(e) => {
                    warn!("refusing re-encryption for lts {}: {}", lts_id, e);
                    false
                }
            },
            None => false,
        });
        Ok(OcsProtocol::node(inst.clone(), secret, verify, self.reencrypt_timeout()))
    }

    /// What every share holder checks before contributing.
    fn verify_reencryption(&self, lts_id: &LtsId, data: &[u8], u: &Point, xc: &Point) -> CalypsoResult<()> {
        let req: DecryptKey = bincode::deserialize(data)?;
        let (_, re) = self.check_request(&req)?;
        if re.write.lts_id != *lts_id {
            return Err(CalypsoError::Invalid("write belongs to another lts".into()));
        }
        if re.write.u != *u || re.target != *xc {
            return Err(CalypsoError::Mismatch);
        }
        Ok(())
    }
}
