//! Assembly of conodes and of a local cluster.

use std::sync::Arc;

use conode_byzcoin::{
    AddTxRequest, Arguments, ByzCoinService, ClientTransaction, Darc, DefaultGenesisMsg, GetProof, Instruction,
    Signer,
};
use conode_calypso::{CalypsoService, CreateLts, CreateLtsReply, LtsInstanceInfo, LtsStore, CONTRACT_LTS};
use conode_onet::{LocalCothority, Roster, Server};
use conode_skipchain::{SkipBlockDb, SkipBlockId, SkipchainService};
use log::info;

use crate::config::ConodeConfig;
use crate::{ConodeError, ConodeResult};

/// Rules a bootstrapped ledger grants its owner besides evolving its darc.
pub const CALYPSO_ACTIONS: &[&str] = &[
    "spawn:calypsoWrite",
    "spawn:calypsoRead",
    "spawn:longTermSecret",
    "invoke:reshare",
];

pub struct Conode {
    pub server: Arc<Server>,
    pub skipchain: Arc<SkipchainService>,
    pub byzcoin: Arc<ByzCoinService>,
    pub calypso: Arc<CalypsoService>,
    db: Option<sled::Db>,
}

impl Conode {
    /// Wires every service onto `server`. With `db`, blocks and long-term
    /// secrets persist there and stored ledgers are replayed right away.
    pub fn new(server: Arc<Server>, db: Option<sled::Db>, config: &ConodeConfig) -> ConodeResult<Self> {
        let (blocks, secrets) = match &db {
            Some(db) => (SkipBlockDb::open(db)?, LtsStore::open(db)?),
            None => (SkipBlockDb::in_memory(), LtsStore::in_memory()),
        };
        let skipchain = SkipchainService::new(server.clone(), blocks, config.skipchain.clone());
        let byzcoin = ByzCoinService::new(skipchain.clone(), config.byzcoin.clone());
        let calypso = CalypsoService::new(byzcoin.clone(), secrets, config.calypso.clone());
        if db.is_some() {
            byzcoin.load_stored()?;
        }
        Ok(Conode {
            server,
            skipchain,
            byzcoin,
            calypso,
            db,
        })
    }

    pub fn is_persistent(&self) -> bool {
        self.db.is_some()
    }
}

/// What [`LocalCluster::bootstrap`] set up.
#[derive(Clone, Debug)]
pub struct Bootstrap {
    pub byzcoin_id: SkipBlockId,
    pub darc: Darc,
    pub lts: CreateLtsReply,
}

/// `nodes` conodes on one in-process network. Must be started inside a
/// tokio runtime.
pub struct LocalCluster {
    config: ConodeConfig,
    local: LocalCothority,
    conodes: Vec<Conode>,
}

impl LocalCluster {
    pub fn start(config: ConodeConfig) -> ConodeResult<Self> {
        if config.nodes == 0 {
            return Err(ConodeError::Invalid("a cluster needs at least one conode".into()));
        }
        let local = LocalCothority::new(config.nodes);
        let mut conodes = Vec::with_capacity(config.nodes);
        for (i, server) in local.servers.iter().enumerate() {
            let db = match config.node_dir(i) {
                Some(dir) => Some(sled::open(dir)?),
                None => None,
            };
            conodes.push(Conode::new(server.clone(), db, &config)?);
        }
        info!("started {} conodes", conodes.len());
        Ok(LocalCluster {
            config,
            local,
            conodes,
        })
    }

    pub fn roster(&self) -> &Roster {
        &self.local.roster
    }

    pub fn conodes(&self) -> &[Conode] {
        &self.conodes
    }

    pub fn conode(&self, index: usize) -> ConodeResult<&Conode> {
        self.conodes
            .get(index)
            .ok_or_else(|| ConodeError::Invalid(format!("no conode {}", index)))
    }

    /// Creates a ledger owned by `owner` on the whole roster, spawns an LTS
    /// instance for the same roster and runs its DKG. `owner` must not have
    /// signed anything on the ledger before.
    pub async fn bootstrap(&self, owner: &Signer) -> ConodeResult<Bootstrap> {
        let leader = self.conode(0)?;
        let genesis = leader
            .byzcoin
            .create_genesis_block(DefaultGenesisMsg::with_owner(
                self.roster().clone(),
                &owner.identity(),
                CALYPSO_ACTIONS,
                self.config.byzcoin.block_interval_ms,
            ))
            .await?;
        let byzcoin_id = genesis.skipblock.hash;
        let darc_id = genesis.darc.get_base_id();

        let info = LtsInstanceInfo {
            roster: self.roster().clone(),
        };
        let spawn = Instruction::spawn(
            darc_id,
            CONTRACT_LTS,
            Arguments::new().with("lts_instance_info", bincode::serialize(&info)?),
        )
        .signed_by(vec![owner.identity()], vec![1]);
        let mut tx = ClientTransaction::new(vec![spawn]);
        tx.sign(&[owner]);
        let lts_id = tx.instructions[0].derive_id("");
        leader
            .byzcoin
            .add_transaction(AddTxRequest {
                skipchain_id: byzcoin_id,
                transaction: tx,
                inclusion_wait: self.config.byzcoin.tx_wait_blocks.max(1),
            })
            .await?;

        let proof = leader.byzcoin.get_proof(&GetProof {
            skipchain_id: byzcoin_id,
            key: lts_id,
        })?;
        let lts = leader.calypso.create_lts(CreateLts { proof }).await?;
        info!("ledger {} serves lts {}", byzcoin_id, lts.instance_id);
        Ok(Bootstrap {
            byzcoin_id,
            darc: genesis.darc,
            lts,
        })
    }
}
