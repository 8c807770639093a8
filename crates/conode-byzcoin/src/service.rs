//! Ledger service on top of the skipchain service.
//!
//! The first member of a ledger's roster is its leader: it queues client
//! transactions and, once per block interval, executes the queue and
//! proposes the result as a new skipblock. Every node, the leader included,
//! replays stored blocks to keep its copy of the state.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use conode_crypto::Hash256;
use conode_onet::Roster;
use conode_skipchain::{
    BlockListener, SkipBlock, SkipBlockId, SkipchainService, StoreSkipBlock, VerifierId,
};
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::block::{state_changes_hash, transactions_hash, verifier_id, BlockData};
use crate::contracts::config::{ChainConfig, CONFIG_INSTANCE, CONTRACT_CONFIG};
use crate::contracts::{Contract, ContractRegistry};
use crate::darc::{Darc, Identity, Rules};
use crate::executor::{execute_block, get_counter, replay, TxResult};
use crate::instruction::{Arguments, ClientTransaction, InstanceId, Instruction};
use crate::proof::Proof;
use crate::state::{GlobalState, ReadOnlyState, StateEntry};
use crate::{ByzCoinConfig, ByzCoinError, ByzCoinResult};

// ==================== REQUESTS ====================

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DefaultGenesisMsg {
    pub roster: Roster,
    /// Rules of the genesis darc; it must at least allow evolving itself
    pub rules: Rules,
    pub description: Vec<u8>,
    pub block_interval_ms: u64,
}

impl DefaultGenesisMsg {
    /// Genesis request whose darc belongs to `owner` and lets it run
    /// every action in `actions`.
    pub fn with_owner(roster: Roster, owner: &Identity, actions: &[&str], block_interval_ms: u64) -> Self {
        let mut rules = Rules::for_owner(owner);
        for action in actions {
            rules.set(action, &owner.to_string());
        }
        DefaultGenesisMsg {
            roster,
            rules,
            description: b"genesis darc".to_vec(),
            block_interval_ms,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateGenesisBlockReply {
    pub skipblock: SkipBlock,
    pub darc: Darc,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AddTxRequest {
    pub skipchain_id: SkipBlockId,
    pub transaction: ClientTransaction,
    /// Blocks to wait for inclusion; 0 returns once the leader queued it
    pub inclusion_wait: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AddTxResponse {
    pub tx_hash: Hash256,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetProof {
    pub skipchain_id: SkipBlockId,
    pub key: InstanceId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetSignerCounters {
    pub skipchain_id: SkipBlockId,
    pub signer_ids: Vec<Identity>,
}

// ==================== SERVICE ====================

struct ChainState {
    state: GlobalState,
    latest: SkipBlock,
}

struct PendingTx {
    tx: ClientTransaction,
    waiter: Option<oneshot::Sender<bool>>,
}

pub struct ByzCoinService {
    skipchain: Arc<SkipchainService>,
    config: ByzCoinConfig,
    registry: RwLock<ContractRegistry>,
    chains: RwLock<HashMap<SkipBlockId, ChainState>>,
    pending: Mutex<HashMap<SkipBlockId, Vec<PendingTx>>>,
    leading: Mutex<HashSet<SkipBlockId>>,
    me: Weak<ByzCoinService>,
}

/// Forwards stored blocks to the ledger without keeping it alive.
struct Replayer(Weak<ByzCoinService>);

impl BlockListener for Replayer {
    fn block_stored(&self, block: &SkipBlock) {
        if let Some(service) = self.0.upgrade() {
            service.block_stored(block);
        }
    }
}

impl ByzCoinService {
    pub fn new(skipchain: Arc<SkipchainService>, config: ByzCoinConfig) -> Arc<Self> {
        let service = Arc::new_cyclic(|me| ByzCoinService {
            skipchain,
            config,
            registry: RwLock::new(ContractRegistry::with_builtins()),
            chains: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            leading: Mutex::new(HashSet::new()),
            me: me.clone(),
        });
        let weak = Arc::downgrade(&service);
        service.skipchain.register_verifier(verifier_id(), move |block: &SkipBlock| match weak.upgrade() {
            Some(s) => s.verify_block(block),
            None => false,
        });
        service
            .skipchain
            .add_listener(Arc::new(Replayer(Arc::downgrade(&service))));
        service
    }

    pub fn skipchain(&self) -> &Arc<SkipchainService> {
        &self.skipchain
    }

    /// Rebuilds the state of every ledger found in the block store, e.g.
    /// after a restart on a persistent database. Returns the number of
    /// ledgers loaded.
    pub fn load_stored(&self) -> ByzCoinResult<usize> {
        let mut loaded = 0;
        for latest in self.skipchain.get_all_skipchains().latest {
            if !latest.verifiers.contains(&verifier_id()) {
                continue;
            }
            let genesis = self.skipchain.db().get_or_err(&latest.skipchain_id())?;
            self.apply_block(&genesis)?;
            self.apply_block(&latest)?;
            loaded += 1;
        }
        info!("loaded {} ledgers from the block store", loaded);
        Ok(loaded)
    }

    /// Makes an additional contract available to every ledger of this node.
    pub fn register_contract(&self, contract: Arc<dyn Contract>) {
        self.registry.write().register(contract);
    }

    // ==================== GENESIS ====================

    pub async fn create_genesis_block(&self, req: DefaultGenesisMsg) -> ByzCoinResult<CreateGenesisBlockReply> {
        if !req.rules.contains(crate::darc::EVOLVE_ACTION) {
            return Err(ByzCoinError::InvalidTransaction("genesis darc cannot be evolved".into()));
        }
        let darc = Darc::new(req.rules, &req.description);
        let genesis_tx = ClientTransaction::new(vec![Instruction::spawn(
            CONFIG_INSTANCE,
            CONTRACT_CONFIG,
            Arguments::new()
                .with("darc", bincode::serialize(&darc)?)
                .with("block_interval", req.block_interval_ms.to_le_bytes().to_vec()),
        )]);
        let mut state = GlobalState::new(genesis_tx.hash().as_ref());
        let results = vec![TxResult {
            tx: genesis_tx,
            accepted: true,
        }];
        let changes = replay(&mut state, &self.registry.read(), &results, true)?;
        let data = BlockData::new(state.root(), results, &changes)?;

        let sc = self.skipchain.config();
        let block = SkipBlock::new(
            req.roster,
            sc.base_height,
            sc.max_height,
            vec![VerifierId::base(), verifier_id()],
            data.encode()?,
        );
        let reply = self
            .skipchain
            .store_skip_block(StoreSkipBlock {
                latest_id: None,
                new_block: block,
            })
            .await?;
        info!("ledger {} created", reply.latest.hash);
        Ok(CreateGenesisBlockReply {
            skipblock: reply.latest,
            darc,
        })
    }

    // ==================== TRANSACTIONS ====================

    pub async fn add_transaction(&self, req: AddTxRequest) -> ByzCoinResult<AddTxResponse> {
        let leader = {
            let chains = self.chains.read();
            let chain = chains
                .get(&req.skipchain_id)
                .ok_or(ByzCoinError::UnknownChain(req.skipchain_id))?;
            leader_of(&chain.latest.roster)
        };
        let me = self.skipchain.server().identity().id;
        if leader != Some(me) {
            return Err(ByzCoinError::NotLeader(leader.unwrap_or(Hash256::ZERO)));
        }
        if req.transaction.instructions.is_empty() {
            return Err(ByzCoinError::InvalidTransaction("no instructions".into()));
        }

        let tx_hash = req.transaction.hash();
        let (waiter, rx) = if req.inclusion_wait > 0 {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        self.pending.lock().entry(req.skipchain_id).or_default().push(PendingTx {
            tx: req.transaction,
            waiter,
        });
        debug!("queued transaction {} for {}", tx_hash, req.skipchain_id);
        self.ensure_leading(req.skipchain_id);

        if let Some(rx) = rx {
            let interval = self.block_interval(&req.skipchain_id);
            let cosi = Duration::from_millis(self.skipchain.config().cosi_timeout_ms);
            let wait = interval * req.inclusion_wait as u32 + cosi;
            match tokio::time::timeout(wait, rx).await {
                Ok(Ok(true)) => {}
                Ok(Ok(false)) => return Err(ByzCoinError::TxRefused(format!("transaction {} refused", tx_hash))),
                Ok(Err(_)) => return Err(ByzCoinError::TxRefused("block creation failed".into())),
                Err(_) => return Err(ByzCoinError::Timeout),
            }
        }
        Ok(AddTxResponse { tx_hash })
    }

    fn block_interval(&self, scid: &SkipBlockId) -> Duration {
        let configured = self.chains.read().get(scid).and_then(|c| {
            let entry = c.state.get_entry(&CONFIG_INSTANCE).ok()??;
            bincode::deserialize::<ChainConfig>(&entry.value).ok()
        });
        let ms = configured
            .map(|c| c.block_interval_ms)
            .unwrap_or(self.config.block_interval_ms);
        Duration::from_millis(ms.max(1))
    }

    /// Starts the block loop of `scid` unless it already runs.
    fn ensure_leading(&self, scid: SkipBlockId) {
        if !self.leading.lock().insert(scid) {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("no runtime to drive ledger {}", scid);
            self.leading.lock().remove(&scid);
            return;
        };
        let weak = self.me.clone();
        handle.spawn(async move {
            info!("leading ledger {}", scid);
            loop {
                let interval = match weak.upgrade() {
                    Some(service) => service.block_interval(&scid),
                    None => break,
                };
                tokio::time::sleep(interval).await;
                let Some(service) = weak.upgrade() else { break };
                if !service.is_leader(&scid) {
                    info!("no longer leading ledger {}", scid);
                    service.leading.lock().remove(&scid);
                    break;
                }
                if let Err(e) = service.create_block(&scid).await {
                    warn!("block creation on {} failed: {}", scid, e);
                }
            }
        });
    }

    fn is_leader(&self, scid: &SkipBlockId) -> bool {
        let me = self.skipchain.server().identity().id;
        self.chains
            .read()
            .get(scid)
            .map(|c| leader_of(&c.latest.roster) == Some(me))
            .unwrap_or(false)
    }

    /// Executes the queued transactions of `scid` and stores the result.
    async fn create_block(&self, scid: &SkipBlockId) -> ByzCoinResult<()> {
        let batch: Vec<PendingTx> = {
            let mut pending = self.pending.lock();
            match pending.get_mut(scid) {
                Some(queue) => {
                    let n = queue.len().min(self.config.max_txs_per_block);
                    queue.drain(..n).collect()
                }
                None => Vec::new(),
            }
        };
        if batch.is_empty() {
            return Ok(());
        }
        let (txs, waiters): (Vec<_>, Vec<_>) = batch.into_iter().map(|p| (p.tx, p.waiter)).unzip();

        let (latest, data) = {
            let chains = self.chains.read();
            let chain = chains.get(scid).ok_or(ByzCoinError::UnknownChain(*scid))?;
            let outcome = execute_block(&chain.state, &self.registry.read(), txs)?;
            let data = BlockData::new(outcome.state.root(), outcome.results, &outcome.changes)?;
            (chain.latest.clone(), data)
        };
        let accepted: Vec<bool> = data.body.tx_results.iter().map(|r| r.accepted).collect();
        let block = SkipBlock::new(
            latest.roster.clone(),
            latest.base_height,
            latest.max_height,
            latest.verifiers.clone(),
            data.encode()?,
        );
        let stored = self
            .skipchain
            .store_skip_block(StoreSkipBlock {
                latest_id: Some(latest.hash),
                new_block: block,
            })
            .await;

        match stored {
            Ok(reply) => {
                debug!(
                    "block {} holds {} transactions, {} accepted",
                    reply.latest.index,
                    accepted.len(),
                    accepted.iter().filter(|a| **a).count()
                );
                for (waiter, ok) in waiters.into_iter().zip(accepted) {
                    if let Some(w) = waiter {
                        let _ = w.send(ok);
                    }
                }
                Ok(())
            }
            // Dropping the waiters tells clients the block failed.
            Err(e) => Err(e.into()),
        }
    }

    // ==================== REPLAY ====================

    /// Re-executes `block` on a copy of the state it builds on.
    fn verify_block(&self, block: &SkipBlock) -> bool {
        match self.check_block(block) {
            Ok(()) => true,
            Err(e) => {
                warn!("refusing ledger block {}: {}", block.hash, e);
                false
            }
        }
    }

    fn check_block(&self, block: &SkipBlock) -> ByzCoinResult<()> {
        let data = BlockData::decode(block)?;
        let (mut state, genesis) = if block.index == 0 {
            (genesis_state(&data)?, true)
        } else {
            let chains = self.chains.read();
            let chain = chains
                .get(&block.skipchain_id())
                .ok_or(ByzCoinError::UnknownChain(block.skipchain_id()))?;
            if block.back_links.first() != Some(&chain.latest.hash) {
                return Err(ByzCoinError::InvalidBlock("block does not build on the replayed state".into()));
            }
            (chain.state.clone(), false)
        };
        let changes = replay(&mut state, &self.registry.read(), &data.body.tx_results, genesis)?;
        check_header(&data, &state, &changes)
    }

    fn block_stored(&self, block: &SkipBlock) {
        if !block.verifiers.contains(&verifier_id()) {
            return;
        }
        let scid = block.skipchain_id();
        if let Err(e) = self.apply_block(block) {
            error!("ledger {} cannot apply block {}: {}", scid, block.index, e);
            return;
        }
        if self.is_leader(&scid) {
            self.ensure_leading(scid);
        }
    }

    /// Brings the state of the block's ledger up to `block`, replaying any
    /// stored block that was missed on the way.
    fn apply_block(&self, block: &SkipBlock) -> ByzCoinResult<()> {
        let scid = block.skipchain_id();
        let mut chains = self.chains.write();
        let registry = self.registry.read();

        if block.index == 0 {
            if chains.contains_key(&scid) {
                return Ok(());
            }
            let data = BlockData::decode(block)?;
            let mut state = genesis_state(&data)?;
            let changes = replay(&mut state, &registry, &data.body.tx_results, true)?;
            check_header(&data, &state, &changes)?;
            chains.insert(
                scid,
                ChainState {
                    state,
                    latest: block.clone(),
                },
            );
            debug!("ledger {} initialised", scid);
            return Ok(());
        }

        let chain = chains.get_mut(&scid).ok_or(ByzCoinError::UnknownChain(scid))?;
        if block.index <= chain.latest.index {
            return Ok(());
        }
        let db = self.skipchain.db();
        for index in chain.latest.index + 1..=block.index {
            let next = if index == block.index {
                block.clone()
            } else {
                db.block_by_index(&scid, index)?
            };
            let data = BlockData::decode(&next)?;
            let mut state = chain.state.clone();
            let changes = replay(&mut state, &registry, &data.body.tx_results, false)?;
            check_header(&data, &state, &changes)?;
            chain.state = state;
            chain.latest = next;
        }
        debug!("ledger {} at block {}", scid, block.index);
        Ok(())
    }

    // ==================== QUERIES ====================

    pub fn get_proof(&self, req: &GetProof) -> ByzCoinResult<Proof> {
        let (inclusion, latest) = {
            let chains = self.chains.read();
            let chain = chains
                .get(&req.skipchain_id)
                .ok_or(ByzCoinError::UnknownChain(req.skipchain_id))?;
            (chain.state.trie().get_proof(req.key.as_ref())?, chain.latest.clone())
        };
        Proof::new(inclusion, latest, self.skipchain.db())
    }

    pub fn get_signer_counters(&self, req: &GetSignerCounters) -> ByzCoinResult<Vec<u64>> {
        let chains = self.chains.read();
        let chain = chains
            .get(&req.skipchain_id)
            .ok_or(ByzCoinError::UnknownChain(req.skipchain_id))?;
        req.signer_ids
            .iter()
            .map(|id| get_counter(&chain.state, id))
            .collect()
    }

    /// Current entry of `id` in this node's copy of the ledger.
    pub fn get_instance(&self, scid: &SkipBlockId, id: &InstanceId) -> ByzCoinResult<Option<StateEntry>> {
        let chains = self.chains.read();
        let chain = chains.get(scid).ok_or(ByzCoinError::UnknownChain(*scid))?;
        Ok(chain.state.get_entry(id)?)
    }

    /// Latest block this node has replayed.
    pub fn latest_block(&self, scid: &SkipBlockId) -> ByzCoinResult<SkipBlock> {
        self.chains
            .read()
            .get(scid)
            .map(|c| c.latest.clone())
            .ok_or(ByzCoinError::UnknownChain(*scid))
    }

    /// Runs `f` on a read-only view of the ledger's state.
    pub fn with_state<T>(&self, scid: &SkipBlockId, f: impl FnOnce(&dyn ReadOnlyState) -> T) -> ByzCoinResult<T> {
        let chains = self.chains.read();
        let chain = chains.get(scid).ok_or(ByzCoinError::UnknownChain(*scid))?;
        Ok(f(&chain.state))
    }
}

fn leader_of(roster: &Roster) -> Option<conode_onet::ServerId> {
    roster.list.first().map(|s| s.id)
}

/// The trie nonce of a ledger is the hash of its genesis transaction.
fn genesis_state(data: &BlockData) -> ByzCoinResult<GlobalState> {
    let first = data
        .body
        .tx_results
        .first()
        .ok_or_else(|| ByzCoinError::InvalidBlock("genesis block without transaction".into()))?;
    Ok(GlobalState::new(first.tx.hash().as_ref()))
}

fn check_header(data: &BlockData, state: &GlobalState, changes: &[crate::state::StateChange]) -> ByzCoinResult<()> {
    if data.header.trie_root != state.root() {
        return Err(ByzCoinError::InvalidBlock("trie root mismatch".into()));
    }
    if data.header.client_transactions_hash != transactions_hash(&data.body.tx_results) {
        return Err(ByzCoinError::InvalidBlock("transactions hash mismatch".into()));
    }
    if data.header.state_changes_hash != state_changes_hash(changes)? {
        return Err(ByzCoinError::InvalidBlock("state changes hash mismatch".into()));
    }
    Ok(())
}
