//! Skipchain service: accepts new blocks from clients, gets their forward
//! links collectively signed and spreads the result to the roster.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use conode_crypto::CollectiveSignature;
use conode_onet::{Roster, Server, Tree, TreeNodeInstance};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::block::{ForwardLink, SkipBlock, SkipBlockId, VerifierId};
use crate::cosi::{ConfirmFn, CosiProtocol, VerifyFn, COSI_PROTOCOL};
use crate::db::SkipBlockDb;
use crate::propagate::{PropagateProtocol, StoreFn, PROPAGATE_PROTOCOL};
use crate::{SkipchainConfig, SkipchainError, SkipchainResult};

/// Chain-specific acceptance rule, looked up by [`VerifierId`].
pub trait BlockVerifier: Send + Sync {
    fn verify(&self, block: &SkipBlock) -> bool;
}

impl<F> BlockVerifier for F
where
    F: Fn(&SkipBlock) -> bool + Send + Sync,
{
    fn verify(&self, block: &SkipBlock) -> bool {
        self(block)
    }
}

/// Notified after a block is stored, on the leader and on every follower.
pub trait BlockListener: Send + Sync {
    fn block_stored(&self, block: &SkipBlock);
}

// ==================== REQUESTS ====================

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreSkipBlock {
    /// Current tip of the chain, `None` to create a new chain
    pub latest_id: Option<SkipBlockId>,
    pub new_block: SkipBlock,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreSkipBlockReply {
    pub previous: Option<SkipBlock>,
    pub latest: SkipBlock,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetUpdateChain {
    pub latest_id: SkipBlockId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetUpdateChainReply {
    pub update: Vec<SkipBlock>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetSingleBlock {
    pub id: SkipBlockId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetSingleBlockByIndex {
    pub genesis: SkipBlockId,
    pub index: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetAllSkipchainsReply {
    pub latest: Vec<SkipBlock>,
}

/// What a cosi announcement carries: the block to link and which link.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct LinkProposal {
    block: SkipBlock,
    from: SkipBlockId,
    level: usize,
}

// ==================== SERVICE ====================

pub struct SkipchainService {
    server: Arc<Server>,
    db: Arc<SkipBlockDb>,
    config: SkipchainConfig,
    verifiers: RwLock<HashMap<VerifierId, Arc<dyn BlockVerifier>>>,
    verified: Mutex<HashSet<SkipBlockId>>,
    listeners: RwLock<Vec<Arc<dyn BlockListener>>>,
    proposing: tokio::sync::Mutex<()>,
}

impl SkipchainService {
    pub fn new(server: Arc<Server>, db: SkipBlockDb, config: SkipchainConfig) -> Arc<Self> {
        let service = Arc::new(SkipchainService {
            server,
            db: Arc::new(db),
            config,
            verifiers: RwLock::new(HashMap::new()),
            verified: Mutex::new(HashSet::new()),
            listeners: RwLock::new(Vec::new()),
            proposing: tokio::sync::Mutex::new(()),
        });
        service.register_verifier(VerifierId::base(), |_: &SkipBlock| true);
        Self::register_protocols(&service);
        service
    }

    fn register_protocols(service: &Arc<Self>) {
        let soft = Duration::from_millis(service.config.cosi_soft_timeout_ms);
        let hard = Duration::from_millis(service.config.cosi_timeout_ms);
        let propagate_timeout = Duration::from_millis(service.config.propagate_timeout_ms);

        let weak: Weak<Self> = Arc::downgrade(service);
        service.server.register_protocol::<CosiProtocol, _, _>(
            COSI_PROTOCOL,
            move |inst: &TreeNodeInstance| {
                Ok(CosiProtocol::new(
                    inst.clone(),
                    Self::verify_fn(&weak),
                    Self::confirm_fn(&weak),
                    soft,
                    hard,
                ))
            },
            |inst: &TreeNodeInstance, res: Result<Option<CollectiveSignature>, SkipchainError>| {
                if let Err(e) = res {
                    debug!("cosi session {} ended: {}", inst.session, e);
                }
            },
        );

        let weak: Weak<Self> = Arc::downgrade(service);
        service.server.register_protocol::<PropagateProtocol, _, _>(
            PROPAGATE_PROTOCOL,
            move |inst: &TreeNodeInstance| {
                Ok(PropagateProtocol::new(inst.clone(), Self::store_fn(&weak), propagate_timeout))
            },
            |inst: &TreeNodeInstance, res: Result<usize, SkipchainError>| {
                if let Err(e) = res {
                    debug!("propagation session {} ended: {}", inst.session, e);
                }
            },
        );
    }

    fn verify_fn(weak: &Weak<Self>) -> VerifyFn {
        let weak = weak.clone();
        Arc::new(move |msg: &[u8], data: &[u8]| match weak.upgrade() {
            Some(service) => service.verify_link_proposal(msg, data),
            None => false,
        })
    }

    fn confirm_fn(weak: &Weak<Self>) -> ConfirmFn {
        let weak = weak.clone();
        Arc::new(move |_: &[u8], data: &[u8]| match weak.upgrade() {
            Some(service) => service.confirm_link_proposal(data),
            None => false,
        })
    }

    fn store_fn(weak: &Weak<Self>) -> StoreFn {
        let weak = weak.clone();
        Arc::new(move |blocks: Vec<SkipBlock>| match weak.upgrade() {
            Some(service) => service.store_propagated(blocks),
            None => Err(SkipchainError::Refused("service stopped".into())),
        })
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    pub fn db(&self) -> &SkipBlockDb {
        &self.db
    }

    pub fn config(&self) -> &SkipchainConfig {
        &self.config
    }

    pub fn register_verifier(&self, id: VerifierId, verifier: impl BlockVerifier + 'static) {
        self.verifiers.write().insert(id, Arc::new(verifier));
    }

    pub fn add_listener(&self, listener: Arc<dyn BlockListener>) {
        self.listeners.write().push(listener);
    }

    fn notify(&self, block: &SkipBlock) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.block_stored(block);
        }
    }

    /// Structure plus every verifier the block names. Results are cached
    /// by hash, one block is usually checked once per link level.
    fn verify_block(&self, block: &SkipBlock) -> SkipchainResult<()> {
        if self.verified.lock().contains(&block.hash) {
            return Ok(());
        }
        block.verify_structure()?;
        for id in &block.verifiers {
            let verifier = self.verifiers.read().get(id).cloned();
            match verifier {
                Some(v) if v.verify(block) => {}
                Some(_) => return Err(SkipchainError::Refused(format!("verifier {} rejects {}", id.0, block.hash))),
                None => return Err(SkipchainError::Refused(format!("unknown verifier {}", id.0))),
            }
        }
        self.verified.lock().insert(block.hash);
        Ok(())
    }

    // ==================== STORE ====================

    /// Appends `new_block` to the chain whose tip is `latest_id`, or starts
    /// a new chain when `latest_id` is `None`.
    pub async fn store_skip_block(&self, req: StoreSkipBlock) -> SkipchainResult<StoreSkipBlockReply> {
        let _guard = self.proposing.lock().await;
        match req.latest_id {
            None => self.store_genesis(req.new_block).await,
            Some(latest) => self.append(latest, req.new_block).await,
        }
    }

    async fn store_genesis(&self, mut block: SkipBlock) -> SkipchainResult<StoreSkipBlockReply> {
        let me = self.server.identity().id;
        if !block.roster.contains(&me) {
            return Err(SkipchainError::UnknownRosterMember(me));
        }
        block.index = 0;
        block.genesis = None;
        block.back_links.clear();
        block.forward_links.clear();
        block.height = block.max_height;
        if block.verifiers.is_empty() {
            block.verifiers.push(VerifierId::base());
        }
        block.update_hash();
        self.verify_block(&block)?;

        self.db.store(block.clone())?;
        info!("new skipchain {} with {} nodes", block.hash, block.roster.len());
        self.notify(&block);
        self.propagate(&block.roster, vec![block.clone()]).await?;
        Ok(StoreSkipBlockReply {
            previous: None,
            latest: block,
        })
    }

    async fn append(&self, latest_id: SkipBlockId, proposal: SkipBlock) -> SkipchainResult<StoreSkipBlockReply> {
        let prev = self.db.get_or_err(&latest_id)?;
        if !prev.forward_links.is_empty() {
            return Err(SkipchainError::NotLatest(latest_id));
        }
        let me = self.server.identity().id;
        if !prev.roster.contains(&me) {
            return Err(SkipchainError::UnknownRosterMember(me));
        }

        let mut block = proposal;
        block.index = prev.index + 1;
        block.base_height = prev.base_height;
        block.max_height = prev.max_height;
        block.verifiers = prev.verifiers.clone();
        block.genesis = Some(prev.skipchain_id());
        block.height = SkipBlock::height_for_index(block.index, block.base_height, block.max_height);
        block.forward_links.clear();
        block.back_links = self.back_links_for(&prev, block.height)?;
        block.update_hash();
        self.verify_block(&block)?;

        let links = self.sign_links(&block).await?;
        let updated = self.db.commit_links(block.clone(), links)?;
        info!("block {} stored at index {} of {}", block.hash, block.index, block.skipchain_id());
        self.notify(&block);

        let mut outgoing = updated;
        outgoing.sort_by_key(|b| b.index);
        outgoing.push(block.clone());
        let roster = prev.roster.concat(&block.roster);
        self.propagate(&roster, outgoing).await?;

        let previous = self.db.get(&prev.hash);
        Ok(StoreSkipBlockReply {
            previous,
            latest: block,
        })
    }

    /// Back link `h` points to the closest earlier block taller than `h`.
    fn back_links_for(&self, prev: &SkipBlock, height: u32) -> SkipchainResult<Vec<SkipBlockId>> {
        let mut links = Vec::with_capacity(height as usize);
        let mut pointer = prev.clone();
        for h in 0..height {
            while pointer.height <= h {
                let top = (pointer.height as usize)
                    .checked_sub(1)
                    .and_then(|i| pointer.back_links.get(i))
                    .ok_or_else(|| SkipchainError::InvalidBlock(format!("{} lacks back links", pointer.hash)))?;
                pointer = self.db.get_or_err(top)?;
            }
            links.push(pointer.hash);
        }
        Ok(links)
    }

    /// Runs one collective signature per link level. Levels that cannot be
    /// signed from here stop the climb; level 0 must always succeed.
    async fn sign_links(&self, block: &SkipBlock) -> SkipchainResult<Vec<(SkipBlockId, usize, ForwardLink)>> {
        let me = self.server.identity().id;
        let mut planned: HashMap<SkipBlockId, usize> = HashMap::new();
        let mut links = Vec::new();
        for (level, from_id) in block.back_links.iter().enumerate() {
            let from = self.db.get_or_err(from_id)?;
            let known = from.forward_links.len() + planned.get(from_id).copied().unwrap_or(0);
            if known != level || !from.roster.contains(&me) {
                debug!("stopping forward links of {} at level {}", block.hash, level);
                break;
            }
            if let Err(e) = self.db.reserve_link(&from.hash, level, &block.hash, self.link_ttl()) {
                if level == 0 {
                    return Err(e);
                }
                debug!("link {} of {} is promised elsewhere", level, from.hash);
                break;
            }
            let new_roster = (from.roster.id != block.roster.id).then(|| block.roster.clone());
            let msg = ForwardLink::message(&from.hash, &block.hash, new_roster.as_ref());
            let proposal = LinkProposal {
                block: block.clone(),
                from: from.hash,
                level,
            };
            let signature = match self
                .collective_sign(&from.roster, msg.as_ref(), bincode::serialize(&proposal)?, from.hash, level, block.hash)
                .await
            {
                Ok(signature) => signature,
                Err(e) => {
                    let holder = self.db.link_holder(&from.hash, level);
                    self.db.release_link(&from.hash, level, &block.hash)?;
                    if level > 0 {
                        warn!("keeping {} links for {}: level {} failed: {}", links.len(), block.hash, level, e);
                        break;
                    }
                    if holder.is_some_and(|h| h != block.hash) {
                        info!("{} lost link {} of {} to {:?}: {}", block.hash, level, from.hash, holder, e);
                        return Err(SkipchainError::NotLatest(from.hash));
                    }
                    return Err(e);
                }
            };
            links.push((
                from.hash,
                level,
                ForwardLink {
                    from: from.hash,
                    to: block.hash,
                    new_roster,
                    signature,
                },
            ));
            *planned.entry(from.hash).or_insert(0) += 1;
        }
        if links.is_empty() {
            return Err(SkipchainError::InvalidLink("no level could be signed".into()));
        }
        Ok(links)
    }

    /// How long an announced proposal keeps its slot on a signer.
    fn link_ttl(&self) -> Duration {
        Duration::from_millis(self.config.cosi_timeout_ms)
    }

    async fn collective_sign(
        &self,
        roster: &Roster,
        msg: &[u8],
        data: Vec<u8>,
        from: SkipBlockId,
        level: usize,
        target: SkipBlockId,
    ) -> SkipchainResult<CollectiveSignature> {
        let tree = Tree::rooted_at(roster.clone(), &self.server.identity().id, self.config.branching)?;
        let instance = self.server.new_instance(COSI_PROTOCOL, tree, Vec::new())?;
        let db = self.db.clone();
        let confirm: ConfirmFn = Arc::new(move |_: &[u8], _: &[u8]| db.lock_link(&from, level, &target).is_ok());
        let proto = CosiProtocol::new_root(
            instance.clone(),
            msg.to_vec(),
            data,
            confirm,
            Duration::from_millis(self.config.cosi_soft_timeout_ms),
            Duration::from_millis(self.config.cosi_timeout_ms),
        );
        self.server
            .run_root(instance, proto)
            .await?
            .ok_or_else(|| SkipchainError::Refused("root produced no signature".into()))
    }

    async fn propagate(&self, roster: &Roster, blocks: Vec<SkipBlock>) -> SkipchainResult<()> {
        let tree = Tree::rooted_at(roster.clone(), &self.server.identity().id, 0)?;
        let instance = self.server.new_instance(PROPAGATE_PROTOCOL, tree, Vec::new())?;
        let timeout = Duration::from_millis(self.config.propagate_timeout_ms);
        let proto = PropagateProtocol::new(instance.clone(), Arc::new(|_: Vec<SkipBlock>| Ok(())), timeout)
            .with_blocks(blocks);
        let acks = self.server.run_root(instance, proto).await?;
        if acks + 1 < roster.len() {
            warn!("only {} of {} nodes acknowledged the new blocks", acks, roster.len() - 1);
        }
        Ok(())
    }

    // ==================== FOLLOWER SIDE ====================

    fn verify_link_proposal(&self, msg: &[u8], data: &[u8]) -> bool {
        match self.check_link_proposal(msg, data) {
            Ok(()) => true,
            Err(e) => {
                warn!("{}: refusing link: {}", self.server.identity().address, e);
                false
            }
        }
    }

    /// Called right before this node's response share goes out.
    fn confirm_link_proposal(&self, data: &[u8]) -> bool {
        let locked = bincode::deserialize::<LinkProposal>(data)
            .map_err(SkipchainError::from)
            .and_then(|p| self.db.lock_link(&p.from, p.level, &p.block.hash));
        match locked {
            Ok(()) => true,
            Err(e) => {
                warn!("{}: withdrawing from link: {}", self.server.identity().address, e);
                false
            }
        }
    }

    fn check_link_proposal(&self, msg: &[u8], data: &[u8]) -> SkipchainResult<()> {
        let proposal: LinkProposal = bincode::deserialize(data)?;
        let block = &proposal.block;
        let from = self.db.get_or_err(&proposal.from)?;
        if from.forward_links.len() > proposal.level {
            return Err(SkipchainError::NotLatest(from.hash));
        }
        if block.back_links.get(proposal.level) != Some(&from.hash) {
            return Err(SkipchainError::InvalidLink("from block is not the back link of that level".into()));
        }
        let new_roster = (from.roster.id != block.roster.id).then_some(&block.roster);
        if ForwardLink::message(&from.hash, &block.hash, new_roster).as_ref() != msg {
            return Err(SkipchainError::InvalidLink("signed message does not match the block".into()));
        }
        let prev = self.db.get_or_err(&block.back_links[0])?;
        if prev.index + 1 != block.index || block.genesis != Some(prev.skipchain_id()) {
            return Err(SkipchainError::InvalidBlock("block does not follow its predecessor".into()));
        }
        if block.verifiers != prev.verifiers {
            return Err(SkipchainError::InvalidBlock("verifiers changed".into()));
        }
        self.verify_block(block)?;
        self.db.reserve_link(&from.hash, proposal.level, &block.hash, self.link_ttl())
    }

    /// Stores blocks pushed by a leader. Known blocks may only gain valid
    /// forward links; unknown blocks must be a genesis or be linked from a
    /// block already stored.
    pub fn store_propagated(&self, blocks: Vec<SkipBlock>) -> SkipchainResult<()> {
        for block in blocks {
            match self.db.get(&block.hash) {
                Some(known) => {
                    for link in block.forward_links.iter().skip(known.forward_links.len()) {
                        if link.from != known.hash {
                            return Err(SkipchainError::InvalidLink("link does not start at its block".into()));
                        }
                        link.verify(&known.roster)?;
                    }
                    self.db.store(block)?;
                }
                None => {
                    block.verify_structure()?;
                    block.verify_forward_links()?;
                    if !block.is_genesis() && !self.is_linked(&block) {
                        return Err(SkipchainError::InvalidLink(format!("nothing links to {}", block.hash)));
                    }
                    self.db.store(block.clone())?;
                    debug!("{}: stored propagated block {}", self.server.identity().address, block.hash);
                    self.notify(&block);
                }
            }
        }
        Ok(())
    }

    fn is_linked(&self, block: &SkipBlock) -> bool {
        block.back_links.iter().any(|id| {
            self.db
                .get(id)
                .map(|b| b.forward_links.iter().any(|l| l.to == block.hash))
                .unwrap_or(false)
        })
    }

    // ==================== QUERIES ====================

    pub fn get_update_chain(&self, req: &GetUpdateChain) -> SkipchainResult<GetUpdateChainReply> {
        Ok(GetUpdateChainReply {
            update: self.db.update_chain(&req.latest_id)?,
        })
    }

    pub fn get_single_block(&self, req: &GetSingleBlock) -> SkipchainResult<SkipBlock> {
        self.db.get_or_err(&req.id)
    }

    pub fn get_single_block_by_index(&self, req: &GetSingleBlockByIndex) -> SkipchainResult<SkipBlock> {
        self.db.block_by_index(&req.genesis, req.index)
    }

    pub fn get_all_skipchains(&self) -> GetAllSkipchainsReply {
        GetAllSkipchainsReply {
            latest: self.db.all_latest(),
        }
    }
}
