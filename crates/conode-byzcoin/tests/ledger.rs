// LEDGER TESTS
// Four conodes run a ledger: coins are spawned, minted and moved, refused
// transactions leave no trace, and proofs check out against the ledger id.

use std::sync::Arc;

use conode_byzcoin::contracts::coin::CONTRACT_COIN;
use conode_byzcoin::{
    AddTxRequest, ByzCoinConfig, ByzCoinError, ByzCoinService, ClientTransaction, Coin, DefaultGenesisMsg,
    GetProof, GetSignerCounters, Instruction, Arguments, InstanceId, Signer,
};
use conode_crypto::{Hash256, KeyPair};
use conode_onet::{LocalCothority, Server};
use conode_skipchain::{SkipBlockDb, SkipBlockId, SkipchainConfig, SkipchainService};

fn skipchain_config() -> SkipchainConfig {
    SkipchainConfig {
        base_height: 2,
        max_height: 3,
        branching: 0,
        cosi_timeout_ms: 3_000,
        cosi_soft_timeout_ms: 300,
        propagate_timeout_ms: 1_000,
    }
}

struct Ledger {
    local: LocalCothority,
    services: Vec<Arc<ByzCoinService>>,
    scid: SkipBlockId,
    owner: Signer,
    counter: u64,
    darc_id: Hash256,
}

impl Ledger {
    async fn start(n: usize) -> Self {
        Self::start_with(n, None).await
    }

    /// Like `start`, with the leader's blocks written to `db`.
    async fn start_with(n: usize, db: Option<&sled::Db>) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let local = LocalCothority::new(n);
        let services: Vec<Arc<ByzCoinService>> = local
            .servers
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let blocks = match db {
                    Some(db) if i == 0 => SkipBlockDb::open(db).unwrap(),
                    _ => SkipBlockDb::in_memory(),
                };
                let sc = SkipchainService::new(s.clone(), blocks, skipchain_config());
                ByzCoinService::new(sc, ByzCoinConfig::default())
            })
            .collect();
        let owner = Signer::generate();
        let msg = DefaultGenesisMsg::with_owner(
            local.roster.clone(),
            &owner.identity(),
            &["spawn:coin", "invoke:mint", "invoke:transfer", "delete"],
            100,
        );
        let reply = services[0].create_genesis_block(msg).await.unwrap();
        Ledger {
            scid: reply.skipblock.hash,
            darc_id: reply.darc.get_base_id(),
            local,
            services,
            owner,
            counter: 0,
        }
    }

    async fn send(&mut self, inst: Instruction) -> Result<ClientTransaction, ByzCoinError> {
        self.counter += 1;
        let inst = inst.signed_by(vec![self.owner.identity()], vec![self.counter]);
        let mut tx = ClientTransaction::new(vec![inst]);
        tx.sign(&[&self.owner]);
        let res = self.services[0]
            .add_transaction(AddTxRequest {
                skipchain_id: self.scid,
                transaction: tx.clone(),
                inclusion_wait: 10,
            })
            .await;
        match res {
            Ok(_) => Ok(tx),
            Err(e) => {
                self.counter -= 1;
                Err(e)
            }
        }
    }

    async fn spawn_coin(&mut self) -> InstanceId {
        let tx = self
            .send(Instruction::spawn(self.darc_id, CONTRACT_COIN, Arguments::new()))
            .await
            .unwrap();
        tx.instructions[0].derive_id("")
    }

    fn balance(&self, node: usize, id: &InstanceId) -> u64 {
        let entry = self.services[node].get_instance(&self.scid, id).unwrap().unwrap();
        bincode::deserialize::<Coin>(&entry.value).unwrap().value
    }
}

fn coins(n: u64) -> Arguments {
    Arguments::new().with("coins", n.to_le_bytes().to_vec())
}

#[tokio::test]
async fn test_coins_move_and_refusals_leave_no_trace() {
    let mut ledger = Ledger::start(4).await;
    let a = ledger.spawn_coin().await;
    let b = ledger.spawn_coin().await;
    ledger.send(Instruction::invoke(a, "mint", coins(1000))).await.unwrap();
    ledger
        .send(Instruction::invoke(a, "transfer", coins(100).with("destination", b.as_bytes().to_vec())))
        .await
        .unwrap();

    for node in 0..4 {
        assert_eq!(ledger.balance(node, &a), 900);
        assert_eq!(ledger.balance(node, &b), 100);
    }

    let root = ledger.services[0].latest_block(&ledger.scid).unwrap();
    let err = ledger
        .send(Instruction::invoke(b, "transfer", coins(10_000).with("destination", a.as_bytes().to_vec())))
        .await
        .unwrap_err();
    assert!(matches!(err, ByzCoinError::TxRefused(_)));
    for node in 0..4 {
        assert_eq!(ledger.balance(node, &a), 900);
        assert_eq!(ledger.balance(node, &b), 100);
    }
    // The refused transaction is still recorded in a new block.
    let latest = ledger.services[0].latest_block(&ledger.scid).unwrap();
    assert!(latest.index > root.index);

    let counters = ledger.services[3]
        .get_signer_counters(&GetSignerCounters {
            skipchain_id: ledger.scid,
            signer_ids: vec![ledger.owner.identity(), Signer::generate().identity()],
        })
        .unwrap();
    assert_eq!(counters, vec![4, 0]);
}

#[tokio::test]
async fn test_proofs_verify_against_the_ledger_id() {
    let mut ledger = Ledger::start(4).await;
    let a = ledger.spawn_coin().await;
    for _ in 0..4 {
        ledger.send(Instruction::invoke(a, "mint", coins(1))).await.unwrap();
    }

    let proof = ledger.services[2]
        .get_proof(&GetProof {
            skipchain_id: ledger.scid,
            key: a,
        })
        .unwrap();
    proof.verify(&ledger.scid, &a).unwrap();
    assert!(proof.matches(&a));
    let entry = proof.entry(&a).unwrap().unwrap();
    assert_eq!(entry.contract_id, CONTRACT_COIN);
    assert_eq!(bincode::deserialize::<Coin>(&entry.value).unwrap().value, 4);
    assert!(proof.links.len() < proof.latest.index as usize);
    let (key, stored) = proof.key_value().unwrap().unwrap();
    assert_eq!(key, a);
    assert_eq!(stored, entry);

    let absent = Hash256::digest(b"nobody");
    let proof = ledger.services[1]
        .get_proof(&GetProof {
            skipchain_id: ledger.scid,
            key: absent,
        })
        .unwrap();
    proof.verify(&ledger.scid, &absent).unwrap();
    assert!(!proof.matches(&absent));

    // Wrong ledger id, dropped link, altered block data.
    assert!(proof.verify(&Hash256::digest(b"other"), &absent).is_err());
    let mut cut = proof.clone();
    cut.links.pop();
    assert!(cut.verify(&ledger.scid, &absent).is_err());
    let mut altered = proof.clone();
    altered.latest.data.push(0);
    assert!(altered.verify(&ledger.scid, &absent).is_err());
}

#[tokio::test]
async fn test_only_the_leader_takes_transactions() {
    let mut ledger = Ledger::start(4).await;
    let leader = ledger.local.roster.list[0].id;
    let inst = Instruction::spawn(ledger.darc_id, CONTRACT_COIN, Arguments::new())
        .signed_by(vec![ledger.owner.identity()], vec![1]);
    let mut tx = ClientTransaction::new(vec![inst]);
    tx.sign(&[&ledger.owner]);
    let err = ledger.services[1]
        .add_transaction(AddTxRequest {
            skipchain_id: ledger.scid,
            transaction: tx,
            inclusion_wait: 0,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ByzCoinError::NotLeader(id) if id == leader));

    let err = ledger.services[0]
        .add_transaction(AddTxRequest {
            skipchain_id: Hash256::digest(b"unknown"),
            transaction: ClientTransaction::new(vec![]),
            inclusion_wait: 0,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ByzCoinError::UnknownChain(_)));

    // Replaying an accepted transaction is refused on its counter.
    let tx = ledger
        .send(Instruction::spawn(ledger.darc_id, CONTRACT_COIN, Arguments::new()))
        .await
        .unwrap();
    let err = ledger.services[0]
        .add_transaction(AddTxRequest {
            skipchain_id: ledger.scid,
            transaction: tx,
            inclusion_wait: 10,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ByzCoinError::TxRefused(_)));
}

#[tokio::test]
async fn test_ledger_state_reloads_from_the_block_store() {
    let db = sled::Config::new().temporary(true).open().unwrap();
    let mut ledger = Ledger::start_with(4, Some(&db)).await;
    let a = ledger.spawn_coin().await;
    ledger.send(Instruction::invoke(a, "mint", coins(50))).await.unwrap();

    // A node coming back up with the same database.
    let server = Server::new(KeyPair::generate(), "local://restarted", ledger.local.network.clone());
    let sc = SkipchainService::new(server, SkipBlockDb::open(&db).unwrap(), skipchain_config());
    let restarted = ByzCoinService::new(sc, ByzCoinConfig::default());
    assert_eq!(restarted.load_stored().unwrap(), 1);

    let before = ledger.services[0].latest_block(&ledger.scid).unwrap();
    assert_eq!(restarted.latest_block(&ledger.scid).unwrap().hash, before.hash);
    let entry = restarted.get_instance(&ledger.scid, &a).unwrap().unwrap();
    assert_eq!(bincode::deserialize::<Coin>(&entry.value).unwrap().value, 50);
}
