// CALYPSO TESTS
// A ledger runs on every conode; an LTS is set up over part of the roster,
// secrets are written under its key and handed out to matching readers,
// before and after the LTS moves to another roster.

use std::sync::Arc;

use conode_byzcoin::{
    AddTxRequest, Arguments, ByzCoinConfig, ByzCoinService, ClientTransaction, DefaultGenesisMsg, GetProof,
    InstanceId, Instruction, Proof, Signer,
};
use conode_calypso::{
    decode_key, CalypsoConfig, CalypsoError, CalypsoService, CreateLts, CreateLtsReply, DecryptKey,
    DecryptKeyReply, LtsId, LtsInstanceInfo, LtsStore, Read, ReshareLts, Write, CONTRACT_LTS, CONTRACT_READ,
    CONTRACT_WRITE,
};
use conode_crypto::{point_to_bytes, Hash256, KeyPair};
use conode_onet::{LocalCothority, Roster};
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

struct Cluster {
    local: LocalCothority,
    byzcoin: Vec<Arc<ByzCoinService>>,
    calypso: Vec<Arc<CalypsoService>>,
    scid: SkipBlockId,
    owner: Signer,
    counter: u64,
    darc_id: Hash256,
}

impl Cluster {
    async fn start(n: usize) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let local = LocalCothority::new(n);
        let mut byzcoin = Vec::new();
        let mut calypso = Vec::new();
        for server in &local.servers {
            let sc = SkipchainService::new(server.clone(), SkipBlockDb::in_memory(), skipchain_config());
            let bc = ByzCoinService::new(sc, ByzCoinConfig::default());
            calypso.push(CalypsoService::new(bc.clone(), LtsStore::in_memory(), CalypsoConfig::default()));
            byzcoin.push(bc);
        }
        let owner = Signer::generate();
        let msg = DefaultGenesisMsg::with_owner(
            local.roster.clone(),
            &owner.identity(),
            &["spawn:calypsoWrite", "spawn:calypsoRead", "spawn:longTermSecret", "invoke:reshare"],
            100,
        );
        let reply = byzcoin[0].create_genesis_block(msg).await.unwrap();
        Cluster {
            scid: reply.skipblock.hash,
            darc_id: reply.darc.get_base_id(),
            local,
            byzcoin,
            calypso,
            owner,
            counter: 0,
        }
    }

    /// Commits `inst` and returns the id of the instance it spawns.
    async fn send(&mut self, inst: Instruction) -> InstanceId {
        self.counter += 1;
        let inst = inst.signed_by(vec![self.owner.identity()], vec![self.counter]);
        let mut tx = ClientTransaction::new(vec![inst]);
        tx.sign(&[&self.owner]);
        self.byzcoin[0]
            .add_transaction(AddTxRequest {
                skipchain_id: self.scid,
                transaction: tx.clone(),
                inclusion_wait: 10,
            })
            .await
            .unwrap();
        tx.instructions[0].derive_id("")
    }

    fn proof(&self, key: InstanceId) -> Proof {
        let proof = self.byzcoin[0]
            .get_proof(&GetProof {
                skipchain_id: self.scid,
                key,
            })
            .unwrap();
        assert!(proof.matches(&key));
        proof
    }

    async fn create_lts(&mut self, roster: Roster) -> CreateLtsReply {
        let info = LtsInstanceInfo { roster };
        let id = self
            .send(Instruction::spawn(
                self.darc_id,
                CONTRACT_LTS,
                Arguments::new().with("lts_instance_info", bincode::serialize(&info).unwrap()),
            ))
            .await;
        self.calypso[0]
            .create_lts(CreateLts { proof: self.proof(id) })
            .await
            .unwrap()
    }

    async fn reshare(&mut self, leader: usize, lts_id: LtsId, roster: Roster) {
        let info = LtsInstanceInfo { roster };
        self.send(Instruction::invoke(
            lts_id,
            "reshare",
            Arguments::new().with("lts_instance_info", bincode::serialize(&info).unwrap()),
        ))
        .await;
        self.calypso[leader]
            .reshare_lts(ReshareLts {
                proof: self.proof(lts_id),
            })
            .await
            .unwrap();
    }

    async fn write(&mut self, lts: &CreateLtsReply, key: &[u8]) -> InstanceId {
        let write = Write::new(lts.instance_id, &self.darc_id, &lts.x, key).unwrap();
        self.send(Instruction::spawn(
            self.darc_id,
            CONTRACT_WRITE,
            Arguments::new().with("write", bincode::serialize(&write).unwrap()),
        ))
        .await
    }

    async fn read(&mut self, write: InstanceId, reader: &KeyPair) -> InstanceId {
        let read = Read {
            write,
            xc: reader.public(),
        };
        self.send(Instruction::spawn(
            write,
            CONTRACT_READ,
            Arguments::new().with("read", bincode::serialize(&read).unwrap()),
        ))
        .await
    }

    async fn decrypt(&self, node: usize, read: InstanceId, write: InstanceId) -> Result<DecryptKeyReply, CalypsoError> {
        self.calypso[node]
            .decrypt_key(DecryptKey {
                read: self.proof(read),
                write: self.proof(write),
                ephemeral: None,
                signature: None,
            })
            .await
    }
}

#[tokio::test]
async fn test_matching_read_recovers_the_key() {
    let mut cluster = Cluster::start(4).await;
    let lts = cluster.create_lts(cluster.local.roster.clone()).await;
    assert_eq!(lts.byzcoin_id, cluster.scid);
    for service in &cluster.calypso {
        assert_eq!(service.get_lts_reply(&lts.instance_id).unwrap(), lts);
    }

    let key = b"0123456789abcdef0123456789abcdef".to_vec();
    let write = cluster.write(&lts, &key).await;
    let reader = KeyPair::generate();
    let read = cluster.read(write, &reader).await;

    let reply = cluster.decrypt(0, read, write).await.unwrap();
    assert_eq!(reply.x, lts.x);
    assert_eq!(decode_key(&reply.x, &reply.cs, &reply.xhat_enc, reader.secret()).unwrap(), key);

    // Any member of the group can lead the re-encryption.
    let reply = cluster.decrypt(2, read, write).await.unwrap();
    assert_eq!(decode_key(&reply.x, &reply.cs, &reply.xhat_enc, reader.secret()).unwrap(), key);
}

#[tokio::test]
async fn test_read_of_another_write_is_refused() {
    let mut cluster = Cluster::start(4).await;
    let lts = cluster.create_lts(cluster.local.roster.clone()).await;
    let first = cluster.write(&lts, b"first key").await;
    let second = cluster.write(&lts, b"second key").await;
    let reader = KeyPair::generate();
    let read_first = cluster.read(first, &reader).await;

    let err = cluster.decrypt(0, read_first, second).await.unwrap_err();
    assert!(matches!(err, CalypsoError::Mismatch));

    // Swapped proofs name the wrong instance kinds.
    let err = cluster.decrypt(0, first, read_first).await.unwrap_err();
    assert!(matches!(err, CalypsoError::WrongInstance(_, _)));
}

#[tokio::test]
async fn test_ephemeral_key_must_be_signed_by_the_reader() {
    let mut cluster = Cluster::start(4).await;
    let lts = cluster.create_lts(cluster.local.roster.clone()).await;
    let key = b"ephemeral delivery".to_vec();
    let write = cluster.write(&lts, &key).await;
    let reader = KeyPair::generate();
    let read = cluster.read(write, &reader).await;

    let ephemeral = KeyPair::generate();
    let request = |signer: &KeyPair| DecryptKey {
        read: cluster.proof(read),
        write: cluster.proof(write),
        ephemeral: Some(ephemeral.public()),
        signature: Some(signer.sign(&point_to_bytes(&ephemeral.public()))),
    };

    let reply = cluster.calypso[1].decrypt_key(request(&reader)).await.unwrap();
    assert_eq!(decode_key(&reply.x, &reply.cs, &reply.xhat_enc, ephemeral.secret()).unwrap(), key);

    let stranger = KeyPair::generate();
    assert!(cluster.calypso[1].decrypt_key(request(&stranger)).await.is_err());
}

#[tokio::test]
async fn test_reshared_lts_still_decrypts_older_writes() {
    let mut cluster = Cluster::start(5).await;
    let first = cluster.local.sub_roster(&[0, 1, 2, 3]);
    let lts = cluster.create_lts(first).await;
    let key = b"written before the reshare".to_vec();
    let write = cluster.write(&lts, &key).await;
    let reader = KeyPair::generate();
    let read = cluster.read(write, &reader).await;

    // Server 0 leaves, server 4 joins; server 1 leads.
    let second = cluster.local.sub_roster(&[1, 2, 3, 4]);
    cluster.reshare(1, lts.instance_id, second.clone()).await;

    let reply = cluster.decrypt(4, read, write).await.unwrap();
    assert_eq!(reply.x, lts.x);
    assert_eq!(decode_key(&reply.x, &reply.cs, &reply.xhat_enc, reader.secret()).unwrap(), key);

    let joined = cluster.calypso[4].store().get(&lts.instance_id).unwrap();
    assert_eq!(joined.roster, second);
    assert_eq!(joined.share.as_ref().unwrap().public(), lts.x);
    let left = cluster.calypso[0].store().get(&lts.instance_id).unwrap();
    assert!(left.share.is_none());

    let err = cluster.decrypt(0, read, write).await.unwrap_err();
    assert!(matches!(err, CalypsoError::NotMember));
}
