// CLUSTER TESTS
// A local cluster is bootstrapped from configuration and serves a full
// write, read and decrypt round through the bootstrapped LTS.

use conode::{ConodeConfig, ConodeError, LocalCluster};
use conode_byzcoin::{AddTxRequest, Arguments, ClientTransaction, GetProof, InstanceId, Instruction, Proof, Signer};
use conode_calypso::{decode_key, DecryptKey, Read, Write, CONTRACT_READ, CONTRACT_WRITE};
use conode_crypto::KeyPair;
use conode_skipchain::SkipBlockId;

fn fast_config() -> ConodeConfig {
    let mut cfg = ConodeConfig::default();
    cfg.skipchain.base_height = 2;
    cfg.skipchain.max_height = 3;
    cfg.skipchain.cosi_soft_timeout_ms = 300;
    cfg.byzcoin.block_interval_ms = 100;
    cfg.byzcoin.tx_wait_blocks = 10;
    cfg
}

async fn send(cluster: &LocalCluster, scid: SkipBlockId, owner: &Signer, counter: u64, inst: Instruction) -> InstanceId {
    let inst = inst.signed_by(vec![owner.identity()], vec![counter]);
    let mut tx = ClientTransaction::new(vec![inst]);
    tx.sign(&[owner]);
    cluster
        .conode(0)
        .unwrap()
        .byzcoin
        .add_transaction(AddTxRequest {
            skipchain_id: scid,
            transaction: tx.clone(),
            inclusion_wait: 10,
        })
        .await
        .unwrap();
    tx.instructions[0].derive_id("")
}

fn proof(cluster: &LocalCluster, scid: SkipBlockId, key: InstanceId) -> Proof {
    cluster
        .conode(0)
        .unwrap()
        .byzcoin
        .get_proof(&GetProof { skipchain_id: scid, key })
        .unwrap()
}

#[test]
fn test_empty_cluster_is_rejected() {
    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let mut cfg = fast_config();
        cfg.nodes = 0;
        assert!(matches!(LocalCluster::start(cfg), Err(ConodeError::Invalid(_))));
    });
}

#[tokio::test]
async fn test_bootstrapped_cluster_hands_out_keys() {
    let _ = env_logger::builder().is_test(true).try_init();
    let cluster = LocalCluster::start(fast_config()).unwrap();
    assert_eq!(cluster.conodes().len(), 4);
    assert!(cluster.conodes().iter().all(|c| !c.is_persistent()));

    let owner = Signer::generate();
    let boot = cluster.bootstrap(&owner).await.unwrap();
    for conode in cluster.conodes() {
        assert_eq!(conode.calypso.get_lts_reply(&boot.lts.instance_id).unwrap(), boot.lts);
    }

    // The bootstrap spent counter 1.
    let darc_id = boot.darc.get_base_id();
    let key = b"an AES key of thirty-two bytes!!".to_vec();
    let write = Write::new(boot.lts.instance_id, &darc_id, &boot.lts.x, &key).unwrap();
    let write_id = send(
        &cluster,
        boot.byzcoin_id,
        &owner,
        2,
        Instruction::spawn(
            darc_id,
            CONTRACT_WRITE,
            Arguments::new().with("write", bincode::serialize(&write).unwrap()),
        ),
    )
    .await;

    let reader = KeyPair::generate();
    let read = Read {
        write: write_id,
        xc: reader.public(),
    };
    let read_id = send(
        &cluster,
        boot.byzcoin_id,
        &owner,
        3,
        Instruction::spawn(
            write_id,
            CONTRACT_READ,
            Arguments::new().with("read", bincode::serialize(&read).unwrap()),
        ),
    )
    .await;

    let reply = cluster
        .conode(1)
        .unwrap()
        .calypso
        .decrypt_key(DecryptKey {
            read: proof(&cluster, boot.byzcoin_id, read_id),
            write: proof(&cluster, boot.byzcoin_id, write_id),
            ephemeral: None,
            signature: None,
        })
        .await
        .unwrap();
    assert_eq!(decode_key(&reply.x, &reply.cs, &reply.xhat_enc, reader.secret()).unwrap(), key);
}

#[tokio::test]
async fn test_persistent_cluster_opens_one_database_per_conode() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = fast_config();
    cfg.nodes = 3;
    cfg.data_dir = Some(dir.path().to_path_buf());
    let cluster = LocalCluster::start(cfg.clone()).unwrap();
    assert!(cluster.conodes().iter().all(|c| c.is_persistent()));
    for i in 0..3 {
        assert!(cfg.node_dir(i).unwrap().exists());
    }
    assert!(cluster.conode(3).is_err());
}
