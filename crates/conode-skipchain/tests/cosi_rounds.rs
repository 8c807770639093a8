// COSI ROUNDS
// Signers that commit and then vanish before responding are excluded and
// the root signs again with the ones still reachable.

use std::sync::Arc;
use std::time::Duration;

use conode_crypto::CollectiveSignature;
use conode_onet::{LocalCothority, Tree, TreeNodeInstance};
use conode_skipchain::cosi::{ConfirmFn, CosiProtocol, VerifyFn, COSI_PROTOCOL};
use conode_skipchain::SkipchainError;

const SOFT: Duration = Duration::from_millis(200);
const HARD: Duration = Duration::from_millis(3_000);

/// Registers the signing protocol everywhere; the nodes in `vanishing`
/// drop off the network right before their response share leaves.
fn setup(n: usize, vanishing: &[usize]) -> LocalCothority {
    let _ = env_logger::builder().is_test(true).try_init();
    let local = LocalCothority::new(n);
    for (i, server) in local.servers.iter().enumerate() {
        let verify: VerifyFn = Arc::new(|_: &[u8], _: &[u8]| true);
        let confirm: ConfirmFn = if vanishing.contains(&i) {
            let network = local.network.clone();
            let id = server.identity().id;
            Arc::new(move |_: &[u8], _: &[u8]| {
                network.set_down(id, true);
                true
            })
        } else {
            Arc::new(|_: &[u8], _: &[u8]| true)
        };
        server.register_protocol::<CosiProtocol, _, _>(
            COSI_PROTOCOL,
            move |inst: &TreeNodeInstance| Ok(CosiProtocol::new(inst.clone(), verify.clone(), confirm.clone(), SOFT, HARD)),
            |_: &TreeNodeInstance, _: Result<Option<CollectiveSignature>, SkipchainError>| {},
        );
    }
    local
}

async fn sign(local: &LocalCothority, msg: &[u8]) -> Result<Option<CollectiveSignature>, SkipchainError> {
    let root = &local.servers[0];
    let tree = Tree::rooted_at(local.roster.clone(), &root.identity().id, 0).unwrap();
    let instance = root.new_instance(COSI_PROTOCOL, tree, Vec::new()).unwrap();
    let confirm: ConfirmFn = Arc::new(|_: &[u8], _: &[u8]| true);
    let proto = CosiProtocol::new_root(instance.clone(), msg.to_vec(), b"data".to_vec(), confirm, SOFT, HARD);
    root.run_root(instance, proto).await
}

#[tokio::test]
async fn test_all_responders_sign_in_one_round() {
    let local = setup(4, &[]);
    let sig = sign(&local, b"all here").await.unwrap().unwrap();
    assert!(sig.exceptions().is_empty());
    sig.verify(&local.roster.publics(), b"all here", local.roster.threshold()).unwrap();
}

#[tokio::test]
async fn test_node_lost_after_committing_becomes_an_exception() {
    let local = setup(4, &[3]);
    let sig = sign(&local, b"one vanishes").await.unwrap().unwrap();
    assert_eq!(sig.exceptions(), vec![3]);
    sig.verify(&local.roster.publics(), b"one vanishes", local.roster.threshold()).unwrap();
}

#[tokio::test]
async fn test_losing_quorum_after_committing_fails() {
    let local = setup(4, &[2, 3]);
    match sign(&local, b"two vanish").await {
        Err(SkipchainError::InsufficientSignatures { participants, threshold }) => {
            assert_eq!(participants, 2);
            assert_eq!(threshold, 3);
        }
        other => panic!("expected InsufficientSignatures, got {:?}", other.map(|s| s.map(|s| s.exceptions()))),
    }
}
