// DKG PROTOCOL TESTS
// Full setup and resharing runs between in-process conodes.

use std::sync::Arc;
use std::time::Duration;

use conode_crypto::share::{recover_commit, recover_secret};
use conode_crypto::{base_mul, PriShare, PubShare};
use conode_dkg::{DistKeyShare, DkgError, ReshareInfo, SetupProtocol, DKG_PROTOCOL};
use conode_onet::{LocalCothority, Roster, Server, Tree, TreeNodeInstance};
use tokio::sync::mpsc;

const TIMEOUT: Duration = Duration::from_secs(10);

type Outcome = (usize, Result<Option<DistKeyShare>, String>);

/// Registers the setup protocol on `server`, reporting child outcomes on `tx`.
fn register(server: &Arc<Server>, share: Option<DistKeyShare>, tx: mpsc::UnboundedSender<Outcome>) {
    server.register_protocol::<SetupProtocol, _, _>(
        DKG_PROTOCOL,
        move |inst: &TreeNodeInstance| Ok(SetupProtocol::new(inst.clone(), false, TIMEOUT).with_share(share.clone())),
        move |inst: &TreeNodeInstance, res: Result<Option<DistKeyShare>, DkgError>| {
            let _ = tx.send((inst.index, res.map_err(|e| e.to_string())));
        },
    );
}

async fn collect(rx: &mut mpsc::UnboundedReceiver<Outcome>, n: usize) -> Vec<Outcome> {
    let mut out = Vec::new();
    while out.len() < n {
        let next = tokio::time::timeout(TIMEOUT, rx.recv()).await.unwrap().unwrap();
        out.push(next);
    }
    out.sort_by_key(|(i, _)| *i);
    out
}

/// Runs a fresh setup over `roster` rooted at its first member, returning
/// every share in index order.
async fn setup(local: &LocalCothority, roster: &Roster, wait: bool) -> Vec<DistKeyShare> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    for server in &local.servers {
        register(server, None, tx.clone());
    }
    let root = local
        .servers
        .iter()
        .find(|s| s.identity().id == roster.list[0].id)
        .unwrap()
        .clone();
    let tree = Tree::star(roster.clone(), 0).unwrap();
    let instance = root.new_instance(DKG_PROTOCOL, tree, Vec::new()).unwrap();
    let proto = SetupProtocol::new(instance.clone(), wait, TIMEOUT);
    let root_share = root.run_root(instance, proto).await.unwrap().unwrap();

    let mut shares = vec![root_share];
    for (_, res) in collect(&mut rx, roster.len() - 1).await {
        shares.push(res.unwrap().unwrap());
    }
    shares.sort_by_key(|s| s.share.index);
    shares
}

#[tokio::test]
async fn test_setup_yields_one_key_recoverable_from_any_threshold() {
    let _ = env_logger::builder().is_test(true).try_init();
    let local = LocalCothority::new(5);
    let shares = setup(&local, &local.roster, true).await;

    let x = shares[0].public();
    assert!(shares.iter().all(|s| s.public() == x && s.threshold() == 4));
    let pri: Vec<PriShare> = shares.iter().map(|s| s.share).collect();
    for skip in 0..5 {
        let subset: Vec<PriShare> = pri.iter().copied().filter(|s| s.index != skip).collect();
        assert_eq!(base_mul(&recover_secret(&subset, 4).unwrap()), x);
    }
    let publics: Vec<PubShare> = shares.iter().map(|s| s.pub_poly().eval(s.share.index)).collect();
    assert_eq!(recover_commit(&publics[1..], 4).unwrap(), x);
}

#[tokio::test]
async fn test_reshare_moves_the_key_to_a_new_roster() {
    let _ = env_logger::builder().is_test(true).try_init();
    let local = LocalCothority::new(6);
    let old = local.sub_roster(&[0, 1, 2, 3]);
    let old_shares = setup(&local, &old, false).await;
    let x = old_shares[0].public();
    let old_secret = recover_secret(&old_shares.iter().map(|s| s.share).collect::<Vec<_>>(), 3).unwrap();

    // Server 0 leaves, servers 4 and 5 join; server 1 leads.
    let new = local.sub_roster(&[1, 2, 3, 4, 5]);
    let (tx, mut rx) = mpsc::unbounded_channel();
    for (i, server) in local.servers.iter().enumerate() {
        let share = (i < 4).then(|| old_shares[i].clone());
        register(server, share, tx.clone());
    }
    let info = ReshareInfo {
        old_nodes: old.publics(),
        new_nodes: new.publics(),
        threshold: new.threshold(),
        commits: old_shares[0].commits.clone(),
    };
    let tree = Tree::star(new.concat(&old), 0).unwrap();
    let root = local.server(1).clone();
    let instance = root.new_instance(DKG_PROTOCOL, tree, Vec::new()).unwrap();
    let proto = SetupProtocol::new(instance.clone(), true, TIMEOUT)
        .with_share(Some(old_shares[1].clone()))
        .with_reshare(info);
    let root_share = root.run_root(instance, proto).await.unwrap().unwrap();
    root_share.check_reshare(&old_shares[1]).unwrap();

    let outcomes = collect(&mut rx, 5).await;
    let mut new_shares = vec![root_share];
    for (tree_index, res) in outcomes {
        let res = res.unwrap();
        // The leaving server sits last in the concatenated roster.
        if tree_index == 5 {
            assert!(res.is_none());
        } else {
            new_shares.push(res.unwrap());
        }
    }
    assert_eq!(new_shares.len(), 5);
    for s in &new_shares {
        assert_eq!(s.public(), x);
        assert_eq!(s.threshold(), 4);
    }
    let pri: Vec<PriShare> = new_shares.iter().map(|s| s.share).collect();
    assert_eq!(recover_secret(&pri[..4], 4).unwrap(), old_secret);
}

#[tokio::test]
async fn test_single_node_setup_finishes_alone() {
    let local = LocalCothority::new(1);
    let shares = setup(&local, &local.roster, true).await;
    assert_eq!(shares.len(), 1);
    assert_eq!(base_mul(&shares[0].share.value), shares[0].public());
}
