// Runs a small aggregation protocol over real trees of local servers.

use std::time::Duration;

use conode_onet::{
    Destination, LocalCothority, OnetError, Protocol, Step, Transition, Tree, TreeNodeInstance,
};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
enum CountMsg {
    Count,
    Reply(usize),
}

/// Every node answers with the number of live nodes in its subtree.
struct CountProtocol {
    instance: TreeNodeInstance,
    waiting: usize,
    total: usize,
    soft: Option<Duration>,
}

impl CountProtocol {
    fn new(instance: TreeNodeInstance, soft: Option<Duration>) -> Self {
        CountProtocol {
            instance,
            waiting: 0,
            total: 0,
            soft,
        }
    }

    fn begin(&mut self) -> Step<Self> {
        self.total = 1;
        self.waiting = self.instance.children().len();
        if self.waiting == 0 {
            return self.finish();
        }
        Ok(Transition::send(Destination::Children, CountMsg::Count))
    }

    fn finish(&mut self) -> Step<Self> {
        if self.instance.is_root() {
            Ok(Transition::done(self.total))
        } else {
            Ok(Transition::send(Destination::Parent, CountMsg::Reply(self.total)).finish(self.total))
        }
    }
}

impl Protocol for CountProtocol {
    type Message = CountMsg;
    type Output = usize;
    type Error = OnetError;

    fn start(&mut self) -> Step<Self> {
        self.begin()
    }

    fn step(&mut self, _from: usize, msg: CountMsg) -> Step<Self> {
        match msg {
            CountMsg::Count => self.begin(),
            CountMsg::Reply(n) => {
                self.total += n;
                self.waiting = self.waiting.saturating_sub(1);
                if self.waiting == 0 {
                    self.finish()
                } else {
                    Ok(Transition::none())
                }
            }
        }
    }

    fn soft_timeout(&self) -> Option<Duration> {
        self.soft
            .map(|s| s * (self.instance.tree.subtree_depth(self.instance.index) as u32).max(1))
    }

    fn on_timeout(&mut self) -> Step<Self> {
        self.waiting = 0;
        self.finish()
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(2)
    }
}

fn setup(n: usize, soft: Option<Duration>) -> LocalCothority {
    let _ = env_logger::builder().is_test(true).try_init();
    let local = LocalCothority::new(n);
    for server in &local.servers {
        server.register_protocol::<CountProtocol, _, _>(
            "count",
            move |inst: &TreeNodeInstance| Ok(CountProtocol::new(inst.clone(), soft)),
            |_: &TreeNodeInstance, _: Result<usize, OnetError>| {},
        );
    }
    local
}

async fn count(local: &LocalCothority, tree: Tree) -> Result<usize, OnetError> {
    let root = local.server(tree.root).clone();
    let instance = root.new_instance("count", tree, Vec::new())?;
    let proto = CountProtocol::new(instance.clone(), None);
    root.run_root(instance, proto).await
}

#[tokio::test]
async fn test_star_counts_every_node() {
    let local = setup(5, None);
    let tree = Tree::star(local.roster.clone(), 0).unwrap();
    assert_eq!(count(&local, tree).await.unwrap(), 5);
}

#[tokio::test]
async fn test_binary_tree_aggregates_subtrees() {
    let local = setup(7, None);
    let tree = Tree::new(local.roster.clone(), 3, 2).unwrap();
    assert_eq!(count(&local, tree).await.unwrap(), 7);
}

#[tokio::test]
async fn test_sessions_are_independent() {
    let local = setup(4, None);
    let t1 = Tree::star(local.roster.clone(), 0).unwrap();
    let t2 = Tree::star(local.roster.clone(), 1).unwrap();
    let (a, b) = tokio::join!(count(&local, t1), count(&local, t2));
    assert_eq!(a.unwrap(), 4);
    assert_eq!(b.unwrap(), 4);
}

#[tokio::test]
async fn test_down_node_is_excluded_after_soft_timeout() {
    let local = setup(5, Some(Duration::from_millis(200)));
    local.set_down(3, true);
    let tree = Tree::star(local.roster.clone(), 0).unwrap();
    let root = local.server(0).clone();
    let instance = root.new_instance("count", tree, Vec::new()).unwrap();
    let proto = CountProtocol::new(instance.clone(), Some(Duration::from_millis(200)));
    assert_eq!(root.run_root(instance, proto).await.unwrap(), 4);
}

#[tokio::test]
async fn test_down_node_without_soft_timeout_times_out() {
    let local = setup(3, None);
    local.set_down(2, true);
    let tree = Tree::star(local.roster.clone(), 0).unwrap();
    match count(&local, tree).await {
        Err(OnetError::Timeout(name)) => assert_eq!(name, "count"),
        other => panic!("expected timeout, got {:?}", other),
    }
}
