use std::sync::Arc;

use conode_crypto::KeyPair;
use tokio::task::JoinHandle;

use crate::identity::Roster;
use crate::network::LocalNetwork;
use crate::server::Server;

/// `n` servers wired to one in-process network. Must be built inside a
/// tokio runtime; the dispatch loops stop when this value is dropped.
pub struct LocalCothority {
    pub network: Arc<LocalNetwork>,
    pub servers: Vec<Arc<Server>>,
    pub roster: Roster,
    handles: Vec<JoinHandle<()>>,
}

impl LocalCothority {
    pub fn new(n: usize) -> Self {
        let network = LocalNetwork::new();
        let mut servers = Vec::with_capacity(n);
        let mut handles = Vec::with_capacity(n);
        for i in 0..n {
            let server = Server::new(KeyPair::generate(), format!("local://conode-{}", i), network.clone());
            let rx = network.register(server.identity().id);
            handles.push(server.start(rx));
            servers.push(server);
        }
        let roster = Roster::new(servers.iter().map(|s| s.identity().clone()).collect());
        LocalCothority {
            network,
            servers,
            roster,
            handles,
        }
    }

    pub fn server(&self, i: usize) -> &Arc<Server> {
        &self.servers[i]
    }

    /// Roster of the servers at the given positions, in that order.
    pub fn sub_roster(&self, indices: &[usize]) -> Roster {
        Roster::new(
            indices
                .iter()
                .map(|&i| self.servers[i].identity().clone())
                .collect(),
        )
    }

    pub fn set_down(&self, i: usize, down: bool) {
        self.network.set_down(self.servers[i].identity().id, down);
    }
}

impl Drop for LocalCothority {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}
