use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::Arc;

use conode_crypto::{Hash256, KeyPair};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use rand::RngCore;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::identity::ServerIdentity;
use crate::network::{Envelope, SessionId, Transport};
use crate::protocol::{run_instance, Destination, Protocol};
use crate::tree::Tree;
use crate::{OnetError, OnetResult};

type Inbox = mpsc::UnboundedReceiver<(usize, Vec<u8>)>;

/// Everything a protocol needs to know about its place in a session.
#[derive(Clone, Debug)]
pub struct TreeNodeInstance {
    pub session: SessionId,
    pub protocol: String,
    pub tree: Tree,
    /// Roster index of this node
    pub index: usize,
    pub config: Vec<u8>,
    pub keypair: KeyPair,
}

impl TreeNodeInstance {
    pub fn is_root(&self) -> bool {
        self.tree.is_root(self.index)
    }

    pub fn is_leaf(&self) -> bool {
        self.tree.is_leaf(self.index)
    }

    pub fn parent(&self) -> Option<usize> {
        self.tree.parent(self.index)
    }

    pub fn children(&self) -> Vec<usize> {
        self.tree.children(self.index)
    }

    pub fn identity(&self) -> Option<&ServerIdentity> {
        self.tree.server(self.index)
    }

    pub fn size(&self) -> usize {
        self.tree.size()
    }

    pub fn resolve(&self, dest: Destination) -> Vec<usize> {
        match dest {
            Destination::Node(i) if i < self.size() => vec![i],
            Destination::Node(_) => Vec::new(),
            Destination::Parent => self.parent().into_iter().collect(),
            Destination::Children => self.children(),
            Destination::All => (0..self.size()).collect(),
            Destination::Others => (0..self.size()).filter(|&i| i != self.index).collect(),
        }
    }
}

/// Creates protocol instances on nodes that are contacted for a new session.
pub trait InstanceFactory: Send + Sync {
    fn spawn(&self, server: Arc<Server>, instance: TreeNodeInstance, inbox: Inbox) -> OnetResult<()>;
}

struct TypedFactory<P, F, D> {
    make: F,
    done: Arc<D>,
    _proto: PhantomData<fn() -> P>,
}

impl<P, F, D> InstanceFactory for TypedFactory<P, F, D>
where
    P: Protocol,
    F: Fn(&TreeNodeInstance) -> Result<P, P::Error> + Send + Sync + 'static,
    D: Fn(&TreeNodeInstance, Result<P::Output, P::Error>) + Send + Sync + 'static,
{
    fn spawn(&self, server: Arc<Server>, instance: TreeNodeInstance, inbox: Inbox) -> OnetResult<()> {
        let proto = (self.make)(&instance).map_err(|e| OnetError::Protocol(e.to_string()))?;
        let done = self.done.clone();
        tokio::spawn(async move {
            let result = run_instance(&server, proto, &instance, inbox).await;
            server.finish_session(&instance.session);
            done(&instance, result);
        });
        Ok(())
    }
}

/// A conode: its identity, transport endpoint and session dispatcher.
pub struct Server {
    identity: ServerIdentity,
    keypair: KeyPair,
    transport: Arc<dyn Transport>,
    sessions: Mutex<HashMap<SessionId, mpsc::UnboundedSender<(usize, Vec<u8>)>>>,
    finished: Mutex<HashSet<SessionId>>,
    factories: RwLock<HashMap<String, Arc<dyn InstanceFactory>>>,
}

impl Server {
    pub fn new(keypair: KeyPair, address: impl Into<String>, transport: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new(Server {
            identity: ServerIdentity::new(keypair.public(), address),
            keypair,
            transport,
            sessions: Mutex::new(HashMap::new()),
            finished: Mutex::new(HashSet::new()),
            factories: RwLock::new(HashMap::new()),
        })
    }

    pub fn identity(&self) -> &ServerIdentity {
        &self.identity
    }

    pub fn keypair(&self) -> &KeyPair {
        &self.keypair
    }

    /// Registers how to build protocol `name` when another node contacts us.
    /// `done` receives the outcome of every such non-root instance.
    pub fn register_protocol<P, F, D>(&self, name: &str, make: F, done: D)
    where
        P: Protocol,
        F: Fn(&TreeNodeInstance) -> Result<P, P::Error> + Send + Sync + 'static,
        D: Fn(&TreeNodeInstance, Result<P::Output, P::Error>) + Send + Sync + 'static,
    {
        let factory = TypedFactory {
            make,
            done: Arc::new(done),
            _proto: PhantomData,
        };
        self.factories.write().insert(name.to_string(), Arc::new(factory));
        debug!("{}: registered protocol {}", self.identity.address, name);
    }

    /// Spawns the dispatch loop for envelopes arriving on `rx`.
    pub fn start(self: &Arc<Self>, mut rx: mpsc::UnboundedReceiver<Envelope>) -> JoinHandle<()> {
        let server = Arc::clone(self);
        tokio::spawn(async move {
            info!("{}: listening", server.identity.address);
            while let Some(envelope) = rx.recv().await {
                server.dispatch(envelope);
            }
        })
    }

    /// Prepares the root instance of a new session.
    pub fn new_instance(&self, protocol: &str, tree: Tree, config: Vec<u8>) -> OnetResult<TreeNodeInstance> {
        let index = tree
            .index_of(&self.identity.id)
            .ok_or(OnetError::NotInTree(self.identity.id))?;
        let mut session = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut session);
        Ok(TreeNodeInstance {
            session: Hash256(session),
            protocol: protocol.to_string(),
            tree,
            index,
            config,
            keypair: self.keypair.clone(),
        })
    }

    /// Runs `proto` as root of `instance` until it finishes or times out.
    pub async fn run_root<P: Protocol>(
        self: &Arc<Self>,
        instance: TreeNodeInstance,
        proto: P,
    ) -> Result<P::Output, P::Error> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sessions.lock().insert(instance.session, tx);
        let result = run_instance(self, proto, &instance, rx).await;
        self.finish_session(&instance.session);
        result
    }

    pub(crate) async fn send_to(&self, instance: &TreeNodeInstance, to: usize, payload: Vec<u8>) -> OnetResult<()> {
        let target = instance
            .tree
            .server(to)
            .ok_or_else(|| OnetError::InvalidTree(format!("no node {}", to)))?;
        let envelope = Envelope {
            session: instance.session,
            protocol: instance.protocol.clone(),
            from: self.identity.id,
            to: target.id,
            tree: instance.tree.clone(),
            config: instance.config.clone(),
            payload,
        };
        self.transport.send(envelope).await
    }

    fn finish_session(&self, session: &SessionId) {
        self.sessions.lock().remove(session);
        self.finished.lock().insert(*session);
    }

    fn dispatch(self: &Arc<Self>, envelope: Envelope) {
        if self.finished.lock().contains(&envelope.session) {
            debug!(
                "{}: dropping late {} message for finished session",
                self.identity.address, envelope.protocol
            );
            return;
        }
        let Some(from) = envelope.tree.index_of(&envelope.from) else {
            warn!("{}: sender {} not in session tree", self.identity.address, envelope.from);
            return;
        };

        let existing = self.sessions.lock().get(&envelope.session).cloned();
        if let Some(tx) = existing {
            if tx.send((from, envelope.payload)).is_err() {
                debug!("{}: session already closed", self.identity.address);
            }
            return;
        }

        let Some(index) = envelope.tree.index_of(&self.identity.id) else {
            warn!("{}: not part of the tree for {}", self.identity.address, envelope.protocol);
            return;
        };
        let factory = self.factories.read().get(&envelope.protocol).cloned();
        let Some(factory) = factory else {
            warn!("{}: {}", self.identity.address, OnetError::UnknownProtocol(envelope.protocol));
            return;
        };

        let (tx, rx) = mpsc::unbounded_channel();
        // The first message is queued before the instance exists.
        let _ = tx.send((from, envelope.payload));
        self.sessions.lock().insert(envelope.session, tx);

        let instance = TreeNodeInstance {
            session: envelope.session,
            protocol: envelope.protocol,
            tree: envelope.tree,
            index,
            config: envelope.config,
            keypair: self.keypair.clone(),
        };
        let session = instance.session;
        let protocol = instance.protocol.clone();
        if let Err(e) = factory.spawn(Arc::clone(self), instance, rx) {
            warn!("{}: could not start {}: {}", self.identity.address, protocol, e);
            self.finish_session(&session);
        }
    }
}
