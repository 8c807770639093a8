use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use conode_crypto::Hash256;
use log::trace;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::identity::ServerId;
use crate::tree::Tree;
use crate::{OnetError, OnetResult};

/// Identifier of one protocol run.
pub type SessionId = Hash256;

/// Unit of transport between two servers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub session: SessionId,
    pub protocol: String,
    pub from: ServerId,
    pub to: ServerId,
    /// Tree of the session, needed by nodes that instantiate on first contact
    pub tree: Tree,
    /// Opaque per-session configuration set by the root
    pub config: Vec<u8>,
    pub payload: Vec<u8>,
}

/// Reliable authenticated point-to-point delivery.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, envelope: Envelope) -> OnetResult<()>;
}

/// In-process transport routing envelopes over unbounded channels.
///
/// Servers marked down neither send nor receive; their traffic is dropped
/// silently the way an unreachable host would behave.
#[derive(Default)]
pub struct LocalNetwork {
    routes: RwLock<HashMap<ServerId, mpsc::UnboundedSender<Envelope>>>,
    down: RwLock<HashSet<ServerId>>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, id: ServerId) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.write().insert(id, tx);
        rx
    }

    pub fn set_down(&self, id: ServerId, down: bool) {
        if down {
            self.down.write().insert(id);
        } else {
            self.down.write().remove(&id);
        }
    }

    pub fn is_down(&self, id: &ServerId) -> bool {
        self.down.read().contains(id)
    }
}

#[async_trait]
impl Transport for LocalNetwork {
    async fn send(&self, envelope: Envelope) -> OnetResult<()> {
        if self.is_down(&envelope.from) || self.is_down(&envelope.to) {
            trace!("dropping {} message {} -> {}", envelope.protocol, envelope.from, envelope.to);
            return Ok(());
        }
        let route = self.routes.read().get(&envelope.to).cloned();
        match route {
            Some(tx) => tx
                .send(envelope)
                .map_err(|e| OnetError::UnknownServer(e.0.to)),
            None => Err(OnetError::UnknownServer(envelope.to)),
        }
    }
}
