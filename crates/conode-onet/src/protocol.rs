//! Protocol state machines and the driver that runs one of them per session.
//!
//! A protocol never touches the network itself. It reacts to one message at
//! a time and returns a [`Transition`] listing what to send and whether it is
//! done. [`run_instance`] owns the inbox, routes outgoing messages (including
//! those addressed to the node itself) and enforces the timeouts.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::server::{Server, TreeNodeInstance};
use crate::OnetError;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Where an outgoing message goes, in tree terms.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Destination {
    /// Roster index within the session tree
    Node(usize),
    Parent,
    Children,
    /// Every node of the tree, including this one
    All,
    /// Every node of the tree except this one
    Others,
}

#[derive(Debug)]
pub enum Status<O> {
    Continue,
    Done(O),
}

#[derive(Debug)]
pub struct Transition<M, O> {
    pub outgoing: Vec<(Destination, M)>,
    pub status: Status<O>,
}

impl<M, O> Transition<M, O> {
    pub fn none() -> Self {
        Transition {
            outgoing: Vec::new(),
            status: Status::Continue,
        }
    }

    pub fn send(dest: Destination, msg: M) -> Self {
        Self::none().with(dest, msg)
    }

    pub fn done(output: O) -> Self {
        Self::none().finish(output)
    }

    pub fn with(mut self, dest: Destination, msg: M) -> Self {
        self.outgoing.push((dest, msg));
        self
    }

    pub fn finish(mut self, output: O) -> Self {
        self.status = Status::Done(output);
        self
    }

    pub fn is_done(&self) -> bool {
        matches!(self.status, Status::Done(_))
    }
}

pub type Step<P> = Result<
    Transition<<P as Protocol>::Message, <P as Protocol>::Output>,
    <P as Protocol>::Error,
>;

pub trait Protocol: Send + 'static {
    type Message: Serialize + DeserializeOwned + Clone + fmt::Debug + Send + 'static;
    type Output: Send + 'static;
    type Error: From<OnetError> + fmt::Display + Send + 'static;

    /// Called on the root only, before any message is received.
    fn start(&mut self) -> Step<Self> {
        Ok(Transition::none())
    }

    /// Handles one message from the node at roster index `from`.
    fn step(&mut self, from: usize, msg: Self::Message) -> Step<Self>;

    /// Maximum idle time before [`Protocol::on_timeout`] fires.
    fn soft_timeout(&self) -> Option<Duration> {
        None
    }

    fn on_timeout(&mut self) -> Step<Self> {
        Ok(Transition::none())
    }

    /// Hard limit for the whole run.
    fn timeout(&self) -> Duration {
        DEFAULT_TIMEOUT
    }
}

pub(crate) async fn run_instance<P: Protocol>(
    server: &Arc<Server>,
    mut proto: P,
    instance: &TreeNodeInstance,
    mut inbox: mpsc::UnboundedReceiver<(usize, Vec<u8>)>,
) -> Result<P::Output, P::Error> {
    let deadline = Instant::now() + proto.timeout();
    let mut local: VecDeque<(usize, P::Message)> = VecDeque::new();

    let first = if instance.is_root() {
        proto.start()?
    } else {
        Transition::none()
    };
    if let Some(out) = deliver::<P>(server, instance, first, &mut local).await? {
        return Ok(out);
    }

    loop {
        let transition = if let Some((from, msg)) = local.pop_front() {
            proto.step(from, msg)?
        } else {
            let now = Instant::now();
            if now >= deadline {
                return Err(OnetError::Timeout(instance.protocol.clone()).into());
            }
            let wait_until = match proto.soft_timeout() {
                Some(soft) => (now + soft).min(deadline),
                None => deadline,
            };
            match tokio::time::timeout_at(wait_until, inbox.recv()).await {
                Ok(Some((from, bytes))) => match bincode::deserialize::<P::Message>(&bytes) {
                    Ok(msg) => proto.step(from, msg)?,
                    Err(e) => {
                        warn!("{}: undecodable message from {}: {}", instance.protocol, from, e);
                        continue;
                    }
                },
                Ok(None) => return Err(OnetError::SessionClosed.into()),
                Err(_) if wait_until >= deadline => {
                    return Err(OnetError::Timeout(instance.protocol.clone()).into())
                }
                Err(_) => {
                    debug!("{}: soft timeout at node {}", instance.protocol, instance.index);
                    proto.on_timeout()?
                }
            }
        };
        if let Some(out) = deliver::<P>(server, instance, transition, &mut local).await? {
            return Ok(out);
        }
    }
}

async fn deliver<P: Protocol>(
    server: &Arc<Server>,
    instance: &TreeNodeInstance,
    transition: Transition<P::Message, P::Output>,
    local: &mut VecDeque<(usize, P::Message)>,
) -> Result<Option<P::Output>, P::Error> {
    for (dest, msg) in transition.outgoing {
        let targets = instance.resolve(dest);
        if targets.is_empty() {
            continue;
        }
        let bytes = bincode::serialize(&msg).map_err(OnetError::from)?;
        for idx in targets {
            if idx == instance.index {
                local.push_back((idx, msg.clone()));
            } else if let Err(e) = server.send_to(instance, idx, bytes.clone()).await {
                warn!("{}: could not reach node {}: {}", instance.protocol, idx, e);
            }
        }
    }
    Ok(match transition.status {
        Status::Done(out) => Some(out),
        Status::Continue => None,
    })
}
