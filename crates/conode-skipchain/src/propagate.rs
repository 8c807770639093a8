//! Pushes freshly signed blocks to every member of a roster over a star.
//!
//! The root counts acknowledgements and gives up on silent members after
//! the soft timeout; members that fail to store simply don't acknowledge.

use std::sync::Arc;
use std::time::Duration;

use conode_onet::{Destination, Protocol, Step, Transition, TreeNodeInstance};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::block::SkipBlock;
use crate::{SkipchainError, SkipchainResult};

pub const PROPAGATE_PROTOCOL: &str = "skipchain_propagate";

pub type StoreFn = Arc<dyn Fn(Vec<SkipBlock>) -> SkipchainResult<()> + Send + Sync>;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum PropagateMessage {
    Blocks(Vec<SkipBlock>),
    Ack,
}

pub struct PropagateProtocol {
    instance: TreeNodeInstance,
    store: StoreFn,
    blocks: Vec<SkipBlock>,
    waiting: usize,
    acks: usize,
    timeout: Duration,
}

impl PropagateProtocol {
    pub fn new(instance: TreeNodeInstance, store: StoreFn, timeout: Duration) -> Self {
        PropagateProtocol {
            instance,
            store,
            blocks: Vec::new(),
            waiting: 0,
            acks: 0,
            timeout,
        }
    }

    pub fn with_blocks(mut self, blocks: Vec<SkipBlock>) -> Self {
        self.blocks = blocks;
        self
    }
}

impl Protocol for PropagateProtocol {
    type Message = PropagateMessage;
    type Output = usize;
    type Error = SkipchainError;

    fn start(&mut self) -> Step<Self> {
        self.waiting = self.instance.size() - 1;
        if self.waiting == 0 {
            return Ok(Transition::done(0));
        }
        let blocks = std::mem::take(&mut self.blocks);
        Ok(Transition::send(Destination::Others, PropagateMessage::Blocks(blocks)))
    }

    fn step(&mut self, from: usize, msg: PropagateMessage) -> Step<Self> {
        match msg {
            PropagateMessage::Blocks(blocks) => match (self.store)(blocks) {
                Ok(()) => Ok(Transition::send(Destination::Node(from), PropagateMessage::Ack).finish(1)),
                Err(e) => {
                    warn!("node {} could not store propagated blocks: {}", self.instance.index, e);
                    Ok(Transition::done(0))
                }
            },
            PropagateMessage::Ack => {
                self.acks += 1;
                self.waiting = self.waiting.saturating_sub(1);
                if self.waiting == 0 {
                    Ok(Transition::done(self.acks))
                } else {
                    Ok(Transition::none())
                }
            }
        }
    }

    fn soft_timeout(&self) -> Option<Duration> {
        self.instance.is_root().then_some(self.timeout)
    }

    fn on_timeout(&mut self) -> Step<Self> {
        debug!("propagation stopped waiting with {} acks", self.acks);
        Ok(Transition::done(self.acks))
    }

    fn timeout(&self) -> Duration {
        self.timeout * 2
    }
}
