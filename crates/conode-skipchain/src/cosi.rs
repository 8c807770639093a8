// TREE COLLECTIVE SIGNING
// Four-phase Schnorr multi-signature over a communication tree:
// announcement down, commitments up, challenge down, responses up.
// Nodes that stay silent while committing become exceptions. Nodes that
// committed but stay silent while responding get excluded, and the root
// starts a new round with fresh commitments.
//
// SAFETY INVARIANTS:
// 1. A node that refuses the announced data never sets its mask bit
// 2. Challenges go only to children whose subtree committed
// 3. The root fails instead of signing below the roster threshold
// 4. The root verifies the aggregate before returning it
// 5. A nonce answers exactly one challenge; every round draws new nonces
// 6. No response share leaves a node whose confirm hook refused

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use conode_crypto::cosi::{aggregate_public, challenge};
use conode_crypto::{base_mul, random_scalar, CollectiveSignature, Mask, Point, Scalar};
use conode_onet::{Destination, Protocol, Step, Transition, TreeNodeInstance};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::SkipchainError;

pub const COSI_PROTOCOL: &str = "skipchain_cosi";

/// Decides whether this node signs `msg`, given the data it was announced with.
pub type VerifyFn = Arc<dyn Fn(&[u8], &[u8]) -> bool + Send + Sync>;

/// Last word of a node before its response share goes out.
pub type ConfirmFn = Arc<dyn Fn(&[u8], &[u8]) -> bool + Send + Sync>;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum CosiMessage {
    Announce {
        round: u32,
        msg: Vec<u8>,
        data: Vec<u8>,
        excluded: Mask,
    },
    Commitment {
        round: u32,
        commitment: Point,
        mask: Mask,
    },
    Challenge {
        round: u32,
        challenge: Scalar,
    },
    Response {
        round: u32,
        response: Scalar,
    },
    /// Nodes below the sender that committed in `round` but never responded
    Missing {
        round: u32,
        mask: Mask,
    },
    /// A node below the sender withdrew its share
    Refusal {
        round: u32,
    },
    Finished,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Announcement,
    Commitment,
    Challenge,
    Response,
    /// Response sent up; waiting for the end or for another round
    Settled,
    Done,
}

pub struct CosiProtocol {
    instance: TreeNodeInstance,
    verify: VerifyFn,
    confirm: ConfirmFn,
    soft: Duration,
    hard: Duration,
    msg: Vec<u8>,
    data: Vec<u8>,
    phase: Phase,
    round: u32,
    accepted: Option<bool>,
    excluded: Mask,
    secret: Option<Scalar>,
    commitment: Point,
    mask: Mask,
    pending: HashSet<usize>,
    committed: Vec<(usize, Mask)>,
    missing: Mask,
    response: Scalar,
}

impl CosiProtocol {
    pub fn new(instance: TreeNodeInstance, verify: VerifyFn, confirm: ConfirmFn, soft: Duration, hard: Duration) -> Self {
        let size = instance.size();
        CosiProtocol {
            instance,
            verify,
            confirm,
            soft,
            hard,
            msg: Vec::new(),
            data: Vec::new(),
            phase: Phase::Announcement,
            round: 0,
            accepted: None,
            excluded: Mask::new(size),
            secret: None,
            commitment: Point::default(),
            mask: Mask::new(size),
            pending: HashSet::new(),
            committed: Vec::new(),
            missing: Mask::new(size),
            response: Scalar::ZERO,
        }
    }

    /// Root side: the root signs `msg` without running a verify hook. It
    /// still asks `confirm` before answering its own challenge.
    pub fn new_root(
        instance: TreeNodeInstance,
        msg: Vec<u8>,
        data: Vec<u8>,
        confirm: ConfirmFn,
        soft: Duration,
        hard: Duration,
    ) -> Self {
        let mut proto = Self::new(instance, Arc::new(|_: &[u8], _: &[u8]| true), confirm, soft, hard);
        proto.msg = msg;
        proto.data = data;
        proto.accepted = Some(true);
        proto
    }

    fn reset_round(&mut self, round: u32) {
        let size = self.instance.size();
        self.round = round;
        self.secret = None;
        self.commitment = Point::default();
        self.mask = Mask::new(size);
        self.pending.clear();
        self.committed.clear();
        self.missing = Mask::new(size);
        self.response = Scalar::ZERO;
    }

    fn commit_own(&mut self) {
        let participate = self.accepted == Some(true) && !self.excluded.is_set(self.instance.index);
        if participate {
            let v = random_scalar();
            self.commitment += base_mul(&v);
            self.secret = Some(v);
            self.mask.set(self.instance.index, true);
        }
    }

    fn announce(&mut self) -> Step<Self> {
        self.phase = Phase::Commitment;
        let children = self.instance.children();
        if children.is_empty() {
            return self.commitments_done();
        }
        self.pending = children.into_iter().collect();
        Ok(Transition::send(
            Destination::Children,
            CosiMessage::Announce {
                round: self.round,
                msg: self.msg.clone(),
                data: self.data.clone(),
                excluded: self.excluded.clone(),
            },
        ))
    }

    fn commitments_done(&mut self) -> Step<Self> {
        if self.instance.is_root() {
            let roster = &self.instance.tree.roster;
            let participants = self.mask.count_enabled();
            let threshold = roster.threshold();
            if participants < threshold {
                return Err(SkipchainError::InsufficientSignatures {
                    participants,
                    threshold,
                });
            }
            if !(self.confirm)(&self.msg, &self.data) {
                return Err(SkipchainError::Refused("the root withdrew from signing".into()));
            }
            let aggregate = aggregate_public(&roster.publics(), &self.mask);
            let c = challenge(&self.commitment, &aggregate, &self.msg);
            return self.respond(c);
        }
        let up = CosiMessage::Commitment {
            round: self.round,
            commitment: self.commitment,
            mask: self.mask.clone(),
        };
        if self.mask.count_enabled() == 0 {
            // Nobody below signs, later rounds only exclude more nodes.
            self.phase = Phase::Done;
            return Ok(Transition::send(Destination::Parent, up).finish(None));
        }
        self.phase = Phase::Challenge;
        Ok(Transition::send(Destination::Parent, up))
    }

    fn respond(&mut self, c: Scalar) -> Step<Self> {
        self.phase = Phase::Response;
        if let Some(v) = self.secret.take() {
            self.response = v + c * self.instance.keypair.secret();
        }
        if self.committed.is_empty() {
            return self.responses_done();
        }
        self.pending = self.committed.iter().map(|(child, _)| *child).collect();
        let mut transition = Transition::none();
        for (child, _) in &self.committed {
            transition = transition.with(
                Destination::Node(*child),
                CosiMessage::Challenge {
                    round: self.round,
                    challenge: c,
                },
            );
        }
        Ok(transition)
    }

    fn responses_done(&mut self) -> Step<Self> {
        if self.missing.count_enabled() > 0 {
            return self.lost_responses();
        }
        if !self.instance.is_root() {
            self.phase = Phase::Settled;
            return Ok(Transition::send(
                Destination::Parent,
                CosiMessage::Response {
                    round: self.round,
                    response: self.response,
                },
            ));
        }
        self.phase = Phase::Done;
        let roster = &self.instance.tree.roster;
        let signature = CollectiveSignature {
            commitment: self.commitment,
            response: self.response,
            mask: self.mask.clone(),
        };
        signature.verify(&roster.publics(), &self.msg, roster.threshold())?;
        debug!(
            "collective signature with {} of {} signers after {} round(s)",
            signature.participants(),
            roster.len(),
            self.round + 1
        );
        Ok(Transition::send(Destination::Children, CosiMessage::Finished).finish(Some(signature)))
    }

    /// Some committed nodes never answered the challenge. Followers report
    /// them up; the root bars them and restarts if the rest still suffices.
    fn lost_responses(&mut self) -> Step<Self> {
        if !self.instance.is_root() {
            self.phase = Phase::Settled;
            return Ok(Transition::send(
                Destination::Parent,
                CosiMessage::Missing {
                    round: self.round,
                    mask: self.missing.clone(),
                },
            ));
        }
        let lost = self.missing.enabled();
        let participants = self
            .mask
            .enabled()
            .into_iter()
            .filter(|i| !self.missing.is_set(*i))
            .count();
        let threshold = self.instance.tree.roster.threshold();
        if participants < threshold {
            return Err(SkipchainError::InsufficientSignatures {
                participants,
                threshold,
            });
        }
        warn!("no response from {:?} in round {}, signing again without them", lost, self.round);
        let missing = self.missing.clone();
        self.excluded.merge(&missing);
        self.reset_round(self.round + 1);
        self.commit_own();
        self.announce()
    }

    fn start_round(&mut self, round: u32, msg: Vec<u8>, data: Vec<u8>, excluded: Mask) -> Step<Self> {
        if excluded.len() != self.excluded.len() {
            warn!("announcement with an exclusion mask of length {}", excluded.len());
            return Ok(Transition::none());
        }
        if self.accepted.is_none() {
            let accepted = (self.verify)(&msg, &data);
            if !accepted {
                warn!("node {} refuses to sign", self.instance.index);
            }
            self.accepted = Some(accepted);
            self.msg = msg;
            self.data = data;
        } else if msg != self.msg || data != self.data {
            warn!("round {} announces different data, ignoring it", round);
            return Ok(Transition::none());
        }
        self.excluded = excluded;
        self.reset_round(round);
        self.commit_own();
        self.announce()
    }

    fn is_parent(&self, from: usize) -> bool {
        Some(from) == self.instance.parent()
    }
}

impl Protocol for CosiProtocol {
    type Message = CosiMessage;
    type Output = Option<CollectiveSignature>;
    type Error = SkipchainError;

    fn start(&mut self) -> Step<Self> {
        self.commit_own();
        self.announce()
    }

    fn step(&mut self, from: usize, msg: CosiMessage) -> Step<Self> {
        match (self.phase, msg) {
            (Phase::Done, msg) => {
                debug!("ignoring {:?} from {} after the end", msg, from);
                Ok(Transition::none())
            }
            (
                phase,
                CosiMessage::Announce {
                    round,
                    msg,
                    data,
                    excluded,
                },
            ) if self.is_parent(from) && (phase == Phase::Announcement || round > self.round) => {
                self.start_round(round, msg, data, excluded)
            }
            (Phase::Commitment, CosiMessage::Commitment { round, commitment, mask })
                if round == self.round && self.pending.remove(&from) =>
            {
                if mask.len() != self.mask.len() {
                    warn!("commitment from {} has a mask of length {}", from, mask.len());
                } else if mask.count_enabled() > 0 {
                    self.commitment += commitment;
                    self.mask.merge(&mask);
                    self.committed.push((from, mask));
                }
                if self.pending.is_empty() {
                    return self.commitments_done();
                }
                Ok(Transition::none())
            }
            (Phase::Challenge, CosiMessage::Challenge { round, challenge })
                if round == self.round && self.is_parent(from) =>
            {
                if self.secret.is_some() && !(self.confirm)(&self.msg, &self.data) {
                    warn!("node {} withdraws its share in round {}", self.instance.index, round);
                    self.phase = Phase::Done;
                    return Ok(Transition::send(Destination::Parent, CosiMessage::Refusal { round }).finish(None));
                }
                self.respond(challenge)
            }
            (Phase::Response, CosiMessage::Response { round, response })
                if round == self.round && self.pending.remove(&from) =>
            {
                self.response += response;
                if self.pending.is_empty() {
                    return self.responses_done();
                }
                Ok(Transition::none())
            }
            (Phase::Response, CosiMessage::Missing { round, mask })
                if round == self.round && self.pending.remove(&from) =>
            {
                if mask.len() == self.missing.len() {
                    self.missing.merge(&mask);
                }
                if self.pending.is_empty() {
                    return self.responses_done();
                }
                Ok(Transition::none())
            }
            (Phase::Response, CosiMessage::Refusal { round }) if round == self.round && self.pending.contains(&from) => {
                if self.instance.is_root() {
                    return Err(SkipchainError::Refused(format!("node {} withdrew its share", from)));
                }
                self.phase = Phase::Done;
                Ok(Transition::send(Destination::Parent, CosiMessage::Refusal { round }).finish(None))
            }
            (_, CosiMessage::Finished) if self.is_parent(from) => {
                self.phase = Phase::Done;
                Ok(Transition::send(Destination::Children, CosiMessage::Finished).finish(None))
            }
            (phase, msg) => {
                debug!("ignoring {:?} from {} in phase {:?}", msg, from, phase);
                Ok(Transition::none())
            }
        }
    }

    fn soft_timeout(&self) -> Option<Duration> {
        if self.phase != Phase::Commitment && self.phase != Phase::Response {
            return None;
        }
        let depth = self.instance.tree.subtree_depth(self.instance.index).max(1) as u32;
        Some(self.soft * depth)
    }

    fn on_timeout(&mut self) -> Step<Self> {
        match self.phase {
            Phase::Commitment => {
                warn!("no commitment from {:?}, signing without them", self.pending);
                self.pending.clear();
                self.commitments_done()
            }
            Phase::Response => {
                for (child, mask) in &self.committed {
                    if self.pending.contains(child) {
                        self.missing.merge(mask);
                    }
                }
                self.pending.clear();
                self.responses_done()
            }
            _ => Ok(Transition::none()),
        }
    }

    fn timeout(&self) -> Duration {
        self.hard
    }
}
