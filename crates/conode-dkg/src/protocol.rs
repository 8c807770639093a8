//! Runs a [`DistKeyGenerator`] across a session tree.
//!
//! Init → StartDeal → Deal → Response* → (WaitSetup/WaitReply) → done.
//! The root checks everybody is alive, fixes the participant keys and the
//! threshold and starts the dealing. Deals are unicast to their verifier,
//! responses broadcast to every node. Deals or responses that overtake the
//! StartDeal are held back until the generator exists.

use std::time::Duration;

use conode_crypto::{bft_threshold, Point, PubPoly};
use conode_onet::{Destination, Protocol, Step, Transition, TreeNodeInstance};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::generator::{Deal, DistKeyGenerator, Response};
use crate::{DistKeyShare, DkgError, DkgResult};

pub const DKG_PROTOCOL: &str = "dkg_setup";

/// What the root needs to move an existing key to a new set of nodes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReshareInfo {
    /// Current share holders, in share index order
    pub old_nodes: Vec<Point>,
    /// Future share holders, in share index order
    pub new_nodes: Vec<Point>,
    pub threshold: usize,
    /// Public polynomial of the key being reshared
    pub commits: Vec<Point>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum DkgMessage {
    Init { wait: bool },
    InitReply { public: Point },
    StartDeal {
        publics: Vec<Point>,
        threshold: usize,
        reshare: Option<ReshareInfo>,
    },
    Deal(Deal),
    Response(Response),
    WaitSetup,
    WaitReply,
}

type Outgoing = Vec<(Destination, DkgMessage)>;

pub struct SetupProtocol {
    instance: TreeNodeInstance,
    wait: bool,
    timeout: Duration,
    share: Option<DistKeyShare>,
    reshare: Option<ReshareInfo>,
    init_replies: usize,
    generator: Option<DistKeyGenerator>,
    held: Vec<(usize, DkgMessage)>,
    wait_setup: bool,
    wait_setup_sent: bool,
    wait_replies: usize,
}

impl SetupProtocol {
    pub fn new(instance: TreeNodeInstance, wait: bool, timeout: Duration) -> Self {
        SetupProtocol {
            instance,
            wait,
            timeout,
            share: None,
            reshare: None,
            init_replies: 0,
            generator: None,
            held: Vec::new(),
            wait_setup: false,
            wait_setup_sent: false,
            wait_replies: 0,
        }
    }

    /// The share this node holds of the key being reshared.
    pub fn with_share(mut self, share: Option<DistKeyShare>) -> Self {
        self.share = share;
        self
    }

    /// Root only: reshare an existing key instead of creating a new one.
    pub fn with_reshare(mut self, info: ReshareInfo) -> Self {
        self.reshare = Some(info);
        self
    }

    fn others(&self) -> usize {
        self.instance.size() - 1
    }

    fn start_deal(&self) -> DkgMessage {
        let publics = self.instance.tree.roster.publics();
        let threshold = match &self.reshare {
            Some(info) => info.threshold,
            None => bft_threshold(publics.len()),
        };
        DkgMessage::StartDeal {
            publics,
            threshold,
            reshare: self.reshare.clone(),
        }
    }

    fn tree_index(&self, public: &Point) -> DkgResult<usize> {
        self.instance
            .tree
            .roster
            .index_of_public(public)
            .ok_or_else(|| DkgError::InvalidConfig("participant missing from the session tree".into()))
    }

    fn handle(&mut self, from: usize, msg: DkgMessage, out: &mut Outgoing) -> DkgResult<()> {
        match msg {
            DkgMessage::Init { wait } => {
                self.wait = wait;
                out.push((
                    Destination::Node(from),
                    DkgMessage::InitReply {
                        public: self.instance.keypair.public(),
                    },
                ));
            }
            DkgMessage::InitReply { public } => {
                let expected = self.instance.tree.server(from).map(|si| si.public);
                if expected != Some(public) {
                    return Err(DkgError::InvalidConfig(format!("node {} answered with a foreign key", from)));
                }
                self.init_replies += 1;
                if self.init_replies == self.others() {
                    out.push((Destination::All, self.start_deal()));
                }
            }
            DkgMessage::StartDeal {
                publics,
                threshold,
                reshare,
            } => {
                if self.generator.is_some() {
                    return Err(DkgError::InvalidConfig("second StartDeal".into()));
                }
                let keypair = self.instance.keypair.clone();
                let generator = match reshare {
                    None => DistKeyGenerator::new(keypair, publics, threshold)?,
                    Some(info) => DistKeyGenerator::new_reshare(
                        keypair,
                        info.old_nodes,
                        info.new_nodes,
                        info.threshold,
                        PubPoly::new(info.commits),
                        self.share.as_ref(),
                    )?,
                };
                if generator.dealer_index().is_some() {
                    for deal in generator.deals()? {
                        let to = self.tree_index(&generator.new_nodes()[deal.verifier as usize])?;
                        out.push((Destination::Node(to), DkgMessage::Deal(deal)));
                    }
                }
                debug!(
                    "node {} dealing as {:?}, verifying as {:?}",
                    self.instance.index,
                    generator.dealer_index(),
                    generator.verifier_index()
                );
                self.generator = Some(generator);
                for (from, msg) in std::mem::take(&mut self.held) {
                    self.handle(from, msg, out)?;
                }
            }
            msg @ (DkgMessage::Deal(_) | DkgMessage::Response(_)) if self.generator.is_none() => {
                self.held.push((from, msg));
            }
            DkgMessage::Deal(deal) => {
                if let Some(generator) = self.generator.as_mut() {
                    let response = generator.process_deal(&deal)?;
                    out.push((Destination::All, DkgMessage::Response(response)));
                }
            }
            DkgMessage::Response(response) => {
                if let Some(generator) = self.generator.as_mut() {
                    match generator.process_response(&response) {
                        Ok(()) => {}
                        Err(e) if e.is_benign() => warn!("node {}: {}", self.instance.index, e),
                        Err(e) => return Err(e),
                    }
                }
            }
            DkgMessage::WaitSetup => self.wait_setup = true,
            DkgMessage::WaitReply => self.wait_replies += 1,
        }
        Ok(())
    }

    fn complete(&self) -> bool {
        self.generator
            .as_ref()
            .map(|g| g.responses_seen() == g.expected_responses())
            .unwrap_or(false)
    }

    fn result(&self) -> DkgResult<Option<DistKeyShare>> {
        let Some(generator) = &self.generator else {
            return Err(DkgError::NotCertified);
        };
        if !generator.certified() {
            return Err(DkgError::NotCertified);
        }
        if generator.verifier_index().is_none() {
            return Ok(None);
        }
        let share = generator.dist_key_share()?;
        info!("node {} holds dkg share {}", self.instance.index, share.share.index);
        Ok(Some(share))
    }

    fn advance(&mut self, mut out: Outgoing) -> Step<Self> {
        let mut transition = Transition::none();
        if self.complete() {
            if self.instance.is_root() {
                if !self.wait || self.others() == 0 {
                    transition = transition.finish(self.result()?);
                } else {
                    if !self.wait_setup_sent {
                        self.wait_setup_sent = true;
                        out.push((Destination::Others, DkgMessage::WaitSetup));
                    }
                    if self.wait_replies == self.others() {
                        transition = transition.finish(self.result()?);
                    }
                }
            } else if !self.wait {
                transition = transition.finish(self.result()?);
            } else if self.wait_setup {
                let root = self.instance.tree.root;
                out.push((Destination::Node(root), DkgMessage::WaitReply));
                transition = transition.finish(self.result()?);
            }
        }
        for (dest, msg) in out {
            transition = transition.with(dest, msg);
        }
        Ok(transition)
    }
}

impl Protocol for SetupProtocol {
    type Message = DkgMessage;
    type Output = Option<DistKeyShare>;
    type Error = DkgError;

    fn start(&mut self) -> Step<Self> {
        if self.others() == 0 {
            return Ok(Transition::send(Destination::All, self.start_deal()));
        }
        Ok(Transition::send(Destination::Others, DkgMessage::Init { wait: self.wait }))
    }

    fn step(&mut self, from: usize, msg: DkgMessage) -> Step<Self> {
        let mut out = Vec::new();
        self.handle(from, msg, &mut out)?;
        self.advance(out)
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}
