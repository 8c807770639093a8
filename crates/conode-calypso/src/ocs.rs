//! Threshold re-encryption of a write's `U` towards a reader key `Xc`.
//!
//! The root sends the request to every node including itself. A node that
//! holds a share `v_i` and accepts the request answers with
//! `U_i = v_i·(U + Xc)` and a proof that it used the same `v_i` as the one
//! committed in the LTS polynomial. The root interpolates
//! `XhatEnc = x·(U + Xc)` from `threshold` valid answers.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use conode_crypto::share::recover_commit;
use conode_crypto::{base_mul, hash_to_scalar, point_to_bytes, random_scalar, Point, PubPoly, PubShare, Scalar};
use conode_dkg::SharedSecret;
use conode_onet::{Destination, Protocol, Step, Transition, TreeNodeInstance};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::CalypsoError;

pub const OCS_PROTOCOL: &str = "calypso_ocs";

/// Decides from the verification data, `U` and the target key whether this
/// node may contribute its share.
pub type VerifyRequest = Arc<dyn Fn(&[u8], &Point, &Point) -> bool + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReencryptedShare {
    pub ui: PubShare,
    pub ei: Scalar,
    pub fi: Scalar,
}

fn share_challenge(ui: &Point, uhat: &Point, hhat: &Point) -> Scalar {
    hash_to_scalar(&[&point_to_bytes(ui), &point_to_bytes(uhat), &point_to_bytes(hhat)])
}

impl ReencryptedShare {
    pub fn new(secret: &SharedSecret, u: &Point, xc: &Point) -> Self {
        let base = u + xc;
        let ui = base * secret.v;
        let si = random_scalar();
        let ei = share_challenge(&ui, &(base * si), &base_mul(&si));
        ReencryptedShare {
            ui: PubShare {
                index: secret.index,
                value: ui,
            },
            ei,
            fi: si + ei * secret.v,
        }
    }

    /// Checks the share against the public polynomial of the LTS.
    pub fn verify(&self, poly: &PubPoly, u: &Point, xc: &Point) -> bool {
        let base = u + xc;
        let hi = poly.eval(self.ui.index).value;
        let uhat = base * self.fi - self.ui.value * self.ei;
        let hhat = base_mul(&self.fi) - hi * self.ei;
        share_challenge(&self.ui.value, &uhat, &hhat) == self.ei
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum OcsMessage {
    Reencrypt { u: Point, xc: Point, verification: Vec<u8> },
    /// None when the node refuses or holds no share
    Reply(Option<ReencryptedShare>),
}

struct Request {
    u: Point,
    xc: Point,
    verification: Vec<u8>,
}

pub struct OcsProtocol {
    instance: TreeNodeInstance,
    secret: Option<SharedSecret>,
    verify: Option<VerifyRequest>,
    timeout: Duration,
    request: Option<Request>,
    replied: HashSet<usize>,
    shares: Vec<PubShare>,
    refused: usize,
}

impl OcsProtocol {
    /// Root side. The caller has already checked the request.
    pub fn root(
        instance: TreeNodeInstance,
        secret: SharedSecret,
        u: Point,
        xc: Point,
        verification: Vec<u8>,
        timeout: Duration,
    ) -> Self {
        OcsProtocol {
            instance,
            secret: Some(secret),
            verify: None,
            timeout,
            request: Some(Request { u, xc, verification }),
            replied: HashSet::new(),
            shares: Vec::new(),
            refused: 0,
        }
    }

    /// Node side: answers once, after `verify` accepted the request.
    pub fn node(
        instance: TreeNodeInstance,
        secret: Option<SharedSecret>,
        verify: VerifyRequest,
        timeout: Duration,
    ) -> Self {
        OcsProtocol {
            instance,
            secret,
            verify: Some(verify),
            timeout,
            request: None,
            replied: HashSet::new(),
            shares: Vec::new(),
            refused: 0,
        }
    }

    fn threshold(&self) -> usize {
        self.secret.as_ref().map(|s| s.commits.len()).unwrap_or(0)
    }

    fn answer(&self, u: &Point, xc: &Point, verification: &[u8]) -> Option<ReencryptedShare> {
        let secret = self.secret.as_ref()?;
        if let Some(verify) = &self.verify {
            if !verify(verification, u, xc) {
                warn!("node {} refuses to re-encrypt", self.instance.index);
                return None;
            }
        }
        Some(ReencryptedShare::new(secret, u, xc))
    }

    fn collect(&mut self, from: usize, reply: Option<ReencryptedShare>) -> Step<Self> {
        let (Some(request), Some(secret)) = (&self.request, &self.secret) else {
            return Ok(Transition::none());
        };
        if !self.replied.insert(from) {
            debug!("second re-encryption reply from node {}", from);
            return Ok(Transition::none());
        }
        let poly = PubPoly::new(secret.commits.clone());
        match reply {
            Some(share) if share.ui.index as usize == from && share.verify(&poly, &request.u, &request.xc) => {
                self.shares.push(share.ui);
            }
            Some(_) => {
                warn!("{}", CalypsoError::InvalidShare(from as u32));
                self.refused += 1;
            }
            None => self.refused += 1,
        }

        let threshold = self.threshold();
        if self.shares.len() >= threshold {
            let xhat_enc = recover_commit(&self.shares, threshold)?;
            debug!("re-encrypted with {} shares", self.shares.len());
            return Ok(Transition::done(Some(xhat_enc)));
        }
        if self.refused > self.instance.size().saturating_sub(threshold) {
            return Err(CalypsoError::Refused { refused: self.refused });
        }
        Ok(Transition::none())
    }
}

impl Protocol for OcsProtocol {
    type Message = OcsMessage;
    /// `XhatEnc` on the root, None on the other nodes
    type Output = Option<Point>;
    type Error = CalypsoError;

    fn start(&mut self) -> Step<Self> {
        let Some(request) = &self.request else {
            return Err(CalypsoError::Invalid("re-encryption root without request".into()));
        };
        if self.threshold() == 0 {
            return Err(CalypsoError::NotMember);
        }
        Ok(Transition::send(
            Destination::All,
            OcsMessage::Reencrypt {
                u: request.u,
                xc: request.xc,
                verification: request.verification.clone(),
            },
        ))
    }

    fn step(&mut self, from: usize, msg: OcsMessage) -> Step<Self> {
        match msg {
            OcsMessage::Reencrypt { u, xc, verification } => {
                let reply = OcsMessage::Reply(self.answer(&u, &xc, &verification));
                let transition = Transition::send(Destination::Node(from), reply);
                if self.instance.is_root() {
                    Ok(transition)
                } else {
                    Ok(transition.finish(None))
                }
            }
            OcsMessage::Reply(reply) => self.collect(from, reply),
        }
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}
