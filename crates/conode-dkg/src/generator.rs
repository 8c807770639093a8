//! Pedersen distributed key generator.
//!
//! Dealers are indexed by their position in `old_nodes`, verifiers by their
//! position in `new_nodes`; for a fresh run both lists are the same. A
//! resharing dealer uses its current share as the constant term of its
//! polynomial, and verifiers check that constant against the public
//! polynomial of the key being reshared.

use std::collections::{BTreeMap, HashMap};

use conode_crypto::ecies::{self, Sealed};
use conode_crypto::schnorr::{self, SchnorrSignature};
use conode_crypto::share::lagrange_coefficient;
use conode_crypto::{point_to_bytes, Hash256, KeyPair, Point, PriPoly, PriShare, PubPoly, Scalar};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::{DistKeyShare, DkgError, DkgResult};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deal {
    pub dealer: u32,
    pub verifier: u32,
    pub commits: Vec<Point>,
    pub sealed: Sealed,
    pub signature: SchnorrSignature,
}

impl Deal {
    fn message(context: &Hash256, dealer: u32, verifier: u32, commits: &[Point], sealed: &Sealed) -> DkgResult<Hash256> {
        let commit_bytes: Vec<u8> = commits.iter().flat_map(point_to_bytes).collect();
        Ok(Hash256::from_parts(&[
            &b"dkg-deal"[..],
            context.as_ref(),
            &dealer.to_le_bytes(),
            &verifier.to_le_bytes(),
            &commit_bytes[..],
            &bincode::serialize(sealed)?[..],
        ]))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub dealer: u32,
    pub verifier: u32,
    pub approved: bool,
    pub signature: SchnorrSignature,
}

impl Response {
    fn message(context: &Hash256, dealer: u32, verifier: u32, approved: bool) -> Hash256 {
        Hash256::from_parts(&[
            &b"dkg-response"[..],
            context.as_ref(),
            &dealer.to_le_bytes(),
            &verifier.to_le_bytes(),
            &[u8::from(approved)],
        ])
    }
}

pub struct DistKeyGenerator {
    longterm: KeyPair,
    old_nodes: Vec<Point>,
    new_nodes: Vec<Point>,
    threshold: usize,
    /// Public polynomial of the key being reshared
    old_commits: Option<PubPoly>,
    context: Hash256,
    dealer_index: Option<u32>,
    verifier_index: Option<u32>,
    poly: Option<PriPoly>,
    commits: HashMap<u32, PubPoly>,
    shares: HashMap<u32, PriShare>,
    /// dealer -> verifier -> approval
    responses: BTreeMap<u32, BTreeMap<u32, bool>>,
}

fn context(old_nodes: &[Point], new_nodes: &[Point], threshold: usize, old_commits: Option<&PubPoly>) -> Hash256 {
    let mut buf = Vec::new();
    for p in old_nodes.iter().chain(new_nodes) {
        buf.extend_from_slice(&point_to_bytes(p));
    }
    buf.extend_from_slice(&(threshold as u64).to_le_bytes());
    if let Some(c) = old_commits {
        for p in c.commits() {
            buf.extend_from_slice(&point_to_bytes(p));
        }
    }
    Hash256::from_parts(&[&b"dkg-context"[..], &buf[..]])
}

impl DistKeyGenerator {
    /// Fresh run among `participants`, each dealing and verifying.
    pub fn new(longterm: KeyPair, participants: Vec<Point>, threshold: usize) -> DkgResult<Self> {
        if threshold == 0 || threshold > participants.len() {
            return Err(DkgError::InvalidConfig(format!(
                "threshold {} for {} participants",
                threshold,
                participants.len()
            )));
        }
        let me = participants.iter().position(|p| *p == longterm.public());
        let Some(me) = me else {
            return Err(DkgError::InvalidConfig("own key is not among the participants".into()));
        };
        let ctx = context(&participants, &participants, threshold, None);
        Ok(DistKeyGenerator {
            poly: Some(PriPoly::random(threshold, None)),
            longterm,
            old_nodes: participants.clone(),
            new_nodes: participants,
            threshold,
            old_commits: None,
            context: ctx,
            dealer_index: Some(me as u32),
            verifier_index: Some(me as u32),
            commits: HashMap::new(),
            shares: HashMap::new(),
            responses: BTreeMap::new(),
        })
    }

    /// Resharing from `old_nodes`, holding the key committed to by
    /// `old_commits`, to `new_nodes` with a new `threshold`. `share` is the
    /// current share when this node is one of the old nodes.
    pub fn new_reshare(
        longterm: KeyPair,
        old_nodes: Vec<Point>,
        new_nodes: Vec<Point>,
        threshold: usize,
        old_commits: PubPoly,
        share: Option<&DistKeyShare>,
    ) -> DkgResult<Self> {
        if threshold == 0 || threshold > new_nodes.len() {
            return Err(DkgError::InvalidConfig(format!(
                "threshold {} for {} new nodes",
                threshold,
                new_nodes.len()
            )));
        }
        if old_nodes.len() < old_commits.threshold() {
            return Err(DkgError::InvalidConfig("fewer old nodes than the old threshold".into()));
        }
        let public = longterm.public();
        let dealer_index = old_nodes.iter().position(|p| *p == public).map(|i| i as u32);
        let verifier_index = new_nodes.iter().position(|p| *p == public).map(|i| i as u32);
        if dealer_index.is_none() && verifier_index.is_none() {
            return Err(DkgError::InvalidConfig("own key is neither old nor new".into()));
        }

        let poly = match (dealer_index, share) {
            (Some(i), Some(dks)) => {
                if dks.share.index != i || dks.commits != old_commits.commits() {
                    return Err(DkgError::InvalidConfig("held share does not match the old key".into()));
                }
                Some(PriPoly::random(threshold, Some(dks.share.value)))
            }
            (Some(_), None) => return Err(DkgError::InvalidConfig("old node without a share".into())),
            (None, _) => None,
        };
        let ctx = context(&old_nodes, &new_nodes, threshold, Some(&old_commits));
        Ok(DistKeyGenerator {
            longterm,
            old_nodes,
            new_nodes,
            threshold,
            old_commits: Some(old_commits),
            context: ctx,
            dealer_index,
            verifier_index,
            poly,
            commits: HashMap::new(),
            shares: HashMap::new(),
            responses: BTreeMap::new(),
        })
    }

    pub fn is_resharing(&self) -> bool {
        self.old_commits.is_some()
    }

    pub fn dealer_index(&self) -> Option<u32> {
        self.dealer_index
    }

    pub fn verifier_index(&self) -> Option<u32> {
        self.verifier_index
    }

    pub fn old_nodes(&self) -> &[Point] {
        &self.old_nodes
    }

    pub fn new_nodes(&self) -> &[Point] {
        &self.new_nodes
    }

    /// One encrypted, signed deal per verifier, this node included.
    pub fn deals(&self) -> DkgResult<Vec<Deal>> {
        let (Some(dealer), Some(poly)) = (self.dealer_index, &self.poly) else {
            return Err(DkgError::NotDealer);
        };
        let commits = poly.commit().commits().to_vec();
        let mut deals = Vec::with_capacity(self.new_nodes.len());
        for (v, public) in self.new_nodes.iter().enumerate() {
            let verifier = v as u32;
            let share = poly.eval(verifier);
            let sealed = ecies::seal(public, self.context.as_ref(), &bincode::serialize(&share)?)?;
            let msg = Deal::message(&self.context, dealer, verifier, &commits, &sealed)?;
            deals.push(Deal {
                dealer,
                verifier,
                commits: commits.clone(),
                signature: self.longterm.sign(msg.as_ref()),
                sealed,
            });
        }
        Ok(deals)
    }

    /// Checks a deal addressed to this node and answers with an approval
    /// or a complaint. The answer is recorded locally as well.
    pub fn process_deal(&mut self, deal: &Deal) -> DkgResult<Response> {
        let verifier = self.verifier_index.ok_or(DkgError::NotVerifier)?;
        if deal.verifier != verifier {
            return Err(DkgError::InvalidDeal(format!("deal for verifier {} reached {}", deal.verifier, verifier)));
        }
        let dealer_key = self
            .old_nodes
            .get(deal.dealer as usize)
            .ok_or_else(|| DkgError::InvalidDeal(format!("unknown dealer {}", deal.dealer)))?;
        let msg = Deal::message(&self.context, deal.dealer, deal.verifier, &deal.commits, &deal.sealed)?;
        schnorr::verify(dealer_key, msg.as_ref(), &deal.signature)
            .map_err(|_| DkgError::InvalidDeal("bad dealer signature".into()))?;
        if self.commits.contains_key(&deal.dealer) {
            return Err(DkgError::DuplicateDeal { dealer: deal.dealer });
        }

        let approved = self.check_deal(deal);
        let commits = PubPoly::new(deal.commits.clone());
        if let Some(share) = approved {
            self.shares.insert(deal.dealer, share);
        }
        self.commits.insert(deal.dealer, commits);

        let approved = approved.is_some();
        let response = Response {
            dealer: deal.dealer,
            verifier,
            approved,
            signature: self
                .longterm
                .sign(Response::message(&self.context, deal.dealer, verifier, approved).as_ref()),
        };
        self.record(deal.dealer, verifier, approved);
        Ok(response)
    }

    /// The decrypted share when the deal is sound.
    fn check_deal(&self, deal: &Deal) -> Option<PriShare> {
        if deal.commits.len() != self.threshold {
            warn!("deal of dealer {} has degree {}, want {}", deal.dealer, deal.commits.len(), self.threshold);
            return None;
        }
        if let Some(old) = &self.old_commits {
            if deal.commits[0] != old.eval(deal.dealer).value {
                warn!("deal of dealer {} does not reshare its old share", deal.dealer);
                return None;
            }
        }
        let plain = ecies::open(self.longterm.secret(), self.context.as_ref(), &deal.sealed).ok()?;
        let share: PriShare = bincode::deserialize(&plain).ok()?;
        let poly = PubPoly::new(deal.commits.clone());
        (share.index == deal.verifier && poly.check(&share)).then_some(share)
    }

    pub fn process_response(&mut self, response: &Response) -> DkgResult<()> {
        let verifier_key = self
            .new_nodes
            .get(response.verifier as usize)
            .ok_or_else(|| DkgError::InvalidResponse(format!("unknown verifier {}", response.verifier)))?;
        if response.dealer as usize >= self.old_nodes.len() {
            return Err(DkgError::InvalidResponse(format!("unknown dealer {}", response.dealer)));
        }
        let msg = Response::message(&self.context, response.dealer, response.verifier, response.approved);
        schnorr::verify(verifier_key, msg.as_ref(), &response.signature)
            .map_err(|_| DkgError::InvalidResponse("bad verifier signature".into()))?;
        let seen = self
            .responses
            .get(&response.dealer)
            .map(|r| r.contains_key(&response.verifier))
            .unwrap_or(false);
        if seen {
            return Err(DkgError::DuplicateResponse {
                dealer: response.dealer,
                verifier: response.verifier,
            });
        }
        if !response.approved {
            warn!("verifier {} complains about dealer {}", response.verifier, response.dealer);
        }
        self.record(response.dealer, response.verifier, response.approved);
        Ok(())
    }

    /// Responses recorded so far, this node's own included.
    pub fn responses_seen(&self) -> usize {
        self.responses.values().map(BTreeMap::len).sum()
    }

    /// One response per dealer and verifier pair.
    pub fn expected_responses(&self) -> usize {
        self.old_nodes.len() * self.new_nodes.len()
    }

    fn record(&mut self, dealer: u32, verifier: u32, approved: bool) {
        self.responses.entry(dealer).or_default().insert(verifier, approved);
    }

    /// A dealer is certified once every verifier approved its deal.
    fn deal_certified(&self, dealer: u32) -> bool {
        self.responses
            .get(&dealer)
            .map(|r| r.len() == self.new_nodes.len() && r.values().all(|ok| *ok))
            .unwrap_or(false)
    }

    /// Qualified dealers.
    pub fn qual(&self) -> Vec<u32> {
        (0..self.old_nodes.len() as u32)
            .filter(|d| self.deal_certified(*d))
            .collect()
    }

    pub fn certified(&self) -> bool {
        self.qual().len() == self.old_nodes.len()
    }

    /// This node's share of the joint key. For a reshare the dealers' shares
    /// and commitments are weighted with their Lagrange coefficients so the
    /// joint constant term stays the old secret.
    pub fn dist_key_share(&self) -> DkgResult<DistKeyShare> {
        if !self.certified() {
            return Err(DkgError::NotCertified);
        }
        let verifier = self.verifier_index.ok_or(DkgError::NotVerifier)?;
        let qual = self.qual();
        let mut value = Scalar::ZERO;
        let mut commits = vec![Point::default(); self.threshold];
        for &d in &qual {
            let weight = if self.is_resharing() {
                lagrange_coefficient(d, &qual)
            } else {
                Scalar::ONE
            };
            let share = self.shares.get(&d).ok_or(DkgError::NotCertified)?;
            let poly = self.commits.get(&d).ok_or(DkgError::NotCertified)?;
            value += weight * share.value;
            for (acc, c) in commits.iter_mut().zip(poly.commits()) {
                *acc += c * weight;
            }
        }
        debug!("dist key share ready from {} dealers", qual.len());
        Ok(DistKeyShare {
            share: PriShare { index: verifier, value },
            commits,
        })
    }
}
