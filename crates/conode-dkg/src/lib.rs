// DISTRIBUTED KEY GENERATION
// Pedersen DKG over Ristretto255: every dealer shares a random polynomial,
// every verifier checks its share against the dealer's commitments, and the
// sum over qualified dealers is the joint key. Resharing lets the holders of
// an existing key deal their shares to a new set of nodes.
//
// SAFETY INVARIANTS:
// 1. No node ever sees more than its own share of the joint secret
// 2. Deals travel encrypted to the verifier's long-term key and signed by
//    the dealer; responses are signed by the verifier
// 3. A share is only produced once every dealer is certified
// 4. Resharing keeps the joint public key X and changes every share

pub mod generator;
pub mod protocol;

use conode_crypto::{CryptoError, Point, PriShare, PubPoly, Scalar};
use conode_onet::OnetError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use generator::{Deal, DistKeyGenerator, Response};
pub use protocol::{DkgMessage, ReshareInfo, SetupProtocol, DKG_PROTOCOL};

// ==================== ERROR TYPES ====================

#[derive(Debug, Error)]
pub enum DkgError {
    #[error("this node is not a dealer")]
    NotDealer,

    #[error("this node is not a verifier")]
    NotVerifier,

    #[error("invalid deal: {0}")]
    InvalidDeal(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("second deal from dealer {dealer}")]
    DuplicateDeal { dealer: u32 },

    /// Every node sees the responses it produced itself a second time when
    /// they are broadcast; this is expected and not a failure.
    #[error("already existing response from dealer {dealer} for verifier {verifier}")]
    DuplicateResponse { dealer: u32, verifier: u32 },

    #[error("dkg is not certified")]
    NotCertified,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("resharing changed the public key")]
    PublicKeyChanged,

    #[error("resharing kept the same share")]
    ShareUnchanged,

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Network(#[from] OnetError),

    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}

impl DkgError {
    /// Conditions that are logged but never abort a run.
    pub fn is_benign(&self) -> bool {
        matches!(self, DkgError::DuplicateResponse { .. })
    }
}

pub type DkgResult<T> = Result<T, DkgError>;

// ==================== SHARES ====================

/// A node's share of the joint secret and the commitments of the joint
/// polynomial.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistKeyShare {
    pub share: PriShare,
    pub commits: Vec<Point>,
}

impl DistKeyShare {
    /// The joint public key X.
    pub fn public(&self) -> Point {
        self.commits.first().copied().unwrap_or_default()
    }

    pub fn pub_poly(&self) -> PubPoly {
        PubPoly::new(self.commits.clone())
    }

    pub fn threshold(&self) -> usize {
        self.commits.len()
    }

    /// A reshare result must keep X and replace the share value.
    pub fn check_reshare(&self, previous: &DistKeyShare) -> DkgResult<()> {
        if self.public() != previous.public() {
            return Err(DkgError::PublicKeyChanged);
        }
        if self.share.value == previous.share.value {
            return Err(DkgError::ShareUnchanged);
        }
        Ok(())
    }
}

/// What a node needs for threshold decryption.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedSecret {
    pub index: u32,
    pub v: Scalar,
    pub x: Point,
    pub commits: Vec<Point>,
}

impl From<&DistKeyShare> for SharedSecret {
    fn from(dks: &DistKeyShare) -> Self {
        SharedSecret {
            index: dks.share.index,
            v: dks.share.value,
            x: dks.public(),
            commits: dks.commits.clone(),
        }
    }
}
