// CALYPSO
// Secrets written to a ledger encrypted under the key of a long-term-secret
// (LTS) group, and handed out again by re-encrypting them to a reader once
// the ledger holds a matching read request.
//
// SAFETY INVARIANTS:
// 1. The LTS private key only ever exists as shares, one per group member
// 2. A node contributes a re-encryption share only after verifying the
//    read and write proofs against the ledger the LTS belongs to
// 3. Resharing keeps the LTS public key and replaces every share
// 4. An LTS record is persisted every time a (re)share completes

pub mod contracts;
pub mod ocs;
pub mod service;
pub mod store;
pub mod write;

use conode_byzcoin::{ByzCoinError, InstanceId};
use conode_crypto::CryptoError;
use conode_dkg::DkgError;
use conode_onet::OnetError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use contracts::{LtsInstanceInfo, CONTRACT_LTS, CONTRACT_READ, CONTRACT_WRITE};
pub use service::{CalypsoService, CreateLts, CreateLtsReply, DecryptKey, DecryptKeyReply, ReshareLts};
pub use store::{LtsRecord, LtsStore};
pub use write::{decode_key, Read, Write};

pub type LtsId = InstanceId;

// ==================== ERROR TYPES ====================

#[derive(Debug, Error)]
pub enum CalypsoError {
    #[error("unknown long-term secret {0}")]
    UnknownLts(LtsId),

    #[error("instance {0} is not a {1} instance")]
    WrongInstance(InstanceId, &'static str),

    #[error("read request does not point to the given write")]
    Mismatch,

    #[error("invalid write proof")]
    InvalidWriteProof,

    #[error("this node is not part of the group")]
    NotMember,

    #[error("re-encryption refused by {refused} nodes")]
    Refused { refused: usize },

    #[error("invalid re-encryption share from node {0}")]
    InvalidShare(u32),

    #[error("{0} did not finish in time")]
    Timeout(&'static str),

    #[error("{0}")]
    Invalid(String),

    #[error(transparent)]
    Dkg(#[from] DkgError),

    #[error(transparent)]
    ByzCoin(#[from] ByzCoinError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Network(#[from] OnetError),

    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}

pub type CalypsoResult<T> = Result<T, CalypsoError>;

// ==================== CONFIGURATION ====================

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CalypsoConfig {
    /// Upper bound for a DKG or resharing run
    pub dkg_timeout_ms: u64,
    /// Upper bound for collecting re-encryption shares
    pub reencrypt_timeout_ms: u64,
}

impl Default for CalypsoConfig {
    fn default() -> Self {
        CalypsoConfig {
            dkg_timeout_ms: 10_000,
            reencrypt_timeout_ms: 5_000,
        }
    }
}
