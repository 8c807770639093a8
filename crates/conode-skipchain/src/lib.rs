// SKIPCHAIN ENGINE
// Append-only, collectively signed block chains with skip-list shortcuts.
//
// SAFETY INVARIANTS:
// 1. A block's hash is computed once over its fixed fields and never changes
// 2. Forward links are the only mutable part of a stored block, append-only
// 3. Every forward link carries a collective signature of the from-block's
//    roster reaching n - (n-1)/3 participants
// 4. Only the current tip of a chain accepts a successor

pub mod block;
pub mod cosi;
pub mod db;
pub mod propagate;
pub mod service;

use conode_crypto::CryptoError;
use conode_onet::{OnetError, ServerId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use block::{verify_update_chain, ForwardLink, SkipBlock, SkipBlockId, VerifierId};
pub use db::SkipBlockDb;
pub use service::{
    BlockListener, BlockVerifier, GetAllSkipchainsReply, GetSingleBlock, GetSingleBlockByIndex,
    GetUpdateChain, GetUpdateChainReply, SkipchainService, StoreSkipBlock, StoreSkipBlockReply,
};

#[derive(Debug, Error)]
pub enum SkipchainError {
    #[error("block {0} not found")]
    UnknownBlock(SkipBlockId),

    #[error("block {0} is not the latest of its chain")]
    NotLatest(SkipBlockId),

    #[error("invalid block: {0}")]
    InvalidBlock(String),

    #[error("server {0} is not in the roster")]
    UnknownRosterMember(ServerId),

    #[error("block refused by verifier: {0}")]
    Refused(String),

    #[error("collective signing reached {participants} of {threshold} required signers")]
    InsufficientSignatures { participants: usize, threshold: usize },

    #[error("invalid forward link: {0}")]
    InvalidLink(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Network(#[from] OnetError),

    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}

pub type SkipchainResult<T> = Result<T, SkipchainError>;

/// Tunables of the skipchain service.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SkipchainConfig {
    /// Shortcut fan-out of new chains
    pub base_height: u32,
    /// Highest link level of new chains
    pub max_height: u32,
    /// Branching factor of signing trees; 0 builds a star
    pub branching: usize,
    pub cosi_timeout_ms: u64,
    /// Idle time after which missing commitments become exceptions
    pub cosi_soft_timeout_ms: u64,
    pub propagate_timeout_ms: u64,
}

impl Default for SkipchainConfig {
    fn default() -> Self {
        SkipchainConfig {
            base_height: 4,
            max_height: 32,
            branching: 0,
            cosi_timeout_ms: 10_000,
            cosi_soft_timeout_ms: 1_000,
            propagate_timeout_ms: 10_000,
        }
    }
}
