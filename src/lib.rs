// CONODE
// One collective-authority node: the overlay server plus the skipchain,
// ledger and Calypso services sharing it, and a local cluster of such
// nodes on the in-process network.
//
// SAFETY INVARIANTS:
// 1. Every service of a node shares the node's server and key pair
// 2. A persistent node opens exactly one sled database
// 3. Ledgers found on disk are replayed before the node serves requests

pub mod config;
pub mod node;

use conode_byzcoin::ByzCoinError;
use conode_calypso::CalypsoError;
use conode_skipchain::SkipchainError;
use thiserror::Error;

pub use crate::config::ConodeConfig;
pub use node::{Bootstrap, Conode, LocalCluster, CALYPSO_ACTIONS};

#[derive(Debug, Error)]
pub enum ConodeError {
    #[error("configuration error: {0}")]
    Config(#[from] ::config::ConfigError),

    #[error("invalid setup: {0}")]
    Invalid(String),

    #[error(transparent)]
    Skipchain(#[from] SkipchainError),

    #[error(transparent)]
    ByzCoin(#[from] ByzCoinError),

    #[error(transparent)]
    Calypso(#[from] CalypsoError),

    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type ConodeResult<T> = Result<T, ConodeError>;
