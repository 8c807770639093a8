// BYZCOIN LEDGER
// Permissioned ledger whose blocks live on a skipchain. Every block commits
// to the root of an authenticated trie holding all contract instances.
//
// SAFETY INVARIANTS:
// 1. Execution is deterministic: every node replaying a block reaches the
//    same trie root as the one recorded in its header
// 2. A client transaction commits all of its state changes or none
// 3. Every instruction is authorized by the darc governing its instance and
//    carries counters exactly one above the stored signer counters
// 4. Instance versions start at 0 and grow by one on each update

pub mod block;
pub mod contracts;
pub mod darc;
pub mod executor;
pub mod instruction;
pub mod proof;
pub mod service;
pub mod state;
pub mod trie;

use conode_onet::ServerId;
use conode_skipchain::{SkipBlockId, SkipchainError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use block::{BlockData, DataBody, DataHeader};
pub use contracts::{Coin, Contract, ContractRegistry};
pub use darc::{Darc, DarcId, Identity, Rules, Signer};
pub use executor::TxResult;
pub use instruction::{Argument, Arguments, ClientTransaction, InstanceId, Instruction, InstructionKind};
pub use proof::Proof;
pub use service::{
    AddTxRequest, AddTxResponse, ByzCoinService, CreateGenesisBlockReply, DefaultGenesisMsg, GetProof, GetSignerCounters,
};
pub use state::{ReadOnlyState, StateAction, StateChange, StateEntry};
pub use trie::{Trie, TrieProof};

// ==================== ERROR TYPES ====================

#[derive(Debug, Error)]
pub enum TrieError {
    #[error("trie node {0} missing")]
    MissingNode(conode_crypto::Hash256),

    #[error("invalid trie proof: {0}")]
    InvalidProof(String),

    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}

#[derive(Debug, Error)]
pub enum DarcError {
    #[error("darc has no rule for action {0}")]
    ActionNotFound(String),

    #[error("signers do not satisfy {action}")]
    Unauthorized { action: String },

    #[error("cannot parse expression: {0}")]
    Parse(String),

    #[error("invalid identity: {0}")]
    InvalidIdentity(String),

    #[error("invalid signature from {0}")]
    InvalidSignature(String),

    #[error("darc references nested too deep")]
    RecursionLimit,

    #[error("invalid darc evolution: {0}")]
    InvalidEvolution(String),
}

#[derive(Debug, Error)]
pub enum ContractError {
    #[error("no contract registered as {0}")]
    UnknownContract(String),

    #[error("contract {contract} does not support {action}")]
    NotSupported { contract: String, action: String },

    #[error("instance {0} does not exist")]
    UnknownInstance(InstanceId),

    #[error("missing argument {0}")]
    MissingArgument(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("coin overflow")]
    Overflow,

    #[error("insufficient balance: have {balance}, need {amount}")]
    InsufficientBalance { balance: u64, amount: u64 },

    #[error("instance still holds {0} coins")]
    NotEmpty(u64),

    #[error("instance belongs to {got}, expected {expected}")]
    WrongContract { expected: String, got: String },

    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Darc(#[from] DarcError),

    #[error(transparent)]
    Trie(#[from] TrieError),

    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}

pub type ContractResult<T> = Result<T, ContractError>;

#[derive(Debug, Error)]
pub enum ByzCoinError {
    #[error("unknown ledger {0}")]
    UnknownChain(SkipBlockId),

    #[error("only the leader {0} accepts transactions")]
    NotLeader(ServerId),

    #[error("counter mismatch for {identity}: expected {expected}, got {got}")]
    CounterMismatch { identity: String, expected: u64, got: u64 },

    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("invalid state change: {0}")]
    InvalidStateChange(String),

    #[error("transaction refused: {0}")]
    TxRefused(String),

    #[error("transaction not included in time")]
    Timeout,

    #[error("invalid proof: {0}")]
    InvalidProof(String),

    #[error("invalid block: {0}")]
    InvalidBlock(String),

    #[error(transparent)]
    Contract(#[from] ContractError),

    #[error(transparent)]
    Darc(#[from] DarcError),

    #[error(transparent)]
    Trie(#[from] TrieError),

    #[error(transparent)]
    Skipchain(#[from] SkipchainError),

    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}

pub type ByzCoinResult<T> = Result<T, ByzCoinError>;

// ==================== CONFIGURATION ====================

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ByzCoinConfig {
    /// Time the leader collects transactions before proposing a block
    pub block_interval_ms: u64,
    pub max_txs_per_block: usize,
    /// Blocks a waiting client is willing to wait for inclusion
    pub tx_wait_blocks: u64,
}

impl Default for ByzCoinConfig {
    fn default() -> Self {
        ByzCoinConfig {
            block_interval_ms: 1_000,
            max_txs_per_block: 1_000,
            tx_wait_blocks: 5,
        }
    }
}
