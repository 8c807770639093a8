//! Ledger payload of a skipblock: a header committing to the state and the
//! transactions that produced it.

use std::time::{SystemTime, UNIX_EPOCH};

use conode_crypto::Hash256;
use conode_skipchain::{SkipBlock, VerifierId};
use serde::{Deserialize, Serialize};

use crate::executor::TxResult;
use crate::state::StateChange;
use crate::ByzCoinResult;

/// Name of the skipchain verifier that re-executes ledger blocks.
pub const BYZCOIN_VERIFIER: &str = "byzcoin";

pub fn verifier_id() -> VerifierId {
    VerifierId::from_name(BYZCOIN_VERIFIER)
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataHeader {
    pub trie_root: Hash256,
    pub client_transactions_hash: Hash256,
    pub state_changes_hash: Hash256,
    /// Milliseconds since the epoch, set by the leader
    pub timestamp: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataBody {
    pub tx_results: Vec<TxResult>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockData {
    pub header: DataHeader,
    pub body: DataBody,
}

impl BlockData {
    pub fn new(trie_root: Hash256, tx_results: Vec<TxResult>, changes: &[StateChange]) -> ByzCoinResult<Self> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Ok(BlockData {
            header: DataHeader {
                trie_root,
                client_transactions_hash: transactions_hash(&tx_results),
                state_changes_hash: state_changes_hash(changes)?,
                timestamp,
            },
            body: DataBody { tx_results },
        })
    }

    pub fn decode(block: &SkipBlock) -> ByzCoinResult<Self> {
        Ok(bincode::deserialize(&block.data)?)
    }

    pub fn encode(&self) -> ByzCoinResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }
}

pub fn transactions_hash(results: &[TxResult]) -> Hash256 {
    let parts: Vec<[u8; 33]> = results
        .iter()
        .map(|r| {
            let mut part = [0u8; 33];
            part[..32].copy_from_slice(r.tx.hash().as_ref());
            part[32] = u8::from(r.accepted);
            part
        })
        .collect();
    let slices: Vec<&[u8]> = parts.iter().map(|p| &p[..]).collect();
    Hash256::from_parts(&slices)
}

pub fn state_changes_hash(changes: &[StateChange]) -> ByzCoinResult<Hash256> {
    Ok(Hash256::digest(&bincode::serialize(changes)?))
}
