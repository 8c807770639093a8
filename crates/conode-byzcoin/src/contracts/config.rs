//! Ledger configuration, spawned once by the genesis transaction at the
//! zero instance id together with the genesis darc.

use conode_crypto::Hash256;
use serde::{Deserialize, Serialize};

use super::{required_arg, u64_arg, Coin, Contract, ContractOutput};
use crate::darc::Darc;
use crate::instruction::{InstanceId, Instruction};
use crate::state::{ReadOnlyState, StateChange, DARC_CONTRACT};
use crate::{ContractError, ContractResult};

pub const CONTRACT_CONFIG: &str = "config";

pub const CONFIG_INSTANCE: InstanceId = Hash256::ZERO;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainConfig {
    pub block_interval_ms: u64,
}

pub struct ConfigContract;

impl Contract for ConfigContract {
    fn name(&self) -> &'static str {
        CONTRACT_CONFIG
    }

    fn spawn(&self, state: &dyn ReadOnlyState, inst: &Instruction, coins: Vec<Coin>) -> ContractResult<ContractOutput> {
        if inst.instance_id != CONFIG_INSTANCE || state.get_entry(&CONFIG_INSTANCE)?.is_some() {
            return Err(ContractError::Failed("config can only be spawned by the genesis transaction".into()));
        }
        let darc_bytes = required_arg(inst, "darc")?.to_vec();
        let darc: Darc = bincode::deserialize(&darc_bytes)?;
        let darc_id = darc.get_base_id();
        let config = ChainConfig {
            block_interval_ms: u64_arg(inst, "block_interval")?,
        };
        Ok((
            vec![
                StateChange::create(CONFIG_INSTANCE, CONTRACT_CONFIG, bincode::serialize(&config)?, darc_id),
                StateChange::create(darc_id, DARC_CONTRACT, darc_bytes, darc_id),
            ],
            coins,
        ))
    }
}
