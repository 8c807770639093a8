//! Ledger side of Calypso.
//!
//! - `calypsoWrite`: spawned on a darc with a `write` argument; the write's
//!   proof must hold for that darc. Spawning `calypsoRead` on a write
//!   instance with a `read` argument records a read request.
//! - `longTermSecret`: spawned on a darc with an `lts_instance_info`
//!   argument naming the group roster; `invoke:reshare` replaces the roster.

use conode_byzcoin::contracts::{required_arg, ContractOutput};
use conode_byzcoin::state::DARC_CONTRACT;
use conode_byzcoin::{
    Coin, Contract, ContractError, ContractResult, Instruction, InstructionKind, ReadOnlyState, StateChange,
};
use conode_onet::Roster;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::write::{Read, Write};

pub const CONTRACT_WRITE: &str = "calypsoWrite";
pub const CONTRACT_READ: &str = "calypsoRead";
pub const CONTRACT_LTS: &str = "longTermSecret";

/// Value of an LTS instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LtsInstanceInfo {
    pub roster: Roster,
}

impl LtsInstanceInfo {
    pub fn decode(bytes: &[u8]) -> ContractResult<Self> {
        let info: LtsInstanceInfo = bincode::deserialize(bytes)?;
        if info.roster.is_empty() || !info.roster.is_consistent() {
            return Err(ContractError::InvalidArgument("malformed lts roster".into()));
        }
        Ok(info)
    }
}

fn not_supported(contract: &str, action: String) -> ContractError {
    ContractError::NotSupported {
        contract: contract.to_string(),
        action,
    }
}

fn requested_contract(inst: &Instruction) -> &str {
    match &inst.kind {
        InstructionKind::Spawn { contract_id, .. } => contract_id.as_str(),
        _ => "",
    }
}

pub struct WriteContract;

impl Contract for WriteContract {
    fn name(&self) -> &'static str {
        CONTRACT_WRITE
    }

    fn spawn(&self, state: &dyn ReadOnlyState, inst: &Instruction, coins: Vec<Coin>) -> ContractResult<ContractOutput> {
        let entry = state.get_values(&inst.instance_id)?;
        match (entry.contract_id.as_str(), requested_contract(inst)) {
            (DARC_CONTRACT, CONTRACT_WRITE) => {
                let bytes = required_arg(inst, "write")?;
                let write: Write = bincode::deserialize(bytes)?;
                write
                    .check_proof(&entry.darc_id)
                    .map_err(|e| ContractError::Failed(format!("proof of write failed: {}", e)))?;
                let id = inst.derive_id("");
                debug!("verified write request, storing it in {}", id);
                Ok((vec![StateChange::create(id, CONTRACT_WRITE, bytes.to_vec(), entry.darc_id)], coins))
            }
            (CONTRACT_WRITE, CONTRACT_READ) => {
                let bytes = required_arg(inst, "read")?;
                let read: Read = bincode::deserialize(bytes)?;
                if read.write != inst.instance_id {
                    return Err(ContractError::InvalidArgument("read names another write instance".into()));
                }
                Ok((
                    vec![StateChange::create(inst.derive_id(""), CONTRACT_READ, bytes.to_vec(), entry.darc_id)],
                    coins,
                ))
            }
            (on, what) => Err(not_supported(CONTRACT_WRITE, format!("spawn:{} on {}", what, on))),
        }
    }
}

pub struct LtsContract;

impl Contract for LtsContract {
    fn name(&self) -> &'static str {
        CONTRACT_LTS
    }

    fn spawn(&self, state: &dyn ReadOnlyState, inst: &Instruction, coins: Vec<Coin>) -> ContractResult<ContractOutput> {
        let darc_id = state.get_values(&inst.instance_id)?.darc_id;
        let bytes = required_arg(inst, "lts_instance_info")?;
        LtsInstanceInfo::decode(bytes)?;
        Ok((
            vec![StateChange::create(inst.derive_id(""), CONTRACT_LTS, bytes.to_vec(), darc_id)],
            coins,
        ))
    }

    fn invoke(&self, state: &dyn ReadOnlyState, inst: &Instruction, coins: Vec<Coin>) -> ContractResult<ContractOutput> {
        let entry = state.get_values(&inst.instance_id)?;
        match &inst.kind {
            InstructionKind::Invoke { command, .. } if command == "reshare" => {
                let current = LtsInstanceInfo::decode(&entry.value)?;
                let bytes = required_arg(inst, "lts_instance_info")?;
                let next = LtsInstanceInfo::decode(bytes)?;
                if next.roster.id == current.roster.id {
                    return Err(ContractError::InvalidArgument("reshare needs a different roster".into()));
                }
                Ok((
                    vec![StateChange::update(inst.instance_id, CONTRACT_LTS, bytes.to_vec(), entry.darc_id)],
                    coins,
                ))
            }
            _ => Err(not_supported(CONTRACT_LTS, inst.action())),
        }
    }
}
