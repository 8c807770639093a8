// CONTRACTS
// Contracts turn an authorized instruction into state changes. They only
// see a read-only view of the state and the coins threaded through the
// transaction; the executor stages whatever they return.

pub mod coin;
pub mod config;
pub mod darc;
pub mod value;

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::instruction::{InstanceId, Instruction};
use crate::state::{ReadOnlyState, StateChange};
use crate::{ContractError, ContractResult};

/// Coins carried from one instruction of a transaction to the next.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    pub name: InstanceId,
    pub value: u64,
}

impl Coin {
    pub fn safe_add(&mut self, amount: u64) -> ContractResult<()> {
        self.value = self.value.checked_add(amount).ok_or(ContractError::Overflow)?;
        Ok(())
    }

    pub fn safe_sub(&mut self, amount: u64) -> ContractResult<()> {
        self.value = self.value.checked_sub(amount).ok_or(ContractError::InsufficientBalance {
            balance: self.value,
            amount,
        })?;
        Ok(())
    }
}

pub type ContractOutput = (Vec<StateChange>, Vec<Coin>);

fn unsupported(contract: &str, action: &str) -> ContractError {
    ContractError::NotSupported {
        contract: contract.to_string(),
        action: action.to_string(),
    }
}

pub trait Contract: Send + Sync {
    fn name(&self) -> &'static str;

    fn spawn(&self, _state: &dyn ReadOnlyState, _inst: &Instruction, _coins: Vec<Coin>) -> ContractResult<ContractOutput> {
        Err(unsupported(self.name(), "spawn"))
    }

    fn invoke(&self, _state: &dyn ReadOnlyState, inst: &Instruction, _coins: Vec<Coin>) -> ContractResult<ContractOutput> {
        Err(unsupported(self.name(), &inst.action()))
    }

    fn delete(&self, _state: &dyn ReadOnlyState, _inst: &Instruction, _coins: Vec<Coin>) -> ContractResult<ContractOutput> {
        Err(unsupported(self.name(), "delete"))
    }
}

/// Contract name -> implementation.
#[derive(Clone, Default)]
pub struct ContractRegistry {
    contracts: HashMap<String, Arc<dyn Contract>>,
}

impl ContractRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in darc, config, value and coin contracts.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(darc::DarcContract));
        registry.register(Arc::new(config::ConfigContract));
        registry.register(Arc::new(value::ValueContract));
        registry.register(Arc::new(coin::CoinContract));
        registry
    }

    pub fn register(&mut self, contract: Arc<dyn Contract>) {
        self.contracts.insert(contract.name().to_string(), contract);
    }

    pub fn get(&self, name: &str) -> ContractResult<Arc<dyn Contract>> {
        self.contracts
            .get(name)
            .cloned()
            .ok_or_else(|| ContractError::UnknownContract(name.to_string()))
    }
}

/// Reads a little-endian u64 argument.
pub fn u64_arg(inst: &Instruction, name: &str) -> ContractResult<u64> {
    let bytes = inst
        .arg(name)
        .ok_or_else(|| ContractError::MissingArgument(name.to_string()))?;
    let bytes: [u8; 8] = bytes
        .try_into()
        .map_err(|_| ContractError::InvalidArgument(format!("{} must be 8 bytes", name)))?;
    Ok(u64::from_le_bytes(bytes))
}

pub fn required_arg<'a>(inst: &'a Instruction, name: &str) -> ContractResult<&'a [u8]> {
    inst.arg(name)
        .ok_or_else(|| ContractError::MissingArgument(name.to_string()))
}
