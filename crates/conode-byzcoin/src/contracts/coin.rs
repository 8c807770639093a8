//! Fungible coins. An instance holds `{ name, value }`; amounts in
//! arguments are little-endian u64.
//!
//! Commands: `mint` and `transfer` (to `destination`), `fetch` moves coins
//! from the instance into the transaction, `store` puts coins of the same
//! name from the transaction into the instance. Delete is only allowed on
//! an empty instance.

use conode_crypto::Hash256;

use super::{required_arg, u64_arg, Coin, Contract, ContractOutput};
use crate::instruction::{InstanceId, Instruction, InstructionKind};
use crate::state::{ReadOnlyState, StateChange, StateEntry};
use crate::{ContractError, ContractResult};

pub const CONTRACT_COIN: &str = "coin";

/// Name of coins spawned without a `type` argument.
pub fn default_coin_name() -> InstanceId {
    Hash256::digest(b"olCoin")
}

pub struct CoinContract;

fn load(entry: &StateEntry) -> ContractResult<Coin> {
    if entry.contract_id != CONTRACT_COIN {
        return Err(ContractError::WrongContract {
            expected: CONTRACT_COIN.to_string(),
            got: entry.contract_id.clone(),
        });
    }
    Ok(bincode::deserialize(&entry.value)?)
}

impl Contract for CoinContract {
    fn name(&self) -> &'static str {
        CONTRACT_COIN
    }

    fn spawn(&self, state: &dyn ReadOnlyState, inst: &Instruction, coins: Vec<Coin>) -> ContractResult<ContractOutput> {
        let darc_id = state.get_values(&inst.instance_id)?.darc_id;
        let name = match inst.arg("type") {
            Some(bytes) => Hash256::from_slice(bytes).map_err(|e| ContractError::InvalidArgument(e.to_string()))?,
            None => default_coin_name(),
        };
        let coin = Coin { name, value: 0 };
        Ok((
            vec![StateChange::create(inst.derive_id(""), CONTRACT_COIN, bincode::serialize(&coin)?, darc_id)],
            coins,
        ))
    }

    fn invoke(&self, state: &dyn ReadOnlyState, inst: &Instruction, mut coins: Vec<Coin>) -> ContractResult<ContractOutput> {
        let entry = state.get_values(&inst.instance_id)?;
        let mut coin = load(&entry)?;
        let InstructionKind::Invoke { command, .. } = &inst.kind else {
            return Err(super::unsupported(CONTRACT_COIN, &inst.action()));
        };
        let update = |coin: &Coin| -> ContractResult<StateChange> {
            Ok(StateChange::update(inst.instance_id, CONTRACT_COIN, bincode::serialize(coin)?, entry.darc_id))
        };

        match command.as_str() {
            "mint" => {
                coin.safe_add(u64_arg(inst, "coins")?)?;
                Ok((vec![update(&coin)?], coins))
            }
            "transfer" => {
                let amount = u64_arg(inst, "coins")?;
                let target_id = Hash256::from_slice(required_arg(inst, "destination")?)
                    .map_err(|e| ContractError::InvalidArgument(e.to_string()))?;
                if target_id == inst.instance_id {
                    return Err(ContractError::InvalidArgument("cannot transfer to self".into()));
                }
                let target_entry = state.get_values(&target_id)?;
                let mut target = load(&target_entry)?;
                if target.name != coin.name {
                    return Err(ContractError::InvalidArgument("destination holds another coin".into()));
                }
                coin.safe_sub(amount)?;
                target.safe_add(amount)?;
                Ok((
                    vec![
                        StateChange::update(target_id, CONTRACT_COIN, bincode::serialize(&target)?, target_entry.darc_id),
                        update(&coin)?,
                    ],
                    coins,
                ))
            }
            "fetch" => {
                let amount = u64_arg(inst, "coins")?;
                coin.safe_sub(amount)?;
                coins.push(Coin {
                    name: coin.name,
                    value: amount,
                });
                Ok((vec![update(&coin)?], coins))
            }
            "store" => {
                let mut rest = Vec::with_capacity(coins.len());
                for c in coins {
                    if c.name == coin.name {
                        coin.safe_add(c.value)?;
                    } else {
                        rest.push(c);
                    }
                }
                Ok((vec![update(&coin)?], rest))
            }
            _ => Err(super::unsupported(CONTRACT_COIN, &inst.action())),
        }
    }

    fn delete(&self, state: &dyn ReadOnlyState, inst: &Instruction, coins: Vec<Coin>) -> ContractResult<ContractOutput> {
        let coin = load(&state.get_values(&inst.instance_id)?)?;
        if coin.value > 0 {
            return Err(ContractError::NotEmpty(coin.value));
        }
        Ok((vec![StateChange::remove(inst.instance_id)], coins))
    }
}
