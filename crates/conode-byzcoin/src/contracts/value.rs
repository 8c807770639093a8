//! Stores an opaque value; the simplest contract there is.

use super::{required_arg, Coin, Contract, ContractOutput};
use crate::instruction::{Instruction, InstructionKind};
use crate::state::{ReadOnlyState, StateChange};
use crate::ContractResult;

pub const CONTRACT_VALUE: &str = "value";

pub struct ValueContract;

impl Contract for ValueContract {
    fn name(&self) -> &'static str {
        CONTRACT_VALUE
    }

    fn spawn(&self, state: &dyn ReadOnlyState, inst: &Instruction, coins: Vec<Coin>) -> ContractResult<ContractOutput> {
        let darc_id = state.get_values(&inst.instance_id)?.darc_id;
        let value = required_arg(inst, "value")?.to_vec();
        Ok((
            vec![StateChange::create(inst.derive_id(""), CONTRACT_VALUE, value, darc_id)],
            coins,
        ))
    }

    fn invoke(&self, state: &dyn ReadOnlyState, inst: &Instruction, coins: Vec<Coin>) -> ContractResult<ContractOutput> {
        let darc_id = state.get_values(&inst.instance_id)?.darc_id;
        match &inst.kind {
            InstructionKind::Invoke { command, .. } if command == "update" => {
                let value = required_arg(inst, "value")?.to_vec();
                Ok((
                    vec![StateChange::update(inst.instance_id, CONTRACT_VALUE, value, darc_id)],
                    coins,
                ))
            }
            _ => Err(super::unsupported(CONTRACT_VALUE, &inst.action())),
        }
    }

    fn delete(&self, state: &dyn ReadOnlyState, inst: &Instruction, coins: Vec<Coin>) -> ContractResult<ContractOutput> {
        state.get_values(&inst.instance_id)?;
        Ok((vec![StateChange::remove(inst.instance_id)], coins))
    }
}
