use super::{required_arg, Coin, Contract, ContractOutput};
use crate::darc::Darc;
use crate::instruction::{Instruction, InstructionKind};
use crate::state::{ReadOnlyState, StateChange, DARC_CONTRACT};
use crate::{ContractError, ContractResult, DarcError};

/// Darcs live at their base id and govern themselves.
pub struct DarcContract;

fn decode_darc(inst: &Instruction) -> ContractResult<(Darc, Vec<u8>)> {
    let bytes = required_arg(inst, "darc")?.to_vec();
    let darc: Darc = bincode::deserialize(&bytes)?;
    Ok((darc, bytes))
}

impl Contract for DarcContract {
    fn name(&self) -> &'static str {
        DARC_CONTRACT
    }

    fn spawn(&self, _state: &dyn ReadOnlyState, inst: &Instruction, coins: Vec<Coin>) -> ContractResult<ContractOutput> {
        let (darc, bytes) = decode_darc(inst)?;
        if darc.version != 0 || darc.base_id.is_some() {
            return Err(ContractError::InvalidArgument("a new darc must be version 0".into()));
        }
        let id = darc.get_base_id();
        Ok((vec![StateChange::create(id, DARC_CONTRACT, bytes, id)], coins))
    }

    fn invoke(&self, state: &dyn ReadOnlyState, inst: &Instruction, coins: Vec<Coin>) -> ContractResult<ContractOutput> {
        match &inst.kind {
            InstructionKind::Invoke { command, .. } if command == "evolve" => {
                let current = state.get_darc(&inst.instance_id)?;
                let (next, bytes) = decode_darc(inst)?;
                next.verify_evolution(&current)?;
                if next.get_base_id() != inst.instance_id {
                    return Err(DarcError::InvalidEvolution("darc stored under another id".into()).into());
                }
                Ok((
                    vec![StateChange::update(inst.instance_id, DARC_CONTRACT, bytes, inst.instance_id)],
                    coins,
                ))
            }
            _ => Err(super::unsupported(DARC_CONTRACT, &inst.action())),
        }
    }
}
