//! Instances stored in the trie and the staged view used during execution.

use std::collections::HashMap;

use log::trace;
use serde::{Deserialize, Serialize};

use crate::darc::{Darc, DarcId};
use crate::instruction::InstanceId;
use crate::trie::{Trie, TrieResult};
use crate::{ByzCoinError, ByzCoinResult, ContractError, ContractResult};

pub const DARC_CONTRACT: &str = "darc";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateEntry {
    pub value: Vec<u8>,
    pub version: u64,
    pub contract_id: String,
    pub darc_id: DarcId,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateAction {
    Create,
    Update,
    Remove,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub action: StateAction,
    pub instance_id: InstanceId,
    pub contract_id: String,
    pub value: Vec<u8>,
    pub darc_id: DarcId,
    /// Assigned when the change is staged
    pub version: u64,
}

impl StateChange {
    pub fn new(action: StateAction, instance_id: InstanceId, contract_id: &str, value: Vec<u8>, darc_id: DarcId) -> Self {
        StateChange {
            action,
            instance_id,
            contract_id: contract_id.to_string(),
            value,
            darc_id,
            version: 0,
        }
    }

    pub fn create(instance_id: InstanceId, contract_id: &str, value: Vec<u8>, darc_id: DarcId) -> Self {
        Self::new(StateAction::Create, instance_id, contract_id, value, darc_id)
    }

    pub fn update(instance_id: InstanceId, contract_id: &str, value: Vec<u8>, darc_id: DarcId) -> Self {
        Self::new(StateAction::Update, instance_id, contract_id, value, darc_id)
    }

    pub fn remove(instance_id: InstanceId) -> Self {
        Self::new(StateAction::Remove, instance_id, "", Vec::new(), DarcId::ZERO)
    }
}

/// Read access to instances, given to contracts.
pub trait ReadOnlyState {
    fn get_entry(&self, id: &InstanceId) -> TrieResult<Option<StateEntry>>;

    fn get_values(&self, id: &InstanceId) -> ContractResult<StateEntry> {
        self.get_entry(id)?.ok_or(ContractError::UnknownInstance(*id))
    }

    /// Latest version of the darc with base id `id`.
    fn get_darc(&self, id: &DarcId) -> ContractResult<Darc> {
        let entry = self.get_values(id)?;
        if entry.contract_id != DARC_CONTRACT {
            return Err(ContractError::WrongContract {
                expected: DARC_CONTRACT.to_string(),
                got: entry.contract_id,
            });
        }
        Ok(bincode::deserialize(&entry.value)?)
    }
}

// ==================== GLOBAL STATE ====================

/// Committed state of one ledger.
#[derive(Clone, Debug)]
pub struct GlobalState {
    trie: Trie,
}

impl GlobalState {
    pub fn new(nonce: &[u8]) -> Self {
        GlobalState { trie: Trie::new(nonce) }
    }

    pub fn trie(&self) -> &Trie {
        &self.trie
    }

    pub fn root(&self) -> conode_crypto::Hash256 {
        self.trie.root()
    }

    /// Writes staged changes; they have already been checked and versioned.
    pub fn apply(&mut self, changes: &[StateChange]) -> ByzCoinResult<()> {
        for sc in changes {
            match sc.action {
                StateAction::Create | StateAction::Update => {
                    let entry = StateEntry {
                        value: sc.value.clone(),
                        version: sc.version,
                        contract_id: sc.contract_id.clone(),
                        darc_id: sc.darc_id,
                    };
                    self.trie.set(sc.instance_id.as_ref(), &bincode::serialize(&entry)?)?;
                }
                StateAction::Remove => {
                    self.trie.delete(sc.instance_id.as_ref())?;
                }
            }
        }
        Ok(())
    }
}

impl ReadOnlyState for GlobalState {
    fn get_entry(&self, id: &InstanceId) -> TrieResult<Option<StateEntry>> {
        match self.trie.get(id.as_ref())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }
}

// ==================== STAGING ====================

/// Changes layered over a read-only base. Staging a change checks it
/// against what it overrides and assigns its version.
pub struct StagingState<'a> {
    base: &'a dyn ReadOnlyState,
    overlay: HashMap<InstanceId, Option<StateEntry>>,
    changes: Vec<StateChange>,
}

impl<'a> StagingState<'a> {
    pub fn new(base: &'a dyn ReadOnlyState) -> Self {
        StagingState {
            base,
            overlay: HashMap::new(),
            changes: Vec::new(),
        }
    }

    pub fn stage(&mut self, mut sc: StateChange) -> ByzCoinResult<()> {
        let current = self.get_entry(&sc.instance_id)?;
        match (sc.action, current) {
            (StateAction::Create, None) => sc.version = 0,
            (StateAction::Create, Some(_)) => {
                return Err(ByzCoinError::InvalidStateChange(format!("instance {} already exists", sc.instance_id)))
            }
            (StateAction::Update, Some(prev)) => sc.version = prev.version + 1,
            (StateAction::Remove, Some(prev)) => sc.version = prev.version + 1,
            (_, None) => {
                return Err(ByzCoinError::InvalidStateChange(format!("instance {} does not exist", sc.instance_id)))
            }
        }
        let entry = match sc.action {
            StateAction::Remove => None,
            _ => Some(StateEntry {
                value: sc.value.clone(),
                version: sc.version,
                contract_id: sc.contract_id.clone(),
                darc_id: sc.darc_id,
            }),
        };
        trace!("staged {:?} on {} at version {}", sc.action, sc.instance_id, sc.version);
        self.overlay.insert(sc.instance_id, entry);
        self.changes.push(sc);
        Ok(())
    }

    pub fn stage_all(&mut self, changes: Vec<StateChange>) -> ByzCoinResult<()> {
        for sc in changes {
            self.stage(sc)?;
        }
        Ok(())
    }

    pub fn changes(&self) -> &[StateChange] {
        &self.changes
    }

    pub fn into_changes(self) -> Vec<StateChange> {
        self.changes
    }
}

impl ReadOnlyState for StagingState<'_> {
    fn get_entry(&self, id: &InstanceId) -> TrieResult<Option<StateEntry>> {
        match self.overlay.get(id) {
            Some(entry) => Ok(entry.clone()),
            None => self.base.get_entry(id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conode_crypto::Hash256;

    #[test]
    fn test_versions_follow_updates() {
        let mut global = GlobalState::new(b"n");
        let id = Hash256::digest(b"instance");
        let darc = Hash256::digest(b"darc");
        let mut staging = StagingState::new(&global);
        staging.stage(StateChange::create(id, "value", b"a".to_vec(), darc)).unwrap();
        staging.stage(StateChange::update(id, "value", b"b".to_vec(), darc)).unwrap();
        assert_eq!(staging.get_values(&id).unwrap().version, 1);
        let changes = staging.into_changes();
        global.apply(&changes).unwrap();

        let entry = global.get_values(&id).unwrap();
        assert_eq!(entry.value, b"b".to_vec());
        assert_eq!(entry.version, 1);

        let mut staging = StagingState::new(&global);
        assert!(staging.stage(StateChange::create(id, "value", vec![], darc)).is_err());
        staging.stage(StateChange::remove(id)).unwrap();
        assert!(staging.get_entry(&id).unwrap().is_none());
        assert!(staging.stage(StateChange::update(id, "value", vec![], darc)).is_err());
    }
}
