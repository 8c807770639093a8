//! Deterministic execution of client transactions.
//!
//! Each instruction is checked (signatures over the transaction hash,
//! signer counters, darc rule for its action), its counters are bumped and
//! it is dispatched to a contract. Any failure drops every change of the
//! transaction.

use conode_crypto::Hash256;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::contracts::config::CONTRACT_CONFIG;
use crate::contracts::{Coin, ContractOutput, ContractRegistry};
use crate::darc::{check_action, Darc, Identity};
use crate::instruction::{ClientTransaction, InstanceId, Instruction, InstructionKind};
use crate::state::{GlobalState, ReadOnlyState, StagingState, StateChange, DARC_CONTRACT};
use crate::{ByzCoinError, ByzCoinResult};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxResult {
    pub tx: ClientTransaction,
    pub accepted: bool,
}

/// Trie key of the replay counter of `identity`.
pub fn counter_key(identity: &Identity) -> InstanceId {
    Hash256::from_parts(&[&b"signercounter_"[..], identity.to_string().as_bytes()])
}

pub fn get_counter(state: &dyn ReadOnlyState, identity: &Identity) -> ByzCoinResult<u64> {
    match state.get_entry(&counter_key(identity))? {
        Some(entry) => {
            let bytes: [u8; 8] = entry
                .value
                .as_slice()
                .try_into()
                .map_err(|_| ByzCoinError::InvalidStateChange("corrupt signer counter".into()))?;
            Ok(u64::from_le_bytes(bytes))
        }
        None => Ok(0),
    }
}

fn authorize(state: &dyn ReadOnlyState, inst: &Instruction, tx_hash: &Hash256) -> ByzCoinResult<()> {
    inst.verify_signatures(tx_hash)?;
    for (identity, &got) in inst.signer_identities.iter().zip(&inst.signer_counters) {
        let expected = get_counter(state, identity)? + 1;
        if got != expected {
            return Err(ByzCoinError::CounterMismatch {
                identity: identity.to_string(),
                expected,
                got,
            });
        }
    }

    let entry = state.get_values(&inst.instance_id)?;
    let darc: Darc = if entry.contract_id == DARC_CONTRACT {
        bincode::deserialize(&entry.value)?
    } else {
        state.get_darc(&entry.darc_id)?
    };
    let lookup = |id: &Hash256| state.get_darc(id).ok();
    check_action(&darc, &inst.action(), &inst.signer_identities, &lookup)?;
    Ok(())
}

fn bump_counters(staging: &mut StagingState<'_>, inst: &Instruction) -> ByzCoinResult<()> {
    for (identity, counter) in inst.signer_identities.iter().zip(&inst.signer_counters) {
        let key = counter_key(identity);
        let value = counter.to_le_bytes().to_vec();
        let sc = if staging.get_entry(&key)?.is_some() {
            StateChange::update(key, "", value, Hash256::ZERO)
        } else {
            StateChange::create(key, "", value, Hash256::ZERO)
        };
        staging.stage(sc)?;
    }
    Ok(())
}

fn dispatch(
    state: &dyn ReadOnlyState,
    registry: &ContractRegistry,
    inst: &Instruction,
    coins: Vec<Coin>,
) -> ByzCoinResult<ContractOutput> {
    let entry = state.get_values(&inst.instance_id)?;
    let output = match &inst.kind {
        InstructionKind::Spawn { contract_id, .. } => {
            // Spawning on a darc picks the contract by argument; spawning on
            // any other instance is handled by that instance's contract.
            let name = if entry.contract_id == DARC_CONTRACT {
                contract_id.as_str()
            } else {
                entry.contract_id.as_str()
            };
            registry.get(name)?.spawn(state, inst, coins)?
        }
        InstructionKind::Invoke { .. } => registry.get(&entry.contract_id)?.invoke(state, inst, coins)?,
        InstructionKind::Delete => registry.get(&entry.contract_id)?.delete(state, inst, coins)?,
    };
    Ok(output)
}

/// State changes of `tx` on top of `state`, or the reason it is refused.
pub fn execute_transaction(
    state: &dyn ReadOnlyState,
    registry: &ContractRegistry,
    tx: &ClientTransaction,
) -> ByzCoinResult<Vec<StateChange>> {
    if tx.instructions.is_empty() {
        return Err(ByzCoinError::InvalidTransaction("no instructions".into()));
    }
    let tx_hash = tx.hash();
    let mut staging = StagingState::new(state);
    let mut coins = Vec::new();
    for inst in &tx.instructions {
        authorize(&staging, inst, &tx_hash)?;
        bump_counters(&mut staging, inst)?;
        let (changes, left) = dispatch(&staging, registry, inst, coins)?;
        staging.stage_all(changes)?;
        coins = left;
    }
    if !coins.is_empty() {
        debug!("transaction {} leaves {} coin entries unclaimed", tx_hash, coins.len());
    }
    Ok(staging.into_changes())
}

/// The genesis transaction spawns the config instance without any darc to
/// check against.
pub fn execute_genesis(
    state: &dyn ReadOnlyState,
    registry: &ContractRegistry,
    tx: &ClientTransaction,
) -> ByzCoinResult<Vec<StateChange>> {
    let [inst] = tx.instructions.as_slice() else {
        return Err(ByzCoinError::InvalidTransaction("genesis has exactly one instruction".into()));
    };
    if !matches!(&inst.kind, InstructionKind::Spawn { contract_id, .. } if contract_id == CONTRACT_CONFIG) {
        return Err(ByzCoinError::InvalidTransaction("genesis must spawn the config".into()));
    }
    let mut staging = StagingState::new(state);
    let (changes, _) = registry.get(CONTRACT_CONFIG)?.spawn(&staging, inst, Vec::new())?;
    staging.stage_all(changes)?;
    Ok(staging.into_changes())
}

/// Outcome of running a batch of transactions on top of a state.
pub struct BlockOutcome {
    pub state: GlobalState,
    pub results: Vec<TxResult>,
    /// Changes of the accepted transactions, in order
    pub changes: Vec<StateChange>,
}

/// Runs `txs` in order on a copy of `state`, keeping the ones that succeed.
pub fn execute_block(
    state: &GlobalState,
    registry: &ContractRegistry,
    txs: Vec<ClientTransaction>,
) -> ByzCoinResult<BlockOutcome> {
    let mut working = state.clone();
    let mut results = Vec::with_capacity(txs.len());
    let mut all_changes = Vec::new();
    for tx in txs {
        match execute_transaction(&working, registry, &tx) {
            Ok(changes) => {
                working.apply(&changes)?;
                all_changes.extend(changes);
                results.push(TxResult { tx, accepted: true });
            }
            Err(e) => {
                warn!("refusing transaction {}: {}", tx.hash(), e);
                results.push(TxResult { tx, accepted: false });
            }
        }
    }
    Ok(BlockOutcome {
        state: working,
        results,
        changes: all_changes,
    })
}

/// Re-executes recorded results on `state`. Every transaction must end the
/// way the block says it did. Returns the changes that were applied.
pub fn replay(
    state: &mut GlobalState,
    registry: &ContractRegistry,
    results: &[TxResult],
    genesis: bool,
) -> ByzCoinResult<Vec<StateChange>> {
    let mut applied = Vec::new();
    for result in results {
        let outcome = if genesis {
            execute_genesis(&*state, registry, &result.tx)
        } else {
            execute_transaction(&*state, registry, &result.tx)
        };
        match (outcome, result.accepted) {
            (Ok(changes), true) => {
                state.apply(&changes)?;
                applied.extend(changes);
            }
            (Err(_), false) => {}
            (Ok(_), false) => {
                return Err(ByzCoinError::InvalidBlock(format!(
                    "transaction {} was refused but succeeds",
                    result.tx.hash()
                )))
            }
            (Err(e), true) => {
                return Err(ByzCoinError::InvalidBlock(format!(
                    "accepted transaction {} fails: {}",
                    result.tx.hash(),
                    e
                )))
            }
        }
    }
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::coin::CONTRACT_COIN;
    use crate::contracts::config::CONFIG_INSTANCE;
    use crate::contracts::Coin;
    use crate::darc::{Rules, Signer};
    use crate::instruction::Arguments;

    struct Ledger {
        state: GlobalState,
        registry: ContractRegistry,
        owner: Signer,
        darc: Darc,
        counter: u64,
    }

    impl Ledger {
        fn new() -> Self {
            let owner = Signer::generate();
            let mut rules = Rules::for_owner(&owner.identity());
            for action in ["spawn:coin", "invoke:mint", "invoke:transfer", "spawn:value", "invoke:update", "delete"] {
                rules.set(action, &owner.identity().to_string());
            }
            let darc = Darc::new(rules, b"genesis");
            let genesis = ClientTransaction::new(vec![Instruction::spawn(
                CONFIG_INSTANCE,
                CONTRACT_CONFIG,
                Arguments::new()
                    .with("darc", bincode::serialize(&darc).unwrap())
                    .with("block_interval", 1000u64.to_le_bytes().to_vec()),
            )]);
            let mut state = GlobalState::new(genesis.hash().as_ref());
            let registry = ContractRegistry::with_builtins();
            let changes = execute_genesis(&state, &registry, &genesis).unwrap();
            state.apply(&changes).unwrap();
            Ledger {
                state,
                registry,
                owner,
                darc,
                counter: 0,
            }
        }

        fn tx(&mut self, inst: Instruction) -> ClientTransaction {
            self.counter += 1;
            let inst = inst.signed_by(vec![self.owner.identity()], vec![self.counter]);
            let mut tx = ClientTransaction::new(vec![inst]);
            tx.sign(&[&self.owner]);
            tx
        }

        fn run(&mut self, inst: Instruction) -> ByzCoinResult<ClientTransaction> {
            let tx = self.tx(inst);
            match execute_transaction(&self.state, &self.registry, &tx) {
                Ok(changes) => {
                    self.state.apply(&changes)?;
                    Ok(tx)
                }
                Err(e) => {
                    self.counter -= 1;
                    Err(e)
                }
            }
        }

        fn balance(&self, id: &InstanceId) -> u64 {
            let entry = self.state.get_values(id).unwrap();
            bincode::deserialize::<Coin>(&entry.value).unwrap().value
        }

        fn spawn_coin(&mut self) -> InstanceId {
            let tx = self
                .run(Instruction::spawn(self.darc.get_base_id(), CONTRACT_COIN, Arguments::new()))
                .unwrap();
            tx.instructions[0].derive_id("")
        }
    }

    fn coins(n: u64) -> Arguments {
        Arguments::new().with("coins", n.to_le_bytes().to_vec())
    }

    #[test]
    fn test_mint_and_transfer() {
        let mut ledger = Ledger::new();
        let a = ledger.spawn_coin();
        let b = ledger.spawn_coin();
        ledger.run(Instruction::invoke(a, "mint", coins(1000))).unwrap();
        ledger
            .run(Instruction::invoke(a, "transfer", coins(100).with("destination", b.as_bytes().to_vec())))
            .unwrap();
        assert_eq!(ledger.balance(&a), 900);
        assert_eq!(ledger.balance(&b), 100);

        let root = ledger.state.root();
        let err = ledger
            .run(Instruction::invoke(b, "transfer", coins(10_000).with("destination", a.as_bytes().to_vec())))
            .unwrap_err();
        assert!(matches!(
            err,
            ByzCoinError::Contract(crate::ContractError::InsufficientBalance { balance: 100, amount: 10_000 })
        ));
        assert_eq!(ledger.state.root(), root);
        assert_eq!(ledger.balance(&a), 900);
        assert_eq!(ledger.balance(&b), 100);
    }

    #[test]
    fn test_replayed_counter_is_refused() {
        let mut ledger = Ledger::new();
        let tx = ledger.tx(Instruction::spawn(ledger.darc.get_base_id(), CONTRACT_COIN, Arguments::new()));
        let changes = execute_transaction(&ledger.state, &ledger.registry, &tx).unwrap();
        ledger.state.apply(&changes).unwrap();
        assert_eq!(get_counter(&ledger.state, &ledger.owner.identity()).unwrap(), 1);
        assert!(matches!(
            execute_transaction(&ledger.state, &ledger.registry, &tx),
            Err(ByzCoinError::CounterMismatch { expected: 2, got: 1, .. })
        ));
    }

    #[test]
    fn test_unauthorized_signer_is_refused() {
        let mut ledger = Ledger::new();
        let stranger = Signer::generate();
        let inst = Instruction::spawn(ledger.darc.get_base_id(), CONTRACT_COIN, Arguments::new())
            .signed_by(vec![stranger.identity()], vec![1]);
        let mut tx = ClientTransaction::new(vec![inst]);
        tx.sign(&[&stranger]);
        assert!(matches!(
            execute_transaction(&ledger.state, &ledger.registry, &tx),
            Err(ByzCoinError::Darc(_))
        ));
        // The owner still can.
        ledger.spawn_coin();
    }

    #[test]
    fn test_failing_instruction_aborts_whole_transaction() {
        let mut ledger = Ledger::new();
        let a = ledger.spawn_coin();
        let counter = ledger.counter + 1;
        let identity = ledger.owner.identity();
        let mint = Instruction::invoke(a, "mint", coins(5)).signed_by(vec![identity], vec![counter]);
        let bad = Instruction::invoke(a, "transfer", coins(50).with("destination", a.as_bytes().to_vec()))
            .signed_by(vec![identity], vec![counter + 1]);
        let mut tx = ClientTransaction::new(vec![mint, bad]);
        tx.sign(&[&ledger.owner]);
        assert!(execute_transaction(&ledger.state, &ledger.registry, &tx).is_err());
        assert_eq!(ledger.balance(&a), 0);
    }

    #[test]
    fn test_value_lifecycle_and_versions() {
        let mut ledger = Ledger::new();
        let base = ledger.darc.get_base_id();
        let tx = ledger
            .run(Instruction::spawn(base, "value", Arguments::new().with("value", b"one".to_vec())))
            .unwrap();
        let id = tx.instructions[0].derive_id("");
        assert_eq!(ledger.state.get_values(&id).unwrap().version, 0);
        ledger
            .run(Instruction::invoke(id, "update", Arguments::new().with("value", b"two".to_vec())))
            .unwrap();
        let entry = ledger.state.get_values(&id).unwrap();
        assert_eq!((entry.value.as_slice(), entry.version), (&b"two"[..], 1));
        ledger.run(Instruction::delete(id)).unwrap();
        assert!(ledger.state.get_entry(&id).unwrap().is_none());
    }

    #[test]
    fn test_darc_evolution_changes_owner() {
        let mut ledger = Ledger::new();
        let base = ledger.darc.get_base_id();
        let heir = Signer::generate();
        let mut rules = ledger.darc.rules.clone();
        rules.set("invoke:evolve", &heir.identity().to_string());
        rules.set("spawn:coin", &heir.identity().to_string());
        let next = ledger.darc.evolve(rules);
        ledger
            .run(Instruction::invoke(base, "evolve", Arguments::new().with("darc", bincode::serialize(&next).unwrap())))
            .unwrap();
        let stored = ledger.state.get_darc(&base).unwrap();
        assert_eq!(stored.version, 1);
        assert!(ledger
            .run(Instruction::spawn(base, CONTRACT_COIN, Arguments::new()))
            .is_err());
    }
}
