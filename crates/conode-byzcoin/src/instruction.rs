use conode_crypto::Hash256;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::darc::{DarcResult, Identity, Signer};
use crate::DarcError;

pub type InstanceId = Hash256;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Argument {
    pub name: String,
    pub value: Vec<u8>,
}

/// Ordered arguments; names may repeat and lookups return the first match.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Arguments(pub Vec<Argument>);

impl Arguments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl Into<Vec<u8>>) -> Self {
        self.0.push(Argument {
            name: name.to_string(),
            value: value.into(),
        });
        self
    }

    pub fn search(&self, name: &str) -> Option<&[u8]> {
        self.0.iter().find(|a| a.name == name).map(|a| a.value.as_slice())
    }

    fn hash_into(&self, h: &mut Sha256) {
        h.update((self.0.len() as u64).to_le_bytes());
        for arg in &self.0 {
            h.update((arg.name.len() as u64).to_le_bytes());
            h.update(arg.name.as_bytes());
            h.update((arg.value.len() as u64).to_le_bytes());
            h.update(&arg.value);
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstructionKind {
    Spawn { contract_id: String, args: Arguments },
    Invoke { command: String, args: Arguments },
    Delete,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub instance_id: InstanceId,
    pub kind: InstructionKind,
    pub signer_identities: Vec<Identity>,
    /// One counter per signer, exactly one above the stored counter
    pub signer_counters: Vec<u64>,
    /// Signatures over the hash of the enclosing transaction
    pub signatures: Vec<Vec<u8>>,
}

impl Instruction {
    pub fn spawn(instance_id: InstanceId, contract_id: &str, args: Arguments) -> Self {
        Self::with_kind(
            instance_id,
            InstructionKind::Spawn {
                contract_id: contract_id.to_string(),
                args,
            },
        )
    }

    pub fn invoke(instance_id: InstanceId, command: &str, args: Arguments) -> Self {
        Self::with_kind(
            instance_id,
            InstructionKind::Invoke {
                command: command.to_string(),
                args,
            },
        )
    }

    pub fn delete(instance_id: InstanceId) -> Self {
        Self::with_kind(instance_id, InstructionKind::Delete)
    }

    fn with_kind(instance_id: InstanceId, kind: InstructionKind) -> Self {
        Instruction {
            instance_id,
            kind,
            signer_identities: Vec::new(),
            signer_counters: Vec::new(),
            signatures: Vec::new(),
        }
    }

    /// Declares who signs this instruction and with which counters.
    pub fn signed_by(mut self, identities: Vec<Identity>, counters: Vec<u64>) -> Self {
        self.signer_identities = identities;
        self.signer_counters = counters;
        self
    }

    pub fn args(&self) -> Option<&Arguments> {
        match &self.kind {
            InstructionKind::Spawn { args, .. } | InstructionKind::Invoke { args, .. } => Some(args),
            InstructionKind::Delete => None,
        }
    }

    /// First argument called `name`, if any.
    pub fn arg(&self, name: &str) -> Option<&[u8]> {
        self.args().and_then(|a| a.search(name))
    }

    /// Darc action this instruction needs: `spawn:<contract>`,
    /// `invoke:<command>` or `delete`.
    pub fn action(&self) -> String {
        match &self.kind {
            InstructionKind::Spawn { contract_id, .. } => format!("spawn:{}", contract_id),
            InstructionKind::Invoke { command, .. } => format!("invoke:{}", command),
            InstructionKind::Delete => "delete".to_string(),
        }
    }

    /// Digest of everything but the signatures.
    pub fn hash(&self) -> Hash256 {
        let mut h = Sha256::new();
        h.update(self.instance_id.as_bytes());
        match &self.kind {
            InstructionKind::Spawn { contract_id, args } => {
                h.update([0u8]);
                h.update((contract_id.len() as u64).to_le_bytes());
                h.update(contract_id.as_bytes());
                args.hash_into(&mut h);
            }
            InstructionKind::Invoke { command, args } => {
                h.update([1u8]);
                h.update((command.len() as u64).to_le_bytes());
                h.update(command.as_bytes());
                args.hash_into(&mut h);
            }
            InstructionKind::Delete => h.update([2u8]),
        }
        h.update((self.signer_identities.len() as u64).to_le_bytes());
        for id in &self.signer_identities {
            h.update(id.to_string().as_bytes());
        }
        for counter in &self.signer_counters {
            h.update(counter.to_le_bytes());
        }
        Hash256(h.finalize().into())
    }

    /// Id of an instance created by this instruction, unique per `what`.
    pub fn derive_id(&self, what: &str) -> InstanceId {
        Hash256::from_parts(&[self.hash().as_ref(), what.as_bytes()])
    }

    pub fn verify_signatures(&self, tx_hash: &Hash256) -> DarcResult<()> {
        if self.signer_identities.is_empty() {
            return Err(DarcError::InvalidSignature("instruction has no signers".into()));
        }
        if self.signatures.len() != self.signer_identities.len()
            || self.signer_counters.len() != self.signer_identities.len()
        {
            return Err(DarcError::InvalidSignature("signers, counters and signatures differ in number".into()));
        }
        for (id, sig) in self.signer_identities.iter().zip(&self.signatures) {
            id.verify(tx_hash.as_ref(), sig)?;
        }
        Ok(())
    }
}

/// Instructions applied atomically, signed together.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientTransaction {
    pub instructions: Vec<Instruction>,
}

impl ClientTransaction {
    pub fn new(instructions: Vec<Instruction>) -> Self {
        ClientTransaction { instructions }
    }

    pub fn hash(&self) -> Hash256 {
        let mut h = Sha256::new();
        for inst in &self.instructions {
            h.update(inst.hash().as_bytes());
        }
        Hash256(h.finalize().into())
    }

    /// Every instruction gets one signature per signer, in the order of
    /// its declared identities.
    pub fn sign(&mut self, signers: &[&Signer]) {
        let digest = self.hash();
        for inst in &mut self.instructions {
            inst.signatures = inst
                .signer_identities
                .iter()
                .map(|id| {
                    signers
                        .iter()
                        .find(|s| s.identity() == *id)
                        .map(|s| s.sign(digest.as_ref()))
                        .unwrap_or_default()
                })
                .collect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_match_argument_lookup() {
        let args = Arguments::new().with("coins", vec![1u8]).with("coins", vec![2u8]);
        assert_eq!(args.search("coins"), Some(&[1u8][..]));
        assert_eq!(args.search("missing"), None);
    }

    #[test]
    fn test_actions() {
        let id = Hash256::digest(b"i");
        assert_eq!(Instruction::spawn(id, "coin", Arguments::new()).action(), "spawn:coin");
        assert_eq!(Instruction::invoke(id, "mint", Arguments::new()).action(), "invoke:mint");
        assert_eq!(Instruction::delete(id).action(), "delete");
    }

    #[test]
    fn test_signatures_cover_transaction() {
        let signer = Signer::generate();
        let inst = Instruction::invoke(Hash256::digest(b"i"), "mint", Arguments::new())
            .signed_by(vec![signer.identity()], vec![1]);
        let mut tx = ClientTransaction::new(vec![inst]);
        tx.sign(&[&signer]);
        let digest = tx.hash();
        tx.instructions[0].verify_signatures(&digest).unwrap();
        assert!(tx.instructions[0].verify_signatures(&Hash256::digest(b"other")).is_err());

        // Signatures are not part of the hash.
        let before = tx.instructions[0].hash();
        tx.instructions[0].signatures.clear();
        assert_eq!(tx.instructions[0].hash(), before);
    }

    #[test]
    fn test_derived_ids_differ() {
        let inst = Instruction::spawn(Hash256::digest(b"d"), "value", Arguments::new());
        assert_ne!(inst.derive_id(""), inst.derive_id("other"));
    }
}
