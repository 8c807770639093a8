// DARC ACCESS CONTROL
// Distributed Access Rights Control: a versioned record mapping actions to
// boolean expressions over identities.
//
// Expressions combine identities with `&` (binds tighter) and `|`, grouped
// by parentheses:  `ed25519:ab12.. | (darc:cd34.. & ed25519:ef56..)`.
// An `ed25519:` identity is satisfied when it signed; a `darc:` identity
// when the `_sign` rule of the latest version of that darc is satisfied by
// the same signers.
//
// SAFETY INVARIANTS:
// 1. A darc's id covers version, description, base id, previous id and rules
// 2. An evolution bumps the version by one and points at the current id
// 3. Darc references are followed at most MAX_DEPTH levels deep
// 4. Parentheses nest at most MAX_DEPTH levels deep

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use conode_crypto::Hash256;
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::DarcError;

pub type DarcId = Hash256;
pub type DarcResult<T> = Result<T, DarcError>;

/// Deepest chain of `darc:` references followed during evaluation, and
/// deepest parenthesis nesting accepted in an expression.
pub const MAX_DEPTH: usize = 10;

pub const SIGN_ACTION: &str = "_sign";
pub const EVOLVE_ACTION: &str = "invoke:evolve";

// ==================== IDENTITIES ====================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Identity {
    Ed25519([u8; 32]),
    Darc(DarcId),
}

impl Identity {
    pub fn verify(&self, msg: &[u8], signature: &[u8]) -> DarcResult<()> {
        let Identity::Ed25519(public) = self else {
            return Err(DarcError::InvalidIdentity(format!("{} cannot sign", self)));
        };
        let key = VerifyingKey::from_bytes(public).map_err(|_| DarcError::InvalidIdentity(self.to_string()))?;
        let signature = Signature::from_slice(signature).map_err(|_| DarcError::InvalidSignature(self.to_string()))?;
        key.verify(msg, &signature)
            .map_err(|_| DarcError::InvalidSignature(self.to_string()))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Ed25519(public) => write!(f, "ed25519:{}", hex::encode(public)),
            Identity::Darc(id) => write!(f, "darc:{}", id.to_hex()),
        }
    }
}

impl FromStr for Identity {
    type Err = DarcError;

    fn from_str(s: &str) -> DarcResult<Self> {
        let invalid = || DarcError::InvalidIdentity(s.to_string());
        let (kind, data) = s.split_once(':').ok_or_else(invalid)?;
        let bytes: [u8; 32] = hex::decode(data)
            .map_err(|_| invalid())?
            .try_into()
            .map_err(|_| invalid())?;
        match kind {
            "ed25519" => Ok(Identity::Ed25519(bytes)),
            "darc" => Ok(Identity::Darc(Hash256(bytes))),
            _ => Err(invalid()),
        }
    }
}

/// Holder of an ed25519 key that signs client transactions.
#[derive(Clone)]
pub struct Signer {
    key: SigningKey,
}

impl Signer {
    pub fn generate() -> Self {
        Signer {
            key: SigningKey::generate(&mut rand::rngs::OsRng),
        }
    }

    pub fn identity(&self) -> Identity {
        Identity::Ed25519(self.key.verifying_key().to_bytes())
    }

    pub fn sign(&self, msg: &[u8]) -> Vec<u8> {
        self.key.sign(msg).to_bytes().to_vec()
    }
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signer({})", self.identity())
    }
}

// ==================== DARC ====================

/// Action -> expression.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rules(BTreeMap<String, String>);

impl Rules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rules letting `owner` sign for the darc and evolve it.
    pub fn for_owner(owner: &Identity) -> Self {
        let mut rules = Rules::new();
        rules.set(SIGN_ACTION, &owner.to_string());
        rules.set(EVOLVE_ACTION, &owner.to_string());
        rules
    }

    pub fn set(&mut self, action: &str, expression: &str) {
        self.0.insert(action.to_string(), expression.to_string());
    }

    pub fn get(&self, action: &str) -> Option<&str> {
        self.0.get(action).map(String::as_str)
    }

    pub fn contains(&self, action: &str) -> bool {
        self.0.contains_key(action)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Darc {
    pub version: u64,
    pub description: Vec<u8>,
    /// Id of version 0; `None` on version 0 itself
    pub base_id: Option<DarcId>,
    pub prev_id: DarcId,
    pub rules: Rules,
}

impl Darc {
    pub fn new(rules: Rules, description: &[u8]) -> Self {
        Darc {
            version: 0,
            description: description.to_vec(),
            base_id: None,
            prev_id: Hash256::ZERO,
            rules,
        }
    }

    pub fn get_id(&self) -> DarcId {
        let mut h = Sha256::new();
        h.update(self.version.to_le_bytes());
        h.update((self.description.len() as u64).to_le_bytes());
        h.update(&self.description);
        match &self.base_id {
            Some(base) => {
                h.update([1u8]);
                h.update(base.as_bytes());
            }
            None => h.update([0u8]),
        }
        h.update(self.prev_id.as_bytes());
        for (action, expr) in self.rules.iter() {
            h.update((action.len() as u64).to_le_bytes());
            h.update(action.as_bytes());
            h.update((expr.len() as u64).to_le_bytes());
            h.update(expr.as_bytes());
        }
        Hash256(h.finalize().into())
    }

    pub fn get_base_id(&self) -> DarcId {
        self.base_id.unwrap_or_else(|| self.get_id())
    }

    pub fn identity(&self) -> Identity {
        Identity::Darc(self.get_base_id())
    }

    /// Successor of `self` carrying `rules`.
    pub fn evolve(&self, rules: Rules) -> Darc {
        Darc {
            version: self.version + 1,
            description: self.description.clone(),
            base_id: Some(self.get_base_id()),
            prev_id: self.get_id(),
            rules,
        }
    }

    /// Checks that `self` is a valid next version of `current`.
    pub fn verify_evolution(&self, current: &Darc) -> DarcResult<()> {
        if self.version != current.version + 1 {
            return Err(DarcError::InvalidEvolution(format!(
                "version {} does not follow {}",
                self.version, current.version
            )));
        }
        if self.base_id != Some(current.get_base_id()) {
            return Err(DarcError::InvalidEvolution("base id changed".into()));
        }
        if self.prev_id != current.get_id() {
            return Err(DarcError::InvalidEvolution("previous id is not the current version".into()));
        }
        Ok(())
    }
}

// ==================== EXPRESSIONS ====================

#[derive(Clone, Debug, PartialEq, Eq)]
enum Expr {
    Id(String),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

struct Parser<'a> {
    tokens: Vec<&'a str>,
    pos: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        let mut tokens = Vec::new();
        let mut start = None;
        for (i, c) in input.char_indices() {
            let is_op = matches!(c, '&' | '|' | '(' | ')');
            if is_op || c.is_whitespace() {
                if let Some(s) = start.take() {
                    tokens.push(&input[s..i]);
                }
                if is_op {
                    tokens.push(&input[i..i + 1]);
                }
            } else if start.is_none() {
                start = Some(i);
            }
        }
        if let Some(s) = start {
            tokens.push(&input[s..]);
        }
        Parser {
            tokens,
            pos: 0,
            depth: 0,
        }
    }

    fn peek(&self) -> Option<&'a str> {
        self.tokens.get(self.pos).copied()
    }

    fn next(&mut self) -> Option<&'a str> {
        let t = self.peek();
        self.pos += 1;
        t
    }

    fn parse(mut self) -> DarcResult<Expr> {
        let expr = self.or()?;
        match self.peek() {
            None => Ok(expr),
            Some(t) => Err(DarcError::Parse(format!("unexpected {}", t))),
        }
    }

    fn or(&mut self) -> DarcResult<Expr> {
        let mut left = self.and()?;
        while self.peek() == Some("|") {
            self.next();
            left = Expr::Or(Box::new(left), Box::new(self.and()?));
        }
        Ok(left)
    }

    fn and(&mut self) -> DarcResult<Expr> {
        let mut left = self.atom()?;
        while self.peek() == Some("&") {
            self.next();
            left = Expr::And(Box::new(left), Box::new(self.atom()?));
        }
        Ok(left)
    }

    fn atom(&mut self) -> DarcResult<Expr> {
        match self.next() {
            Some("(") => {
                self.depth += 1;
                if self.depth > MAX_DEPTH {
                    return Err(DarcError::Parse(format!("more than {} nested groups", MAX_DEPTH)));
                }
                let inner = self.or()?;
                self.depth -= 1;
                match self.next() {
                    Some(")") => Ok(inner),
                    _ => Err(DarcError::Parse("missing )".into())),
                }
            }
            Some(t) if !matches!(t, "&" | "|" | ")") => Ok(Expr::Id(t.to_string())),
            Some(t) => Err(DarcError::Parse(format!("unexpected {}", t))),
            None => Err(DarcError::Parse("unexpected end".into())),
        }
    }
}

fn eval(expr: &Expr, leaf: &mut dyn FnMut(&str) -> DarcResult<bool>) -> DarcResult<bool> {
    match expr {
        Expr::Id(id) => leaf(id),
        Expr::And(a, b) => Ok(eval(a, leaf)? && eval(b, leaf)?),
        Expr::Or(a, b) => Ok(eval(a, leaf)? || eval(b, leaf)?),
    }
}

/// Evaluates `expression` with `leaf` deciding each identity.
pub fn evaluate(expression: &str, leaf: &mut dyn FnMut(&str) -> DarcResult<bool>) -> DarcResult<bool> {
    let expr = Parser::new(expression).parse()?;
    eval(&expr, leaf)
}

/// Checks that `signers` satisfy the rule for `action` on `darc`.
/// `get_darc` returns the latest version of a darc by base id.
pub fn check_action(
    darc: &Darc,
    action: &str,
    signers: &[Identity],
    get_darc: &dyn Fn(&DarcId) -> Option<Darc>,
) -> DarcResult<()> {
    let expression = darc
        .rules
        .get(action)
        .ok_or_else(|| DarcError::ActionNotFound(action.to_string()))?;
    if satisfied(expression, signers, get_darc, 0, &mut HashMap::new())? {
        Ok(())
    } else {
        Err(DarcError::Unauthorized {
            action: action.to_string(),
        })
    }
}

/// `known` holds the outcome of every darc already decided for these
/// signers, so a darc referenced many times is looked up once.
fn satisfied(
    expression: &str,
    signers: &[Identity],
    get_darc: &dyn Fn(&DarcId) -> Option<Darc>,
    depth: usize,
    known: &mut HashMap<DarcId, bool>,
) -> DarcResult<bool> {
    if depth > MAX_DEPTH {
        return Err(DarcError::RecursionLimit);
    }
    evaluate(expression, &mut |token: &str| {
        let identity: Identity = token.parse()?;
        match identity {
            Identity::Ed25519(_) => Ok(signers.contains(&identity)),
            Identity::Darc(base) => {
                if let Some(&ok) = known.get(&base) {
                    return Ok(ok);
                }
                let ok = match get_darc(&base) {
                    Some(darc) => match darc.rules.get(SIGN_ACTION) {
                        Some(expr) => satisfied(expr, signers, get_darc, depth + 1, known)?,
                        None => false,
                    },
                    None => false,
                };
                known.insert(base, ok);
                Ok(ok)
            }
        }
    })
}
