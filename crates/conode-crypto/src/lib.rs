// CONODE CRYPTO SUITE
// Group arithmetic over Ristretto255 plus the threshold primitives built on it.
//
// SAFETY INVARIANTS:
// 1. All points cross the wire in compressed canonical form
// 2. Identifiers are SHA-256 digests and never change once computed
// 3. Secret scalars are zeroized when their owner drops

pub mod cosi;
pub mod ecies;
pub mod embed;
pub mod schnorr;
pub mod share;

use std::fmt;

use curve25519_dalek::ristretto::CompressedRistretto;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;

pub use curve25519_dalek::ristretto::RistrettoPoint as Point;
pub use curve25519_dalek::scalar::Scalar;

pub use cosi::{bft_threshold, CollectiveSignature, Mask};
pub use schnorr::{KeyPair, SchnorrSignature};
pub use share::{PriPoly, PriShare, PubPoly, PubShare};

// ==================== ERROR TYPES ====================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("invalid point encoding")]
    InvalidPoint,

    #[error("invalid scalar encoding")]
    InvalidScalar,

    #[error("invalid signature")]
    InvalidSignature,

    #[error("collective signature has {participants} participants, need {threshold}")]
    InsufficientParticipants { participants: usize, threshold: usize },

    #[error("mask covers {got} nodes, roster has {expected}")]
    MaskLength { expected: usize, got: usize },

    #[error("not enough shares: got {got}, need {need}")]
    NotEnoughShares { got: usize, need: usize },

    #[error("polynomial degrees differ: {0} vs {1}")]
    DegreeMismatch(usize, usize),

    #[error("data too long to embed: {0} bytes")]
    EmbedTooLong(usize),

    #[error("could not embed data into a point")]
    EmbedFailed,

    #[error("encryption failed")]
    Encryption,

    #[error("decryption failed")]
    Decryption,

    #[error("key derivation failed")]
    KeyDerivation,

    #[error("invalid hex: {0}")]
    Hex(String),
}

pub type CryptoResult<T> = Result<T, CryptoError>;

// ==================== IDENTIFIERS ====================

/// A 32-byte SHA-256 digest used as identifier for blocks, instances,
/// rosters, servers and protocol sessions.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    pub const ZERO: Hash256 = Hash256([0u8; 32]);

    /// SHA-256 of a single buffer.
    pub fn digest(data: &[u8]) -> Self {
        Hash256(Sha256::digest(data).into())
    }

    /// SHA-256 over the concatenation of `parts`.
    pub fn from_parts(parts: &[&[u8]]) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part);
        }
        Hash256(hasher.finalize().into())
    }

    pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::Hex(format!("expected 32 bytes, got {}", bytes.len())))?;
        Ok(Hash256(arr))
    }

    pub fn from_hex(s: &str) -> CryptoResult<Self> {
        let bytes = hex::decode(s).map_err(|e| CryptoError::Hex(e.to_string()))?;
        Self::from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash256({}..)", &self.to_hex()[..12])
    }
}

// ==================== POINT HELPERS ====================

pub fn point_to_bytes(point: &Point) -> [u8; 32] {
    point.compress().to_bytes()
}

pub fn point_from_bytes(bytes: &[u8]) -> CryptoResult<Point> {
    let compressed = CompressedRistretto::from_slice(bytes).map_err(|_| CryptoError::InvalidPoint)?;
    compressed.decompress().ok_or(CryptoError::InvalidPoint)
}

/// Hashes the concatenated parts into a uniformly distributed scalar.
pub fn hash_to_scalar(parts: &[&[u8]]) -> Scalar {
    let mut hasher = Sha512::new();
    for part in parts {
        hasher.update(part);
    }
    Scalar::from_hash(hasher)
}

/// Hashes arbitrary bytes onto the group with unknown discrete log.
pub fn hash_to_point(data: &[u8]) -> Point {
    Point::hash_from_bytes::<Sha512>(data)
}

pub fn random_scalar() -> Scalar {
    Scalar::random(&mut rand::rngs::OsRng)
}

/// Multiplies the standard base point.
pub fn base_mul(scalar: &Scalar) -> Point {
    Point::mul_base(scalar)
}
