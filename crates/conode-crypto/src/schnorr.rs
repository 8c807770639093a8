//! Schnorr signatures and node key pairs over Ristretto255.

use std::fmt;

use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::{base_mul, hash_to_scalar, point_to_bytes, random_scalar, CryptoError, CryptoResult, Point, Scalar};

/// Signature `(R, s)` with `s = k + H(R || P || msg) * x`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchnorrSignature {
    pub r: Point,
    pub s: Scalar,
}

fn challenge(r: &Point, public: &Point, msg: &[u8]) -> Scalar {
    hash_to_scalar(&[&point_to_bytes(r), &point_to_bytes(public), msg])
}

pub fn sign(secret: &Scalar, msg: &[u8]) -> SchnorrSignature {
    let public = base_mul(secret);
    let mut k = random_scalar();
    let r = base_mul(&k);
    let c = challenge(&r, &public, msg);
    let s = k + c * secret;
    k.zeroize();
    SchnorrSignature { r, s }
}

pub fn verify(public: &Point, msg: &[u8], sig: &SchnorrSignature) -> CryptoResult<()> {
    let c = challenge(&sig.r, public, msg);
    if base_mul(&sig.s) == sig.r + c * public {
        Ok(())
    } else {
        Err(CryptoError::InvalidSignature)
    }
}

/// Long-term key pair of a node. The secret is wiped on drop.
#[derive(Clone, Serialize, Deserialize)]
pub struct KeyPair {
    secret: Scalar,
    public: Point,
}

impl KeyPair {
    pub fn generate() -> Self {
        Self::from_secret(random_scalar())
    }

    pub fn from_secret(secret: Scalar) -> Self {
        let public = base_mul(&secret);
        KeyPair { secret, public }
    }

    pub fn public(&self) -> Point {
        self.public
    }

    pub fn secret(&self) -> &Scalar {
        &self.secret
    }

    pub fn sign(&self, msg: &[u8]) -> SchnorrSignature {
        sign(&self.secret, msg)
    }
}

impl Drop for KeyPair {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &hex::encode(point_to_bytes(&self.public)))
            .finish_non_exhaustive()
    }
}
