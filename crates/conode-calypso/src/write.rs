//! Write and read requests as stored in the ledger, and the client-side
//! decoding of a re-encrypted key.
//!
//! A write holds the key ElGamal-encrypted under the LTS public key X:
//! `U = kG`, `C_i = kX + M_i` with the key embedded in the points `M_i`.
//! It also carries a proof of knowledge of `k`, done over a second base
//! derived from the LTS id and bound to the darc that governs the write,
//! so a write cannot be copied under another darc.

use conode_byzcoin::{DarcId, InstanceId};
use conode_crypto::embed::{embed_all, extract_all};
use conode_crypto::{base_mul, hash_to_point, hash_to_scalar, point_to_bytes, random_scalar, Point, Scalar};
use serde::{Deserialize, Serialize};

use crate::{CalypsoError, CalypsoResult, LtsId};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Write {
    pub lts_id: LtsId,
    pub u: Point,
    pub ubar: Point,
    pub e: Scalar,
    pub f: Scalar,
    pub cs: Vec<Point>,
    /// Free for the writer, e.g. a pointer to the encrypted document
    pub extra_data: Vec<u8>,
}

fn challenge(cs: &[Point], points: [&Point; 4], write_darc: &DarcId) -> Scalar {
    let encoded: Vec<[u8; 32]> = cs.iter().chain(points).map(point_to_bytes).collect();
    let mut parts: Vec<&[u8]> = encoded.iter().map(|p| &p[..]).collect();
    parts.push(write_darc.as_ref());
    hash_to_scalar(&parts)
}

impl Write {
    /// Encrypts `key` for the LTS `lts_id` with public key `x`.
    pub fn new(lts_id: LtsId, write_darc: &DarcId, x: &Point, key: &[u8]) -> CalypsoResult<Self> {
        let k = random_scalar();
        let u = base_mul(&k);
        let shared = x * k;
        let cs: Vec<Point> = embed_all(key)?.into_iter().map(|m| shared + m).collect();

        let gbar = hash_to_point(lts_id.as_ref());
        let ubar = gbar * k;
        let s = random_scalar();
        let w = base_mul(&s);
        let wbar = gbar * s;
        let e = challenge(&cs, [&u, &ubar, &w, &wbar], write_darc);
        Ok(Write {
            lts_id,
            u,
            ubar,
            e,
            f: s + e * k,
            cs,
            extra_data: Vec::new(),
        })
    }

    pub fn with_extra_data(mut self, data: Vec<u8>) -> Self {
        self.extra_data = data;
        self
    }

    /// Checks the proof of knowledge of `k` for the darc `write_darc`.
    pub fn check_proof(&self, write_darc: &DarcId) -> CalypsoResult<()> {
        let gbar = hash_to_point(self.lts_id.as_ref());
        let w = base_mul(&self.f) - self.u * self.e;
        let wbar = gbar * self.f - self.ubar * self.e;
        if challenge(&self.cs, [&self.u, &self.ubar, &w, &wbar], write_darc) != self.e {
            return Err(CalypsoError::InvalidWriteProof);
        }
        Ok(())
    }
}

/// Request of the holder of `xc` to read the write instance `write`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Read {
    pub write: InstanceId,
    pub xc: Point,
}

/// Recovers the key from a re-encryption to `xc`:
/// `XhatEnc - xc·X = kX`, then `M_i = C_i - kX`.
pub fn decode_key(x: &Point, cs: &[Point], xhat_enc: &Point, xc: &Scalar) -> CalypsoResult<Vec<u8>> {
    let xhat = xhat_enc - x * xc;
    let points: Vec<Point> = cs.iter().map(|c| c - xhat).collect();
    Ok(extract_all(&points)?)
}
