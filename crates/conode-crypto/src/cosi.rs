// COLLECTIVE SIGNATURES
// Schnorr multi-signatures aggregated along a tree of signers.
//
// A participant i contributes V_i = v_i * G and r_i = v_i + c * x_i where
// c = H(V || X || msg), V the aggregate commitment and X the aggregate public
// key of the participants. The resulting (V, r, mask) verifies as a plain
// Schnorr signature under X, which is rebuilt from the roster and the mask.
//
// SAFETY INVARIANTS:
// 1. The mask decides which public keys enter X, never the signer's claim
// 2. Verification fails when fewer than `threshold` bits are set

use serde::{Deserialize, Serialize};

use crate::{base_mul, hash_to_scalar, point_to_bytes, CryptoError, CryptoResult, Point, Scalar};

/// Byzantine quorum for a roster of `n` nodes: `n - (n - 1) / 3`.
pub fn bft_threshold(n: usize) -> usize {
    if n == 0 {
        return 0;
    }
    n - (n - 1) / 3
}

/// Participation bit-set over roster positions.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mask {
    len: usize,
    bits: Vec<u8>,
}

impl Mask {
    pub fn new(len: usize) -> Self {
        Mask {
            len,
            bits: vec![0u8; (len + 7) / 8],
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn set(&mut self, index: usize, enabled: bool) {
        if index >= self.len {
            return;
        }
        if enabled {
            self.bits[index / 8] |= 1 << (index % 8);
        } else {
            self.bits[index / 8] &= !(1 << (index % 8));
        }
    }

    pub fn is_set(&self, index: usize) -> bool {
        index < self.len && self.bits[index / 8] & (1 << (index % 8)) != 0
    }

    /// Sets every bit that is set in `other`.
    pub fn merge(&mut self, other: &Mask) {
        for (i, byte) in other.bits.iter().enumerate() {
            if let Some(mine) = self.bits.get_mut(i) {
                *mine |= byte;
            }
        }
    }

    pub fn count_enabled(&self) -> usize {
        (0..self.len).filter(|&i| self.is_set(i)).count()
    }

    pub fn enabled(&self) -> Vec<usize> {
        (0..self.len).filter(|&i| self.is_set(i)).collect()
    }

    pub fn disabled(&self) -> Vec<usize> {
        (0..self.len).filter(|&i| !self.is_set(i)).collect()
    }
}

/// Challenge binding the aggregate commitment, aggregate key and message.
pub fn challenge(commitment: &Point, aggregate: &Point, msg: &[u8]) -> Scalar {
    hash_to_scalar(&[&point_to_bytes(commitment), &point_to_bytes(aggregate), msg])
}

/// Sum of the public keys selected by `mask`.
pub fn aggregate_public(publics: &[Point], mask: &Mask) -> Point {
    mask.enabled()
        .into_iter()
        .filter_map(|i| publics.get(i))
        .sum()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectiveSignature {
    pub commitment: Point,
    pub response: Scalar,
    pub mask: Mask,
}

impl CollectiveSignature {
    pub fn participants(&self) -> usize {
        self.mask.count_enabled()
    }

    /// Roster positions that did not take part.
    pub fn exceptions(&self) -> Vec<usize> {
        self.mask.disabled()
    }

    pub fn verify(&self, publics: &[Point], msg: &[u8], threshold: usize) -> CryptoResult<()> {
        if self.mask.len() != publics.len() {
            return Err(CryptoError::MaskLength {
                expected: publics.len(),
                got: self.mask.len(),
            });
        }
        let participants = self.participants();
        if participants < threshold {
            return Err(CryptoError::InsufficientParticipants {
                participants,
                threshold,
            });
        }
        let aggregate = aggregate_public(publics, &self.mask);
        let c = challenge(&self.commitment, &aggregate, msg);
        if base_mul(&self.response) == self.commitment + c * aggregate {
            Ok(())
        } else {
            Err(CryptoError::InvalidSignature)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{random_scalar, KeyPair};

    fn sign_with(keys: &[KeyPair], active: &[usize], msg: &[u8]) -> CollectiveSignature {
        let publics: Vec<Point> = keys.iter().map(|k| k.public()).collect();
        let mut mask = Mask::new(keys.len());
        let nonces: Vec<Scalar> = active.iter().map(|_| random_scalar()).collect();
        let mut commitment = Point::default();
        for (slot, &i) in active.iter().enumerate() {
            mask.set(i, true);
            commitment += base_mul(&nonces[slot]);
        }
        let c = challenge(&commitment, &aggregate_public(&publics, &mask), msg);
        let response = active
            .iter()
            .enumerate()
            .map(|(slot, &i)| nonces[slot] + c * keys[i].secret())
            .sum();
        CollectiveSignature {
            commitment,
            response,
            mask,
        }
    }

    #[test]
    fn test_bft_threshold() {
        assert_eq!(bft_threshold(1), 1);
        assert_eq!(bft_threshold(4), 3);
        assert_eq!(bft_threshold(7), 5);
        assert_eq!(bft_threshold(10), 7);
    }

    #[test]
    fn test_mask_bits() {
        let mut mask = Mask::new(10);
        mask.set(0, true);
        mask.set(9, true);
        assert_eq!(mask.enabled(), vec![0, 9]);
        mask.set(0, false);
        assert_eq!(mask.count_enabled(), 1);
        let mut other = Mask::new(10);
        other.set(3, true);
        mask.merge(&other);
        assert_eq!(mask.enabled(), vec![3, 9]);
    }

    #[test]
    fn test_signature_with_exceptions() {
        let keys: Vec<KeyPair> = (0..4).map(|_| KeyPair::generate()).collect();
        let publics: Vec<Point> = keys.iter().map(|k| k.public()).collect();
        let sig = sign_with(&keys, &[0, 1, 3], b"link");
        assert!(sig.verify(&publics, b"link", 3).is_ok());
        assert_eq!(sig.exceptions(), vec![2]);
        assert_eq!(
            sig.verify(&publics, b"link", 4),
            Err(CryptoError::InsufficientParticipants {
                participants: 3,
                threshold: 4
            })
        );
        assert_eq!(sig.verify(&publics, b"other", 3), Err(CryptoError::InvalidSignature));
    }

    #[test]
    fn test_forged_mask_fails() {
        let keys: Vec<KeyPair> = (0..4).map(|_| KeyPair::generate()).collect();
        let publics: Vec<Point> = keys.iter().map(|k| k.public()).collect();
        let mut sig = sign_with(&keys, &[0, 1, 2], b"link");
        sig.mask.set(3, true);
        assert_eq!(sig.verify(&publics, b"link", 3), Err(CryptoError::InvalidSignature));
    }
}
