//! Shamir secret sharing over the Ristretto scalar field.
//!
//! Share `i` is the polynomial evaluated at `x = i + 1`, so index 0 never
//! exposes the constant term. Public polynomials hold the commitments
//! `a_k * G` and let anyone check a private share or derive a public one.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::{base_mul, random_scalar, CryptoError, CryptoResult, Point, Scalar};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriShare {
    pub index: u32,
    pub value: Scalar,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubShare {
    pub index: u32,
    pub value: Point,
}

fn x_of(index: u32) -> Scalar {
    Scalar::from(u64::from(index) + 1)
}

// ==================== PRIVATE POLYNOMIAL ====================

/// Secret polynomial of degree `threshold - 1`.
pub struct PriPoly {
    coeffs: Vec<Scalar>,
}

impl PriPoly {
    /// Random polynomial; `secret` fixes the constant term when given.
    pub fn random(threshold: usize, secret: Option<Scalar>) -> Self {
        let threshold = threshold.max(1);
        let mut coeffs: Vec<Scalar> = (0..threshold).map(|_| random_scalar()).collect();
        if let Some(s) = secret {
            coeffs[0] = s;
        }
        PriPoly { coeffs }
    }

    pub fn threshold(&self) -> usize {
        self.coeffs.len()
    }

    pub fn secret(&self) -> Scalar {
        self.coeffs[0]
    }

    pub fn eval(&self, index: u32) -> PriShare {
        let x = x_of(index);
        let value = self
            .coeffs
            .iter()
            .rev()
            .fold(Scalar::ZERO, |acc, c| acc * x + c);
        PriShare { index, value }
    }

    pub fn shares(&self, n: usize) -> Vec<PriShare> {
        (0..n as u32).map(|i| self.eval(i)).collect()
    }

    pub fn commit(&self) -> PubPoly {
        PubPoly::new(self.coeffs.iter().map(base_mul).collect())
    }
}

impl Drop for PriPoly {
    fn drop(&mut self) {
        for c in self.coeffs.iter_mut() {
            c.zeroize();
        }
    }
}

// ==================== PUBLIC POLYNOMIAL ====================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubPoly {
    commits: Vec<Point>,
}

impl PubPoly {
    pub fn new(commits: Vec<Point>) -> Self {
        PubPoly { commits }
    }

    pub fn commits(&self) -> &[Point] {
        &self.commits
    }

    pub fn threshold(&self) -> usize {
        self.commits.len()
    }

    /// The committed secret `a_0 * G`.
    pub fn public(&self) -> Point {
        self.commits.first().copied().unwrap_or_default()
    }

    pub fn eval(&self, index: u32) -> PubShare {
        let x = x_of(index);
        let value = self
            .commits
            .iter()
            .rev()
            .fold(Point::default(), |acc, c| acc * x + c);
        PubShare { index, value }
    }

    /// True when `share` lies on the committed polynomial.
    pub fn check(&self, share: &PriShare) -> bool {
        self.eval(share.index).value == base_mul(&share.value)
    }

    /// Coefficient-wise sum of two commitments of the same degree.
    pub fn add(&self, other: &PubPoly) -> CryptoResult<PubPoly> {
        if self.commits.len() != other.commits.len() {
            return Err(CryptoError::DegreeMismatch(self.commits.len(), other.commits.len()));
        }
        Ok(PubPoly::new(
            self.commits.iter().zip(&other.commits).map(|(a, b)| a + b).collect(),
        ))
    }
}

// ==================== RECONSTRUCTION ====================

/// Lagrange basis polynomial for `index` over `indices`, evaluated at zero.
pub fn lagrange_coefficient(index: u32, indices: &[u32]) -> Scalar {
    let xi = x_of(index);
    let mut num = Scalar::ONE;
    let mut den = Scalar::ONE;
    for &j in indices {
        if j == index {
            continue;
        }
        let xj = x_of(j);
        num *= xj;
        den *= xj - xi;
    }
    num * den.invert()
}

fn distinct_indices(indices: impl Iterator<Item = u32>, threshold: usize) -> CryptoResult<Vec<u32>> {
    let set: BTreeSet<u32> = indices.collect();
    if set.len() < threshold {
        return Err(CryptoError::NotEnoughShares {
            got: set.len(),
            need: threshold,
        });
    }
    Ok(set.into_iter().take(threshold).collect())
}

/// Interpolates the secret from any `threshold` distinct private shares.
pub fn recover_secret(shares: &[PriShare], threshold: usize) -> CryptoResult<Scalar> {
    let indices = distinct_indices(shares.iter().map(|s| s.index), threshold)?;
    let mut acc = Scalar::ZERO;
    for &i in &indices {
        let share = shares
            .iter()
            .find(|s| s.index == i)
            .ok_or(CryptoError::NotEnoughShares { got: 0, need: threshold })?;
        acc += lagrange_coefficient(i, &indices) * share.value;
    }
    Ok(acc)
}

/// Interpolates the committed value `s * P` from public shares `s_i * P`.
pub fn recover_commit(shares: &[PubShare], threshold: usize) -> CryptoResult<Point> {
    let indices = distinct_indices(shares.iter().map(|s| s.index), threshold)?;
    let mut acc = Point::default();
    for &i in &indices {
        let share = shares
            .iter()
            .find(|s| s.index == i)
            .ok_or(CryptoError::NotEnoughShares { got: 0, need: threshold })?;
        acc += share.value * lagrange_coefficient(i, &indices);
    }
    Ok(acc)
}
