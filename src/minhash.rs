//! MinHash signatures over the set-bit positions of a [`Fingerprint`].
//!
//! Each permutation is a universal hash `(a*x + b) mod p` with `p = 2^61 - 1`.
//! Coefficients come from a seeded RNG so two runs with the same seed produce
//! identical signatures.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::fingerprint::Fingerprint;

const MERSENNE_61: u64 = (1 << 61) - 1;

pub type Signature = Vec<u64>;

pub struct MinHasher {
    coeffs: Vec<(u64, u64)>,
}

impl MinHasher {
    pub fn new(num_perm: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let coeffs = (0..num_perm)
            .map(|_| (rng.random_range(1..MERSENNE_61), rng.random_range(0..MERSENNE_61)))
            .collect();
        Self { coeffs }
    }

    /// An empty feature set (all-zero fingerprint) maps to all `u64::MAX`.
    pub fn signature(&self, fp: &Fingerprint) -> Signature {
        let mut sig = vec![u64::MAX; self.coeffs.len()];
        for bit in fp.set_bits() {
            // shift so feature 0 does not hash to `b` for every permutation
            let x = bit as u64 + 1;
            for (slot, &(a, b)) in sig.iter_mut().zip(&self.coeffs) {
                let h = ((a as u128 * x as u128 + b as u128) % MERSENNE_61 as u128) as u64;
                if h < *slot {
                    *slot = h;
                }
            }
        }
        sig
    }
}

/// Fraction of equal slots; estimates Jaccard similarity of the bit sets.
#[cfg(test)]
pub fn estimate_jaccard(a: &Signature, b: &Signature) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let same = a.iter().zip(b).filter(|(x, y)| x == y).count();
    same as f64 / a.len() as f64
}
