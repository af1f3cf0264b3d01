//! Banded LSH over MinHash signatures.
//!
//! A signature of `bands * rows` values is cut into `bands` slices; two
//! records are bucket-mates in a band when their slices are identical. The
//! candidate set of a query is every id sharing at least one bucket with it.

use std::collections::{BTreeSet, HashMap};

use crate::minhash::Signature;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IndexError {
    #[error("bands and rows must both be greater than zero")]
    ZeroBand,
    #[error("cannot split {num_perm} permutations into bands for threshold {threshold}")]
    NoFactorisation { num_perm: usize, threshold: String },
    #[error("signature has {got} values, index expects {expected}")]
    SignatureLength { expected: usize, got: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LshParams {
    pub bands: usize,
    pub rows: usize,
}

impl LshParams {
    pub fn new(bands: usize, rows: usize) -> Result<Self, IndexError> {
        if bands == 0 || rows == 0 {
            return Err(IndexError::ZeroBand);
        }
        Ok(Self { bands, rows })
    }

    /// Pick the `(bands, rows)` split of `num_perm` whose S-curve threshold
    /// `(1/b)^(1/r)` is closest to `threshold`.
    pub fn for_threshold(num_perm: usize, threshold: f64) -> Result<Self, IndexError> {
        let mut best: Option<(f64, LshParams)> = None;
        for rows in 1..=num_perm {
            if num_perm % rows != 0 {
                continue;
            }
            let p = LshParams { bands: num_perm / rows, rows };
            let gap = (p.threshold() - threshold).abs();
            if best.map_or(true, |(g, _)| gap < g) {
                best = Some((gap, p));
            }
        }
        best.map(|(_, p)| p).ok_or(IndexError::NoFactorisation {
            num_perm,
            threshold: threshold.to_string(),
        })
    }

    pub fn num_perm(&self) -> usize {
        self.bands * self.rows
    }

    /// Jaccard similarity at which a pair becomes a candidate with probability ~1/2.
    pub fn threshold(&self) -> f64 {
        (1.0 / self.bands as f64).powf(1.0 / self.rows as f64)
    }

    /// Probability that a pair with Jaccard similarity `s` shares at least one bucket.
    pub fn candidate_probability(&self, s: f64) -> f64 {
        1.0 - (1.0 - s.powi(self.rows as i32)).powi(self.bands as i32)
    }
}

pub struct LshIndex {
    params: LshParams,
    buckets: Vec<HashMap<Box<[u64]>, Vec<i64>>>,
    len: usize,
}

impl LshIndex {
    pub fn new(params: LshParams) -> Self {
        Self { params, buckets: vec![HashMap::new(); params.bands], len: 0 }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn insert(&mut self, id: i64, sig: &Signature) -> Result<(), IndexError> {
        self.check_len(sig)?;
        for (band, key) in sig.chunks(self.params.rows).enumerate() {
            self.buckets[band].entry(key.into()).or_default().push(id);
        }
        self.len += 1;
        Ok(())
    }

    /// Ids sharing at least one band bucket with `sig`. Includes the id the
    /// signature was inserted under, if any.
    pub fn query(&self, sig: &Signature) -> Result<BTreeSet<i64>, IndexError> {
        self.check_len(sig)?;
        let mut out = BTreeSet::new();
        for (band, key) in sig.chunks(self.params.rows).enumerate() {
            if let Some(ids) = self.buckets[band].get(key) {
                out.extend(ids.iter().copied());
            }
        }
        Ok(out)
    }

    fn check_len(&self, sig: &Signature) -> Result<(), IndexError> {
        if sig.len() != self.params.num_perm() {
            return Err(IndexError::SignatureLength { expected: self.params.num_perm(), got: sig.len() });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::Fingerprint;
    use crate::minhash::MinHasher;

    #[test]
    fn rejects_zero_bands() {
        assert_eq!(LshParams::new(0, 4), Err(IndexError::ZeroBand));
        assert_eq!(LshParams::new(4, 0), Err(IndexError::ZeroBand));
    }

    #[test]
    fn threshold_picks_a_factorisation() {
        let p = LshParams::for_threshold(128, 0.5).unwrap();
        assert_eq!(p.num_perm(), 128);
        assert!((p.threshold() - 0.5).abs() < 0.15, "{p:?} -> {}", p.threshold());

        let strict = LshParams::for_threshold(128, 0.9).unwrap();
        let loose = LshParams::for_threshold(128, 0.2).unwrap();
        assert!(strict.rows > loose.rows);
    }

    #[test]
    fn candidate_probability_is_s_curve() {
        let p = LshParams::new(32, 4).unwrap();
        assert!(p.candidate_probability(0.9) > 0.99);
        assert!(p.candidate_probability(0.1) < 0.01);
        assert_eq!(p.candidate_probability(1.0), 1.0);
    }

    #[test]
    fn wrong_signature_length() {
        let mut idx = LshIndex::new(LshParams::new(4, 4).unwrap());
        let err = idx.insert(1, &vec![0; 15]).unwrap_err();
        assert_eq!(err, IndexError::SignatureLength { expected: 16, got: 15 });
        assert!(idx.query(&vec![0; 17]).is_err());
    }

    #[test]
    fn identical_signatures_are_candidates() {
        let mh = MinHasher::new(128, 42);
        let mut idx = LshIndex::new(LshParams::new(32, 4).unwrap());
        let a = mh.signature(&Fingerprint(0xaaaa_5555_aaaa_5555));
        let far = mh.signature(&Fingerprint(0x5555_aaaa_5555_aaaa));
        idx.insert(1, &a).unwrap();
        idx.insert(2, &a).unwrap();
        idx.insert(3, &far).unwrap();
        assert_eq!(idx.len(), 3);

        let got = idx.query(&a).unwrap();
        assert!(got.contains(&1) && got.contains(&2));
        assert!(!got.contains(&3));
    }

    #[test]
    fn one_bit_flip_stays_candidate() {
        let mh = MinHasher::new(128, 42);
        let mut idx = LshIndex::new(LshParams::new(32, 4).unwrap());
        let base = 0xf0f0_f0f0_ff00_ff00u64;
        idx.insert(10, &mh.signature(&Fingerprint(base))).unwrap();
        // Jaccard 31/32 with 32x4 bands: miss probability is negligible
        let got = idx.query(&mh.signature(&Fingerprint(base ^ (1 << 8)))).unwrap();
        assert!(got.contains(&10));
    }
}
