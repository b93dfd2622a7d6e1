use itertools::Itertools;

use crate::{
    MergeSketch,
    error::{Result, config_error, format_error},
    hash::mix64,
};

/// A sketch containing the `k` smallest distinct mixed hashes, in increasing order.
#[derive(bincode::Encode, bincode::Decode, Clone, Debug, Eq, PartialEq, mem_dbg::MemSize)]
pub struct BottomK {
    k: usize,
    values: Vec<u64>,
}

impl BottomK {
    pub fn new(k: usize) -> Result<Self> {
        if k == 0 {
            return Err(config_error!("bottom-k sketch needs k > 0"));
        }
        Ok(Self {
            k,
            values: Vec::with_capacity(k),
        })
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn values(&self) -> &[u64] {
        &self.values
    }

    pub fn is_full(&self) -> bool {
        self.values.len() == self.k
    }

    fn estimate(k: usize, values: &[u64]) -> f64 {
        if values.len() < k {
            return values.len() as f64;
        }
        let max = *values.last().unwrap_or(&u64::MAX) as f64 / 2f64.powi(64);
        if max == 0.0 {
            return values.len() as f64;
        }
        k as f64 / max
    }

    fn check(&self, other: &Self) -> Result<()> {
        if !self.is_compatible(other) {
            return Err(config_error!(
                "bottom-k size mismatch: {} vs {}",
                self.k,
                other.k
            ));
        }
        Ok(())
    }

    /// Estimate of `|A ∪ B|` from the `k` smallest values of the union.
    pub fn union_cardinality(&self, other: &Self) -> Result<f64> {
        self.check(other)?;
        let union = self
            .values
            .iter()
            .merge(&other.values)
            .dedup()
            .take(self.k)
            .copied()
            .collect_vec();
        Ok(Self::estimate(self.k, &union))
    }

    /// Fraction of the `k` smallest values of the union present in both sketches.
    pub fn jaccard(&self, other: &Self) -> Result<f64> {
        self.check(other)?;
        let a = &self.values;
        let b = &other.values;
        let mut intersection_size = 0;
        let mut union_size = 0;
        let mut i = 0;
        let mut j = 0;
        while union_size < self.k && (i < a.len() || j < b.len()) {
            match (a.get(i), b.get(j)) {
                (Some(x), Some(y)) => {
                    intersection_size += (x == y) as usize;
                    i += (x <= y) as usize;
                    j += (x >= y) as usize;
                }
                (Some(_), None) => i += 1,
                _ => j += 1,
            }
            union_size += 1;
        }
        if union_size == 0 {
            return Ok(0.0);
        }
        Ok(intersection_size as f64 / union_size as f64)
    }

    /// Estimated fraction of this set contained in `other`.
    pub fn containment(&self, other: &Self) -> Result<f64> {
        let j = self.jaccard(other)?;
        let card = self.cardinality();
        if card == 0.0 {
            return Ok(0.0);
        }
        Ok((j * self.union_cardinality(other)? / card).min(1.0))
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.k == 0 {
            return Err(format_error!("bottom-k sketch with k = 0"));
        }
        if self.values.len() > self.k {
            return Err(format_error!(
                "bottom-k sketch holds {} values for k = {}",
                self.values.len(),
                self.k
            ));
        }
        if !self.values.is_sorted_by(|a, b| a < b) {
            return Err(format_error!("bottom-k values are not strictly increasing"));
        }
        Ok(())
    }
}

impl MergeSketch for BottomK {
    #[inline]
    fn update(&mut self, value: u64) {
        let h = mix64(value);
        if self.is_full() && self.values.last().is_some_and(|&max| h >= max) {
            return;
        }
        if let Err(pos) = self.values.binary_search(&h) {
            if self.is_full() {
                self.values.pop();
            }
            self.values.insert(pos, h);
        }
    }

    fn merge(&mut self, other: &Self) -> Result<()> {
        self.check(other)?;
        self.values = self
            .values
            .iter()
            .merge(&other.values)
            .dedup()
            .take(self.k)
            .copied()
            .collect();
        Ok(())
    }

    fn cardinality(&self) -> f64 {
        Self::estimate(self.k, &self.values)
    }

    fn clear(&mut self) {
        self.values.clear();
    }

    fn is_compatible(&self, other: &Self) -> bool {
        self.k == other.k
    }
}
