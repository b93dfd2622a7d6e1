//! Exact comparisons of sorted id lists, the all-pairs distance matrix, and
//! pairwise tree reduction.
//!
//! ## Distance matrix format
//! An 8-byte little-endian `n`, followed by `n(n-1)/2` little-endian `f32`
//! values in row-major upper-triangular order: pair `(i, j)` with `i < j` is
//! stored at [`tri_index`]`(i, j, n)`.

use std::{
    fs::File,
    io::{BufReader, BufWriter, ErrorKind, Read, Write},
    path::Path,
};

use log::debug;
use rayon::prelude::*;

use crate::error::{Error, Result, format_error};

/// Size of the intersection of two sorted, duplicate-free slices.
pub fn intersection_size(a: &[u64], b: &[u64]) -> usize {
    let mut intersection_size = 0;
    let mut i = 0;
    let mut j = 0;
    while i < a.len() && j < b.len() {
        intersection_size += (a[i] == b[j]) as usize;
        let di = (a[i] <= b[j]) as usize;
        let dj = (a[i] >= b[j]) as usize;
        i += di;
        j += dj;
    }
    intersection_size
}

pub fn union_size_sorted(a: &[u64], b: &[u64]) -> usize {
    a.len() + b.len() - intersection_size(a, b)
}

/// Exact Jaccard index; 0 for two empty sets.
pub fn jaccard_sorted(a: &[u64], b: &[u64]) -> f64 {
    let intersection = intersection_size(a, b);
    let union = a.len() + b.len() - intersection;
    if union == 0 {
        return 0.0;
    }
    intersection as f64 / union as f64
}

/// Fraction of `a` contained in `b`.
pub fn containment_sorted(a: &[u64], b: &[u64]) -> f64 {
    if a.is_empty() {
        return 0.0;
    }
    intersection_size(a, b) as f64 / a.len() as f64
}

/// Mash distance `-ln(2j / (1 + j)) / k`. Infinite for disjoint sets.
pub fn mash_distance(j: f64, k: usize) -> f64 {
    debug_assert!(j >= 0.0, "Jaccard similarity {j} should not be negative");
    // See eq. 4 of mash paper.
    let mash_dist = -(2. * j / (1. + j)).ln() / k as f64;
    // Distance 0 is computed as -log(1) and becomes -0.0.
    mash_dist.max(0.0)
}

/// Number of unordered pairs among `n` items.
pub fn tri_len(n: usize) -> usize {
    n * n.saturating_sub(1) / 2
}

/// Position of pair `(i, j)`, `i < j < n`, in the upper triangle.
#[inline(always)]
pub fn tri_index(i: usize, j: usize, n: usize) -> usize {
    debug_assert!(i < j && j < n, "bad pair ({i}, {j}) for n = {n}");
    i * (2 * n - i - 1) / 2 + j - (i + 1)
}

/// Inverse of [`tri_index`].
pub fn tri_coords(mut idx: usize, n: usize) -> (usize, usize) {
    debug_assert!(idx < tri_len(n));
    let mut i = 0;
    while idx >= n - 1 - i {
        idx -= n - 1 - i;
        i += 1;
    }
    (i, i + 1 + idx)
}

/// Pairwise statistic stored in a [`DistanceMatrix`].
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum Statistic {
    /// `|A ∪ B|`.
    #[default]
    UnionSize,
    Jaccard,
    /// `|A Δ B|`.
    SymmetricDifference,
    /// Mash distance for k-mers of the given length.
    MashDistance(usize),
}

impl Statistic {
    pub fn compute(self, a: &[u64], b: &[u64]) -> f32 {
        match self {
            Statistic::UnionSize => union_size_sorted(a, b) as f32,
            Statistic::Jaccard => jaccard_sorted(a, b) as f32,
            Statistic::SymmetricDifference => {
                let intersection = intersection_size(a, b);
                (a.len() + b.len() - 2 * intersection) as f32
            }
            Statistic::MashDistance(k) => mash_distance(jaccard_sorted(a, b), k) as f32,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DistanceMatrix {
    n: usize,
    values: Vec<f32>,
}

impl DistanceMatrix {
    pub fn new(n: usize, values: Vec<f32>) -> Result<Self> {
        if values.len() != tri_len(n) {
            return Err(format_error!(
                "{} values do not form a triangle over {n} sets",
                values.len()
            ));
        }
        Ok(Self { n, values })
    }

    /// All pairs of `sets` (each sorted and duplicate-free).
    ///
    /// Rows are filled one after another; the pairs within a row run in
    /// parallel, each writing its own slot.
    pub fn compute<S: AsRef<[u64]> + Sync>(sets: &[S], statistic: Statistic) -> Self {
        let n = sets.len();
        let mut values = vec![0f32; tri_len(n)];
        let mut rest = values.as_mut_slice();
        for (i, a) in sets.iter().enumerate() {
            let (row, tail) = std::mem::take(&mut rest).split_at_mut(n - 1 - i);
            rest = tail;
            let a = a.as_ref();
            row.par_iter_mut().enumerate().for_each(|(offset, out)| {
                *out = statistic.compute(a, sets[i + 1 + offset].as_ref());
            });
        }
        debug!("Computed {} pairs of {statistic:?} over {n} sets", tri_len(n));
        Self { n, values }
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Value for an unordered pair; `None` on the diagonal or out of range.
    pub fn get(&self, i: usize, j: usize) -> Option<f32> {
        let (i, j) = (i.min(j), i.max(j));
        if i == j || j >= self.n {
            return None;
        }
        Some(self.values[tri_index(i, j, self.n)])
    }

    pub fn write<W: Write>(&self, out: &mut W) -> Result<()> {
        out.write_all(&(self.n as u64).to_le_bytes())?;
        for v in &self.values {
            out.write_all(&v.to_le_bytes())?;
        }
        Ok(())
    }

    pub fn read<R: Read>(input: &mut R) -> Result<Self> {
        let mut word = [0u8; 8];
        read_exact_or_truncated(input, &mut word, "distance matrix header")?;
        let n = u64::from_le_bytes(word);
        let len = usize::try_from(n)
            .ok()
            .and_then(|n| n.checked_mul(n.saturating_sub(1)))
            .map(|x| x / 2)
            .ok_or_else(|| format_error!("distance matrix over {n} sets is too large"))?;
        let mut values = Vec::with_capacity(len.min(1 << 24));
        let mut float = [0u8; 4];
        for _ in 0..len {
            read_exact_or_truncated(input, &mut float, "distance matrix values")?;
            values.push(f32::from_le_bytes(float));
        }
        if input.read(&mut float)? != 0 {
            return Err(format_error!("trailing bytes after distance matrix"));
        }
        Ok(Self {
            n: n as usize,
            values,
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        self.write(&mut out)?;
        out.flush()?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::read(&mut BufReader::new(File::open(path)?))
    }
}

/// `read_exact`, reporting a short read as a format error.
pub(crate) fn read_exact_or_truncated<R: Read>(
    input: &mut R,
    buf: &mut [u8],
    what: &str,
) -> Result<()> {
    input.read_exact(buf).map_err(|err| match err.kind() {
        ErrorKind::UnexpectedEof => format_error!("truncated {what}"),
        _ => Error::Io(err),
    })
}

/// Pairwise tree reduction: round `r` combines `items[i]` with
/// `items[i + 2^r]` for every `i` divisible by `2^(r+1)`, in parallel.
/// The result ends up in `items[0]`.
pub fn par_reduce<T, F>(items: &mut [T], combine: F) -> Result<()>
where
    T: Send,
    F: Fn(&mut T, &T) -> Result<()> + Sync,
{
    let mut stride = 1;
    while stride < items.len() {
        items.par_chunks_mut(2 * stride).try_for_each(|chunk| {
            if chunk.len() > stride {
                let (left, right) = chunk.split_at_mut(stride);
                combine(&mut left[0], &right[0])?;
            }
            Ok::<_, Error>(())
        })?;
        stride *= 2;
    }
    Ok(())
}
