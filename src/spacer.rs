use std::fmt;

use crate::error::{Result, config_error};

/// Shape of a (possibly spaced) k-mer and its minimizer window.
///
/// `gaps[i]` is the number of skipped bases between retained bases `i` and
/// `i + 1`, so there are always `k - 1` of them. The span `c` of one k-mer is
/// `k + sum(gaps)`, and the window is never shorter than the span.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Spacer {
    k: usize,
    w: usize,
    span: usize,
    gaps: Vec<u8>,
    offsets: Vec<usize>,
}

impl Spacer {
    pub fn new(k: usize, w: usize, gaps: Vec<u8>) -> Result<Self> {
        if k == 0 {
            return Err(config_error!("k must be at least 1"));
        }
        let gaps = if gaps.is_empty() { vec![0; k - 1] } else { gaps };
        if gaps.len() + 1 != k {
            return Err(config_error!(
                "spacing must have k-1 = {} entries, found {}",
                k - 1,
                gaps.len()
            ));
        }
        let mut offsets = Vec::with_capacity(k);
        let mut offset = 0;
        offsets.push(0);
        for &gap in &gaps {
            offset += gap as usize + 1;
            offsets.push(offset);
        }
        let span = offset + 1;
        Ok(Self {
            k,
            w: w.max(span),
            span,
            gaps,
            offsets,
        })
    }

    pub fn contiguous(k: usize) -> Result<Self> {
        Self::new(k, 0, vec![])
    }

    /// Parse a gap list such as `"0,2,0"` or `"1x3,0"` (`NxM` repeats `N`
    /// `M` times). An empty string means contiguous.
    pub fn parse(k: usize, w: usize, spacing: &str) -> Result<Self> {
        let spacing = spacing.trim();
        if spacing.is_empty() {
            return Self::new(k, w, vec![]);
        }
        let mut gaps = vec![];
        for field in spacing.split(',') {
            let field = field.trim();
            let (gap, times) = match field.split_once('x') {
                Some((gap, times)) => (gap, times),
                None => (field, "1"),
            };
            let gap: u8 = gap
                .parse()
                .map_err(|_| config_error!("invalid gap {gap:?} in spacing {spacing:?}"))?;
            let times: usize = times
                .parse()
                .map_err(|_| config_error!("invalid repeat {times:?} in spacing {spacing:?}"))?;
            gaps.extend(std::iter::repeat_n(gap, times));
        }
        Self::new(k, w, gaps)
    }

    pub fn k(&self) -> usize {
        self.k
    }

    /// Window length in bases; at least [`Self::span`].
    pub fn w(&self) -> usize {
        self.w
    }

    pub fn span(&self) -> usize {
        self.span
    }

    pub fn gaps(&self) -> &[u8] {
        &self.gaps
    }

    /// Position of each retained base relative to the k-mer start.
    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    pub fn is_contiguous(&self) -> bool {
        self.span == self.k
    }

    pub fn is_windowed(&self) -> bool {
        self.w > self.span
    }

    /// Number of consecutive k-mer positions in one window.
    pub fn window_kmers(&self) -> usize {
        self.w - self.span + 1
    }

    /// Whether the comb reads the same in both directions, which is what
    /// makes reverse complements of spaced k-mers well defined.
    pub fn is_palindromic(&self) -> bool {
        self.gaps.iter().eq(self.gaps.iter().rev())
    }

    /// Render a packed 2-bit DNA k-mer, writing `-` for skipped bases.
    pub fn kmer_to_string(&self, kmer: u64) -> String {
        const BASES: &[u8; 4] = b"ACGT";
        let mut out = String::with_capacity(self.span);
        for i in 0..self.k {
            if i > 0 {
                for _ in 0..self.gaps[i - 1] {
                    out.push('-');
                }
            }
            let shift = 2 * (self.k - 1 - i);
            out.push(BASES[((kmer >> shift) & 3) as usize] as char);
        }
        out
    }
}

impl fmt::Display for Spacer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "k={} w={} gaps=", self.k, self.w)?;
        for (i, gap) in self.gaps.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{gap}")?;
        }
        Ok(())
    }
}
