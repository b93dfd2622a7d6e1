//! Rolling hashes over a sliding window, O(1) per base for any k.
//!
//! Two families are supported:
//! - [`RollingKind::Cyclic`]: cyclic polynomial (buzhash),
//!   `H = xor_j rotl(T[s_j], k-1-j)`.
//! - [`RollingKind::RabinKarp`]: multiplicative, `H = sum_j T[s_j] B^(k-1-j)`
//!   modulo 2^64 with an odd base `B`.
//!
//! In canonical mode the hash of the reverse complement is rolled alongside
//! and the smaller of the two is emitted, so both strands give the same
//! stream (reversed).

use crate::{
    alphabet::{Alphabet, INVALID},
    error::{Result, config_error},
    hash::HashContext,
    window::{MAX_WINDOW, MinimizerWindow},
};

#[derive(clap::ValueEnum, Clone, Copy, Debug, Eq, PartialEq)]
pub enum RollingKind {
    Cyclic,
    RabinKarp,
}

#[derive(Clone, Copy, Debug)]
struct RollState {
    fwd: u64,
    rev: u64,
    filled: usize,
    /// `B^filled`, used while filling the reverse strand.
    pow: u64,
}

impl RollState {
    fn new() -> Self {
        Self {
            fwd: 0,
            rev: 0,
            filled: 0,
            pow: 1,
        }
    }
}

/// Multiplicative inverse of an odd `x` modulo 2^64 (Newton iteration).
fn inverse_mod_2_64(x: u64) -> u64 {
    debug_assert!(x & 1 == 1);
    // Correct to 3 bits; every step doubles that.
    let mut inv = x;
    for _ in 0..5 {
        inv = inv.wrapping_mul(2u64.wrapping_sub(x.wrapping_mul(inv)));
    }
    inv
}

#[derive(Clone, Debug)]
pub struct RollingHasher {
    kind: RollingKind,
    k: usize,
    canonical: bool,
    alphabet: Alphabet,
    table: [u64; 256],
    base: u64,
    base_inv: u64,
    /// `B^(k-1)`.
    base_top: u64,
    window: Option<MinimizerWindow>,
}

impl RollingHasher {
    /// Hasher for windows of `k` bases. With `w > k`, only the minimum hash
    /// of every `w - k + 1` consecutive k-mers is emitted.
    pub fn new(
        kind: RollingKind,
        k: usize,
        w: usize,
        alphabet: Alphabet,
        canonical: bool,
        ctx: &HashContext,
        stream: u64,
    ) -> Result<Self> {
        if k == 0 {
            return Err(config_error!("k must be at least 1"));
        }
        if w > MAX_WINDOW {
            return Err(config_error!(
                "window of {w} bases exceeds the maximum of {MAX_WINDOW}"
            ));
        }
        if canonical && !alphabet.has_complement() {
            return Err(config_error!(
                "alphabet {} has no reverse complement",
                alphabet.name()
            ));
        }
        let base = ctx.odd_base(2 * stream + 1);
        let base_top = (1..k).fold(1u64, |acc, _| acc.wrapping_mul(base));
        let window = (w > k).then(|| MinimizerWindow::new(w - k + 1));
        Ok(Self {
            kind,
            k,
            canonical,
            alphabet,
            table: ctx.table(2 * stream),
            base,
            base_inv: inverse_mod_2_64(base),
            base_top,
            window,
        })
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn kind(&self) -> RollingKind {
        self.kind
    }

    pub fn canonical(&self) -> bool {
        self.canonical
    }

    #[inline(always)]
    fn comp(code: u8) -> usize {
        (3 - code) as usize
    }

    /// Append a base to a window holding fewer than k bases.
    #[inline(always)]
    fn fill(&self, st: &mut RollState, code: u8) {
        let t = self.table[code as usize];
        match self.kind {
            RollingKind::Cyclic => {
                st.fwd = st.fwd.rotate_left(1) ^ t;
                if self.canonical {
                    let tc = self.table[Self::comp(code)];
                    st.rev ^= tc.rotate_left(st.filled as u32);
                }
            }
            RollingKind::RabinKarp => {
                st.fwd = st.fwd.wrapping_mul(self.base).wrapping_add(t);
                if self.canonical {
                    let tc = self.table[Self::comp(code)];
                    st.rev = st.rev.wrapping_add(tc.wrapping_mul(st.pow));
                    st.pow = st.pow.wrapping_mul(self.base);
                }
            }
        }
        st.filled += 1;
    }

    /// Slide a full window by one base.
    #[inline(always)]
    fn roll(&self, st: &mut RollState, out: u8, code: u8) {
        let t_in = self.table[code as usize];
        let t_out = self.table[out as usize];
        let k = self.k as u32;
        match self.kind {
            RollingKind::Cyclic => {
                st.fwd = st.fwd.rotate_left(1) ^ t_out.rotate_left(k) ^ t_in;
                if self.canonical {
                    let tc_in = self.table[Self::comp(code)];
                    let tc_out = self.table[Self::comp(out)];
                    st.rev = (st.rev ^ tc_out).rotate_right(1) ^ tc_in.rotate_left(k - 1);
                }
            }
            RollingKind::RabinKarp => {
                st.fwd = st
                    .fwd
                    .wrapping_sub(t_out.wrapping_mul(self.base_top))
                    .wrapping_mul(self.base)
                    .wrapping_add(t_in);
                if self.canonical {
                    let tc_in = self.table[Self::comp(code)];
                    let tc_out = self.table[Self::comp(out)];
                    st.rev = st
                        .rev
                        .wrapping_sub(tc_out)
                        .wrapping_mul(self.base_inv)
                        .wrapping_add(tc_in.wrapping_mul(self.base_top));
                }
            }
        }
    }

    #[inline(always)]
    fn digest(&self, st: &RollState) -> u64 {
        if self.canonical {
            st.fwd.min(st.rev)
        } else {
            st.fwd
        }
    }

    /// Feed base `i` of `seq`, returning the hash of the k-mer ending there.
    #[inline(always)]
    fn step(&self, st: &mut RollState, seq: &[u8], i: usize) -> Option<u64> {
        let code = self.alphabet.encode(seq[i]);
        if code == INVALID {
            *st = RollState::new();
            return None;
        }
        if st.filled < self.k {
            self.fill(st, code);
        } else {
            let out = self.alphabet.encode(seq[i - self.k]);
            self.roll(st, out, code);
        }
        (st.filled == self.k).then(|| self.digest(st))
    }

    /// One item per k-mer start position, `None` where it spans an invalid
    /// base.
    pub fn for_each_position(&self, seq: &[u8], mut f: impl FnMut(Option<u64>)) {
        let mut st = RollState::new();
        for i in 0..seq.len() {
            let hash = self.step(&mut st, seq, i);
            if i + 1 >= self.k {
                f(hash);
            }
        }
    }

    /// Call `f` on every hash (or every window minimum when windowed).
    pub fn for_each_hash(&mut self, seq: &[u8], mut f: impl FnMut(u64)) {
        match self.window.take() {
            None => self.for_each_position(seq, |h| {
                if let Some(h) = h {
                    f(h)
                }
            }),
            Some(mut window) => {
                window.reset();
                self.for_each_position(seq, |h| {
                    if let Some(min) = window.push(h.map(|h| (h, h))) {
                        f(min);
                    }
                });
                self.window = Some(window);
            }
        }
    }
}

/// Several rolling hashers with different k sharing one pass over the input.
#[derive(Clone, Debug)]
pub struct RollingHasherSet {
    hashers: Vec<RollingHasher>,
}

impl RollingHasherSet {
    pub fn new(
        kind: RollingKind,
        ks: &[usize],
        alphabet: Alphabet,
        canonical: bool,
        ctx: &HashContext,
    ) -> Result<Self> {
        if ks.is_empty() {
            return Err(config_error!("at least one k is required"));
        }
        let hashers = ks
            .iter()
            .enumerate()
            .map(|(i, &k)| RollingHasher::new(kind, k, 0, alphabet, canonical, ctx, i as u64))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { hashers })
    }

    pub fn ks(&self) -> impl Iterator<Item = usize> + '_ {
        self.hashers.iter().map(|h| h.k)
    }

    /// Call `f(hash, index)` for every k-mer, `index` being the position of
    /// its k in the list given at construction.
    pub fn for_each_hash(&self, seq: &[u8], mut f: impl FnMut(u64, usize)) {
        let mut states = vec![RollState::new(); self.hashers.len()];
        for i in 0..seq.len() {
            for (idx, (hasher, st)) in self.hashers.iter().zip(states.iter_mut()).enumerate() {
                if let Some(hash) = hasher.step(st, seq, i) {
                    f(hash, idx);
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::alphabet::{AMINO20, DNA4};

    fn random_dna(n: usize, n_rate: f64) -> Vec<u8> {
        (0..n)
            .map(|_| {
                if rand::random_bool(n_rate) {
                    b'N'
                } else {
                    b"ACGT"[rand::random_range(0..4)]
                }
            })
            .collect()
    }

    fn revcomp(seq: &[u8]) -> Vec<u8> {
        seq.iter()
            .rev()
            .map(|b| match b {
                b'A' => b'T',
                b'C' => b'G',
                b'G' => b'C',
                b'T' => b'A',
                _ => b'N',
            })
            .collect()
    }

    fn positions(h: &RollingHasher, seq: &[u8]) -> Vec<Option<u64>> {
        let mut out = vec![];
        h.for_each_position(seq, |x| out.push(x));
        out
    }

    #[test]
    fn inverse() {
        for _ in 0..1000 {
            let x = rand::random::<u64>() | 1;
            assert_eq!(x.wrapping_mul(inverse_mod_2_64(x)), 1);
        }
    }

    #[test]
    fn rolling_equals_recompute() {
        let ctx = HashContext::new(7);
        for kind in [RollingKind::Cyclic, RollingKind::RabinKarp] {
            for k in [1, 5, 31, 32, 33, 64, 65, 100] {
                let h = RollingHasher::new(kind, k, 0, DNA4, false, &ctx, 0).unwrap();
                let seq = random_dna(400, 0.01);
                let rolled = positions(&h, &seq);
                // Hash every window from scratch.
                let fresh: Vec<Option<u64>> = seq
                    .windows(k)
                    .map(|window| {
                        let mut st = RollState::new();
                        window
                            .iter()
                            .all(|&b| DNA4.is_valid(b))
                            .then(|| {
                                for &b in window {
                                    h.fill(&mut st, DNA4.encode(b));
                                }
                                h.digest(&st)
                            })
                    })
                    .collect();
                assert_eq!(rolled, fresh, "{kind:?} k={k}");
            }
        }
    }

    #[test]
    fn canonical_both_strands() {
        let ctx = HashContext::new(1);
        for kind in [RollingKind::Cyclic, RollingKind::RabinKarp] {
            for k in [3, 21, 40, 77] {
                let h = RollingHasher::new(kind, k, 0, DNA4, true, &ctx, 0).unwrap();
                let seq = random_dna(500, 0.01);
                let fwd = positions(&h, &seq);
                let mut rev = positions(&h, &revcomp(&seq));
                rev.reverse();
                assert_eq!(fwd, rev, "{kind:?} k={k}");
            }
        }
    }

    #[test]
    fn invalid_bases_do_not_leak() {
        let ctx = HashContext::new(0);
        let h = RollingHasher::new(RollingKind::Cyclic, 4, 0, DNA4, false, &ctx, 0).unwrap();
        let a = positions(&h, b"ACGTNACGT");
        let b = positions(&h, b"GGGGNACGT");
        // The only k-mers after the N are equal in both.
        assert_eq!(a.last(), b.last());
        assert!(a.last().unwrap().is_some());
        assert_eq!(a.iter().flatten().count(), 2);
    }

    #[test]
    fn windowed_minimum() {
        let ctx = HashContext::new(5);
        let k = 15;
        let w = 30;
        let mut h = RollingHasher::new(RollingKind::RabinKarp, k, w, DNA4, true, &ctx, 0).unwrap();
        let seq = random_dna(1000, 0.0);
        let all = positions(&h, &seq);
        let expected: Vec<u64> = all
            .windows(w - k + 1)
            .filter_map(|win| win.iter().flatten().min().copied())
            .collect();
        let mut got = vec![];
        h.for_each_hash(&seq, |x| got.push(x));
        assert_eq!(got, expected);

        let w = MAX_WINDOW + 1;
        let huge = RollingHasher::new(RollingKind::Cyclic, k, w, DNA4, true, &ctx, 0);
        assert!(matches!(huge, Err(crate::Error::Config(_))));
    }

    #[test]
    fn set_matches_individual() {
        let ctx = HashContext::new(11);
        let ks = [7, 31, 50];
        let set = RollingHasherSet::new(RollingKind::Cyclic, &ks, DNA4, true, &ctx).unwrap();
        let seq = random_dna(800, 0.01);
        let mut per_k = vec![vec![]; ks.len()];
        set.for_each_hash(&seq, |h, idx| per_k[idx].push(h));
        for (idx, &k) in ks.iter().enumerate() {
            let mut single =
                RollingHasher::new(RollingKind::Cyclic, k, 0, DNA4, true, &ctx, idx as u64)
                    .unwrap();
            let mut expected = vec![];
            single.for_each_hash(&seq, |h| expected.push(h));
            assert_eq!(per_k[idx], expected);
        }
    }

    #[test]
    fn protein_is_never_canonical() {
        let ctx = HashContext::new(0);
        assert!(RollingHasher::new(RollingKind::Cyclic, 7, 0, AMINO20, true, &ctx, 0).is_err());
        let mut h = RollingHasher::new(RollingKind::Cyclic, 7, 0, AMINO20, false, &ctx, 0).unwrap();
        let mut n = 0;
        h.for_each_hash(b"MKVLAAGIVALLL", |_| n += 1);
        assert_eq!(n, 13 - 7 + 1);
    }
}
