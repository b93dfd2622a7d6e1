//! Packed k-mer encoder over an [`Alphabet`].
//!
//! Each k-mer is packed with `bits_per_symbol` bits per retained base, the
//! first base in the most significant position. For DNA (A=0, C=1, G=2, T=3)
//! the reverse complement is obtained by complementing every code (`3 - c`)
//! and reversing their order.

use crate::{
    alphabet::{Alphabet, INVALID},
    error::{Result, config_error},
    hash::HashContext,
    spacer::Spacer,
    window::{MAX_WINDOW, MinimizerWindow},
};

/// How k-mers inside a window are ranked when picking the minimizer.
#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum MinimizerOrder {
    /// The smallest packed k-mer value.
    #[default]
    Lexicographic,
    /// The smallest seeded hash of the k-mer.
    Hash,
    /// The k-mer with the most diverse base composition.
    Entropy,
}

#[derive(Clone, Debug)]
pub struct Encoder {
    spacer: Spacer,
    alphabet: Alphabet,
    canonical: bool,
    order: MinimizerOrder,
    ctx: HashContext,
    bits: u32,
    mask: u64,
    window: MinimizerWindow,
}

impl Encoder {
    pub fn new(
        spacer: Spacer,
        alphabet: Alphabet,
        canonical: bool,
        ctx: HashContext,
    ) -> Result<Self> {
        let bits = alphabet.bits_per_symbol();
        if spacer.w() > MAX_WINDOW {
            return Err(config_error!(
                "window of {} bases exceeds the maximum of {MAX_WINDOW}",
                spacer.w()
            ));
        }
        if spacer.k() > alphabet.max_k() {
            return Err(config_error!(
                "k={} does not fit in 64 bits for alphabet {} (max k={})",
                spacer.k(),
                alphabet.name(),
                alphabet.max_k()
            ));
        }
        if canonical {
            if !alphabet.has_complement() {
                return Err(config_error!(
                    "alphabet {} has no reverse complement",
                    alphabet.name()
                ));
            }
            if !spacer.is_palindromic() {
                return Err(config_error!(
                    "spaced seed with gaps {:?} is not palindromic and cannot be canonicalized",
                    spacer.gaps()
                ));
            }
        }
        let used = bits as usize * spacer.k();
        let mask = if used >= 64 {
            u64::MAX
        } else {
            (1u64 << used) - 1
        };
        let window = MinimizerWindow::new(spacer.window_kmers());
        Ok(Self {
            spacer,
            alphabet,
            canonical,
            order: MinimizerOrder::default(),
            ctx,
            bits,
            mask,
            window,
        })
    }

    pub fn with_order(mut self, order: MinimizerOrder) -> Self {
        self.order = order;
        self
    }

    pub fn spacer(&self) -> &Spacer {
        &self.spacer
    }

    pub fn alphabet(&self) -> &Alphabet {
        &self.alphabet
    }

    pub fn canonical(&self) -> bool {
        self.canonical
    }

    pub fn order(&self) -> MinimizerOrder {
        self.order
    }

    /// One item per k-mer start position: `None` where the k-mer would
    /// include an invalid base.
    pub fn positions<'e, 's>(&'e self, seq: &'s [u8]) -> KmerPositions<'e, 's> {
        KmerPositions {
            encoder: self,
            seq,
            pos: 0,
            state: State::Seeking,
            fwd: 0,
            rev: 0,
        }
    }

    /// Start a pull-style pass over `seq`.
    pub fn assign<'e, 's>(&'e self, seq: &'s [u8]) -> KmerCursor<'e, 's> {
        let mut cursor = KmerCursor {
            positions: self.positions(seq),
            next: None,
        };
        cursor.advance();
        cursor
    }

    /// Call `f` on every valid k-mer of `seq`.
    pub fn for_each_kmer(&self, seq: &[u8], mut f: impl FnMut(u64)) {
        for kmer in self.positions(seq).flatten() {
            f(kmer);
        }
    }

    /// Call `f` on the minimizer of every window of `seq` that holds at least
    /// one valid k-mer.
    pub fn for_each_minimizer(&mut self, seq: &[u8], mut f: impl FnMut(u64)) {
        let mut window = std::mem::replace(&mut self.window, MinimizerWindow::new(1));
        window.reset();
        for kmer in self.positions(seq) {
            let item = kmer.map(|kmer| (self.score(kmer), kmer));
            if let Some(min) = window.push(item) {
                f(min);
            }
        }
        self.window = window;
    }

    /// Minimizers when the spacer has a window, all k-mers otherwise.
    pub fn for_each(&mut self, seq: &[u8], f: impl FnMut(u64)) {
        if self.spacer.is_windowed() {
            self.for_each_minimizer(seq, f);
        } else {
            self.for_each_kmer(seq, f);
        }
    }

    /// Reverse complement of a packed DNA k-mer over this encoder's comb.
    pub fn reverse_complement(&self, mut kmer: u64) -> u64 {
        let mut rc = 0;
        for _ in 0..self.spacer.k() {
            rc = (rc << 2) | (3 - (kmer & 3));
            kmer >>= 2;
        }
        rc
    }

    pub fn canonicalize(&self, kmer: u64) -> u64 {
        kmer.min(self.reverse_complement(kmer))
    }

    fn score(&self, kmer: u64) -> u64 {
        match self.order {
            MinimizerOrder::Lexicographic => kmer,
            MinimizerOrder::Hash => self.ctx.hash(kmer),
            MinimizerOrder::Entropy => self.entropy_score(kmer),
        }
    }

    /// Lower for higher Shannon entropy of the symbol composition.
    fn entropy_score(&self, kmer: u64) -> u64 {
        let k = self.spacer.k();
        let symbol_mask = (1u64 << self.bits) - 1;
        let mut counts = [0u32; 64];
        for i in 0..k {
            counts[((kmer >> (i as u32 * self.bits)) & symbol_mask) as usize] += 1;
        }
        let inv = 1.0 / k as f64;
        let entropy = counts
            .iter()
            .filter(|&&c| c > 0)
            .map(|&c| {
                let p = c as f64 * inv;
                -p * p.log2()
            })
            .sum::<f64>();
        let max = (self.alphabet.size() as f64).log2().max(1.0);
        let deficit = (1.0 - entropy / max).clamp(0.0, 1.0);
        (deficit * (1u64 << 52) as f64) as u64
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    /// At the start, or right after an invalid base.
    Seeking,
    /// Holding this many consecutive valid bases, fewer than k.
    Filling(usize),
    /// The last k bases form a valid k-mer.
    Ready,
}

/// Iterator over k-mer start positions of one sequence.
pub struct KmerPositions<'e, 's> {
    encoder: &'e Encoder,
    seq: &'s [u8],
    pos: usize,
    state: State,
    fwd: u64,
    rev: u64,
}

impl KmerPositions<'_, '_> {
    #[inline(always)]
    fn next_contiguous(&mut self) -> Option<Option<u64>> {
        let enc = self.encoder;
        let k = enc.spacer.k();
        loop {
            let base = *self.seq.get(self.pos)?;
            self.pos += 1;
            let code = enc.alphabet.encode(base);
            if code == INVALID {
                self.state = State::Seeking;
                self.fwd = 0;
                self.rev = 0;
            } else {
                self.fwd = ((self.fwd << enc.bits) | code as u64) & enc.mask;
                if enc.canonical {
                    let comp = (3 - code) as u64;
                    self.rev = (self.rev >> 2) | (comp << (2 * (k - 1)));
                }
                let filled = match self.state {
                    State::Seeking => 1,
                    State::Filling(n) => n + 1,
                    State::Ready => k,
                };
                self.state = if filled >= k {
                    State::Ready
                } else {
                    State::Filling(filled)
                };
            }

            if self.pos < k {
                continue;
            }
            if self.state != State::Ready {
                return Some(None);
            }
            let kmer = if enc.canonical {
                self.fwd.min(self.rev)
            } else {
                self.fwd
            };
            return Some(Some(kmer));
        }
    }

    /// Spaced k-mers are rebuilt from their retained bases at every start.
    #[inline(always)]
    fn next_spaced(&mut self) -> Option<Option<u64>> {
        let enc = self.encoder;
        let start = self.pos;
        if start + enc.spacer.span() > self.seq.len() {
            return None;
        }
        self.pos += 1;
        let mut fwd = 0u64;
        let mut rev = 0u64;
        for (i, &offset) in enc.spacer.offsets().iter().enumerate() {
            let code = enc.alphabet.encode(self.seq[start + offset]);
            if code == INVALID {
                return Some(None);
            }
            fwd = (fwd << enc.bits) | code as u64;
            if enc.canonical {
                rev |= ((3 - code) as u64) << (2 * i);
            }
        }
        let kmer = if enc.canonical { fwd.min(rev) } else { fwd };
        Some(Some(kmer))
    }
}

impl Iterator for KmerPositions<'_, '_> {
    type Item = Option<u64>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.encoder.spacer.is_contiguous() {
            self.next_contiguous()
        } else {
            self.next_spaced()
        }
    }
}

/// Pull-style cursor over the valid k-mers of one sequence.
pub struct KmerCursor<'e, 's> {
    positions: KmerPositions<'e, 's>,
    next: Option<u64>,
}

impl KmerCursor<'_, '_> {
    fn advance(&mut self) {
        self.next = self.positions.by_ref().flatten().next();
    }

    pub fn has_next_kmer(&self) -> bool {
        self.next.is_some()
    }

    pub fn next_kmer(&mut self) -> Option<u64> {
        let kmer = self.next.take()?;
        self.advance();
        Some(kmer)
    }
}

impl Iterator for KmerCursor<'_, '_> {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        self.next_kmer()
    }
}
