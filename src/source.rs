use seq_hash::KmerHasher;

use crate::{
    alphabet::DNA4,
    encoder::Encoder,
    error::{Result, config_error},
    hash::HashContext,
    rolling::RollingHasher,
};

/// Rotate by 1, as in classic ntHash.
type FwdNtHasher = seq_hash::NtHasher<false, 1>;
type RcNtHasher = seq_hash::NtHasher<true, 1>;

/// ntHash over DNA, computed per maximal run of A/C/G/T so that ambiguous
/// bases never contribute to a hash.
///
/// ntHash values are 32 bits wide; they are widened with the context mixer.
pub struct NtHashEncoder {
    k: usize,
    canonical: bool,
    ctx: HashContext,
    fwd_hasher: FwdNtHasher,
    rc_hasher: RcNtHasher,
}

impl NtHashEncoder {
    pub fn new(k: usize, canonical: bool, ctx: HashContext) -> Result<Self> {
        if k == 0 {
            return Err(config_error!("k must be at least 1"));
        }
        Ok(Self::with_valid_k(k, canonical, ctx))
    }

    pub(crate) fn with_valid_k(k: usize, canonical: bool, ctx: HashContext) -> Self {
        let seed = ctx.derive(u64::MAX) as u32;
        Self {
            k,
            canonical,
            ctx,
            fwd_hasher: FwdNtHasher::new_with_seed(k, seed),
            rc_hasher: RcNtHasher::new_with_seed(k, seed),
        }
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn for_each_hash(&self, seq: &[u8], mut f: impl FnMut(u64)) {
        for run in seq.split(|&b| !DNA4.is_valid(b)) {
            if run.len() < self.k {
                continue;
            }
            let run = packed_seq::AsciiSeq(run);
            if self.canonical {
                for h in self.rc_hasher.hash_kmers_scalar(run) {
                    f(self.ctx.widen(h));
                }
            } else {
                for h in self.fwd_hasher.hash_kmers_scalar(run) {
                    f(self.ctx.widen(h));
                }
            }
        }
    }
}

/// The ways of turning a sequence into a stream of 64-bit k-mer values.
pub enum KmerSource {
    /// Packed (optionally spaced, canonical or windowed) k-mers.
    Encoder(Encoder),
    Rolling(RollingHasher),
    NtHash(NtHashEncoder),
}

impl KmerSource {
    pub fn for_each_hash(&mut self, seq: &[u8], f: impl FnMut(u64)) {
        match self {
            KmerSource::Encoder(encoder) => encoder.for_each(seq, f),
            KmerSource::Rolling(hasher) => hasher.for_each_hash(seq, f),
            KmerSource::NtHash(hasher) => hasher.for_each_hash(seq, f),
        }
    }

    pub fn k(&self) -> usize {
        match self {
            KmerSource::Encoder(encoder) => encoder.spacer().k(),
            KmerSource::Rolling(hasher) => hasher.k(),
            KmerSource::NtHash(hasher) => hasher.k(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{alphabet::DNA4, rolling::RollingKind, spacer::Spacer};

    fn random_dna(n: usize) -> Vec<u8> {
        (0..n).map(|_| b"ACGT"[rand::random_range(0..4)]).collect()
    }

    fn collect(source: &mut KmerSource, seq: &[u8]) -> Vec<u64> {
        let mut out = vec![];
        source.for_each_hash(seq, |h| out.push(h));
        out
    }

    #[test]
    fn nthash_counts_valid_kmers() {
        let k = 21;
        let nt = NtHashEncoder::new(k, true, HashContext::new(0)).unwrap();
        let mut seq = random_dna(300);
        seq[100] = b'N';
        seq[250] = b'R';
        let mut source = KmerSource::NtHash(nt);
        let hashes = collect(&mut source, &seq);
        let expected = seq
            .windows(k)
            .filter(|w| w.iter().all(|&b| DNA4.is_valid(b)))
            .count();
        assert_eq!(hashes.len(), expected);
    }

    #[test]
    fn nthash_is_canonical() {
        let k = 15;
        let nt = NtHashEncoder::new(k, true, HashContext::new(9)).unwrap();
        let seq = random_dna(200);
        let rc: Vec<u8> = seq
            .iter()
            .rev()
            .map(|b| match b {
                b'A' => b'T',
                b'C' => b'G',
                b'G' => b'C',
                _ => b'A',
            })
            .collect();
        let mut a = vec![];
        nt.for_each_hash(&seq, |h| a.push(h));
        let mut b = vec![];
        nt.for_each_hash(&rc, |h| b.push(h));
        b.reverse();
        assert_eq!(a, b);
    }

    #[test]
    fn all_sources_agree_on_count() {
        let ctx = HashContext::new(2);
        let k = 17;
        let seq = random_dna(1000);
        let mut sources = [
            KmerSource::Encoder(
                Encoder::new(Spacer::contiguous(k).unwrap(), DNA4, true, ctx).unwrap(),
            ),
            KmerSource::Rolling(
                RollingHasher::new(RollingKind::Cyclic, k, 0, DNA4, true, &ctx, 0).unwrap(),
            ),
            KmerSource::NtHash(NtHashEncoder::new(k, true, ctx).unwrap()),
        ];
        for source in &mut sources {
            assert_eq!(source.k(), k);
            assert_eq!(collect(source, &seq).len(), seq.len() - k + 1);
        }
    }
}
