//! # kmersketch
//!
//! This library computes mergeable sketches of the k-mer content of DNA and
//! protein sequences:
//! - HyperLogLog, for cardinality only;
//! - the classic bottom-`k` sketch;
//! - SetSketch, either with continuous `f64` registers or quantized to 4, 8
//!   or 16 bits per register.
//!
//! ## K-mers
//! A sequence is turned into a stream of 64-bit values by one of three
//! encoders (see [`KmerSource`]):
//! - [`Encoder`]: packed k-mers over an [`Alphabet`], optionally spaced (a
//!   [`Spacer`] with gaps between retained bases), canonical, and reduced to
//!   minimizers over a window;
//! - [`RollingHasher`]: cyclic or Rabin-Karp rolling hashes, for any `k`;
//! - [`NtHashEncoder`]: ntHash, as provided by `seq-hash`.
//!
//! Bytes outside the alphabet never end up in a k-mer: the encoders restart
//! after them.
//!
//! ## Sketches
//! All sketches implement [`MergeSketch`]. Every input value is first mixed
//! by a fixed bijective finalizer, so raw packed k-mers can be fed directly.
//! Merging is commutative, associative and idempotent, so per-shard sketches
//! can be combined in any order, e.g. with [`distance::par_reduce`].
//!
//! For bottom-`k`, Jaccard similarity is the fraction of the `k` smallest
//! values of the union that occur in both sketches. For continuous
//! SetSketch it is the fraction of identical registers. For HyperLogLog and
//! quantized SetSketch it follows from inclusion-exclusion on cardinalities.
//!
//! ## Mash distance
//! We compute the mash distance as `-log( 2*j / (1+j) ) / k`.
//! This is always >=0, but can be as large as `inf` when `j=0` (as is the case for disjoint input sets).
//!
//! ## Files
//! Sketches are stored with `bincode` (fixed-width little-endian integers),
//! prefixed by a `u64` format version. Distance matrices and inverted indices
//! use fixed little-endian layouts, see [`distance`] and [`index`].
//!
//! ## Usage
//!
//! The main entrypoint of this library is the [`Sketcher`] object, built from
//! [`SketchParams`].
//!
//! ```
//! use kmersketch::{MergeSketch, SketchKind, SketchParams};
//!
//! let mut params = SketchParams::new(21);
//! params.alg = SketchKind::Cset;
//! params.s = 1024;
//! let sketcher = params.build().unwrap();
//!
//! // A pseudo-random sequence and its first half.
//! let seq1: Vec<u8> = (0..10_000u64)
//!     .map(|i| b"ACGT"[(kmersketch::hash::mix64(i) % 4) as usize])
//!     .collect();
//! let seq2 = &seq1[..5_000];
//!
//! let sketch1 = sketcher.sketch(&seq1);
//! let sketch2 = sketcher.sketch(seq2);
//!
//! // Value between 0 and 1, estimating the fraction of shared k-mers.
//! let j = sketch1.jaccard(&sketch2).unwrap();
//! assert!(0.0 <= j && j <= 1.0);
//!
//! let d = sketch1.mash_distance(&sketch2, 21).unwrap();
//! assert!(0.0 <= d);
//! assert!(sketch1.cardinality() > sketch2.cardinality());
//! ```

pub mod alphabet;
pub mod bottom;
pub mod distance;
pub mod encoder;
mod error;
pub mod hash;
pub mod hll;
pub mod index;
pub mod rolling;
pub mod setsketch;
pub mod source;
pub mod spacer;
pub mod window;

use std::{
    fs::File,
    io::{BufReader, BufWriter, Read, Write},
    path::Path,
};

use log::{debug, info};

pub use alphabet::{Alphabet, AmbiguityPolicy};
pub use bottom::BottomK;
pub use encoder::{Encoder, MinimizerOrder};
pub use error::{Error, Result};
pub use hash::HashContext;
pub use hll::HyperLogLog;
pub use index::IdIndex;
pub use rolling::{RollingHasher, RollingHasherSet, RollingKind};
pub use setsketch::{CSetSketch, RegisterWidth, SetSketch};
pub use source::{KmerSource, NtHashEncoder};
pub use spacer::Spacer;

use error::{config_error, format_error};

/// A fixed-size summary of a set of 64-bit values.
///
/// `merge` must be commutative, associative and idempotent, and only
/// succeeds between sketches of identical configuration.
pub trait MergeSketch {
    fn update(&mut self, value: u64);
    fn merge(&mut self, other: &Self) -> Result<()>;
    fn cardinality(&self) -> f64;
    fn clear(&mut self);
    /// Whether `merge(other)` would succeed.
    fn is_compatible(&self, other: &Self) -> bool;
}

/// Upper bound on the decoded size of one sketch. Length fields beyond it
/// fail with [`Error::Format`] before anything is allocated.
pub const MAX_SKETCH_BYTES: usize = 1 << 30;

pub const BINCODE_CONFIG: bincode::config::Configuration<
    bincode::config::LittleEndian,
    bincode::config::Fixint,
    bincode::config::Limit<MAX_SKETCH_BYTES>,
> = bincode::config::standard()
    .with_fixed_int_encoding()
    .with_limit::<MAX_SKETCH_BYTES>();
pub const EXTENSION: &str = "ksketch";
pub const SKETCH_VERSION: u64 = 1;

#[derive(bincode::Encode)]
struct VersionedSketch<'a> {
    /// Encoded first, so that it can be checked before decoding the rest.
    version: u64,
    sketch: &'a Sketch,
}

#[derive(bincode::Encode, bincode::Decode, Clone, Debug, PartialEq, mem_dbg::MemSize)]
pub enum Sketch {
    Hll(HyperLogLog),
    Bottom(BottomK),
    Continuous(CSetSketch),
    Quantized(SetSketch),
}

impl Sketch {
    pub fn kind(&self) -> &'static str {
        match self {
            Sketch::Hll(_) => "hll",
            Sketch::Bottom(_) => "bottom",
            Sketch::Continuous(_) => "cset",
            Sketch::Quantized(sketch) => match sketch.width() {
                RegisterWidth::Nibble => "nibble",
                RegisterWidth::Byte => "byte",
                RegisterWidth::Half => "half",
            },
        }
    }

    fn mismatch(&self, other: &Self) -> Error {
        config_error!(
            "cannot compare a {} sketch with a {} sketch",
            self.kind(),
            other.kind()
        )
    }

    /// Estimated Jaccard similarity of the underlying sets.
    pub fn jaccard(&self, other: &Self) -> Result<f64> {
        match (self, other) {
            (Sketch::Hll(a), Sketch::Hll(b)) => a.jaccard(b),
            (Sketch::Bottom(a), Sketch::Bottom(b)) => a.jaccard(b),
            (Sketch::Continuous(a), Sketch::Continuous(b)) => a.jaccard(b),
            (Sketch::Quantized(a), Sketch::Quantized(b)) => a.jaccard(b),
            _ => Err(self.mismatch(other)),
        }
    }

    /// Estimated fraction of this set contained in `other`.
    pub fn containment(&self, other: &Self) -> Result<f64> {
        let card = self.cardinality();
        if card == 0.0 {
            return Ok(0.0);
        }
        match (self, other) {
            (Sketch::Bottom(a), Sketch::Bottom(b)) => a.containment(b),
            (Sketch::Continuous(a), Sketch::Continuous(b)) => a.containment(b),
            (Sketch::Quantized(a), Sketch::Quantized(b)) => a.containment(b),
            (Sketch::Hll(a), Sketch::Hll(b)) => {
                Ok((a.jaccard(b)? * a.union_cardinality(b)? / card).min(1.0))
            }
            _ => Err(self.mismatch(other)),
        }
    }

    pub fn mash_distance(&self, other: &Self, k: usize) -> Result<f64> {
        Ok(distance::mash_distance(self.jaccard(other)?, k))
    }

    /// Structural checks after decoding.
    pub fn validate(&self) -> Result<()> {
        match self {
            Sketch::Hll(sketch) => sketch.validate(),
            Sketch::Bottom(sketch) => sketch.validate(),
            // Checked while decoding.
            Sketch::Continuous(_) | Sketch::Quantized(_) => Ok(()),
        }
    }

    pub fn write<W: Write>(&self, out: &mut W) -> Result<()> {
        let versioned = VersionedSketch {
            version: SKETCH_VERSION,
            sketch: self,
        };
        bincode::encode_into_std_write(&versioned, out, BINCODE_CONFIG)?;
        Ok(())
    }

    pub fn read<R: Read>(input: &mut R) -> Result<Self> {
        let version: u64 = bincode::decode_from_std_read(input, BINCODE_CONFIG)?;
        if version != SKETCH_VERSION {
            return Err(format_error!(
                "unsupported sketch version {version}, only version {SKETCH_VERSION} is supported"
            ));
        }
        let sketch: Sketch = bincode::decode_from_std_read(input, BINCODE_CONFIG)?;
        sketch.validate()?;
        Ok(sketch)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        self.write(&mut out)?;
        out.flush()?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let mut input = BufReader::new(File::open(path)?);
        let sketch = Self::read(&mut input)?;
        let mut byte = [0u8; 1];
        if input.read(&mut byte)? != 0 {
            return Err(format_error!("trailing bytes after sketch"));
        }
        Ok(sketch)
    }
}

impl MergeSketch for Sketch {
    #[inline(always)]
    fn update(&mut self, value: u64) {
        match self {
            Sketch::Hll(sketch) => sketch.update(value),
            Sketch::Bottom(sketch) => sketch.update(value),
            Sketch::Continuous(sketch) => sketch.update(value),
            Sketch::Quantized(sketch) => sketch.update(value),
        }
    }

    fn merge(&mut self, other: &Self) -> Result<()> {
        match (self, other) {
            (Sketch::Hll(a), Sketch::Hll(b)) => a.merge(b),
            (Sketch::Bottom(a), Sketch::Bottom(b)) => a.merge(b),
            (Sketch::Continuous(a), Sketch::Continuous(b)) => a.merge(b),
            (Sketch::Quantized(a), Sketch::Quantized(b)) => a.merge(b),
            (a, b) => Err(a.mismatch(b)),
        }
    }

    fn cardinality(&self) -> f64 {
        match self {
            Sketch::Hll(sketch) => sketch.cardinality(),
            Sketch::Bottom(sketch) => sketch.cardinality(),
            Sketch::Continuous(sketch) => sketch.cardinality(),
            Sketch::Quantized(sketch) => sketch.cardinality(),
        }
    }

    fn clear(&mut self) {
        match self {
            Sketch::Hll(sketch) => sketch.clear(),
            Sketch::Bottom(sketch) => sketch.clear(),
            Sketch::Continuous(sketch) => sketch.clear(),
            Sketch::Quantized(sketch) => sketch.clear(),
        }
    }

    fn is_compatible(&self, other: &Self) -> bool {
        match (self, other) {
            (Sketch::Hll(a), Sketch::Hll(b)) => a.is_compatible(b),
            (Sketch::Bottom(a), Sketch::Bottom(b)) => a.is_compatible(b),
            (Sketch::Continuous(a), Sketch::Continuous(b)) => a.is_compatible(b),
            (Sketch::Quantized(a), Sketch::Quantized(b)) => a.is_compatible(b),
            _ => false,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, Eq, PartialEq)]
pub enum SketchKind {
    Hll,
    Bottom,
    /// Continuous SetSketch.
    Cset,
    /// SetSketch with 4-bit registers.
    Nibble,
    /// SetSketch with 8-bit registers.
    Byte,
    /// SetSketch with 16-bit registers.
    Half,
}

impl SketchKind {
    fn width(self) -> Option<RegisterWidth> {
        match self {
            SketchKind::Nibble => Some(RegisterWidth::Nibble),
            SketchKind::Byte => Some(RegisterWidth::Byte),
            SketchKind::Half => Some(RegisterWidth::Half),
            _ => None,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, Eq, PartialEq)]
pub enum EncoderKind {
    /// Packed k-mers (spaced seeds and minimizers supported).
    Packed,
    Cyclic,
    RabinKarp,
    NtHash,
}

#[derive(clap::Args, Clone, Debug, PartialEq)]
pub struct SketchParams {
    /// Sketch algorithm to use.
    #[arg(long, default_value_t = SketchKind::Cset)]
    #[arg(value_enum)]
    pub alg: SketchKind,
    /// How k-mers are turned into 64-bit values.
    #[arg(long, default_value_t = EncoderKind::Packed)]
    #[arg(value_enum)]
    pub encoder: EncoderKind,
    /// When set, use forward instead of canonical k-mers.
    #[arg(
        long="fwd",
        num_args(0),
        action = clap::builder::ArgAction::Set,
        default_value_t = true,
        default_missing_value = "false",
    )]
    pub rc: bool,
    /// k-mer size.
    #[arg(short, default_value_t = 31)]
    pub k: usize,
    /// Minimizer window in bases; 0 keeps every k-mer.
    #[arg(short, default_value_t = 0)]
    pub w: usize,
    /// Gaps between consecutive retained bases, e.g. `0x7,3,0x7`. Empty for contiguous k-mers.
    #[arg(long, default_value = "")]
    pub spacing: String,
    /// Input alphabet (DNA, DNA5, AMINO20, SEB14, DAYHOFF, ...).
    #[arg(long, default_value = "DNA")]
    pub alphabet: String,
    /// Read ambiguous DNA bases as `A` instead of skipping the k-mers containing them.
    #[arg(long)]
    pub keep_ambiguous: bool,
    /// Order used to pick minimizers.
    #[arg(long, default_value_t = MinimizerOrder::Lexicographic)]
    #[arg(value_enum)]
    pub order: MinimizerOrder,
    /// Number of registers (a power of two for HyperLogLog), or `k` of bottom-k.
    #[arg(short, default_value_t = 4096)]
    pub s: usize,
    /// SetSketch `a` for quantized sketches.
    #[arg(long)]
    pub a: Option<f64>,
    /// SetSketch `b` for quantized sketches.
    #[arg(long)]
    pub b: Option<f64>,
    /// Seed for rolling-hash tables, ntHash and hash-ordered minimizers.
    #[arg(long, default_value_t = 0)]
    pub seed: u64,
    /// Continuous SetSketch: store the value that set each register.
    #[arg(long)]
    pub save_ids: bool,
    /// Continuous SetSketch: also count how often that value was seen.
    #[arg(long)]
    pub save_counts: bool,
}

impl SketchParams {
    /// Canonical DNA k-mers into a 4096-register continuous SetSketch.
    pub fn new(k: usize) -> Self {
        SketchParams {
            alg: SketchKind::Cset,
            encoder: EncoderKind::Packed,
            rc: true,
            k,
            w: 0,
            spacing: String::new(),
            alphabet: "DNA".to_string(),
            keep_ambiguous: false,
            order: MinimizerOrder::Lexicographic,
            s: 4096,
            a: None,
            b: None,
            seed: 0,
            save_ids: false,
            save_counts: false,
        }
    }

    /// Validate the parameters.
    pub fn build(&self) -> Result<Sketcher> {
        let mut alphabet = Alphabet::from_name(&self.alphabet)?;
        if self.keep_ambiguous {
            alphabet = alphabet.with_ambiguity(AmbiguityPolicy::MapTo(0))?;
        }
        let canonical = self.rc && alphabet.has_complement();
        if self.rc && !canonical {
            info!(
                "Alphabet {} has no reverse complement; using forward k-mers.",
                alphabet.name()
            );
        }
        let ctx = HashContext::new(self.seed);

        let template = match self.encoder {
            EncoderKind::Packed => {
                let spacer = Spacer::parse(self.k, self.w, &self.spacing)?;
                SourceTemplate::Encoder(
                    Encoder::new(spacer, alphabet, canonical, ctx)?.with_order(self.order),
                )
            }
            EncoderKind::Cyclic | EncoderKind::RabinKarp => {
                if !self.spacing.is_empty() {
                    return Err(config_error!("rolling hashers do not support spaced seeds"));
                }
                let kind = match self.encoder {
                    EncoderKind::Cyclic => RollingKind::Cyclic,
                    _ => RollingKind::RabinKarp,
                };
                SourceTemplate::Rolling(RollingHasher::new(
                    kind, self.k, self.w, alphabet, canonical, &ctx, 0,
                )?)
            }
            EncoderKind::NtHash => {
                if alphabet != alphabet::DNA4 {
                    return Err(config_error!(
                        "ntHash only supports plain DNA, not {}",
                        alphabet.name()
                    ));
                }
                if !self.spacing.is_empty() || self.w > self.k {
                    return Err(config_error!(
                        "ntHash supports neither spaced seeds nor minimizer windows"
                    ));
                }
                if self.k == 0 {
                    return Err(config_error!("k must be at least 1"));
                }
                SourceTemplate::NtHash {
                    k: self.k,
                    canonical,
                    ctx,
                }
            }
        };

        if (self.save_ids || self.save_counts) && self.alg != SketchKind::Cset {
            return Err(config_error!(
                "ids and counts are only stored by continuous SetSketch"
            ));
        }
        if (self.a.is_some() || self.b.is_some()) && self.alg.width().is_none() {
            return Err(config_error!(
                "parameters a and b only apply to quantized SetSketch"
            ));
        }
        let prototype = match self.alg {
            SketchKind::Hll => Sketch::Hll(HyperLogLog::with_registers(self.s)?),
            SketchKind::Bottom => Sketch::Bottom(BottomK::new(self.s)?),
            SketchKind::Cset => {
                Sketch::Continuous(CSetSketch::new(self.s, self.save_ids, self.save_counts)?)
            }
            SketchKind::Nibble | SketchKind::Byte | SketchKind::Half => {
                let width = self.alg.width().unwrap_or(RegisterWidth::Byte);
                let (a, b) = width.default_params();
                Sketch::Quantized(SetSketch::new(
                    self.s,
                    width,
                    self.a.unwrap_or(a),
                    self.b.unwrap_or(b),
                )?)
            }
        };

        debug!("Built sketcher for {self:?}");
        Ok(Sketcher {
            params: self.clone(),
            alphabet,
            canonical,
            template,
            prototype,
        })
    }
}

enum SourceTemplate {
    Encoder(Encoder),
    Rolling(RollingHasher),
    NtHash {
        k: usize,
        canonical: bool,
        ctx: HashContext,
    },
}

/// Validated sketch parameters.
///
/// Hands out one [`KmerSource`] and one empty [`Sketch`] per worker; neither
/// is shared between threads.
pub struct Sketcher {
    params: SketchParams,
    alphabet: Alphabet,
    canonical: bool,
    template: SourceTemplate,
    prototype: Sketch,
}

impl Sketcher {
    pub fn params(&self) -> &SketchParams {
        &self.params
    }

    pub fn alphabet(&self) -> &Alphabet {
        &self.alphabet
    }

    /// Whether k-mers are canonicalized.
    pub fn canonical(&self) -> bool {
        self.canonical
    }

    /// A fresh k-mer source.
    pub fn source(&self) -> KmerSource {
        match &self.template {
            SourceTemplate::Encoder(encoder) => KmerSource::Encoder(encoder.clone()),
            SourceTemplate::Rolling(hasher) => KmerSource::Rolling(hasher.clone()),
            &SourceTemplate::NtHash { k, canonical, ctx } => {
                KmerSource::NtHash(NtHashEncoder::with_valid_k(k, canonical, ctx))
            }
        }
    }

    /// An empty sketch.
    pub fn new_sketch(&self) -> Sketch {
        self.prototype.clone()
    }

    /// Add the k-mers of `seq` to `sketch`. Returns the number of values fed.
    pub fn sketch_into(&self, source: &mut KmerSource, sketch: &mut Sketch, seq: &[u8]) -> usize {
        let mut count = 0;
        source.for_each_hash(seq, |value| {
            count += 1;
            sketch.update(value);
        });
        count
    }

    /// Sketch a single sequence.
    pub fn sketch(&self, seq: &[u8]) -> Sketch {
        self.sketch_seqs(&[seq])
    }

    /// Sketch multiple sequence (fasta records) into a single sketch.
    pub fn sketch_seqs(&self, seqs: &[&[u8]]) -> Sketch {
        let mut source = self.source();
        let mut sketch = self.new_sketch();
        let count: usize = seqs
            .iter()
            .map(|seq| self.sketch_into(&mut source, &mut sketch, seq))
            .sum();
        debug!(
            "Sketched {count} k-mers from {} sequences into a {} sketch",
            seqs.len(),
            sketch.kind()
        );
        sketch
    }

    /// Sorted, distinct k-mer values of `seqs`, for the exact comparison tools.
    pub fn kmers(&self, seqs: &[&[u8]]) -> Vec<u64> {
        let mut source = self.source();
        let mut out = vec![];
        for seq in seqs {
            source.for_each_hash(seq, |value| out.push(value));
        }
        out.sort_unstable();
        out.dedup();
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;

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
            .map(|&b| match b {
                b'A' => b'T',
                b'C' => b'G',
                b'G' => b'C',
                b'T' => b'A',
                other => other,
            })
            .collect()
    }

    fn params(alg: SketchKind, encoder: EncoderKind, k: usize, s: usize) -> SketchParams {
        let mut params = SketchParams::new(k);
        params.alg = alg;
        params.encoder = encoder;
        params.s = s;
        params
    }

    const KINDS: [SketchKind; 6] = [
        SketchKind::Hll,
        SketchKind::Bottom,
        SketchKind::Cset,
        SketchKind::Nibble,
        SketchKind::Byte,
        SketchKind::Half,
    ];

    const ENCODERS: [EncoderKind; 4] = [
        EncoderKind::Packed,
        EncoderKind::Cyclic,
        EncoderKind::RabinKarp,
        EncoderKind::NtHash,
    ];

    #[test]
    fn invalid_params() {
        let build = |f: fn(&mut SketchParams)| {
            let mut params = SketchParams::new(21);
            f(&mut params);
            params.build()
        };
        assert!(build(|_| ()).is_ok());
        assert!(build(|p| p.k = 33).is_err());
        assert!(build(|p| p.k = 0).is_err());
        assert!(build(|p| p.alphabet = "klingon".into()).is_err());
        assert!(build(|p| {
            p.alg = SketchKind::Hll;
            p.s = 1000;
        })
        .is_err());
        assert!(build(|p| p.save_counts = true).is_err());
        assert!(build(|p| {
            p.alg = SketchKind::Bottom;
            p.save_ids = true;
        })
        .is_err());
        assert!(build(|p| p.a = Some(1.0)).is_err());
        assert!(build(|p| {
            p.alg = SketchKind::Byte;
            p.b = Some(0.5);
        })
        .is_err());
        assert!(build(|p| {
            p.encoder = EncoderKind::NtHash;
            p.alphabet = "AMINO".into();
        })
        .is_err());
        assert!(build(|p| {
            p.encoder = EncoderKind::NtHash;
            p.keep_ambiguous = true;
        })
        .is_err());
        assert!(build(|p| {
            p.encoder = EncoderKind::Cyclic;
            p.spacing = "2x20".into();
        })
        .is_err());
        // Non-palindromic spaced seed cannot be canonical...
        assert!(build(|p| {
            p.k = 5;
            p.spacing = "1,0,0,2".into();
        })
        .is_err());
        // ...but can be used forward only.
        assert!(build(|p| {
            p.k = 5;
            p.spacing = "1,0,0,2".into();
            p.rc = false;
        })
        .is_ok());
    }

    #[test]
    fn protein_is_forward_only() {
        let mut params = SketchParams::new(7);
        params.alphabet = "SEB14".into();
        let sketcher = params.build().unwrap();
        assert!(!sketcher.canonical());
        let seq = b"MKVLAAGIVGLLLAQPAMAQEKSWTK";
        let mut source = sketcher.source();
        let mut sketch = sketcher.new_sketch();
        let count = sketcher.sketch_into(&mut source, &mut sketch, seq);
        assert_eq!(count, seq.len() - 7 + 1);
    }

    #[test]
    fn rc() {
        for encoder in ENCODERS {
            for alg in KINDS {
                let k = rand::random_range(5..=31);
                let sketcher = params(alg, encoder, k, 256).build().unwrap();
                let seq = random_dna(rand::random_range(k..2000), 0.01);
                let sketch = sketcher.sketch(&seq);
                let sketch_rc = sketcher.sketch(&revcomp(&seq));
                assert_eq!(sketch, sketch_rc, "{encoder:?} {alg:?} k={k}");
            }
        }
    }

    #[test]
    fn rc_minimizers() {
        // Minimizers of canonical k-mers are strand independent up to ties in
        // the hash order.
        let mut params = params(SketchKind::Bottom, EncoderKind::Packed, 21, 10_000);
        params.w = 40;
        params.order = MinimizerOrder::Hash;
        let sketcher = params.build().unwrap();
        let seq = random_dna(3000, 0.0);
        assert_eq!(sketcher.kmers(&[&seq]), sketcher.kmers(&[&revcomp(&seq)]));
    }

    #[test]
    fn equal_dist() {
        let seq = random_dna(3000, 0.0);
        for alg in KINDS {
            let sketcher = params(alg, EncoderKind::Packed, 10, 1024).build().unwrap();
            let sketch = sketcher.sketch(&seq);
            assert_eq!(sketch.jaccard(&sketch).unwrap(), 1.0, "{alg:?}");
            assert_eq!(sketch.mash_distance(&sketch, 10).unwrap(), 0.0);
        }
    }

    #[test]
    fn fuzz_short() {
        let k = 10;
        for alg in KINDS {
            for encoder in ENCODERS {
                let sketcher = params(alg, encoder, k, 1024).build().unwrap();
                for n in [0, 5, 9, 10, 20, 40, 80, 150, 300] {
                    let s1 = sketcher.sketch(&random_dna(n, 0.05));
                    let s2 = sketcher.sketch(&random_dna(n, 0.05));
                    let j = s1.jaccard(&s2).unwrap();
                    assert!((0.0..=1.0).contains(&j));
                    s1.mash_distance(&s2, k).unwrap();
                    s1.containment(&s2).unwrap();
                }
            }
        }
    }

    #[test]
    fn shards_merge_to_whole() {
        let records: Vec<Vec<u8>> = (0..9).map(|_| random_dna(500, 0.01)).collect();
        let slices: Vec<&[u8]> = records.iter().map(|r| r.as_slice()).collect();
        for alg in KINDS {
            let sketcher = params(alg, EncoderKind::Packed, 15, 512).build().unwrap();
            let whole = sketcher.sketch_seqs(&slices);
            let mut shards: Vec<Sketch> = slices.iter().map(|s| sketcher.sketch(s)).collect();
            distance::par_reduce(&mut shards, |a, b| a.merge(b)).unwrap();
            assert_eq!(shards[0], whole, "{alg:?}");
        }
    }

    #[test]
    fn mismatched_kinds() {
        let seq = random_dna(500, 0.0);
        let mut hll = params(SketchKind::Hll, EncoderKind::Packed, 15, 512)
            .build()
            .unwrap()
            .sketch(&seq);
        let bottom = params(SketchKind::Bottom, EncoderKind::Packed, 15, 512)
            .build()
            .unwrap()
            .sketch(&seq);
        assert!(!hll.is_compatible(&bottom));
        assert!(matches!(hll.merge(&bottom), Err(Error::Config(_))));
        assert!(matches!(hll.jaccard(&bottom), Err(Error::Config(_))));
    }

    #[test]
    fn file_round_trip() {
        let seq = random_dna(5000, 0.01);
        for alg in KINDS {
            let mut params = params(alg, EncoderKind::Packed, 21, 333);
            if alg == SketchKind::Hll {
                params.s = 512;
            }
            if alg == SketchKind::Cset {
                params.save_ids = true;
                params.save_counts = true;
            }
            let sketch = params.build().unwrap().sketch(&seq);
            let mut buf = vec![];
            sketch.write(&mut buf).unwrap();
            assert_eq!(&buf[..8], &SKETCH_VERSION.to_le_bytes());
            let read = Sketch::read(&mut buf.as_slice()).unwrap();
            assert_eq!(read, sketch, "{alg:?}");

            let truncated = &buf[..buf.len() - 3];
            assert!(matches!(
                Sketch::read(&mut &truncated[..]),
                Err(Error::Format(_))
            ));
        }
    }

    #[test]
    fn file_errors() {
        let sketch = params(SketchKind::Byte, EncoderKind::Packed, 21, 64)
            .build()
            .unwrap()
            .sketch(&random_dna(1000, 0.0));
        let mut buf = vec![];
        sketch.write(&mut buf).unwrap();

        let mut wrong_version = buf.clone();
        wrong_version[0] = 2;
        assert!(matches!(
            Sketch::read(&mut wrong_version.as_slice()),
            Err(Error::Format(_))
        ));

        // Unknown sketch tag.
        let mut wrong_tag = buf.clone();
        wrong_tag[8] = 9;
        assert!(matches!(
            Sketch::read(&mut wrong_tag.as_slice()),
            Err(Error::Format(_))
        ));

        // Register count that does not match the register array.
        let mut wrong_m = buf.clone();
        wrong_m[12] = 65;
        assert!(matches!(
            Sketch::read(&mut wrong_m.as_slice()),
            Err(Error::Format(_))
        ));
    }

    fn put_u64(buf: &mut [u8], at: usize, value: u64) {
        buf[at..at + 8].copy_from_slice(&value.to_le_bytes());
    }

    #[test]
    fn huge_length_fields() {
        let seq = random_dna(1000, 0.0);
        let encode = |alg: SketchKind| {
            let mut buf = vec![];
            params(alg, EncoderKind::Packed, 15, 64)
                .build()
                .unwrap()
                .sketch(&seq)
                .write(&mut buf)
                .unwrap();
            buf
        };
        let rejects = |buf: &[u8]| matches!(Sketch::read(&mut &buf[..]), Err(Error::Format(_)));

        // version, tag, m, a, b, width tag, then the register vector length.
        let byte = encode(SketchKind::Byte);
        assert_eq!(&byte[40..48], &64u64.to_le_bytes());
        let mut long_vector = byte.clone();
        put_u64(&mut long_vector, 40, 1 << 60);
        assert!(rejects(&long_vector));
        let mut huge_m = long_vector.clone();
        put_u64(&mut huge_m, 12, 1 << 60);
        assert!(rejects(&huge_m));
        let mut zero_m = byte.clone();
        put_u64(&mut zero_m, 12, 0);
        assert!(rejects(&zero_m));

        // version, tag, k, then the value vector length.
        let mut bottom = encode(SketchKind::Bottom);
        put_u64(&mut bottom, 20, 1 << 60);
        assert!(rejects(&bottom));

        // version, tag, p, then the register vector length.
        let mut hll = encode(SketchKind::Hll);
        put_u64(&mut hll, 13, u64::MAX);
        assert!(rejects(&hll));

        // version, tag, m, then the register vector length.
        let mut cset = encode(SketchKind::Cset);
        put_u64(&mut cset, 20, 1 << 61);
        assert!(rejects(&cset));

        assert!(rejects(&byte[..30]));
    }

    #[test]
    fn nibble_padding_must_be_zero() {
        let sketch = params(SketchKind::Nibble, EncoderKind::Packed, 15, 63)
            .build()
            .unwrap()
            .sketch(&random_dna(1000, 0.0));
        let mut buf = vec![];
        sketch.write(&mut buf).unwrap();
        // 63 registers take 32 bytes; the high nibble of the last is padding.
        assert_eq!(&buf[40..48], &32u64.to_le_bytes());
        assert_eq!(buf.len(), 48 + 32);
        assert_eq!(buf[79] >> 4, 0);
        assert_eq!(Sketch::read(&mut buf.as_slice()).unwrap(), sketch);

        buf[79] |= 0x30;
        assert!(matches!(
            Sketch::read(&mut buf.as_slice()),
            Err(Error::Format(_))
        ));
    }
}
