//! SetSketch: exponential-register sketches.
//!
//! Every element drives an increasing stream of points `x_1 < x_2 < ...` with
//! `x_j = x_{j-1} + Exp(1)/m`, each sent to a uniformly random register (the
//! first one to `hash mod m`). By Poisson splitting, the first point an element
//! sends to any given register is an independent `Exp(1)` variate, so register
//! `i` of a set of `n` elements holds the minimum of `n` such variates,
//! distributed as `Exp(n)`.
//!
//! [`CSetSketch`] keeps these minima as `f64`. [`SetSketch`] keeps the level
//! `floor(1 - log_b(x / a))` clamped to `0..=q+1`, in 4, 8 or 16 bits. Levels
//! are monotone in `x`, so quantizing a continuous sketch and updating a
//! quantized sketch directly give the same registers.
//!
//! Both variants stop generating points for an element as soon as no further
//! point can change any register.

use bincode::{Decode, de::Decoder, error::DecodeError};
use mem_dbg::MemSize;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::Exp1;

use crate::{
    MergeSketch,
    error::{Result, config_error},
    hash::mix64,
};

/// Salt for the per-element point stream.
const POINT_STREAM: u64 = 0x5E75_E7C4_0000_0001;

/// First register and generator of the point stream of `value`.
///
/// Registers depend on the exact output of the generator, so it must be a
/// value-stable one.
fn point_stream(value: u64, m: usize) -> (usize, ChaCha8Rng) {
    let h = mix64(value);
    (
        (h % m as u64) as usize,
        ChaCha8Rng::seed_from_u64(h ^ POINT_STREAM),
    )
}

/// Distance to the next point: `Exp(1) * scale`.
#[inline(always)]
fn next_gap(rng: &mut ChaCha8Rng, scale: f64) -> f64 {
    let e: f64 = rng.sample(Exp1);
    e * scale
}

#[inline(always)]
fn next_register(rng: &mut ChaCha8Rng, m: usize) -> usize {
    rng.random_range(0..m as u64) as usize
}

/// Continuous SetSketch with `f64` registers.
#[derive(Clone, Debug, PartialEq, MemSize)]
pub struct CSetSketch {
    registers: Vec<f64>,
    /// The input value that set each register.
    ids: Option<Vec<u64>>,
    /// How often the current holder of each register was seen.
    counts: Option<Vec<u32>>,
    /// Largest register; `+inf` while any register is unset.
    max: f64,
    unset: usize,
}

impl CSetSketch {
    pub fn new(m: usize, save_ids: bool, save_counts: bool) -> Result<Self> {
        if m == 0 {
            return Err(config_error!("SetSketch needs at least one register"));
        }
        if save_counts && !save_ids {
            return Err(config_error!("SetSketch id counts require saving ids"));
        }
        Ok(Self {
            registers: vec![f64::INFINITY; m],
            ids: save_ids.then(|| vec![0; m]),
            counts: save_counts.then(|| vec![0; m]),
            max: f64::INFINITY,
            unset: m,
        })
    }

    pub fn m(&self) -> usize {
        self.registers.len()
    }

    pub fn registers(&self) -> &[f64] {
        &self.registers
    }

    pub fn ids(&self) -> Option<&[u64]> {
        self.ids.as_deref()
    }

    pub fn counts(&self) -> Option<&[u32]> {
        self.counts.as_deref()
    }

    fn refresh(&mut self) {
        self.unset = self.registers.iter().filter(|x| x.is_infinite()).count();
        self.max = if self.unset > 0 {
            f64::INFINITY
        } else {
            self.registers.iter().copied().fold(0.0, f64::max)
        };
    }

    fn check(&self, other: &Self) -> Result<()> {
        if !self.is_compatible(other) {
            return Err(config_error!(
                "SetSketch mismatch: {} registers (ids {}, counts {}) vs {} (ids {}, counts {})",
                self.m(),
                self.ids.is_some(),
                self.counts.is_some(),
                other.m(),
                other.ids.is_some(),
                other.counts.is_some()
            ));
        }
        Ok(())
    }

    fn estimate(m: usize, sum: f64) -> f64 {
        // A single element sets every register, so `inf` means empty.
        if sum.is_infinite() || sum == 0.0 {
            return 0.0;
        }
        m as f64 / sum
    }

    /// Estimate of `|A ∪ B|` from the element-wise minimum.
    pub fn union_cardinality(&self, other: &Self) -> Result<f64> {
        self.check(other)?;
        let sum = self
            .registers
            .iter()
            .zip(&other.registers)
            .map(|(a, b)| a.min(*b))
            .sum();
        Ok(Self::estimate(self.m(), sum))
    }

    /// Fraction of registers holding the same value, among registers set in
    /// either sketch.
    pub fn jaccard(&self, other: &Self) -> Result<f64> {
        self.check(other)?;
        let mut equal = 0usize;
        let mut set = 0usize;
        for (a, b) in self.registers.iter().zip(&other.registers) {
            if a.is_finite() || b.is_finite() {
                set += 1;
                equal += (a == b) as usize;
            }
        }
        if set == 0 {
            return Ok(0.0);
        }
        Ok(equal as f64 / set as f64)
    }

    pub fn containment(&self, other: &Self) -> Result<f64> {
        let card = self.cardinality();
        if card == 0.0 {
            return Ok(0.0);
        }
        Ok((self.jaccard(other)? * self.union_cardinality(other)? / card).min(1.0))
    }

    /// Estimate of `|A Δ B| = |A ∪ B| (1 - J)`.
    pub fn symmetric_difference(&self, other: &Self) -> Result<f64> {
        Ok(self.union_cardinality(other)? * (1.0 - self.jaccard(other)?))
    }

    /// Parameters `(a, b)` spreading the observed registers over levels `1..=q`.
    pub fn optimal_parameters(&self, q: u32) -> Result<(f64, f64)> {
        let (min, max) = self
            .registers
            .iter()
            .filter(|x| x.is_finite())
            .fold((f64::INFINITY, 0f64), |(lo, hi), &x| (lo.min(x), hi.max(x)));
        if min.is_infinite() {
            return Err(config_error!("cannot derive parameters from an empty SetSketch"));
        }
        let a = max;
        let b = (a / min).powf(1.0 / q.saturating_sub(1).max(1) as f64);
        if !b.is_finite() || b <= 1.0 {
            return Ok((a, 2.0));
        }
        Ok((a, b))
    }

    /// Quantize to `width` with parameters `(a, b)`.
    pub fn quantize(&self, a: f64, b: f64, width: RegisterWidth) -> Result<SetSketch> {
        let mut out = SetSketch::new(self.m(), width, a, b)?;
        for (i, &x) in self.registers.iter().enumerate() {
            let level = out.level(x);
            out.registers.set(i, level);
        }
        out.refresh();
        Ok(out)
    }
}

impl MergeSketch for CSetSketch {
    fn update(&mut self, value: u64) {
        let m = self.registers.len();
        let scale = 1.0 / m as f64;
        let (mut idx, mut rng) = point_stream(value, m);
        let mut x = next_gap(&mut rng, scale);
        let mut stale_max = false;
        while x <= self.max {
            let reg = self.registers[idx];
            if x < reg {
                self.registers[idx] = x;
                if let Some(ids) = &mut self.ids {
                    ids[idx] = value;
                }
                if let Some(counts) = &mut self.counts {
                    counts[idx] = 1;
                }
                if reg.is_infinite() {
                    self.unset -= 1;
                    if self.unset == 0 {
                        self.refresh();
                    }
                } else if reg == self.max {
                    stale_max = true;
                }
            } else if x == reg
                && let (Some(ids), Some(counts)) = (&self.ids, &mut self.counts)
                && ids[idx] == value
            {
                counts[idx] = counts[idx].saturating_add(1);
            }
            x += next_gap(&mut rng, scale);
            idx = next_register(&mut rng, m);
        }
        if stale_max {
            self.refresh();
        }
    }

    /// Element-wise minimum. Ids follow the winning register; counts of equal
    /// registers with equal ids add up.
    fn merge(&mut self, other: &Self) -> Result<()> {
        self.check(other)?;
        for i in 0..self.registers.len() {
            let (a, b) = (self.registers[i], other.registers[i]);
            if b < a {
                self.registers[i] = b;
                if let (Some(ids), Some(other_ids)) = (&mut self.ids, &other.ids) {
                    ids[i] = other_ids[i];
                }
                if let (Some(counts), Some(other_counts)) = (&mut self.counts, &other.counts) {
                    counts[i] = other_counts[i];
                }
            } else if b == a
                && b.is_finite()
                && let (Some(ids), Some(other_ids)) = (&self.ids, &other.ids)
                && ids[i] == other_ids[i]
                && let (Some(counts), Some(other_counts)) = (&mut self.counts, &other.counts)
            {
                counts[i] = counts[i].saturating_add(other_counts[i]);
            }
        }
        self.refresh();
        Ok(())
    }

    fn cardinality(&self) -> f64 {
        Self::estimate(self.m(), self.registers.iter().sum())
    }

    fn clear(&mut self) {
        self.registers.fill(f64::INFINITY);
        if let Some(ids) = &mut self.ids {
            ids.fill(0);
        }
        if let Some(counts) = &mut self.counts {
            counts.fill(0);
        }
        self.refresh();
    }

    fn is_compatible(&self, other: &Self) -> bool {
        self.m() == other.m()
            && self.ids.is_some() == other.ids.is_some()
            && self.counts.is_some() == other.counts.is_some()
    }
}

fn malformed(msg: String) -> DecodeError {
    DecodeError::OtherString(msg)
}

/// Decode a length-prefixed vector that must hold exactly `len` entries.
/// The length is checked before anything is allocated.
fn decode_exact<T, C, D>(
    decoder: &mut D,
    len: usize,
    what: &str,
) -> std::result::Result<Vec<T>, DecodeError>
where
    T: Decode<C>,
    D: Decoder<Context = C>,
{
    let found = u64::decode(decoder)?;
    if found != len as u64 {
        return Err(malformed(format!(
            "{what} holds {found} entries, expected {len}"
        )));
    }
    decoder.claim_container_read::<T>(len)?;
    let mut out = Vec::with_capacity(len.min(1 << 20));
    for _ in 0..len {
        decoder.unclaim_bytes_read(std::mem::size_of::<T>());
        out.push(T::decode(decoder)?);
    }
    Ok(out)
}

fn decode_optional<T, C, D>(
    decoder: &mut D,
    len: usize,
    what: &str,
) -> std::result::Result<Option<Vec<T>>, DecodeError>
where
    T: Decode<C>,
    D: Decoder<Context = C>,
{
    match u8::decode(decoder)? {
        0 => Ok(None),
        1 => decode_exact(decoder, len, what).map(Some),
        tag => Err(malformed(format!("invalid option tag {tag} for {what}"))),
    }
}

fn decode_m<C, D: Decoder<Context = C>>(
    decoder: &mut D,
) -> std::result::Result<usize, DecodeError> {
    let m = u64::decode(decoder)?;
    usize::try_from(m)
        .ok()
        .filter(|&m| m > 0)
        .ok_or_else(|| malformed(format!("SetSketch cannot have {m} registers")))
}

impl bincode::Encode for CSetSketch {
    fn encode<E: bincode::enc::Encoder>(
        &self,
        encoder: &mut E,
    ) -> std::result::Result<(), bincode::error::EncodeError> {
        bincode::Encode::encode(&(self.m() as u64), encoder)?;
        bincode::Encode::encode(&self.registers, encoder)?;
        bincode::Encode::encode(&self.ids, encoder)?;
        bincode::Encode::encode(&self.counts, encoder)
    }
}

impl<Context> Decode<Context> for CSetSketch {
    fn decode<D: Decoder<Context = Context>>(
        decoder: &mut D,
    ) -> std::result::Result<Self, DecodeError> {
        let m = decode_m(decoder)?;
        let registers: Vec<f64> = decode_exact(decoder, m, "SetSketch registers")?;
        let ids: Option<Vec<u64>> = decode_optional(decoder, m, "SetSketch ids")?;
        let counts: Option<Vec<u32>> = decode_optional(decoder, m, "SetSketch counts")?;
        if counts.is_some() && ids.is_none() {
            return Err(malformed("SetSketch has counts without ids".to_string()));
        }
        if registers.iter().any(|x| x.is_nan() || *x < 0.0) {
            return Err(malformed("SetSketch register out of range".to_string()));
        }
        let mut sketch = CSetSketch {
            registers,
            ids,
            counts,
            max: f64::INFINITY,
            unset: 0,
        };
        sketch.refresh();
        Ok(sketch)
    }
}

bincode::impl_borrow_decode!(CSetSketch);

/// Bits per quantized register.
#[derive(clap::ValueEnum, Clone, Copy, Debug, Eq, PartialEq)]
pub enum RegisterWidth {
    Nibble,
    Byte,
    Half,
}

impl RegisterWidth {
    /// Number of proper levels; `0` and `q + 1` are the sentinels.
    pub fn q(self) -> u32 {
        match self {
            RegisterWidth::Nibble => 14,
            RegisterWidth::Byte => 254,
            RegisterWidth::Half => 65534,
        }
    }

    /// Default `(a, b)`. Every width keeps single elements above level 0;
    /// with `b = 4` the 14 nibble levels reach about `10^7` elements before
    /// overflowing.
    pub fn default_params(self) -> (f64, f64) {
        match self {
            RegisterWidth::Nibble => (20.0, 4.0),
            RegisterWidth::Byte => (20.0, 1.2),
            RegisterWidth::Half => (20.0, 1.001),
        }
    }
}

/// Quantized register storage. Nibbles are packed low nibble first, and the
/// unused high nibble of an odd final byte is zero.
#[derive(bincode::Encode, Clone, Debug, PartialEq, MemSize)]
pub enum Registers {
    Nibble(Vec<u8>),
    Byte(Vec<u8>),
    Half(Vec<u16>),
}

impl Registers {
    fn new(width: RegisterWidth, m: usize) -> Self {
        match width {
            RegisterWidth::Nibble => Registers::Nibble(vec![0; m.div_ceil(2)]),
            RegisterWidth::Byte => Registers::Byte(vec![0; m]),
            RegisterWidth::Half => Registers::Half(vec![0; m]),
        }
    }

    pub fn width(&self) -> RegisterWidth {
        match self {
            Registers::Nibble(_) => RegisterWidth::Nibble,
            Registers::Byte(_) => RegisterWidth::Byte,
            Registers::Half(_) => RegisterWidth::Half,
        }
    }

    /// Decode the registers of a sketch with `m` registers. Same layout as
    /// the derived encoding: a `u32` width tag, then the backing vector.
    fn decode<C, D: Decoder<Context = C>>(
        decoder: &mut D,
        m: usize,
    ) -> std::result::Result<Self, DecodeError> {
        let registers = match u32::decode(decoder)? {
            0 => {
                let cells: Vec<u8> = decode_exact(decoder, m.div_ceil(2), "nibble registers")?;
                if m % 2 == 1 && cells[m / 2] >> 4 != 0 {
                    return Err(malformed(
                        "padding nibble after the last register is not zero".to_string(),
                    ));
                }
                Registers::Nibble(cells)
            }
            1 => Registers::Byte(decode_exact(decoder, m, "byte registers")?),
            2 => Registers::Half(decode_exact(decoder, m, "half registers")?),
            tag => return Err(malformed(format!("unknown register width tag {tag}"))),
        };
        Ok(registers)
    }

    #[inline(always)]
    pub fn get(&self, i: usize) -> u32 {
        match self {
            Registers::Nibble(v) => ((v[i / 2] >> (4 * (i % 2))) & 0xF) as u32,
            Registers::Byte(v) => v[i] as u32,
            Registers::Half(v) => v[i] as u32,
        }
    }

    #[inline(always)]
    fn set(&mut self, i: usize, level: u32) {
        match self {
            Registers::Nibble(v) => {
                let shift = 4 * (i % 2);
                v[i / 2] = (v[i / 2] & !(0xF << shift)) | ((level as u8 & 0xF) << shift);
            }
            Registers::Byte(v) => v[i] = level as u8,
            Registers::Half(v) => v[i] = level as u16,
        }
    }
}

/// Quantized SetSketch.
#[derive(Clone, Debug, PartialEq, MemSize)]
pub struct SetSketch {
    m: usize,
    a: f64,
    b: f64,
    registers: Registers,
    ln_b: f64,
    /// Smallest register level and how many registers hold it.
    low: u32,
    low_count: usize,
}

impl SetSketch {
    pub fn new(m: usize, width: RegisterWidth, a: f64, b: f64) -> Result<Self> {
        Self::check_params(m, a, b)?;
        Ok(Self::from_parts(m, a, b, Registers::new(width, m)))
    }

    fn check_params(m: usize, a: f64, b: f64) -> Result<()> {
        if m == 0 {
            return Err(config_error!("SetSketch needs at least one register"));
        }
        if !(a.is_finite() && a > 0.0) {
            return Err(config_error!("SetSketch parameter a = {a} must be positive"));
        }
        if !(b.is_finite() && b > 1.0) {
            return Err(config_error!("SetSketch parameter b = {b} must exceed 1"));
        }
        Ok(())
    }

    fn from_parts(m: usize, a: f64, b: f64, registers: Registers) -> Self {
        let mut sketch = Self {
            m,
            a,
            b,
            registers,
            ln_b: b.ln(),
            low: 0,
            low_count: m,
        };
        sketch.refresh();
        sketch
    }

    pub fn with_defaults(m: usize, width: RegisterWidth) -> Result<Self> {
        let (a, b) = width.default_params();
        Self::new(m, width, a, b)
    }

    pub fn m(&self) -> usize {
        self.m
    }

    pub fn a(&self) -> f64 {
        self.a
    }

    pub fn b(&self) -> f64 {
        self.b
    }

    pub fn width(&self) -> RegisterWidth {
        self.registers.width()
    }

    pub fn q(&self) -> u32 {
        self.width().q()
    }

    pub fn register(&self, i: usize) -> u32 {
        self.registers.get(i)
    }

    pub fn levels(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.m).map(|i| self.registers.get(i))
    }

    /// Registers at the overflow sentinel `q + 1`.
    pub fn overflow_count(&self) -> usize {
        let top = self.q() + 1;
        self.levels().filter(|&l| l == top).count()
    }

    /// Level of a continuous register value; `+inf` maps to 0.
    #[inline(always)]
    pub fn level(&self, x: f64) -> u32 {
        if x.is_infinite() {
            return 0;
        }
        let level = (1.0 - (x / self.a).ln() / self.ln_b).floor();
        level.clamp(0.0, (self.q() + 1) as f64) as u32
    }

    fn refresh(&mut self) {
        let low = self.levels().min().unwrap_or(0);
        self.low = low;
        self.low_count = self.levels().filter(|&l| l == low).count();
    }

    fn check(&self, other: &Self) -> Result<()> {
        if !self.is_compatible(other) {
            return Err(config_error!(
                "SetSketch mismatch: m={} {:?} a={} b={} vs m={} {:?} a={} b={}",
                self.m,
                self.width(),
                self.a,
                self.b,
                other.m,
                other.width(),
                other.a,
                other.b
            ));
        }
        Ok(())
    }

    /// A register stays at level 0 with probability `exp(-n a)`. While some
    /// do, `n` is estimated from their fraction instead of the level sum.
    fn estimate(&self, levels: impl Iterator<Item = u32>) -> f64 {
        let mut zeros = 0usize;
        let mut sum = 0f64;
        for k in levels {
            zeros += (k == 0) as usize;
            sum += self.b.powi(-(k as i32));
        }
        if zeros == self.m {
            return 0.0;
        }
        if zeros > 0 {
            return (self.m as f64 / zeros as f64).ln() / self.a;
        }
        self.m as f64 * (1.0 - 1.0 / self.b) / (self.a * self.ln_b * sum)
    }

    pub fn union_cardinality(&self, other: &Self) -> Result<f64> {
        self.check(other)?;
        Ok(self.estimate(self.levels().zip(other.levels()).map(|(x, y)| x.max(y))))
    }

    /// Jaccard index by inclusion-exclusion on the estimates.
    pub fn jaccard(&self, other: &Self) -> Result<f64> {
        let union = self.union_cardinality(other)?;
        if union == 0.0 {
            return Ok(0.0);
        }
        let intersection = self.cardinality() + other.cardinality() - union;
        Ok((intersection / union).clamp(0.0, 1.0))
    }

    pub fn containment(&self, other: &Self) -> Result<f64> {
        let card = self.cardinality();
        if card == 0.0 {
            return Ok(0.0);
        }
        Ok((self.jaccard(other)? * self.union_cardinality(other)? / card).min(1.0))
    }

    pub fn symmetric_difference(&self, other: &Self) -> Result<f64> {
        Ok(self.union_cardinality(other)? * (1.0 - self.jaccard(other)?))
    }
}

impl MergeSketch for SetSketch {
    fn update(&mut self, value: u64) {
        let m = self.m;
        let scale = 1.0 / m as f64;
        let (mut idx, mut rng) = point_stream(value, m);
        let mut x = next_gap(&mut rng, scale);
        loop {
            let level = self.level(x);
            if level <= self.low {
                break;
            }
            let reg = self.registers.get(idx);
            if level > reg {
                self.registers.set(idx, level);
                if reg == self.low {
                    self.low_count -= 1;
                    if self.low_count == 0 {
                        self.refresh();
                    }
                }
            }
            x += next_gap(&mut rng, scale);
            idx = next_register(&mut rng, m);
        }
    }

    fn merge(&mut self, other: &Self) -> Result<()> {
        self.check(other)?;
        for i in 0..self.m {
            let level = other.registers.get(i);
            if level > self.registers.get(i) {
                self.registers.set(i, level);
            }
        }
        self.refresh();
        Ok(())
    }

    fn cardinality(&self) -> f64 {
        self.estimate(self.levels())
    }

    fn clear(&mut self) {
        self.registers = Registers::new(self.width(), self.m);
        self.refresh();
    }

    /// Parameters must agree bit for bit.
    fn is_compatible(&self, other: &Self) -> bool {
        self.m == other.m
            && self.width() == other.width()
            && self.a.to_bits() == other.a.to_bits()
            && self.b.to_bits() == other.b.to_bits()
    }
}

impl bincode::Encode for SetSketch {
    fn encode<E: bincode::enc::Encoder>(
        &self,
        encoder: &mut E,
    ) -> std::result::Result<(), bincode::error::EncodeError> {
        bincode::Encode::encode(&(self.m as u64), encoder)?;
        bincode::Encode::encode(&self.a, encoder)?;
        bincode::Encode::encode(&self.b, encoder)?;
        bincode::Encode::encode(&self.registers, encoder)
    }
}

impl<Context> Decode<Context> for SetSketch {
    fn decode<D: Decoder<Context = Context>>(
        decoder: &mut D,
    ) -> std::result::Result<Self, DecodeError> {
        let m = decode_m(decoder)?;
        let a = f64::decode(decoder)?;
        let b = f64::decode(decoder)?;
        SetSketch::check_params(m, a, b).map_err(|err| malformed(err.to_string()))?;
        let registers = Registers::decode(decoder, m)?;
        let top = registers.width().q() + 1;
        if (0..m).any(|i| registers.get(i) > top) {
            return Err(malformed("SetSketch register level out of range".to_string()));
        }
        Ok(SetSketch::from_parts(m, a, b, registers))
    }
}

bincode::impl_borrow_decode!(SetSketch);
