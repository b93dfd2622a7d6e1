use crate::{
    MergeSketch,
    error::{Result, config_error, format_error},
    hash::mix64,
};

pub const MIN_PRECISION: u8 = 4;
pub const MAX_PRECISION: u8 = 18;

/// HyperLogLog with `2^p` one-byte registers.
///
/// The top `p` bits of the mixed value select the register, the register
/// keeps the maximum rank (leading zeros + 1) of the remaining bits.
#[derive(bincode::Encode, bincode::Decode, Clone, Debug, Eq, PartialEq, mem_dbg::MemSize)]
pub struct HyperLogLog {
    p: u8,
    registers: Vec<u8>,
}

impl HyperLogLog {
    pub fn new(p: u8) -> Result<Self> {
        if !(MIN_PRECISION..=MAX_PRECISION).contains(&p) {
            return Err(config_error!(
                "HyperLogLog precision {p} outside {MIN_PRECISION}..={MAX_PRECISION}"
            ));
        }
        Ok(Self {
            p,
            registers: vec![0; 1 << p],
        })
    }

    /// Sketch with `m` registers; `m` must be a power of two.
    pub fn with_registers(m: usize) -> Result<Self> {
        if !m.is_power_of_two() {
            return Err(config_error!(
                "HyperLogLog register count {m} is not a power of two"
            ));
        }
        Self::new(m.trailing_zeros() as u8)
    }

    pub fn precision(&self) -> u8 {
        self.p
    }

    pub fn registers(&self) -> &[u8] {
        &self.registers
    }

    fn max_rank(&self) -> u8 {
        64 - self.p + 1
    }

    fn alpha(&self) -> f64 {
        match self.registers.len() {
            16 => 0.673,
            32 => 0.697,
            64 => 0.709,
            m => 0.7213 / (1.0 + 1.079 / m as f64),
        }
    }

    /// Estimate of `|A ∪ B|` without materializing the union.
    pub fn union_cardinality(&self, other: &Self) -> Result<f64> {
        if !self.is_compatible(other) {
            return Err(config_error!(
                "HyperLogLog precision mismatch: {} vs {}",
                self.p,
                other.p
            ));
        }
        Ok(self.estimate(
            self.registers
                .iter()
                .zip(&other.registers)
                .map(|(a, b)| *a.max(b)),
        ))
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

    fn estimate(&self, registers: impl Iterator<Item = u8>) -> f64 {
        let m = self.registers.len() as f64;
        let mut sum = 0.0;
        let mut zeros = 0usize;
        for r in registers {
            sum += 1.0 / (1u64 << r) as f64;
            zeros += (r == 0) as usize;
        }
        let raw = self.alpha() * m * m / sum;
        if raw <= 2.5 * m && zeros > 0 {
            // Linear counting.
            return m * (m / zeros as f64).ln();
        }
        let two_64 = 2f64.powi(64);
        if raw > two_64 / 30.0 {
            return -two_64 * (1.0 - raw / two_64).ln();
        }
        raw
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if !(MIN_PRECISION..=MAX_PRECISION).contains(&self.p) {
            return Err(format_error!("HyperLogLog precision {} out of range", self.p));
        }
        if self.registers.len() != 1 << self.p {
            return Err(format_error!(
                "HyperLogLog with p={} has {} registers",
                self.p,
                self.registers.len()
            ));
        }
        if let Some(r) = self.registers.iter().find(|&&r| r > self.max_rank()) {
            return Err(format_error!("HyperLogLog register value {r} out of range"));
        }
        Ok(())
    }
}

impl MergeSketch for HyperLogLog {
    #[inline(always)]
    fn update(&mut self, value: u64) {
        let h = mix64(value);
        let idx = (h >> (64 - self.p)) as usize;
        let rest = h << self.p;
        let rank = (rest.leading_zeros() as u8 + 1).min(self.max_rank());
        let reg = &mut self.registers[idx];
        *reg = (*reg).max(rank);
    }

    fn merge(&mut self, other: &Self) -> Result<()> {
        if !self.is_compatible(other) {
            return Err(config_error!(
                "cannot merge HyperLogLog with p={} into p={}",
                other.p,
                self.p
            ));
        }
        for (a, b) in self.registers.iter_mut().zip(&other.registers) {
            *a = (*a).max(*b);
        }
        Ok(())
    }

    fn cardinality(&self) -> f64 {
        self.estimate(self.registers.iter().copied())
    }

    fn clear(&mut self) {
        self.registers.fill(0);
    }

    fn is_compatible(&self, other: &Self) -> bool {
        self.p == other.p
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn filled(p: u8, values: impl Iterator<Item = u64>) -> HyperLogLog {
        let mut hll = HyperLogLog::new(p).unwrap();
        values.for_each(|v| hll.update(v));
        hll
    }

    #[test]
    fn precision_bounds() {
        assert!(HyperLogLog::new(3).is_err());
        assert!(HyperLogLog::new(19).is_err());
        assert!(HyperLogLog::with_registers(1000).is_err());
        assert_eq!(HyperLogLog::with_registers(4096).unwrap().precision(), 12);
    }

    #[test]
    fn empty_is_zero() {
        assert_eq!(HyperLogLog::new(10).unwrap().cardinality(), 0.0);
    }

    #[test]
    fn cardinality_within_error() {
        for n in [100u64, 1000, 10_000, 100_000, 1_000_000] {
            let offset = rand::random::<u64>();
            let hll = filled(12, (0..n).map(|x| x.wrapping_add(offset)));
            let est = hll.cardinality();
            // 1.04/sqrt(4096) = 1.6% standard error.
            let err = (est - n as f64).abs() / n as f64;
            assert!(err < 0.08, "n={n} estimate={est}");
        }
    }

    #[test]
    fn merge_laws() {
        let a = filled(10, 0..5000);
        let b = filled(10, 3000..9000);
        let c = filled(10, 20_000..21_000);

        let mut ab = a.clone();
        ab.merge(&b).unwrap();
        let mut ba = b.clone();
        ba.merge(&a).unwrap();
        assert_eq!(ab, ba);

        let mut ab_c = ab.clone();
        ab_c.merge(&c).unwrap();
        let mut bc = b.clone();
        bc.merge(&c).unwrap();
        let mut a_bc = a.clone();
        a_bc.merge(&bc).unwrap();
        assert_eq!(ab_c, a_bc);

        let mut aa = a.clone();
        aa.merge(&a).unwrap();
        assert_eq!(aa, a);

        // Merging equals sketching the union directly.
        assert_eq!(ab, filled(10, 0..9000));

        assert!(a.clone().merge(&HyperLogLog::new(11).unwrap()).is_err());
    }

    #[test]
    fn updates_are_idempotent() {
        let mut a = filled(8, 0..1000);
        let before = a.clone();
        (0..1000).for_each(|x| a.update(x));
        assert_eq!(a, before);
    }

    #[test]
    fn jaccard_estimate() {
        let a = filled(14, 0..100_000);
        let b = filled(14, 50_000..150_000);
        let j = a.jaccard(&b).unwrap();
        assert!((j - 1.0 / 3.0).abs() < 0.05, "j={j}");
    }

    #[test]
    fn validate_rejects_bad_registers() {
        let mut hll = HyperLogLog::new(4).unwrap();
        hll.registers[0] = 70;
        assert!(hll.validate().is_err());
        hll.registers.pop();
        assert!(hll.validate().is_err());
    }
}
