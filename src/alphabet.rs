//! Byte-to-code lookup tables for nucleotide and reduced protein alphabets.
//!
//! An alphabet is given as comma-separated groups of letters; every letter in
//! group `i` maps to code `i`, case-insensitively. All other bytes map to
//! [`INVALID`].

use std::fmt;

use crate::error::{Result, config_error};

/// Code returned for bytes outside the alphabet.
pub const INVALID: u8 = 0xFF;

/// IUPAC ambiguity codes (besides the four bases).
const AMBIGUOUS_DNA: &[u8] = b"NMRWSYKVHDB";

#[derive(Clone, Copy)]
pub struct Alphabet {
    name: &'static str,
    groups: &'static str,
    size: u8,
    complement: bool,
    lut: [u8; 256],
}

const fn count_groups(s: &[u8]) -> u8 {
    let mut n = 1;
    let mut i = 0;
    while i < s.len() {
        if s[i] == b',' {
            n += 1;
        }
        i += 1;
    }
    n
}

const fn build_lut(s: &[u8], protein: bool) -> [u8; 256] {
    let mut lut = [INVALID; 256];
    let mut code = 0u8;
    let mut i = 0;
    while i < s.len() {
        let c = s[i];
        if c == b',' {
            code += 1;
        } else {
            lut[c.to_ascii_uppercase() as usize] = code;
            lut[c.to_ascii_lowercase() as usize] = code;
        }
        i += 1;
    }
    if protein {
        // Pyrrolysine as lysine, selenocysteine as cysteine.
        if lut[b'P' as usize] == INVALID {
            lut[b'P' as usize] = lut[b'K' as usize];
            lut[b'p' as usize] = lut[b'K' as usize];
        }
        if lut[b'U' as usize] == INVALID {
            lut[b'U' as usize] = lut[b'C' as usize];
            lut[b'u' as usize] = lut[b'C' as usize];
        }
    }
    lut
}

impl Alphabet {
    const fn new(name: &'static str, groups: &'static str, protein: bool) -> Self {
        Self {
            name,
            groups,
            size: count_groups(groups.as_bytes()),
            complement: false,
            lut: build_lut(groups.as_bytes(), protein),
        }
    }

    const fn with_complement(mut self) -> Self {
        self.complement = true;
        self
    }

    /// Look up an alphabet by name, case-insensitively.
    pub fn from_name(name: &str) -> Result<Alphabet> {
        let upper = name.to_ascii_uppercase();
        let alphabet = match upper.as_str() {
            "DNA" | "DNA4" => DNA4,
            "DNA5" => DNA5,
            "KETO" => KETO,
            "PURPYR" => PURPYR,
            "AMINO" | "AMINO20" | "PROTEIN" => AMINO20,
            "SEB14" => SEB14,
            "SEB10" => SEB10,
            "SEV10" => SEV10,
            "SOLISD" => SOLISD,
            "SOLISG" => SOLISG,
            "MURPHY" => MURPHY,
            "LIA10" => LIA10,
            "LIB10" => LIB10,
            "SEB8" => SEB8,
            "SEB6" => SEB6,
            "DAYHOFF" => DAYHOFF,
            _ => return Err(config_error!("unknown alphabet {name:?}")),
        };
        Ok(alphabet)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The comma-separated group string this alphabet was built from.
    pub fn groups(&self) -> &'static str {
        self.groups
    }

    /// Number of distinct codes.
    pub fn size(&self) -> u8 {
        self.size
    }

    /// Bits needed to store one code.
    pub fn bits_per_symbol(&self) -> u32 {
        (self.size as u32).next_power_of_two().trailing_zeros().max(1)
    }

    /// Longest k whose packed code still fits in a `u64`.
    pub fn max_k(&self) -> usize {
        64 / self.bits_per_symbol() as usize
    }

    /// Whether codes have a reverse complement (`3 - code`).
    pub fn has_complement(&self) -> bool {
        self.complement
    }

    #[inline(always)]
    pub fn encode(&self, base: u8) -> u8 {
        self.lut[base as usize]
    }

    #[inline(always)]
    pub fn is_valid(&self, base: u8) -> bool {
        self.lut[base as usize] != INVALID
    }

    /// Apply an ambiguity policy. Only meaningful for 2-bit DNA.
    pub fn with_ambiguity(mut self, policy: AmbiguityPolicy) -> Result<Self> {
        match policy {
            AmbiguityPolicy::Skip => Ok(self),
            AmbiguityPolicy::MapTo(code) => {
                if !self.complement {
                    return Err(config_error!(
                        "ambiguity mapping is only supported for 2-bit DNA, not {}",
                        self.name
                    ));
                }
                if code >= self.size {
                    return Err(config_error!(
                        "ambiguous bases mapped to code {code}, but {} only has {} codes",
                        self.name,
                        self.size
                    ));
                }
                for &b in AMBIGUOUS_DNA {
                    self.lut[b as usize] = code;
                    self.lut[b.to_ascii_lowercase() as usize] = code;
                }
                Ok(self)
            }
        }
    }
}

impl fmt::Debug for Alphabet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Alphabet")
            .field("name", &self.name)
            .field("groups", &self.groups)
            .finish()
    }
}

impl PartialEq for Alphabet {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.lut == other.lut
    }
}

impl Eq for Alphabet {}

/// What to do with IUPAC ambiguity codes in DNA input.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum AmbiguityPolicy {
    /// Treat them as invalid: the k-mer window restarts after them.
    #[default]
    Skip,
    /// Replace them with a fixed code.
    MapTo(u8),
}

pub const DNA4: Alphabet = Alphabet::new("DNA4", "A,C,G,T", false).with_complement();
pub const DNA5: Alphabet = Alphabet::new("DNA5", "A,C,G,T,NMRWSYKVHDB", false);
/// Amino/keto reduction.
pub const KETO: Alphabet = Alphabet::new("KETO", "ACM,KGT", false);
/// Purine/pyrimidine reduction.
pub const PURPYR: Alphabet = Alphabet::new("PURPYR", "AGR,YCT", false);

pub const AMINO20: Alphabet =
    Alphabet::new("AMINO20", "A,C,D,E,F,G,H,I,K,L,M,N,P,Q,R,S,T,V,W,Y", true);
pub const SEB14: Alphabet = Alphabet::new("SEB14", "A,C,D,EQ,FY,G,H,IV,KR,LM,N,P,ST,W", true);
pub const SEB10: Alphabet = Alphabet::new("SEB10", "AST,C,DN,EQ,FY,G,HW,ILMV,KR,P", true);
pub const SEV10: Alphabet = Alphabet::new("SEV10", "AST,C,DEN,FY,G,H,ILMV,KQR,P,W", true);
pub const SOLISD: Alphabet = Alphabet::new("SOLISD", "AM,C,DNS,EKQR,F,GP,HT,IV,LY,W", true);
pub const SOLISG: Alphabet = Alphabet::new("SOLISG", "AEFIKLMQRVW,C,D,G,H,N,P,S,T,Y", true);
pub const MURPHY: Alphabet = Alphabet::new("MURPHY", "A,C,DENQ,FWY,G,H,ILMV,KR,P,ST", true);
pub const LIA10: Alphabet = Alphabet::new("LIA10", "AC,DE,FWY,G,HN,IV,KQR,LM,P,ST", true);
pub const LIB10: Alphabet = Alphabet::new("LIB10", "AST,C,DEQ,FWY,G,HN,IV,KR,LM,P", true);
pub const SEB8: Alphabet = Alphabet::new("SEB8", "AST,C,DHN,EKQR,FWY,G,ILMV,P", true);
pub const SEB6: Alphabet = Alphabet::new("SEB6", "AST,CP,DHNEKQR,FWY,G,ILMV", true);
/// Dayhoff's six classes, the 3-bit grouped reduction.
pub const DAYHOFF: Alphabet = Alphabet::new("DAYHOFF", "AGPST,C,DENQ,FWY,HKR,ILMV", true);
