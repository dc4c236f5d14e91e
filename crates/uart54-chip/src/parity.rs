//! Parity bit for configuration commands.
//!
//! The ASIC checks one parity bit (bit 53) over the preceding command
//! fields. The exact scheme has not been confirmed against the ASIC
//! datasheet, so it is kept behind [`ParityScheme`] and selected at runtime.

use std::fmt::Debug;

/// Computes the parity bit for the 53 field bits of a command word.
pub trait ParityScheme: Debug + Send + Sync {
    /// Parity bit for `fields` (bits 0..53; higher bits are ignored).
    fn parity_bit(&self, fields: u64) -> bool;

    /// Short name used in logs and configuration.
    fn name(&self) -> &'static str;

    /// Whether `parity` is the correct bit for `fields`.
    fn verify(&self, fields: u64, parity: bool) -> bool {
        self.parity_bit(fields) == parity
    }
}

const FIELD_MASK: u64 = (1 << 53) - 1;

/// Parity bit chosen so that bits 0..=53 hold an odd number of ones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OddParity;

impl ParityScheme for OddParity {
    fn parity_bit(&self, fields: u64) -> bool {
        (fields & FIELD_MASK).count_ones() % 2 == 0
    }

    fn name(&self) -> &'static str {
        "odd"
    }
}

/// Parity bit chosen so that bits 0..=53 hold an even number of ones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvenParity;

impl ParityScheme for EvenParity {
    fn parity_bit(&self, fields: u64) -> bool {
        (fields & FIELD_MASK).count_ones() % 2 == 1
    }

    fn name(&self) -> &'static str {
        "even"
    }
}

/// Runtime selection of a built-in scheme.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ParityKind {
    /// [`OddParity`]
    #[default]
    Odd,
    /// [`EvenParity`]
    Even,
}

impl ParityScheme for ParityKind {
    fn parity_bit(&self, fields: u64) -> bool {
        match self {
            Self::Odd => OddParity.parity_bit(fields),
            Self::Even => EvenParity.parity_bit(fields),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Odd => OddParity.name(),
            Self::Even => EvenParity.name(),
        }
    }
}

impl std::str::FromStr for ParityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "odd" => Ok(Self::Odd),
            "even" => Ok(Self::Even),
            other => Err(format!("unknown parity scheme '{other}' (expected odd or even)")),
        }
    }
}
