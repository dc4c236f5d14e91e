//! Configuration-command codec.
//!
//! ```text
//! bits  0..2   command tag (2 = write register)
//! bits  2..10  chip id
//! bits 10..18  register address
//! bits 18..53  data (35 bits)
//! bit  53      parity over bits 0..53
//! ```

use std::fmt;

use crate::parity::{OddParity, ParityScheme};
use crate::word::Word;

/// Command tag for "write register".
pub const TAG_WRITE_REGISTER: u8 = 2;

const TAG_SHIFT: u32 = 0;
const TAG_BITS: u32 = 2;
const CHIP_SHIFT: u32 = 2;
const CHIP_BITS: u32 = 8;
const REG_SHIFT: u32 = 10;
const REG_BITS: u32 = 8;
const DATA_SHIFT: u32 = 18;
const DATA_BITS: u32 = 35;
const PARITY_SHIFT: u32 = 53;

const fn mask(bits: u32) -> u64 {
    (1 << bits) - 1
}

/// Errors from packing or unpacking command words.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// A field value does not fit its bit width.
    InvalidField {
        /// Field name
        field: &'static str,
        /// Rejected value
        value: u64,
        /// Width of the field in bits
        bits: u32,
    },
    /// The word's tag is not "write register".
    NotAConfigCommand {
        /// Tag found in bits 0..2
        tag: u8,
    },
    /// The parity bit does not match the selected scheme.
    ParityMismatch {
        /// Offending word
        word: Word,
        /// Scheme used for the check
        scheme: &'static str,
    },
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidField { field, value, bits } => {
                write!(f, "{field} value {value:#x} does not fit in {bits} bits")
            }
            Self::NotAConfigCommand { tag } => {
                write!(f, "word tag {tag} is not a write-register command")
            }
            Self::ParityMismatch { word, scheme } => {
                write!(f, "{scheme} parity check failed for {word:?}")
            }
        }
    }
}

impl std::error::Error for CodecError {}

/// A "write register" command addressed to one ASIC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigCommand {
    /// Chip id (8 bits)
    pub chip_id: u8,
    /// Register address (8 bits)
    pub register: u8,
    data: u64,
}

impl ConfigCommand {
    /// Build a command, checking every field against its bit width.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidField`] if `chip_id`, `register` or
    /// `data` exceeds 8, 8 or 35 bits respectively.
    pub fn new(chip_id: u64, register: u64, data: u64) -> Result<Self, CodecError> {
        let chip_id = narrow("chip_id", chip_id, CHIP_BITS)?;
        let register = narrow("register", register, REG_BITS)?;
        if data > mask(DATA_BITS) {
            return Err(CodecError::InvalidField {
                field: "data",
                value: data,
                bits: DATA_BITS,
            });
        }
        Ok(Self {
            chip_id,
            register,
            data,
        })
    }

    /// 35-bit data field.
    #[must_use]
    pub const fn data(&self) -> u64 {
        self.data
    }

    /// Bits 0..53 of the encoded word, parity excluded.
    #[must_use]
    pub const fn fields(&self) -> u64 {
        ((TAG_WRITE_REGISTER as u64) << TAG_SHIFT)
            | ((self.chip_id as u64) << CHIP_SHIFT)
            | ((self.register as u64) << REG_SHIFT)
            | (self.data << DATA_SHIFT)
    }
}

#[allow(clippy::cast_possible_truncation)]
fn narrow(field: &'static str, value: u64, bits: u32) -> Result<u8, CodecError> {
    if value > mask(bits) {
        return Err(CodecError::InvalidField { field, value, bits });
    }
    Ok(value as u8)
}

/// Packs and unpacks configuration commands with a chosen parity scheme.
#[derive(Debug, Clone, Copy, Default)]
pub struct WordCodec<P = OddParity> {
    parity: P,
}

impl<P: ParityScheme> WordCodec<P> {
    /// Codec using `parity` for the command parity bit.
    pub const fn new(parity: P) -> Self {
        Self { parity }
    }

    /// The parity scheme in use.
    pub const fn parity(&self) -> &P {
        &self.parity
    }

    /// Encode a validated command, inserting the parity bit.
    pub fn encode(&self, command: &ConfigCommand) -> Word {
        let fields = command.fields();
        let parity = u64::from(self.parity.parity_bit(fields));
        Word::from_raw(fields | (parity << PARITY_SHIFT))
    }

    /// Validate and encode a "write register" command.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidField`] if any field exceeds its width.
    pub fn encode_config_command(
        &self,
        chip_id: u64,
        register: u64,
        data: u64,
    ) -> Result<Word, CodecError> {
        ConfigCommand::new(chip_id, register, data).map(|cmd| self.encode(&cmd))
    }

    /// Whether the word's parity bit matches its fields.
    pub fn parity_ok(&self, word: Word) -> bool {
        let raw = word.raw();
        let fields = raw & mask(PARITY_SHIFT);
        self.parity.verify(fields, (raw >> PARITY_SHIFT) & 1 == 1)
    }

    /// Recover the command carried by `word`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::NotAConfigCommand`] for a foreign tag and
    /// [`CodecError::ParityMismatch`] if the parity bit is wrong.
    #[allow(clippy::cast_possible_truncation)]
    pub fn decode_config_command(&self, word: Word) -> Result<ConfigCommand, CodecError> {
        let raw = word.raw();
        let tag = (raw >> TAG_SHIFT & mask(TAG_BITS)) as u8;
        if tag != TAG_WRITE_REGISTER {
            return Err(CodecError::NotAConfigCommand { tag });
        }
        if !self.parity_ok(word) {
            return Err(CodecError::ParityMismatch {
                word,
                scheme: self.parity.name(),
            });
        }
        Ok(ConfigCommand {
            chip_id: (raw >> CHIP_SHIFT & mask(CHIP_BITS)) as u8,
            register: (raw >> REG_SHIFT & mask(REG_BITS)) as u8,
            data: raw >> DATA_SHIFT & mask(DATA_BITS),
        })
    }
}
