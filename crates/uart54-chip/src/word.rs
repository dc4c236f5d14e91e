//! The 64-bit hardware word.
//!
//! A [`Word`] is an opaque snapshot of one send or receive window. Bit 63 is
//! the hardware-maintained ready bit; bits 0..56 are the payload. Decoding is
//! a pure function over the snapshot and never touches hardware state.

use std::fmt;

/// Size of one hardware word in bytes.
pub const WORD_BYTES: usize = 8;

/// Ready bit (TX-ready on send, RX-data-ready on receive).
pub const READY_BIT: u64 = 1 << 63;

/// Width of the payload in bits.
pub const PAYLOAD_BITS: u32 = 56;

/// Mask selecting the payload bits.
pub const PAYLOAD_MASK: u64 = (1 << PAYLOAD_BITS) - 1;

/// One 64-bit hardware word.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Word(u64);

impl Word {
    /// Wrap a raw 64-bit value.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Assemble a word from its two 32-bit register halves.
    #[must_use]
    pub const fn from_halves(low: u32, high: u32) -> Self {
        Self(((high as u64) << 32) | low as u64)
    }

    /// Raw 64-bit value, status byte included.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Low 32-bit half (register offset 0).
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn low(self) -> u32 {
        self.0 as u32
    }

    /// High 32-bit half (register offset 4).
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn high(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Whether the ready bit is set.
    #[must_use]
    pub const fn is_ready(self) -> bool {
        self.0 & READY_BIT != 0
    }

    /// Payload bits 0..56.
    #[must_use]
    pub const fn payload(self) -> u64 {
        self.0 & PAYLOAD_MASK
    }

    /// Same word with the ready bit cleared.
    ///
    /// Software must present the send window with a clear ready bit; the
    /// hardware owns that bit.
    #[must_use]
    pub const fn with_ready_cleared(self) -> Self {
        Self(self.0 & !READY_BIT)
    }

    /// Byte image as stored in the register window and on the data stream.
    #[must_use]
    pub const fn to_le_bytes(self) -> [u8; WORD_BYTES] {
        self.0.to_le_bytes()
    }

    /// Rebuild a word from its byte image.
    #[must_use]
    pub const fn from_le_bytes(bytes: [u8; WORD_BYTES]) -> Self {
        Self(u64::from_le_bytes(bytes))
    }
}

impl From<u64> for Word {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl From<Word> for u64 {
    fn from(word: Word) -> Self {
        word.0
    }
}

impl fmt::Debug for Word {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Word({:#018x})", self.0)
    }
}

impl fmt::Display for Word {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Split a word snapshot into its ready flag and payload.
#[must_use]
pub const fn decode_word(word: Word) -> (bool, u64) {
    (word.is_ready(), word.payload())
}
