//! Per-channel register handshake
//!
//! Each UART54 channel owns a send window and a receive window. Both carry
//! one 64-bit word as two 32-bit halves with the ready bit in the top bit of
//! byte 7:
//!
//! - **send**: software waits for TX-ready, writes the low half, then the
//!   high half with the ready bit cleared. The hardware accepts the word on
//!   the high-half write and clears TX-ready until the transmitter is free.
//! - **receive**: software waits for RX-ready, reads the payload, then
//!   clears RX-ready exactly once. Until then the location cannot hold a new
//!   word.

use crate::error::{LinkError, Result, SendError};
use crate::mmio::{check_bounds, RegisterWindow};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uart54_chip::regs::channel::{
    HIGH_HALF, HIGH_READY_MASK, LOW_HALF, READY_BYTE, READY_BYTE_MASK, RECV_OFFSET, SEND_OFFSET,
};
use uart54_chip::Word;

/// Channel identity
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum ChannelId {
    /// Channel A
    A,
    /// Channel B
    B,
    /// Channel C
    C,
    /// Channel D
    D,
}

impl ChannelId {
    /// Every channel, in fixed priority order
    pub const ALL: [Self; 4] = [Self::A, Self::B, Self::C, Self::D];

    /// Zero-based index (A = 0)
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Channel for a zero-based index
    #[must_use]
    pub const fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(Self::A),
            1 => Some(Self::B),
            2 => Some(Self::C),
            3 => Some(Self::D),
            _ => None,
        }
    }

    /// Channel letter
    #[must_use]
    pub const fn letter(self) -> char {
        match self {
            Self::A => 'A',
            Self::B => 'B',
            Self::C => 'C',
            Self::D => 'D',
        }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

impl FromStr for ChannelId {
    type Err = LinkError;

    /// Accepts a letter (`A`, `b`) or an index (`0`..`3`)
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Ok(index) = s.parse::<usize>() {
            return Self::from_index(index).ok_or_else(|| LinkError::unknown_channel(s));
        }
        match s.to_ascii_uppercase().as_str() {
            "A" => Ok(Self::A),
            "B" => Ok(Self::B),
            "C" => Ok(Self::C),
            "D" => Ok(Self::D),
            _ => Err(LinkError::unknown_channel(s)),
        }
    }
}

/// Where a channel's registers sit inside its window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelLayout {
    /// Receive window offset
    pub recv_offset: usize,
    /// Send window offset
    pub send_offset: usize,
    /// Start-counter register, if wired
    pub starts_offset: Option<usize>,
    /// Stop-counter register, if wired
    pub stops_offset: Option<usize>,
    /// Interrupt acknowledge/re-enable register, if wired
    pub irq_offset: Option<usize>,
}

impl Default for ChannelLayout {
    fn default() -> Self {
        Self {
            recv_offset: RECV_OFFSET,
            send_offset: SEND_OFFSET,
            starts_offset: None,
            stops_offset: None,
            irq_offset: None,
        }
    }
}

impl ChannelLayout {
    /// Bytes the window must span to cover every configured register
    #[must_use]
    pub fn span(&self) -> usize {
        [
            Some(self.recv_offset + 8),
            Some(self.send_offset + 8),
            self.starts_offset.map(|o| o + 4),
            self.stops_offset.map(|o| o + 4),
            self.irq_offset.map(|o| o + 4),
        ]
        .into_iter()
        .flatten()
        .max()
        .unwrap_or(0)
    }
}

/// Start/stop counters reported by the link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkStats {
    /// Start-bit count
    pub starts: u32,
    /// Stop-bit count
    pub stops: u32,
}

/// One channel's send and receive windows
#[derive(Debug, Clone)]
pub struct RegisterChannel {
    id: ChannelId,
    window: Arc<dyn RegisterWindow>,
    layout: ChannelLayout,
}

impl RegisterChannel {
    /// Bind a channel to its register window
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::OutOfBounds`] if the layout does not fit the
    /// window, or [`LinkError::Config`] if the send and receive windows overlap.
    pub fn new(id: ChannelId, window: Arc<dyn RegisterWindow>, layout: ChannelLayout) -> Result<Self> {
        check_bounds(0, layout.span(), window.len())?;
        if layout.recv_offset.abs_diff(layout.send_offset) < 8 {
            return Err(LinkError::config(format!(
                "channel {id}: send window {:#x} overlaps receive window {:#x}",
                layout.send_offset, layout.recv_offset
            )));
        }
        tracing::debug!(
            "Channel {id}: recv @ {:#x}, send @ {:#x}",
            layout.recv_offset,
            layout.send_offset
        );
        Ok(Self { id, window, layout })
    }

    /// Channel identity
    #[must_use]
    pub const fn id(&self) -> ChannelId {
        self.id
    }

    /// Register layout
    #[must_use]
    pub const fn layout(&self) -> &ChannelLayout {
        &self.layout
    }

    /// Whether the transmitter can accept a word
    ///
    /// # Errors
    ///
    /// Returns an error if the register read fails.
    pub fn tx_ready(&self) -> Result<bool> {
        let status = self.window.read_u8(self.layout.send_offset + READY_BYTE)?;
        Ok(status & READY_BYTE_MASK != 0)
    }

    /// Send one word, waiting at most `timeout` for TX-ready
    ///
    /// Nothing is written unless TX-ready was observed, so a timeout never
    /// leaves a partial word in the send window.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::NotReady`] on timeout; the caller decides whether
    /// to retry.
    pub fn send_word(&self, word: Word, timeout: Duration) -> std::result::Result<(), SendError> {
        let start = Instant::now();
        while !self.tx_ready()? {
            let waited = start.elapsed();
            if waited >= timeout {
                tracing::warn!("Channel {}: timeout waiting for TX ready", self.id);
                return Err(SendError::NotReady {
                    waited_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
                });
            }
            std::hint::spin_loop();
        }
        self.write_send_window(word)?;
        Ok(())
    }

    /// Send one word, spinning until TX-ready with no upper bound
    ///
    /// Opt-in for real-time callers that prefer determinism to a bounded
    /// wait. Hangs if the transmitter never becomes ready.
    ///
    /// # Errors
    ///
    /// Returns an error only if a register access fails.
    pub fn send_word_blocking(&self, word: Word) -> Result<()> {
        while !self.tx_ready()? {
            std::hint::spin_loop();
        }
        self.write_send_window(word)
    }

    /// Send words in order, each with its own `timeout`
    ///
    /// # Errors
    ///
    /// Stops at the first word that cannot be sent.
    pub fn send_words(&self, words: &[Word], timeout: Duration) -> std::result::Result<(), SendError> {
        for &word in words {
            self.send_word(word, timeout)?;
        }
        Ok(())
    }

    fn write_send_window(&self, word: Word) -> Result<()> {
        let base = self.layout.send_offset;
        self.window.write_u32(base + LOW_HALF, word.low())?;
        self.window
            .write_u32(base + HIGH_HALF, word.high() & !HIGH_READY_MASK)?;
        tracing::debug!("Channel {}: sent {word}", self.id);
        Ok(())
    }

    /// Whether a received word is waiting
    ///
    /// # Errors
    ///
    /// Returns an error if the register read fails.
    pub fn is_word_available(&self) -> Result<bool> {
        let status = self.window.read_u8(self.layout.recv_offset + READY_BYTE)?;
        Ok(status & READY_BYTE_MASK != 0)
    }

    /// Consume the waiting word, if any, without blocking
    ///
    /// Reads the high half (ready bit), then the low half, then clears the
    /// ready bit. This is a best-effort consume: the three accesses are not
    /// one hardware transaction, and the ASIC must not present a new word
    /// before the ready bit is cleared.
    ///
    /// # Errors
    ///
    /// Returns an error if a register access fails.
    pub fn try_receive_word(&self) -> Result<Option<Word>> {
        let base = self.layout.recv_offset;
        let high = self.window.read_u32(base + HIGH_HALF)?;
        if high & HIGH_READY_MASK == 0 {
            return Ok(None);
        }
        let low = self.window.read_u32(base + LOW_HALF)?;
        self.acknowledge()?;
        let word = Word::from_halves(low, high);
        tracing::trace!("Channel {}: received {word}", self.id);
        Ok(Some(word))
    }

    /// Clear the RX ready bit without reading the payload
    ///
    /// # Errors
    ///
    /// Returns an error if the register write fails.
    pub fn acknowledge(&self) -> Result<()> {
        self.window
            .write_u8(self.layout.recv_offset + READY_BYTE, 0)
    }

    /// Receive up to `n` words, giving up after `timeout`
    ///
    /// Returns fewer than `n` words if the deadline passes first; words
    /// already consumed are never discarded.
    ///
    /// # Errors
    ///
    /// Returns an error if a register access fails.
    pub fn receive_words(&self, n: usize, timeout: Duration) -> Result<Vec<Word>> {
        let start = Instant::now();
        let mut words = Vec::with_capacity(n);
        while words.len() < n {
            if let Some(word) = self.try_receive_word()? {
                words.push(word);
            } else if start.elapsed() >= timeout {
                tracing::warn!(
                    "Channel {}: receive timeout with {} of {n} words",
                    self.id,
                    words.len()
                );
                break;
            } else {
                std::hint::spin_loop();
            }
        }
        Ok(words)
    }

    /// Receive exactly `n` words, spinning with no upper bound
    ///
    /// Opt-in for real-time callers. Hangs if the ASIC stops sending.
    ///
    /// # Errors
    ///
    /// Returns an error if a register access fails.
    pub fn blocking_receive_words(&self, n: usize) -> Result<Vec<Word>> {
        let mut words = Vec::with_capacity(n);
        while words.len() < n {
            match self.try_receive_word()? {
                Some(word) => words.push(word),
                None => std::hint::spin_loop(),
            }
        }
        Ok(words)
    }

    /// Read the start/stop counters
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::StatsUnavailable`] if the counters are not part
    /// of this channel's layout.
    pub fn read_stats(&self) -> Result<LinkStats> {
        let (Some(starts), Some(stops)) = (self.layout.starts_offset, self.layout.stops_offset)
        else {
            return Err(LinkError::StatsUnavailable {
                channel: self.id.letter(),
            });
        };
        Ok(LinkStats {
            starts: self.window.read_u32(starts)?,
            stops: self.window.read_u32(stops)?,
        })
    }

    /// Acknowledge the receive interrupt and enable the next one
    ///
    /// No-op when the layout has no interrupt control register.
    ///
    /// # Errors
    ///
    /// Returns an error if the register write fails.
    pub fn rearm_interrupt(&self) -> Result<()> {
        match self.layout.irq_offset {
            Some(offset) => self.window.write_u32(offset, 1),
            None => Ok(()),
        }
    }
}
