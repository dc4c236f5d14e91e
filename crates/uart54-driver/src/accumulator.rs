//! Receive accumulator
//!
//! A bounded byte buffer between the producer that services "word ready"
//! events and the dispatcher that publishes. The producer appends whole
//! words; the dispatcher takes everything accumulated so far in one
//! [`drain`](ReceiveAccumulator::drain), which swaps in an empty buffer and
//! hands the filled one over as [`Bytes`].
//!
//! ```text
//!  EMPTY ──push──▶ ACCUMULATING ──push──▶ FULL (newest words dropped)
//!    ▲                  │                   │
//!    └──────drain───────┴───────drain───────┘
//! ```
//!
//! Append and drain both run under one short mutex, so a reader never sees
//! half a word and a drain never races the cursor.

use crate::channel::ChannelId;
use crate::error::{LinkError, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use uart54_chip::word::WORD_BYTES;
use uart54_chip::Word;

/// What happened to a word offered to the accumulator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Appended
    Stored,
    /// No room; the word was discarded
    Dropped,
}

/// Fill level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulatorState {
    /// Nothing buffered
    Empty,
    /// Holding words with room for more
    Accumulating,
    /// Fewer than 8 bytes free; new words are dropped until the next drain
    Full,
}

/// Words taken out of an accumulator
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Drained {
    bytes: Bytes,
}

impl Drained {
    /// Raw byte image, 8 bytes per word, little-endian
    #[must_use]
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Take the byte image
    #[must_use]
    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }

    /// Number of words drained
    #[must_use]
    pub fn count(&self) -> usize {
        self.bytes.len() / WORD_BYTES
    }

    /// Whether nothing was drained
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Iterate the drained words in arrival order
    pub fn words(&self) -> impl Iterator<Item = Word> + '_ {
        self.bytes.chunks_exact(WORD_BYTES).map(|chunk| {
            let mut raw = [0u8; WORD_BYTES];
            raw.copy_from_slice(chunk);
            Word::from_le_bytes(raw)
        })
    }
}

#[derive(Debug)]
struct Fill {
    buf: Vec<u8>,
    overflowing: bool,
}

/// Bounded per-channel receive buffer
#[derive(Debug)]
pub struct ReceiveAccumulator {
    channel: ChannelId,
    capacity: usize,
    fill: Mutex<Fill>,
    used: AtomicUsize,
    stored_words: AtomicU64,
    dropped_words: AtomicU64,
}

impl ReceiveAccumulator {
    /// Accumulator holding up to `capacity` bytes
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Config`] unless `capacity` is a non-zero multiple
    /// of the word size.
    pub fn new(channel: ChannelId, capacity: usize) -> Result<Self> {
        if capacity == 0 || capacity % WORD_BYTES != 0 {
            return Err(LinkError::config(format!(
                "accumulator capacity {capacity} must be a non-zero multiple of {WORD_BYTES}"
            )));
        }
        Ok(Self {
            channel,
            capacity,
            fill: Mutex::new(Fill {
                buf: Vec::with_capacity(capacity),
                overflowing: false,
            }),
            used: AtomicUsize::new(0),
            stored_words: AtomicU64::new(0),
            dropped_words: AtomicU64::new(0),
        })
    }

    /// Channel this accumulator belongs to
    #[must_use]
    pub const fn channel(&self) -> ChannelId {
        self.channel
    }

    /// Capacity in bytes
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently buffered
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    /// Whether at least one word is buffered
    pub fn has_data(&self) -> bool {
        self.used() > 0
    }

    /// Current fill level
    pub fn state(&self) -> AccumulatorState {
        let used = self.used();
        if used == 0 {
            AccumulatorState::Empty
        } else if self.capacity - used < WORD_BYTES {
            AccumulatorState::Full
        } else {
            AccumulatorState::Accumulating
        }
    }

    /// Words appended since creation
    pub fn stored_words(&self) -> u64 {
        self.stored_words.load(Ordering::Relaxed)
    }

    /// Words discarded for lack of room since creation
    pub fn dropped_words(&self) -> u64 {
        self.dropped_words.load(Ordering::Relaxed)
    }

    /// Append one word's 8 bytes, or drop it if fewer than 8 bytes are free
    pub fn push_word(&self, word: Word) -> PushOutcome {
        let mut fill = self.fill.lock();
        if self.capacity - fill.buf.len() < WORD_BYTES {
            self.dropped_words.fetch_add(1, Ordering::Relaxed);
            if !fill.overflowing {
                fill.overflowing = true;
                tracing::warn!(
                    "Channel {}: accumulator full ({} bytes), dropping words until drained",
                    self.channel,
                    self.capacity
                );
            }
            return PushOutcome::Dropped;
        }
        fill.buf.extend_from_slice(&word.to_le_bytes());
        self.used.store(fill.buf.len(), Ordering::Release);
        self.stored_words.fetch_add(1, Ordering::Relaxed);
        PushOutcome::Stored
    }

    /// Take every buffered word and reset the cursor
    pub fn drain(&self) -> Drained {
        let mut fill = self.fill.lock();
        let buf = std::mem::replace(&mut fill.buf, Vec::with_capacity(self.capacity));
        if fill.overflowing {
            tracing::debug!(
                "Channel {}: drained after overflow, {} words dropped so far",
                self.channel,
                self.dropped_words()
            );
            fill.overflowing = false;
        }
        self.used.store(0, Ordering::Release);
        drop(fill);

        Drained {
            bytes: Bytes::from(buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn word(n: u64) -> Word {
        Word::from_raw(0x8000_0000_0000_0000 | n)
    }

    #[test]
    fn capacity_must_hold_whole_words() {
        assert!(ReceiveAccumulator::new(ChannelId::A, 0).is_err());
        assert!(ReceiveAccumulator::new(ChannelId::A, 12).is_err());
        assert!(ReceiveAccumulator::new(ChannelId::A, 16).is_ok());
    }

    #[test]
    fn drain_preserves_arrival_order() {
        let acc = ReceiveAccumulator::new(ChannelId::A, 8192).unwrap();
        for n in 0..8 {
            assert_eq!(acc.push_word(word(n)), PushOutcome::Stored);
        }
        assert_eq!(acc.used(), 64);
        assert_eq!(acc.state(), AccumulatorState::Accumulating);

        let drained = acc.drain();
        assert_eq!(drained.count(), 8);
        let words: Vec<Word> = drained.words().collect();
        assert_eq!(words, (0..8).map(word).collect::<Vec<_>>());
        assert_eq!(&drained.bytes()[..8], &word(0).to_le_bytes());

        assert_eq!(acc.used(), 0);
        assert_eq!(acc.state(), AccumulatorState::Empty);
        assert!(acc.drain().is_empty());
    }

    #[test]
    fn full_accumulator_drops_newest() {
        let acc = ReceiveAccumulator::new(ChannelId::B, 16).unwrap();
        assert_eq!(acc.push_word(word(1)), PushOutcome::Stored);
        assert_eq!(acc.push_word(word(2)), PushOutcome::Stored);
        assert_eq!(acc.state(), AccumulatorState::Full);
        assert_eq!(acc.push_word(word(3)), PushOutcome::Dropped);
        assert_eq!(acc.used(), 16);
        assert_eq!(acc.dropped_words(), 1);
        assert_eq!(acc.stored_words(), 2);

        let words: Vec<Word> = acc.drain().words().collect();
        assert_eq!(words, vec![word(1), word(2)]);
        assert_eq!(acc.push_word(word(4)), PushOutcome::Stored);
    }

    #[test]
    fn drained_bytes_are_owned_by_caller() {
        let acc = ReceiveAccumulator::new(ChannelId::A, 64).unwrap();
        acc.push_word(word(9));
        let first = acc.drain();
        acc.push_word(word(10));
        assert_eq!(first.words().collect::<Vec<_>>(), vec![word(9)]);
        assert_eq!(acc.drain().words().collect::<Vec<_>>(), vec![word(10)]);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Push(u64),
        Drain,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => any::<u64>().prop_map(Op::Push),
            1 => Just(Op::Drain),
        ]
    }

    proptest! {
        #[test]
        fn drains_keep_arrival_order_within_capacity(
            words in 1usize..=16,
            ops in proptest::collection::vec(op(), 0..200),
        ) {
            let capacity = words * WORD_BYTES;
            let acc = ReceiveAccumulator::new(ChannelId::C, capacity).unwrap();
            let mut expected: Vec<Word> = Vec::new();
            let mut dropped = 0u64;

            for op in ops {
                match op {
                    Op::Push(raw) => {
                        let word = Word::from_raw(raw);
                        let room = capacity - expected.len() * WORD_BYTES >= WORD_BYTES;
                        let outcome = acc.push_word(word);
                        if room {
                            prop_assert_eq!(outcome, PushOutcome::Stored);
                            expected.push(word);
                        } else {
                            prop_assert_eq!(outcome, PushOutcome::Dropped);
                            dropped += 1;
                        }
                    }
                    Op::Drain => {
                        let drained = acc.drain();
                        prop_assert_eq!(drained.words().collect::<Vec<_>>(), std::mem::take(&mut expected));
                        prop_assert_eq!(acc.state(), AccumulatorState::Empty);
                    }
                }
                prop_assert!(acc.used() <= capacity);
                prop_assert_eq!(acc.used(), expected.len() * WORD_BYTES);
                prop_assert_eq!(acc.dropped_words(), dropped);
            }
            prop_assert_eq!(acc.drain().words().collect::<Vec<_>>(), expected);
        }
    }
}
