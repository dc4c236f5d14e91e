//! Simulated UART54 hardware
//!
//! In-memory register files that behave like the programmable-logic block,
//! so the handshake, accumulator, publisher and dispatcher run without a
//! board. Used by the test suite and by `uart54 --simulate`.
//!
//! [`SimulatedUart`] models one channel (receive window at 0, send window
//! at 8, interrupt control at 0x20):
//!
//! - the "hardware" side injects RX words with [`SimulatedUart::inject_rx`],
//!   which sets the RX ready bit and raises the interrupt line;
//! - a write to the send window's high half is the accepted transfer: the
//!   word is logged and, while the transmitter is marked ready, the TX ready
//!   bit is asserted again straight away.

use crate::error::Result;
use crate::mmio::{check_bounds, RegisterWindow};
use crate::producer::InterruptLine;
use parking_lot::{Condvar, Mutex};
use std::time::Duration;
use uart54_chip::regs::{board, channel};
use uart54_chip::Word;

const RX_READY: usize = channel::RECV_OFFSET + channel::READY_BYTE;
const TX_READY: usize = channel::SEND_OFFSET + channel::READY_BYTE;
const TX_HIGH: usize = channel::SEND_OFFSET + channel::HIGH_HALF;

#[derive(Debug)]
struct UartState {
    regs: [u8; channel::SPAN_WITH_IRQ],
    tx_ready: bool,
    transmitted: Vec<Word>,
    rx_overruns: u64,
    irq_pending: bool,
    irq_rearms: u64,
}

impl UartState {
    fn set_tx_ready_bit(&mut self, ready: bool) {
        if ready {
            self.regs[TX_READY] |= channel::READY_BYTE_MASK;
        } else {
            self.regs[TX_READY] &= !channel::READY_BYTE_MASK;
        }
    }

    fn word_at(&self, window: usize) -> Word {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.regs[window..window + 8]);
        Word::from_le_bytes(bytes)
    }
}

/// One simulated UART54 channel
#[derive(Debug)]
pub struct SimulatedUart {
    state: Mutex<UartState>,
    irq: Condvar,
}

impl Default for SimulatedUart {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedUart {
    /// Idle channel with the transmitter ready
    #[must_use]
    pub fn new() -> Self {
        let mut state = UartState {
            regs: [0; channel::SPAN_WITH_IRQ],
            tx_ready: true,
            transmitted: Vec::new(),
            rx_overruns: 0,
            irq_pending: false,
            irq_rearms: 0,
        };
        state.set_tx_ready_bit(true);
        Self {
            state: Mutex::new(state),
            irq: Condvar::new(),
        }
    }

    /// Deliver a word from the ASIC side
    ///
    /// Returns `false` (and counts an overrun) if the previous word has not
    /// been consumed yet; the pending word is left untouched.
    pub fn inject_rx(&self, word: Word) -> bool {
        let mut state = self.state.lock();
        if state.regs[RX_READY] & channel::READY_BYTE_MASK != 0 {
            state.rx_overruns += 1;
            return false;
        }
        let raw = Word::from_raw(word.raw() | uart54_chip::word::READY_BIT).to_le_bytes();
        let rx = channel::RECV_OFFSET;
        state.regs[rx..rx + 8].copy_from_slice(&raw);
        state.irq_pending = true;
        drop(state);
        self.irq.notify_all();
        true
    }

    /// Whether an RX word is waiting to be consumed
    pub fn rx_pending(&self) -> bool {
        self.state.lock().regs[RX_READY] & channel::READY_BYTE_MASK != 0
    }

    /// Assert or hold off the transmitter
    pub fn set_tx_ready(&self, ready: bool) {
        let mut state = self.state.lock();
        state.tx_ready = ready;
        state.set_tx_ready_bit(ready);
    }

    /// Words accepted by the transmitter so far
    pub fn transmitted(&self) -> Vec<Word> {
        self.state.lock().transmitted.clone()
    }

    /// Drain the transmit log
    pub fn take_transmitted(&self) -> Vec<Word> {
        std::mem::take(&mut self.state.lock().transmitted)
    }

    /// Words lost because software had not cleared the RX ready bit in time
    pub fn rx_overruns(&self) -> u64 {
        self.state.lock().rx_overruns
    }

    /// Number of times software re-armed the receive interrupt
    pub fn irq_rearms(&self) -> u64 {
        self.state.lock().irq_rearms
    }

    /// Preload the statistics counters at `offset` (within the 0x24 window)
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::OutOfBounds`](crate::LinkError::OutOfBounds) past the window.
    pub fn set_register(&self, offset: usize, value: u32) -> Result<()> {
        check_bounds(offset, 4, self.len())?;
        let mut state = self.state.lock();
        state.regs[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }
}

impl RegisterWindow for SimulatedUart {
    fn len(&self) -> usize {
        channel::SPAN_WITH_IRQ
    }

    fn read_u8(&self, offset: usize) -> Result<u8> {
        check_bounds(offset, 1, self.len())?;
        Ok(self.state.lock().regs[offset])
    }

    fn write_u8(&self, offset: usize, value: u8) -> Result<()> {
        check_bounds(offset, 1, self.len())?;
        self.state.lock().regs[offset] = value;
        Ok(())
    }

    fn read_u32(&self, offset: usize) -> Result<u32> {
        check_bounds(offset, 4, self.len())?;
        let state = self.state.lock();
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&state.regs[offset..offset + 4]);
        Ok(u32::from_le_bytes(bytes))
    }

    fn write_u32(&self, offset: usize, value: u32) -> Result<()> {
        check_bounds(offset, 4, self.len())?;
        let mut state = self.state.lock();
        state.regs[offset..offset + 4].copy_from_slice(&value.to_le_bytes());

        match offset {
            TX_HIGH => {
                let word = state.word_at(channel::SEND_OFFSET);
                state.transmitted.push(word);
                let ready = state.tx_ready;
                state.set_tx_ready_bit(ready);
            }
            channel::IRQ_CONTROL if value & 1 != 0 => {
                state.irq_rearms += 1;
            }
            _ => {}
        }
        Ok(())
    }
}

impl InterruptLine for SimulatedUart {
    fn wait(&self, timeout: Duration) -> Result<bool> {
        let mut state = self.state.lock();
        if !state.irq_pending {
            let _ = self.irq.wait_for(&mut state, timeout);
        }
        Ok(std::mem::take(&mut state.irq_pending))
    }

    fn rearm(&self) -> Result<()> {
        self.write_u32(channel::IRQ_CONTROL, 1)
    }
}

/// Simulated clock/reset block
///
/// Registers hold the last value written; every write is also logged.
#[derive(Debug, Default)]
pub struct SimulatedBoard {
    state: Mutex<BoardState>,
}

#[derive(Debug, Default)]
struct BoardState {
    regs: [u8; board::SPAN],
    writes: Vec<(usize, u32)>,
}

impl SimulatedBoard {
    /// Board with all registers zero
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every 32-bit write as `(offset, value)`, oldest first
    pub fn writes(&self) -> Vec<(usize, u32)> {
        self.state.lock().writes.clone()
    }
}

impl RegisterWindow for SimulatedBoard {
    fn len(&self) -> usize {
        board::SPAN
    }

    fn read_u8(&self, offset: usize) -> Result<u8> {
        check_bounds(offset, 1, self.len())?;
        Ok(self.state.lock().regs[offset])
    }

    fn write_u8(&self, offset: usize, value: u8) -> Result<()> {
        check_bounds(offset, 1, self.len())?;
        self.state.lock().regs[offset] = value;
        Ok(())
    }

    fn read_u32(&self, offset: usize) -> Result<u32> {
        check_bounds(offset, 4, self.len())?;
        let state = self.state.lock();
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&state.regs[offset..offset + 4]);
        Ok(u32::from_le_bytes(bytes))
    }

    fn write_u32(&self, offset: usize, value: u32) -> Result<()> {
        check_bounds(offset, 4, self.len())?;
        let mut state = self.state.lock();
        state.regs[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        state.writes.push((offset, value));
        Ok(())
    }
}
