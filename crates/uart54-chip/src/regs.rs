//! Physical register map of the UART54 programmable-logic block.
//!
//! Every channel exposes two 8-byte windows inside its own 64 KB page: a
//! receive window and a send window. Each window holds one 64-bit word as two
//! little-endian 32-bit halves; the top bit of byte 7 is the ready bit.
//!
//! ```text
//! 0x43c0_0000  board block      clock divider (+0), reset pulse (+4)
//! 0x43c1_0000  channel A        recv (+0), send (+8)
//! 0x43c2_0000  channel B        recv (+0), send (+8)
//! 0x43c3_0000  LED block        (not driven by this crate)
//! ```

// ── Board block ──────────────────────────────────────────────────────────────

/// Clock generator and reset block.
pub mod board {
    /// Physical base address of the board block.
    pub const BASE: u64 = 0x43c0_0000;
    /// Output clock divider register. Holds `divider - 1`.
    pub const CLOCK_DIVIDER: usize = 0x0;
    /// System reset register for the UART and ASIC side. 1 asserts, 0 releases.
    pub const SYSTEM_RESET: usize = 0x4;
    /// Bytes spanned by the board registers.
    pub const SPAN: usize = 0x8;
    /// Reference clock feeding the divider, in kHz (50 MHz).
    pub const BASE_CLOCK_KHZ: u32 = 50_000;
    /// Width of the reset pulse, in microseconds.
    pub const RESET_PULSE_US: u64 = 1000;
}

// ── Channels ─────────────────────────────────────────────────────────────────

/// Per-channel register windows.
pub mod channel {
    /// Physical base of channel A.
    pub const A_BASE: u64 = 0x43c1_0000;
    /// Physical base of channel B.
    pub const B_BASE: u64 = 0x43c2_0000;

    /// Receive window offset from the channel base.
    pub const RECV_OFFSET: usize = 0x0;
    /// Send window offset from the channel base.
    pub const SEND_OFFSET: usize = 0x8;
    /// Bytes spanned by the two windows.
    pub const SPAN: usize = 0x10;

    /// Interrupt control register. Writing 1 acknowledges and re-enables the
    /// receive interrupt.
    pub const IRQ_CONTROL: usize = 0x20;
    /// Bytes spanned when the interrupt control register is mapped too.
    pub const SPAN_WITH_IRQ: usize = 0x24;

    /// Offset of the low 32-bit half inside a window.
    pub const LOW_HALF: usize = 0x0;
    /// Offset of the high 32-bit half inside a window.
    pub const HIGH_HALF: usize = 0x4;
    /// Offset of the byte carrying the ready bit inside a window.
    pub const READY_BYTE: usize = 0x7;
    /// Ready bit as seen in [`READY_BYTE`].
    pub const READY_BYTE_MASK: u8 = 0x80;
    /// Ready bit as seen in the high 32-bit half.
    pub const HIGH_READY_MASK: u32 = 0x8000_0000;
}

// ── Receive buffering ────────────────────────────────────────────────────────

/// Default receive accumulator capacity in bytes (1024 words).
pub const ACCUMULATOR_BYTES: usize = 8 * 1024;

/// Physical window for a channel letter, if the board wires it by default.
#[must_use]
pub const fn default_channel_base(index: usize) -> Option<u64> {
    match index {
        0 => Some(channel::A_BASE),
        1 => Some(channel::B_BASE),
        _ => None,
    }
}
