//! Silicon model for the UART54 ASIC link.
//!
//! This crate has **no dependencies** and **no hardware access**. It is a
//! pure model of the link: physical register addresses, the 64-bit word
//! layout with its hardware-owned ready bit, and the configuration-command
//! codec.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`regs`] | Physical map of the board block and the per-channel send/receive windows |
//! | [`word`] | [`Word`] and the ready-bit layout shared by both directions |
//! | [`codec`] | [`ConfigCommand`] packing and [`WordCodec`] |
//! | [`parity`] | Pluggable [`ParityScheme`] for the command parity bit |
//!
//! # Word layout
//!
//! ```text
//!  63 62        56 55   54 53 52                 18 17       10 9        2 1   0
//! ┌──┬───────────┬────────┬──┬──────────────────────┬───────────┬──────────┬─────┐
//! │RD│  status   │ unused │P │      data (35)       │  reg (8)  │ chip (8) │ tag │
//! └──┴───────────┴────────┴──┴──────────────────────┴───────────┴──────────┴─────┘
//! ```
//!
//! `RD` is the hardware ready bit: TX-ready on the send window, RX-data-ready
//! on the receive window. It is metadata, never payload.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod codec;
pub mod parity;
pub mod regs;
pub mod word;

pub use codec::{CodecError, ConfigCommand, WordCodec};
pub use parity::{EvenParity, OddParity, ParityKind, ParityScheme};
pub use word::{decode_word, Word};
