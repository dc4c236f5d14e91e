//! Userspace driver for the UART54 ASIC link.
//!
//! Moves 64-bit hardware words between the programmable-logic register
//! windows of up to four UART54 channels and a publish/subscribe stream,
//! without ever breaking the ready-bit handshake.
//!
//! # Data path
//!
//! ```text
//!  hardware ──▶ RegisterChannel ──▶ ReceiveAccumulator ──▶ StreamPublisher ──▶ subscribers
//!               (ready-bit            (bounded, drained      (one outstanding
//!                handshake)            by swap)               transfer)
//!                      ▲                     ▲                      ▲
//!                EventSource thread    ChannelDispatcher loop ──────┘
//! ```
//!
//! Transmission is the reverse, synchronous path: `WordCodec` encodes a
//! register write, [`RegisterChannel::send_word`] waits (bounded) for the
//! TX ready bit and writes the word.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::atomic::AtomicBool;
//! use std::sync::Arc;
//! use uart54_driver::prelude::*;
//!
//! # fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
//! let config = LinkConfig::resolve(None)?;
//! let link = Link::open(config)?;
//! let accumulators = link.accumulators()?;
//! let _producers = link.start_producers(&accumulators)?;
//!
//! let publisher = Arc::new(StreamPublisher::new(TcpPublisher::bind("0.0.0.0:5556")?));
//! let mut dispatcher = ChannelDispatcher::new(
//!     accumulators,
//!     publisher,
//!     link.config().dispatcher.poll_order(),
//!     link.config().dispatcher.wait_strategy(),
//! );
//! dispatcher.run(&AtomicBool::new(false))?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

pub mod accumulator;
pub mod board;
pub mod channel;
pub mod config;
pub mod control;
pub mod dispatcher;
mod error;
pub mod link;
pub mod mmio;
pub mod producer;
pub mod publisher;
pub mod sim;
pub mod transport;

pub use accumulator::{AccumulatorState, Drained, PushOutcome, ReceiveAccumulator};
pub use board::Board;
pub use channel::{ChannelId, ChannelLayout, LinkStats, RegisterChannel};
pub use config::LinkConfig;
pub use control::{ControlHandler, ControlReply, ControlRequest, ControlServer};
pub use dispatcher::{
    ChannelDispatcher, DispatcherStats, FixedPriority, PollOrder, RoundRobin, WaitStrategy,
};
pub use error::{LinkError, Result, SendError};
pub use link::{Backing, Link};
pub use mmio::{MmioWindow, RegisterWindow};
pub use producer::{
    service_word_ready, EventSource, InterruptEventSource, InterruptLine, PollingEventSource,
    ProducerHandle, ServiceOutcome, UioDevice, UioEventSource,
};
pub use publisher::{OutstandingTransfer, PublishOutcome, StreamPublisher};
pub use sim::{SimulatedBoard, SimulatedUart};
pub use transport::{Completion, MemoryBus, TcpPublisher, Transport};

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        ChannelDispatcher, ChannelId, Link, LinkConfig, LinkError, MemoryBus, ReceiveAccumulator,
        RegisterChannel, Result, SendError, StreamPublisher, TcpPublisher, Transport,
    };
    pub use uart54_chip::{Word, WordCodec};
}
