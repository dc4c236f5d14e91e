//! Opening a configured link
//!
//! [`Link`] turns a [`LinkConfig`] into live objects: one
//! [`RegisterChannel`] per configured channel and the [`Board`], backed
//! either by `/dev/mem` mappings or by simulated register files.

use crate::accumulator::ReceiveAccumulator;
use crate::board::Board;
use crate::channel::{ChannelId, RegisterChannel};
use crate::config::{LinkConfig, ProducerKind};
use crate::error::{LinkError, Result};
use crate::mmio::{MmioWindow, RegisterWindow};
use crate::producer::{EventSource, InterruptEventSource, PollingEventSource, ProducerHandle, UioDevice};
use crate::sim::{SimulatedBoard, SimulatedUart};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use uart54_chip::regs::board;
use uart54_chip::{ParityKind, WordCodec};

/// How often interrupt producers check for a stop request
const IRQ_STOP_CHECK: Duration = Duration::from_millis(100);

/// Register backing of a [`Link`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backing {
    /// Physical registers through the memory device
    Hardware,
    /// In-memory register files
    Simulated,
}

/// Opened channels and board peripherals
#[derive(Debug)]
pub struct Link {
    config: LinkConfig,
    backing: Backing,
    board: Board,
    channels: Vec<Arc<RegisterChannel>>,
    sim_uarts: BTreeMap<ChannelId, Arc<SimulatedUart>>,
    sim_board: Option<Arc<SimulatedBoard>>,
}

impl Link {
    /// Map every configured window from the memory device
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::MapFailed`] if any window cannot be mapped; no
    /// channel is usable in that case.
    pub fn open(config: LinkConfig) -> Result<Self> {
        config.validate()?;
        let board_window: Arc<dyn RegisterWindow> =
            Arc::new(MmioWindow::map(&config.mem_device, config.board.base, board::SPAN)?);
        let board = Self::board_for(&config, board_window)?;

        let channels = config
            .channels
            .iter()
            .map(|ch| {
                let layout = ch.layout();
                let window = MmioWindow::map(&config.mem_device, ch.base, layout.span())?;
                tracing::info!("Channel {} mapped at {:#x}", ch.id, ch.base);
                RegisterChannel::new(ch.id, Arc::new(window), layout).map(Arc::new)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            config,
            backing: Backing::Hardware,
            board,
            channels,
            sim_uarts: BTreeMap::new(),
            sim_board: None,
        })
    }

    /// Back every configured channel with a [`SimulatedUart`]
    ///
    /// # Errors
    ///
    /// Returns an error if a channel layout does not fit the simulated
    /// window.
    pub fn simulated(config: LinkConfig) -> Result<Self> {
        config.validate()?;
        let sim_board = Arc::new(SimulatedBoard::new());
        let board = Self::board_for(&config, sim_board.clone())?;

        let mut sim_uarts = BTreeMap::new();
        let mut channels = Vec::with_capacity(config.channels.len());
        for ch in &config.channels {
            let uart = Arc::new(SimulatedUart::new());
            channels.push(Arc::new(RegisterChannel::new(ch.id, uart.clone(), ch.layout())?));
            sim_uarts.insert(ch.id, uart);
        }
        tracing::info!("Simulated link with {} channels", channels.len());

        Ok(Self {
            config,
            backing: Backing::Simulated,
            board,
            channels,
            sim_uarts,
            sim_board: Some(sim_board),
        })
    }

    fn board_for(config: &LinkConfig, window: Arc<dyn RegisterWindow>) -> Result<Board> {
        Board::new(
            window,
            config.board.base_clock_khz,
            Duration::from_micros(config.board.reset_pulse_us),
        )
    }

    /// Configuration the link was opened with
    #[must_use]
    pub const fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Register backing
    #[must_use]
    pub const fn backing(&self) -> Backing {
        self.backing
    }

    /// Clock/reset block
    #[must_use]
    pub const fn board(&self) -> &Board {
        &self.board
    }

    /// Open channels, in configuration order
    #[must_use]
    pub fn channels(&self) -> &[Arc<RegisterChannel>] {
        &self.channels
    }

    /// Channel `id`
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::UnknownChannel`] if it is not configured.
    pub fn channel(&self, id: ChannelId) -> Result<&Arc<RegisterChannel>> {
        self.channels
            .iter()
            .find(|ch| ch.id() == id)
            .ok_or_else(|| LinkError::unknown_channel(id.to_string()))
    }

    /// Simulated register file behind channel `id`, in simulated mode
    #[must_use]
    pub fn simulated_uart(&self, id: ChannelId) -> Option<&Arc<SimulatedUart>> {
        self.sim_uarts.get(&id)
    }

    /// Simulated clock/reset block, in simulated mode
    #[must_use]
    pub fn simulated_board(&self) -> Option<&Arc<SimulatedBoard>> {
        self.sim_board.as_ref()
    }

    /// Command codec using the configured parity
    #[must_use]
    pub fn codec(&self) -> WordCodec<ParityKind> {
        WordCodec::new(self.config.parity_kind())
    }

    /// One empty accumulator per channel
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Config`] for an invalid capacity.
    pub fn accumulators(&self) -> Result<Vec<Arc<ReceiveAccumulator>>> {
        self.channels
            .iter()
            .map(|ch| {
                ReceiveAccumulator::new(ch.id(), self.config.accumulator.capacity_bytes).map(Arc::new)
            })
            .collect()
    }

    /// Event source for channel `id` as configured
    ///
    /// Simulated channels in interrupt mode use their register file as the
    /// interrupt line.
    ///
    /// # Errors
    ///
    /// Returns an error if the UIO device cannot be opened.
    pub fn event_source(&self, id: ChannelId) -> Result<Box<dyn EventSource>> {
        let wait = self.config.dispatcher.wait_strategy();
        match self.config.producer {
            ProducerKind::Poll => Ok(Box::new(PollingEventSource::new(wait))),
            ProducerKind::Uio => {
                if let Some(uart) = self.sim_uarts.get(&id) {
                    return Ok(Box::new(InterruptEventSource::new(Arc::clone(uart), IRQ_STOP_CHECK)));
                }
                let path = self
                    .config
                    .channel(id)?
                    .uio
                    .as_ref()
                    .ok_or_else(|| LinkError::config(format!("channel {id}: no uio device")))?;
                let line = Arc::new(UioDevice::open(path)?);
                Ok(Box::new(InterruptEventSource::new(line, IRQ_STOP_CHECK)))
            }
        }
    }

    /// Start one producer per accumulator
    ///
    /// # Errors
    ///
    /// Returns an error if a producer cannot be started; producers already
    /// running are stopped.
    pub fn start_producers(&self, accumulators: &[Arc<ReceiveAccumulator>]) -> Result<Vec<ProducerHandle>> {
        accumulators
            .iter()
            .map(|acc| {
                let channel = Arc::clone(self.channel(acc.channel())?);
                self.event_source(acc.channel())?.start(channel, Arc::clone(acc))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use uart54_chip::Word;

    #[test]
    fn simulated_link_has_configured_channels() {
        let link = Link::simulated(LinkConfig::default()).unwrap();
        assert_eq!(link.backing(), Backing::Simulated);
        let ids: Vec<ChannelId> = link.channels().iter().map(|c| c.id()).collect();
        assert_eq!(ids, vec![ChannelId::A, ChannelId::B]);
        assert!(link.simulated_uart(ChannelId::A).is_some());
        assert!(link.channel(ChannelId::D).is_err());
    }

    #[test]
    fn simulated_board_is_driven() {
        let link = Link::simulated(LinkConfig::default()).unwrap();
        link.board().set_clock_khz(25_000).unwrap();
        let writes = link.simulated_board().unwrap().writes();
        assert_eq!(writes, vec![(board::CLOCK_DIVIDER, 1)]);
    }

    #[test]
    fn uio_mode_on_simulation_uses_register_file_as_line() {
        let mut config = LinkConfig::default();
        config.producer = ProducerKind::Uio;
        for ch in &mut config.channels {
            ch.uio = Some("/dev/null".into());
        }
        config.channels[0].irq_offset = Some(0x20);

        let link = Link::simulated(config).unwrap();
        let accs = link.accumulators().unwrap();
        let producers = link.start_producers(&accs).unwrap();
        assert_eq!(producers.len(), 2);

        let uart = link.simulated_uart(ChannelId::A).unwrap();
        uart.inject_rx(Word::from_raw(0x55));
        let a = accs.iter().find(|acc| acc.channel() == ChannelId::A).unwrap();
        let start = Instant::now();
        while a.used() < 8 && start.elapsed() < Duration::from_secs(2) {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(a.used(), 8);
        drop(producers);
        // channel rearm at irq_offset plus the line rearm
        assert!(uart.irq_rearms() >= 2);
    }

    #[test]
    #[ignore = "requires /dev/mem access on the target board"]
    fn open_hardware_link() {
        let link = Link::open(LinkConfig::default()).unwrap();
        assert_eq!(link.backing(), Backing::Hardware);
    }
}
