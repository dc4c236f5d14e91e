//! Link configuration
//!
//! Loaded from TOML. Every field has a default matching the reference
//! board, so an empty file (or no file) describes channels A and B at their
//! usual addresses, polled, publishing on port 5556 with control on 5555.
//!
//! ```toml
//! parity = "odd"
//! producer = "uio"
//!
//! [[channels]]
//! id = "A"
//! base = 0x43c10000
//! uio = "/dev/uio0"
//!
//! [dispatcher]
//! order = "fixed"
//! wait = "spin"
//! ```

use crate::channel::{ChannelId, ChannelLayout};
use crate::dispatcher::{FixedPriority, PollOrder, RoundRobin, WaitStrategy};
use crate::error::{LinkError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uart54_chip::regs::{self, board, channel};
use uart54_chip::word::WORD_BYTES;
use uart54_chip::ParityKind;

/// Environment variable naming a config file
pub const CONFIG_ENV: &str = "UART54_CONFIG";

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LinkConfig {
    /// Physical memory device
    pub mem_device: PathBuf,
    /// Clock/reset block
    pub board: BoardConfig,
    /// Channels to open
    pub channels: Vec<ChannelConfig>,
    /// Receive buffering
    pub accumulator: AccumulatorConfig,
    /// Bound on `send_word` waits
    pub send_timeout_ms: u64,
    /// Bound on receive waits
    pub receive_timeout_ms: u64,
    /// Command word parity
    pub parity: ParitySetting,
    /// Data plane
    pub publisher: PublisherConfig,
    /// Control plane
    pub control: ControlConfig,
    /// Poll loop
    pub dispatcher: DispatcherConfig,
    /// How "word ready" events are detected
    pub producer: ProducerKind,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            mem_device: PathBuf::from("/dev/mem"),
            board: BoardConfig::default(),
            channels: [ChannelId::A, ChannelId::B]
                .into_iter()
                .filter_map(ChannelConfig::default_for)
                .collect(),
            accumulator: AccumulatorConfig::default(),
            send_timeout_ms: 1000,
            receive_timeout_ms: 1000,
            parity: ParitySetting::default(),
            publisher: PublisherConfig::default(),
            control: ControlConfig::default(),
            dispatcher: DispatcherConfig::default(),
            producer: ProducerKind::default(),
        }
    }
}

/// Clock/reset block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BoardConfig {
    /// Physical base address
    pub base: u64,
    /// Divider input clock in kHz
    pub base_clock_khz: u32,
    /// Reset pulse width in microseconds
    pub reset_pulse_us: u64,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            base: board::BASE,
            base_clock_khz: board::BASE_CLOCK_KHZ,
            reset_pulse_us: board::RESET_PULSE_US,
        }
    }
}

/// One channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelConfig {
    /// Channel letter
    pub id: ChannelId,
    /// Physical base address of the channel's window
    pub base: u64,
    /// Receive window offset
    #[serde(default = "default_recv_offset")]
    pub recv_offset: usize,
    /// Send window offset
    #[serde(default = "default_send_offset")]
    pub send_offset: usize,
    /// Start-counter register offset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starts_offset: Option<usize>,
    /// Stop-counter register offset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stops_offset: Option<usize>,
    /// Interrupt control register offset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub irq_offset: Option<usize>,
    /// UIO device delivering this channel's interrupt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uio: Option<PathBuf>,
}

const fn default_recv_offset() -> usize {
    channel::RECV_OFFSET
}

const fn default_send_offset() -> usize {
    channel::SEND_OFFSET
}

impl ChannelConfig {
    /// Reference-board settings for `id`, if it has a known base address
    #[must_use]
    pub fn default_for(id: ChannelId) -> Option<Self> {
        regs::default_channel_base(id.index()).map(|base| Self {
            id,
            base,
            recv_offset: channel::RECV_OFFSET,
            send_offset: channel::SEND_OFFSET,
            starts_offset: None,
            stops_offset: None,
            irq_offset: None,
            uio: None,
        })
    }

    /// Register layout within the channel's window
    #[must_use]
    pub const fn layout(&self) -> ChannelLayout {
        ChannelLayout {
            recv_offset: self.recv_offset,
            send_offset: self.send_offset,
            starts_offset: self.starts_offset,
            stops_offset: self.stops_offset,
            irq_offset: self.irq_offset,
        }
    }
}

/// Receive buffering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AccumulatorConfig {
    /// Bytes per channel
    pub capacity_bytes: usize,
}

impl Default for AccumulatorConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: regs::ACCUMULATOR_BYTES,
        }
    }
}

/// Parity scheme name
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParitySetting {
    /// Odd parity
    #[default]
    Odd,
    /// Even parity
    Even,
}

impl From<ParitySetting> for ParityKind {
    fn from(setting: ParitySetting) -> Self {
        match setting {
            ParitySetting::Odd => Self::Odd,
            ParitySetting::Even => Self::Even,
        }
    }
}

/// Data-plane endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PublisherConfig {
    /// Listen address
    pub bind: String,
    /// A subscriber that cannot take a payload within this long is dropped
    pub write_timeout_ms: u64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:5556".into(),
            write_timeout_ms: 250,
        }
    }
}

impl PublisherConfig {
    /// Per-subscriber write bound
    #[must_use]
    pub const fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

/// Control-plane endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControlConfig {
    /// Listen address
    pub bind: String,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:5555".into(),
        }
    }
}

/// Channel visiting order
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollOrderKind {
    /// A, B, C, D every iteration
    Fixed,
    /// Rotating start
    #[default]
    RoundRobin,
}

/// Idle behaviour of poll loops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitKind {
    /// Busy-poll
    Spin,
    /// Sleep `idle_sleep_us` between empty polls
    #[default]
    Backoff,
}

/// Poll loop settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatcherConfig {
    /// Channel visiting order
    pub order: PollOrderKind,
    /// Idle behaviour
    pub wait: WaitKind,
    /// Backoff sleep in microseconds
    pub idle_sleep_us: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            order: PollOrderKind::default(),
            wait: WaitKind::default(),
            idle_sleep_us: 50,
        }
    }
}

impl DispatcherConfig {
    /// Idle behaviour for the dispatcher and polling producers
    #[must_use]
    pub const fn wait_strategy(&self) -> WaitStrategy {
        match self.wait {
            WaitKind::Spin => WaitStrategy::Spin,
            WaitKind::Backoff => WaitStrategy::Backoff {
                idle_sleep: Duration::from_micros(self.idle_sleep_us),
            },
        }
    }

    /// Channel visiting order
    #[must_use]
    pub fn poll_order(&self) -> Box<dyn PollOrder> {
        match self.order {
            PollOrderKind::Fixed => Box::new(FixedPriority),
            PollOrderKind::RoundRobin => Box::new(RoundRobin::default()),
        }
    }
}

/// "Word ready" detection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProducerKind {
    /// Poll the receive window
    #[default]
    Poll,
    /// Block on each channel's UIO interrupt line
    Uio,
}

impl LinkConfig {
    /// Parse and validate TOML
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Config`] for syntax errors, unknown keys, or a
    /// configuration that fails [`validate`](Self::validate).
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| LinkError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Config`] if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| LinkError::config(format!("Cannot read {}: {e}", path.display())))?;
        let config = Self::from_toml(&text)
            .map_err(|e| LinkError::config(format!("{}: {e}", path.display())))?;
        tracing::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Load from `explicit`, else from `$UART54_CONFIG`, else the defaults
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Config`] if a named file cannot be loaded.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match std::env::var_os(CONFIG_ENV) {
            Some(path) if !path.is_empty() => Self::load(PathBuf::from(path)),
            _ => {
                tracing::debug!("No configuration file, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Check cross-field constraints
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.channels.is_empty() {
            return Err(LinkError::config("no channels configured"));
        }
        let mut seen = BTreeSet::new();
        for ch in &self.channels {
            if !seen.insert(ch.id) {
                return Err(LinkError::config(format!("channel {} configured twice", ch.id)));
            }
            if ch.recv_offset.abs_diff(ch.send_offset) < WORD_BYTES {
                return Err(LinkError::config(format!(
                    "channel {}: send window {:#x} overlaps receive window {:#x}",
                    ch.id, ch.send_offset, ch.recv_offset
                )));
            }
            if self.producer == ProducerKind::Uio && ch.uio.is_none() {
                return Err(LinkError::config(format!(
                    "channel {}: producer = \"uio\" needs a uio device",
                    ch.id
                )));
            }
        }
        let capacity = self.accumulator.capacity_bytes;
        if capacity == 0 || capacity % WORD_BYTES != 0 {
            return Err(LinkError::config(format!(
                "accumulator capacity {capacity} must be a non-zero multiple of {WORD_BYTES}"
            )));
        }
        if self.board.base_clock_khz == 0 {
            return Err(LinkError::config("board base clock must be non-zero"));
        }
        if self.publisher.write_timeout_ms == 0 {
            return Err(LinkError::config("publisher write timeout must be non-zero"));
        }
        Ok(())
    }

    /// Parity scheme for command words
    #[must_use]
    pub fn parity_kind(&self) -> ParityKind {
        self.parity.into()
    }

    /// Bound on `send_word` waits
    #[must_use]
    pub const fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    /// Bound on receive waits
    #[must_use]
    pub const fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    /// Settings for channel `id`
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::UnknownChannel`] if `id` is not configured.
    pub fn channel(&self, id: ChannelId) -> Result<&ChannelConfig> {
        self.channels
            .iter()
            .find(|ch| ch.id == id)
            .ok_or_else(|| LinkError::unknown_channel(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_describe_reference_board() {
        let config = LinkConfig::default();
        config.validate().unwrap();
        assert_eq!(config.channels.len(), 2);
        assert_eq!(config.channels[0].base, 0x43c1_0000);
        assert_eq!(config.channels[1].base, 0x43c2_0000);
        assert_eq!(config.accumulator.capacity_bytes, 8192);
        assert_eq!(config.publisher.bind, "0.0.0.0:5556");
        assert_eq!(config.control.bind, "0.0.0.0:5555");
        assert_eq!(config.parity_kind(), ParityKind::Odd);
        assert_eq!(
            config.dispatcher.wait_strategy(),
            WaitStrategy::Backoff {
                idle_sleep: Duration::from_micros(50)
            }
        );
    }

    #[test]
    fn empty_document_is_the_default() {
        assert_eq!(LinkConfig::from_toml("").unwrap(), LinkConfig::default());
    }

    #[test]
    fn overrides_apply() {
        let config = LinkConfig::from_toml(
            r#"
            parity = "even"
            producer = "uio"
            send_timeout_ms = 10

            [[channels]]
            id = "C"
            base = 0x43c30000
            starts_offset = 0x10
            stops_offset = 0x14
            uio = "/dev/uio2"

            [dispatcher]
            order = "fixed"
            wait = "spin"
            "#,
        )
        .unwrap();
        assert_eq!(config.parity_kind(), ParityKind::Even);
        assert_eq!(config.send_timeout(), Duration::from_millis(10));
        let c = config.channel(ChannelId::C).unwrap();
        assert_eq!(c.layout().starts_offset, Some(0x10));
        assert_eq!(c.send_offset, 8);
        assert_eq!(config.dispatcher.wait_strategy(), WaitStrategy::Spin);
        assert!(config.channel(ChannelId::A).is_err());
    }

    #[test]
    fn invalid_configs_rejected() {
        let dup = r#"
            [[channels]]
            id = "A"
            base = 0
            [[channels]]
            id = "A"
            base = 16
        "#;
        assert!(LinkConfig::from_toml(dup).is_err());
        assert!(LinkConfig::from_toml("channels = []").is_err());
        assert!(LinkConfig::from_toml("[accumulator]\ncapacity_bytes = 12").is_err());
        assert!(LinkConfig::from_toml("[publisher]\nwrite_timeout_ms = 0").is_err());
        assert!(LinkConfig::from_toml("producer = \"uio\"").is_err());
        assert!(LinkConfig::from_toml("bogus = 1").is_err());
        let overlap = r#"
            [[channels]]
            id = "B"
            base = 0
            send_offset = 4
        "#;
        assert!(LinkConfig::from_toml(overlap).is_err());
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "receive_timeout_ms = 250\n[accumulator]\ncapacity_bytes = 64").unwrap();
        let config = LinkConfig::load(file.path()).unwrap();
        assert_eq!(config.receive_timeout(), Duration::from_millis(250));
        assert_eq!(config.accumulator.capacity_bytes, 64);

        assert!(LinkConfig::resolve(Some(Path::new("/nonexistent/uart54.toml"))).is_err());
        assert_eq!(
            LinkConfig::resolve(Some(file.path())).unwrap().accumulator.capacity_bytes,
            64
        );
    }
}
