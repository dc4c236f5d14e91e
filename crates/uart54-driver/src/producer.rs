//! Hardware event sources feeding the accumulators
//!
//! The producer side runs asynchronously to the dispatcher, on its own
//! thread. Whatever wakes it, a polling loop or an interrupt line, ends up
//! in [`service_word_ready`], which moves one word from the receive window
//! into the channel's [`ReceiveAccumulator`].
//!
//! Interrupts reach userspace through Linux UIO: a blocking `read` on
//! `/dev/uioN` returns the interrupt count, and writing `1` re-enables the
//! line. [`InterruptLine`] abstracts that so the same producer runs against
//! [`crate::sim::SimulatedUart`].

use crate::accumulator::{PushOutcome, ReceiveAccumulator};
use crate::channel::{ChannelId, RegisterChannel};
use crate::dispatcher::WaitStrategy;
use crate::error::{LinkError, Result};
use rustix::event::{poll, PollFd, PollFlags};
use std::fmt::Debug;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Result of servicing one "word ready" event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceOutcome {
    /// Word consumed and buffered
    Stored,
    /// Word consumed and acknowledged, but the accumulator was full
    Dropped,
    /// Event fired with the RX ready bit clear
    Spurious,
}

/// Move the waiting word, if any, from the receive window into `accumulator`
///
/// The RX ready bit is cleared whenever a word was present, including when
/// the accumulator has no room: an unacknowledged ready bit would keep the
/// event firing forever. A spurious event leaves the ready bit alone so a
/// word landing just after the check is not lost.
///
/// # Errors
///
/// Returns an error if a register access fails.
pub fn service_word_ready(
    channel: &RegisterChannel,
    accumulator: &ReceiveAccumulator,
) -> Result<ServiceOutcome> {
    let Some(word) = channel.try_receive_word()? else {
        return Ok(ServiceOutcome::Spurious);
    };
    Ok(match accumulator.push_word(word) {
        PushOutcome::Stored => ServiceOutcome::Stored,
        PushOutcome::Dropped => ServiceOutcome::Dropped,
    })
}

/// Counters kept by a running producer
#[derive(Debug, Default)]
pub struct ProducerStats {
    stored: AtomicU64,
    dropped: AtomicU64,
    spurious: AtomicU64,
}

impl ProducerStats {
    fn record(&self, outcome: ServiceOutcome) {
        let counter = match outcome {
            ServiceOutcome::Stored => &self.stored,
            ServiceOutcome::Dropped => &self.dropped,
            ServiceOutcome::Spurious => &self.spurious,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Words buffered
    pub fn stored(&self) -> u64 {
        self.stored.load(Ordering::Relaxed)
    }

    /// Words acknowledged but dropped on overflow
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Events that found no word
    pub fn spurious(&self) -> u64 {
        self.spurious.load(Ordering::Relaxed)
    }
}

/// A running producer thread
///
/// Stopped and joined on [`stop`](ProducerHandle::stop) or drop.
#[derive(Debug)]
pub struct ProducerHandle {
    channel: ChannelId,
    stop: Arc<AtomicBool>,
    stats: Arc<ProducerStats>,
    thread: Option<JoinHandle<()>>,
}

impl ProducerHandle {
    fn spawn<F>(channel: ChannelId, body: F) -> Result<Self>
    where
        F: FnOnce(&AtomicBool, &ProducerStats) + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(ProducerStats::default());
        let thread = {
            let stop = Arc::clone(&stop);
            let stats = Arc::clone(&stats);
            std::thread::Builder::new()
                .name(format!("uart54-rx-{channel}"))
                .spawn(move || body(&stop, &stats))?
        };
        Ok(Self {
            channel,
            stop,
            stats,
            thread: Some(thread),
        })
    }

    /// Channel being serviced
    #[must_use]
    pub const fn channel(&self) -> ChannelId {
        self.channel
    }

    /// Live counters
    #[must_use]
    pub fn stats(&self) -> &ProducerStats {
        &self.stats
    }

    /// Whether the thread is still servicing events
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Ask the thread to stop and wait for it
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("Channel {}: producer thread panicked", self.channel);
            }
        }
    }
}

impl Drop for ProducerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Something that delivers "word ready" events for one channel
pub trait EventSource: Debug + Send {
    /// Start servicing `channel` into `accumulator` on a new thread
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    fn start(
        self: Box<Self>,
        channel: Arc<RegisterChannel>,
        accumulator: Arc<ReceiveAccumulator>,
    ) -> Result<ProducerHandle>;
}

/// Producer that polls the receive window's ready bit
#[derive(Debug, Clone, Copy)]
pub struct PollingEventSource {
    wait: WaitStrategy,
}

impl PollingEventSource {
    /// Poll with `wait` between empty checks
    #[must_use]
    pub const fn new(wait: WaitStrategy) -> Self {
        Self { wait }
    }
}

impl EventSource for PollingEventSource {
    fn start(
        self: Box<Self>,
        channel: Arc<RegisterChannel>,
        accumulator: Arc<ReceiveAccumulator>,
    ) -> Result<ProducerHandle> {
        let id = channel.id();
        let wait = self.wait;
        tracing::info!("Channel {id}: polling producer started ({wait:?})");
        ProducerHandle::spawn(id, move |stop, stats| {
            while !stop.load(Ordering::Acquire) {
                match service_word_ready(&channel, &accumulator) {
                    Ok(ServiceOutcome::Spurious) => wait.idle(),
                    Ok(outcome) => stats.record(outcome),
                    Err(e) => {
                        tracing::error!("Channel {id}: polling producer stopped: {e}");
                        return;
                    }
                }
            }
            tracing::debug!("Channel {id}: polling producer stopped");
        })
    }
}

/// A line that signals "word ready" interrupts
pub trait InterruptLine: Debug + Send + Sync {
    /// Wait up to `timeout` for an interrupt; `Ok(false)` on timeout
    ///
    /// # Errors
    ///
    /// Returns an error if the line cannot be read.
    fn wait(&self, timeout: Duration) -> Result<bool>;

    /// Re-enable the line after servicing
    ///
    /// # Errors
    ///
    /// Returns an error if the line cannot be written.
    fn rearm(&self) -> Result<()>;
}

/// Linux UIO interrupt line (`/dev/uioN`)
#[derive(Debug)]
pub struct UioDevice {
    file: File,
    path: PathBuf,
}

impl UioDevice {
    /// Open a UIO device node
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Config`] if the node cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| LinkError::config(format!("Cannot open {}: {e}", path.display())))?;
        tracing::info!("Opened interrupt line {}", path.display());
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Device node path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl InterruptLine for UioDevice {
    fn wait(&self, timeout: Duration) -> Result<bool> {
        let timeout_ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        let mut fds = [PollFd::new(&self.file, PollFlags::IN)];
        if poll(&mut fds, timeout_ms).map_err(std::io::Error::from)? == 0 {
            return Ok(false);
        }

        let mut count = [0u8; 4];
        let n = rustix::io::read(&self.file, &mut count).map_err(std::io::Error::from)?;
        if n != count.len() {
            return Err(LinkError::transport(format!(
                "short read of {n} bytes from {}",
                self.path.display()
            )));
        }
        tracing::trace!(
            "{}: interrupt #{}",
            self.path.display(),
            u32::from_ne_bytes(count)
        );
        Ok(true)
    }

    fn rearm(&self) -> Result<()> {
        rustix::io::write(&self.file, &1u32.to_ne_bytes()).map_err(std::io::Error::from)?;
        Ok(())
    }
}

/// Producer driven by an [`InterruptLine`]
#[derive(Debug)]
pub struct InterruptEventSource<L> {
    line: Arc<L>,
    stop_check: Duration,
}

impl<L: InterruptLine + 'static> InterruptEventSource<L> {
    /// Service `line`, checking for a stop request every `stop_check`
    pub fn new(line: Arc<L>, stop_check: Duration) -> Self {
        Self { line, stop_check }
    }
}

impl<L: InterruptLine + 'static> EventSource for InterruptEventSource<L> {
    fn start(
        self: Box<Self>,
        channel: Arc<RegisterChannel>,
        accumulator: Arc<ReceiveAccumulator>,
    ) -> Result<ProducerHandle> {
        let id = channel.id();
        let Self { line, stop_check } = *self;
        tracing::info!("Channel {id}: interrupt producer started on {line:?}");
        ProducerHandle::spawn(id, move |stop, stats| {
            let service = || -> Result<()> {
                if line.wait(stop_check)? {
                    let outcome = service_word_ready(&channel, &accumulator)?;
                    if outcome == ServiceOutcome::Spurious {
                        tracing::debug!("Channel {id}: interrupt without RX ready bit");
                    }
                    stats.record(outcome);
                    channel.rearm_interrupt()?;
                    line.rearm()?;
                }
                Ok(())
            };
            while !stop.load(Ordering::Acquire) {
                if let Err(e) = service() {
                    tracing::error!("Channel {id}: interrupt producer stopped: {e}");
                    return;
                }
            }
            tracing::debug!("Channel {id}: interrupt producer stopped");
        })
    }
}

/// Producer fed by a Linux UIO interrupt line
pub type UioEventSource = InterruptEventSource<UioDevice>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelLayout;
    use crate::sim::SimulatedUart;
    use std::time::Instant;
    use uart54_chip::Word;

    fn setup(capacity: usize) -> (Arc<SimulatedUart>, Arc<RegisterChannel>, Arc<ReceiveAccumulator>) {
        let uart = Arc::new(SimulatedUart::new());
        let ch = RegisterChannel::new(ChannelId::A, uart.clone(), ChannelLayout::default())
            .expect("layout fits");
        let acc = ReceiveAccumulator::new(ChannelId::A, capacity).expect("valid capacity");
        (uart, Arc::new(ch), Arc::new(acc))
    }

    fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        cond()
    }

    #[test]
    fn full_accumulator_still_acknowledges() {
        let (uart, ch, acc) = setup(8);
        uart.inject_rx(Word::from_raw(1));
        assert_eq!(service_word_ready(&ch, &acc).unwrap(), ServiceOutcome::Stored);

        uart.inject_rx(Word::from_raw(2));
        assert_eq!(service_word_ready(&ch, &acc).unwrap(), ServiceOutcome::Dropped);
        assert!(!uart.rx_pending(), "ready bit must be cleared on drop");
        assert_eq!(acc.used(), 8);
        assert_eq!(acc.dropped_words(), 1);
    }

    #[test]
    fn spurious_event_leaves_window_alone() {
        let (uart, ch, acc) = setup(64);
        assert_eq!(service_word_ready(&ch, &acc).unwrap(), ServiceOutcome::Spurious);
        assert!(!uart.rx_pending());
        assert!(!acc.has_data());
    }

    #[test]
    fn polling_producer_collects_words() {
        let (uart, ch, acc) = setup(1024);
        let source = Box::new(PollingEventSource::new(WaitStrategy::Spin));
        let mut handle = source.start(ch, acc.clone()).unwrap();
        assert!(handle.is_running());

        for n in 0..16u64 {
            assert!(wait_until(Duration::from_secs(1), || uart.inject_rx(Word::from_raw(n))));
        }
        assert!(wait_until(Duration::from_secs(1), || acc.used() == 16 * 8));
        handle.stop();
        assert!(!handle.is_running());
        assert_eq!(handle.stats().stored(), 16);

        let payloads: Vec<u64> = acc.drain().words().map(Word::payload).collect();
        assert_eq!(payloads, (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn interrupt_producer_rearms_line() {
        let (uart, ch, acc) = setup(1024);
        let source = Box::new(InterruptEventSource::new(
            uart.clone(),
            Duration::from_millis(5),
        ));
        let handle = source.start(ch, acc.clone()).unwrap();

        uart.inject_rx(Word::from_raw(0xabc));
        assert!(wait_until(Duration::from_secs(1), || acc.used() == 8));
        assert!(wait_until(Duration::from_secs(1), || uart.irq_rearms() >= 1));
        drop(handle);

        assert_eq!(acc.drain().words().next().map(Word::payload), Some(0xabc));
    }

    #[test]
    fn missing_uio_device_is_reported() {
        assert!(UioDevice::open("/nonexistent/uio0").is_err());
    }
}
