//! Channel dispatcher
//!
//! One loop fans across every channel's accumulator and feeds the shared
//! [`StreamPublisher`]. Each iteration visits the channels in the order the
//! [`PollOrder`] picks; a channel with buffered words is drained and
//! published only if the publisher's transfer slot is free, so data that
//! cannot be sent stays in its accumulator.
//!
//! [`FixedPriority`] always starts at channel A, which lets a busy early
//! channel starve later ones. [`RoundRobin`] rotates the starting channel
//! every iteration.

use crate::accumulator::ReceiveAccumulator;
use crate::channel::ChannelId;
use crate::error::Result;
use crate::publisher::StreamPublisher;
use crate::transport::Transport;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// What a loop does when it found nothing to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStrategy {
    /// Busy-poll, pinning a core
    Spin,
    /// Sleep between empty polls
    Backoff {
        /// Sleep length
        idle_sleep: Duration,
    },
}

impl Default for WaitStrategy {
    fn default() -> Self {
        Self::Backoff {
            idle_sleep: Duration::from_micros(50),
        }
    }
}

impl WaitStrategy {
    /// Wait once
    pub fn idle(self) {
        match self {
            Self::Spin => std::hint::spin_loop(),
            Self::Backoff { idle_sleep } => std::thread::sleep(idle_sleep),
        }
    }
}

/// Order in which one dispatcher iteration visits the channels
pub trait PollOrder: Debug + Send {
    /// Index of the first channel to visit this iteration
    ///
    /// The remaining channels follow cyclically.
    fn next_start(&mut self, channels: usize) -> usize;
}

/// Always A, B, C, D
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedPriority;

impl PollOrder for FixedPriority {
    fn next_start(&mut self, _channels: usize) -> usize {
        0
    }
}

/// Starting channel advances by one each iteration
#[derive(Debug, Clone, Copy, Default)]
pub struct RoundRobin {
    next: usize,
}

impl PollOrder for RoundRobin {
    fn next_start(&mut self, channels: usize) -> usize {
        if channels == 0 {
            return 0;
        }
        let start = self.next % channels;
        self.next = (start + 1) % channels;
        start
    }
}

/// Dispatcher counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    /// Poll iterations run
    pub iterations: u64,
    /// Buffers handed to the publisher
    pub published: u64,
    /// Iterations that started no transfer
    pub idle_iterations: u64,
}

/// Scheduling loop between accumulators and the publisher
#[derive(Debug)]
pub struct ChannelDispatcher<T> {
    accumulators: Vec<Arc<ReceiveAccumulator>>,
    publisher: Arc<StreamPublisher<T>>,
    order: Box<dyn PollOrder>,
    wait: WaitStrategy,
    stats: DispatcherStats,
}

impl<T: Transport + 'static> ChannelDispatcher<T> {
    /// Dispatcher over `accumulators`, kept in channel order
    pub fn new(
        mut accumulators: Vec<Arc<ReceiveAccumulator>>,
        publisher: Arc<StreamPublisher<T>>,
        order: Box<dyn PollOrder>,
        wait: WaitStrategy,
    ) -> Self {
        accumulators.sort_by_key(|acc| acc.channel());
        Self {
            accumulators,
            publisher,
            order,
            wait,
            stats: DispatcherStats::default(),
        }
    }

    /// Counters so far
    pub const fn stats(&self) -> DispatcherStats {
        self.stats
    }

    /// Channels served
    pub fn channels(&self) -> impl Iterator<Item = ChannelId> + '_ {
        self.accumulators.iter().map(|acc| acc.channel())
    }

    /// Run one iteration; returns the number of transfers started
    ///
    /// # Errors
    ///
    /// Returns the transport's error if a drained buffer could not be
    /// queued. That buffer is lost.
    pub fn poll_once(&mut self) -> Result<usize> {
        self.stats.iterations += 1;
        let n = self.accumulators.len();
        let start = self.order.next_start(n);
        let mut started = 0;

        for i in 0..n {
            let acc = &self.accumulators[(start + i) % n];
            if !acc.has_data() {
                continue;
            }
            let Some(token) = self.publisher.try_acquire() else {
                break;
            };
            let drained = acc.drain();
            let channel = acc.channel();
            let count = drained.count();
            self.publisher.publish(token, drained.into_bytes(), move || {
                tracing::trace!("Channel {channel}: transfer of {count} words complete");
            })?;
            tracing::debug!("Channel {channel}: published {count} words");
            started += 1;
        }

        self.stats.published += started as u64;
        if started == 0 {
            self.stats.idle_iterations += 1;
        }
        Ok(started)
    }

    /// Poll until `cancel` is set
    ///
    /// # Errors
    ///
    /// Stops at the first transport error.
    pub fn run(&mut self, cancel: &AtomicBool) -> Result<DispatcherStats> {
        tracing::info!(
            "Dispatcher started: {} channels, {:?}, {:?}",
            self.accumulators.len(),
            self.order,
            self.wait
        );
        while !cancel.load(Ordering::Acquire) {
            if self.poll_once()? == 0 {
                self.wait.idle();
            }
        }
        tracing::info!("Dispatcher stopped: {:?}", self.stats);
        Ok(self.stats)
    }
}
