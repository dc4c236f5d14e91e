//! Stream publisher with single-outstanding-transfer flow control
//!
//! At most one payload is in flight per publisher. The gate is an
//! [`OutstandingTransfer`] token taken by compare-exchange on an atomic flag
//! and released when it drops, which happens right after the completion
//! callback runs on the transport's thread, or when a transport discards the
//! completion. A publish attempted while the token is held is dropped.

use crate::error::Result;
use crate::transport::Transport;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Proof that the caller holds the publisher's single transfer slot
///
/// Releases the slot on drop.
#[derive(Debug)]
#[must_use = "dropping the token releases the transfer slot"]
pub struct OutstandingTransfer {
    busy: Arc<AtomicBool>,
}

impl Drop for OutstandingTransfer {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

/// Result of [`StreamPublisher::try_publish`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Handed to the transport; completion pending
    Scheduled,
    /// Another transfer was outstanding; the payload was dropped
    Busy,
}

/// Publishes drained buffers over a [`Transport`]
#[derive(Debug)]
pub struct StreamPublisher<T> {
    transport: T,
    busy: Arc<AtomicBool>,
    published: AtomicU64,
    busy_drops: AtomicU64,
}

impl<T: Transport> StreamPublisher<T> {
    /// Publisher with no transfer outstanding
    pub fn new(transport: T) -> Self {
        tracing::info!("Stream publisher using {} transport", transport.name());
        Self {
            transport,
            busy: Arc::new(AtomicBool::new(false)),
            published: AtomicU64::new(0),
            busy_drops: AtomicU64::new(0),
        }
    }

    /// Underlying transport
    pub const fn transport(&self) -> &T {
        &self.transport
    }

    /// Whether a transfer is outstanding
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Payloads handed to the transport
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Payloads dropped because a transfer was outstanding
    pub fn busy_drops(&self) -> u64 {
        self.busy_drops.load(Ordering::Relaxed)
    }

    /// Take the transfer slot, or `None` if a transfer is outstanding
    pub fn try_acquire(&self) -> Option<OutstandingTransfer> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| OutstandingTransfer {
                busy: Arc::clone(&self.busy),
            })
    }

    /// Publish `payload` under an already acquired slot
    ///
    /// `on_complete` runs on the transport's thread once the payload is out;
    /// the slot is released immediately after it returns.
    ///
    /// # Errors
    ///
    /// Returns the transport's error if the payload could not be queued. The
    /// slot is released in that case.
    pub fn publish<F>(&self, token: OutstandingTransfer, payload: Bytes, on_complete: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let len = payload.len();
        self.transport.deliver(
            payload,
            Box::new(move || {
                on_complete();
                drop(token);
            }),
        )?;
        self.published.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Published {len} bytes");
        Ok(())
    }

    /// Publish `payload` unless a transfer is already outstanding
    ///
    /// Never blocks. A busy publisher drops the payload and `on_complete`.
    ///
    /// # Errors
    ///
    /// Returns the transport's error if the payload could not be queued.
    pub fn try_publish<F>(&self, payload: Bytes, on_complete: F) -> Result<PublishOutcome>
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(token) = self.try_acquire() else {
            let drops = self.busy_drops.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::debug!("Publisher busy, dropped {} bytes ({drops} total)", payload.len());
            return Ok(PublishOutcome::Busy);
        };
        self.publish(token, payload, on_complete)?;
        Ok(PublishOutcome::Scheduled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LinkError;
    use crate::transport::Completion;
    use parking_lot::Mutex;

    /// Transport that holds completions until the test releases them
    #[derive(Default)]
    struct HeldTransport {
        held: Mutex<Vec<(Bytes, Completion)>>,
    }

    impl std::fmt::Debug for HeldTransport {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("HeldTransport")
                .field("held", &self.held.lock().len())
                .finish()
        }
    }

    impl HeldTransport {
        fn complete_all(&self) -> Vec<Bytes> {
            let held = std::mem::take(&mut *self.held.lock());
            held.into_iter()
                .map(|(payload, done)| {
                    done();
                    payload
                })
                .collect()
        }
    }

    impl Transport for HeldTransport {
        fn deliver(&self, payload: Bytes, done: Completion) -> Result<()> {
            self.held.lock().push((payload, done));
            Ok(())
        }

        fn name(&self) -> &'static str {
            "held"
        }
    }

    #[derive(Debug)]
    struct BrokenTransport;

    impl Transport for BrokenTransport {
        fn deliver(&self, _payload: Bytes, _done: Completion) -> Result<()> {
            Err(LinkError::transport("down"))
        }

        fn name(&self) -> &'static str {
            "broken"
        }
    }

    #[test]
    fn second_publish_is_dropped_until_completion() {
        let publisher = StreamPublisher::new(HeldTransport::default());
        let first = Bytes::from_static(&[1; 8]);
        assert_eq!(
            publisher.try_publish(first.clone(), || {}).unwrap(),
            PublishOutcome::Scheduled
        );
        assert!(publisher.is_busy());
        assert_eq!(
            publisher.try_publish(Bytes::from_static(&[2; 8]), || {}).unwrap(),
            PublishOutcome::Busy
        );
        assert_eq!(publisher.busy_drops(), 1);

        let out = publisher.transport().complete_all();
        assert_eq!(out, vec![first]);
        assert!(!publisher.is_busy());
        assert_eq!(
            publisher.try_publish(Bytes::from_static(&[3; 8]), || {}).unwrap(),
            PublishOutcome::Scheduled
        );
    }

    #[test]
    fn completion_runs_before_slot_is_released() {
        let publisher = Arc::new(StreamPublisher::new(HeldTransport::default()));
        let observed = Arc::new(AtomicBool::new(false));
        let on_complete = {
            let publisher = Arc::clone(&publisher);
            let observed = Arc::clone(&observed);
            move || observed.store(publisher.is_busy(), Ordering::SeqCst)
        };
        publisher.try_publish(Bytes::new(), on_complete).unwrap();
        publisher.transport().complete_all();
        assert!(observed.load(Ordering::SeqCst));
        assert!(!publisher.is_busy());
    }

    #[test]
    fn failed_delivery_releases_slot() {
        let publisher = StreamPublisher::new(BrokenTransport);
        assert!(publisher.try_publish(Bytes::new(), || {}).is_err());
        assert!(!publisher.is_busy());
        assert_eq!(publisher.published(), 0);
    }

    #[test]
    fn acquire_is_exclusive() {
        let publisher = StreamPublisher::new(HeldTransport::default());
        let token = publisher.try_acquire().unwrap();
        assert!(publisher.try_acquire().is_none());
        drop(token);
        assert!(publisher.try_acquire().is_some());
    }
}
