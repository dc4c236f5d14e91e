//! In-process publish/subscribe bus

use super::{Completion, DeliveryWorker, Transport};
use crate::error::Result;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};

/// Transport fanning payloads out to in-process subscribers
///
/// Each subscriber gets its own `mpsc` receiver; dropped receivers are
/// pruned on the next delivery.
#[derive(Debug)]
pub struct MemoryBus {
    subscribers: Arc<Mutex<Vec<mpsc::Sender<Bytes>>>>,
    delivered: Arc<AtomicU64>,
    worker: DeliveryWorker,
}

impl MemoryBus {
    /// Start the bus and its delivery thread
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn new() -> Result<Self> {
        let subscribers: Arc<Mutex<Vec<mpsc::Sender<Bytes>>>> = Arc::default();
        let delivered = Arc::new(AtomicU64::new(0));
        let worker = {
            let subscribers = Arc::clone(&subscribers);
            let delivered = Arc::clone(&delivered);
            DeliveryWorker::spawn("uart54-membus", move |payload| {
                subscribers
                    .lock()
                    .retain(|tx| tx.send(payload.clone()).is_ok());
                delivered.fetch_add(1, Ordering::Relaxed);
            })?
        };
        Ok(Self {
            subscribers,
            delivered,
            worker,
        })
    }

    /// Register a subscriber
    pub fn subscribe(&self) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Live subscribers as of the last delivery
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Payloads handed to subscribers so far
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }
}

impl Transport for MemoryBus {
    fn deliver(&self, payload: Bytes, done: Completion) -> Result<()> {
        self.worker.submit(payload, done)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn every_subscriber_sees_each_payload() {
        let bus = MemoryBus::new().unwrap();
        let a = bus.subscribe();
        let b = bus.subscribe();
        let (done_tx, done_rx) = mpsc::channel();
        bus.deliver(
            Bytes::from_static(&[1, 2, 3, 4, 5, 6, 7, 8]),
            Box::new(move || done_tx.send(()).unwrap()),
        )
        .unwrap();

        done_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(a.recv().unwrap().len(), 8);
        assert_eq!(b.recv().unwrap()[7], 8);
        assert_eq!(bus.delivered(), 1);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = MemoryBus::new().unwrap();
        drop(bus.subscribe());
        let keep = bus.subscribe();
        let (done_tx, done_rx) = mpsc::channel();
        bus.deliver(Bytes::from_static(&[0; 8]), Box::new(move || done_tx.send(()).unwrap()))
            .unwrap();
        done_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(bus.subscriber_count(), 1);
        assert!(keep.try_recv().is_ok());
    }
}
