//! Data-plane transports
//!
//! A [`Transport`] carries one published payload to subscribers and reports
//! completion asynchronously. Payloads are raw runs of 8-byte words with no
//! framing; subscribers treat the length as an implicit multiple of 8.
//!
//! Both transports here hand payloads to a dedicated delivery thread, so
//! completion always fires off the caller's thread.

mod memory;
mod tcp;

pub use memory::MemoryBus;
pub use tcp::TcpPublisher;

use crate::error::{LinkError, Result};
use bytes::Bytes;
use std::fmt::Debug;
use std::sync::mpsc;
use std::thread::JoinHandle;

/// Callback run once a payload has left the transport
pub type Completion = Box<dyn FnOnce() + Send + 'static>;

/// Publish/subscribe sink for drained accumulator data
pub trait Transport: Debug + Send + Sync {
    /// Queue `payload` for delivery and arrange for `done` to run afterwards
    ///
    /// A transport that cannot deliver drops `done` without calling it.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Transport`] if the payload cannot be queued.
    fn deliver(&self, payload: Bytes, done: Completion) -> Result<()>;

    /// Transport name for logs
    fn name(&self) -> &'static str;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn deliver(&self, payload: Bytes, done: Completion) -> Result<()> {
        (**self).deliver(payload, done)
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}

type Job = (Bytes, Completion);

/// Background thread running a sink over queued payloads in order
#[derive(Debug)]
pub(crate) struct DeliveryWorker {
    tx: Option<mpsc::Sender<Job>>,
    thread: Option<JoinHandle<()>>,
}

impl DeliveryWorker {
    pub(crate) fn spawn<F>(name: &str, mut sink: F) -> Result<Self>
    where
        F: FnMut(&Bytes) + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<Job>();
        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                for (payload, done) in rx {
                    sink(&payload);
                    done();
                }
            })?;
        Ok(Self {
            tx: Some(tx),
            thread: Some(thread),
        })
    }

    pub(crate) fn submit(&self, payload: Bytes, done: Completion) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| LinkError::transport("delivery worker stopped"))?;
        tx.send((payload, done))
            .map_err(|_| LinkError::transport("delivery thread exited"))
    }
}

impl Drop for DeliveryWorker {
    fn drop(&mut self) {
        // Closing the queue ends the thread after it finishes queued jobs
        drop(self.tx.take());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("Delivery thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn worker_runs_jobs_in_order_then_completes() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let done = Arc::new(AtomicUsize::new(0));
        let worker = {
            let seen = Arc::clone(&seen);
            DeliveryWorker::spawn("test-delivery", move |p| seen.lock().push(p.clone())).unwrap()
        };
        for n in 0..4u8 {
            let done = Arc::clone(&done);
            worker
                .submit(Bytes::from(vec![n; 8]), Box::new(move || {
                    done.fetch_add(1, Ordering::SeqCst);
                }))
                .unwrap();
        }
        drop(worker);

        assert_eq!(done.load(Ordering::SeqCst), 4);
        let firsts: Vec<u8> = seen.lock().iter().map(|p| p[0]).collect();
        assert_eq!(firsts, vec![0, 1, 2, 3]);
    }
}
