//! TCP data-plane publisher
//!
//! Subscribers connect to the data port and receive every payload as a raw
//! byte stream. A subscriber whose socket fails, or that cannot take a
//! payload within the write timeout, is dropped.

use super::{Completion, DeliveryWorker, Transport};
use crate::error::{LinkError, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use std::io::{ErrorKind, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const ACCEPT_POLL: Duration = Duration::from_millis(20);

const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_millis(250);

/// Transport writing payloads to every connected TCP subscriber
#[derive(Debug)]
pub struct TcpPublisher {
    local_addr: SocketAddr,
    subscribers: Arc<Mutex<Vec<TcpStream>>>,
    stop: Arc<AtomicBool>,
    acceptor: Option<JoinHandle<()>>,
    worker: DeliveryWorker,
}

impl TcpPublisher {
    /// Bind the data port and start accepting subscribers
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Transport`] if the address cannot be bound.
    pub fn bind(addr: impl ToSocketAddrs) -> Result<Self> {
        Self::bind_with_write_timeout(addr, DEFAULT_WRITE_TIMEOUT)
    }

    /// Like [`bind`](Self::bind), evicting any subscriber that blocks a
    /// payload write for longer than `write_timeout`
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Config`] for a zero timeout and
    /// [`LinkError::Transport`] if the address cannot be bound.
    pub fn bind_with_write_timeout(addr: impl ToSocketAddrs, write_timeout: Duration) -> Result<Self> {
        if write_timeout.is_zero() {
            return Err(LinkError::config("subscriber write timeout must be non-zero"));
        }
        let listener = TcpListener::bind(addr)
            .map_err(|e| LinkError::transport(format!("Cannot bind data port: {e}")))?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let subscribers: Arc<Mutex<Vec<TcpStream>>> = Arc::default();
        let stop = Arc::new(AtomicBool::new(false));

        let acceptor = {
            let subscribers = Arc::clone(&subscribers);
            let stop = Arc::clone(&stop);
            std::thread::Builder::new()
                .name("uart54-accept".into())
                .spawn(move || accept_loop(&listener, &subscribers, &stop, write_timeout))?
        };

        let worker = {
            let subscribers = Arc::clone(&subscribers);
            DeliveryWorker::spawn("uart54-publish", move |payload| {
                subscribers.lock().retain_mut(|stream| {
                    match stream.write_all(payload) {
                        Ok(()) => true,
                        Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                            tracing::warn!(
                                "Dropping stalled subscriber {:?}: no progress within the write timeout",
                                stream.peer_addr().ok()
                            );
                            false
                        }
                        Err(e) => {
                            tracing::info!("Dropping subscriber {:?}: {e}", stream.peer_addr().ok());
                            false
                        }
                    }
                });
            })?
        };

        tracing::info!("Publishing on tcp://{local_addr}");
        Ok(Self {
            local_addr,
            subscribers,
            stop,
            acceptor: Some(acceptor),
            worker,
        })
    }

    /// Address actually bound (useful with port 0)
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Connected subscribers
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

fn accept_loop(
    listener: &TcpListener,
    subscribers: &Mutex<Vec<TcpStream>>,
    stop: &AtomicBool,
    write_timeout: Duration,
) {
    while !stop.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer)) => {
                let setup = stream
                    .set_nonblocking(false)
                    .and_then(|()| stream.set_nodelay(true))
                    .and_then(|()| stream.set_write_timeout(Some(write_timeout)));
                if let Err(e) = setup {
                    tracing::warn!("Rejecting subscriber {peer}: {e}");
                    continue;
                }
                tracing::info!("Subscriber connected from {peer}");
                subscribers.lock().push(stream);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => std::thread::sleep(ACCEPT_POLL),
            Err(e) => {
                tracing::error!("Accept failed, no new subscribers: {e}");
                return;
            }
        }
    }
}

impl Transport for TcpPublisher {
    fn deliver(&self, payload: Bytes, done: Completion) -> Result<()> {
        self.worker.submit(payload, done)
    }

    fn name(&self) -> &'static str {
        "tcp"
    }
}

impl Drop for TcpPublisher {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(acceptor) = self.acceptor.take() {
            if acceptor.join().is_err() {
                tracing::error!("Acceptor thread panicked");
            }
        }
    }
}
