//! Accumulator, publisher and dispatcher working together

use bytes::Bytes;
use std::io::{ErrorKind, Read};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uart54_chip::Word;
use uart54_driver::transport::Completion;
use uart54_driver::{
    AccumulatorState, ChannelDispatcher, ChannelId, ChannelLayout, EventSource, LinkError,
    MemoryBus, PollingEventSource, PublishOutcome, ReceiveAccumulator, RegisterChannel, Result,
    RoundRobin, SimulatedUart, StreamPublisher, TcpPublisher, Transport, WaitStrategy,
};

fn wait_until(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < limit {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}

#[test]
fn eight_words_fill_sixty_four_bytes() {
    let uart = Arc::new(SimulatedUart::new());
    let ch = Arc::new(RegisterChannel::new(ChannelId::A, uart.clone(), ChannelLayout::default()).unwrap());
    let acc = Arc::new(ReceiveAccumulator::new(ChannelId::A, 8192).unwrap());
    let producer = Box::new(PollingEventSource::new(WaitStrategy::Spin))
        .start(ch, Arc::clone(&acc))
        .unwrap();

    let words: Vec<u64> = (0..8u64).map(|n| n * 0x0101_0101_0101).collect();
    for &w in &words {
        assert!(wait_until(Duration::from_secs(1), || uart.inject_rx(Word::from_raw(w))));
    }
    assert!(wait_until(Duration::from_secs(1), || acc.used() == 64));
    drop(producer);

    assert_eq!(acc.used(), 64);
    assert_eq!(acc.state(), AccumulatorState::Accumulating);
    assert_eq!(acc.dropped_words(), 0);
    let drained = acc.drain();
    assert_eq!(drained.count(), 8);
    assert_eq!(drained.words().map(Word::payload).collect::<Vec<_>>(), words);
    assert_eq!(acc.state(), AccumulatorState::Empty);
}

#[test]
fn overflow_drops_newest_and_never_exceeds_capacity() {
    let acc = ReceiveAccumulator::new(ChannelId::B, 32).unwrap();
    for n in 0..10u64 {
        acc.push_word(Word::from_raw(n));
        assert!(acc.used() <= acc.capacity());
    }
    assert_eq!(acc.state(), AccumulatorState::Full);
    assert_eq!(acc.dropped_words(), 6);
    assert_eq!(
        acc.drain().words().map(Word::raw).collect::<Vec<_>>(),
        vec![0, 1, 2, 3]
    );
}

/// Completes a payload only when the test says so
#[derive(Default)]
struct ManualTransport {
    pending: parking_lot::Mutex<Vec<(Bytes, Completion)>>,
}

impl std::fmt::Debug for ManualTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualTransport")
            .field("pending", &self.pending.lock().len())
            .finish()
    }
}

impl Transport for ManualTransport {
    fn deliver(&self, payload: Bytes, done: Completion) -> Result<()> {
        self.pending.lock().push((payload, done));
        Ok(())
    }

    fn name(&self) -> &'static str {
        "manual"
    }
}

#[test]
fn publish_while_outstanding_is_a_noop() {
    let publisher = StreamPublisher::new(ManualTransport::default());
    let completed = Arc::new(AtomicUsize::new(0));
    let first = Bytes::from((0u8..64).collect::<Vec<_>>());

    let on_complete = {
        let completed = Arc::clone(&completed);
        move || {
            completed.fetch_add(1, Ordering::SeqCst);
        }
    };
    assert_eq!(
        publisher.try_publish(first.clone(), on_complete).unwrap(),
        PublishOutcome::Scheduled
    );
    let second_ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&second_ran);
    assert_eq!(
        publisher
            .try_publish(Bytes::from_static(&[0xff; 8]), move || flag.store(true, Ordering::SeqCst))
            .unwrap(),
        PublishOutcome::Busy
    );

    let pending = std::mem::take(&mut *publisher.transport().pending.lock());
    assert_eq!(pending.len(), 1);
    let (payload, done) = pending.into_iter().next().unwrap();
    assert_eq!(payload, first);
    done();

    assert_eq!(completed.load(Ordering::SeqCst), 1);
    assert!(!second_ran.load(Ordering::SeqCst));
    assert!(!publisher.is_busy());
    assert_eq!(publisher.busy_drops(), 1);
}

/// Completes every payload on a fresh thread, tracking overlap
#[derive(Debug, Default)]
struct ThreadedTransport {
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
    delivered: Arc<AtomicUsize>,
}

impl Transport for ThreadedTransport {
    fn deliver(&self, _payload: Bytes, done: Completion) -> Result<()> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let in_flight = Arc::clone(&self.in_flight);
        let delivered = Arc::clone(&self.delivered);
        std::thread::Builder::new()
            .spawn(move || {
                std::thread::yield_now();
                in_flight.fetch_sub(1, Ordering::SeqCst);
                delivered.fetch_add(1, Ordering::SeqCst);
                done();
            })
            .map_err(|e| LinkError::transport(e.to_string()))?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "threaded"
    }
}

#[test]
fn at_most_one_transfer_under_contention() {
    let publisher = Arc::new(StreamPublisher::new(ThreadedTransport::default()));
    let accs: Vec<Arc<ReceiveAccumulator>> = [ChannelId::A, ChannelId::B, ChannelId::C]
        .into_iter()
        .map(|id| Arc::new(ReceiveAccumulator::new(id, 256).unwrap()))
        .collect();

    let stop = Arc::new(AtomicBool::new(false));
    let producers: Vec<_> = accs
        .iter()
        .map(|acc| {
            let acc = Arc::clone(acc);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                let mut n = 0u64;
                while !stop.load(Ordering::Relaxed) {
                    acc.push_word(Word::from_raw(n));
                    n += 1;
                }
            })
        })
        .collect();
    let side_publishers: Vec<_> = (0..2)
        .map(|_| {
            let publisher = Arc::clone(&publisher);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    publisher.try_publish(Bytes::from_static(&[0; 8]), || {}).unwrap();
                }
            })
        })
        .collect();

    let mut dispatcher = ChannelDispatcher::new(
        accs.clone(),
        Arc::clone(&publisher),
        Box::new(RoundRobin::default()),
        WaitStrategy::Spin,
    );
    let start = Instant::now();
    while start.elapsed() < Duration::from_millis(300) {
        dispatcher.poll_once().unwrap();
    }
    stop.store(true, Ordering::SeqCst);
    for t in producers.into_iter().chain(side_publishers) {
        t.join().unwrap();
    }
    assert!(wait_until(Duration::from_secs(2), || !publisher.is_busy()));

    let transport = publisher.transport();
    assert_eq!(transport.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(
        transport.delivered.load(Ordering::SeqCst) as u64,
        publisher.published()
    );
    assert!(dispatcher.stats().published > 0);
}

#[test]
fn dispatcher_streams_all_channels_to_subscribers() {
    let bus = MemoryBus::new().unwrap();
    let subscriber = bus.subscribe();
    let publisher = Arc::new(StreamPublisher::new(bus));

    let mut uarts = Vec::new();
    let mut accs = Vec::new();
    let mut producers = Vec::new();
    for id in [ChannelId::A, ChannelId::B] {
        let uart = Arc::new(SimulatedUart::new());
        let ch = Arc::new(RegisterChannel::new(id, uart.clone(), ChannelLayout::default()).unwrap());
        let acc = Arc::new(ReceiveAccumulator::new(id, 8192).unwrap());
        producers.push(
            Box::new(PollingEventSource::new(WaitStrategy::default()))
                .start(ch, Arc::clone(&acc))
                .unwrap(),
        );
        uarts.push(uart);
        accs.push(acc);
    }

    let cancel = Arc::new(AtomicBool::new(false));
    let dispatcher = {
        let cancel = Arc::clone(&cancel);
        let mut dispatcher = ChannelDispatcher::new(
            accs,
            Arc::clone(&publisher),
            Box::new(RoundRobin::default()),
            WaitStrategy::default(),
        );
        std::thread::spawn(move || dispatcher.run(&cancel))
    };

    // channel tag in the top payload byte, sequence number below
    for seq in 0..20u64 {
        for (tag, uart) in uarts.iter().enumerate() {
            let word = Word::from_raw(((tag as u64) << 48) | seq);
            assert!(wait_until(Duration::from_secs(1), || uart.inject_rx(word)));
        }
    }

    let mut received: Vec<Vec<u64>> = vec![Vec::new(); 2];
    let deadline = Instant::now() + Duration::from_secs(5);
    while received.iter().map(Vec::len).sum::<usize>() < 40 && Instant::now() < deadline {
        if let Ok(payload) = subscriber.recv_timeout(Duration::from_millis(50)) {
            assert_eq!(payload.len() % 8, 0);
            for chunk in payload.chunks_exact(8) {
                let word = Word::from_le_bytes(chunk.try_into().unwrap());
                let tag = (word.payload() >> 48) as usize;
                received[tag].push(word.payload() & 0xffff);
            }
        }
    }

    cancel.store(true, Ordering::SeqCst);
    let stats = dispatcher.join().unwrap().unwrap();
    drop(producers);

    for per_channel in &received {
        assert_eq!(per_channel, &(0..20).collect::<Vec<_>>());
    }
    assert!(stats.published >= 2);
    assert_eq!(publisher.busy_drops(), 0);
}

#[test]
fn stalled_tcp_subscriber_is_evicted_and_the_slot_frees() {
    let transport =
        TcpPublisher::bind_with_write_timeout("127.0.0.1:0", Duration::from_millis(100)).unwrap();
    let addr = transport.local_addr();
    let publisher = StreamPublisher::new(transport);

    // connected but never read
    let stalled = TcpStream::connect(addr).unwrap();
    let mut healthy = TcpStream::connect(addr).unwrap();
    healthy.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        publisher.transport().subscriber_count() == 2
    }));

    let received = Arc::new(AtomicUsize::new(0));
    let stop = Arc::new(AtomicBool::new(false));
    let reader = {
        let received = Arc::clone(&received);
        let stop = Arc::clone(&stop);
        std::thread::spawn(move || {
            let mut buf = vec![0u8; 64 * 1024];
            while !stop.load(Ordering::Relaxed) {
                match healthy.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        received.fetch_add(n, Ordering::SeqCst);
                    }
                    Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                    Err(_) => break,
                }
            }
        })
    };

    // enough to fill the stalled socket's kernel buffers
    let payload = Bytes::from(vec![0xa5u8; 1 << 20]);
    assert!(wait_until(Duration::from_secs(10), || {
        publisher.try_publish(payload.clone(), || {}).unwrap();
        publisher.transport().subscriber_count() == 1
    }));
    assert!(wait_until(Duration::from_secs(2), || !publisher.is_busy()));

    let before = received.load(Ordering::SeqCst);
    assert_eq!(
        publisher.try_publish(payload.clone(), || {}).unwrap(),
        PublishOutcome::Scheduled
    );
    assert!(wait_until(Duration::from_secs(2), || {
        received.load(Ordering::SeqCst) >= before + payload.len()
    }));
    assert!(wait_until(Duration::from_secs(2), || !publisher.is_busy()));

    stop.store(true, Ordering::SeqCst);
    drop(publisher);
    reader.join().unwrap();
    drop(stalled);
}
