//! Proxy event loop
//!
//! Two threads per proxy:
//! - the reader moves datagrams from the interface into the input queue and
//!   never touches session state
//! - the processor owns every session, NAT entry and outbound socket, and is
//!   the only writer toward the interface
//!
//! Nothing is shared between them except the input queue, the buffer pool,
//! the stop flag and a few counters.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError, bounded};
use tracing::{debug, error, info, trace, warn};

use crate::buffer::{BufferPool, PoolBuffer, PoolStats};
use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::packet::{self, MAX_DATAGRAM_LEN, PROTO_TCP, PROTO_UDP};
use crate::protect::SocketProtector;
use crate::queue::OutputQueue;
use crate::sink::PayloadSink;
use crate::tcp::{TcpProxy, TcpStats};
use crate::tun::{PacketReader, PacketWriter};
use crate::udp::{UdpNat, UdpStats};

/// Frame counters shared by the reader and the processor.
#[derive(Debug, Default)]
pub struct ProxyCounters {
    frames_in: AtomicU64,
    frames_out: AtomicU64,
    dropped: AtomicU64,
    malformed: AtomicU64,
}

impl ProxyCounters {
    pub fn snapshot(&self, pool: &BufferPool) -> ProxyStats {
        ProxyStats {
            frames_in: self.frames_in.load(Ordering::Relaxed),
            frames_out: self.frames_out.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            pool: pool.stats(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProxyStats {
    /// Datagrams read from the interface
    pub frames_in: u64,
    /// Datagrams written to the interface
    pub frames_out: u64,
    /// Datagrams dropped because a queue was full
    pub dropped: u64,
    /// Datagrams that failed to parse
    pub malformed: u64,
    pub pool: PoolStats,
}

/// Final counters returned by [`ProxyHandle::shutdown`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub stats: ProxyStats,
    pub tcp: TcpStats,
    pub udp: UdpStats,
}

/// Interface reader loop.
///
/// Reads one datagram at a time, copies it into a pooled buffer of its exact
/// length and hands it to the processor. A full input queue drops the frame.
/// Returns once `stop` is set; an interface error sets `stop` itself.
pub fn run_reader<R: PacketReader>(
    mut reader: R,
    input: Sender<PoolBuffer>,
    pool: Arc<BufferPool>,
    stop: &AtomicBool,
    counters: &ProxyCounters,
) -> Result<()> {
    info!("Reader started");
    let mut scratch = vec![0u8; MAX_DATAGRAM_LEN];

    while !stop.load(Ordering::Relaxed) {
        let len = match reader.read_packet(&mut scratch) {
            Ok(0) => continue,
            Ok(len) => len,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                continue;
            }
            Err(e) => {
                error!(error = %e, "Interface read failed");
                stop.store(true, Ordering::SeqCst);
                return Err(ProxyError::Interface(e));
            }
        };

        counters.frames_in.fetch_add(1, Ordering::Relaxed);
        let mut frame = pool.alloc(len);
        frame.fill_from(&scratch[..len]);

        match input.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(len, "Input queue full, dropping frame");
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!("Processor gone, reader exiting");
                break;
            }
        }
    }

    info!("Reader stopped");
    Ok(())
}

/// Single-threaded owner of all proxy state.
pub struct Processor {
    input: Receiver<PoolBuffer>,
    tcp: TcpProxy,
    udp: UdpNat,
    out: OutputQueue,
    counters: Arc<ProxyCounters>,
    tick_interval: Duration,
    input_batch: usize,
}

impl Processor {
    pub fn new(
        config: &ProxyConfig,
        input: Receiver<PoolBuffer>,
        pool: Arc<BufferPool>,
        protector: Arc<dyn SocketProtector>,
        sink: Box<dyn PayloadSink>,
        counters: Arc<ProxyCounters>,
    ) -> Result<Self> {
        let tcp = TcpProxy::new(config, Arc::clone(&protector), sink).map_err(ProxyError::Poller)?;
        let udp = UdpNat::new(config, protector);

        Ok(Self {
            input,
            tcp,
            udp,
            out: OutputQueue::new(pool),
            counters,
            tick_interval: config.tick_interval,
            input_batch: config.input_queue_capacity,
        })
    }

    pub fn tcp(&self) -> &TcpProxy {
        &self.tcp
    }

    pub fn udp(&self) -> &UdpNat {
        &self.udp
    }

    /// Run one iteration of the loop. Returns whether any work was done.
    pub fn tick(&mut self, writer: &mut dyn PacketWriter) -> Result<bool> {
        // 1. Device datagrams queued by the reader
        let frames = self.process_input();

        // 2. Outbound TCP readiness
        let events = self
            .tcp
            .poll(Some(Duration::ZERO), &mut self.out)
            .map_err(ProxyError::Poller)?;

        // 3. UDP replies
        let replies = self.udp.poll(&mut self.out);

        // 4. Everything synthesized this tick goes to the interface
        let written = self.flush_output(writer)?;

        Ok(frames + events + replies + written > 0)
    }

    fn process_input(&mut self) -> usize {
        let mut count = 0;
        while count < self.input_batch {
            let frame = match self.input.try_recv() {
                Ok(frame) => frame,
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            };
            count += 1;
            self.dispatch(frame.data());
        }
        count
    }

    fn dispatch(&mut self, frame: &[u8]) {
        let view = match packet::parse(frame) {
            Ok(view) => view,
            Err(e) => {
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                trace!(error = %e, len = frame.len(), "Malformed datagram dropped");
                return;
            }
        };

        match view.protocol {
            PROTO_TCP if view.tcp().is_some() => self.tcp.process_packet(&view, &mut self.out),
            PROTO_UDP if view.udp().is_some() => self.udp.process_packet(&view),
            protocol => trace!(protocol, dst = %view.dst, "Unsupported protocol dropped"),
        }
    }

    fn flush_output(&mut self, writer: &mut dyn PacketWriter) -> Result<usize> {
        let mut written = 0;
        while let Some(buf) = self.out.pop() {
            match writer.write_packet(buf.data()) {
                Ok(_) => {
                    written += 1;
                    self.counters.frames_out.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(len = buf.len(), "Interface busy, dropping datagram");
                }
                Err(e) => {
                    error!(error = %e, "Interface write failed");
                    return Err(ProxyError::Interface(e));
                }
            }
        }
        Ok(written)
    }

    /// Release every outbound socket and anything still queued.
    pub fn close(&mut self) {
        self.tcp.close_all();
        self.udp.close_all();
        self.out.clear();
    }

    /// Loop until `stop` is set or the interface fails.
    pub fn run<W: PacketWriter>(mut self, mut writer: W, stop: &AtomicBool) -> Result<(TcpStats, UdpStats)> {
        info!("Processor started");

        let result = loop {
            if stop.load(Ordering::Relaxed) {
                break Ok(());
            }
            match self.tick(&mut writer) {
                Ok(true) => {}
                Ok(false) => thread::sleep(self.tick_interval),
                Err(e) => {
                    stop.store(true, Ordering::SeqCst);
                    break Err(e);
                }
            }
        };

        drop(writer);
        self.close();
        info!(
            tcp = ?self.tcp.stats(),
            udp = ?self.udp.stats(),
            "Processor stopped"
        );

        result.map(|()| (self.tcp.stats(), self.udp.stats()))
    }
}

/// Handle to a running proxy. Dropping it stops and joins both threads.
pub struct ProxyHandle {
    stop: Arc<AtomicBool>,
    counters: Arc<ProxyCounters>,
    pool: Arc<BufferPool>,
    reader_thread: Option<JoinHandle<Result<()>>>,
    processor_thread: Option<JoinHandle<Result<(TcpStats, UdpStats)>>>,
}

impl ProxyHandle {
    pub fn stats(&self) -> ProxyStats {
        self.counters.snapshot(&self.pool)
    }

    /// Whether both threads are still running
    pub fn is_running(&self) -> bool {
        self.reader_thread.as_ref().is_some_and(|h| !h.is_finished())
            && self
                .processor_thread
                .as_ref()
                .is_some_and(|h| !h.is_finished())
    }

    /// Stop both threads and wait for them.
    ///
    /// Returns once every interface handle and outbound socket is closed.
    /// An interface failure that ended the proxy early is reported here.
    pub fn shutdown(mut self) -> Result<ShutdownReport> {
        self.stop.store(true, Ordering::SeqCst);

        let reader = join(self.reader_thread.take(), "reader");
        let processor = join(self.processor_thread.take(), "processor");
        reader?;
        let (tcp, udp) = processor?.unwrap_or_default();

        let report = ShutdownReport {
            stats: self.stats(),
            tcp,
            udp,
        };
        info!(stats = ?report.stats, "Proxy shut down");
        Ok(report)
    }
}

fn join<T>(handle: Option<JoinHandle<Result<T>>>, name: &'static str) -> Result<Option<T>> {
    let Some(handle) = handle else {
        return Ok(None);
    };
    match handle.join() {
        Ok(result) => result.map(Some),
        Err(_) => Err(ProxyError::ThreadPanicked(name)),
    }
}

impl Drop for ProxyHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.reader_thread.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.processor_thread.take() {
            let _ = handle.join();
        }
    }
}

/// Start the reader and processor threads.
pub fn spawn<R, W>(
    reader: R,
    writer: W,
    config: ProxyConfig,
    protector: Arc<dyn SocketProtector>,
    sink: Box<dyn PayloadSink>,
) -> Result<ProxyHandle>
where
    R: PacketReader + 'static,
    W: PacketWriter + 'static,
{
    config.validate()?;

    let pool = Arc::new(BufferPool::new(config.pool_retain));
    let counters = Arc::new(ProxyCounters::default());
    let stop = Arc::new(AtomicBool::new(false));
    let (input_tx, input_rx) = bounded(config.input_queue_capacity);

    let processor = Processor::new(
        &config,
        input_rx,
        Arc::clone(&pool),
        protector,
        sink,
        Arc::clone(&counters),
    )?;

    let processor_stop = Arc::clone(&stop);
    let processor_thread = thread::Builder::new()
        .name("tunproxy-proc".to_string())
        .spawn(move || processor.run(writer, &processor_stop))
        .map_err(|e| ProxyError::Spawn("processor", e))?;

    let reader_stop = Arc::clone(&stop);
    let reader_pool = Arc::clone(&pool);
    let reader_counters = Arc::clone(&counters);
    let reader_thread = thread::Builder::new()
        .name("tunproxy-read".to_string())
        .spawn(move || run_reader(reader, input_tx, reader_pool, &reader_stop, &reader_counters));

    let reader_thread = match reader_thread {
        Ok(handle) => handle,
        Err(e) => {
            stop.store(true, Ordering::SeqCst);
            let _ = processor_thread.join();
            return Err(ProxyError::Spawn("reader", e));
        }
    };

    info!(
        tick_us = config.tick_interval.as_micros() as u64,
        initial_seq = config.initial_seq,
        "Proxy started"
    );

    Ok(ProxyHandle {
        stop,
        counters,
        pool,
        reader_thread: Some(reader_thread),
        processor_thread: Some(processor_thread),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{TcpFlags, TcpSegment};
    use crate::protect::Unprotected;
    use crate::sink::TraceSink;
    use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};

    #[derive(Default)]
    struct CollectWriter(Vec<Vec<u8>>);

    impl PacketWriter for CollectWriter {
        fn write_packet(&mut self, packet: &[u8]) -> io::Result<usize> {
            self.0.push(packet.to_vec());
            Ok(packet.len())
        }
    }

    struct FailingWriter;

    impl PacketWriter for FailingWriter {
        fn write_packet(&mut self, _packet: &[u8]) -> io::Result<usize> {
            Err(io::Error::from_raw_os_error(nix::libc::EIO))
        }
    }

    fn processor() -> (Processor, Sender<PoolBuffer>, Arc<BufferPool>, Arc<ProxyCounters>) {
        let config = ProxyConfig::default();
        let pool = Arc::new(BufferPool::new(16));
        let counters = Arc::new(ProxyCounters::default());
        let (tx, rx) = bounded(16);
        let processor = Processor::new(
            &config,
            rx,
            Arc::clone(&pool),
            Arc::new(Unprotected),
            Box::new(TraceSink),
            Arc::clone(&counters),
        )
        .unwrap();
        (processor, tx, pool, counters)
    }

    fn frame(pool: &Arc<BufferPool>, bytes: &[u8]) -> PoolBuffer {
        let mut buf = pool.alloc(bytes.len());
        buf.fill_from(bytes);
        buf
    }

    #[test]
    fn test_malformed_frames_are_counted() {
        let (mut processor, tx, pool, counters) = processor();
        let mut writer = CollectWriter::default();

        tx.send(frame(&pool, &[0x45; 10])).unwrap();
        tx.send(frame(&pool, &[0x60; 40])).unwrap();
        assert!(processor.tick(&mut writer).unwrap());

        assert_eq!(counters.snapshot(&pool).malformed, 2);
        assert!(writer.0.is_empty());
        // Both frames went back to the pool
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_idle_tick_reports_no_work() {
        let (mut processor, _tx, _pool, _counters) = processor();
        let mut writer = CollectWriter::default();
        assert!(!processor.tick(&mut writer).unwrap());
    }

    #[test]
    fn test_udp_round_trip_through_tick() {
        let (mut processor, tx, pool, counters) = processor();
        let mut writer = CollectWriter::default();

        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        server
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let std::net::SocketAddr::V4(remote) = server.local_addr().unwrap() else {
            unreachable!()
        };
        let device = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 6000);

        let mut bytes = vec![0u8; 64];
        let len = packet::build_udp(&mut bytes, device, remote, b"ping").unwrap();
        tx.send(frame(&pool, &bytes[..len])).unwrap();
        processor.tick(&mut writer).unwrap();
        assert_eq!(processor.udp().len(), 1);

        let mut buf = [0u8; 16];
        let (n, from) = server.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
        server.send_to(b"pong", from).unwrap();

        for _ in 0..200 {
            processor.tick(&mut writer).unwrap();
            if !writer.0.is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }

        let reply = packet::parse(&writer.0[0]).unwrap();
        assert_eq!(reply.source(), Some(remote));
        assert_eq!(reply.destination(), Some(device));
        assert_eq!(reply.payload(), b"pong");
        assert_eq!(counters.snapshot(&pool).frames_out, 1);
    }

    #[test]
    fn test_interface_write_error_is_fatal() {
        let (mut processor, tx, pool, _counters) = processor();

        // The SYN+ACK toward the device is the first write.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let std::net::SocketAddr::V4(remote) = listener.local_addr().unwrap() else {
            unreachable!()
        };
        let segment = TcpSegment {
            src: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 41000),
            dst: remote,
            seq: 1,
            ack: 0,
            flags: TcpFlags::SYN,
        };
        let mut bytes = vec![0u8; 64];
        let len = packet::build_tcp(&mut bytes, &segment, &[]).unwrap();
        tx.send(frame(&pool, &bytes[..len])).unwrap();

        let mut writer = FailingWriter;
        let mut result = Ok(false);
        for _ in 0..200 {
            result = processor.tick(&mut writer);
            if result.is_err() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert!(matches!(result, Err(ProxyError::Interface(_))));
    }
}
