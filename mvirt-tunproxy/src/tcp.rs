//! TCP session manager
//!
//! Terminates the device's TCP connections inside the proxy: every device
//! flow gets its own outbound socket to the original destination, and the
//! proxy answers the device while impersonating that destination.
//!
//! The handshake toward the device is deferred until the outbound connect
//! completes, so a refused connection just looks like a lost SYN to the
//! device. There are no retransmissions, timers or window management; the
//! path to the device is a local interface that does not lose datagrams.

use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use mio::event::Event;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Registry, Token};
use nix::libc;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, trace, warn};

use crate::config::ProxyConfig;
use crate::packet::{PacketView, TcpFlags, TcpSegment};
use crate::protect::SocketProtector;
use crate::queue::OutputQueue;
use crate::sink::PayloadSink;

/// Readiness events collected per poll
const EVENTS_CAPACITY: usize = 256;

/// Device-side 4-tuple of a TCP flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    /// Device address and port
    pub src: SocketAddrV4,
    /// Remote address and port the device is talking to
    pub dst: SocketAddrV4,
}

impl SessionKey {
    pub fn new(src: SocketAddrV4, dst: SocketAddrV4) -> Self {
        Self { src, dst }
    }

    /// Key of a parsed TCP or UDP datagram coming from the device
    pub fn from_view(view: &PacketView<'_>) -> Option<Self> {
        Some(Self::new(view.source()?, view.destination()?))
    }

    /// Segment toward the device, sent as the remote peer.
    pub fn reply(&self, seq: u32, ack: u32, flags: TcpFlags) -> TcpSegment {
        TcpSegment {
            src: self.dst,
            dst: self.src,
            seq,
            ack,
            flags,
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.src, self.dst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Device sent SYN, outbound connect in progress
    SynReceived,
    /// SYN+ACK sent, relaying in both directions
    Established,
    /// Closing; the session is removed in the same step
    FinWait,
}

/// Counters kept by the session manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpStats {
    pub opened: u64,
    pub closed: u64,
    pub connect_failed: u64,
}

/// Readiness flags of one event, copied out of `mio::event::Event`.
#[derive(Debug, Clone, Copy, Default)]
struct Readiness {
    readable: bool,
    writable: bool,
    error: bool,
    read_closed: bool,
}

impl From<&Event> for Readiness {
    fn from(event: &Event) -> Self {
        Self {
            readable: event.is_readable(),
            writable: event.is_writable(),
            error: event.is_error(),
            read_closed: event.is_read_closed(),
        }
    }
}

enum Step {
    Keep,
    Close,
}

pub struct Session {
    key: SessionKey,
    stream: TcpStream,
    token: Token,
    state: SessionState,
    /// Next sequence number expected from the device
    client_seq: u32,
    /// Next sequence number the proxy sends
    my_seq: u32,
    /// Device bytes the outbound socket has not taken yet
    backlog: Vec<u8>,
    write_interest: bool,
}

impl Session {
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn client_seq(&self) -> u32 {
        self.client_seq
    }

    pub fn my_seq(&self) -> u32 {
        self.my_seq
    }

    /// Bytes waiting for the outbound socket to become writable
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    fn emit(&self, out: &mut OutputQueue, flags: TcpFlags, payload: &[u8]) {
        let segment = self.key.reply(self.my_seq, self.client_seq, flags);
        if let Err(e) = out.push_tcp(&segment, payload) {
            warn!(flow = %self.key, error = %e, "Failed to build segment");
        }
    }

    fn on_ready(
        &mut self,
        ready: Readiness,
        registry: &Registry,
        buf: &mut [u8],
        sink: &mut dyn PayloadSink,
        out: &mut OutputQueue,
    ) -> io::Result<Step> {
        if self.state == SessionState::SynReceived && !self.finish_connect(registry, out)? {
            return Ok(Step::Keep);
        }

        if ready.error {
            if let Some(e) = self.stream.take_error()? {
                return Err(e);
            }
        }

        if ready.writable && !self.backlog.is_empty() {
            self.flush_backlog(registry)?;
        }

        if ready.readable || ready.read_closed {
            return self.drain(buf, sink, out);
        }

        Ok(Step::Keep)
    }

    /// Returns `false` while the connect is still pending.
    fn finish_connect(&mut self, registry: &Registry, out: &mut OutputQueue) -> io::Result<bool> {
        if let Some(e) = self.stream.take_error()? {
            return Err(e);
        }
        match self.stream.peer_addr() {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotConnected => return Ok(false),
            Err(e) => return Err(e),
        }

        self.emit(out, TcpFlags::SYN | TcpFlags::ACK, &[]);
        self.my_seq = self.my_seq.wrapping_add(1);
        self.state = SessionState::Established;
        registry.reregister(&mut self.stream, self.token, Interest::READABLE)?;
        self.write_interest = false;

        debug!(flow = %self.key, "Session established");
        Ok(true)
    }

    /// Read until the socket would block. Each read becomes one segment
    /// toward the device and one sink delivery.
    fn drain(
        &mut self,
        buf: &mut [u8],
        sink: &mut dyn PayloadSink,
        out: &mut OutputQueue,
    ) -> io::Result<Step> {
        loop {
            match self.stream.read(buf) {
                Ok(0) => {
                    self.emit(out, TcpFlags::FIN | TcpFlags::ACK, &[]);
                    self.state = SessionState::FinWait;
                    return Ok(Step::Close);
                }
                Ok(n) => {
                    let data = &buf[..n];
                    sink.deliver(&self.key, data);
                    self.emit(out, TcpFlags::ACK, data);
                    self.my_seq = self.my_seq.wrapping_add(n as u32);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Step::Keep),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Hand device bytes to the outbound socket, writing what it takes now
    /// and buffering the rest up to `max_backlog`. Returns how many bytes
    /// were accepted; the caller only acknowledges those.
    fn send(&mut self, data: &[u8], registry: &Registry, max_backlog: usize) -> io::Result<usize> {
        let written = if self.backlog.is_empty() {
            write_some(&mut self.stream, data)?
        } else {
            0
        };

        let rest = &data[written..];
        let room = max_backlog.saturating_sub(self.backlog.len());
        let queued = rest.len().min(room);
        self.backlog.extend_from_slice(&rest[..queued]);

        if !self.backlog.is_empty() && !self.write_interest {
            registry.reregister(
                &mut self.stream,
                self.token,
                Interest::READABLE | Interest::WRITABLE,
            )?;
            self.write_interest = true;
        }
        Ok(written + queued)
    }

    fn flush_backlog(&mut self, registry: &Registry) -> io::Result<()> {
        let written = write_some(&mut self.stream, &self.backlog)?;
        self.backlog.drain(..written);

        if self.backlog.is_empty() && self.write_interest {
            registry.reregister(&mut self.stream, self.token, Interest::READABLE)?;
            self.write_interest = false;
        }
        Ok(())
    }
}

/// Write as much of `data` as the socket accepts without blocking.
fn write_some(stream: &mut TcpStream, data: &[u8]) -> io::Result<usize> {
    let mut written = 0;
    while written < data.len() {
        match stream.write(&data[written..]) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(written)
}

/// Part of a device segment not yet forwarded, given the next expected
/// sequence number. Retransmitted bytes are trimmed; a segment entirely in
/// the past, or one that leaves a gap, yields `None`.
fn unseen_bytes(expected: u32, seq: u32, payload: &[u8]) -> Option<&[u8]> {
    let offset = expected.wrapping_sub(seq);
    if offset == 0 {
        return Some(payload);
    }
    if (offset as i32) > 0 && (offset as usize) < payload.len() {
        return Some(&payload[offset as usize..]);
    }
    None
}

/// All TCP sessions plus the readiness poller for their outbound sockets.
pub struct TcpProxy {
    poll: Poll,
    events: Events,
    sessions: HashMap<SessionKey, Session>,
    tokens: HashMap<Token, SessionKey>,
    next_token: usize,
    protector: Arc<dyn SocketProtector>,
    sink: Box<dyn PayloadSink>,
    initial_seq: u32,
    max_backlog: usize,
    read_buf: Vec<u8>,
    stats: TcpStats,
}

impl TcpProxy {
    pub fn new(
        config: &ProxyConfig,
        protector: Arc<dyn SocketProtector>,
        sink: Box<dyn PayloadSink>,
    ) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(EVENTS_CAPACITY),
            sessions: HashMap::new(),
            tokens: HashMap::new(),
            next_token: 0,
            protector,
            sink,
            initial_seq: config.initial_seq,
            max_backlog: config.max_backlog,
            read_buf: vec![0u8; config.read_chunk],
            stats: TcpStats::default(),
        })
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn session(&self, key: &SessionKey) -> Option<&Session> {
        self.sessions.get(key)
    }

    pub fn stats(&self) -> TcpStats {
        self.stats
    }

    /// Handle one TCP datagram from the device.
    pub fn process_packet(&mut self, view: &PacketView<'_>, out: &mut OutputQueue) {
        let Some(tcp) = view.tcp().copied() else {
            return;
        };
        let Some(key) = SessionKey::from_view(view) else {
            return;
        };
        let flags = tcp.flags;
        let payload = view.payload();

        trace!(flow = %key, flags = ?flags, seq = tcp.seq, len = payload.len(), "TCP from device");

        if flags.contains(TcpFlags::RST) {
            if self.remove_session(&key).is_some() {
                debug!(flow = %key, "Session reset by device");
            }
            return;
        }

        if flags.contains(TcpFlags::SYN) {
            if self.sessions.contains_key(&key) {
                trace!(flow = %key, "Duplicate SYN ignored");
            } else {
                self.open_session(key, tcp.seq);
            }
            return;
        }

        if flags.contains(TcpFlags::FIN) {
            self.close_from_device(key, tcp.seq, payload, out);
            return;
        }

        if flags.contains(TcpFlags::ACK) && !payload.is_empty() {
            self.forward_from_device(key, tcp.seq, payload, out);
        }
    }

    fn allocate_token(&mut self) -> Token {
        loop {
            let token = Token(self.next_token);
            self.next_token = self.next_token.wrapping_add(1);
            if !self.tokens.contains_key(&token) {
                return token;
            }
        }
    }

    fn open_session(&mut self, key: SessionKey, syn_seq: u32) {
        let token = self.allocate_token();
        let stream = match self.connect(key.dst, token) {
            Ok(stream) => stream,
            Err(e) => {
                self.stats.connect_failed += 1;
                debug!(flow = %key, error = %e, "Outbound connect failed, dropping SYN");
                return;
            }
        };

        self.sessions.insert(
            key,
            Session {
                key,
                stream,
                token,
                state: SessionState::SynReceived,
                client_seq: syn_seq.wrapping_add(1),
                my_seq: self.initial_seq,
                backlog: Vec::new(),
                write_interest: true,
            },
        );
        self.tokens.insert(token, key);
        self.stats.opened += 1;

        debug!(flow = %key, token = token.0, "Session opened");
    }

    fn connect(&self, dst: SocketAddrV4, token: Token) -> io::Result<TcpStream> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        socket.set_nodelay(true)?;
        self.protector.protect(&socket)?;

        match socket.connect(&SocketAddr::V4(dst).into()) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(e) => return Err(e),
        }

        let mut stream = TcpStream::from_std(std::net::TcpStream::from(socket));
        self.poll
            .registry()
            .register(&mut stream, token, Interest::READABLE | Interest::WRITABLE)?;
        Ok(stream)
    }

    fn forward_from_device(
        &mut self,
        key: SessionKey,
        seq: u32,
        payload: &[u8],
        out: &mut OutputQueue,
    ) {
        let registry = self.poll.registry();
        let max_backlog = self.max_backlog;
        let Some(session) = self.sessions.get_mut(&key) else {
            trace!(flow = %key, "Data for unknown flow dropped");
            return;
        };
        if session.state != SessionState::Established {
            trace!(flow = %key, state = ?session.state, "Data before handshake dropped");
            return;
        }

        match unseen_bytes(session.client_seq, seq, payload) {
            Some(bytes) => {
                let accepted = match session.send(bytes, registry, max_backlog) {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        debug!(flow = %key, error = %e, "Outbound write failed");
                        self.remove_session(&key);
                        return;
                    }
                };
                if accepted < bytes.len() {
                    trace!(flow = %key, accepted, len = bytes.len(), "Backlog full, excess not acknowledged");
                }
                session.client_seq = session.client_seq.wrapping_add(accepted as u32);
            }
            None => {
                trace!(flow = %key, seq, expected = session.client_seq, "Out of order data dropped");
            }
        }

        session.emit(out, TcpFlags::ACK, &[]);
    }

    fn close_from_device(&mut self, key: SessionKey, seq: u32, payload: &[u8], out: &mut OutputQueue) {
        let Some(mut session) = self.remove_session(&key) else {
            trace!(flow = %key, "FIN for unknown flow dropped");
            return;
        };

        if session.state == SessionState::Established && !payload.is_empty() {
            if let Some(bytes) = unseen_bytes(session.client_seq, seq, payload) {
                session.backlog.extend_from_slice(bytes);
            }
        }
        if !session.backlog.is_empty() {
            // Last chance for pending bytes before the socket goes away.
            if let Err(e) = write_some(&mut session.stream, &session.backlog) {
                debug!(flow = %key, error = %e, "Outbound write failed on close");
            }
        }

        session.state = SessionState::FinWait;
        session.client_seq = seq.wrapping_add(payload.len() as u32).wrapping_add(1);
        session.emit(out, TcpFlags::ACK, &[]);

        debug!(flow = %key, "Session closed by device");
    }

    /// Wait up to `timeout` for outbound readiness and handle every event.
    /// Returns the number of events handled.
    pub fn poll(&mut self, timeout: Option<Duration>, out: &mut OutputQueue) -> io::Result<usize> {
        let mut events = std::mem::replace(&mut self.events, Events::with_capacity(0));

        if let Err(e) = self.poll.poll(&mut events, timeout) {
            self.events = events;
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(e);
        }

        let mut handled = 0;
        for event in events.iter() {
            self.handle_event(event.token(), Readiness::from(event), out);
            handled += 1;
        }

        self.events = events;
        Ok(handled)
    }

    fn handle_event(&mut self, token: Token, ready: Readiness, out: &mut OutputQueue) {
        let Some(key) = self.tokens.get(&token).copied() else {
            return;
        };
        let Some(session) = self.sessions.get_mut(&key) else {
            return;
        };
        let connecting = session.state == SessionState::SynReceived;

        let step = session.on_ready(
            ready,
            self.poll.registry(),
            &mut self.read_buf,
            &mut *self.sink,
            out,
        );

        match step {
            Ok(Step::Keep) => {}
            Ok(Step::Close) => {
                self.remove_session(&key);
                debug!(flow = %key, "Session closed by remote");
            }
            Err(e) => {
                if connecting {
                    self.stats.connect_failed += 1;
                }
                self.remove_session(&key);
                debug!(flow = %key, error = %e, "Outbound socket failed, session dropped");
            }
        }
    }

    fn remove_session(&mut self, key: &SessionKey) -> Option<Session> {
        let mut session = self.sessions.remove(key)?;
        self.tokens.remove(&session.token);
        if let Err(e) = self.poll.registry().deregister(&mut session.stream) {
            trace!(flow = %key, error = %e, "Deregister failed");
        }
        self.stats.closed += 1;
        Some(session)
    }

    /// Drop every session and its outbound socket.
    pub fn close_all(&mut self) {
        let keys: Vec<SessionKey> = self.sessions.keys().copied().collect();
        for key in &keys {
            self.remove_session(key);
        }
        if !keys.is_empty() {
            debug!(count = keys.len(), "Closed TCP sessions");
        }
    }
}
