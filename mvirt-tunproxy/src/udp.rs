//! UDP NAT table
//!
//! One outbound socket per device-side (address, port) pair. The socket is
//! connected to the remote peer, so the kernel only hands back datagrams
//! from that peer and replies can be addressed without a lookup.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::io;
use std::net::{SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, trace, warn};

use crate::config::ProxyConfig;
use crate::packet::{MAX_DATAGRAM_LEN, PacketView};
use crate::protect::SocketProtector;
use crate::queue::OutputQueue;

pub struct UdpEntry {
    socket: UdpSocket,
    remote: SocketAddrV4,
    last_active: Instant,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UdpStats {
    pub opened: u64,
    pub closed: u64,
    /// Datagrams sent on behalf of the device
    pub sent: u64,
    /// Datagrams relayed back to the device
    pub received: u64,
}

pub struct UdpNat {
    entries: HashMap<SocketAddrV4, UdpEntry>,
    protector: Arc<dyn SocketProtector>,
    idle_timeout: Option<Duration>,
    batch_limit: usize,
    recv_buf: Vec<u8>,
    stats: UdpStats,
}

fn open_socket(protector: &dyn SocketProtector, remote: SocketAddrV4) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    protector.protect(&socket)?;
    socket.connect(&SocketAddr::V4(remote).into())?;
    Ok(socket.into())
}

impl UdpNat {
    pub fn new(config: &ProxyConfig, protector: Arc<dyn SocketProtector>) -> Self {
        Self {
            entries: HashMap::new(),
            protector,
            idle_timeout: config.udp_idle_timeout,
            batch_limit: config.udp_batch_limit,
            recv_buf: vec![0u8; MAX_DATAGRAM_LEN],
            stats: UdpStats::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remote peer currently associated with a device-side pair
    pub fn remote(&self, local: &SocketAddrV4) -> Option<SocketAddrV4> {
        self.entries.get(local).map(|entry| entry.remote)
    }

    pub fn stats(&self) -> UdpStats {
        self.stats
    }

    /// Send the payload of one UDP datagram from the device to its
    /// destination, creating or re-associating the NAT entry as needed.
    pub fn process_packet(&mut self, view: &PacketView<'_>) {
        if view.udp().is_none() {
            return;
        }
        let (Some(local), Some(remote)) = (view.source(), view.destination()) else {
            return;
        };

        let entry = match self.entries.entry(local) {
            Entry::Occupied(occupied) => occupied.into_mut(),
            Entry::Vacant(vacant) => match open_socket(&*self.protector, remote) {
                Ok(socket) => {
                    self.stats.opened += 1;
                    debug!(local = %local, remote = %remote, "UDP entry created");
                    vacant.insert(UdpEntry {
                        socket,
                        remote,
                        last_active: Instant::now(),
                    })
                }
                Err(e) => {
                    debug!(local = %local, remote = %remote, error = %e, "Failed to open UDP socket");
                    return;
                }
            },
        };

        let result = if entry.remote == remote {
            Ok(())
        } else {
            trace!(local = %local, from = %entry.remote, to = %remote, "UDP entry re-associated");
            entry.socket.connect(remote).map(|()| entry.remote = remote)
        };

        let result = result.and_then(|()| entry.socket.send(view.payload()));
        match result {
            Ok(_) => {
                entry.last_active = Instant::now();
                self.stats.sent += 1;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                trace!(local = %local, "UDP send would block, datagram dropped");
            }
            Err(e) => {
                debug!(local = %local, remote = %remote, error = %e, "UDP send failed, entry dropped");
                self.remove(&local);
            }
        }
    }

    /// Relay pending replies to the device. Returns the number of datagrams
    /// queued.
    pub fn poll(&mut self, out: &mut OutputQueue) -> usize {
        let now = Instant::now();
        let mut relayed = 0;
        let mut failed = Vec::new();

        for (local, entry) in self.entries.iter_mut() {
            for _ in 0..self.batch_limit {
                match entry.socket.recv(&mut self.recv_buf) {
                    Ok(n) => {
                        if let Err(e) = out.push_udp(entry.remote, *local, &self.recv_buf[..n]) {
                            warn!(local = %local, error = %e, "Failed to build UDP reply");
                            continue;
                        }
                        entry.last_active = now;
                        relayed += 1;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    // ICMP port unreachable from the peer; the flow may recover.
                    Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                        trace!(local = %local, remote = %entry.remote, "UDP peer unreachable");
                        break;
                    }
                    Err(e) => {
                        debug!(local = %local, error = %e, "UDP receive failed, entry dropped");
                        failed.push(*local);
                        break;
                    }
                }
            }
        }

        for local in &failed {
            self.remove(local);
        }
        self.stats.received += relayed as u64;

        if self.idle_timeout.is_some() {
            self.sweep_idle(now);
        }

        relayed
    }

    /// Drop entries idle for longer than the configured timeout. Returns the
    /// number removed; without a timeout nothing is ever removed.
    pub fn sweep_idle(&mut self, now: Instant) -> usize {
        let Some(timeout) = self.idle_timeout else {
            return 0;
        };

        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now.saturating_duration_since(entry.last_active) < timeout);
        let removed = before - self.entries.len();

        if removed > 0 {
            self.stats.closed += removed as u64;
            debug!(removed, "Idle UDP entries evicted");
        }
        removed
    }

    fn remove(&mut self, local: &SocketAddrV4) {
        if self.entries.remove(local).is_some() {
            self.stats.closed += 1;
        }
    }

    /// Close every outbound socket.
    pub fn close_all(&mut self) {
        let count = self.entries.len();
        self.entries.clear();
        self.stats.closed += count as u64;
        if count > 0 {
            debug!(count, "Closed UDP entries");
        }
    }
}
