//! Virtual interface access
//!
//! The proxy talks to the interface through [`PacketReader`] and
//! [`PacketWriter`]; each call moves exactly one raw IPv4 datagram, no
//! framing. [`TunDevice`] is the Linux implementation on top of
//! `/dev/net/tun`.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;

use nix::libc;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tracing::{debug, info};

/// Default TUN device name
pub const DEFAULT_TUN_NAME: &str = "mvirt-tp0";

/// How long a reader waits for a datagram before giving control back, so
/// the reader thread can observe a stop request.
pub const READ_POLL_TIMEOUT_MS: u16 = 100;

/// TUN device flags from linux/if_tun.h
const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;

/// ioctl request code for TUNSETIFF
const TUNSETIFF: libc::c_ulong = 0x400454ca;

/// Source of datagrams captured from the device.
pub trait PacketReader: Send {
    /// Read one datagram into `buf`.
    ///
    /// Implementations should return `ErrorKind::WouldBlock` (or
    /// `TimedOut`) when nothing arrived within a short wait, so the caller
    /// gets a chance to check for shutdown.
    fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Sink for datagrams injected back into the device.
pub trait PacketWriter: Send {
    fn write_packet(&mut self, packet: &[u8]) -> io::Result<usize>;
}

/// ifreq structure for TUN device configuration
#[repr(C)]
struct IfReq {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_flags: libc::c_short,
    _pad: [u8; 22], // padding to match kernel struct size
}

impl IfReq {
    fn new(name: &str, flags: libc::c_short) -> io::Result<Self> {
        let name_bytes = name.as_bytes();
        if name_bytes.is_empty() || name_bytes.len() >= libc::IFNAMSIZ {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid interface name '{name}'"),
            ));
        }

        let mut ifr = IfReq {
            ifr_name: [0; libc::IFNAMSIZ],
            ifr_flags: flags,
            _pad: [0; 22],
        };
        for (i, &b) in name_bytes.iter().enumerate() {
            ifr.ifr_name[i] = b as libc::c_char;
        }
        Ok(ifr)
    }
}

/// Layer 3 TUN device (raw IP packets, no packet information header)
pub struct TunDevice {
    name: String,
    file: File,
}

impl TunDevice {
    /// Create (or attach to) the TUN device `name`.
    ///
    /// Requires CAP_NET_ADMIN. The device is opened non-blocking; readers
    /// wait with `poll(2)` instead.
    pub fn create(name: &str) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open("/dev/net/tun")?;

        let ifr = IfReq::new(name, IFF_TUN | IFF_NO_PI)?;

        let ret = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &ifr) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        info!(name, "TUN device created");

        Ok(Self {
            name: name.to_string(),
            file,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bring the interface up (`ip link set <name> up`).
    ///
    /// Addresses and routes are left to the host; the proxy only moves
    /// datagrams.
    pub fn bring_up(&self) -> io::Result<()> {
        let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        if sock < 0 {
            return Err(io::Error::last_os_error());
        }
        let sock_guard = SockGuard(sock);

        let mut ifr = IfReq::new(&self.name, 0)?;

        let ret = unsafe { libc::ioctl(sock_guard.0, libc::SIOCGIFFLAGS as _, &mut ifr) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        ifr.ifr_flags |= libc::IFF_UP as libc::c_short;

        let ret = unsafe { libc::ioctl(sock_guard.0, libc::SIOCSIFFLAGS as _, &ifr) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        info!(name = %self.name, "Interface set UP");
        Ok(())
    }

    /// Split into independently owned read and write halves.
    ///
    /// Both halves share the same open file description; the device goes
    /// away once both are dropped.
    pub fn split(self) -> io::Result<(TunReader, TunWriter)> {
        let read_file = self.file.try_clone()?;
        Ok((
            TunReader {
                name: self.name.clone(),
                file: read_file,
            },
            TunWriter {
                name: self.name,
                file: self.file,
            },
        ))
    }
}

/// Read half of a [`TunDevice`]
pub struct TunReader {
    name: String,
    file: File,
}

impl PacketReader for TunReader {
    fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let poll_fd = PollFd::new(self.file.as_fd(), PollFlags::POLLIN);
        match poll(&mut [poll_fd], PollTimeout::from(READ_POLL_TIMEOUT_MS)) {
            Ok(0) => return Err(io::ErrorKind::WouldBlock.into()),
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => return Err(io::ErrorKind::Interrupted.into()),
            Err(e) => return Err(io::Error::from(e)),
        }
        self.file.read(buf)
    }
}

impl Drop for TunReader {
    fn drop(&mut self) {
        debug!(name = %self.name, "TUN reader closed");
    }
}

/// Write half of a [`TunDevice`]
pub struct TunWriter {
    name: String,
    file: File,
}

impl PacketWriter for TunWriter {
    fn write_packet(&mut self, packet: &[u8]) -> io::Result<usize> {
        self.file.write(packet)
    }
}

impl Drop for TunWriter {
    fn drop(&mut self) {
        debug!(name = %self.name, "TUN writer closed");
    }
}

/// RAII guard for socket fd
struct SockGuard(RawFd);

impl Drop for SockGuard {
    fn drop(&mut self) {
        unsafe { libc::close(self.0) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_name_fits() {
        assert!(DEFAULT_TUN_NAME.len() < libc::IFNAMSIZ);
    }

    #[test]
    fn test_ifreq_rejects_long_name() {
        let name = "x".repeat(libc::IFNAMSIZ);
        assert!(IfReq::new(&name, IFF_TUN).is_err());
        assert!(IfReq::new("", IFF_TUN).is_err());
    }

    #[test]
    fn test_ifreq_copies_name() {
        let ifr = IfReq::new("tp0", IFF_TUN | IFF_NO_PI).unwrap();
        assert_eq!(ifr.ifr_name[0] as u8, b't');
        assert_eq!(ifr.ifr_name[2] as u8, b'0');
        assert_eq!(ifr.ifr_name[3], 0);
        assert_eq!(ifr.ifr_flags, IFF_TUN | IFF_NO_PI);
    }

    // Note: Actual TUN device creation requires CAP_NET_ADMIN
}
