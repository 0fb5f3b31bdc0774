//! Keeping the proxy's own sockets out of the capture
//!
//! Every outbound socket goes through a [`SocketProtector`] before it
//! connects. Without it, traffic the proxy sends on behalf of the device
//! would be routed straight back into the TUN device.

use std::io;

use socket2::Socket;

pub trait SocketProtector: Send + Sync {
    fn protect(&self, socket: &Socket) -> io::Result<()>;
}

impl<F> SocketProtector for F
where
    F: Fn(&Socket) -> io::Result<()> + Send + Sync,
{
    fn protect(&self, socket: &Socket) -> io::Result<()> {
        self(socket)
    }
}

/// Leaves sockets untouched.
///
/// Only correct when the destinations are not routed through the TUN device
/// (loopback, or hosts that route by source address).
#[derive(Debug, Clone, Copy, Default)]
pub struct Unprotected;

impl SocketProtector for Unprotected {
    fn protect(&self, _socket: &Socket) -> io::Result<()> {
        Ok(())
    }
}

/// Tags sockets with `SO_MARK` so a policy routing rule can send them via
/// the real uplink. Requires CAP_NET_ADMIN.
#[derive(Debug, Clone, Copy)]
pub struct FwMark(pub u32);

impl SocketProtector for FwMark {
    fn protect(&self, socket: &Socket) -> io::Result<()> {
        socket.set_mark(self.0)
    }
}

/// Pins sockets to a named interface with `SO_BINDTODEVICE`.
#[derive(Debug, Clone)]
pub struct BindDevice(pub String);

impl SocketProtector for BindDevice {
    fn protect(&self, socket: &Socket) -> io::Result<()> {
        socket.bind_device(Some(self.0.as_bytes()))
    }
}
