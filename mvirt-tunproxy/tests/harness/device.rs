//! In-memory virtual interface
//!
//! Each direction is a crossbeam channel of whole datagrams. The reader half
//! behaves like the real TUN reader: it waits a short while and reports
//! `WouldBlock` when nothing arrived, and fails once the device side is gone.

use std::io;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};

use mvirt_tunproxy::tun::{PacketReader, PacketWriter};

use super::packets::{self, Segment};

const READ_WAIT: Duration = Duration::from_millis(20);

/// Test side of the interface
pub struct FakeDevice {
    /// Datagrams the device "sends" (captured by the proxy)
    pub to_proxy: Sender<Vec<u8>>,
    /// Datagrams the proxy injects into the device
    pub from_proxy: Receiver<Vec<u8>>,
}

pub struct FakeReader {
    rx: Receiver<Vec<u8>>,
}

pub struct FakeWriter {
    tx: Sender<Vec<u8>>,
}

pub fn fake_device() -> (FakeDevice, FakeReader, FakeWriter) {
    let (to_proxy, reader_rx) = unbounded();
    let (writer_tx, from_proxy) = unbounded();
    (
        FakeDevice {
            to_proxy,
            from_proxy,
        },
        FakeReader { rx: reader_rx },
        FakeWriter { tx: writer_tx },
    )
}

impl PacketReader for FakeReader {
    fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.rx.recv_timeout(READ_WAIT) {
            Ok(frame) => {
                buf[..frame.len()].copy_from_slice(&frame);
                Ok(frame.len())
            }
            Err(RecvTimeoutError::Timeout) => Err(io::ErrorKind::WouldBlock.into()),
            Err(RecvTimeoutError::Disconnected) => Err(io::ErrorKind::BrokenPipe.into()),
        }
    }
}

impl PacketWriter for FakeWriter {
    fn write_packet(&mut self, packet: &[u8]) -> io::Result<usize> {
        self.tx
            .send(packet.to_vec())
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        Ok(packet.len())
    }
}

impl FakeDevice {
    pub fn send(&self, frame: Vec<u8>) {
        self.to_proxy.send(frame).expect("proxy reader gone");
    }

    pub fn recv(&self, timeout: Duration) -> Option<Vec<u8>> {
        self.from_proxy.recv_timeout(timeout).ok()
    }

    /// Next datagram from the proxy, checked and decoded as TCP.
    pub fn expect_tcp(&self, timeout: Duration) -> Segment {
        let frame = self.recv(timeout).expect("no datagram from proxy");
        packets::verify_checksums(&frame);
        packets::decode_tcp(&frame)
    }
}
