//! Packet building and checking utilities for tests

use std::net::SocketAddrV4;

use smoltcp::wire::{IpAddress, IpProtocol, Ipv4Packet, TcpPacket, UdpPacket};

use mvirt_tunproxy::packet::{self, TcpFlags, TcpSegment};

/// Decoded TCP datagram
#[derive(Debug, Clone)]
pub struct Segment {
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub payload: Vec<u8>,
}

/// Build a TCP datagram as the device would send it
pub fn tcp(
    src: SocketAddrV4,
    dst: SocketAddrV4,
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    payload: &[u8],
) -> Vec<u8> {
    let segment = TcpSegment {
        src,
        dst,
        seq,
        ack,
        flags,
    };
    let mut buf = vec![0u8; 40 + payload.len()];
    let len = packet::build_tcp(&mut buf, &segment, payload).expect("build TCP datagram");
    buf.truncate(len);
    buf
}

/// Build a UDP datagram as the device would send it
pub fn udp(src: SocketAddrV4, dst: SocketAddrV4, payload: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; 28 + payload.len()];
    let len = packet::build_udp(&mut buf, src, dst, payload).expect("build UDP datagram");
    buf.truncate(len);
    buf
}

/// Check every checksum of a datagram with smoltcp.
pub fn verify_checksums(frame: &[u8]) {
    let ip = Ipv4Packet::new_checked(frame).expect("valid IPv4 datagram");
    assert!(ip.verify_checksum(), "bad IPv4 checksum");

    let src = IpAddress::Ipv4(ip.src_addr());
    let dst = IpAddress::Ipv4(ip.dst_addr());
    match ip.next_header() {
        IpProtocol::Tcp => {
            let tcp = TcpPacket::new_checked(ip.payload()).expect("valid TCP header");
            assert!(tcp.verify_checksum(&src, &dst), "bad TCP checksum");
        }
        IpProtocol::Udp => {
            let udp = UdpPacket::new_checked(ip.payload()).expect("valid UDP header");
            assert!(udp.verify_checksum(&src, &dst), "bad UDP checksum");
        }
        other => panic!("unexpected protocol {other}"),
    }
}

pub fn decode_tcp(frame: &[u8]) -> Segment {
    let view = packet::parse(frame).expect("parse datagram");
    let tcp = view.tcp().expect("TCP datagram");
    Segment {
        src: view.source().expect("source"),
        dst: view.destination().expect("destination"),
        seq: tcp.seq,
        ack: tcp.ack,
        flags: tcp.flags,
        payload: view.payload().to_vec(),
    }
}
