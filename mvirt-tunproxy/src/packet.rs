//! IPv4 / TCP / UDP header codec
//!
//! Parsing reads fixed header offsets straight out of the frame and returns a
//! borrowed [`PacketView`]. Building writes a complete datagram (IPv4 header
//! without options, TCP header without options or UDP header, payload) into
//! a caller-supplied buffer and fills in every checksum.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::ops::BitOr;

use thiserror::Error;

/// IPv4 header size (without options)
pub const IPV4_HEADER_LEN: usize = 20;

/// TCP header size (without options)
pub const TCP_HEADER_LEN: usize = 20;

/// UDP header size
pub const UDP_HEADER_LEN: usize = 8;

pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

/// TTL of synthesized datagrams
pub const DEFAULT_TTL: u8 = 64;

/// Advertised receive window of synthesized TCP segments
pub const TCP_WINDOW: u16 = 64000;

/// Largest datagram the IPv4 total length field can describe
pub const MAX_DATAGRAM_LEN: usize = 65535;

/// TCP flag bits (byte 13 of the TCP header).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TcpFlags(u8);

impl TcpFlags {
    pub const FIN: TcpFlags = TcpFlags(0x01);
    pub const SYN: TcpFlags = TcpFlags(0x02);
    pub const RST: TcpFlags = TcpFlags(0x04);
    pub const PSH: TcpFlags = TcpFlags(0x08);
    pub const ACK: TcpFlags = TcpFlags(0x10);
    pub const URG: TcpFlags = TcpFlags(0x20);

    #[inline]
    pub const fn from_bits(bits: u8) -> Self {
        TcpFlags(bits)
    }

    #[inline]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[inline]
    pub const fn contains(self, other: TcpFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for TcpFlags {
    type Output = TcpFlags;

    fn bitor(self, rhs: TcpFlags) -> TcpFlags {
        TcpFlags(self.0 | rhs.0)
    }
}

impl fmt::Debug for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(TcpFlags, &str); 6] = [
            (TcpFlags::SYN, "SYN"),
            (TcpFlags::FIN, "FIN"),
            (TcpFlags::RST, "RST"),
            (TcpFlags::PSH, "PSH"),
            (TcpFlags::ACK, "ACK"),
            (TcpFlags::URG, "URG"),
        ];
        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("-")?;
        }
        Ok(())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("datagram too short: {0} bytes")]
    TooShort(usize),

    #[error("not an IPv4 datagram (version {0})")]
    NotIpv4(u8),

    #[error("invalid IPv4 header length {0}")]
    BadHeaderLength(usize),

    #[error("datagram truncated")]
    Truncated,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    #[error("datagram of {0} bytes exceeds the IPv4 maximum")]
    PayloadTooLarge(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    /// Header length in bytes (data offset x 4)
    pub header_len: usize,
    pub flags: TcpFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp(TcpHeader),
    Udp(UdpHeader),
    Other,
}

/// Parsed view of one IPv4 datagram.
///
/// Borrows the frame it was parsed from, so the frame cannot be modified
/// while the view is alive.
#[derive(Debug, Clone, Copy)]
pub struct PacketView<'a> {
    buf: &'a [u8],
    pub version: u8,
    /// IPv4 header length in bytes
    pub header_len: usize,
    /// Value of the IPv4 total length field
    pub total_len: usize,
    pub protocol: u8,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub transport: Transport,
    payload_offset: usize,
    payload_len: usize,
}

impl<'a> PacketView<'a> {
    /// Transport payload (empty for non TCP/UDP datagrams)
    #[inline]
    pub fn payload(&self) -> &'a [u8] {
        &self.buf[self.payload_offset..self.payload_offset + self.payload_len]
    }

    #[inline]
    pub fn payload_len(&self) -> usize {
        self.payload_len
    }

    pub fn tcp(&self) -> Option<&TcpHeader> {
        match &self.transport {
            Transport::Tcp(tcp) => Some(tcp),
            _ => None,
        }
    }

    pub fn udp(&self) -> Option<&UdpHeader> {
        match &self.transport {
            Transport::Udp(udp) => Some(udp),
            _ => None,
        }
    }

    fn ports(&self) -> Option<(u16, u16)> {
        match self.transport {
            Transport::Tcp(tcp) => Some((tcp.src_port, tcp.dst_port)),
            Transport::Udp(udp) => Some((udp.src_port, udp.dst_port)),
            Transport::Other => None,
        }
    }

    /// Source address and port (TCP/UDP only)
    pub fn source(&self) -> Option<SocketAddrV4> {
        self.ports()
            .map(|(src_port, _)| SocketAddrV4::new(self.src, src_port))
    }

    /// Destination address and port (TCP/UDP only)
    pub fn destination(&self) -> Option<SocketAddrV4> {
        self.ports()
            .map(|(_, dst_port)| SocketAddrV4::new(self.dst, dst_port))
    }
}

#[inline]
fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([buf[offset], buf[offset + 1]])
}

#[inline]
fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

#[inline]
fn read_ipv4(buf: &[u8], offset: usize) -> Ipv4Addr {
    Ipv4Addr::new(
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    )
}

/// Parse one IPv4 datagram.
pub fn parse(buf: &[u8]) -> Result<PacketView<'_>, ParseError> {
    if buf.len() < IPV4_HEADER_LEN {
        return Err(ParseError::TooShort(buf.len()));
    }

    let version = buf[0] >> 4;
    if version != 4 {
        return Err(ParseError::NotIpv4(version));
    }

    let header_len = usize::from(buf[0] & 0x0f) * 4;
    if header_len < IPV4_HEADER_LEN || header_len > buf.len() {
        return Err(ParseError::BadHeaderLength(header_len));
    }

    // Anything past total_len is link padding.
    let total_len = usize::from(read_u16(buf, 2));
    if total_len < header_len || total_len > buf.len() {
        return Err(ParseError::Truncated);
    }

    let protocol = buf[9];
    let src = read_ipv4(buf, 12);
    let dst = read_ipv4(buf, 16);
    let hl = header_len;

    let (transport, payload_offset) = match protocol {
        PROTO_TCP => {
            if total_len < hl + TCP_HEADER_LEN {
                return Err(ParseError::Truncated);
            }
            let tcp_header_len = usize::from(buf[hl + 12] >> 4) * 4;
            if tcp_header_len < TCP_HEADER_LEN || hl + tcp_header_len > total_len {
                return Err(ParseError::Truncated);
            }
            let tcp = TcpHeader {
                src_port: read_u16(buf, hl),
                dst_port: read_u16(buf, hl + 2),
                seq: read_u32(buf, hl + 4),
                ack: read_u32(buf, hl + 8),
                header_len: tcp_header_len,
                flags: TcpFlags::from_bits(buf[hl + 13]),
            };
            (Transport::Tcp(tcp), hl + tcp_header_len)
        }
        PROTO_UDP => {
            if total_len < hl + UDP_HEADER_LEN {
                return Err(ParseError::Truncated);
            }
            let udp = UdpHeader {
                src_port: read_u16(buf, hl),
                dst_port: read_u16(buf, hl + 2),
            };
            (Transport::Udp(udp), hl + UDP_HEADER_LEN)
        }
        _ => (Transport::Other, total_len),
    };

    Ok(PacketView {
        buf,
        version,
        header_len,
        total_len,
        protocol,
        src,
        dst,
        transport,
        payload_offset,
        payload_len: total_len - payload_offset,
    })
}

// ============================================================================
// Checksums
// ============================================================================

/// Add `data` to a running one's-complement sum as big-endian 16-bit words.
/// An odd trailing byte becomes the high byte of a final word.
fn sum_words(data: &[u8], mut sum: u32) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }
    sum
}

/// Fold carries above bit 15 back into the low 16 bits until none remain.
#[inline]
fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum as u16
}

/// Internet checksum of `data` as it stands.
///
/// Over a header that already carries a correct checksum this yields 0.
pub fn internet_checksum(data: &[u8]) -> u16 {
    !fold(sum_words(data, 0))
}

/// IPv4 header checksum, treating the checksum field (bytes 10..12) as zero.
pub fn ipv4_checksum(header: &[u8]) -> u16 {
    let sum = sum_words(&header[..10], 0);
    !fold(sum_words(&header[12..], sum))
}

/// TCP/UDP checksum over the pseudo-header and `segment`.
///
/// The checksum field inside `segment` must be zero.
pub fn transport_checksum(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, segment: &[u8]) -> u16 {
    let mut sum = sum_words(&src.octets(), 0);
    sum = sum_words(&dst.octets(), sum);
    sum += u32::from(protocol);
    sum += segment.len() as u32;
    !fold(sum_words(segment, sum))
}

// ============================================================================
// Building
// ============================================================================

/// Header fields of a TCP segment to synthesize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpSegment {
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
}

fn check_room(buf: &[u8], total_len: usize) -> Result<(), BuildError> {
    if total_len > MAX_DATAGRAM_LEN {
        return Err(BuildError::PayloadTooLarge(total_len));
    }
    if buf.len() < total_len {
        return Err(BuildError::BufferTooSmall {
            needed: total_len,
            available: buf.len(),
        });
    }
    Ok(())
}

fn write_ipv4_header(buf: &mut [u8], total_len: usize, protocol: u8, src: Ipv4Addr, dst: Ipv4Addr) {
    let header = &mut buf[..IPV4_HEADER_LEN];
    header[0] = 0x45; // version 4, IHL 5
    header[1] = 0; // DSCP/ECN
    header[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    header[4..6].fill(0); // identification
    header[6..8].fill(0); // flags/fragment offset
    header[8] = DEFAULT_TTL;
    header[9] = protocol;
    header[10..12].fill(0);
    header[12..16].copy_from_slice(&src.octets());
    header[16..20].copy_from_slice(&dst.octets());

    let checksum = ipv4_checksum(header);
    header[10..12].copy_from_slice(&checksum.to_be_bytes());
}

/// Write an IPv4 + TCP datagram into `buf`; returns its length.
pub fn build_tcp(buf: &mut [u8], segment: &TcpSegment, payload: &[u8]) -> Result<usize, BuildError> {
    let tcp_len = TCP_HEADER_LEN + payload.len();
    let total_len = IPV4_HEADER_LEN + tcp_len;
    check_room(buf, total_len)?;

    write_ipv4_header(
        buf,
        total_len,
        PROTO_TCP,
        *segment.src.ip(),
        *segment.dst.ip(),
    );

    let tcp = &mut buf[IPV4_HEADER_LEN..total_len];
    tcp[0..2].copy_from_slice(&segment.src.port().to_be_bytes());
    tcp[2..4].copy_from_slice(&segment.dst.port().to_be_bytes());
    tcp[4..8].copy_from_slice(&segment.seq.to_be_bytes());
    tcp[8..12].copy_from_slice(&segment.ack.to_be_bytes());
    tcp[12] = ((TCP_HEADER_LEN / 4) as u8) << 4;
    tcp[13] = segment.flags.bits();
    tcp[14..16].copy_from_slice(&TCP_WINDOW.to_be_bytes());
    tcp[16..18].fill(0); // checksum
    tcp[18..20].fill(0); // urgent pointer
    tcp[TCP_HEADER_LEN..].copy_from_slice(payload);

    let checksum = transport_checksum(*segment.src.ip(), *segment.dst.ip(), PROTO_TCP, tcp);
    tcp[16..18].copy_from_slice(&checksum.to_be_bytes());

    Ok(total_len)
}

/// Write an IPv4 + UDP datagram into `buf`; returns its length.
pub fn build_udp(
    buf: &mut [u8],
    src: SocketAddrV4,
    dst: SocketAddrV4,
    payload: &[u8],
) -> Result<usize, BuildError> {
    let udp_len = UDP_HEADER_LEN + payload.len();
    let total_len = IPV4_HEADER_LEN + udp_len;
    check_room(buf, total_len)?;

    write_ipv4_header(buf, total_len, PROTO_UDP, *src.ip(), *dst.ip());

    let udp = &mut buf[IPV4_HEADER_LEN..total_len];
    udp[0..2].copy_from_slice(&src.port().to_be_bytes());
    udp[2..4].copy_from_slice(&dst.port().to_be_bytes());
    udp[4..6].copy_from_slice(&(udp_len as u16).to_be_bytes());
    udp[6..8].fill(0);
    udp[UDP_HEADER_LEN..].copy_from_slice(payload);

    // Zero means "no checksum" for UDP, so a computed zero goes out as 0xffff.
    let checksum = match transport_checksum(*src.ip(), *dst.ip(), PROTO_UDP, udp) {
        0 => 0xffff,
        c => c,
    };
    udp[6..8].copy_from_slice(&checksum.to_be_bytes());

    Ok(total_len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use smoltcp::wire::{IpAddress, Ipv4Packet, TcpPacket, UdpPacket};

    fn addr(a: [u8; 4], port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::from(a), port)
    }

    fn segment(flags: TcpFlags) -> TcpSegment {
        TcpSegment {
            src: addr([10, 0, 0, 2], 40000),
            dst: addr([93, 184, 216, 34], 80),
            seq: 1000,
            ack: 77,
            flags,
        }
    }

    fn smoltcp_verify_tcp(bytes: &[u8]) {
        let ip = Ipv4Packet::new_checked(bytes).unwrap();
        assert!(ip.verify_checksum(), "IPv4 checksum rejected by smoltcp");
        let src = IpAddress::Ipv4(ip.src_addr());
        let dst = IpAddress::Ipv4(ip.dst_addr());
        let tcp = TcpPacket::new_checked(ip.payload()).unwrap();
        assert!(tcp.verify_checksum(&src, &dst), "TCP checksum rejected by smoltcp");
    }

    #[test]
    fn test_parse_too_short() {
        assert_eq!(parse(&[0x45; 19]).unwrap_err(), ParseError::TooShort(19));
        assert_eq!(parse(&[]).unwrap_err(), ParseError::TooShort(0));
    }

    #[test]
    fn test_parse_not_ipv4() {
        let mut buf = [0u8; 40];
        buf[0] = 0x60;
        assert_eq!(parse(&buf).unwrap_err(), ParseError::NotIpv4(6));
    }

    #[test]
    fn test_parse_truncated_total_length() {
        let mut buf = vec![0u8; 64];
        let len = build_tcp(&mut buf, &segment(TcpFlags::SYN), &[]).unwrap();
        assert_eq!(parse(&buf[..len - 1]).unwrap_err(), ParseError::Truncated);
    }

    #[test]
    fn test_parse_bad_header_length() {
        let mut buf = [0u8; 40];
        buf[0] = 0x44;
        assert_eq!(parse(&buf).unwrap_err(), ParseError::BadHeaderLength(16));
    }

    #[test]
    fn test_tcp_roundtrip_fields() {
        let mut buf = vec![0u8; 128];
        let payload = b"GET / HTTP/1.1\r\n";
        let seg = segment(TcpFlags::ACK | TcpFlags::PSH);
        let len = build_tcp(&mut buf, &seg, payload).unwrap();
        assert_eq!(len, 40 + payload.len());

        let view = parse(&buf[..len]).unwrap();
        assert_eq!(view.version, 4);
        assert_eq!(view.header_len, 20);
        assert_eq!(view.total_len, len);
        assert_eq!(view.protocol, PROTO_TCP);
        assert_eq!(view.source(), Some(seg.src));
        assert_eq!(view.destination(), Some(seg.dst));

        let tcp = view.tcp().unwrap();
        assert_eq!(tcp.seq, 1000);
        assert_eq!(tcp.ack, 77);
        assert_eq!(tcp.header_len, 20);
        assert!(tcp.flags.contains(TcpFlags::ACK));
        assert!(tcp.flags.contains(TcpFlags::PSH));
        assert!(!tcp.flags.contains(TcpFlags::SYN));
        assert_eq!(view.payload(), payload);

        // Window and urgent pointer
        assert_eq!(read_u16(&buf, 34), TCP_WINDOW);
        assert_eq!(read_u16(&buf, 38), 0);
    }

    #[test]
    fn test_tcp_checksums_verify() {
        let mut buf = vec![0u8; 128];
        let len = build_tcp(&mut buf, &segment(TcpFlags::SYN | TcpFlags::ACK), &[]).unwrap();

        // Recomputing over the transmitted header folds to zero.
        assert_eq!(internet_checksum(&buf[..IPV4_HEADER_LEN]), 0);
        smoltcp_verify_tcp(&buf[..len]);
    }

    #[test]
    fn test_tcp_checksum_odd_payload() {
        let mut buf = vec![0u8; 128];
        let len = build_tcp(&mut buf, &segment(TcpFlags::ACK), b"odd").unwrap();
        smoltcp_verify_tcp(&buf[..len]);

        // Pseudo-header + segment (checksum included) sums to all ones.
        let view = parse(&buf[..len]).unwrap();
        let mut sum = sum_words(&view.src.octets(), 0);
        sum = sum_words(&view.dst.octets(), sum);
        sum += u32::from(PROTO_TCP) + (len - IPV4_HEADER_LEN) as u32;
        sum = sum_words(&buf[IPV4_HEADER_LEN..len], sum);
        assert_eq!(fold(sum), 0xffff);
    }

    #[test]
    fn test_parse_then_rebuild_reproduces_checksum() {
        let mut original = vec![0u8; 256];
        let len = build_tcp(&mut original, &segment(TcpFlags::ACK), &[7u8; 99]).unwrap();

        let view = parse(&original[..len]).unwrap();
        let tcp = *view.tcp().unwrap();
        let rebuilt_seg = TcpSegment {
            src: view.source().unwrap(),
            dst: view.destination().unwrap(),
            seq: tcp.seq,
            ack: tcp.ack,
            flags: tcp.flags,
        };
        let mut rebuilt = vec![0u8; 256];
        let rebuilt_len = build_tcp(&mut rebuilt, &rebuilt_seg, view.payload()).unwrap();

        assert_eq!(&original[..len], &rebuilt[..rebuilt_len]);
    }

    #[test]
    fn test_udp_build_and_parse() {
        let mut buf = vec![0u8; 128];
        let src = addr([8, 8, 8, 8], 53);
        let dst = addr([10, 0, 0, 2], 5353);
        let len = build_udp(&mut buf, src, dst, b"dns answer").unwrap();
        assert_eq!(len, 28 + 10);

        let view = parse(&buf[..len]).unwrap();
        assert_eq!(view.protocol, PROTO_UDP);
        assert_eq!(view.source(), Some(src));
        assert_eq!(view.destination(), Some(dst));
        assert_eq!(view.payload(), b"dns answer");
        assert_eq!(read_u16(&buf, 24), 18);

        let ip = Ipv4Packet::new_checked(&buf[..len]).unwrap();
        assert!(ip.verify_checksum());
        let udp = UdpPacket::new_checked(ip.payload()).unwrap();
        assert!(udp.verify_checksum(
            &IpAddress::Ipv4(ip.src_addr()),
            &IpAddress::Ipv4(ip.dst_addr())
        ));
    }

    #[test]
    fn test_ignores_link_padding() {
        let mut buf = vec![0u8; 128];
        let len = build_udp(&mut buf, addr([1, 1, 1, 1], 1), addr([2, 2, 2, 2], 2), b"x").unwrap();
        // Frame carries trailing garbage beyond the total length.
        buf[len..len + 5].fill(0xEE);
        let view = parse(&buf[..len + 5]).unwrap();
        assert_eq!(view.payload(), b"x");
    }

    #[test]
    fn test_ip_options_shift_transport_header() {
        // IHL 6: one word of options before the UDP header.
        let mut buf = vec![0u8; 24 + 8 + 2];
        buf[0] = 0x46;
        let total = buf.len() as u16;
        buf[2..4].copy_from_slice(&total.to_be_bytes());
        buf[9] = PROTO_UDP;
        buf[24..26].copy_from_slice(&1234u16.to_be_bytes());
        buf[26..28].copy_from_slice(&53u16.to_be_bytes());
        buf[32..34].copy_from_slice(b"hi");

        let view = parse(&buf).unwrap();
        assert_eq!(view.header_len, 24);
        assert_eq!(view.udp().unwrap().src_port, 1234);
        assert_eq!(view.udp().unwrap().dst_port, 53);
        assert_eq!(view.payload(), b"hi");
    }

    #[test]
    fn test_other_protocol_has_no_ports() {
        let mut buf = [0u8; 28];
        buf[0] = 0x45;
        buf[2..4].copy_from_slice(&28u16.to_be_bytes());
        buf[9] = 1; // ICMP
        let view = parse(&buf).unwrap();
        assert_eq!(view.transport, Transport::Other);
        assert!(view.source().is_none());
        assert_eq!(view.payload_len(), 0);
    }

    #[test]
    fn test_buffer_too_small() {
        let mut buf = [0u8; 39];
        assert_eq!(
            build_tcp(&mut buf, &segment(TcpFlags::ACK), &[]),
            Err(BuildError::BufferTooSmall {
                needed: 40,
                available: 39
            })
        );
    }

    #[test]
    fn test_payload_too_large() {
        let mut buf = vec![0u8; 70_000];
        let payload = vec![0u8; 65_500];
        assert!(matches!(
            build_tcp(&mut buf, &segment(TcpFlags::ACK), &payload),
            Err(BuildError::PayloadTooLarge(_))
        ));
    }

    #[test]
    fn test_fold_carries() {
        assert_eq!(fold(0x0001_fffe), 0xffff);
        assert_eq!(fold(0x0002_fffe), 0x0001);
        assert_eq!(fold(0xffff_ffff), 0xffff);
    }

    #[test]
    fn test_flags_debug() {
        assert_eq!(format!("{:?}", TcpFlags::SYN | TcpFlags::ACK), "SYN|ACK");
        assert_eq!(format!("{:?}", TcpFlags::default()), "-");
    }
}
