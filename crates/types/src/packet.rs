//! Packets and their on-the-wire encoding.
//!
//! # Wire Format
//!
//! Packets travel over point-to-point links as PPP frames:
//!
//! ```text
//! [PPP protocol: 2][IPv4 header: 20][TCP header: 20][payload: N zero bytes]
//! ```
//!
//! The payload content is never modelled, only its length; it is encoded as
//! zeros so capture files stay deterministic. IPv4 and TCP checksums are real.

use crate::identifiers::PacketUid;
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::net::Ipv4Addr;
use std::ops::BitOr;
use thiserror::Error;

/// Length of the PPP protocol field.
pub const PPP_HEADER_LEN: usize = 2;
/// Length of an IPv4 header without options.
pub const IPV4_HEADER_LEN: usize = 20;
/// Length of a TCP header without options.
pub const TCP_HEADER_LEN: usize = 20;
/// Total per-packet header overhead on a point-to-point link.
pub const HEADER_OVERHEAD: usize = PPP_HEADER_LEN + IPV4_HEADER_LEN + TCP_HEADER_LEN;

/// Largest TCP payload whose IPv4 total length still fits in 16 bits.
pub const MAX_SEGMENT_PAYLOAD: u32 = u16::MAX as u32 - (IPV4_HEADER_LEN + TCP_HEADER_LEN) as u32;

/// PPP protocol number for IPv4.
pub const PPP_PROTOCOL_IPV4: u16 = 0x0021;
/// IP protocol number for TCP.
pub const IP_PROTOCOL_TCP: u8 = 6;
/// Default IPv4 time-to-live.
pub const DEFAULT_TTL: u8 = 64;

/// Errors decoding a captured frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("Frame too short: {0} bytes")]
    TooShort(usize),

    #[error("Unsupported PPP protocol: {0:#06x}")]
    UnsupportedPppProtocol(u16),

    #[error("Unsupported IP version/header length: {0:#04x}")]
    UnsupportedIpHeader(u8),

    #[error("Unsupported IP protocol: {0}")]
    UnsupportedIpProtocol(u8),

    #[error("Total length {total} does not match frame length {actual}")]
    LengthMismatch { total: usize, actual: usize },
}

/// Errors building a packet.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("Payload of {len} bytes exceeds the IPv4 limit of {MAX_SEGMENT_PAYLOAD}")]
    PayloadTooLarge { len: u32 },
}

/// TCP control flags.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TcpFlags(u8);

impl TcpFlags {
    pub const NONE: Self = TcpFlags(0);
    pub const FIN: Self = TcpFlags(0x01);
    pub const SYN: Self = TcpFlags(0x02);
    pub const RST: Self = TcpFlags(0x04);
    pub const PSH: Self = TcpFlags(0x08);
    pub const ACK: Self = TcpFlags(0x10);

    /// Raw flag bits.
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Build from raw bits (unknown bits are kept).
    pub fn from_bits(bits: u8) -> Self {
        TcpFlags(bits)
    }

    /// Whether every flag in `other` is set.
    pub fn contains(self, other: TcpFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for TcpFlags {
    type Output = TcpFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        TcpFlags(self.0 | rhs.0)
    }
}

impl fmt::Debug for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(TcpFlags, &str); 5] = [
            (TcpFlags::SYN, "SYN"),
            (TcpFlags::FIN, "FIN"),
            (TcpFlags::RST, "RST"),
            (TcpFlags::PSH, "PSH"),
            (TcpFlags::ACK, "ACK"),
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

/// A TCP segment header plus the length of the (virtual) payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpSegment {
    pub src_port: u16,
    pub dst_port: u16,
    /// Wire sequence number.
    pub seq: u32,
    /// Wire acknowledgement number (meaningful only with `ACK`).
    pub ack: u32,
    pub flags: TcpFlags,
    /// Advertised receive window in bytes.
    pub window: u16,
    /// Payload length in bytes.
    pub payload_len: u32,
}

impl TcpSegment {
    /// Sequence space consumed by this segment (payload + SYN + FIN).
    pub fn seq_len(&self) -> u32 {
        let mut len = self.payload_len;
        if self.flags.contains(TcpFlags::SYN) {
            len += 1;
        }
        if self.flags.contains(TcpFlags::FIN) {
            len += 1;
        }
        len
    }

    /// True for a segment that only acknowledges (no data, SYN, FIN or RST).
    pub fn is_pure_ack(&self) -> bool {
        self.payload_len == 0
            && self.flags.contains(TcpFlags::ACK)
            && !self.flags.contains(TcpFlags::SYN)
            && !self.flags.contains(TcpFlags::FIN)
            && !self.flags.contains(TcpFlags::RST)
    }
}

/// IPv4 header fields that vary per packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub ttl: u8,
    pub identification: u16,
}

/// A packet in flight: immutable once created.
///
/// Cloning is cheap; the payload is a length, not a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    uid: PacketUid,
    ip: Ipv4Header,
    tcp: TcpSegment,
}

impl Packet {
    /// Create a packet carrying `segment` from `src` to `dst`.
    ///
    /// Fails if the datagram would not fit the IPv4 total length field.
    pub fn new(
        uid: PacketUid,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        segment: TcpSegment,
    ) -> Result<Self, PacketError> {
        if segment.payload_len > MAX_SEGMENT_PAYLOAD {
            return Err(PacketError::PayloadTooLarge {
                len: segment.payload_len,
            });
        }
        Ok(Self {
            uid,
            ip: Ipv4Header {
                src,
                dst,
                ttl: DEFAULT_TTL,
                identification: uid.0 as u16,
            },
            tcp: segment,
        })
    }

    /// Unique packet id.
    pub fn uid(&self) -> PacketUid {
        self.uid
    }

    /// IPv4 header.
    pub fn ip(&self) -> &Ipv4Header {
        &self.ip
    }

    /// TCP segment.
    pub fn tcp(&self) -> &TcpSegment {
        &self.tcp
    }

    /// Source address.
    pub fn src(&self) -> Ipv4Addr {
        self.ip.src
    }

    /// Destination address.
    pub fn dst(&self) -> Ipv4Addr {
        self.ip.dst
    }

    /// Size of the IP datagram (IPv4 + TCP headers + payload).
    pub fn ip_len(&self) -> usize {
        IPV4_HEADER_LEN + TCP_HEADER_LEN + self.tcp.payload_len as usize
    }

    /// `ip_len` as carried in the header; `new` guarantees it fits.
    fn total_length(&self) -> u16 {
        u16::try_from(self.ip_len()).unwrap_or(u16::MAX)
    }

    /// Size on a point-to-point link, including the PPP header.
    pub fn size(&self) -> u64 {
        (PPP_HEADER_LEN + self.ip_len()) as u64
    }

    /// Encode as a PPP frame.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.size() as usize);
        buf.put_u16(PPP_PROTOCOL_IPV4);
        self.encode_ipv4_header(&mut buf);
        self.encode_tcp_header(&mut buf);
        buf.put_bytes(0, self.tcp.payload_len as usize);
        buf.freeze()
    }

    fn encode_ipv4_header(&self, buf: &mut BytesMut) {
        let mut header = [0u8; IPV4_HEADER_LEN];
        header[0] = 0x45; // version 4, IHL 5
        header[1] = 0; // DSCP/ECN
        header[2..4].copy_from_slice(&self.total_length().to_be_bytes());
        header[4..6].copy_from_slice(&self.ip.identification.to_be_bytes());
        // flags + fragment offset stay zero
        header[8] = self.ip.ttl;
        header[9] = IP_PROTOCOL_TCP;
        header[12..16].copy_from_slice(&self.ip.src.octets());
        header[16..20].copy_from_slice(&self.ip.dst.octets());
        let checksum = internet_checksum(&[&header]);
        header[10..12].copy_from_slice(&checksum.to_be_bytes());
        buf.put_slice(&header);
    }

    fn encode_tcp_header(&self, buf: &mut BytesMut) {
        let seg = &self.tcp;
        let mut header = [0u8; TCP_HEADER_LEN];
        header[0..2].copy_from_slice(&seg.src_port.to_be_bytes());
        header[2..4].copy_from_slice(&seg.dst_port.to_be_bytes());
        header[4..8].copy_from_slice(&seg.seq.to_be_bytes());
        header[8..12].copy_from_slice(&seg.ack.to_be_bytes());
        header[12] = ((TCP_HEADER_LEN / 4) as u8) << 4;
        header[13] = seg.flags.bits();
        header[14..16].copy_from_slice(&seg.window.to_be_bytes());
        // urgent pointer stays zero

        let tcp_len = self.total_length() - IPV4_HEADER_LEN as u16;
        let pseudo = pseudo_header(self.ip.src, self.ip.dst, tcp_len);
        // Zero payload bytes do not contribute to the sum.
        let checksum = internet_checksum(&[&pseudo, &header]);
        header[16..18].copy_from_slice(&checksum.to_be_bytes());
        buf.put_slice(&header);
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}:{} > {}:{} [{}] seq={} ack={} len={}",
            self.uid,
            self.ip.src,
            self.tcp.src_port,
            self.ip.dst,
            self.tcp.dst_port,
            self.tcp.flags,
            self.tcp.seq,
            self.tcp.ack,
            self.tcp.payload_len
        )
    }
}

/// Decode the headers of a PPP frame produced by [`Packet::encode`].
pub fn decode_frame(frame: &[u8]) -> Result<(Ipv4Header, TcpSegment), FrameError> {
    if frame.len() < HEADER_OVERHEAD {
        return Err(FrameError::TooShort(frame.len()));
    }

    let ppp = u16::from_be_bytes([frame[0], frame[1]]);
    if ppp != PPP_PROTOCOL_IPV4 {
        return Err(FrameError::UnsupportedPppProtocol(ppp));
    }

    let ip = &frame[PPP_HEADER_LEN..];
    if ip[0] != 0x45 {
        return Err(FrameError::UnsupportedIpHeader(ip[0]));
    }
    if ip[9] != IP_PROTOCOL_TCP {
        return Err(FrameError::UnsupportedIpProtocol(ip[9]));
    }
    let total = u16::from_be_bytes([ip[2], ip[3]]) as usize;
    if total != ip.len() {
        return Err(FrameError::LengthMismatch {
            total,
            actual: ip.len(),
        });
    }

    let header = Ipv4Header {
        src: Ipv4Addr::new(ip[12], ip[13], ip[14], ip[15]),
        dst: Ipv4Addr::new(ip[16], ip[17], ip[18], ip[19]),
        ttl: ip[8],
        identification: u16::from_be_bytes([ip[4], ip[5]]),
    };

    let tcp = &ip[IPV4_HEADER_LEN..];
    let segment = TcpSegment {
        src_port: u16::from_be_bytes([tcp[0], tcp[1]]),
        dst_port: u16::from_be_bytes([tcp[2], tcp[3]]),
        seq: u32::from_be_bytes([tcp[4], tcp[5], tcp[6], tcp[7]]),
        ack: u32::from_be_bytes([tcp[8], tcp[9], tcp[10], tcp[11]]),
        flags: TcpFlags::from_bits(tcp[13]),
        window: u16::from_be_bytes([tcp[14], tcp[15]]),
        payload_len: (total - IPV4_HEADER_LEN - TCP_HEADER_LEN) as u32,
    };

    Ok((header, segment))
}

fn pseudo_header(src: Ipv4Addr, dst: Ipv4Addr, tcp_len: u16) -> [u8; 12] {
    let mut pseudo = [0u8; 12];
    pseudo[0..4].copy_from_slice(&src.octets());
    pseudo[4..8].copy_from_slice(&dst.octets());
    pseudo[9] = IP_PROTOCOL_TCP;
    pseudo[10..12].copy_from_slice(&tcp_len.to_be_bytes());
    pseudo
}

/// RFC 1071 ones' complement checksum over the concatenation of `chunks`.
///
/// Every chunk except the last must have even length.
pub fn internet_checksum(chunks: &[&[u8]]) -> u16 {
    let mut sum: u32 = 0;
    for chunk in chunks {
        let mut words = chunk.chunks_exact(2);
        for word in &mut words {
            sum += u16::from_be_bytes([word[0], word[1]]) as u32;
        }
        if let [last] = words.remainder() {
            sum += (*last as u32) << 8;
        }
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_segment(len: u32) -> TcpSegment {
        TcpSegment {
            src_port: 49153,
            dst_port: 9,
            seq: 1000,
            ack: 1,
            flags: TcpFlags::ACK,
            window: 65535,
            payload_len: len,
        }
    }

    fn packet(len: u32) -> Packet {
        Packet::new(
            PacketUid(7),
            Ipv4Addr::new(10, 1, 1, 1),
            Ipv4Addr::new(10, 1, 1, 2),
            data_segment(len),
        )
        .unwrap()
    }

    #[test]
    fn test_sizes() {
        let p = packet(512);
        assert_eq!(p.ip_len(), 552);
        assert_eq!(p.size(), 554);
        assert_eq!(p.encode().len(), 554);
    }

    #[test]
    fn test_largest_payload_fits_total_length() {
        let p = packet(MAX_SEGMENT_PAYLOAD);
        let frame = p.encode();
        assert_eq!(p.ip_len(), u16::MAX as usize);
        assert_eq!(&frame[PPP_HEADER_LEN + 2..PPP_HEADER_LEN + 4], &[0xff, 0xff]);
        assert!(decode_frame(&frame).is_ok());

        let oversized = Packet::new(
            PacketUid(8),
            Ipv4Addr::new(10, 1, 1, 1),
            Ipv4Addr::new(10, 1, 1, 2),
            data_segment(MAX_SEGMENT_PAYLOAD + 1),
        );
        assert_eq!(
            oversized,
            Err(PacketError::PayloadTooLarge {
                len: MAX_SEGMENT_PAYLOAD + 1
            })
        );
    }

    #[test]
    fn test_seq_len_counts_syn_and_fin() {
        let mut seg = data_segment(0);
        seg.flags = TcpFlags::SYN;
        assert_eq!(seg.seq_len(), 1);
        seg.flags = TcpFlags::FIN | TcpFlags::ACK;
        seg.payload_len = 10;
        assert_eq!(seg.seq_len(), 11);
        assert!(!seg.is_pure_ack());
        assert!(data_segment(0).is_pure_ack());
    }

    #[test]
    fn test_encoded_checksums_verify() {
        let p = packet(513); // odd length payload
        let frame = p.encode();

        let ip = &frame[PPP_HEADER_LEN..PPP_HEADER_LEN + IPV4_HEADER_LEN];
        assert_eq!(internet_checksum(&[ip]), 0, "IPv4 header checksum must verify");

        let tcp = &frame[PPP_HEADER_LEN + IPV4_HEADER_LEN..];
        let pseudo = pseudo_header(p.src(), p.dst(), tcp.len() as u16);
        assert_eq!(
            internet_checksum(&[&pseudo, tcp]),
            0,
            "TCP checksum must verify over pseudo header, header and payload"
        );
    }

    #[test]
    fn test_decode_frame() {
        let p = packet(100);
        let (ip, seg) = decode_frame(&p.encode()).unwrap();
        assert_eq!(ip, *p.ip());
        assert_eq!(seg, *p.tcp());
    }

    #[test]
    fn test_decode_rejects_truncated_frame() {
        let frame = packet(100).encode();
        assert_eq!(
            decode_frame(&frame[..10]),
            Err(FrameError::TooShort(10))
        );
        assert!(matches!(
            decode_frame(&frame[..frame.len() - 1]),
            Err(FrameError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_flags_display() {
        assert_eq!((TcpFlags::SYN | TcpFlags::ACK).to_string(), "SYN|ACK");
        assert_eq!(TcpFlags::NONE.to_string(), "-");
    }
}
