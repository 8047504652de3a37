//! # Comtree Wire Format
//!
//! Fixed 16-byte header shared by data and control packets.
//!
//! ```text
//!  0       4       8               16                              32
//! +-------+-------+---------------+-------------------------------+
//! | ver=1 | flags |  packet type  |        payload length         |
//! +-------+-------+---------------+-------------------------------+
//! |                        comtree id (32)                        |
//! +---------------------------------------------------------------+
//! |                   source flat address (32)                    |
//! +---------------------------------------------------------------+
//! |                destination flat address (32)                  |
//! +---------------------------------------------------------------+
//! ```
//!
//! The ingress link is attached by the receiving router and is never
//! transmitted. Control payloads are described in [`crate::control`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

use crate::error::{Result, RouterError};
use crate::ids::{ComtreeId, FlatAddr};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Encoded header size in bytes.
pub const HEADER_LEN: usize = 16;

/// Largest payload a single datagram may carry.
pub const MAX_PAYLOAD_LEN: usize = 1500 - HEADER_LEN;

/// Header flag asking routers on the path to report a route to `dst` back
/// to `src`.
pub const FLAG_ROUTE_REQUEST: u8 = 0x01;

// ─── VarInt (QUIC-style, RFC 9000 §16) ──────────────────────────────────────

/// A 62-bit variable-length integer encoded in 1, 2, 4, or 8 bytes.
/// Used for control-packet sequence numbers.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VarInt(u64);

impl VarInt {
    /// Maximum representable value: 2^62 - 1.
    pub const MAX: u64 = (1 << 62) - 1;

    #[inline]
    pub fn new(val: u64) -> Option<Self> {
        (val <= Self::MAX).then_some(VarInt(val))
    }

    /// Construct from a value masked into the 62-bit range.
    #[inline]
    pub fn wrapping(val: u64) -> Self {
        VarInt(val & Self::MAX)
    }

    #[inline]
    pub fn value(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn encoded_len(self) -> usize {
        if self.0 < 0x40 {
            1
        } else if self.0 < 0x4000 {
            2
        } else if self.0 < 0x4000_0000 {
            4
        } else {
            8
        }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        match self.encoded_len() {
            1 => buf.put_u8(self.0 as u8),
            2 => buf.put_u16(0x4000 | self.0 as u16),
            4 => buf.put_u32(0x8000_0000 | self.0 as u32),
            _ => buf.put_u64(0xC000_0000_0000_0000 | self.0),
        }
    }

    /// Decode from a buffer. Returns `None` if the buffer is too short.
    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if !buf.has_remaining() {
            return None;
        }
        let first = buf.chunk()[0];
        let len = 1usize << (first >> 6);
        if buf.remaining() < len {
            return None;
        }
        let val = match len {
            1 => {
                buf.advance(1);
                (first & 0x3F) as u64
            }
            2 => (buf.get_u16() & 0x3FFF) as u64,
            4 => (buf.get_u32() & 0x3FFF_FFFF) as u64,
            _ => buf.get_u64() & 0x3FFF_FFFF_FFFF_FFFF,
        };
        Some(VarInt(val))
    }
}

impl fmt::Debug for VarInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VarInt({})", self.0)
    }
}

// ─── Packet Type ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Application payload forwarded along the comtree.
    Data = 1,
    /// Multicast group subscriptions, consumed hop by hop.
    SubUnsub = 2,
    /// Signalling between hosts and the network.
    ClientSignal = 10,
    /// Signalling between routers and controllers.
    NetSignal = 100,
    /// Answer to a route request; the payload is the routed address.
    RouteReply = 101,
}

impl PacketType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(PacketType::Data),
            2 => Some(PacketType::SubUnsub),
            10 => Some(PacketType::ClientSignal),
            100 => Some(PacketType::NetSignal),
            101 => Some(PacketType::RouteReply),
            _ => None,
        }
    }

    /// Carries a control packet for the control engine.
    pub fn is_control(self) -> bool {
        matches!(self, PacketType::ClientSignal | PacketType::NetSignal)
    }
}

// ─── Packet Header ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub version: u8,
    /// Flag bits; [`FLAG_ROUTE_REQUEST`] is the only one interpreted.
    pub flags: u8,
    pub packet_type: PacketType,
    pub payload_len: u16,
    pub comtree: ComtreeId,
    pub src: FlatAddr,
    pub dst: FlatAddr,
}

impl PacketHeader {
    pub fn new(
        packet_type: PacketType,
        comtree: ComtreeId,
        src: FlatAddr,
        dst: FlatAddr,
        payload_len: u16,
    ) -> Self {
        PacketHeader {
            version: PROTOCOL_VERSION,
            flags: 0,
            packet_type,
            payload_len,
            comtree,
            src,
            dst,
        }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(((self.version & 0x0F) << 4) | (self.flags & 0x0F));
        buf.put_u8(self.packet_type as u8);
        buf.put_u16(self.payload_len);
        buf.put_u32(self.comtree.0);
        buf.put_u32(self.src.0);
        buf.put_u32(self.dst.0);
    }

    /// Decode and sanity-check a header.
    ///
    /// Fails on short input, wrong version, unknown packet type or an
    /// unspecified destination.
    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < HEADER_LEN {
            return Err(RouterError::protocol(format!(
                "truncated header: {} bytes",
                buf.remaining()
            )));
        }
        let first = buf.get_u8();
        let version = first >> 4;
        if version != PROTOCOL_VERSION {
            return Err(RouterError::protocol(format!("bad version {version}")));
        }
        let type_byte = buf.get_u8();
        let packet_type = PacketType::from_byte(type_byte)
            .ok_or_else(|| RouterError::protocol(format!("unknown packet type {type_byte}")))?;
        let payload_len = buf.get_u16();
        let comtree = ComtreeId(buf.get_u32());
        let src = FlatAddr(buf.get_u32());
        let dst = FlatAddr(buf.get_u32());
        if dst == FlatAddr::UNSPECIFIED {
            return Err(RouterError::protocol("unspecified destination"));
        }
        Ok(PacketHeader {
            version,
            flags: first & 0x0F,
            packet_type,
            payload_len,
            comtree,
            src,
            dst,
        })
    }

    /// Total on-wire length of a packet carrying this header.
    pub fn packet_len(&self) -> usize {
        HEADER_LEN + self.payload_len as usize
    }

    /// Header for a reply travelling back to this packet's source.
    pub fn reversed(&self, payload_len: u16) -> Self {
        PacketHeader {
            payload_len,
            src: self.dst,
            dst: self.src,
            ..*self
        }
    }
}

// ─── Full Packet ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(header: PacketHeader, payload: Bytes) -> Self {
        Packet { header, payload }
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        self.header.encode(&mut buf);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode a datagram. The payload length field must match the datagram
    /// exactly and stay within [`MAX_PAYLOAD_LEN`]; anything else makes the
    /// packet malformed.
    pub fn decode(mut data: Bytes) -> Result<Self> {
        let header = PacketHeader::decode(&mut data)?;
        if header.payload_len as usize > MAX_PAYLOAD_LEN {
            return Err(RouterError::protocol(format!(
                "payload of {} bytes exceeds {MAX_PAYLOAD_LEN}",
                header.payload_len
            )));
        }
        if data.len() != header.payload_len as usize {
            return Err(RouterError::protocol(format!(
                "length mismatch: header says {}, datagram has {}",
                header.payload_len,
                data.len()
            )));
        }
        Ok(Packet {
            header,
            payload: data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header(len: u16) -> PacketHeader {
        PacketHeader::new(
            PacketType::Data,
            ComtreeId(5),
            FlatAddr::new(1, 1),
            FlatAddr::new(2, 7),
            len,
        )
    }

    #[test]
    fn varint_boundaries() {
        for &val in &[0u64, 0x3F, 0x40, 0x3FFF, 0x4000, 0x3FFF_FFFF, 0x4000_0000, VarInt::MAX] {
            let vi = VarInt::new(val).unwrap();
            let mut buf = BytesMut::new();
            vi.encode(&mut buf);
            assert_eq!(buf.len(), vi.encoded_len(), "encoded len mismatch for {val}");
            assert_eq!(VarInt::decode(&mut buf.freeze()).unwrap().value(), val);
        }
        assert!(VarInt::new(VarInt::MAX + 1).is_none());
    }

    #[test]
    fn varint_truncated_is_none() {
        let mut buf = Bytes::from_static(&[0x80, 0x01]);
        assert!(VarInt::decode(&mut buf).is_none());
    }

    #[test]
    fn header_layout_is_sixteen_bytes() {
        let mut buf = BytesMut::new();
        sample_header(3).encode(&mut buf);
        assert_eq!(buf.len(), HEADER_LEN);
        assert_eq!(buf[0] >> 4, PROTOCOL_VERSION);
        assert_eq!(buf[1], PacketType::Data as u8);
    }

    #[test]
    fn packet_decode_matches_encode() {
        let pkt = Packet::new(sample_header(5), Bytes::from_static(b"hello"));
        let decoded = Packet::decode(pkt.encode().freeze()).unwrap();
        assert_eq!(decoded.header, pkt.header);
        assert_eq!(decoded.payload, &b"hello"[..]);
    }

    #[test]
    fn length_mismatch_rejected() {
        let pkt = Packet::new(sample_header(9), Bytes::from_static(b"short"));
        assert!(matches!(
            Packet::decode(pkt.encode().freeze()),
            Err(RouterError::Protocol(_))
        ));
    }

    #[test]
    fn oversized_payload_rejected() {
        let fits = vec![0u8; MAX_PAYLOAD_LEN];
        let pkt = Packet::new(sample_header(fits.len() as u16), Bytes::from(fits));
        assert!(Packet::decode(pkt.encode().freeze()).is_ok());

        let big = vec![0u8; MAX_PAYLOAD_LEN + 1];
        let pkt = Packet::new(sample_header(big.len() as u16), Bytes::from(big));
        let err = Packet::decode(pkt.encode().freeze()).unwrap_err();
        assert!(matches!(err, RouterError::Protocol(ref m) if m.contains("exceeds")));
    }

    #[test]
    fn bad_version_and_type_rejected() {
        let mut raw = Packet::new(sample_header(0), Bytes::new()).encode();
        raw[0] = 0x20;
        assert!(Packet::decode(raw.clone().freeze()).is_err());
        raw[0] = 0x10;
        raw[1] = 42;
        assert!(Packet::decode(raw.freeze()).is_err());
    }

    #[test]
    fn zero_destination_rejected() {
        let mut hdr = sample_header(0);
        hdr.dst = FlatAddr::UNSPECIFIED;
        let raw = Packet::new(hdr, Bytes::new()).encode();
        assert!(Packet::decode(raw.freeze()).is_err());
    }

    #[test]
    fn reversed_swaps_addresses() {
        let hdr = sample_header(10);
        let rev = hdr.reversed(4);
        assert_eq!(rev.src, hdr.dst);
        assert_eq!(rev.dst, hdr.src);
        assert_eq!(rev.payload_len, 4);
        assert_eq!(rev.comtree, hdr.comtree);
    }
}
