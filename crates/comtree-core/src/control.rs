//! # Control Packet Codec
//!
//! Control packets ride in the payload of `NetSignal` and `ClientSignal`
//! packets:
//!
//! ```text
//! +--------+--------+-----------------+------+-----+---------+-----
//! |  type  |  mode  |  seq (VarInt)   | code | len |  value  | ...
//! +--------+--------+-----------------+------+-----+---------+-----
//! ```
//!
//! Integer attributes are big-endian, 1, 2, 4 or 8 bytes wide. The error
//! message attribute is UTF-8. Attribute codes this router does not know
//! are skipped so newer peers can add attributes freely.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

use crate::error::{Result, RouterError};
use crate::ids::{ComtreeId, FlatAddr};
use crate::wire::{Packet, PacketHeader, PacketType, VarInt};

// ─── Type / Mode ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ControlType {
    Join = 14,
    Leave = 15,
    AddLink = 40,
    DropLink = 41,
    GetLink = 42,
    ModLink = 43,
    AddComtree = 50,
    DropComtree = 51,
    GetComtree = 52,
    ModComtree = 53,
    AddComtreeLink = 54,
    DropComtreeLink = 55,
    ResizeComtreeLink = 56,
    AddRoute = 70,
    DropRoute = 71,
    GetRoute = 72,
    ModRoute = 73,
    AddRouteLink = 74,
    DropRouteLink = 75,
}

impl ControlType {
    pub const ALL: [ControlType; 19] = [
        ControlType::Join,
        ControlType::Leave,
        ControlType::AddLink,
        ControlType::DropLink,
        ControlType::GetLink,
        ControlType::ModLink,
        ControlType::AddComtree,
        ControlType::DropComtree,
        ControlType::GetComtree,
        ControlType::ModComtree,
        ControlType::AddComtreeLink,
        ControlType::DropComtreeLink,
        ControlType::ResizeComtreeLink,
        ControlType::AddRoute,
        ControlType::DropRoute,
        ControlType::GetRoute,
        ControlType::ModRoute,
        ControlType::AddRouteLink,
        ControlType::DropRouteLink,
    ];

    pub fn from_byte(b: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|t| *t as u8 == b)
    }
}

impl fmt::Display for ControlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Mode {
    Request = 1,
    PosReply = 2,
    NegReply = 3,
}

impl Mode {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Mode::Request),
            2 => Some(Mode::PosReply),
            3 => Some(Mode::NegReply),
            _ => None,
        }
    }

    pub fn is_reply(self) -> bool {
        !matches!(self, Mode::Request)
    }
}

// ─── Attributes ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AttrCode {
    Link = 1,
    PeerAddr = 2,
    PeerIp = 3,
    PeerPort = 4,
    PeerType = 5,
    Capacity = 6,
    Comtree = 7,
    CoreAddr = 8,
    IsCore = 9,
    ParentLink = 10,
    Rate = 11,
    ErrMsg = 13,
    Allocated = 14,
    UpstreamLink = 15,
    MemberCount = 16,
    DestAddr = 17,
}

impl AttrCode {
    pub fn from_byte(b: u8) -> Option<Self> {
        use AttrCode::*;
        Some(match b {
            1 => Link,
            2 => PeerAddr,
            3 => PeerIp,
            4 => PeerPort,
            5 => PeerType,
            6 => Capacity,
            7 => Comtree,
            8 => CoreAddr,
            9 => IsCore,
            10 => ParentLink,
            11 => Rate,
            13 => ErrMsg,
            14 => Allocated,
            15 => UpstreamLink,
            16 => MemberCount,
            17 => DestAddr,
            _ => return None,
        })
    }

    fn is_text(self) -> bool {
        matches!(self, AttrCode::ErrMsg)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrValue {
    Int(u64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attr {
    pub code: AttrCode,
    pub value: AttrValue,
}

fn int_width(v: u64) -> usize {
    if v <= u8::MAX as u64 {
        1
    } else if v <= u16::MAX as u64 {
        2
    } else if v <= u32::MAX as u64 {
        4
    } else {
        8
    }
}

/// Longest prefix of `s` that fits in `max` bytes on a char boundary.
fn clip(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

// ─── Control Packet ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPacket {
    pub ctype: ControlType,
    pub mode: Mode,
    pub seq: u64,
    pub attrs: Vec<Attr>,
}

impl ControlPacket {
    pub fn request(ctype: ControlType, seq: u64) -> Self {
        ControlPacket {
            ctype,
            mode: Mode::Request,
            seq,
            attrs: Vec::new(),
        }
    }

    /// Positive reply echoing type and sequence number.
    pub fn positive_reply(&self) -> Self {
        ControlPacket {
            ctype: self.ctype,
            mode: Mode::PosReply,
            seq: self.seq,
            attrs: Vec::new(),
        }
    }

    /// Negative reply carrying a reason.
    pub fn negative_reply(&self, reason: impl Into<String>) -> Self {
        ControlPacket {
            ctype: self.ctype,
            mode: Mode::NegReply,
            seq: self.seq,
            attrs: vec![Attr {
                code: AttrCode::ErrMsg,
                value: AttrValue::Text(reason.into()),
            }],
        }
    }

    pub fn with_int(mut self, code: AttrCode, value: u64) -> Self {
        self.attrs.push(Attr {
            code,
            value: AttrValue::Int(value),
        });
        self
    }

    pub fn get_int(&self, code: AttrCode) -> Option<u64> {
        self.attrs.iter().find_map(|a| match (&a.value, a.code == code) {
            (AttrValue::Int(v), true) => Some(*v),
            _ => None,
        })
    }

    /// Integer attribute that a handler cannot proceed without.
    pub fn require_int(&self, code: AttrCode) -> Result<u64> {
        self.get_int(code)
            .ok_or_else(|| RouterError::protocol(format!("missing attribute {code:?}")))
    }

    pub fn err_msg(&self) -> Option<&str> {
        self.attrs.iter().find_map(|a| match &a.value {
            AttrValue::Text(s) if a.code == AttrCode::ErrMsg => Some(s.as_str()),
            _ => None,
        })
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.ctype as u8);
        buf.put_u8(self.mode as u8);
        VarInt::wrapping(self.seq).encode(buf);
        for attr in &self.attrs {
            buf.put_u8(attr.code as u8);
            match &attr.value {
                AttrValue::Int(v) => {
                    let width = int_width(*v);
                    buf.put_u8(width as u8);
                    buf.put_uint(*v, width);
                }
                AttrValue::Text(s) => {
                    let s = clip(s, u8::MAX as usize);
                    buf.put_u8(s.len() as u8);
                    buf.put_slice(s.as_bytes());
                }
            }
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(32);
        self.encode(&mut buf);
        buf.freeze()
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < 2 {
            return Err(RouterError::protocol("truncated control packet"));
        }
        let type_byte = buf.get_u8();
        let ctype = ControlType::from_byte(type_byte)
            .ok_or_else(|| RouterError::protocol(format!("unknown control type {type_byte}")))?;
        let mode_byte = buf.get_u8();
        let mode = Mode::from_byte(mode_byte)
            .ok_or_else(|| RouterError::protocol(format!("bad control mode {mode_byte}")))?;
        let seq = VarInt::decode(buf)
            .ok_or_else(|| RouterError::protocol("truncated sequence number"))?
            .value();

        let mut attrs = Vec::new();
        while buf.has_remaining() {
            if buf.remaining() < 2 {
                return Err(RouterError::protocol("truncated attribute header"));
            }
            let code_byte = buf.get_u8();
            let len = buf.get_u8() as usize;
            if buf.remaining() < len {
                return Err(RouterError::protocol(format!(
                    "attribute {code_byte} wants {len} bytes, {} left",
                    buf.remaining()
                )));
            }
            let Some(code) = AttrCode::from_byte(code_byte) else {
                buf.advance(len);
                continue;
            };
            let value = if code.is_text() {
                let raw = buf.copy_to_bytes(len);
                let s = std::str::from_utf8(&raw)
                    .map_err(|_| RouterError::protocol(format!("{code:?} is not UTF-8")))?;
                AttrValue::Text(s.to_owned())
            } else {
                if !matches!(len, 1 | 2 | 4 | 8) {
                    return Err(RouterError::protocol(format!(
                        "{code:?} has bad width {len}"
                    )));
                }
                AttrValue::Int(buf.get_uint(len))
            };
            attrs.push(Attr { code, value });
        }
        Ok(ControlPacket {
            ctype,
            mode,
            seq,
            attrs,
        })
    }

    /// Wrap in a signalling packet on `comtree`.
    pub fn to_packet(&self, comtree: ComtreeId, src: FlatAddr, dst: FlatAddr) -> Packet {
        let payload = self.to_bytes();
        let header = PacketHeader::new(
            PacketType::NetSignal,
            comtree,
            src,
            dst,
            payload.len() as u16,
        );
        Packet::new(header, payload)
    }

    pub fn from_packet(packet: &Packet) -> Result<Self> {
        if !packet.header.packet_type.is_control() {
            return Err(RouterError::protocol("not a signalling packet"));
        }
        Self::decode(&mut packet.payload.clone())
    }
}
