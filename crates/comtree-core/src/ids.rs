//! Identifier newtypes shared by every table in the router.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ─── LinkId ──────────────────────────────────────────────────────────────────

/// Router-local link number. Never transmitted on the wire.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct LinkId(pub u16);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

// ─── ComtreeId ───────────────────────────────────────────────────────────────

/// Comtree number, carried in every packet header.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ComtreeId(pub u32);

impl fmt::Display for ComtreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "comt{}", self.0)
    }
}

// ─── FlatAddr ────────────────────────────────────────────────────────────────

/// Flat 32-bit address: a 16-bit zip code and a 16-bit local part.
///
/// Addresses with the high bit set are multicast group addresses; zero is
/// never a valid destination.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct FlatAddr(pub u32);

impl FlatAddr {
    pub const UNSPECIFIED: FlatAddr = FlatAddr(0);

    pub fn new(zip: u16, local: u16) -> Self {
        FlatAddr(((zip as u32) << 16) | local as u32)
    }

    pub fn zip(self) -> u16 {
        (self.0 >> 16) as u16
    }

    pub fn local(self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }

    pub fn is_multicast(self) -> bool {
        self.0 & 0x8000_0000 != 0
    }

    /// Valid unicast addresses have a non-zero zip and non-zero local part.
    pub fn is_unicast(self) -> bool {
        !self.is_multicast() && self.zip() != 0 && self.local() != 0
    }
}

impl fmt::Display for FlatAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_multicast() {
            write!(f, "mc{}", self.0 & 0x7FFF_FFFF)
        } else {
            write!(f, "{}.{}", self.zip(), self.local())
        }
    }
}

impl FromStr for FlatAddr {
    type Err = String;

    /// Parses `zip.local` (e.g. `1.2`) or a raw decimal value.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some((zip, local)) = s.split_once('.') {
            let zip: u16 = zip
                .parse()
                .map_err(|e| format!("invalid zip in '{s}': {e}"))?;
            let local: u16 = local
                .parse()
                .map_err(|e| format!("invalid local part in '{s}': {e}"))?;
            return Ok(FlatAddr::new(zip, local));
        }
        s.parse::<u32>()
            .map(FlatAddr)
            .map_err(|e| format!("invalid address '{s}': {e}"))
    }
}
