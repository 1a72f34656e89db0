//! 64-bit 1-Wire registration numbers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::OwfsError;

/// Family codes of write-once (EPROM) parts.
const EPROM_FAMILIES: &[u8] = &[0x09, 0x0B, 0x0F, 0x13];

/// Family code of the DS1963S, which reserves more pages for counter files.
pub const FAMILY_SHA_COUNTER: u8 = 0x18;

/// Device serial number. Byte 0 is the family code, byte 7 the CRC8.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RomId([u8; 8]);

impl RomId {
    pub const fn new(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    pub fn family(&self) -> u8 {
        self.0[0]
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// Whether the family code names an EPROM part.
    pub fn is_eprom_family(&self) -> bool {
        EPROM_FAMILIES.contains(&self.family())
    }
}

impl fmt::Display for RomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode_upper(self.0))
    }
}

impl fmt::Debug for RomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RomId({})", self)
    }
}

impl FromStr for RomId {
    type Err = OwfsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let mut bytes = [0u8; 8];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| OwfsError::InvalidRom(s.to_string()))?;
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for RomId {
    type Error = OwfsError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RomId> for String {
    fn from(rom: RomId) -> Self {
        rom.to_string()
    }
}
