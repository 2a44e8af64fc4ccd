//! KNX addressing.
//!
//! Group addresses use the three-level notation `main/middle/sub` and travel
//! as 16 bits on the wire: `(main << 11) | (middle << 8) | sub`.  Individual
//! (device) addresses use `area.line.device` and only appear as telegram
//! sources here.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Error produced when parsing an address from text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid KNX address '{input}': {reason}")]
pub struct AddressParseError {
    pub input: String,
    pub reason: String,
}

impl AddressParseError {
    fn new(input: &str, reason: impl Into<String>) -> Self {
        Self {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}

// ── group address ─────────────────────────────────────────────────────────────

/// Three-level group address.  Equality and hashing go through the 16-bit
/// wire form, which the struct stores directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupAddress(u16);

impl GroupAddress {
    pub const MAIN_MAX: u16 = 31;
    pub const MIDDLE_MAX: u16 = 7;
    pub const SUB_MAX: u16 = 255;

    pub fn new(main: u16, middle: u16, sub: u16) -> Result<Self, AddressParseError> {
        let input = format!("{main}/{middle}/{sub}");
        if main > Self::MAIN_MAX {
            return Err(AddressParseError::new(&input, "main group out of range 0..31"));
        }
        if middle > Self::MIDDLE_MAX {
            return Err(AddressParseError::new(&input, "middle group out of range 0..7"));
        }
        if sub > Self::SUB_MAX {
            return Err(AddressParseError::new(&input, "sub group out of range 0..255"));
        }
        Ok(Self((main << 11) | (middle << 8) | sub))
    }

    pub fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u16 {
        self.0
    }

    pub fn main(&self) -> u16 {
        self.0 >> 11
    }

    pub fn middle(&self) -> u16 {
        (self.0 >> 8) & 0x07
    }

    pub fn sub(&self) -> u16 {
        self.0 & 0xFF
    }
}

impl FromStr for GroupAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        if parts.len() != 3 {
            return Err(AddressParseError::new(s, "expected main/middle/sub"));
        }
        let parse = |p: &str, what: &str| {
            p.trim()
                .parse::<u16>()
                .map_err(|_| AddressParseError::new(s, format!("{what} is not a number")))
        };
        let main = parse(parts[0], "main group")?;
        let middle = parse(parts[1], "middle group")?;
        let sub = parse(parts[2], "sub group")?;
        Self::new(main, middle, sub).map_err(|e| AddressParseError::new(s, e.reason))
    }
}

impl fmt::Display for GroupAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.main(), self.middle(), self.sub())
    }
}

impl Serialize for GroupAddress {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for GroupAddress {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ── individual (device) address ───────────────────────────────────────────────

/// Individual address `area.line.device`, 16 bits as
/// `(area << 12) | (line << 8) | device`.  Telegram sources decode into this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceAddress(u16);

impl DeviceAddress {
    pub fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u16 {
        self.0
    }

    pub fn area(&self) -> u16 {
        self.0 >> 12
    }

    pub fn line(&self) -> u16 {
        (self.0 >> 8) & 0x0F
    }

    pub fn device(&self) -> u16 {
        self.0 & 0xFF
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.area(), self.line(), self.device())
    }
}
