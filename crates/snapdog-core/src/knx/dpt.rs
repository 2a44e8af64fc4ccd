//! KNX datapoint types: decode, encode, and display formatting.
//!
//! The codec is a static dispatch table keyed by DPT major.  Each entry knows
//! its payload length, a decode rule, an encode rule, and a minor-aware
//! formatter.  Unknown DPTs never reach the table: their APDU bytes flow
//! through as [`GroupValue::Raw`] so nothing on the bus is lost.
//!
//! Supported majors: 1, 5, 6, 7, 8, 9, 12, 13, 14, 16.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ── DPT identifier ────────────────────────────────────────────────────────────

/// Datapoint type id, rendered `major.minor` with a three-digit minor
/// (`9.001`).  ETS exports also use the `DPST-9-1` spelling; both parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DptId {
    pub major: u16,
    pub minor: u16,
}

impl DptId {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    /// True when the codec table has an entry for this major.
    pub fn is_supported(&self) -> bool {
        entry(self.major).is_some()
    }
}

impl fmt::Display for DptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:03}", self.major, self.minor)
    }
}

impl FromStr for DptId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        // ETS spelling: DPST-9-1 (or DPT-1 with no minor)
        if let Some(rest) = s.strip_prefix("DPST-").or_else(|| s.strip_prefix("DPT-")) {
            let mut it = rest.split('-');
            let major = it
                .next()
                .and_then(|p| p.parse().ok())
                .ok_or_else(|| Error::dpt(format!("bad DPT id '{s}'")))?;
            let minor = match it.next() {
                Some(p) => p
                    .parse()
                    .map_err(|_| Error::dpt(format!("bad DPT id '{s}'")))?,
                None => 0,
            };
            return Ok(Self { major, minor });
        }
        let (major, minor) = match s.split_once('.') {
            Some((maj, min)) => (
                maj.parse()
                    .map_err(|_| Error::dpt(format!("bad DPT id '{s}'")))?,
                min.parse()
                    .map_err(|_| Error::dpt(format!("bad DPT id '{s}'")))?,
            ),
            None => (
                s.parse()
                    .map_err(|_| Error::dpt(format!("bad DPT id '{s}'")))?,
                0,
            ),
        };
        Ok(Self { major, minor })
    }
}

impl Serialize for DptId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DptId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ── values ────────────────────────────────────────────────────────────────────

/// A decoded group value.  `F16` holds a value that travels as the 2-byte
/// KNX float; `F32` as IEEE 754 single.  `Raw` preserves the APDU bytes of
/// payloads with no known DPT.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum GroupValue {
    Bool(bool),
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    F16(f32),
    F32(f32),
    Raw(Vec<u8>),
    Text(String),
}

impl fmt::Display for GroupValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::U8(v) => write!(f, "{v}"),
            Self::I8(v) => write!(f, "{v}"),
            Self::U16(v) => write!(f, "{v}"),
            Self::I16(v) => write!(f, "{v}"),
            Self::U32(v) => write!(f, "{v}"),
            Self::I32(v) => write!(f, "{v}"),
            Self::F16(v) => write!(f, "{v:.2}"),
            Self::F32(v) => write!(f, "{v}"),
            Self::Raw(bytes) => {
                for b in bytes {
                    write!(f, "{b:02X}")?;
                }
                Ok(())
            }
            Self::Text(s) => write!(f, "{s}"),
        }
    }
}

/// Wire length class of a DPT payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadLength {
    /// Up to 6 bits, packed into the APCI octet (DPT major 1).
    Small,
    /// Fixed number of dedicated payload octets.
    Fixed(usize),
}

// ── dispatch table ────────────────────────────────────────────────────────────

struct DptEntry {
    major: u16,
    length: PayloadLength,
    decode: fn(&[u8], DptId) -> Result<GroupValue>,
    encode: fn(&GroupValue, DptId) -> Result<Vec<u8>>,
    format: fn(&GroupValue, DptId) -> String,
}

static TABLE: &[DptEntry] = &[
    DptEntry {
        major: 1,
        length: PayloadLength::Small,
        decode: decode_bool,
        encode: encode_bool,
        format: format_bool,
    },
    DptEntry {
        major: 5,
        length: PayloadLength::Fixed(1),
        decode: decode_u8,
        encode: encode_u8,
        format: format_u8,
    },
    DptEntry {
        major: 6,
        length: PayloadLength::Fixed(1),
        decode: decode_i8,
        encode: encode_i8,
        format: format_plain,
    },
    DptEntry {
        major: 7,
        length: PayloadLength::Fixed(2),
        decode: decode_u16,
        encode: encode_u16,
        format: format_plain,
    },
    DptEntry {
        major: 8,
        length: PayloadLength::Fixed(2),
        decode: decode_i16,
        encode: encode_i16,
        format: format_plain,
    },
    DptEntry {
        major: 9,
        length: PayloadLength::Fixed(2),
        decode: decode_f16,
        encode: encode_f16,
        format: format_f16,
    },
    DptEntry {
        major: 12,
        length: PayloadLength::Fixed(4),
        decode: decode_u32,
        encode: encode_u32,
        format: format_plain,
    },
    DptEntry {
        major: 13,
        length: PayloadLength::Fixed(4),
        decode: decode_i32,
        encode: encode_i32,
        format: format_plain,
    },
    DptEntry {
        major: 14,
        length: PayloadLength::Fixed(4),
        decode: decode_f32,
        encode: encode_f32,
        format: format_f32,
    },
    DptEntry {
        major: 16,
        length: PayloadLength::Fixed(14),
        decode: decode_text,
        encode: encode_text,
        format: format_plain,
    },
];

fn entry(major: u16) -> Option<&'static DptEntry> {
    TABLE.iter().find(|e| e.major == major)
}

/// Wire length class for a DPT, if the major is supported.
pub fn payload_length(dpt: DptId) -> Option<PayloadLength> {
    entry(dpt.major).map(|e| e.length)
}

/// Decode APDU payload bytes per `dpt`.  For small (≤6 bit) DPTs the slice
/// carries one byte holding the packed bits.
pub fn decode(data: &[u8], dpt: DptId) -> Result<GroupValue> {
    let e = entry(dpt.major).ok_or_else(|| Error::dpt(format!("unsupported DPT {dpt}")))?;
    let expected = match e.length {
        PayloadLength::Small => 1,
        PayloadLength::Fixed(n) => n,
    };
    if data.len() != expected {
        return Err(Error::dpt(format!(
            "DPT {dpt} expects {expected} byte(s), got {}",
            data.len()
        )));
    }
    (e.decode)(data, dpt)
}

/// Encode a value per `dpt` into APDU payload bytes.  Small DPTs come back
/// as one byte whose low 6 bits are the packed value.
pub fn encode(value: &GroupValue, dpt: DptId) -> Result<Vec<u8>> {
    let e = entry(dpt.major).ok_or_else(|| Error::dpt(format!("unsupported DPT {dpt}")))?;
    (e.encode)(value, dpt)
}

/// Human-readable rendering with unit suffixes for well-known minors.
pub fn format_value(value: &GroupValue, dpt: Option<DptId>) -> String {
    match dpt.and_then(|d| entry(d.major).map(|e| (e, d))) {
        Some((e, d)) => (e.format)(value, d),
        None => value.to_string(),
    }
}

// ── per-major codecs ──────────────────────────────────────────────────────────

fn decode_bool(data: &[u8], _dpt: DptId) -> Result<GroupValue> {
    Ok(GroupValue::Bool(data[0] & 0x01 == 0x01))
}

fn encode_bool(value: &GroupValue, dpt: DptId) -> Result<Vec<u8>> {
    match value {
        GroupValue::Bool(b) => Ok(vec![u8::from(*b)]),
        other => Err(mismatch(other, dpt)),
    }
}

fn decode_u8(data: &[u8], dpt: DptId) -> Result<GroupValue> {
    if dpt.minor == 1 {
        // 5.001: 0..255 scales to 0..100 %, nearest with ties to even
        let pct = (f64::from(data[0]) * 100.0 / 255.0).round_ties_even() as u8;
        Ok(GroupValue::U8(pct))
    } else {
        Ok(GroupValue::U8(data[0]))
    }
}

fn encode_u8(value: &GroupValue, dpt: DptId) -> Result<Vec<u8>> {
    match value {
        GroupValue::U8(v) if dpt.minor == 1 => {
            if *v > 100 {
                return Err(Error::dpt(format!("{v} out of range 0..100 for DPT {dpt}")));
            }
            let raw = (f64::from(*v) * 255.0 / 100.0).round_ties_even() as u8;
            Ok(vec![raw])
        }
        GroupValue::U8(v) => Ok(vec![*v]),
        other => Err(mismatch(other, dpt)),
    }
}

fn decode_i8(data: &[u8], _dpt: DptId) -> Result<GroupValue> {
    Ok(GroupValue::I8(data[0] as i8))
}

fn encode_i8(value: &GroupValue, dpt: DptId) -> Result<Vec<u8>> {
    match value {
        GroupValue::I8(v) => Ok(vec![*v as u8]),
        other => Err(mismatch(other, dpt)),
    }
}

fn decode_u16(data: &[u8], _dpt: DptId) -> Result<GroupValue> {
    Ok(GroupValue::U16(u16::from_be_bytes([data[0], data[1]])))
}

fn encode_u16(value: &GroupValue, dpt: DptId) -> Result<Vec<u8>> {
    match value {
        GroupValue::U16(v) => Ok(v.to_be_bytes().to_vec()),
        other => Err(mismatch(other, dpt)),
    }
}

fn decode_i16(data: &[u8], _dpt: DptId) -> Result<GroupValue> {
    Ok(GroupValue::I16(i16::from_be_bytes([data[0], data[1]])))
}

fn encode_i16(value: &GroupValue, dpt: DptId) -> Result<Vec<u8>> {
    match value {
        GroupValue::I16(v) => Ok(v.to_be_bytes().to_vec()),
        other => Err(mismatch(other, dpt)),
    }
}

/// Largest magnitude representable by the 2-byte KNX float.
pub const F16_MAX: f32 = 670_760.96;

fn decode_f16(data: &[u8], _dpt: DptId) -> Result<GroupValue> {
    let hi = data[0];
    let lo = data[1];
    let exp = i32::from((hi >> 3) & 0x0F);
    // 11-bit two's complement mantissa
    let mut mantissa = i32::from(hi & 0x07) << 8 | i32::from(lo);
    if hi & 0x80 != 0 {
        mantissa -= 2048;
    }
    let value = (mantissa as f64) * f64::powi(2.0, exp) * 0.01;
    Ok(GroupValue::F16(value as f32))
}

fn encode_f16(value: &GroupValue, dpt: DptId) -> Result<Vec<u8>> {
    let v = match value {
        GroupValue::F16(v) | GroupValue::F32(v) => f64::from(*v),
        other => return Err(mismatch(other, dpt)),
    };
    if !v.is_finite() || v.abs() > f64::from(F16_MAX) {
        return Err(Error::dpt(format!("{v} out of range for DPT {dpt}")));
    }
    let hundredths = v * 100.0;
    let mut exp = 0i32;
    let mantissa = loop {
        let m = (hundredths / f64::powi(2.0, exp)).round() as i64;
        if (-2048..=2047).contains(&m) {
            break m;
        }
        exp += 1;
        if exp > 15 {
            return Err(Error::dpt(format!("{v} out of range for DPT {dpt}")));
        }
    };
    let sign = if mantissa < 0 { 0x80u8 } else { 0x00 };
    let bits = (mantissa as u16) & 0x7FF;
    let hi = sign | ((exp as u8) << 3) | ((bits >> 8) as u8 & 0x07);
    let lo = (bits & 0xFF) as u8;
    Ok(vec![hi, lo])
}

fn decode_u32(data: &[u8], _dpt: DptId) -> Result<GroupValue> {
    Ok(GroupValue::U32(u32::from_be_bytes([
        data[0], data[1], data[2], data[3],
    ])))
}

fn encode_u32(value: &GroupValue, dpt: DptId) -> Result<Vec<u8>> {
    match value {
        GroupValue::U32(v) => Ok(v.to_be_bytes().to_vec()),
        other => Err(mismatch(other, dpt)),
    }
}

fn decode_i32(data: &[u8], _dpt: DptId) -> Result<GroupValue> {
    Ok(GroupValue::I32(i32::from_be_bytes([
        data[0], data[1], data[2], data[3],
    ])))
}

fn encode_i32(value: &GroupValue, dpt: DptId) -> Result<Vec<u8>> {
    match value {
        GroupValue::I32(v) => Ok(v.to_be_bytes().to_vec()),
        other => Err(mismatch(other, dpt)),
    }
}

fn decode_f32(data: &[u8], _dpt: DptId) -> Result<GroupValue> {
    Ok(GroupValue::F32(f32::from_be_bytes([
        data[0], data[1], data[2], data[3],
    ])))
}

fn encode_f32(value: &GroupValue, dpt: DptId) -> Result<Vec<u8>> {
    match value {
        GroupValue::F32(v) | GroupValue::F16(v) => Ok(v.to_be_bytes().to_vec()),
        other => Err(mismatch(other, dpt)),
    }
}

fn decode_text(data: &[u8], _dpt: DptId) -> Result<GroupValue> {
    let trimmed: Vec<u8> = data.iter().copied().take_while(|b| *b != 0).collect();
    let s = String::from_utf8(trimmed)
        .map_err(|_| Error::dpt("DPT 16 payload is not valid UTF-8"))?;
    Ok(GroupValue::Text(s))
}

fn encode_text(value: &GroupValue, dpt: DptId) -> Result<Vec<u8>> {
    match value {
        GroupValue::Text(s) => {
            let bytes = s.as_bytes();
            if bytes.len() > 14 {
                return Err(Error::dpt(format!(
                    "text '{s}' exceeds 14 bytes for DPT {dpt}"
                )));
            }
            let mut out = vec![0u8; 14];
            out[..bytes.len()].copy_from_slice(bytes);
            Ok(out)
        }
        other => Err(mismatch(other, dpt)),
    }
}

fn mismatch(value: &GroupValue, dpt: DptId) -> Error {
    Error::dpt(format!("value {value:?} does not match DPT {dpt}"))
}

// ── formatters ────────────────────────────────────────────────────────────────

fn format_bool(value: &GroupValue, dpt: DptId) -> String {
    let GroupValue::Bool(b) = value else {
        return value.to_string();
    };
    let (on, off) = match dpt.minor {
        8 => ("down", "up"),
        9 => ("close", "open"),
        _ => ("on", "off"),
    };
    (if *b { on } else { off }).to_string()
}

fn format_u8(value: &GroupValue, dpt: DptId) -> String {
    match (value, dpt.minor) {
        (GroupValue::U8(v), 1) => format!("{v}%"),
        _ => value.to_string(),
    }
}

fn format_f16(value: &GroupValue, dpt: DptId) -> String {
    let GroupValue::F16(v) = value else {
        return value.to_string();
    };
    match dpt.minor {
        1 => format!("{v:.1}°C"),
        4 => format!("{v:.0} lx"),
        7 => format!("{v:.1}%"),
        _ => format!("{v:.2}"),
    }
}

fn format_f32(value: &GroupValue, _dpt: DptId) -> String {
    match value {
        GroupValue::F32(v) => format!("{v}"),
        other => other.to_string(),
    }
}

fn format_plain(value: &GroupValue, _dpt: DptId) -> String {
    value.to_string()
}

// ── heuristic detection ───────────────────────────────────────────────────────

/// Guess a DPT for an APDU payload with no configured mapping.  Display-only:
/// the result must never drive a write.  Returns `None` for lengths with no
/// sensible guess; those stay [`GroupValue::Raw`].
pub fn detect(data: &[u8]) -> Option<(DptId, GroupValue)> {
    match data.len() {
        1 => {
            let dpt = if data[0] <= 1 {
                DptId::new(1, 1)
            } else if data[0] <= 100 {
                DptId::new(5, 1)
            } else {
                DptId::new(5, 4)
            };
            decode(data, dpt).ok().map(|v| (dpt, v))
        }
        2 => {
            // Try the KNX float first; fall back to 16-bit counter when the
            // result lands outside plausible sensor ranges.
            let dpt = DptId::new(9, 1);
            if let Ok(GroupValue::F16(v)) = decode(data, dpt) {
                if v.is_finite() && (-50.0..=100_000.0).contains(&v) {
                    return Some((dpt, GroupValue::F16(v)));
                }
            }
            let dpt = DptId::new(7, 1);
            decode(data, dpt).ok().map(|v| (dpt, v))
        }
        4 => {
            let f = f32::from_be_bytes([data[0], data[1], data[2], data[3]]);
            if f.is_finite() && f.abs() < 1e6 {
                Some((DptId::new(14, 5), GroupValue::F32(f)))
            } else {
                let dpt = DptId::new(13, 1);
                decode(data, dpt).ok().map(|v| (dpt, v))
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dpt_id_parsing() {
        assert_eq!("9.001".parse::<DptId>().unwrap(), DptId::new(9, 1));
        assert_eq!("DPST-9-1".parse::<DptId>().unwrap(), DptId::new(9, 1));
        assert_eq!("DPST-1-8".parse::<DptId>().unwrap(), DptId::new(1, 8));
        assert_eq!("5".parse::<DptId>().unwrap(), DptId::new(5, 0));
        assert_eq!(DptId::new(9, 1).to_string(), "9.001");
        assert_eq!(DptId::new(14, 56).to_string(), "14.056");
        assert!("x.y".parse::<DptId>().is_err());
    }

    #[test]
    fn dpt9_temperature_decode() {
        let v = decode(&[0x07, 0xD0], DptId::new(9, 1)).unwrap();
        assert_eq!(v, GroupValue::F16(20.0));
        assert_eq!(format_value(&v, Some(DptId::new(9, 1))), "20.0°C");
    }

    #[test]
    fn dpt9_round_trip_precision() {
        // precision is 0.01 * 2^exp for the exponent chosen at encode time
        for v in [-273.0f32, -30.5, 0.0, 0.01, 20.0, 21.55, 670_000.0] {
            let bytes = encode(&GroupValue::F16(v), DptId::new(9, 1)).unwrap();
            let GroupValue::F16(back) = decode(&bytes, DptId::new(9, 1)).unwrap() else {
                panic!("wrong variant");
            };
            let exp = (bytes[0] >> 3) & 0x0F;
            let step = 0.01f32 * 2f32.powi(i32::from(exp));
            assert!(
                (back - v).abs() <= step / 2.0 + f32::EPSILON,
                "{v} decoded to {back} (step {step})"
            );
        }
    }

    #[test]
    fn dpt9_negative_mantissa() {
        // -1.00 → mantissa -100, sign set
        let bytes = encode(&GroupValue::F16(-1.0), DptId::new(9, 1)).unwrap();
        let back = decode(&bytes, DptId::new(9, 1)).unwrap();
        assert_eq!(back, GroupValue::F16(-1.0));
        assert_eq!(bytes[0] & 0x80, 0x80);
    }

    #[test]
    fn dpt9_rejects_out_of_range() {
        assert!(encode(&GroupValue::F16(700_000.0), DptId::new(9, 1)).is_err());
        assert!(encode(&GroupValue::F16(f32::NAN), DptId::new(9, 1)).is_err());
    }

    #[test]
    fn dpt5_scaling() {
        // 128 → 50.196 → rounds to 50
        assert_eq!(
            decode(&[0x80], DptId::new(5, 1)).unwrap(),
            GroupValue::U8(50)
        );
        assert_eq!(
            format_value(&GroupValue::U8(50), Some(DptId::new(5, 1))),
            "50%"
        );
        // 75 % → 191.25 → 191
        assert_eq!(
            encode(&GroupValue::U8(75), DptId::new(5, 1)).unwrap(),
            vec![0xBF]
        );
        // 5.004 stays raw
        assert_eq!(
            decode(&[0x80], DptId::new(5, 4)).unwrap(),
            GroupValue::U8(128)
        );
        assert!(encode(&GroupValue::U8(101), DptId::new(5, 1)).is_err());
    }

    #[test]
    fn dpt5_round_trip_percent_domain() {
        for pct in 0..=100u8 {
            let bytes = encode(&GroupValue::U8(pct), DptId::new(5, 1)).unwrap();
            assert_eq!(
                decode(&bytes, DptId::new(5, 1)).unwrap(),
                GroupValue::U8(pct)
            );
        }
    }

    #[test]
    fn dpt1_labels() {
        let on = GroupValue::Bool(true);
        let off = GroupValue::Bool(false);
        assert_eq!(format_value(&on, Some(DptId::new(1, 1))), "on");
        assert_eq!(format_value(&off, Some(DptId::new(1, 1))), "off");
        assert_eq!(format_value(&on, Some(DptId::new(1, 8))), "down");
        assert_eq!(format_value(&off, Some(DptId::new(1, 9))), "open");
    }

    #[test]
    fn integer_majors_round_trip() {
        let cases: Vec<(GroupValue, DptId)> = vec![
            (GroupValue::Bool(true), DptId::new(1, 1)),
            (GroupValue::U8(200), DptId::new(5, 4)),
            (GroupValue::I8(-12), DptId::new(6, 1)),
            (GroupValue::U16(54321), DptId::new(7, 1)),
            (GroupValue::I16(-20_000), DptId::new(8, 1)),
            (GroupValue::U32(4_000_000_000), DptId::new(12, 1)),
            (GroupValue::I32(-2_000_000_000), DptId::new(13, 1)),
            (GroupValue::F32(3.25), DptId::new(14, 56)),
            (GroupValue::Text("Kitchen".into()), DptId::new(16, 0)),
        ];
        for (value, dpt) in cases {
            let bytes = encode(&value, dpt).unwrap();
            assert_eq!(decode(&bytes, dpt).unwrap(), value, "DPT {dpt}");
        }
    }

    #[test]
    fn text_nul_trimming() {
        let mut bytes = vec![0u8; 14];
        bytes[..5].copy_from_slice(b"Salon");
        assert_eq!(
            decode(&bytes, DptId::new(16, 0)).unwrap(),
            GroupValue::Text("Salon".into())
        );
        assert!(encode(
            &GroupValue::Text("this string is far too long".into()),
            DptId::new(16, 0)
        )
        .is_err());
    }

    #[test]
    fn length_mismatch_fails() {
        assert!(decode(&[0x00, 0x01], DptId::new(5, 1)).is_err());
        assert!(decode(&[0x00], DptId::new(9, 1)).is_err());
        assert!(encode(&GroupValue::U16(1), DptId::new(5, 1)).is_err());
    }

    #[test]
    fn heuristics() {
        assert_eq!(
            detect(&[0x01]).unwrap().0,
            DptId::new(1, 1),
            "tiny byte reads as switch"
        );
        assert_eq!(detect(&[0x40]).unwrap().0, DptId::new(5, 1));
        assert_eq!(detect(&[0xF0]).unwrap().0, DptId::new(5, 4));
        // 20 °C lands in the plausible sensor window
        assert_eq!(detect(&[0x07, 0xD0]).unwrap().0, DptId::new(9, 1));
        // 4-byte finite float
        let bytes = 12.5f32.to_be_bytes();
        assert_eq!(detect(&bytes).unwrap().0, DptId::new(14, 5));
        // NaN pattern falls back to signed counter
        assert_eq!(
            detect(&f32::NAN.to_be_bytes()).unwrap().0,
            DptId::new(13, 1)
        );
        assert!(detect(&[0, 1, 2]).is_none());
    }
}
