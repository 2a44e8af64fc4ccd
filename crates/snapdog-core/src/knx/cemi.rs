//! cEMI L_Data frames and the group events decoded from them.
//!
//! Only the application services the controller speaks are modelled:
//! `GroupValue_Read`, `GroupValue_Response` and `GroupValue_Write`.  Payloads
//! of six bits or fewer ride inside the APCI octet; larger payloads follow as
//! dedicated octets.

use crate::error::{Error, Result};
use crate::knx::address::{DeviceAddress, GroupAddress};
use crate::knx::dpt::{self, DptId, GroupValue, PayloadLength};

// ── message codes / control fields ────────────────────────────────────────────

pub const MSG_L_DATA_REQ: u8 = 0x11;
pub const MSG_L_DATA_IND: u8 = 0x29;
pub const MSG_L_DATA_CON: u8 = 0x2E;

/// Standard frame, no repeat, broadcast, normal priority.
const CTRL1: u8 = 0xBC;
/// Group-addressed destination, hop count 6.
const CTRL2: u8 = 0xE0;

// ── APCI ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Apci {
    GroupValueRead,
    GroupValueResponse,
    GroupValueWrite,
}

impl Apci {
    fn bits(self) -> u8 {
        match self {
            Self::GroupValueRead => 0x00,
            Self::GroupValueResponse => 0x40,
            Self::GroupValueWrite => 0x80,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::GroupValueRead => "Read",
            Self::GroupValueResponse => "Response",
            Self::GroupValueWrite => "Write",
        }
    }
}

/// APDU payload: either packed into the APCI octet or carried as octets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// No data (GroupValue_Read).
    None,
    /// Up to 6 bits packed into the APCI octet.
    Small(u8),
    /// Dedicated payload octets.
    Bytes(Vec<u8>),
}

impl Payload {
    /// Normalized data bytes: small payloads become a single byte.
    pub fn data(&self) -> Vec<u8> {
        match self {
            Self::None => Vec::new(),
            Self::Small(v) => vec![*v],
            Self::Bytes(b) => b.clone(),
        }
    }

    /// Build the right payload shape for DPT-encoded bytes.
    pub fn for_dpt(bytes: Vec<u8>, dpt: DptId) -> Self {
        match dpt::payload_length(dpt) {
            Some(PayloadLength::Small) => Self::Small(bytes.first().copied().unwrap_or(0) & 0x3F),
            _ => Self::Bytes(bytes),
        }
    }
}

// ── frames ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct CemiFrame {
    pub msg_code: u8,
    pub src: DeviceAddress,
    pub dst: GroupAddress,
    pub apci: Apci,
    pub payload: Payload,
}

impl CemiFrame {
    pub fn group_write(dst: GroupAddress, payload: Payload) -> Self {
        Self {
            msg_code: MSG_L_DATA_REQ,
            src: DeviceAddress::from_raw(0),
            dst,
            apci: Apci::GroupValueWrite,
            payload,
        }
    }

    pub fn group_read(dst: GroupAddress) -> Self {
        Self {
            msg_code: MSG_L_DATA_REQ,
            src: DeviceAddress::from_raw(0),
            dst,
            apci: Apci::GroupValueRead,
            payload: Payload::None,
        }
    }

    pub fn group_response(dst: GroupAddress, payload: Payload) -> Self {
        Self {
            msg_code: MSG_L_DATA_REQ,
            src: DeviceAddress::from_raw(0),
            dst,
            apci: Apci::GroupValueResponse,
            payload,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(11 + 14);
        out.push(self.msg_code);
        out.push(0x00); // no additional info
        out.push(CTRL1);
        out.push(CTRL2);
        out.extend_from_slice(&self.src.raw().to_be_bytes());
        out.extend_from_slice(&self.dst.raw().to_be_bytes());
        match &self.payload {
            Payload::None => {
                out.push(1); // NPDU length: APCI octet only
                out.push(0x00); // TPCI
                out.push(self.apci.bits());
            }
            Payload::Small(v) => {
                out.push(1);
                out.push(0x00);
                out.push(self.apci.bits() | (v & 0x3F));
            }
            Payload::Bytes(bytes) => {
                out.push(1 + bytes.len() as u8);
                out.push(0x00);
                out.push(self.apci.bits());
                out.extend_from_slice(bytes);
            }
        }
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 2 {
            return Err(Error::protocol("cEMI frame too short"));
        }
        let msg_code = data[0];
        let addl_len = data[1] as usize;
        let body = data
            .get(2 + addl_len..)
            .ok_or_else(|| Error::protocol("cEMI additional info exceeds frame"))?;
        if body.len() < 7 {
            return Err(Error::protocol("cEMI L_Data body too short"));
        }
        let src = DeviceAddress::from_raw(u16::from_be_bytes([body[2], body[3]]));
        let dst = GroupAddress::from_raw(u16::from_be_bytes([body[4], body[5]]));
        let npdu_len = body[6] as usize;
        if npdu_len == 0 || body.len() < 7 + 1 + npdu_len {
            return Err(Error::protocol("cEMI NPDU truncated"));
        }
        let apci_octet = body[8];
        let apci = match apci_octet & 0xC0 {
            0x00 => Apci::GroupValueRead,
            0x40 => Apci::GroupValueResponse,
            0x80 => Apci::GroupValueWrite,
            _ => return Err(Error::protocol(format!("unknown APCI 0x{apci_octet:02X}"))),
        };
        let payload = if npdu_len > 1 {
            Payload::Bytes(body[9..8 + npdu_len].to_vec())
        } else if apci == Apci::GroupValueRead {
            Payload::None
        } else {
            Payload::Small(apci_octet & 0x3F)
        };
        Ok(Self {
            msg_code,
            src,
            dst,
            apci,
            payload,
        })
    }
}

// ── group events ──────────────────────────────────────────────────────────────

/// One received group telegram, DPT-decoded when a mapping is known.
#[derive(Debug, Clone)]
pub struct GroupEvent {
    pub src: DeviceAddress,
    pub dst: GroupAddress,
    pub apci: Apci,
    /// APDU data bytes as received (small payloads normalized to one byte).
    pub raw: Vec<u8>,
    /// Decoded value when a DPT was configured or detected.
    pub value: Option<GroupValue>,
    /// The DPT used to decode `value`.
    pub dpt: Option<DptId>,
}

impl GroupEvent {
    /// Build an event from a decoded frame, resolving the value through the
    /// configured DPT when present, otherwise through heuristic detection.
    pub fn from_frame(frame: &CemiFrame, configured: Option<DptId>) -> Self {
        let raw = frame.payload.data();
        let (value, dpt) = if frame.apci == Apci::GroupValueRead || raw.is_empty() {
            (None, configured)
        } else if let Some(d) = configured {
            match dpt::decode(&raw, d) {
                Ok(v) => (Some(v), Some(d)),
                Err(_) => (None, Some(d)),
            }
        } else {
            match dpt::detect(&raw) {
                Some((d, v)) => (Some(v), Some(d)),
                None => (None, None),
            }
        };
        Self {
            src: frame.src,
            dst: frame.dst,
            apci: frame.apci,
            raw,
            value,
            dpt,
        }
    }
}
