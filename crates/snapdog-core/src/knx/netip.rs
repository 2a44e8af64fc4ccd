//! KNXnet/IP framing: the 6-byte header, the service bodies the controller
//! uses (tunnelling + routing + connection management), and the HPAI/CRI
//! blocks inside them.

use std::net::{Ipv4Addr, SocketAddrV4};

use crate::error::{Error, Result};

pub const HEADER_SIZE: u8 = 0x06;
pub const PROTOCOL_VERSION: u8 = 0x10;

pub const KNX_PORT: u16 = 3671;
pub const MULTICAST_ADDRESS: Ipv4Addr = Ipv4Addr::new(224, 0, 23, 12);

// ── service types ─────────────────────────────────────────────────────────────

pub const CONNECT_REQUEST: u16 = 0x0205;
pub const CONNECT_RESPONSE: u16 = 0x0206;
pub const CONNECTIONSTATE_REQUEST: u16 = 0x0207;
pub const CONNECTIONSTATE_RESPONSE: u16 = 0x0208;
pub const DISCONNECT_REQUEST: u16 = 0x0209;
pub const DISCONNECT_RESPONSE: u16 = 0x020A;
pub const TUNNELING_REQUEST: u16 = 0x0420;
pub const TUNNELING_ACK: u16 = 0x0421;
pub const ROUTING_INDICATION: u16 = 0x0530;

pub const E_NO_ERROR: u8 = 0x00;

// ── frame ─────────────────────────────────────────────────────────────────────

/// One KNXnet/IP datagram: service type + body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub service: u16,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn new(service: u16, body: Vec<u8>) -> Self {
        Self { service, body }
    }

    pub fn encode(&self) -> Vec<u8> {
        let total = 6 + self.body.len() as u16;
        let mut out = Vec::with_capacity(total as usize);
        out.push(HEADER_SIZE);
        out.push(PROTOCOL_VERSION);
        out.extend_from_slice(&self.service.to_be_bytes());
        out.extend_from_slice(&total.to_be_bytes());
        out.extend_from_slice(&self.body);
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 6 {
            return Err(Error::protocol("KNXnet/IP datagram shorter than header"));
        }
        if data[0] != HEADER_SIZE || data[1] != PROTOCOL_VERSION {
            return Err(Error::protocol(format!(
                "bad KNXnet/IP header {:02X} {:02X}",
                data[0], data[1]
            )));
        }
        let service = u16::from_be_bytes([data[2], data[3]]);
        let total = u16::from_be_bytes([data[4], data[5]]) as usize;
        if total != data.len() {
            return Err(Error::protocol(format!(
                "KNXnet/IP length field {total} does not match datagram size {}",
                data.len()
            )));
        }
        Ok(Self {
            service,
            body: data[6..].to_vec(),
        })
    }
}

// ── HPAI ──────────────────────────────────────────────────────────────────────

/// Host protocol address information (IPv4/UDP).
pub fn hpai(addr: SocketAddrV4) -> [u8; 8] {
    let ip = addr.ip().octets();
    let port = addr.port().to_be_bytes();
    [0x08, 0x01, ip[0], ip[1], ip[2], ip[3], port[0], port[1]]
}

/// HPAI with an unbound (route-back) endpoint.
pub fn hpai_any() -> [u8; 8] {
    hpai(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
}

// ── tunnelling bodies ─────────────────────────────────────────────────────────

/// CONNECT_REQUEST for a link-layer tunnel.
pub fn connect_request(control: SocketAddrV4, data: SocketAddrV4) -> Frame {
    let mut body = Vec::with_capacity(20);
    body.extend_from_slice(&hpai(control));
    body.extend_from_slice(&hpai(data));
    // CRI: tunnel connection, link layer
    body.extend_from_slice(&[0x04, 0x04, 0x02, 0x00]);
    Frame::new(CONNECT_REQUEST, body)
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectResponse {
    pub channel: u8,
    pub status: u8,
}

pub fn parse_connect_response(frame: &Frame) -> Result<ConnectResponse> {
    if frame.service != CONNECT_RESPONSE {
        return Err(Error::protocol("expected CONNECT_RESPONSE"));
    }
    if frame.body.len() < 2 {
        return Err(Error::protocol("CONNECT_RESPONSE body too short"));
    }
    Ok(ConnectResponse {
        channel: frame.body[0],
        status: frame.body[1],
    })
}

/// TUNNELING_REQUEST wrapping a cEMI frame.
pub fn tunneling_request(channel: u8, seq: u8, cemi: &[u8]) -> Frame {
    let mut body = Vec::with_capacity(4 + cemi.len());
    body.extend_from_slice(&[0x04, channel, seq, 0x00]);
    body.extend_from_slice(cemi);
    Frame::new(TUNNELING_REQUEST, body)
}

#[derive(Debug, Clone)]
pub struct TunnelingRequest {
    pub channel: u8,
    pub seq: u8,
    pub cemi: Vec<u8>,
}

pub fn parse_tunneling_request(frame: &Frame) -> Result<TunnelingRequest> {
    if frame.body.len() < 4 {
        return Err(Error::protocol("TUNNELING_REQUEST body too short"));
    }
    Ok(TunnelingRequest {
        channel: frame.body[1],
        seq: frame.body[2],
        cemi: frame.body[4..].to_vec(),
    })
}

pub fn tunneling_ack(channel: u8, seq: u8, status: u8) -> Frame {
    Frame::new(TUNNELING_ACK, vec![0x04, channel, seq, status])
}

#[derive(Debug, Clone, Copy)]
pub struct TunnelingAck {
    pub channel: u8,
    pub seq: u8,
    pub status: u8,
}

pub fn parse_tunneling_ack(frame: &Frame) -> Result<TunnelingAck> {
    if frame.body.len() < 4 {
        return Err(Error::protocol("TUNNELING_ACK body too short"));
    }
    Ok(TunnelingAck {
        channel: frame.body[1],
        seq: frame.body[2],
        status: frame.body[3],
    })
}

// ── connection management ─────────────────────────────────────────────────────

pub fn connectionstate_request(channel: u8, control: SocketAddrV4) -> Frame {
    let mut body = Vec::with_capacity(10);
    body.push(channel);
    body.push(0x00);
    body.extend_from_slice(&hpai(control));
    Frame::new(CONNECTIONSTATE_REQUEST, body)
}

pub fn disconnect_request(channel: u8, control: SocketAddrV4) -> Frame {
    let mut body = Vec::with_capacity(10);
    body.push(channel);
    body.push(0x00);
    body.extend_from_slice(&hpai(control));
    Frame::new(DISCONNECT_REQUEST, body)
}

pub fn disconnect_response(channel: u8) -> Frame {
    Frame::new(DISCONNECT_RESPONSE, vec![channel, E_NO_ERROR])
}

/// Channel + status prefix shared by connectionstate/disconnect bodies.
pub fn parse_channel_status(frame: &Frame) -> Result<(u8, u8)> {
    if frame.body.len() < 2 {
        return Err(Error::protocol("body too short for channel/status"));
    }
    Ok((frame.body[0], frame.body[1]))
}

// ── routing ───────────────────────────────────────────────────────────────────

pub fn routing_indication(cemi: &[u8]) -> Frame {
    Frame::new(ROUTING_INDICATION, cemi.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let f = Frame::new(TUNNELING_ACK, vec![0x04, 0x15, 0x02, 0x00]);
        let back = Frame::decode(&f.encode()).unwrap();
        assert_eq!(back, f);
    }

    #[test]
    fn header_validation() {
        assert!(Frame::decode(&[0x06, 0x10, 0x04]).is_err());
        // wrong protocol version
        assert!(Frame::decode(&[0x06, 0x20, 0x02, 0x05, 0x00, 0x06]).is_err());
        // length mismatch
        assert!(Frame::decode(&[0x06, 0x10, 0x02, 0x05, 0x00, 0x08]).is_err());
    }

    #[test]
    fn connect_request_shape() {
        let ep = SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 50), 52011);
        let f = connect_request(ep, ep);
        assert_eq!(f.service, CONNECT_REQUEST);
        assert_eq!(f.body.len(), 20);
        assert_eq!(&f.body[16..], &[0x04, 0x04, 0x02, 0x00]);
        let wire = f.encode();
        assert_eq!(wire.len(), 26);
        assert_eq!(u16::from_be_bytes([wire[4], wire[5]]), 26);
    }

    #[test]
    fn tunneling_round_trip() {
        let cemi = vec![0x29, 0x00, 0xBC, 0xE0, 0, 0, 0x0A, 0x03, 1, 0, 0x81];
        let f = tunneling_request(0x15, 7, &cemi);
        let req = parse_tunneling_request(&Frame::decode(&f.encode()).unwrap()).unwrap();
        assert_eq!(req.channel, 0x15);
        assert_eq!(req.seq, 7);
        assert_eq!(req.cemi, cemi);

        let ack = tunneling_ack(0x15, 7, E_NO_ERROR);
        let parsed = parse_tunneling_ack(&ack).unwrap();
        assert_eq!((parsed.channel, parsed.seq, parsed.status), (0x15, 7, 0));
    }

    #[test]
    fn connect_response_parse() {
        let frame = Frame::new(CONNECT_RESPONSE, vec![0x2A, 0x00, 0x08, 0x01, 0, 0, 0, 0, 0, 0]);
        let resp = parse_connect_response(&frame).unwrap();
        assert_eq!(resp.channel, 0x2A);
        assert_eq!(resp.status, E_NO_ERROR);
    }
}
