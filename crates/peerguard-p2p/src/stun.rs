//! STUN binding codec (RFC 5389)
//!
//! Only what NAT traversal needs: building binding requests, recognising
//! STUN packets among mixed UDP traffic, and extracting the mapped address
//! from responses.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use rand::RngCore;

use crate::error::{P2pError, P2pResult};

const MAGIC_COOKIE: u32 = 0x2112A442;

const BINDING_REQUEST: u16 = 0x0001;
const BINDING_RESPONSE: u16 = 0x0101;
const BINDING_ERROR: u16 = 0x0111;

const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

/// 96-bit transaction id correlating requests with responses.
pub type TxId = [u8; 12];

pub fn new_tx_id() -> TxId {
    let mut id = [0u8; 12];
    rand::rngs::OsRng.fill_bytes(&mut id);
    id
}

/// Build a binding request carrying `tx_id`.
pub fn request(tx_id: &TxId) -> Vec<u8> {
    let mut packet = Vec::with_capacity(20);
    packet.extend_from_slice(&BINDING_REQUEST.to_be_bytes());
    packet.extend_from_slice(&0u16.to_be_bytes());
    packet.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    packet.extend_from_slice(tx_id);
    packet
}

/// Whether a datagram is STUN, judged by length and the magic cookie.
pub fn is(b: &[u8]) -> bool {
    b.len() >= 20 && u32::from_be_bytes([b[4], b[5], b[6], b[7]]) == MAGIC_COOKIE
}

/// Parse a binding response into its transaction id and mapped address.
pub fn parse_response(b: &[u8]) -> P2pResult<(TxId, SocketAddr)> {
    if b.len() < 20 {
        return Err(P2pError::Stun("response too short".into()));
    }
    let msg_type = u16::from_be_bytes([b[0], b[1]]);
    let msg_len = u16::from_be_bytes([b[2], b[3]]) as usize;
    if !is(b) {
        return Err(P2pError::Stun("missing magic cookie".into()));
    }
    let mut tx_id = [0u8; 12];
    tx_id.copy_from_slice(&b[8..20]);

    if msg_type == BINDING_ERROR {
        return Err(P2pError::Stun("binding error response".into()));
    }
    if msg_type != BINDING_RESPONSE {
        return Err(P2pError::Stun(format!(
            "unexpected message type 0x{:04x}",
            msg_type
        )));
    }
    if b.len() < 20 + msg_len {
        return Err(P2pError::Stun("truncated message".into()));
    }

    let mut mapped: Option<SocketAddr> = None;
    let mut pos = 20;
    while pos + 4 <= 20 + msg_len {
        let attr_type = u16::from_be_bytes([b[pos], b[pos + 1]]);
        let attr_len = u16::from_be_bytes([b[pos + 2], b[pos + 3]]) as usize;
        pos += 4;
        if pos + attr_len > b.len() {
            break;
        }
        let attr = &b[pos..pos + attr_len];
        match attr_type {
            ATTR_XOR_MAPPED_ADDRESS => {
                if let Some(addr) = parse_address(attr, true, &tx_id) {
                    mapped = Some(addr);
                }
            }
            ATTR_MAPPED_ADDRESS => {
                if mapped.is_none() {
                    mapped = parse_address(attr, false, &tx_id);
                }
            }
            _ => {}
        }
        // attributes are 4-byte aligned
        pos += (attr_len + 3) & !3;
    }

    let addr = mapped.ok_or_else(|| P2pError::Stun("no mapped address attribute".into()))?;
    Ok((tx_id, addr))
}

fn parse_address(attr: &[u8], xor: bool, tx_id: &TxId) -> Option<SocketAddr> {
    if attr.len() < 8 {
        return None;
    }
    let family = attr[1];
    let mut port = u16::from_be_bytes([attr[2], attr[3]]);
    let cookie = MAGIC_COOKIE.to_be_bytes();
    if xor {
        port ^= u16::from_be_bytes([cookie[0], cookie[1]]);
    }
    match family {
        0x01 => {
            let mut ip = [attr[4], attr[5], attr[6], attr[7]];
            if xor {
                for (b, c) in ip.iter_mut().zip(cookie) {
                    *b ^= c;
                }
            }
            Some(SocketAddr::new(Ipv4Addr::from(ip).into(), port))
        }
        0x02 => {
            if attr.len() < 20 {
                return None;
            }
            let mut ip = [0u8; 16];
            ip.copy_from_slice(&attr[4..20]);
            if xor {
                // the v6 fold covers cookie plus transaction id
                for (b, k) in ip.iter_mut().zip(cookie.iter().chain(tx_id.iter())) {
                    *b ^= k;
                }
            }
            Some(SocketAddr::new(Ipv6Addr::from(ip).into(), port))
        }
        _ => None,
    }
}

/// Build a binding response for tests and local STUN stand-ins.
pub fn response(tx_id: &TxId, mapped: SocketAddr) -> Vec<u8> {
    let cookie = MAGIC_COOKIE.to_be_bytes();
    let mut attr = Vec::new();
    match mapped {
        SocketAddr::V4(v4) => {
            attr.push(0);
            attr.push(0x01);
            let port = v4.port() ^ u16::from_be_bytes([cookie[0], cookie[1]]);
            attr.extend_from_slice(&port.to_be_bytes());
            for (b, c) in v4.ip().octets().iter().zip(cookie) {
                attr.push(b ^ c);
            }
        }
        SocketAddr::V6(v6) => {
            attr.push(0);
            attr.push(0x02);
            let port = v6.port() ^ u16::from_be_bytes([cookie[0], cookie[1]]);
            attr.extend_from_slice(&port.to_be_bytes());
            for (b, k) in v6
                .ip()
                .octets()
                .iter()
                .zip(cookie.iter().chain(tx_id.iter()))
            {
                attr.push(b ^ k);
            }
        }
    }
    let mut packet = Vec::with_capacity(20 + 4 + attr.len());
    packet.extend_from_slice(&BINDING_RESPONSE.to_be_bytes());
    packet.extend_from_slice(&((4 + attr.len()) as u16).to_be_bytes());
    packet.extend_from_slice(&cookie);
    packet.extend_from_slice(tx_id);
    packet.extend_from_slice(&ATTR_XOR_MAPPED_ADDRESS.to_be_bytes());
    packet.extend_from_slice(&(attr.len() as u16).to_be_bytes());
    packet.extend_from_slice(&attr);
    packet
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_layout() {
        let tx_id = [7u8; 12];
        let req = request(&tx_id);
        assert_eq!(req.len(), 20);
        assert_eq!(&req[0..2], &[0x00, 0x01]);
        assert_eq!(&req[4..8], &MAGIC_COOKIE.to_be_bytes());
        assert_eq!(&req[8..20], &tx_id);
        assert!(is(&req));
    }

    #[test]
    fn test_response_round_trip_v4() {
        let tx_id = new_tx_id();
        let mapped: SocketAddr = "203.0.113.9:4242".parse().unwrap();
        let resp = response(&tx_id, mapped);
        assert!(is(&resp));
        let (got_tx, got_addr) = parse_response(&resp).unwrap();
        assert_eq!(got_tx, tx_id);
        assert_eq!(got_addr, mapped);
    }

    #[test]
    fn test_response_round_trip_v6() {
        let tx_id = new_tx_id();
        let mapped: SocketAddr = "[2001:db8::7]:4242".parse().unwrap();
        let (got_tx, got_addr) = parse_response(&response(&tx_id, mapped)).unwrap();
        assert_eq!(got_tx, tx_id);
        assert_eq!(got_addr, mapped);
    }

    #[test]
    fn test_non_stun_rejected() {
        assert!(!is(b"_pingalice"));
        assert!(parse_response(b"_pingalice").is_err());
    }
}
