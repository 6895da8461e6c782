//! Control frame codec
//!
//! Every binary frame on the peermap wire carries:
//!
//! ```text
//! byte 0       control code
//! byte 1       address length N (1..=255)
//! bytes 2..2+N address (a peer id)
//! bytes 2+N..  payload
//! ```
//!
//! After assembly the whole sequence is XORed with the session's one-byte
//! nonce. The obfuscation is a framing sentinel against payload-rewriting
//! middleboxes, not encryption.

use crate::error::{ProtoError, ProtoResult};
use crate::PeerId;

/// Control codes of the peermap wire, a closed set.
///
/// `NewPeer` doubles as the peer-to-peer sub-protocol's pre-NAT-traversal
/// trigger: introductions carry a metadata query as payload, traversal
/// triggers carry the JSON STUN server list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlCode {
    /// Payload forwarded verbatim to the addressed peer
    Relay = 0,
    /// Introduction of a peer, or a brokered NAT-traversal trigger
    NewPeer = 1,
    /// A peer reports its own learned public UDP address
    NewPeerUdpAddr = 2,
    /// Ask the server to introduce the sender to the addressed peer
    LeadDisco = 3,
    /// Fresh network secret pushed by the server (payload = JSON blob)
    UpdateNetworkSecret = 20,
    /// Bytes of the in-band stream multiplexed over the session
    ControlConn = 30,
}

impl ControlCode {
    /// Discovery-class frames draw from the dedicated discovery limiter so
    /// control-plane traffic keeps flowing under data backpressure.
    pub fn is_discovery(self) -> bool {
        matches!(self, ControlCode::LeadDisco | ControlCode::NewPeerUdpAddr)
    }
}

impl TryFrom<u8> for ControlCode {
    type Error = ProtoError;

    fn try_from(b: u8) -> Result<Self, Self::Error> {
        match b {
            0 => Ok(ControlCode::Relay),
            1 => Ok(ControlCode::NewPeer),
            2 => Ok(ControlCode::NewPeerUdpAddr),
            3 => Ok(ControlCode::LeadDisco),
            20 => Ok(ControlCode::UpdateNetworkSecret),
            30 => Ok(ControlCode::ControlConn),
            other => Err(ProtoError::UnknownControlCode(other)),
        }
    }
}

impl std::fmt::Display for ControlCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ControlCode::Relay => "RELAY",
            ControlCode::NewPeer => "NEW_PEER",
            ControlCode::NewPeerUdpAddr => "NEW_PEER_UDP_ADDR",
            ControlCode::LeadDisco => "LEAD_DISCO",
            ControlCode::UpdateNetworkSecret => "UPDATE_NETWORK_SECRET",
            ControlCode::ControlConn => "CONTROL_CONN",
        };
        write!(f, "{}", name)
    }
}

/// A decoded control frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub code: ControlCode,
    pub addr: PeerId,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(code: ControlCode, addr: PeerId, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            code,
            addr,
            payload: payload.into(),
        }
    }

    /// Assemble the frame bytes. The caller applies the nonce afterwards.
    pub fn encode(&self) -> Vec<u8> {
        let mut b = Vec::with_capacity(2 + self.addr.as_bytes().len() + self.payload.len());
        b.push(self.code as u8);
        b.push(self.addr.len_byte());
        b.extend_from_slice(self.addr.as_bytes());
        b.extend_from_slice(&self.payload);
        b
    }

    /// Parse frame bytes after the nonce has been inverted.
    pub fn decode(b: &[u8]) -> ProtoResult<Self> {
        if b.len() < 2 {
            return Err(ProtoError::MalformedFrame(format!(
                "frame of {} bytes has no header",
                b.len()
            )));
        }
        let code = ControlCode::try_from(b[0])?;
        let addr_len = b[1] as usize;
        if addr_len == 0 || b.len() < 2 + addr_len {
            return Err(ProtoError::MalformedFrame(format!(
                "frame of {} bytes advertises a {}-byte address",
                b.len(),
                addr_len
            )));
        }
        let addr = PeerId::try_from(&b[2..2 + addr_len])?;
        Ok(Self {
            code,
            addr,
            payload: b[2 + addr_len..].to_vec(),
        })
    }
}

/// XOR every byte with the session nonce. Applying it twice restores the
/// original, so encode and decode share this one helper.
pub fn xor_nonce(b: &mut [u8], nonce: u8) {
    for v in b.iter_mut() {
        *v ^= nonce;
    }
}
