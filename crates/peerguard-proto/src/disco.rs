//! Discovery datagram primitives
//!
//! Direct UDP traffic between peers uses two discriminators: a ping is
//! `magic || peer-id`, a STUN packet is recognised by its magic cookie,
//! and everything else is payload.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::secure::SymmAlgo;
use crate::PeerId;

const DEFAULT_MAGIC: &[u8] = b"_ping";

/// Builder/parser for punch-through ping datagrams.
///
/// The magic is configurable but must agree across a deployment; the
/// default is the ASCII `_ping`.
#[derive(Clone)]
pub struct Disco {
    magic: Vec<u8>,
}

impl Default for Disco {
    fn default() -> Self {
        Self {
            magic: DEFAULT_MAGIC.to_vec(),
        }
    }
}

impl Disco {
    pub fn new(magic: Option<Vec<u8>>) -> Self {
        match magic {
            Some(m) if !m.is_empty() => Self { magic: m },
            _ => Self::default(),
        }
    }

    pub fn new_ping(&self, peer_id: &PeerId) -> Vec<u8> {
        let mut b = Vec::with_capacity(self.magic.len() + peer_id.as_bytes().len());
        b.extend_from_slice(&self.magic);
        b.extend_from_slice(peer_id.as_bytes());
        b
    }

    /// Returns the sender's peer id when `b` is a well-formed ping.
    pub fn parse_ping(&self, b: &[u8]) -> Option<PeerId> {
        if b.len() <= self.magic.len() || b.len() > PeerId::MAX_LEN + self.magic.len() {
            return None;
        }
        if !b.starts_with(&self.magic) {
            return None;
        }
        PeerId::try_from(&b[self.magic.len()..]).ok()
    }
}

/// NAT type lattice ordered by precision: `unknown < easy < {hard, upnp,
/// ip4, ip6, internal}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NatType {
    #[default]
    Unknown,
    Easy,
    Hard,
    Upnp,
    Ip4,
    Ip6,
    Internal,
}

impl NatType {
    fn rank(self) -> u8 {
        match self {
            NatType::Unknown => 0,
            NatType::Easy => 1,
            _ => 2,
        }
    }

    /// Replacement rule: a freshly reported type overwrites a stored one
    /// iff it is strictly more precise.
    pub fn accurate_than(self, other: NatType) -> bool {
        self.rank() > other.rank()
    }
}

impl std::fmt::Display for NatType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NatType::Unknown => "unknown",
            NatType::Easy => "easy",
            NatType::Hard => "hard",
            NatType::Upnp => "upnp",
            NatType::Ip4 => "ip4",
            NatType::Ip6 => "ip6",
            NatType::Internal => "internal",
        };
        write!(f, "{}", s)
    }
}

/// A peer's learned public UDP address.
#[derive(Debug, Clone)]
pub struct PeerUdpAddr {
    pub id: PeerId,
    pub addr: SocketAddr,
    pub nat_type: NatType,
}

/// A packet from or to a peer.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub peer_id: PeerId,
    pub data: Vec<u8>,
}

impl Datagram {
    /// Decrypt with the installed hook; a missing hook or a failed
    /// decryption yields the raw bytes.
    pub fn try_decrypt(&self, algo: Option<&dyn SymmAlgo>) -> Vec<u8> {
        let Some(algo) = algo else {
            return self.data.clone();
        };
        match algo.decrypt(&self.data, &self.peer_id.to_string()) {
            Ok(b) => b,
            Err(err) => {
                debug!(peer = %self.peer_id, %err, "datagram decrypt failed");
                self.data.clone()
            }
        }
    }

    /// Encrypt with the installed hook; a missing hook or a failed
    /// encryption yields the raw bytes.
    pub fn try_encrypt(&self, algo: Option<&dyn SymmAlgo>) -> Vec<u8> {
        let Some(algo) = algo else {
            return self.data.clone();
        };
        match algo.encrypt(&self.data, &self.peer_id.to_string()) {
            Ok(b) => b,
            Err(err) => {
                debug!(peer = %self.peer_id, %err, "datagram encrypt failed");
                self.data.clone()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_round_trip() {
        let disco = Disco::default();
        let id: PeerId = "alice".parse().unwrap();
        let ping = disco.new_ping(&id);
        assert_eq!(&ping[..5], b"_ping");
        assert_eq!(disco.parse_ping(&ping), Some(id));
    }

    #[test]
    fn test_ping_rejects_foreign_magic() {
        let disco = Disco::new(Some(b"_hey".to_vec()));
        let id: PeerId = "alice".parse().unwrap();
        assert!(disco.parse_ping(&Disco::default().new_ping(&id)).is_none());
        assert_eq!(disco.parse_ping(&disco.new_ping(&id)), Some(id));
    }

    #[test]
    fn test_ping_length_bounds() {
        let disco = Disco::default();
        assert!(disco.parse_ping(b"_ping").is_none());
        let mut oversized = b"_ping".to_vec();
        oversized.extend_from_slice(&[b'x'; 256]);
        assert!(disco.parse_ping(&oversized).is_none());
    }

    #[test]
    fn test_nat_type_replacement() {
        assert!(NatType::Easy.accurate_than(NatType::Unknown));
        assert!(NatType::Hard.accurate_than(NatType::Easy));
        assert!(NatType::Ip6.accurate_than(NatType::Unknown));
        assert!(!NatType::Unknown.accurate_than(NatType::Easy));
        assert!(!NatType::Upnp.accurate_than(NatType::Hard));
        assert!(!NatType::Hard.accurate_than(NatType::Hard));
    }
}
